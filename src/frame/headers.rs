use std::fmt;

use bytes::{Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request, StatusCode, Uri};

use crate::frame::{Error, Head, Kind, StreamId, util};
use crate::hpack::{self, HeaderSink};

/// Header frame
///
/// Looks like:
///
/// ```text
/// +---------------+
/// |Pad Length? (8)|
/// +-+-------------+-----------------------------------------------+
/// |E|                 Stream Dependency? (31)                     |
/// +-+-------------+-----------------------------------------------+
/// |  Weight? (8)  |
/// +-+-------------+-----------------------------------------------+
/// |                   Header Block Fragment (*)                 ...
/// +---------------------------------------------------------------+
/// |                           Padding (*)                       ...
/// +---------------------------------------------------------------+
/// ```
#[derive(Eq, PartialEq)]
pub struct Headers {
    /// The ID of the stream with which this frame is associated.
    stream_id: StreamId,

    /// The header block fragment
    fields: HeaderMap,

    /// The associated pseudo header block
    pseudo: Pseudo,

    /// The associated flags
    flags: HeadersFlag,
}

#[derive(Copy, Clone, Eq, PartialEq)]
pub struct HeadersFlag(u8);

#[derive(Eq, PartialEq)]
pub struct PushPromise {
    /// The ID of the stream with which this frame is associated.
    stream_id: StreamId,

    /// The ID of the stream being reserved by this PushPromise.
    promised_id: StreamId,

    /// The header fields
    fields: HeaderMap,

    /// The associated pseudo header block
    pseudo: Pseudo,
}

/// Pseudo header fields for a request or response.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct Pseudo {
    // Request
    pub method: Option<Method>,
    pub scheme: Option<Bytes>,
    pub authority: Option<Bytes>,
    pub path: Option<Bytes>,

    // Response
    pub status: Option<StatusCode>,
}

/// Assembles the decoded fields of one header block.
///
/// This is the `HeaderSink` handed to the HPACK decoder while a request
/// header block (HEADERS + CONTINUATIONs) is being read. Malformed blocks are
/// flagged rather than surfaced mid-decode so that the whole block still
/// passes through the decoder and the compression state stays consistent.
#[derive(Debug, Default)]
pub struct HeaderBlock {
    fields: HeaderMap,
    pseudo: Pseudo,

    /// Set when a decoded field violates the header block rules. The block
    /// keeps decoding; the error is raised when the block completes.
    is_malformed: bool,

    /// Set when the accumulated size passed the configured limit.
    is_over_size: bool,

    /// Cumulative decoded size, counted as per RFC 7540 section 6.5.2:
    /// name length + value length + 32 per field.
    size: usize,

    /// The configured SETTINGS_MAX_HEADER_LIST_SIZE.
    max_size: usize,
}

const END_STREAM: u8 = 0x1;
const END_HEADERS: u8 = 0x4;
const PADDED: u8 = 0x8;
const PRIORITY: u8 = 0x20;
const ALL: u8 = END_STREAM | END_HEADERS | PADDED | PRIORITY;

// ===== impl Headers =====

impl Headers {
    /// Create a new HEADERS frame carrying a response head.
    pub fn new(stream_id: StreamId, pseudo: Pseudo, fields: HeaderMap) -> Self {
        Headers {
            stream_id,
            fields,
            pseudo,
            flags: HeadersFlag::default(),
        }
    }

    pub fn set_end_stream(&mut self) {
        self.flags.set_end_stream()
    }

    /// Encode the response head as a HEADERS frame followed by as many
    /// CONTINUATION frames as the encoder needs.
    ///
    /// `max_frame_size` caps each frame's payload; END_HEADERS is set on the
    /// last frame of the sequence, END_STREAM (if set) on the first.
    pub fn encode(
        &self,
        encoder: &mut dyn hpack::Encoder,
        max_frame_size: usize,
        dst: &mut BytesMut,
    ) {
        let mut fields = self.pseudo.fields().into_iter().chain(fields_iter(&self.fields));
        encode_header_block(
            encoder,
            Kind::Headers,
            self.stream_id,
            self.flags.0 & END_STREAM,
            &[],
            &mut fields,
            max_frame_size,
            dst,
        );
    }
}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("Headers");
        builder
            .field("stream_id", &self.stream_id)
            .field("flags", &self.flags);

        if let Some(ref status) = self.pseudo.status {
            builder.field("status", status);
        }

        // `fields` purposefully excluded
        builder.finish()
    }
}

// ===== impl PushPromise =====

impl PushPromise {
    pub fn new(stream_id: StreamId, promised_id: StreamId, pseudo: Pseudo, fields: HeaderMap) -> Self {
        PushPromise {
            stream_id,
            promised_id,
            fields,
            pseudo,
        }
    }

    /// Encode as a PUSH_PROMISE frame plus CONTINUATIONs as needed.
    pub fn encode(
        &self,
        encoder: &mut dyn hpack::Encoder,
        max_frame_size: usize,
        dst: &mut BytesMut,
    ) {
        let promised: u32 = self.promised_id.into();
        let mut fields = self.pseudo.fields().into_iter().chain(fields_iter(&self.fields));
        encode_header_block(
            encoder,
            Kind::PushPromise,
            self.stream_id,
            0,
            &promised.to_be_bytes(),
            &mut fields,
            max_frame_size,
            dst,
        );
    }
}

impl fmt::Debug for PushPromise {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PushPromise")
            .field("stream_id", &self.stream_id)
            .field("promised_id", &self.promised_id)
            .finish()
    }
}

/// Shared HEADERS / PUSH_PROMISE chunked encode.
///
/// The first frame of the sequence carries `prefix` (the promised stream id
/// for PUSH_PROMISE) ahead of the header block fragment. The sequence is
/// written into `dst` whole, so writing `dst` as one unit keeps the block
/// free of interleaved frames.
#[allow(clippy::too_many_arguments)]
fn encode_header_block(
    encoder: &mut dyn hpack::Encoder,
    first_kind: Kind,
    stream_id: StreamId,
    first_flags: u8,
    prefix: &[u8],
    fields: &mut dyn Iterator<Item = hpack::Field>,
    max_frame_size: usize,
    dst: &mut BytesMut,
) {
    let mut first = true;

    loop {
        let limit = if first {
            max_frame_size - prefix.len()
        } else {
            max_frame_size
        };

        let mut fragment = BytesMut::with_capacity(limit.min(4096));
        let state = encoder.encode(fields, &mut fragment, limit);
        let end_of_block = state == hpack::Encode::Complete;

        let kind = if first { first_kind } else { Kind::Continuation };
        let mut flags = if first { first_flags } else { 0 };
        if end_of_block {
            flags |= END_HEADERS;
        }

        tracing::trace!(
            "encoding {:?}; id={:?} end_of_block={}",
            kind,
            stream_id,
            end_of_block
        );

        let head = Head::new(kind, flags, stream_id);
        if first {
            head.encode(prefix.len() + fragment.len(), dst);
            dst.extend_from_slice(prefix);
        } else {
            head.encode(fragment.len(), dst);
        }
        dst.extend_from_slice(&fragment);

        first = false;
        if end_of_block {
            return;
        }
    }
}

fn fields_iter(fields: &HeaderMap) -> Vec<hpack::Field> {
    let mut out = Vec::with_capacity(fields.len());
    for (name, value) in fields {
        out.push(hpack::Field {
            name: Bytes::copy_from_slice(name.as_str().as_bytes()),
            value: Bytes::copy_from_slice(value.as_bytes()),
        });
    }
    out
}

// ===== impl Pseudo =====

impl Pseudo {
    pub fn response(status: StatusCode) -> Self {
        Pseudo {
            status: Some(status),
            ..Pseudo::default()
        }
    }

    pub fn request(method: Method, uri: &Uri) -> Self {
        Pseudo {
            method: Some(method),
            scheme: uri
                .scheme()
                .map(|s| Bytes::copy_from_slice(s.as_str().as_bytes())),
            authority: uri
                .authority()
                .map(|a| Bytes::copy_from_slice(a.as_str().as_bytes())),
            path: uri
                .path_and_query()
                .map(|p| Bytes::copy_from_slice(p.as_str().as_bytes())),
            status: None,
        }
    }

    /// The pseudo fields, in serialization order, ahead of the regular
    /// fields.
    fn fields(&self) -> Vec<hpack::Field> {
        let mut out = Vec::new();

        let mut push = |name: &'static [u8], value: Bytes| {
            out.push(hpack::Field {
                name: Bytes::from_static(name),
                value,
            })
        };

        if let Some(ref method) = self.method {
            push(b":method", Bytes::copy_from_slice(method.as_str().as_bytes()));
        }
        if let Some(ref scheme) = self.scheme {
            push(b":scheme", scheme.clone());
        }
        if let Some(ref authority) = self.authority {
            push(b":authority", authority.clone());
        }
        if let Some(ref path) = self.path {
            push(b":path", path.clone());
        }
        if let Some(status) = self.status {
            push(b":status", Bytes::copy_from_slice(status.as_str().as_bytes()));
        }

        out
    }
}

// ===== impl HeaderBlock =====

impl HeaderBlock {
    pub fn new(max_size: usize) -> Self {
        HeaderBlock {
            max_size,
            ..HeaderBlock::default()
        }
    }

    /// Build the request head this block described.
    pub fn into_request(self) -> Result<Request<()>, Error> {
        if self.is_malformed {
            return Err(Error::MalformedMessage);
        }

        if self.is_over_size {
            return Err(Error::HeaderListTooLarge);
        }

        let pseudo = self.pseudo;

        let method = pseudo.method.clone().ok_or(Error::MalformedMessage)?;

        let parts = uri_parts(&method, &pseudo)?;
        let uri = Uri::from_parts(parts).map_err(|_| Error::MalformedMessage)?;

        let mut request = Request::new(());
        *request.method_mut() = method;
        *request.uri_mut() = uri;
        *request.version_mut() = http::Version::HTTP_2;
        *request.headers_mut() = self.fields;

        Ok(request)
    }

    fn pseudo_header(&mut self, name: &[u8], value: Bytes) {
        // Pseudo headers must not appear after regular fields, and must not
        // repeat.
        if !self.fields.is_empty() {
            tracing::debug!("malformed header block -- pseudo header after fields");
            self.is_malformed = true;
            return;
        }

        let repeated = match name {
            b":method" => {
                let repeated = self.pseudo.method.is_some();
                if !repeated {
                    match Method::from_bytes(&value) {
                        Ok(method) => self.pseudo.method = Some(method),
                        Err(_) => {
                            tracing::debug!("malformed header block -- invalid :method");
                            self.is_malformed = true;
                            return;
                        }
                    }
                }
                repeated
            }
            b":scheme" => self.pseudo.scheme.replace(value).is_some(),
            b":authority" => self.pseudo.authority.replace(value).is_some(),
            b":path" => self.pseudo.path.replace(value).is_some(),
            _ => {
                tracing::debug!("malformed header block -- unknown pseudo header");
                self.is_malformed = true;
                return;
            }
        };

        if repeated {
            tracing::debug!("malformed header block -- repeated pseudo header");
            self.is_malformed = true;
        }
    }

    fn regular_header(&mut self, name: Bytes, value: Bytes) {
        let Ok(name) = HeaderName::from_bytes(&name) else {
            tracing::debug!("malformed header block -- invalid field name");
            self.is_malformed = true;
            return;
        };

        // Connection-specific headers must not appear in an HTTP/2 message
        // (RFC 7540 section 8.1.2.2).
        match name {
            header::CONNECTION
            | header::TRANSFER_ENCODING
            | header::UPGRADE
            | header::PROXY_AUTHENTICATE => {
                tracing::debug!("malformed header block -- connection-specific field");
                self.is_malformed = true;
                return;
            }
            header::TE if value != "trailers" => {
                tracing::debug!("malformed header block -- TE != trailers");
                self.is_malformed = true;
                return;
            }
            _ => {}
        }

        let Ok(value) = HeaderValue::from_maybe_shared(value) else {
            tracing::debug!("malformed header block -- invalid field value");
            self.is_malformed = true;
            return;
        };

        self.fields.append(name, value);
    }
}

impl HeaderSink for HeaderBlock {
    fn header(&mut self, name: Bytes, value: Bytes) {
        // A field counts against MAX_HEADER_LIST_SIZE whether it is kept or
        // not; once the block is over size, remaining fields are dropped but
        // still decoded.
        self.size += name.len() + value.len() + 32;
        if self.size > self.max_size {
            if !self.is_over_size {
                tracing::debug!("header block over size; max={}", self.max_size);
            }
            self.is_over_size = true;
            return;
        }

        if name.starts_with(b":") {
            self.pseudo_header(&name, value);
        } else {
            self.regular_header(name, value);
        }
    }
}

fn uri_parts(method: &Method, pseudo: &Pseudo) -> Result<http::uri::Parts, Error> {
    let mut parts = http::uri::Parts::default();

    // In CONNECT requests the :authority pseudo field carries the target and
    // :scheme / :path are absent. Everything else requires both.
    if *method == Method::CONNECT {
        let authority = pseudo.authority.as_ref().ok_or(Error::MalformedMessage)?;
        parts.authority = Some(
            http::uri::Authority::from_maybe_shared(authority.clone())
                .map_err(|_| Error::MalformedMessage)?,
        );
        return Ok(parts);
    }

    let scheme = pseudo.scheme.as_ref().ok_or(Error::MalformedMessage)?;
    let path = pseudo.path.as_ref().ok_or(Error::MalformedMessage)?;

    if path.is_empty() {
        return Err(Error::MalformedMessage);
    }

    parts.scheme = Some(
        http::uri::Scheme::try_from(&scheme[..]).map_err(|_| Error::MalformedMessage)?,
    );
    parts.path_and_query = Some(
        http::uri::PathAndQuery::from_maybe_shared(path.clone())
            .map_err(|_| Error::MalformedMessage)?,
    );

    if let Some(authority) = pseudo.authority.as_ref() {
        parts.authority = Some(
            http::uri::Authority::from_maybe_shared(authority.clone())
                .map_err(|_| Error::MalformedMessage)?,
        );
    }

    Ok(parts)
}

// ===== impl HeadersFlag =====

impl HeadersFlag {
    pub fn load(bits: u8) -> HeadersFlag {
        HeadersFlag(bits & ALL)
    }

    pub fn is_end_stream(&self) -> bool {
        self.0 & END_STREAM == END_STREAM
    }

    pub fn set_end_stream(&mut self) {
        self.0 |= END_STREAM;
    }

    pub fn is_end_headers(&self) -> bool {
        self.0 & END_HEADERS == END_HEADERS
    }

    pub fn is_padded(&self) -> bool {
        self.0 & PADDED == PADDED
    }

    pub fn is_priority(&self) -> bool {
        self.0 & PRIORITY == PRIORITY
    }
}

impl Default for HeadersFlag {
    /// Returns a `HeadersFlag` value with `END_HEADERS` set.
    fn default() -> Self {
        HeadersFlag(END_HEADERS)
    }
}

impl From<HeadersFlag> for u8 {
    fn from(src: HeadersFlag) -> u8 {
        src.0
    }
}

impl fmt::Debug for HeadersFlag {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        util::debug_flags(fmt, self.0)
            .flag_if(self.is_end_headers(), "END_HEADERS")
            .flag_if(self.is_end_stream(), "END_STREAM")
            .flag_if(self.is_padded(), "PADDED")
            .flag_if(self.is_priority(), "PRIORITY")
            .finish()
    }
}

/// Strip the optional pad length and priority fields from the front of a
/// HEADERS payload, leaving only the header block fragment.
///
/// Returns the padding length (if the frame was padded) and the priority
/// fields (if present).
pub fn strip_headers_payload(
    flags: HeadersFlag,
    payload: &mut BytesMut,
) -> Result<(Option<u8>, Option<crate::frame::StreamDependency>), Error> {
    let pad_len = if flags.is_padded() {
        Some(util::strip_padding(payload)?)
    } else {
        None
    };

    let dependency = if flags.is_priority() {
        if payload.len() < 5 {
            return Err(Error::InvalidPayloadLength);
        }
        let dep = crate::frame::StreamDependency::load(&payload[..5])?;
        let _ = payload.split_to(5);
        Some(dep)
    } else {
        None
    };

    Ok((pad_len, dependency))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hpack::LiteralCodec;

    #[test]
    fn response_continuation_chunking() {
        let mut encoder = LiteralCodec::new();
        let mut fields = HeaderMap::new();
        fields.insert("content-type", HeaderValue::from_static("text/plain"));
        fields.insert(
            "x-filler",
            HeaderValue::from_bytes(&[b'a'; 64]).unwrap(),
        );

        let headers = Headers::new(
            StreamId::from(1),
            Pseudo::response(StatusCode::OK),
            fields,
        );

        let mut dst = BytesMut::new();
        // A tiny max frame size forces CONTINUATION frames.
        headers.encode(&mut encoder, 32, &mut dst);

        let (len, head) = Head::parse(&dst[..9]);
        assert_eq!(head.kind(), Kind::Headers);
        assert!(len <= 32);
        let flags = HeadersFlag::load(head.flag());
        assert!(!flags.is_end_headers());

        // Walk the remaining frames; all must be CONTINUATION, the last one
        // carrying END_HEADERS.
        let mut at = 9 + len as usize;
        let mut saw_end = false;
        while at < dst.len() {
            let (len, head) = Head::parse(&dst[at..at + 9]);
            assert_eq!(head.kind(), Kind::Continuation);
            assert!(len <= 32);
            assert!(!saw_end);
            saw_end = HeadersFlag::load(head.flag()).is_end_headers();
            at += 9 + len as usize;
        }
        assert!(saw_end);
        assert_eq!(at, dst.len());
    }

    #[test]
    fn block_into_request() {
        let mut block = HeaderBlock::new(16_384);
        block.header(Bytes::from_static(b":method"), Bytes::from_static(b"GET"));
        block.header(Bytes::from_static(b":scheme"), Bytes::from_static(b"https"));
        block.header(Bytes::from_static(b":authority"), Bytes::from_static(b"h"));
        block.header(Bytes::from_static(b":path"), Bytes::from_static(b"/"));
        block.header(Bytes::from_static(b"accept"), Bytes::from_static(b"*/*"));

        let request = block.into_request().unwrap();
        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.uri().path(), "/");
        assert_eq!(request.uri().authority().unwrap().as_str(), "h");
        assert_eq!(request.headers()["accept"], "*/*");
    }

    #[test]
    fn pseudo_after_regular_is_malformed() {
        let mut block = HeaderBlock::new(16_384);
        block.header(Bytes::from_static(b":method"), Bytes::from_static(b"GET"));
        block.header(Bytes::from_static(b"accept"), Bytes::from_static(b"*/*"));
        block.header(Bytes::from_static(b":path"), Bytes::from_static(b"/"));

        assert!(matches!(
            block.into_request(),
            Err(Error::MalformedMessage)
        ));
    }

    #[test]
    fn connection_specific_field_is_malformed() {
        let mut block = HeaderBlock::new(16_384);
        block.header(Bytes::from_static(b":method"), Bytes::from_static(b"GET"));
        block.header(Bytes::from_static(b":scheme"), Bytes::from_static(b"https"));
        block.header(Bytes::from_static(b":path"), Bytes::from_static(b"/"));
        block.header(
            Bytes::from_static(b"connection"),
            Bytes::from_static(b"keep-alive"),
        );

        assert!(matches!(
            block.into_request(),
            Err(Error::MalformedMessage)
        ));
    }

    #[test]
    fn over_size_block() {
        let mut block = HeaderBlock::new(64);
        block.header(Bytes::from_static(b":method"), Bytes::from_static(b"GET"));
        block.header(
            Bytes::copy_from_slice(&[b'x'; 32]),
            Bytes::copy_from_slice(&[b'y'; 64]),
        );

        assert!(matches!(
            block.into_request(),
            Err(Error::HeaderListTooLarge)
        ));
    }
}
