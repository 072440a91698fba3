use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{HeaderValue, Request, Response, StatusCode, header};

use crate::codec::{WriteHandle, WriteJob};
use crate::error::UserError;
use crate::frame::{self, Pseudo, Reason, StreamId};
use crate::proto::{Key, Streams};

/// The application entry point: invoked by the dispatcher for every
/// completed request head, on a worker task.
pub(crate) type Handler =
    Arc<dyn Fn(Request<RecvBody>, Responder) -> BoxFuture<'static, ()> + Send + Sync>;

/// Receives the request body.
pub struct RecvBody {
    streams: Streams,
    key: Key,
    id: StreamId,
    write: WriteHandle,
}

/// Sends the response for one stream.
///
/// Dropping a `Responder` without responding resets the stream with
/// CANCEL.
pub struct Responder {
    streams: Streams,
    key: Key,
    id: StreamId,
    write: WriteHandle,
    responded: bool,
}

/// Sends the response body.
///
/// Dropping a `SendBody` before the end of the stream resets it with
/// CANCEL.
pub struct SendBody {
    streams: Streams,
    key: Key,
    id: StreamId,
    write: WriteHandle,
    done: bool,
}

// ===== impl RecvBody =====

impl RecvBody {
    pub(crate) fn new(streams: Streams, key: Key, id: StreamId, write: WriteHandle) -> RecvBody {
        RecvBody {
            streams,
            key,
            id,
            write,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.id.into()
    }

    /// The next chunk of the request body, or `None` at the end of the
    /// stream.
    ///
    /// Consuming a chunk hands the equivalent flow-control credit back to
    /// the peer, on the stream and on the connection.
    pub async fn data(&mut self) -> Option<Result<Bytes, crate::Error>> {
        match self.streams.read_data(self.key, self.id).await {
            Ok(Some((data, credit))) => {
                if !credit.is_empty() {
                    if let Err(err) = self.write.send(WriteJob::Frames(credit)).await {
                        return Some(Err(err.into()));
                    }
                }
                Some(Ok(data))
            }
            Ok(None) => None,
            Err(err) => Some(Err(err.into())),
        }
    }
}

impl fmt::Debug for RecvBody {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RecvBody").field("id", &self.id).finish()
    }
}

// ===== impl Responder =====

impl Responder {
    pub(crate) fn new(streams: Streams, key: Key, id: StreamId, write: WriteHandle) -> Responder {
        Responder {
            streams,
            key,
            id,
            write,
            responded: false,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.id.into()
    }

    /// Send the response head. `end_of_stream` marks a bodiless response;
    /// otherwise the returned [`SendBody`] carries the body.
    pub async fn send_response(
        mut self,
        response: Response<()>,
        end_of_stream: bool,
    ) -> Result<SendBody, crate::Error> {
        let (parts, ()) = response.into_parts();
        let status = parts.status;
        let mut fields = parts.headers;

        if !fields.contains_key(header::DATE) {
            let date = httpdate::fmt_http_date(std::time::SystemTime::now());
            if let Ok(value) = HeaderValue::from_str(&date) {
                fields.insert(header::DATE, value);
            }
        }

        // Entity headers make no sense on a bodiless status.
        if !status_allows_body(status) {
            fields.remove(header::CONTENT_TYPE);
            fields.remove(header::CONTENT_LANGUAGE);
            fields.remove(header::CONTENT_LENGTH);
        }

        self.streams
            .send_response(self.key, self.id, end_of_stream)?;
        self.responded = true;

        let mut headers = frame::Headers::new(self.id, Pseudo::response(status), fields);
        if end_of_stream {
            headers.set_end_stream();
        }

        // One job: the HEADERS + CONTINUATION sequence cannot interleave
        // with frames from other streams.
        self.write.send(WriteJob::Headers(headers)).await?;
        self.flush_refund().await?;

        Ok(SendBody {
            streams: self.streams.clone(),
            key: self.key,
            id: self.id,
            write: self.write.clone(),
            done: end_of_stream,
        })
    }

    /// Promise a pushed response on a new even stream, returning its
    /// responder.
    ///
    /// The request must carry a scheme and an authority (RFC 7540 section
    /// 8.2), and the peer must not have disabled push.
    pub async fn push_request(&mut self, request: Request<()>) -> Result<Responder, crate::Error> {
        let (parts, ()) = request.into_parts();

        if parts.uri.scheme().is_none() || parts.uri.authority().is_none() {
            return Err(UserError::MalformedHeaders.into());
        }

        let (promised_id, key) = self.streams.reserve_push(self.key, self.id)?;

        let pseudo = Pseudo::request(parts.method, &parts.uri);
        let push = frame::PushPromise::new(self.id, promised_id, pseudo, parts.headers);
        self.write.send(WriteJob::PushPromise(push)).await?;

        Ok(Responder::new(
            self.streams.clone(),
            key,
            promised_id,
            self.write.clone(),
        ))
    }

    /// Abort the stream without a response.
    pub async fn send_reset(mut self, reason: Reason) {
        self.responded = true;
        let frames = self.streams.reset_stream_frames(self.id, reason);
        let _ = self.write.send(WriteJob::Frames(frames)).await;
    }

    async fn flush_refund(&self) -> Result<(), crate::Error> {
        if let Some(refund) = self.streams.take_refund() {
            self.write.send(WriteJob::Frame(refund.into())).await?;
        }
        Ok(())
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if self.responded {
            return;
        }

        let frames = self.streams.reset_stream_frames(self.id, Reason::CANCEL);
        let _ = self.write.try_send(WriteJob::Frames(frames));
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Responder").field("id", &self.id).finish()
    }
}

// ===== impl SendBody =====

impl SendBody {
    pub fn stream_id(&self) -> u32 {
        self.id.into()
    }

    /// Write response body bytes, suspending whenever flow control has no
    /// credit to give. `end_of_stream` closes the send half after `data`.
    pub async fn send_data(&mut self, mut data: Bytes, end_of_stream: bool) -> Result<(), crate::Error> {
        if self.done {
            return Err(UserError::InactiveStreamId.into());
        }

        let mut sent_eos = false;

        while !data.is_empty() {
            let granted = self
                .streams
                .reserve_capacity(self.key, self.id, data.len() as u32)
                .await?;

            let chunk = data.split_to(granted as usize);
            let eos = end_of_stream && data.is_empty();

            let mut frame = frame::Data::new(self.id, chunk);
            frame.set_end_stream(eos);
            self.write.send(WriteJob::Frame(frame.into())).await?;
            self.streams.sent_data(self.key, self.id, eos);
            sent_eos = eos;
        }

        if end_of_stream && !sent_eos {
            let mut frame = frame::Data::new(self.id, Bytes::new());
            frame.set_end_stream(true);
            self.write.send(WriteJob::Frame(frame.into())).await?;
            self.streams.sent_data(self.key, self.id, true);
        }

        if end_of_stream {
            self.done = true;
            if let Some(refund) = self.streams.take_refund() {
                self.write.send(WriteJob::Frame(refund.into())).await?;
            }
        }

        Ok(())
    }

    /// Abort the stream.
    pub async fn send_reset(mut self, reason: Reason) {
        self.done = true;
        let frames = self.streams.reset_stream_frames(self.id, reason);
        let _ = self.write.send(WriteJob::Frames(frames)).await;
    }
}

impl Drop for SendBody {
    fn drop(&mut self) {
        if self.done {
            return;
        }

        let frames = self.streams.reset_stream_frames(self.id, Reason::CANCEL);
        let _ = self.write.try_send(WriteJob::Frames(frames));
    }
}

impl fmt::Debug for SendBody {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SendBody").field("id", &self.id).finish()
    }
}

/// Whether a response status can carry a message body on the wire.
fn status_allows_body(status: StatusCode) -> bool {
    !status.is_informational()
        && status != StatusCode::NO_CONTENT
        && status != StatusCode::RESET_CONTENT
        && status != StatusCode::NOT_MODIFIED
}
