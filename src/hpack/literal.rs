use std::cmp;

use bytes::{Bytes, BytesMut};

use crate::hpack::{Decoder, DecoderError, Encode, Encoder, Field, HeaderSink};

/// The built-in HPACK codec.
///
/// Emits every field as a "literal header field never indexed, new name"
/// representation and accepts only literal representations in return. No
/// dynamic table is kept, so the codec pairs with a
/// SETTINGS_HEADER_TABLE_SIZE advertisement of zero.
#[derive(Debug, Default)]
pub struct LiteralCodec {
    /// Encoded bytes of a field that did not fit the previous output buffer.
    pending: BytesMut,
    /// Unparsed bytes carried over between header block fragments.
    stash: BytesMut,
}

const NEVER_INDEXED: u8 = 0x10;

const REPR_INDEXED: u8 = 0x80;
const REPR_INCREMENTAL: u8 = 0x40;
const REPR_SIZE_UPDATE_MASK: u8 = 0xe0;
const REPR_SIZE_UPDATE: u8 = 0x20;

const HUFFMAN_FLAG: u8 = 0x80;

impl LiteralCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Encoder for LiteralCodec {
    fn encode(
        &mut self,
        fields: &mut dyn Iterator<Item = Field>,
        dst: &mut BytesMut,
        limit: usize,
    ) -> Encode {
        loop {
            // Flush a partially written field before pulling the next one.
            if !self.pending.is_empty() {
                let available = limit.saturating_sub(dst.len());
                if available == 0 {
                    return Encode::InProgress;
                }

                let n = cmp::min(available, self.pending.len());
                let chunk = self.pending.split_to(n);
                dst.extend_from_slice(&chunk);

                if !self.pending.is_empty() {
                    return Encode::InProgress;
                }
            }

            match fields.next() {
                Some(field) => encode_literal(&field, &mut self.pending),
                None => return Encode::Complete,
            }
        }
    }
}

impl Decoder for LiteralCodec {
    fn decode(
        &mut self,
        src: &[u8],
        end_of_block: bool,
        sink: &mut dyn HeaderSink,
    ) -> Result<(), DecoderError> {
        self.stash.extend_from_slice(src);

        loop {
            match decode_one(&self.stash)? {
                Some((field, consumed)) => {
                    let _ = self.stash.split_to(consumed);
                    if let Some(field) = field {
                        sink.header(field.name, field.value);
                    }
                }
                None => break,
            }
        }

        if end_of_block && !self.stash.is_empty() {
            return Err(DecoderError::NeedMore);
        }

        Ok(())
    }
}

fn encode_literal(field: &Field, dst: &mut BytesMut) {
    encode_int(0, 4, NEVER_INDEXED, dst);
    encode_str(&field.name, dst);
    encode_str(&field.value, dst);
}

fn encode_str(val: &[u8], dst: &mut BytesMut) {
    encode_int(val.len(), 7, 0, dst);
    dst.extend_from_slice(val);
}

/// Encode an integer into the given destination buffer, with an N-bit
/// prefix (RFC 7541 section 5.1).
fn encode_int(mut value: usize, prefix_bits: usize, first_byte: u8, dst: &mut BytesMut) {
    let max_prefix = (1usize << prefix_bits) - 1;

    if value < max_prefix {
        dst.extend_from_slice(&[first_byte | value as u8]);
        return;
    }

    dst.extend_from_slice(&[first_byte | max_prefix as u8]);
    value -= max_prefix;

    while value >= 128 {
        dst.extend_from_slice(&[(value % 128 + 128) as u8]);
        value /= 128;
    }

    dst.extend_from_slice(&[value as u8]);
}

/// Decode one representation from the front of `buf`.
///
/// Returns `None` when `buf` holds an incomplete representation, and
/// `Some((None, consumed))` for representations that decode to no field (a
/// dynamic table size update, accepted and ignored).
fn decode_one(buf: &[u8]) -> Result<Option<(Option<Field>, usize)>, DecoderError> {
    let Some(&b0) = buf.first() else {
        return Ok(None);
    };

    if b0 & REPR_INDEXED == REPR_INDEXED {
        // Indexed field; requires a header table.
        return Err(DecoderError::UnsupportedRepresentation);
    }

    if b0 & REPR_SIZE_UPDATE_MASK == REPR_SIZE_UPDATE {
        // Dynamic table size update. With no table in play the new size is
        // irrelevant; skip it.
        return match decode_int(buf, 5)? {
            Some((_, consumed)) => Ok(Some((None, consumed))),
            None => Ok(None),
        };
    }

    let prefix_bits = if b0 & 0xc0 == REPR_INCREMENTAL { 6 } else { 4 };

    let Some((name_index, mut pos)) = decode_int(buf, prefix_bits)? else {
        return Ok(None);
    };

    if name_index != 0 {
        // Table-indexed field name; requires a header table.
        return Err(DecoderError::UnsupportedRepresentation);
    }

    let Some((name, consumed)) = decode_str(&buf[pos..])? else {
        return Ok(None);
    };
    pos += consumed;

    let Some((value, consumed)) = decode_str(&buf[pos..])? else {
        return Ok(None);
    };
    pos += consumed;

    Ok(Some((Some(Field { name, value }), pos)))
}

fn decode_str(buf: &[u8]) -> Result<Option<(Bytes, usize)>, DecoderError> {
    let Some(&b0) = buf.first() else {
        return Ok(None);
    };

    if b0 & HUFFMAN_FLAG == HUFFMAN_FLAG {
        return Err(DecoderError::HuffmanNotSupported);
    }

    let Some((len, prefix_len)) = decode_int(buf, 7)? else {
        return Ok(None);
    };

    if buf.len() < prefix_len + len {
        return Ok(None);
    }

    let val = Bytes::copy_from_slice(&buf[prefix_len..prefix_len + len]);
    Ok(Some((val, prefix_len + len)))
}

/// Decode an N-bit prefixed integer, returning the value and the number of
/// bytes consumed.
fn decode_int(buf: &[u8], prefix_bits: usize) -> Result<Option<(usize, usize)>, DecoderError> {
    let max_prefix = (1usize << prefix_bits) - 1;

    let Some(&b0) = buf.first() else {
        return Ok(None);
    };

    let mut value = (b0 as usize) & max_prefix;
    if value < max_prefix {
        return Ok(Some((value, 1)));
    }

    let mut shift = 0usize;
    for (i, &b) in buf[1..].iter().enumerate() {
        let add = ((b & 0x7f) as usize)
            .checked_shl(shift as u32)
            .ok_or(DecoderError::IntegerOverflow)?;
        value = value.checked_add(add).ok_or(DecoderError::IntegerOverflow)?;
        shift += 7;

        if shift > 28 {
            return Err(DecoderError::IntegerOverflow);
        }

        if b & 0x80 == 0 {
            return Ok(Some((value, i + 2)));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect(Vec<(Bytes, Bytes)>);

    impl HeaderSink for Collect {
        fn header(&mut self, name: Bytes, value: Bytes) {
            self.0.push((name, value));
        }
    }

    fn field(name: &str, value: &str) -> Field {
        Field {
            name: Bytes::copy_from_slice(name.as_bytes()),
            value: Bytes::copy_from_slice(value.as_bytes()),
        }
    }

    #[test]
    fn round_trip() {
        let mut codec = LiteralCodec::new();
        let mut dst = BytesMut::new();

        let fields = vec![field(":status", "200"), field("content-type", "text/plain")];
        let state = codec.encode(&mut fields.clone().into_iter(), &mut dst, 16_384);
        assert_eq!(state, Encode::Complete);

        let mut sink = Collect::default();
        let mut decoder = LiteralCodec::new();
        decoder.decode(&dst, true, &mut sink).unwrap();

        assert_eq!(sink.0.len(), 2);
        assert_eq!(sink.0[0].0, ":status");
        assert_eq!(sink.0[0].1, "200");
        assert_eq!(sink.0[1].0, "content-type");
        assert_eq!(sink.0[1].1, "text/plain");
    }

    #[test]
    fn encode_resumes_when_buffer_fills() {
        let mut codec = LiteralCodec::new();
        let fields = vec![field("name-one", "a".repeat(40).as_str()), field("x", "y")];
        let mut iter = fields.into_iter();

        let mut chunks = Vec::new();
        let mut assembled = BytesMut::new();
        loop {
            let mut dst = BytesMut::new();
            let state = codec.encode(&mut iter, &mut dst, 16);
            assert!(dst.len() <= 16);
            assembled.extend_from_slice(&dst);
            chunks.push(dst);
            if state == Encode::Complete {
                break;
            }
        }

        assert!(chunks.len() > 1);

        let mut sink = Collect::default();
        let mut decoder = LiteralCodec::new();
        decoder.decode(&assembled, true, &mut sink).unwrap();
        assert_eq!(sink.0.len(), 2);
        assert_eq!(sink.0[1].0, "x");
    }

    #[test]
    fn decode_across_fragments() {
        let mut codec = LiteralCodec::new();
        let mut dst = BytesMut::new();
        codec.encode(
            &mut vec![field("a-header", "a-value")].into_iter(),
            &mut dst,
            16_384,
        );

        let split = dst.len() / 2;
        let mut decoder = LiteralCodec::new();
        let mut sink = Collect::default();

        decoder.decode(&dst[..split], false, &mut sink).unwrap();
        assert!(sink.0.is_empty());

        decoder.decode(&dst[split..], true, &mut sink).unwrap();
        assert_eq!(sink.0.len(), 1);
        assert_eq!(sink.0[0].1, "a-value");
    }

    #[test]
    fn indexed_representation_rejected() {
        let mut decoder = LiteralCodec::new();
        let mut sink = Collect::default();

        // 0x82 = indexed field, static table entry 2
        let res = decoder.decode(&[0x82], true, &mut sink);
        assert_eq!(res, Err(DecoderError::UnsupportedRepresentation));
    }

    #[test]
    fn truncated_block_is_an_error() {
        let mut codec = LiteralCodec::new();
        let mut dst = BytesMut::new();
        codec.encode(
            &mut vec![field("a-header", "a-value")].into_iter(),
            &mut dst,
            16_384,
        );

        let mut decoder = LiteralCodec::new();
        let mut sink = Collect::default();
        let res = decoder.decode(&dst[..dst.len() - 1], true, &mut sink);
        assert_eq!(res, Err(DecoderError::NeedMore));
    }

    #[test]
    fn int_round_trip() {
        for val in [0usize, 1, 30, 127, 128, 1337, 1 << 20] {
            let mut buf = BytesMut::new();
            encode_int(val, 7, 0, &mut buf);
            let (decoded, consumed) = decode_int(&buf, 7).unwrap().unwrap();
            assert_eq!(decoded, val);
            assert_eq!(consumed, buf.len());
        }
    }
}
