//! Contracts for the HPACK collaborator.
//!
//! Header compression is consumed by this crate, never implemented by it: the
//! connection drives an [`Encoder`] when serializing HEADERS / PUSH_PROMISE
//! blocks and a [`Decoder`] when reading them. The encoder fills a bounded
//! buffer and reports whether the header list was fully written
//! ([`Encode::Complete`]) or whether more calls are needed
//! ([`Encode::InProgress`]), which is what drives HEADERS / CONTINUATION
//! chunking. The decoder consumes header-block fragments and emits the
//! decoded fields into a [`HeaderSink`].
//!
//! [`LiteralCodec`] is the built-in default: it speaks only literal
//! never-indexed representations (a valid HPACK subset, no dynamic table).
//! A full HPACK implementation plugs in through the same traits.

mod literal;

pub use self::literal::LiteralCodec;

use bytes::{Bytes, BytesMut};

use std::fmt;

/// Progress of a streaming header-block encode.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Encode {
    /// The output buffer reached its limit before the header list was
    /// exhausted. Encode again, into a fresh buffer, to continue.
    InProgress,
    /// The entire header list has been written.
    Complete,
}

/// A single header field, pseudo-headers included, ready for the compressor.
///
/// Names are expected to already be lowercase.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Field {
    pub name: Bytes,
    pub value: Bytes,
}

/// Streaming HPACK encoder contract.
pub trait Encoder: Send {
    /// Encode fields pulled from `fields` into `dst`, writing at most `limit`
    /// bytes. State for a field that straddles two calls is the encoder's to
    /// keep.
    fn encode(
        &mut self,
        fields: &mut dyn Iterator<Item = Field>,
        dst: &mut BytesMut,
        limit: usize,
    ) -> Encode;

    /// Update the maximum dynamic table size, per a received
    /// SETTINGS_HEADER_TABLE_SIZE.
    fn set_max_dynamic_table_size(&mut self, _size: usize) {}
}

/// Streaming HPACK decoder contract.
pub trait Decoder: Send {
    /// Decode a header-block fragment, emitting each completed field into
    /// `sink`. A field split across fragments is buffered internally;
    /// `end_of_block` marks the fragment carrying END_HEADERS, after which
    /// unconsumed bytes are an error.
    fn decode(
        &mut self,
        src: &[u8],
        end_of_block: bool,
        sink: &mut dyn HeaderSink,
    ) -> Result<(), DecoderError>;

    /// Update the maximum dynamic table size, per the local
    /// SETTINGS_HEADER_TABLE_SIZE advertisement.
    fn set_max_dynamic_table_size(&mut self, _size: usize) {}
}

/// Receives decoded header fields.
pub trait HeaderSink {
    fn header(&mut self, name: Bytes, value: Bytes);
}

/// A sink that discards every field.
///
/// Used while new streams are not admitted: the header block still has to
/// run through the decoder so its state stays consistent with the peer.
#[derive(Debug, Default)]
pub struct NoopSink;

impl HeaderSink for NoopSink {
    fn header(&mut self, _name: Bytes, _value: Bytes) {}
}

/// Errors produced while decoding a header block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderError {
    /// The block ended in the middle of a field representation.
    NeedMore,
    /// The representation is valid HPACK but not supported by this decoder.
    UnsupportedRepresentation,
    /// A length or index did not fit in the expected range.
    IntegerOverflow,
    /// A string literal was Huffman coded and this decoder does not support
    /// Huffman decoding.
    HuffmanNotSupported,
}

impl fmt::Display for DecoderError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(match *self {
            DecoderError::NeedMore => "header block ended mid-field",
            DecoderError::UnsupportedRepresentation => "unsupported HPACK representation",
            DecoderError::IntegerOverflow => "HPACK integer overflow",
            DecoderError::HuffmanNotSupported => "Huffman coded literal not supported",
        })
    }
}

impl std::error::Error for DecoderError {}
