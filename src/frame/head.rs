use bytes::BufMut;

use crate::frame::{FrameSize, HEADER_LEN, StreamId};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Head {
    kind: Kind,
    flag: u8,
    stream_id: StreamId,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Kind {
    Data = 0,
    Headers = 1,
    Priority = 2,
    Reset = 3,
    Settings = 4,
    PushPromise = 5,
    Ping = 6,
    GoAway = 7,
    WindowUpdate = 8,
    Continuation = 9,
    Unknown,
}

impl Kind {
    pub fn new(byte: u8) -> Kind {
        match byte {
            0 => Kind::Data,
            1 => Kind::Headers,
            2 => Kind::Priority,
            3 => Kind::Reset,
            4 => Kind::Settings,
            5 => Kind::PushPromise,
            6 => Kind::Ping,
            7 => Kind::GoAway,
            8 => Kind::WindowUpdate,
            9 => Kind::Continuation,
            _ => Kind::Unknown,
        }
    }
}

// ===== impl Head =====

impl Head {
    pub fn new(kind: Kind, flag: u8, stream_id: StreamId) -> Head {
        Head {
            kind,
            flag,
            stream_id,
        }
    }

    /// Parse an HTTP/2 frame header, returning the payload length alongside
    /// the parsed head.
    pub fn parse(header: &[u8]) -> (FrameSize, Head) {
        debug_assert_eq!(header.len(), HEADER_LEN);

        let length =
            (u32::from(header[0]) << 16) | (u32::from(header[1]) << 8) | u32::from(header[2]);
        let (stream_id, _) = StreamId::parse(&header[5..]);

        let head = Head {
            kind: Kind::new(header[3]),
            flag: header[4],
            stream_id,
        };

        (length, head)
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn flag(&self) -> u8 {
        self.flag
    }

    pub fn encode_len(&self) -> usize {
        HEADER_LEN
    }

    pub fn encode<T: BufMut>(&self, payload_len: usize, dst: &mut T) {
        debug_assert!(self.encode_len() <= dst.remaining_mut());
        debug_assert!(payload_len < (1 << 24));

        dst.put_uint(payload_len as u64, 3);
        dst.put_u8(self.kind as u8);
        dst.put_u8(self.flag);
        dst.put_u32(self.stream_id.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_round_trip() {
        let head = Head::new(Kind::WindowUpdate, 0x1, StreamId::from(5));

        let mut buf = Vec::new();
        head.encode(16, &mut buf);

        let (len, parsed) = Head::parse(&buf);
        assert_eq!(len, 16);
        assert_eq!(parsed, head);
    }

    #[test]
    fn unknown_kind() {
        let mut buf = Vec::new();
        Head::new(Kind::Ping, 0, StreamId::zero()).encode(8, &mut buf);
        buf[3] = 0x44;

        let (len, parsed) = Head::parse(&buf);
        assert_eq!(len, 8);
        assert_eq!(parsed.kind(), Kind::Unknown);
        assert_eq!(parsed.stream_id(), StreamId::zero());
    }
}
