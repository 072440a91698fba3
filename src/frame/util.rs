use std::fmt;

use crate::frame::Error;

/// Strip padding from the payload of a padded frame.
///
/// Returns the padding length.
pub fn strip_padding(payload: &mut bytes::BytesMut) -> Result<u8, Error> {
    let payload_len = payload.len();
    if payload_len == 0 {
        // If this is the case, the frame is invalid as no padding length can be
        // extracted, even though the frame should be padded.
        return Err(Error::TooMuchPadding);
    }

    let pad_len = payload[0] as usize;

    if pad_len >= payload_len {
        // This is invalid: the padding length MUST be less than the length of
        // the payload.
        return Err(Error::TooMuchPadding);
    }

    let _ = payload.split_to(1);
    payload.truncate(payload_len - pad_len - 1);

    Ok(pad_len as u8)
}

pub struct DebugFlags<'a, 'f> {
    fmt: &'a mut fmt::Formatter<'f>,
    result: fmt::Result,
    started: bool,
}

pub fn debug_flags<'a, 'f>(
    fmt: &'a mut fmt::Formatter<'f>,
    bits: u8,
) -> DebugFlags<'a, 'f> {
    let result = write!(fmt, "({bits:#x}");
    DebugFlags {
        fmt,
        result,
        started: false,
    }
}

impl<'a, 'f> DebugFlags<'a, 'f> {
    pub fn flag_if(&mut self, enabled: bool, name: &str) -> &mut Self {
        if enabled {
            self.result = self.result.and_then(|()| {
                let sep = if self.started { " | " } else { ": " };
                write!(self.fmt, "{sep}{name}")
            });

            self.started = true;
        }

        self
    }

    pub fn finish(&mut self) -> fmt::Result {
        self.result.and_then(|()| write!(self.fmt, ")"))
    }
}
