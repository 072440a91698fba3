use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::frame::{DEFAULT_MAX_FRAME_SIZE, FrameSize, HEADER_LEN, Head, MAX_MAX_FRAME_SIZE, Reason};
use crate::proto::Error;

/// Reads raw frames off the transport.
///
/// Reading is blocking *within* a frame and bounded *between* frames: once
/// any byte of a frame has been consumed the remainder must arrive within
/// `read_timeout`, while a fresh frame header is awaited for up to
/// `keep_alive`. Payload interpretation is left to the caller; only the
/// 9 byte frame header is parsed here.
#[derive(Debug)]
pub struct FramedRead<T> {
    io: T,

    /// Frames this large or larger are a FRAME_SIZE_ERROR, per the local
    /// SETTINGS_MAX_FRAME_SIZE advertisement.
    max_frame_size: FrameSize,
}

/// The outcome of waiting for one frame.
#[derive(Debug)]
pub enum Read {
    Frame { head: Head, payload: BytesMut },

    /// The peer shut down its half of the connection between frames.
    Eof,

    /// No new frame header arrived within the keep-alive window.
    KeepAliveExpired,
}

impl<T> FramedRead<T>
where
    T: AsyncRead + Unpin,
{
    pub fn new(io: T) -> FramedRead<T> {
        FramedRead {
            io,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Updates the max frame size setting.
    ///
    /// Must be within 16,384 and 16,777,215.
    pub fn set_max_frame_size(&mut self, val: FrameSize) {
        assert!((DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&val));
        self.max_frame_size = val;
    }

    /// Wait for the next frame.
    pub async fn read_frame(
        &mut self,
        keep_alive: Duration,
        read_timeout: Duration,
    ) -> Result<Read, Error> {
        let mut header = [0u8; HEADER_LEN];

        // Between frames: wait up to the keep-alive window for the first
        // byte of the next frame header.
        let n = match timeout(keep_alive, self.io.read(&mut header)).await {
            Ok(res) => res?,
            Err(_elapsed) => return Ok(Read::KeepAliveExpired),
        };

        if n == 0 {
            return Ok(Read::Eof);
        }

        // A frame is now in progress: the rest of it must arrive within the
        // read timeout, each read bounded individually.
        let mut filled = n;
        while filled < HEADER_LEN {
            filled += self.read_some(&mut header[filled..], read_timeout).await?;
        }

        let (len, head) = Head::parse(&header);
        tracing::trace!("read frame header; kind={:?} len={}", head.kind(), len);

        if len > self.max_frame_size {
            tracing::debug!(
                "connection error FRAME_SIZE_ERROR -- frame len={} exceeds {}",
                len,
                self.max_frame_size
            );
            return Err(Error::library_go_away(Reason::FRAME_SIZE_ERROR));
        }

        let mut payload = BytesMut::zeroed(len as usize);
        let mut filled = 0;
        while filled < payload.len() {
            filled += self.read_some(&mut payload[filled..], read_timeout).await?;
        }

        Ok(Read::Frame { head, payload })
    }

    async fn read_some(&mut self, dst: &mut [u8], read_timeout: Duration) -> Result<usize, Error> {
        match timeout(read_timeout, self.io.read(dst)).await {
            Ok(Ok(0)) => Err(std::io::ErrorKind::UnexpectedEof.into()),
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(e.into()),
            Err(_elapsed) => Err(Error::Io(
                std::io::ErrorKind::TimedOut,
                Some("read timed out mid-frame".into()),
            )),
        }
    }

    /// Read exactly `dst.len()` bytes, each read bounded by `read_timeout`.
    ///
    /// Used during the handshake to consume the connection preface magic.
    pub async fn read_exact(
        &mut self,
        dst: &mut [u8],
        read_timeout: Duration,
    ) -> Result<(), Error> {
        let mut filled = 0;
        while filled < dst.len() {
            filled += self.read_some(&mut dst[filled..], read_timeout).await?;
        }
        Ok(())
    }
}
