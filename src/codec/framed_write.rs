use std::io;
use std::time::Duration;

use bytes::BytesMut;
use smallvec::SmallVec;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::frame::{self, DEFAULT_MAX_FRAME_SIZE};
use crate::hpack;
use crate::proto::Error;

/// One unit of outbound work.
///
/// The writer serializes jobs in channel order and a job is written whole,
/// so a multi-frame sequence (HEADERS plus its CONTINUATIONs, the
/// WINDOW_UPDATE pair restoring padding credit) can never be interleaved
/// with frames from other tasks.
#[derive(Debug)]
pub enum WriteJob {
    Frame(frame::Frame),

    /// A short multi-frame sequence written atomically.
    Frames(SmallVec<[frame::Frame; 2]>),

    /// A response head; encoded by the writer, which owns the HPACK encoder,
    /// into HEADERS + CONTINUATION frames.
    Headers(frame::Headers),

    /// A push request head; encoded into PUSH_PROMISE + CONTINUATION frames.
    PushPromise(frame::PushPromise),

    /// Apply remote SETTINGS that affect serialization. Ordered with the
    /// surrounding jobs so earlier frames still use the old limits.
    ApplySendSettings {
        max_frame_size: Option<u32>,
        header_table_size: Option<u32>,
    },

    /// Flush and close the transport. Jobs already queued ahead of this one
    /// are still written; anything after it is dropped.
    Shutdown,
}

/// Sending half of the writer channel.
///
/// Cloned into every task that emits frames: the reader loop, dispatched
/// request processors, and the ping manager's callers.
#[derive(Debug, Clone)]
pub struct WriteHandle {
    tx: mpsc::Sender<WriteJob>,
}

/// The writer task: sole owner of the transport's write half.
#[derive(Debug)]
pub struct FramedWrite<T> {
    io: T,

    /// Scratch buffer; one job is fully serialized here before writing.
    buf: BytesMut,

    /// Peer's SETTINGS_MAX_FRAME_SIZE; caps each emitted frame payload.
    max_frame_size: usize,

    write_timeout: Duration,
}

pub fn channel(capacity: usize) -> (WriteHandle, mpsc::Receiver<WriteJob>) {
    let (tx, rx) = mpsc::channel(capacity);
    (WriteHandle { tx }, rx)
}

// ===== impl WriteHandle =====

impl WriteHandle {
    /// Enqueue a job for the writer.
    ///
    /// Fails once the writer has shut down or died on an I/O error; the
    /// caller is expected to treat that as a connection-fatal condition.
    pub async fn send(&self, job: WriteJob) -> Result<(), Error> {
        self.tx.send(job).await.map_err(|_| {
            Error::Io(
                io::ErrorKind::BrokenPipe,
                Some("connection writer is gone".into()),
            )
        })
    }

    /// Best-effort enqueue from non-async contexts (drop paths). A full or
    /// closed channel drops the job.
    pub fn try_send(&self, job: WriteJob) -> bool {
        self.tx.try_send(job).is_ok()
    }
}

// ===== impl FramedWrite =====

impl<T> FramedWrite<T>
where
    T: AsyncWrite + Unpin,
{
    pub fn new(io: T, write_timeout: Duration) -> FramedWrite<T> {
        FramedWrite {
            io,
            buf: BytesMut::with_capacity(4096),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE as usize,
            write_timeout,
        }
    }

    /// Drive the writer until shutdown, the last handle drops, or the
    /// transport fails.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<WriteJob>,
        mut encoder: Box<dyn hpack::Encoder>,
    ) -> io::Result<()> {
        while let Some(job) = rx.recv().await {
            self.buf.clear();

            match job {
                WriteJob::Frame(frame::Frame::Data(data)) => self.encode_data(data),
                WriteJob::Frame(frame) => frame.encode(&mut self.buf),
                WriteJob::Frames(frames) => {
                    for frame in frames {
                        match frame {
                            frame::Frame::Data(data) => self.encode_data(data),
                            other => other.encode(&mut self.buf),
                        }
                    }
                }
                WriteJob::Headers(headers) => {
                    headers.encode(&mut *encoder, self.max_frame_size, &mut self.buf)
                }
                WriteJob::PushPromise(push) => {
                    push.encode(&mut *encoder, self.max_frame_size, &mut self.buf)
                }
                WriteJob::ApplySendSettings {
                    max_frame_size,
                    header_table_size,
                } => {
                    if let Some(val) = max_frame_size {
                        self.max_frame_size = val as usize;
                    }
                    if let Some(val) = header_table_size {
                        encoder.set_max_dynamic_table_size(val as usize);
                    }
                    continue;
                }
                WriteJob::Shutdown => break,
            }

            self.write_buf().await?;
        }

        rx.close();
        let _ = self.io.shutdown().await;
        Ok(())
    }

    /// DATA payloads come sized by flow-control grants, which can exceed
    /// the peer's SETTINGS_MAX_FRAME_SIZE; split them into conforming
    /// frames, END_STREAM riding on the last.
    fn encode_data(&mut self, data: frame::Data) {
        let eos = data.is_end_stream();
        let id = data.stream_id();
        let mut payload = data.into_payload();

        loop {
            let chunk = payload.split_to(payload.len().min(self.max_frame_size));
            let last = payload.is_empty();

            let mut frame = frame::Data::new(id, chunk);
            frame.set_end_stream(eos && last);
            frame.encode(&mut self.buf);

            if last {
                return;
            }
        }
    }

    async fn write_buf(&mut self) -> io::Result<()> {
        let res = timeout(self.write_timeout, async {
            self.io.write_all(&self.buf).await?;
            self.io.flush().await
        })
        .await;

        match res {
            Ok(res) => res,
            Err(_elapsed) => {
                tracing::debug!("write timed out after {:?}", self.write_timeout);
                Err(io::ErrorKind::TimedOut.into())
            }
        }
    }
}
