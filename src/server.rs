//! Serving one HTTP/2 connection.
//!
//! The transport handed in is expected to be ready for the HTTP/2
//! handshake: TLS with `h2` negotiated via ALPN, or a cleartext socket
//! right after a `101 Switching Protocols` response (use [`Builder::upgrade`]
//! for the latter). This module performs the handshake (local SETTINGS out,
//! client preface and SETTINGS in) and then drives the connection:
//!
//! ```no_run
//! use http::Response;
//!
//! # async fn serve(socket: tokio::net::TcpStream) -> Result<(), h2mux::Error> {
//! h2mux::server::Builder::new()
//!     .max_concurrent_streams(128)
//!     .serve(socket, |_request, responder| async move {
//!         let response = Response::builder().status(200).body(()).unwrap();
//!         let _ = responder.send_response(response, true).await;
//!     })
//!     .await
//! # }
//! ```
//!
//! The handler runs on a worker task per request, subject to the
//! [`Builder::max_concurrent_stream_execution`] cap; requests over the cap
//! wait in FIFO order.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use http::Request;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, split};
use tokio::task::JoinHandle;

use crate::codec::{FramedRead, FramedWrite, WriteJob, channel};
use crate::error::Error;
use crate::frame::{self, Reason};
use crate::hpack::{self, LiteralCodec};
use crate::proto::{self, Streams, StreamsConfig};
use crate::share::{Handler, RecvBody, Responder};

/// Builds server connections.
///
/// The builder is reusable: one builder can serve any number of
/// connections.
#[derive(Clone)]
pub struct Builder {
    read_timeout: Duration,
    keep_alive_timeout: Duration,
    write_timeout: Duration,
    settings: frame::Settings,
    max_concurrent_stream_execution: u32,
    codec: CodecFactory,
}

type CodecFactory =
    Arc<dyn Fn() -> (Box<dyn hpack::Encoder>, Box<dyn hpack::Decoder>) + Send + Sync>;

/// An accepted connection, ready to run.
pub struct Connection<T> {
    inner: proto::Connection<ReadHalf<T>>,
    writer: JoinHandle<std::io::Result<()>>,
}

/// Starts a graceful shutdown of a running connection.
#[derive(Clone)]
pub struct Pause {
    streams: Streams,
    write: crate::codec::WriteHandle,
}

/// Pending writes the connection tolerates before emitters start waiting on
/// the writer.
const WRITE_QUEUE_DEPTH: usize = 64;

impl Default for Builder {
    fn default() -> Builder {
        let mut settings = frame::Settings::default();
        settings.set_max_concurrent_streams(Some(100));

        Builder {
            read_timeout: Duration::from_secs(5),
            keep_alive_timeout: Duration::from_secs(20),
            write_timeout: Duration::from_secs(10),
            settings,
            max_concurrent_stream_execution: 20,
            codec: Arc::new(|| {
                (
                    Box::new(LiteralCodec::new()),
                    Box::new(LiteralCodec::new()),
                )
            }),
        }
    }
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Max time a partially received frame may take to finish arriving.
    pub fn read_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.read_timeout = timeout;
        self
    }

    /// Max idle time between frames before the connection is closed.
    pub fn keep_alive_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.keep_alive_timeout = timeout;
        self
    }

    /// Max time one flush of outbound frames may take.
    pub fn write_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.write_timeout = timeout;
        self
    }

    /// The MAX_CONCURRENT_STREAMS limit advertised to the peer.
    pub fn max_concurrent_streams(&mut self, max: u32) -> &mut Self {
        self.settings.set_max_concurrent_streams(Some(max));
        self
    }

    /// In-process cap on concurrently running request handlers. When lower
    /// than [`max_concurrent_streams`](Self::max_concurrent_streams),
    /// excess requests queue in FIFO order.
    pub fn max_concurrent_stream_execution(&mut self, max: u32) -> &mut Self {
        self.max_concurrent_stream_execution = max;
        self
    }

    /// The per-stream receive window advertised to the peer.
    pub fn initial_window_size(&mut self, size: u32) -> &mut Self {
        assert!(size as usize <= frame::MAX_INITIAL_WINDOW_SIZE);
        self.settings.set_initial_window_size(Some(size));
        self
    }

    /// The SETTINGS_MAX_FRAME_SIZE advertised to the peer.
    pub fn max_frame_size(&mut self, size: u32) -> &mut Self {
        self.settings.set_max_frame_size(Some(size));
        self
    }

    /// The SETTINGS_MAX_HEADER_LIST_SIZE advertised to the peer.
    pub fn max_header_list_size(&mut self, size: u32) -> &mut Self {
        self.settings.set_max_header_list_size(Some(size));
        self
    }

    /// Replace the built-in header codec with a full HPACK implementation.
    ///
    /// The factory is invoked once per connection; encoder and decoder
    /// state are per connection.
    pub fn header_codec<F>(&mut self, factory: F) -> &mut Self
    where
        F: Fn() -> (Box<dyn hpack::Encoder>, Box<dyn hpack::Decoder>) + Send + Sync + 'static,
    {
        self.codec = Arc::new(factory);
        self
    }

    /// Perform the server handshake and run the connection to completion.
    pub async fn serve<T, F, Fut>(&self, io: T, handler: F) -> Result<(), Error>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
        F: Fn(Request<RecvBody>, Responder) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handshake(io, handler).await?.run().await
    }

    /// Perform the server handshake: send our SETTINGS, read the client
    /// preface and its SETTINGS, seed the RTT estimate.
    pub async fn handshake<T, F, Fut>(&self, io: T, handler: F) -> Result<Connection<T>, Error>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
        F: Fn(Request<RecvBody>, Responder) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (mut conn, writer) = self.start(io, handler).await?;

        let preface = async {
            conn.read_preface_magic().await?;
            conn.read_preface_settings().await?;
            Ok::<_, proto::Error>(())
        }
        .await;

        if let Err(err) = preface {
            let err = conn.fail(err).await;
            return Err(err);
        }

        conn.streams().connect();
        if let Err(err) = conn.seed_rtt().await {
            return Err(conn.fail(err).await);
        }

        Ok(Connection {
            inner: conn,
            writer,
        })
    }

    /// Take over a connection established through an HTTP/1.1 upgrade
    /// (RFC 7540 section 3.2).
    ///
    /// `http2_settings` is the already-base64-decoded payload of the
    /// request's `HTTP2-Settings` header; `request` is the upgraded request
    /// itself, which is dispatched as stream 1 (half closed, remote). The
    /// client preface still follows on the wire and is validated here.
    pub async fn upgrade<T, F, Fut>(
        &self,
        io: T,
        http2_settings: &[u8],
        request: Request<()>,
        handler: F,
    ) -> Result<Connection<T>, Error>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
        F: Fn(Request<RecvBody>, Responder) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // Each entry is 6 bytes; a ragged payload is malformed.
        let settings = frame::Settings::load_payload(http2_settings).map_err(|_| {
            Error::from(proto::Error::library_go_away(Reason::PROTOCOL_ERROR))
        })?;

        let (mut conn, writer) = self.start(io, handler).await?;

        // Header-carried settings are applied without an ack.
        let (resets, changes) = conn.streams().apply_remote_settings(&settings);
        debug_assert!(resets.is_empty());
        if changes.max_frame_size.is_some() || changes.header_table_size.is_some() {
            let job = WriteJob::ApplySendSettings {
                max_frame_size: changes.max_frame_size,
                header_table_size: changes.header_table_size,
            };
            if let Err(err) = conn.write_handle().send(job).await {
                return Err(conn.fail(err).await);
            }
        }

        let key = conn.streams().upgrade();
        conn.dispatch_upgraded(key, request);

        let preface = async {
            conn.read_preface_magic().await?;
            conn.read_preface_settings().await?;
            Ok::<_, proto::Error>(())
        }
        .await;

        if let Err(err) = preface {
            return Err(conn.fail(err).await);
        }

        conn.streams().connect();
        if let Err(err) = conn.seed_rtt().await {
            return Err(conn.fail(err).await);
        }

        Ok(Connection {
            inner: conn,
            writer,
        })
    }

    /// Split the transport, start the writer task, send our SETTINGS.
    async fn start<T, F, Fut>(
        &self,
        io: T,
        handler: F,
    ) -> Result<(proto::Connection<ReadHalf<T>>, JoinHandle<std::io::Result<()>>), Error>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
        F: Fn(Request<RecvBody>, Responder) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (read, write) = split(io);

        let (encoder, decoder) = (self.codec)();

        let (write_handle, rx) = channel(WRITE_QUEUE_DEPTH);
        let writer = tokio::spawn(FramedWrite::new(write, self.write_timeout).run(rx, encoder));

        let mut reader = FramedRead::new(read);
        if let Some(max) = self.settings.max_frame_size() {
            reader.set_max_frame_size(max);
        }

        let streams = Streams::new(StreamsConfig {
            local_settings: self.settings.clone(),
            max_concurrent_stream_execution: self.max_concurrent_stream_execution,
        });

        let handler: Handler = Arc::new(move |request, responder| {
            Box::pin(handler(request, responder)) as Pin<Box<dyn Future<Output = ()> + Send>>
        });

        let conn = proto::Connection::new(
            reader,
            streams,
            write_handle.clone(),
            decoder,
            handler,
            proto::Config {
                read_timeout: self.read_timeout,
                keep_alive_timeout: self.keep_alive_timeout,
            },
        );

        // Our SETTINGS go out first, before anything from the peer is
        // looked at.
        write_handle
            .send(WriteJob::Frame(self.settings.clone().into()))
            .await
            .map_err(Error::from)?;

        Ok((conn, writer))
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Builder")
            .field("read_timeout", &self.read_timeout)
            .field("keep_alive_timeout", &self.keep_alive_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("settings", &self.settings)
            .field(
                "max_concurrent_stream_execution",
                &self.max_concurrent_stream_execution,
            )
            .finish()
    }
}

// ===== impl Connection =====

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    /// A handle that can pause this connection while it runs.
    pub fn pause_handle(&self) -> Pause {
        Pause {
            streams: self.inner.streams().clone(),
            write: self.inner.write_handle().clone(),
        }
    }

    /// Drive the connection until it closes.
    pub async fn run(self) -> Result<(), Error> {
        let result = self.inner.run().await;

        // The reader told the writer to shut down; collect its verdict so
        // transport write failures are not lost.
        let writer = match self.writer.await {
            Ok(res) => res,
            Err(join_err) => {
                tracing::debug!("writer task failed: {}", join_err);
                Ok(())
            }
        };

        result?;
        writer.map_err(Error::from_io)
    }
}

impl<T> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

// ===== impl Pause =====

impl Pause {
    /// Begin a graceful shutdown: a GOAWAY with the maximum stream id tells
    /// the peer to stop opening streams; one round trip later the
    /// connection re-announces with the id it actually processed and stops
    /// admitting.
    pub async fn pause(&self) {
        if let Some(goaway) = self.streams.pause() {
            let _ = self.write.send(WriteJob::Frame(goaway.into())).await;
        }
    }
}

impl fmt::Debug for Pause {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Pause").finish_non_exhaustive()
    }
}
