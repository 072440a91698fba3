use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncRead;
use tokio::time::Instant;

use crate::codec::{FramedRead, Read, WriteHandle, WriteJob};
use crate::frame::{self, Head, HeadersFlag, Kind, Reason, StreamId};
use crate::hpack;
use crate::proto::{Error, Initiator, PingPong, RecvHeaders, Streams};
use crate::share::{Handler, RecvBody, Responder};

/// The 24 byte magic every client connection opens with.
pub(crate) const PREFACE: [u8; 24] = *b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

#[derive(Debug, Clone)]
pub(crate) struct Config {
    /// Max block time within a frame.
    pub read_timeout: Duration,

    /// Max idle between frames.
    pub keep_alive_timeout: Duration,
}

/// Drives one server connection: owns the read half, the HPACK decoder and
/// the ping manager, and turns raw frames into stream-layer operations.
pub(crate) struct Connection<T> {
    reader: FramedRead<T>,
    streams: Streams,
    write: WriteHandle,
    decoder: Box<dyn hpack::Decoder>,
    ping_pong: PingPong,
    handler: Handler,
    config: Config,

    /// An in-progress header block: HEADERS arrived without END_HEADERS and
    /// CONTINUATION frames are still expected.
    partial: Option<Partial>,
}

struct Partial {
    stream_id: StreamId,
    sink: Sink,
}

enum Sink {
    /// Collecting a request head for dispatch.
    Collect {
        key: crate::proto::Key,
        block: Box<frame::HeaderBlock>,
    },

    /// The stream was not admitted; the block still runs through the
    /// decoder so the compression state stays in step with the peer.
    Swallow,
}

impl<T> Connection<T>
where
    T: AsyncRead + Unpin,
{
    pub(crate) fn new(
        reader: FramedRead<T>,
        streams: Streams,
        write: WriteHandle,
        decoder: Box<dyn hpack::Decoder>,
        handler: Handler,
        config: Config,
    ) -> Connection<T> {
        Connection {
            reader,
            streams,
            write,
            decoder,
            ping_pong: PingPong::new(),
            handler,
            config,
            partial: None,
        }
    }

    pub(crate) fn streams(&self) -> &Streams {
        &self.streams
    }

    pub(crate) fn write_handle(&self) -> &WriteHandle {
        &self.write
    }

    /// Send the first PING right after the preface so the RTT estimate has
    /// a sample before anyone needs it.
    pub(crate) async fn seed_rtt(&mut self) -> Result<(), Error> {
        if let Some(ping) = self.ping_pong.send_ping(true, Instant::now()) {
            self.write.send(WriteJob::Frame(ping.into())).await?;
        }
        Ok(())
    }

    /// Consume and validate the 24 byte client connection preface.
    pub(crate) async fn read_preface_magic(&mut self) -> Result<(), Error> {
        let mut magic = [0u8; 24];
        self.reader
            .read_exact(&mut magic, self.config.read_timeout)
            .await?;

        if magic != PREFACE {
            proto_err!(conn: "invalid connection preface");
            return Err(Error::library_go_away_data(
                Reason::PROTOCOL_ERROR,
                "invalid connection preface",
            ));
        }

        Ok(())
    }

    /// The preface magic must be followed by the client's SETTINGS frame.
    pub(crate) async fn read_preface_settings(&mut self) -> Result<(), Error> {
        let read = self
            .reader
            .read_frame(self.config.read_timeout, self.config.read_timeout)
            .await?;

        match read {
            Read::Frame { head, payload } if head.kind() == Kind::Settings => {
                self.recv_settings(head, payload).await
            }
            Read::Frame { head, .. } => {
                proto_err!(conn: "expected SETTINGS after preface, got {:?}", head.kind());
                Err(Error::library_go_away_data(
                    Reason::PROTOCOL_ERROR,
                    "connection preface missing SETTINGS",
                ))
            }
            Read::Eof | Read::KeepAliveExpired => {
                Err(std::io::ErrorKind::UnexpectedEof.into())
            }
        }
    }

    /// Abort a connection that never got going: GOAWAY best effort, tear
    /// down, surface the error.
    pub(crate) async fn fail(&mut self, err: Error) -> crate::Error {
        if let Error::GoAway(ref debug_data, reason, _) = err {
            let goaway = self.streams.goaway(reason, debug_data.clone());
            let _ = self.write.send(WriteJob::Frame(goaway.into())).await;
        }
        self.streams.handle_error(&err);
        let _ = self.write.send(WriteJob::Shutdown).await;
        err.into()
    }

    /// Hand the request recovered from an HTTP/1.1 upgrade to the
    /// dispatcher as stream 1.
    pub(crate) fn dispatch_upgraded(&mut self, key: crate::proto::Key, request: http::Request<()>) {
        self.dispatch(key, StreamId::from(1), request);
    }

    /// Run the connection to completion.
    pub(crate) async fn run(mut self) -> Result<(), crate::Error> {
        let result = self.run_inner().await;

        let out = match result {
            Ok(()) => {
                // Orderly shutdown: tell the peer how far we got.
                let goaway = self.streams.goaway(Reason::NO_ERROR, Bytes::new());
                let _ = self.write.send(WriteJob::Frame(goaway.into())).await;
                self.streams
                    .handle_error(&Error::library_go_away(Reason::NO_ERROR));
                Ok(())
            }
            Err(Error::GoAway(debug_data, reason, initiator)) => {
                let err = Error::GoAway(debug_data.clone(), reason, initiator);
                tracing::debug!(error = %err, "connection error");

                // GOAWAY delivery is best effort; the connection is closing
                // either way.
                let goaway = self.streams.goaway(reason, debug_data);
                let _ = self.write.send(WriteJob::Frame(goaway.into())).await;

                self.streams.handle_error(&err);
                Err(err.into())
            }
            Err(err) => {
                tracing::debug!(error = %err, "connection I/O error");
                self.streams.handle_error(&err);
                Err(err.into())
            }
        };

        let _ = self.write.send(WriteJob::Shutdown).await;
        out
    }

    async fn run_inner(&mut self) -> Result<(), Error> {
        loop {
            // Opportunistic upkeep between frames: the pause transition is
            // time based, and liveness pings are due every so often.
            let rtt = self.ping_pong.round_trip_time();
            if let Some(goaway) = self.streams.check_pause(rtt) {
                self.write.send(WriteJob::Frame(goaway.into())).await?;
            }
            if let Some(ping) = self.ping_pong.send_ping(false, Instant::now()) {
                self.write.send(WriteJob::Frame(ping.into())).await?;
            }
            if let Some(refund) = self.streams.take_refund() {
                self.write.send(WriteJob::Frame(refund.into())).await?;
            }

            let read = self
                .reader
                .read_frame(self.config.keep_alive_timeout, self.config.read_timeout)
                .await?;

            match read {
                Read::Frame { head, payload } => match self.recv_frame(head, payload).await {
                    Ok(()) => {}
                    Err(Error::Reset(id, reason, Initiator::Library)) => {
                        // A stream-scoped fault: reset that stream (a bare
                        // reset when it is unknown) and keep serving.
                        tracing::debug!(?id, ?reason, "stream error");
                        let frames = self.streams.reset_stream_frames(id, reason);
                        self.write.send(WriteJob::Frames(frames)).await?;
                    }
                    Err(err) => return Err(err),
                },
                Read::Eof => {
                    if self.streams.new_streams_allowed() {
                        // The peer hung up while the connection was live.
                        return Err(std::io::ErrorKind::UnexpectedEof.into());
                    }
                    tracing::trace!("peer closed after shutdown");
                    return Ok(());
                }
                Read::KeepAliveExpired => {
                    tracing::debug!(
                        "no frame within keep-alive {:?}; closing",
                        self.config.keep_alive_timeout
                    );
                    return Ok(());
                }
            }
        }
    }

    async fn recv_frame(&mut self, head: Head, payload: BytesMut) -> Result<(), Error> {
        // Between a HEADERS frame and the end of its block, CONTINUATION on
        // the same stream is the only legal frame.
        if self.partial.is_some() && head.kind() != Kind::Continuation {
            proto_err!(conn: "expected CONTINUATION, got {:?}", head.kind());
            return Err(Error::library_go_away(Reason::PROTOCOL_ERROR));
        }

        match head.kind() {
            Kind::Headers => self.recv_headers(head, payload).await,
            Kind::Continuation => self.recv_continuation(head, payload).await,
            Kind::Data => self.recv_data(head, payload).await,
            Kind::Priority => {
                tracing::trace!("recv PRIORITY; id={:?}", head.stream_id());
                if head.stream_id().is_zero() {
                    proto_err!(conn: "PRIORITY on stream 0");
                    return Err(Error::library_go_away(Reason::PROTOCOL_ERROR));
                }
                let frame = match frame::Priority::load(head, &payload) {
                    Ok(frame) => frame,
                    Err(frame::Error::InvalidDependencyId) => {
                        // A stream cannot depend on itself (Section 5.3.1).
                        return Err(Error::library_reset(
                            head.stream_id(),
                            Reason::PROTOCOL_ERROR,
                        ));
                    }
                    Err(frame::Error::InvalidPayloadLength) => {
                        // Stream scoped, per Section 6.3.
                        return Err(Error::library_reset(
                            head.stream_id(),
                            Reason::FRAME_SIZE_ERROR,
                        ));
                    }
                    Err(err) => return Err(conn_error(err)),
                };
                self.streams
                    .recv_priority(frame.stream_id(), frame.dependency().clone())
            }
            Kind::Reset => {
                let frame = frame::Reset::load(head, &payload).map_err(conn_error)?;
                tracing::trace!("recv RST_STREAM; frame={:?}", frame);
                self.streams.recv_reset(frame)
            }
            Kind::Settings => self.recv_settings(head, payload).await,
            Kind::Ping => self.recv_ping(head, payload).await,
            Kind::WindowUpdate => {
                let frame = frame::WindowUpdate::load(head, &payload).map_err(conn_error)?;
                tracing::trace!("recv WINDOW_UPDATE; frame={:?}", frame);
                self.streams.recv_window_update(frame)
            }
            Kind::GoAway => {
                let frame = frame::GoAway::load(&payload).map_err(conn_error)?;
                // Informational on the server side.
                tracing::debug!("recv GOAWAY; frame={:?}", frame);
                Ok(())
            }
            Kind::PushPromise => {
                proto_err!(conn: "client sent PUSH_PROMISE");
                Err(Error::library_go_away(Reason::PROTOCOL_ERROR))
            }
            Kind::Unknown => {
                // Unknown frame types are read and discarded (Section 4.1).
                tracing::trace!("ignoring unknown frame; len={}", payload.len());
                Ok(())
            }
        }
    }

    async fn recv_headers(&mut self, head: Head, mut payload: BytesMut) -> Result<(), Error> {
        let id = head.stream_id();
        let flags = HeadersFlag::load(head.flag());
        tracing::trace!("recv HEADERS; id={:?} flags={:?}", id, flags);

        if id.is_zero() {
            proto_err!(conn: "HEADERS on stream 0");
            return Err(Error::library_go_away(Reason::PROTOCOL_ERROR));
        }

        let (_pad_len, dependency) =
            frame::strip_headers_payload(flags, &mut payload).map_err(conn_error)?;

        if let Some(ref dependency) = dependency {
            if dependency.dependency_id() == id {
                // A stream cannot depend on itself (Section 5.3.1).
                return Err(Error::library_reset(id, Reason::PROTOCOL_ERROR));
            }
        }

        let sink = match self.streams.recv_headers_start(id, flags.is_end_stream()) {
            Ok(RecvHeaders::Open { key }) => {
                if let Some(dependency) = dependency {
                    self.streams.recv_priority(id, dependency)?;
                }
                let block = frame::HeaderBlock::new(self.streams.local_max_header_list_size());
                Sink::Collect {
                    key,
                    block: Box::new(block),
                }
            }
            Ok(RecvHeaders::Swallow { reset }) => {
                if let Some(reset) = reset {
                    self.write.send(WriteJob::Frame(reset.into())).await?;
                }
                Sink::Swallow
            }
            Err(Error::Reset(id, reason, Initiator::Library)) => {
                // Stream-scoped refusal (admission over the limit). The
                // block still has to feed the decoder, so swallow it.
                let frames = self.streams.reset_stream_frames(id, reason);
                self.write.send(WriteJob::Frames(frames)).await?;
                Sink::Swallow
            }
            Err(err) => return Err(err),
        };

        self.partial = Some(Partial {
            stream_id: id,
            sink,
        });

        self.decode_fragment(&payload, flags.is_end_headers()).await
    }

    async fn recv_continuation(&mut self, head: Head, payload: BytesMut) -> Result<(), Error> {
        let end_of_block = head.flag() & 0x4 == 0x4;

        let Some(ref partial) = self.partial else {
            proto_err!(conn: "unexpected CONTINUATION frame");
            return Err(Error::library_go_away(Reason::PROTOCOL_ERROR));
        };

        if partial.stream_id != head.stream_id() {
            proto_err!(conn: "CONTINUATION stream id mismatch");
            return Err(Error::library_go_away(Reason::PROTOCOL_ERROR));
        }

        self.decode_fragment(&payload, end_of_block).await
    }

    async fn decode_fragment(&mut self, fragment: &[u8], end_of_block: bool) -> Result<(), Error> {
        let partial = self
            .partial
            .as_mut()
            .expect("decoding outside a header block");

        let res = match partial.sink {
            Sink::Collect { ref mut block, .. } => {
                self.decoder.decode(fragment, end_of_block, &mut **block)
            }
            Sink::Swallow => {
                self.decoder
                    .decode(fragment, end_of_block, &mut hpack::NoopSink)
            }
        };

        if let Err(err) = res {
            // Decoder state is unrecoverable once it rejects input.
            proto_err!(conn: "header block decode failed: {}", err);
            self.partial = None;
            return Err(Error::library_go_away(Reason::COMPRESSION_ERROR));
        }

        if end_of_block {
            return self.headers_end();
        }

        Ok(())
    }

    /// The header block completed: build the request head and dispatch it.
    fn headers_end(&mut self) -> Result<(), Error> {
        let partial = self.partial.take().expect("no header block to finish");
        let id = partial.stream_id;

        let (key, block) = match partial.sink {
            Sink::Swallow => return Ok(()),
            Sink::Collect { key, block } => (key, block),
        };

        let request = match block.into_request() {
            Ok(request) => request,
            Err(err) => {
                tracing::debug!("malformed request on {:?}: {:?}", id, err);
                return Err(Error::library_reset(id, Reason::PROTOCOL_ERROR));
            }
        };

        self.dispatch(key, id, request);
        Ok(())
    }

    /// Record the stream as processed and submit its processor to the
    /// worker pool.
    fn dispatch(&mut self, key: crate::proto::Key, id: StreamId, request: http::Request<()>) {
        self.streams.mark_processed(id);

        let body = RecvBody::new(self.streams.clone(), key, id, self.write.clone());
        let request = request.map(|()| body);
        let responder = Responder::new(self.streams.clone(), key, id, self.write.clone());

        let handler = self.handler.clone();
        let processor = Box::pin(async move {
            handler(request, responder).await;
        });
        self.streams.submit(processor);
    }

    async fn recv_data(&mut self, head: Head, payload: BytesMut) -> Result<(), Error> {
        let id = head.stream_id();
        if id.is_zero() {
            proto_err!(conn: "DATA on stream 0");
            return Err(Error::library_go_away(Reason::PROTOCOL_ERROR));
        }

        // Flow control covers the payload as it appeared on the wire,
        // padding included.
        let flow_len = payload.len() as u32;

        let data = frame::Data::load(head, payload).map_err(conn_error)?;
        tracing::trace!("recv DATA; frame={:?}", data);

        let credit = self.streams.recv_data(data, flow_len)?;
        if !credit.is_empty() {
            self.write.send(WriteJob::Frames(credit)).await?;
        }

        Ok(())
    }

    async fn recv_settings(&mut self, head: Head, payload: BytesMut) -> Result<(), Error> {
        let frame = frame::Settings::load(head, &payload).map_err(conn_error)?;
        tracing::trace!("recv SETTINGS; frame={:?}", frame);

        if frame.is_ack() {
            return self.streams.recv_settings_ack();
        }

        // Ack goes out ahead of anything influenced by the new settings;
        // the job queue keeps the order.
        self.write
            .send(WriteJob::Frame(frame::Settings::ack().into()))
            .await?;

        let (resets, changes) = self.streams.apply_remote_settings(&frame);

        if changes.max_frame_size.is_some() || changes.header_table_size.is_some() {
            self.write
                .send(WriteJob::ApplySendSettings {
                    max_frame_size: changes.max_frame_size,
                    header_table_size: changes.header_table_size,
                })
                .await?;
        }

        for reset in resets {
            self.write.send(WriteJob::Frame(reset.into())).await?;
        }

        Ok(())
    }

    async fn recv_ping(&mut self, head: Head, payload: BytesMut) -> Result<(), Error> {
        let frame = frame::Ping::load(head, &payload).map_err(conn_error)?;
        tracing::trace!("recv PING; ack={}", frame.is_ack());

        if frame.is_ack() {
            self.ping_pong.recv_pong(frame.payload(), Instant::now());
            Ok(())
        } else {
            // > Receivers of a PING frame that does not include an ACK flag
            // > MUST send a PING frame with the ACK flag set in response,
            // > with an identical payload.
            let pong = frame::Ping::pong(frame.into_payload());
            self.write.send(WriteJob::Frame(pong.into())).await
        }
    }
}

/// Map a frame parse failure to its connection-scoped error.
fn conn_error(err: frame::Error) -> Error {
    match err {
        frame::Error::BadFrameSize | frame::Error::InvalidPayloadLength => {
            proto_err!(conn: "frame with invalid size: {:?}", err);
            Error::library_go_away(Reason::FRAME_SIZE_ERROR)
        }
        other => {
            proto_err!(conn: "failed to load frame: {:?}", other);
            Error::library_go_away(Reason::PROTOCOL_ERROR)
        }
    }
}
