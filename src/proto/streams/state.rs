use crate::error::UserError;
use crate::frame::{Reason, StreamId};
use crate::proto::{self, Error, Initiator};

/// Represents the state of an H2 stream, server side.
///
/// ```not_rust
///                              +--------+
///                      send PP |        |
///                     ,--------|  idle  |--------.
///                    /         |        |         \
///                   v          +--------+          v
///            +----------+          |           +--------+
///            |          |          | recv H    | closed |
///     ,------| reserved |          |           | (final)|
///     |      | (local)  |          v           +--------+
///     |      +----------+      +--------+     priority-only
///     |          |     recv ES |        |
///     |   send H |     ,-------|  open  |-------.
///     |          |    /        |        |        \ send ES
///     |          v   v         +--------+         v
///     |      +----------+          |           +----------+
///     |      |   half   |          |           |   half   |
///     |      |  closed  |          | send R /  |  closed  |
///     |      | (remote) |          | recv R    | (local)  |
///     |      +----------+          |           +----------+
///     |           |                |                 |
///     |           | send ES /      v       recv ES / |
///     |           | send R /   +--------+   send R / |
///     |           | recv R     |        |   recv R   |
///     |           `----------->| closed |<-----------'
///     `----------------------->|        |
///                              +--------+
///
///        H:  HEADERS frame (with implied CONTINUATIONs)
///        PP: PUSH_PROMISE frame (with implied CONTINUATIONs)
///        ES: END_STREAM flag
///        R:  RST_STREAM frame
/// ```
#[derive(Debug, Clone, Default)]
pub struct State {
    inner: Inner,
}

#[derive(Debug, Clone, Default)]
enum Inner {
    #[default]
    Idle,
    ReservedLocal,
    Open {
        local: Side,
    },
    HalfClosedRemote(Side),
    HalfClosedLocal,
    Closed(Cause),
}

/// The send (local) half: before or after the response HEADERS went out.
#[derive(Debug, Copy, Clone, Default)]
enum Side {
    #[default]
    AwaitingHeaders,
    Streaming,
}

#[derive(Debug, Clone)]
enum Cause {
    /// Both halves ran to completion.
    EndStream,

    /// Reset locally, reset by the peer, or torn down with the connection.
    Error(Error),

    /// Closed straight from idle: the stream only ever appeared in the
    /// priority tree (PRIORITY frames, or the id-skip sweep of RFC 7540
    /// section 5.1.1) and never carried a request. Held back longer during
    /// pruning so the tree keeps its shape.
    Final,
}

impl State {
    /// Opens the receive-half of the stream when its first HEADERS frame is
    /// received.
    pub fn recv_open(&mut self, eos: bool) -> Result<(), Error> {
        self.inner = match self.inner {
            Inner::Idle => {
                if eos {
                    Inner::HalfClosedRemote(Side::AwaitingHeaders)
                } else {
                    Inner::Open {
                        local: Side::AwaitingHeaders,
                    }
                }
            }
            ref state => {
                proto_err!(conn: "recv_open: in unexpected state {:?}", state);
                return Err(Error::library_go_away(Reason::PROTOCOL_ERROR));
            }
        };

        Ok(())
    }

    /// Opens the send-half of the stream: the response HEADERS are going out.
    pub fn send_open(&mut self, eos: bool) -> Result<(), UserError> {
        self.inner = match self.inner {
            Inner::Open {
                local: Side::AwaitingHeaders,
            } => {
                if eos {
                    Inner::HalfClosedLocal
                } else {
                    Inner::Open {
                        local: Side::Streaming,
                    }
                }
            }
            Inner::HalfClosedRemote(Side::AwaitingHeaders) | Inner::ReservedLocal => {
                if eos {
                    Inner::Closed(Cause::EndStream)
                } else {
                    Inner::HalfClosedRemote(Side::Streaming)
                }
            }
            _ => {
                // All other transitions are an API misuse
                return Err(UserError::UnexpectedFrameType);
            }
        };

        Ok(())
    }

    /// Transition from Idle -> ReservedLocal, for a pushed stream.
    pub fn reserve_local(&mut self) -> Result<(), UserError> {
        match self.inner {
            Inner::Idle => {
                self.inner = Inner::ReservedLocal;
                Ok(())
            }
            _ => Err(UserError::UnexpectedFrameType),
        }
    }

    /// The peer will not send any more data: END_STREAM was received.
    pub fn recv_close(&mut self) -> Result<(), Error> {
        match self.inner {
            Inner::Open { local } => {
                tracing::trace!("recv_close: Open => HalfClosedRemote({:?})", local);
                self.inner = Inner::HalfClosedRemote(local);
                Ok(())
            }
            Inner::HalfClosedLocal => {
                tracing::trace!("recv_close: HalfClosedLocal => Closed");
                self.inner = Inner::Closed(Cause::EndStream);
                Ok(())
            }
            ref state => {
                proto_err!(conn: "recv_close: in unexpected state {:?}", state);
                Err(Error::library_go_away(Reason::PROTOCOL_ERROR))
            }
        }
    }

    /// We will not send any more data: END_STREAM went out.
    pub fn send_close(&mut self) {
        match self.inner {
            Inner::Open { .. } => {
                tracing::trace!("send_close: Open => HalfClosedLocal");
                self.inner = Inner::HalfClosedLocal;
            }
            Inner::HalfClosedRemote(..) => {
                tracing::trace!("send_close: HalfClosedRemote => Closed");
                self.inner = Inner::Closed(Cause::EndStream);
            }
            ref state => panic!("send_close: unexpected state {:?}", state),
        }
    }

    /// The remote explicitly sent a RST_STREAM.
    pub fn recv_reset(&mut self, stream_id: StreamId, reason: Reason) {
        match self.inner {
            Inner::Closed(..) => {}
            ref state => {
                tracing::trace!("recv_reset; reason={:?}; state={:?}", reason, state);
                self.inner = Inner::Closed(Cause::Error(Error::remote_reset(stream_id, reason)));
            }
        }
    }

    /// Set the stream state to reset locally.
    pub fn set_reset(&mut self, stream_id: StreamId, reason: Reason) {
        self.inner = Inner::Closed(Cause::Error(Error::Reset(
            stream_id,
            reason,
            Initiator::Library,
        )));
    }

    /// Close an idle stream that will only ever exist in the priority tree.
    pub fn close_final(&mut self) {
        debug_assert!(self.is_idle());
        self.inner = Inner::Closed(Cause::Final);
    }

    /// Handle a connection-level error: every open stream is torn down.
    pub fn handle_error(&mut self, err: &proto::Error) {
        match self.inner {
            Inner::Closed(..) => {}
            _ => {
                tracing::trace!("handle_error; err={:?}", err);
                self.inner = Inner::Closed(Cause::Error(err.clone()));
            }
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.inner, Inner::Idle)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.inner, Inner::Closed(_))
    }

    pub fn is_closed_final(&self) -> bool {
        matches!(self.inner, Inner::Closed(Cause::Final))
    }

    /// Returns true if the stream was reset (locally or by the peer), as
    /// opposed to completing normally.
    pub fn is_reset(&self) -> bool {
        match self.inner {
            Inner::Closed(Cause::Error(_)) => true,
            Inner::Closed(..) => false,
            _ => false,
        }
    }

    /// Returns true while the stream counts against
    /// MAX_CONCURRENT_STREAMS: from HEADERS acceptance until fully closed.
    pub fn is_counted(&self) -> bool {
        matches!(
            self.inner,
            Inner::Open { .. } | Inner::HalfClosedRemote(..) | Inner::HalfClosedLocal
        )
    }

    /// Returns true if the server may send DATA frames: the response
    /// HEADERS went out without END_STREAM and no reset happened since.
    pub fn can_send_data(&self) -> bool {
        matches!(
            self.inner,
            Inner::Open {
                local: Side::Streaming,
            } | Inner::HalfClosedRemote(Side::Streaming)
        )
    }

    /// Returns true if DATA frames from the peer are acceptable.
    pub fn is_recv_streaming(&self) -> bool {
        matches!(self.inner, Inner::Open { .. } | Inner::HalfClosedLocal)
    }

    /// Returns true if END_STREAM has been received.
    pub fn is_recv_end_stream(&self) -> bool {
        matches!(
            self.inner,
            Inner::Closed(Cause::EndStream) | Inner::HalfClosedRemote(..)
        )
    }

    /// The reason this stream stopped being writable, if it was reset.
    pub fn reset_reason(&self) -> Option<Reason> {
        match self.inner {
            Inner::Closed(Cause::Error(Error::Reset(_, reason, _))) => Some(reason),
            Inner::Closed(Cause::Error(Error::GoAway(_, reason, _))) => Some(reason),
            _ => None,
        }
    }

    /// The error the stream was closed with, if any.
    pub fn closed_error(&self) -> Option<Error> {
        match self.inner {
            Inner::Closed(Cause::Error(ref err)) => Some(err.clone()),
            _ => None,
        }
    }
}
