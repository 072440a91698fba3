use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::Notify;

use crate::frame::StreamId;

use super::flow_control::FlowControl;
use super::state::State;
use super::store::Key;

/// The weight carried on the wire is `[0, 255]`; the effective weight used
/// for bandwidth shares is one more, `[1, 256]`. A stream with no explicit
/// priority weighs 16.
pub const DEFAULT_WEIGHT: u8 = 15;

#[derive(Debug)]
pub struct Stream {
    /// The h2 stream identifier
    pub id: StreamId,

    /// Current state of the stream
    pub state: State,

    /// Send window: how much response data the peer will accept.
    pub send_flow: FlowControl,

    /// Receive window: how much request data we advertised.
    pub recv_flow: FlowControl,

    /// Priority tree parent; `None` is the connection root.
    pub parent: Option<Key>,

    /// Priority tree children.
    pub children: Vec<Key>,

    /// Wire-format weight; effective weight is this plus one.
    pub weight: u8,

    /// Request body bytes received but not yet taken by the application.
    pub recv_buf: BytesMut,

    /// Wakes a worker suspended in `reserve_capacity` when send credit or a
    /// state change arrives.
    pub capacity: Arc<Notify>,

    /// Wakes the request body reader when input or end-of-stream arrives.
    pub data_available: Arc<Notify>,

    /// The response carried END_STREAM (or a reset went out).
    pub sent_end_of_stream: bool,
}

impl Stream {
    pub fn new(id: StreamId, send_window: u32, recv_window: u32) -> Stream {
        Stream {
            id,
            state: State::default(),
            send_flow: FlowControl::new(send_window),
            recv_flow: FlowControl::new(recv_window),
            parent: None,
            children: Vec::new(),
            weight: DEFAULT_WEIGHT,
            recv_buf: BytesMut::new(),
            capacity: Arc::new(Notify::new()),
            data_available: Arc::new(Notify::new()),
            sent_end_of_stream: false,
        }
    }

    /// Effective priority weight, `1..=256`.
    pub fn effective_weight(&self) -> u32 {
        u32::from(self.weight) + 1
    }

    /// True when DATA frames may still go out on this stream.
    pub fn can_write(&self) -> bool {
        self.state.can_send_data() && !self.sent_end_of_stream
    }

    /// True when the stream no longer serves any purpose: not carrying a
    /// request, not holding up the priority tree.
    pub fn is_prunable(&self) -> bool {
        self.state.is_closed() && self.children.is_empty()
    }
}
