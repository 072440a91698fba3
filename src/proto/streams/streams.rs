use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use smallvec::{SmallVec, smallvec};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::UserError;
use crate::frame::{self, Reason, StreamDependency, StreamId};
use crate::proto::Error;
use crate::proto::dispatch::{Dispatcher, Processor};
use crate::proto::settings::SettingsPair;

use super::FlowControl;
use super::prioritize::{Prioritize, Reserved};
use super::store::{Key, Store};
use super::stream::Stream;

#[derive(Debug, Clone)]
pub struct Config {
    /// The SETTINGS advertised to the peer during the handshake.
    pub local_settings: frame::Settings,

    /// In-process worker cap; FIFO queueing engages when this is below the
    /// advertised MAX_CONCURRENT_STREAMS.
    pub max_concurrent_stream_execution: u32,
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    New,
    Connected,
    Pausing,
    Paused,
    Closed,
}

impl ConnState {
    pub fn new_streams_allowed(self) -> bool {
        matches!(self, ConnState::New | ConnState::Connected | ConnState::Pausing)
    }
}

/// The stream table and everything guarded with it: admission counters,
/// flow control, settings, the dispatcher.
///
/// Clones share state; handles given to workers (`RecvBody`, `Responder`)
/// carry one.
#[derive(Debug, Clone)]
pub struct Streams {
    inner: Arc<Mutex<Inner>>,

    /// Streams currently counting against MAX_CONCURRENT_STREAMS.
    ///
    /// Deliberately outside the lock: admission increments first and
    /// compensates on overshoot, so the cap is best-effort and may be
    /// exceeded by one transiently.
    active_remote: Arc<AtomicU32>,
}

#[derive(Debug)]
struct Inner {
    state: ConnState,

    /// When `pause()` was called; drives Pausing -> Paused one RTT later.
    paused_at: Option<Instant>,

    store: Store,
    prioritize: Prioritize,
    settings: SettingsPair,
    dispatch: Dispatcher,

    /// Connection-level receive window.
    recv_flow: FlowControl,

    /// Highest peer-initiated id accepted.
    max_remote_id: StreamId,

    /// Highest peer-initiated id that ever started HEADERS processing.
    max_active_remote_id: StreamId,

    /// Highest id handed to the application.
    max_processed_id: StreamId,

    /// Next id for a pushed stream.
    next_local_id: StreamId,

    /// Admissions since the connection started; prunes run every tenth.
    admissions: u64,

    /// Connection receive-window credit reclaimed from request bytes the
    /// application never consumed (streams closed with a non-empty input
    /// buffer). Already applied to `recv_flow`; drained into a
    /// WINDOW_UPDATE by `take_refund`.
    window_refund: u32,
}

/// The outcome of the start of a peer HEADERS block.
#[derive(Debug)]
pub enum RecvHeaders {
    /// Stream admitted: collect the block and dispatch it.
    Open { key: Key },

    /// Feed the block to a no-op sink (HPACK state must stay consistent),
    /// optionally refusing the stream first.
    Swallow { reset: Option<frame::Reset> },
}

/// How many admissions between prune sweeps.
const PRUNE_INTERVAL: u64 = 10;

impl Streams {
    pub fn new(config: Config) -> Streams {
        let max_execution = config.max_concurrent_stream_execution;
        let settings = SettingsPair::new(config.local_settings);
        let max_concurrent = settings.local_max_concurrent_streams();

        Streams {
            inner: Arc::new(Mutex::new(Inner {
                state: ConnState::New,
                paused_at: None,
                store: Store::new(),
                prioritize: Prioritize::new(),
                settings,
                dispatch: Dispatcher::new(max_execution, max_concurrent),
                recv_flow: FlowControl::new(frame::DEFAULT_INITIAL_WINDOW_SIZE),
                max_remote_id: StreamId::ZERO,
                max_active_remote_id: StreamId::ZERO,
                max_processed_id: StreamId::ZERO,
                next_local_id: StreamId::from(2),
                admissions: 0,
                window_refund: 0,
            })),
            active_remote: Arc::new(AtomicU32::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("connection state poisoned")
    }

    /// The preface completed; the connection is live.
    pub fn connect(&self) {
        let mut inner = self.lock();
        debug_assert_eq!(inner.state, ConnState::New);
        inner.state = ConnState::Connected;
    }

    /// Install the stream synthesized from an HTTP/1.1 upgrade request.
    ///
    /// The upgraded request was fully read before HTTP/2 started, so stream
    /// 1 begins half closed (remote) and already counts as processed.
    pub fn upgrade(&self) -> Key {
        let mut inner = self.lock();
        let inner = &mut *inner;
        debug_assert_eq!(inner.state, ConnState::New);

        let id = StreamId::from(1);
        let mut stream = Stream::new(
            id,
            inner.settings.remote_initial_window_size(),
            inner.settings.local_initial_window_size(),
        );
        stream
            .state
            .recv_open(true)
            .expect("fresh stream rejected HEADERS");

        let key = inner.store.insert(id, stream);
        inner.max_remote_id = id;
        inner.max_active_remote_id = id;
        inner.max_processed_id = id;
        self.active_remote.store(1, Ordering::Relaxed);

        key
    }

    #[cfg(test)]
    pub fn active_remote_count(&self) -> u32 {
        self.active_remote.load(Ordering::Relaxed)
    }

    // ===== reader-side operations =====

    /// A peer HEADERS block is starting for `id`.
    pub fn recv_headers_start(&self, id: StreamId, eos: bool) -> Result<RecvHeaders, Error> {
        let mut inner = self.lock();

        if !id.is_client_initiated() {
            proto_err!(conn: "recv_headers: stream id {:?} is not client initiated", id);
            return Err(Error::library_go_away(Reason::PROTOCOL_ERROR));
        }

        if id <= inner.max_remote_id {
            // Either a closed stream or an id the peer skipped over; both
            // violate the strictly-increasing id rule.
            proto_err!(conn: "recv_headers: stream id {:?} is not past {:?}", id, inner.max_remote_id);
            return Err(Error::library_go_away(Reason::PROTOCOL_ERROR));
        }

        match inner.state {
            ConnState::New | ConnState::Connected => {}
            ConnState::Pausing => {
                // Shutting down gracefully: the peer was told (GOAWAY with
                // max id) not to start new streams, so refuse without
                // creating state.
                return Ok(RecvHeaders::Swallow {
                    reset: Some(frame::Reset::new(id, Reason::REFUSED_STREAM)),
                });
            }
            ConnState::Paused | ConnState::Closed => {
                return Ok(RecvHeaders::Swallow { reset: None });
            }
        }

        inner.admissions += 1;
        if inner.admissions % PRUNE_INTERVAL == 0 {
            let max = inner.settings.local_max_concurrent_streams();
            inner.prune_closed_streams(max);
        }

        inner.close_idle_streams(id);
        inner.max_active_remote_id = id;
        inner.max_remote_id = id;

        // The stream may already exist idle, created by PRIORITY frames.
        let key = match inner.store.find(id) {
            Some(key) => {
                inner.store[key].state.recv_open(eos)?;
                key
            }
            None => {
                let mut stream = Stream::new(
                    id,
                    inner.settings.remote_initial_window_size(),
                    inner.settings.local_initial_window_size(),
                );
                stream.state.recv_open(eos)?;
                inner.store.insert(id, stream)
            }
        };

        // Best-effort concurrency cap: increment, then compensate if the
        // limit was crossed.
        let active = self.active_remote.fetch_add(1, Ordering::Relaxed) + 1;
        if active > inner.settings.local_max_concurrent_streams() {
            self.active_remote.fetch_sub(1, Ordering::Relaxed);
            // The count was already compensated; close the stream without
            // touching it again.
            inner.store[key].state.set_reset(id, Reason::REFUSED_STREAM);
            return Err(Error::library_reset(id, Reason::REFUSED_STREAM));
        }

        Ok(RecvHeaders::Open { key })
    }

    /// The header block for `key` completed and is being handed off.
    pub fn mark_processed(&self, id: StreamId) {
        let mut inner = self.lock();
        if id > inner.max_processed_id {
            inner.max_processed_id = id;
        }
    }

    /// Submit a stream processor to the worker pool, honoring the execution
    /// cap.
    pub fn submit(&self, processor: Processor) {
        let run = self.lock().dispatch.submit(processor);
        if let Some(processor) = run {
            self.spawn_processor(processor);
        }
    }

    fn spawn_processor(&self, processor: Processor) {
        let streams = self.clone();
        tokio::spawn(async move {
            processor.await;
            streams.processor_complete();
        });
    }

    fn processor_complete(&self) {
        let next = self.lock().dispatch.complete();
        if let Some(processor) = next {
            self.spawn_processor(processor);
        }
    }

    /// A DATA frame arrived. `flow_len` is the full payload length on the
    /// wire, padding included.
    ///
    /// Returns frames restoring flow-control credit, to be written as one
    /// unit.
    pub fn recv_data(
        &self,
        data: frame::Data,
        flow_len: u32,
    ) -> Result<SmallVec<[frame::Frame; 2]>, Error> {
        let mut inner = self.lock();
        let inner = &mut *inner;
        let id = data.stream_id();

        // The whole payload, padding included, consumes the connection
        // receive window no matter what becomes of the stream.
        if inner.recv_flow.try_consume(flow_len).is_err() {
            proto_err!(conn: "recv_data: connection flow control violated");
            return Err(Error::library_go_away(Reason::FLOW_CONTROL_ERROR));
        }

        let Some(key) = inner.store.find(id) else {
            if id > inner.max_remote_id {
                proto_err!(conn: "recv_data: stream id {:?} is idle", id);
                return Err(Error::library_go_away(Reason::PROTOCOL_ERROR));
            }
            // Closed and pruned; answer with a bare reset.
            return Err(Error::library_reset(id, Reason::STREAM_CLOSED));
        };

        let stream = &mut inner.store[key];

        if stream.state.is_reset() {
            // We reset this stream; in-flight DATA is expected. Swallow it
            // and hand the connection-level credit straight back.
            let credit = frame::WindowUpdate::new(StreamId::zero(), flow_len);
            inner.recv_flow.increase(flow_len).expect("credit refund overflow");
            return Ok(smallvec![credit.into()]);
        }

        if !stream.state.is_recv_streaming() {
            return Err(Error::library_reset(id, Reason::STREAM_CLOSED));
        }

        if stream.recv_flow.try_consume(flow_len).is_err() {
            inner.close_stream(key, Reason::FLOW_CONTROL_ERROR, &self.active_remote);
            return Err(Error::library_reset(id, Reason::FLOW_CONTROL_ERROR));
        }

        stream.recv_buf.extend_from_slice(data.payload());

        if data.is_end_stream() {
            let was_counted = stream.state.is_counted();
            stream.state.recv_close()?;
            if was_counted && !stream.state.is_counted() {
                self.active_remote.fetch_sub(1, Ordering::Relaxed);
            }
        }

        stream.data_available.notify_one();

        // Padding never reaches the application, so its credit (the pad
        // bytes plus the length octet) goes back immediately, on the stream
        // and on the connection.
        let mut credit = SmallVec::new();
        if let Some(pad_len) = data.pad_len() {
            let refund = u32::from(pad_len) + 1;
            let stream = &mut inner.store[key];
            let _ = stream.recv_flow.increase(refund);
            let _ = inner.recv_flow.increase(refund);
            credit.push(frame::WindowUpdate::new(id, refund).into());
            credit.push(frame::WindowUpdate::new(StreamId::zero(), refund).into());
        }

        Ok(credit)
    }

    /// The application consumed `n` bytes of request body; restore the
    /// advertised windows.
    fn consumed_credit(inner: &mut Inner, key: Key, n: u32) -> SmallVec<[frame::Frame; 2]> {
        let stream = &mut inner.store[key];
        let id = stream.id;
        let mut credit: SmallVec<[frame::Frame; 2]> = SmallVec::new();

        let _ = inner.recv_flow.increase(n);
        credit.push(frame::WindowUpdate::new(StreamId::zero(), n).into());

        if stream.state.is_recv_streaming() {
            let _ = stream.recv_flow.increase(n);
            credit.push(frame::WindowUpdate::new(id, n).into());
        }

        credit
    }

    /// A RST_STREAM arrived from the peer.
    pub fn recv_reset(&self, frame: frame::Reset) -> Result<(), Error> {
        let mut inner = self.lock();
        let inner = &mut *inner;
        let id = frame.stream_id();

        let Some(key) = inner.store.find(id) else {
            if id.is_client_initiated() && id > inner.max_remote_id {
                proto_err!(conn: "recv_reset: stream id {:?} is idle", id);
                return Err(Error::library_go_away(Reason::PROTOCOL_ERROR));
            }
            return Ok(());
        };

        let stream = &mut inner.store[key];
        if stream.state.is_idle() {
            proto_err!(conn: "recv_reset: stream id {:?} is idle", id);
            return Err(Error::library_go_away(Reason::PROTOCOL_ERROR));
        }

        let was_counted = stream.state.is_counted();
        stream.state.recv_reset(id, frame.reason());
        inner.prioritize.forget(key);
        inner.reclaim_input(key);

        let stream = &inner.store[key];
        stream.capacity.notify_one();
        stream.data_available.notify_one();

        if was_counted {
            self.active_remote.fetch_sub(1, Ordering::Relaxed);
        }

        Ok(())
    }

    /// A WINDOW_UPDATE arrived: stream 0 grows the connection send window
    /// (possibly releasing the backlog), anything else grows one stream's.
    pub fn recv_window_update(&self, frame: frame::WindowUpdate) -> Result<(), Error> {
        let id = frame.stream_id();
        let increment = frame.size_increment();

        let wake = {
            let mut inner = self.lock();
            let inner = &mut *inner;

            if id.is_zero() {
                if increment == 0 {
                    proto_err!(conn: "recv_window_update: zero increment on connection");
                    return Err(Error::library_go_away(Reason::PROTOCOL_ERROR));
                }

                inner
                    .prioritize
                    .increment_connection_window(&inner.store, increment)
                    .map_err(Error::library_go_away)?
            } else {
                if increment == 0 {
                    return Err(Error::library_reset(id, Reason::PROTOCOL_ERROR));
                }

                let Some(key) = inner.store.find(id) else {
                    if id.is_client_initiated() && id > inner.max_remote_id {
                        proto_err!(conn: "recv_window_update: stream id {:?} is idle", id);
                        return Err(Error::library_go_away(Reason::PROTOCOL_ERROR));
                    }
                    // Closed and pruned; WINDOW_UPDATE remains legal.
                    return Ok(());
                };

                let stream = &mut inner.store[key];
                if stream.state.is_idle() {
                    proto_err!(conn: "recv_window_update: stream id {:?} is idle", id);
                    return Err(Error::library_go_away(Reason::PROTOCOL_ERROR));
                }

                if stream.send_flow.increase(increment).is_err() {
                    inner.close_stream(key, Reason::FLOW_CONTROL_ERROR, &self.active_remote);
                    return Err(Error::library_reset(id, Reason::FLOW_CONTROL_ERROR));
                }

                vec![stream.capacity.clone()]
            }
        };

        // Wakes happen outside the lock; each woken worker re-acquires it.
        for notify in wake {
            notify.notify_one();
        }

        Ok(())
    }

    /// A PRIORITY frame arrived, or a HEADERS frame carried priority fields.
    pub fn recv_priority(&self, id: StreamId, dependency: StreamDependency) -> Result<(), Error> {
        let mut inner = self.lock();
        inner.reprioritise(id, dependency)
    }

    /// Merge peer SETTINGS. INITIAL_WINDOW_SIZE deltas fan out to every
    /// live stream's send window; a stream whose window would overflow is
    /// closed with FLOW_CONTROL_ERROR while the connection survives.
    ///
    /// Returns the resets to emit and the writer update, both handled by
    /// the caller.
    pub fn apply_remote_settings(
        &self,
        frame: &frame::Settings,
    ) -> (Vec<frame::Reset>, crate::proto::settings::RemoteChanges) {
        let mut resets = Vec::new();
        let mut wake = Vec::new();

        let changes = {
            let mut inner = self.lock();
            let inner = &mut *inner;
            let changes = inner.settings.apply_remote(frame);

            if changes.window_delta != 0 {
                for key in inner.store.keys() {
                    let stream = &mut inner.store[key];
                    if stream.state.is_closed() || stream.state.is_idle() {
                        continue;
                    }

                    if stream.send_flow.apply_delta(changes.window_delta).is_err() {
                        let id = stream.id;
                        inner.close_stream(key, Reason::FLOW_CONTROL_ERROR, &self.active_remote);
                        resets.push(frame::Reset::new(id, Reason::FLOW_CONTROL_ERROR));
                        continue;
                    }

                    if changes.window_delta > 0 {
                        wake.push(inner.store[key].capacity.clone());
                    }
                }
            }

            changes
        };

        for notify in wake {
            notify.notify_one();
        }

        (resets, changes)
    }

    /// The peer acked our SETTINGS.
    pub fn recv_settings_ack(&self) -> Result<(), Error> {
        self.lock().settings.recv_ack()
    }

    pub fn local_max_header_list_size(&self) -> usize {
        self.lock().settings.local_max_header_list_size()
    }

    // ===== worker-side operations =====

    /// Reserve send-window bytes for response data on `key`.
    ///
    /// Returns some positive number of grantable bytes, which may be less
    /// than `requested`; the caller loops. Suspends while neither the
    /// stream nor the connection window can cover a single byte.
    pub async fn reserve_capacity(
        &self,
        key: Key,
        id: StreamId,
        requested: u32,
    ) -> Result<u32, Error> {
        debug_assert!(requested > 0);

        loop {
            let notify = {
                let mut inner = self.lock();
                let inner = &mut *inner;

                let Some(stream) = stream_ref(&inner.store, key, id) else {
                    return Err(UserError::InactiveStreamId.into());
                };
                if !stream.can_write() {
                    return Err(match stream.state.closed_error() {
                        Some(err) => err,
                        None => UserError::InactiveStreamId.into(),
                    });
                }

                match inner.prioritize.try_reserve(&mut inner.store, key, requested) {
                    Reserved::Granted(n) => return Ok(n),
                    Reserved::Wait => inner.store[key].capacity.clone(),
                }
            };

            // The permit-storing notify keeps a wake that lands between
            // dropping the lock and parking from being lost.
            notify.notified().await;
        }
    }

    /// Bookkeeping for response headers going out.
    pub fn send_response(&self, key: Key, id: StreamId, eos: bool) -> Result<(), Error> {
        let mut inner = self.lock();
        let inner = &mut *inner;

        let Some(stream) = stream_mut(&mut inner.store, key, id) else {
            return Err(UserError::InactiveStreamId.into());
        };

        let was_counted = stream.state.is_counted();
        stream.state.send_open(eos).map_err(Error::from)?;

        if eos {
            stream.sent_end_of_stream = true;
            if was_counted && !stream.state.is_counted() {
                self.active_remote.fetch_sub(1, Ordering::Relaxed);
            }
            inner.prioritize.forget(key);
            if inner.store[key].state.is_closed() {
                inner.reclaim_input(key);
            }
        }

        Ok(())
    }

    /// Bookkeeping for a DATA frame going out. Windows were already
    /// consumed by the reservation.
    pub fn sent_data(&self, key: Key, id: StreamId, eos: bool) {
        if !eos {
            return;
        }

        let mut inner = self.lock();
        let inner = &mut *inner;

        let Some(stream) = stream_mut(&mut inner.store, key, id) else {
            return;
        };

        let was_counted = stream.state.is_counted();
        stream.sent_end_of_stream = true;
        stream.state.send_close();

        if was_counted && !stream.state.is_counted() {
            self.active_remote.fetch_sub(1, Ordering::Relaxed);
        }

        inner.prioritize.forget(key);
        if inner.store[key].state.is_closed() {
            inner.reclaim_input(key);
        }
    }

    /// Reset a stream locally. Returns the RST_STREAM to send (a bare reset
    /// even when the stream is unknown), together with any reclaimed
    /// connection-window credit.
    pub fn reset_stream_frames(
        &self,
        id: StreamId,
        reason: Reason,
    ) -> SmallVec<[frame::Frame; 2]> {
        let mut inner = self.lock();
        if let Some(key) = inner.store.find(id) {
            inner.close_stream(key, reason, &self.active_remote);
        }

        let mut frames: SmallVec<[frame::Frame; 2]> = SmallVec::new();
        frames.push(frame::Reset::new(id, reason).into());
        if let Some(refund) = inner.drain_refund() {
            frames.push(refund.into());
        }
        frames
    }

    /// Connection-window credit owed to the peer for request bytes that
    /// were discarded rather than consumed.
    pub fn take_refund(&self) -> Option<frame::WindowUpdate> {
        self.lock().drain_refund()
    }

    /// Reserve a stream for a server push. The stream enters the table in
    /// the reserved (local) state.
    pub fn reserve_push(&self, parent: Key, parent_id: StreamId) -> Result<(StreamId, Key), Error> {
        let mut inner = self.lock();
        let inner = &mut *inner;

        if !inner.settings.remote_push_enabled() {
            return Err(UserError::PeerDisabledServerPush.into());
        }

        match stream_ref(&inner.store, parent, parent_id) {
            Some(stream) if stream.state.is_counted() => {}
            _ => return Err(UserError::InactiveStreamId.into()),
        }

        let id = inner.next_local_id;
        inner.next_local_id = id
            .next_id()
            .map_err(|_| Error::from(UserError::OverflowedStreamId))?;

        let mut stream = Stream::new(
            id,
            inner.settings.remote_initial_window_size(),
            inner.settings.local_initial_window_size(),
        );
        stream
            .state
            .reserve_local()
            .expect("fresh stream not reservable");

        let key = inner.store.insert(id, stream);
        Ok((id, key))
    }

    /// Pull request body bytes for the application.
    ///
    /// Returns `None` at end of stream. Restored window credit comes back
    /// alongside the data; the caller writes it.
    pub async fn read_data(
        &self,
        key: Key,
        id: StreamId,
    ) -> Result<Option<(Bytes, SmallVec<[frame::Frame; 2]>)>, Error> {
        loop {
            let notify = {
                let mut inner = self.lock();
                let inner = &mut *inner;

                let Some(stream) = stream_mut(&mut inner.store, key, id) else {
                    return Err(UserError::InactiveStreamId.into());
                };

                if !stream.recv_buf.is_empty() {
                    let data = stream.recv_buf.split().freeze();
                    let credit = Self::consumed_credit(inner, key, data.len() as u32);
                    return Ok(Some((data, credit)));
                }

                if let Some(err) = stream.state.closed_error() {
                    return Err(err);
                }

                if stream.state.is_recv_end_stream() {
                    return Ok(None);
                }

                stream.data_available.clone()
            };

            notify.notified().await;
        }
    }

    // ===== lifecycle =====

    /// Start a graceful shutdown.
    ///
    /// Returns the first GOAWAY: max stream id and NO_ERROR, telling the
    /// peer to stop opening streams while in-flight ones finish.
    pub fn pause(&self) -> Option<frame::GoAway> {
        let mut inner = self.lock();
        match inner.state {
            ConnState::Connected | ConnState::New => {
                inner.state = ConnState::Pausing;
                inner.paused_at = Some(Instant::now());
                Some(frame::GoAway::new(StreamId::MAX, Reason::NO_ERROR))
            }
            _ => None,
        }
    }

    /// Pausing -> Paused once one round trip has elapsed, re-announcing
    /// with the true highest processed id. Checked opportunistically on
    /// each reader-loop iteration.
    pub fn check_pause(&self, rtt: std::time::Duration) -> Option<frame::GoAway> {
        let mut inner = self.lock();
        if inner.state != ConnState::Pausing {
            return None;
        }

        let since = inner.paused_at?;
        if since.elapsed() < rtt {
            return None;
        }

        inner.state = ConnState::Paused;
        Some(frame::GoAway::new(inner.max_processed_id, Reason::NO_ERROR))
    }

    pub fn new_streams_allowed(&self) -> bool {
        self.lock().state.new_streams_allowed()
    }

    /// Build the GOAWAY for a fatal connection error.
    pub fn goaway(&self, reason: Reason, debug_data: Bytes) -> frame::GoAway {
        let inner = self.lock();
        frame::GoAway::with_debug_data(inner.max_processed_id, reason, debug_data)
    }

    /// Tear down every stream; the connection is over.
    pub fn handle_error(&self, err: &Error) {
        let mut inner = self.lock();
        let inner = &mut *inner;
        inner.state = ConnState::Closed;

        for key in inner.store.keys() {
            let stream = &mut inner.store[key];
            let was_counted = stream.state.is_counted();
            stream.state.handle_error(err);
            inner.prioritize.forget(key);

            let stream = &inner.store[key];
            stream.capacity.notify_one();
            stream.data_available.notify_one();

            if was_counted {
                self.active_remote.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }
}

// ===== impl Inner =====

impl Inner {
    /// Transition every idle peer-initiated id below the newly accepted one
    /// to closed (RFC 7540 section 5.1.1): the peer gave up on them by
    /// skipping past.
    fn close_idle_streams(&mut self, accepted: StreamId) {
        for key in self.store.keys() {
            let stream = &mut self.store[key];
            if stream.id.is_client_initiated()
                && stream.id > self.max_active_remote_id
                && stream.id < accepted
                && stream.state.is_idle()
            {
                stream.state.close_final();
            }
        }
    }

    /// Best-effort sweep of closed streams, toward a cap of
    /// 1.1 x MAX_CONCURRENT_STREAMS.
    ///
    /// Streams that closed straight from idle (priority-tree-only) are held
    /// back as secondary candidates so the tree keeps its shape, and are
    /// only removed when the primary sweep falls short.
    fn prune_closed_streams(&mut self, max_concurrent: u32) {
        let target = (u64::from(max_concurrent) * 11).div_ceil(10);
        let target = usize::try_from(target).unwrap_or(usize::MAX);

        if self.store.len() <= target {
            return;
        }

        let mut over = self.store.len() - target;
        let mut held_back = Vec::new();

        for key in self.store.keys() {
            if over == 0 {
                break;
            }

            let stream = &self.store[key];
            if !stream.is_prunable() {
                continue;
            }

            if stream.state.is_closed_final() {
                held_back.push(key);
                continue;
            }

            self.remove_stream(key);
            over -= 1;
        }

        for key in held_back {
            if over == 0 {
                break;
            }
            self.remove_stream(key);
            over -= 1;
        }

        if over > 0 {
            tracing::debug!(
                "prune fell short of target; streams={} target={}",
                self.store.len(),
                target
            );
        }
    }

    fn remove_stream(&mut self, key: Key) {
        self.prioritize.forget(key);

        let parent = self.store[key].parent;
        if let Some(parent) = parent {
            self.store[parent].children.retain(|&child| child != key);
        }

        let stream = self.store.remove(key);
        tracing::trace!("pruned stream {:?}", stream.id);
    }

    /// Close a stream locally: record the reset, drop its backlog state,
    /// wake anything suspended on it, fix the concurrency count, reclaim
    /// unread input.
    fn close_stream(&mut self, key: Key, reason: Reason, active_remote: &AtomicU32) {
        let stream = &mut self.store[key];
        let was_counted = stream.state.is_counted();
        let id = stream.id;
        stream.state.set_reset(id, reason);

        self.prioritize.forget(key);
        self.reclaim_input(key);

        let stream = &self.store[key];
        stream.capacity.notify_one();
        stream.data_available.notify_one();

        if was_counted {
            active_remote.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Request bytes buffered on a closed stream will never be consumed;
    /// their connection-window credit goes back to the peer.
    fn reclaim_input(&mut self, key: Key) {
        let stream = &mut self.store[key];
        let n = stream.recv_buf.len() as u32;
        if n == 0 {
            return;
        }

        stream.recv_buf.clear();
        let _ = self.recv_flow.increase(n);
        self.window_refund += n;
    }

    fn drain_refund(&mut self) -> Option<frame::WindowUpdate> {
        if self.window_refund == 0 {
            return None;
        }
        let n = std::mem::take(&mut self.window_refund);
        Some(frame::WindowUpdate::new(StreamId::zero(), n))
    }

    /// Move a stream in the priority tree.
    fn reprioritise(&mut self, id: StreamId, dependency: StreamDependency) -> Result<(), Error> {
        // PRIORITY may name streams in any state, including ones that do
        // not exist yet; those are created idle and live only in the tree.
        let key = self.find_or_create_tree_stream(id)?;

        let new_parent = if dependency.dependency_id().is_zero() {
            None
        } else {
            Some(self.find_or_create_tree_stream(dependency.dependency_id())?)
        };

        // A dependency on a descendant would cycle; the descendant is first
        // moved up to take this stream's old place (RFC 7540 section 5.3.3).
        if let Some(new_parent) = new_parent {
            if self.is_descendant(key, new_parent) {
                let old_parent = self.store[key].parent;
                self.detach(new_parent);
                self.attach(new_parent, old_parent);
            }
        }

        self.detach(key);

        if dependency.is_exclusive() {
            // The stream adopts all of the parent's current children.
            let siblings = match new_parent {
                Some(parent) => std::mem::take(&mut self.store[parent].children),
                None => {
                    let orphans: Vec<Key> = self
                        .store
                        .keys()
                        .into_iter()
                        .filter(|&k| k != key && self.store[k].parent.is_none())
                        .collect();
                    orphans
                }
            };

            for sibling in siblings {
                self.detach(sibling);
                self.attach(sibling, Some(key));
            }
        }

        self.attach(key, new_parent);
        self.store[key].weight = dependency.weight();

        Ok(())
    }

    fn find_or_create_tree_stream(&mut self, id: StreamId) -> Result<Key, Error> {
        if let Some(key) = self.store.find(id) {
            return Ok(key);
        }

        let stream = Stream::new(
            id,
            self.settings.remote_initial_window_size(),
            self.settings.local_initial_window_size(),
        );
        Ok(self.store.insert(id, stream))
    }

    fn is_descendant(&self, ancestor: Key, candidate: Key) -> bool {
        let mut at = self.store[candidate].parent;
        while let Some(key) = at {
            if key == ancestor {
                return true;
            }
            at = self.store[key].parent;
        }
        false
    }

    fn detach(&mut self, key: Key) {
        if let Some(parent) = self.store[key].parent.take() {
            self.store[parent].children.retain(|&child| child != key);
        }
    }

    fn attach(&mut self, key: Key, parent: Option<Key>) {
        self.store[key].parent = parent;
        if let Some(parent) = parent {
            self.store[parent].children.push(key);
        }
    }
}

/// Resolve a worker-held handle. The slot may have been pruned and reused,
/// so the stream id is double-checked.
fn stream_ref(store: &Store, key: Key, id: StreamId) -> Option<&Stream> {
    store.get(key).filter(|stream| stream.id == id)
}

fn stream_mut(store: &mut Store, key: Key, id: StreamId) -> Option<&mut Stream> {
    store.get_mut(key).filter(|stream| stream.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streams(max_concurrent: u32) -> Streams {
        let mut settings = frame::Settings::default();
        settings.set_max_concurrent_streams(Some(max_concurrent));
        Streams::new(Config {
            local_settings: settings,
            max_concurrent_stream_execution: max_concurrent,
        })
    }

    fn open(streams: &Streams, id: u32) -> Key {
        match streams.recv_headers_start(StreamId::from(id), false).unwrap() {
            RecvHeaders::Open { key } => key,
            other => panic!("stream {id} not admitted: {other:?}"),
        }
    }

    /// Open a stream whose request ended at the headers, then complete the
    /// response: the stream is fully closed afterwards.
    fn open_and_finish(streams: &Streams, id: u32) {
        let key = match streams.recv_headers_start(StreamId::from(id), true).unwrap() {
            RecvHeaders::Open { key } => key,
            other => panic!("stream {id} not admitted: {other:?}"),
        };
        streams.send_response(key, StreamId::from(id), true).unwrap();
    }

    #[test]
    fn ids_must_be_odd_and_increasing() {
        let streams = streams(100);
        streams.connect();

        open(&streams, 1);
        open(&streams, 5);

        // Even id.
        assert!(matches!(
            streams.recv_headers_start(StreamId::from(4), false),
            Err(Error::GoAway(_, Reason::PROTOCOL_ERROR, _))
        ));

        // Reused id, including one that was skipped over.
        for old in [1u32, 3, 5] {
            assert!(matches!(
                streams.recv_headers_start(StreamId::from(old), false),
                Err(Error::GoAway(_, Reason::PROTOCOL_ERROR, _))
            ));
        }
    }

    #[test]
    fn skipped_ids_close_idle_priority_streams() {
        let streams = streams(100);
        streams.connect();

        // Stream 5 exists only in the priority tree.
        streams
            .recv_priority(
                StreamId::from(5),
                StreamDependency::new(StreamId::zero(), 100, false),
            )
            .unwrap();

        // Accepting stream 7 sweeps 5 from idle to closed.
        open(&streams, 7);

        let inner = streams.lock();
        let key = inner.store.find(StreamId::from(5)).unwrap();
        assert!(inner.store[key].state.is_closed_final());
    }

    #[test]
    fn admission_cap_refuses_stream_scope() {
        let streams = streams(2);
        streams.connect();

        open(&streams, 1);
        open(&streams, 3);
        assert_eq!(streams.active_remote_count(), 2);

        // Third concurrent stream: refused, connection survives.
        match streams.recv_headers_start(StreamId::from(5), false) {
            Err(Error::Reset(id, Reason::REFUSED_STREAM, _)) => {
                assert_eq!(id, StreamId::from(5));
            }
            other => panic!("expected REFUSED_STREAM, got {other:?}"),
        }
        assert_eq!(streams.active_remote_count(), 2);

        // A later stream is admitted once one closes.
        let frames = streams.reset_stream_frames(StreamId::from(1), Reason::CANCEL);
        assert!(matches!(
            frames[0],
            frame::Frame::Reset(ref reset) if reset.reason() == Reason::CANCEL
        ));
        assert_eq!(streams.active_remote_count(), 1);
        open(&streams, 7);
    }

    #[test]
    fn pausing_refuses_new_streams() {
        let streams = streams(100);
        streams.connect();
        open(&streams, 1);

        let goaway = streams.pause().unwrap();
        assert_eq!(goaway.last_stream_id(), StreamId::MAX);
        assert_eq!(goaway.reason(), Reason::NO_ERROR);

        match streams.recv_headers_start(StreamId::from(3), false).unwrap() {
            RecvHeaders::Swallow { reset: Some(reset) } => {
                assert_eq!(reset.reason(), Reason::REFUSED_STREAM);
            }
            other => panic!("expected refusal, got {other:?}"),
        }

        // One round trip later the second GOAWAY carries the real id.
        streams.mark_processed(StreamId::from(1));
        let goaway = streams.check_pause(std::time::Duration::ZERO).unwrap();
        assert_eq!(goaway.last_stream_id(), StreamId::from(1));

        // Paused: swallowed without an RST.
        match streams.recv_headers_start(StreamId::from(5), false).unwrap() {
            RecvHeaders::Swallow { reset: None } => {}
            other => panic!("expected swallow, got {other:?}"),
        }
    }

    #[test]
    fn settings_fanout_applies_delta_to_live_streams() {
        let streams = streams(100);
        streams.connect();
        let k1 = open(&streams, 1);
        let k3 = open(&streams, 3);

        let mut frame = frame::Settings::default();
        frame.set_initial_window_size(Some(100));
        let (resets, changes) = streams.apply_remote_settings(&frame);
        assert!(resets.is_empty());
        assert_eq!(changes.window_delta, 100 - 65_535);

        let inner = streams.lock();
        assert_eq!(inner.store[k1].send_flow.window_size(), 100);
        assert_eq!(inner.store[k3].send_flow.window_size(), 100);
    }

    #[test]
    fn settings_fanout_overflow_closes_stream_only() {
        let streams = streams(100);
        streams.connect();
        let k1 = open(&streams, 1);

        // Push the stream window near the top, then grow the initial window.
        {
            let mut inner = streams.lock();
            inner.store[k1]
                .send_flow
                .increase((1u32 << 31) - 1 - 65_535)
                .unwrap();
        }

        let mut frame = frame::Settings::default();
        frame.set_initial_window_size(Some(70_000));
        let (resets, _) = streams.apply_remote_settings(&frame);

        assert_eq!(resets.len(), 1);
        assert_eq!(resets[0].stream_id(), StreamId::from(1));
        assert_eq!(resets[0].reason(), Reason::FLOW_CONTROL_ERROR);

        let inner = streams.lock();
        assert!(inner.store[k1].state.is_reset());
    }

    #[test]
    fn prune_spares_active_and_holds_back_tree_only_streams() {
        let streams = streams(2);
        streams.connect();

        // A tree-only stream (never carried a request).
        streams
            .recv_priority(
                StreamId::from(9),
                StreamDependency::new(StreamId::zero(), 10, false),
            )
            .unwrap();

        // Streams 1, 3, 5 run to completion.
        for id in [1u32, 3, 5] {
            open_and_finish(&streams, id);
        }

        // Accepting stream 11 sweeps tree-only 9 from idle to closed-final.
        let active = open(&streams, 11);

        // Sweep target for max_concurrent=2 is ceil(2.2) = 3 streams; the
        // store holds 5. The two removals come from the plainly closed
        // streams; closed-final 9 is held back and the active stream is
        // untouchable.
        {
            let mut inner = streams.lock();
            inner.prune_closed_streams(2);
            assert_eq!(inner.store.len(), 3);
            assert!(inner.store.find(StreamId::from(9)).is_some());
            assert!(inner.store.get(active).is_some());
        }
    }

    #[test]
    fn stale_key_does_not_resolve() {
        let streams = streams(100);
        streams.connect();
        let k1 = open(&streams, 1);
        streams.send_response(k1, StreamId::from(1), true).unwrap();

        {
            let mut inner = streams.lock();
            inner.remove_stream(k1);
        }

        assert!(matches!(
            streams.send_response(k1, StreamId::from(1), false),
            Err(Error::User(UserError::InactiveStreamId))
        ));
    }

    #[test]
    fn exclusive_reprioritise_adopts_siblings() {
        let streams = streams(100);
        streams.connect();
        let k1 = open(&streams, 1);
        let k3 = open(&streams, 3);
        let k5 = open(&streams, 5);

        // Stream 5 becomes the sole child of the root; 1 and 3 move under
        // it.
        streams
            .recv_priority(
                StreamId::from(5),
                StreamDependency::new(StreamId::zero(), 31, true),
            )
            .unwrap();

        let inner = streams.lock();
        assert_eq!(inner.store[k5].parent, None);
        assert_eq!(inner.store[k5].weight, 31);
        assert_eq!(inner.store[k1].parent, Some(k5));
        assert_eq!(inner.store[k3].parent, Some(k5));
        let mut children = inner.store[k5].children.clone();
        children.sort_by_key(|k| u32::from(inner.store[*k].id));
        assert_eq!(children, vec![k1, k3]);
    }

    #[test]
    fn dependency_cycle_is_broken() {
        let streams = streams(100);
        streams.connect();
        let k1 = open(&streams, 1);
        let k3 = open(&streams, 3);

        // 3 depends on 1, then 1 depends on 3: 3 must first move up to 1's
        // old parent (the root).
        streams
            .recv_priority(
                StreamId::from(3),
                StreamDependency::new(StreamId::from(1), 15, false),
            )
            .unwrap();
        streams
            .recv_priority(
                StreamId::from(1),
                StreamDependency::new(StreamId::from(3), 15, false),
            )
            .unwrap();

        let inner = streams.lock();
        assert_eq!(inner.store[k3].parent, None);
        assert_eq!(inner.store[k1].parent, Some(k3));
        assert!(inner.store[k1].children.is_empty());
        assert_eq!(inner.store[k3].children, vec![k1]);
    }
}
