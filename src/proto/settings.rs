use crate::frame::{
    self, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE, Reason,
};
use crate::proto::Error;

/// Local (sent to the peer) and remote (received from the peer) settings,
/// with ack tracking for the local side.
#[derive(Debug)]
pub struct SettingsPair {
    /// The values this endpoint advertised during the handshake.
    local: frame::Settings,

    /// Our local SETTINGS sync state with the remote.
    sync: Sync,

    /// Effective values received from the peer, defaults filled in.
    remote: Remote,
}

#[derive(Debug, Eq, PartialEq)]
enum Sync {
    /// We have sent our SETTINGS and are waiting for the remote to ACK.
    WaitingAck,
    /// Our local settings are in sync with the remote.
    Synced,
}

#[derive(Debug)]
struct Remote {
    initial_window_size: u32,
    max_frame_size: u32,
    max_concurrent_streams: Option<u32>,
    enable_push: bool,
    header_table_size: Option<u32>,
}

/// Remote settings changes that other components have to act on.
#[derive(Debug, Default)]
pub struct RemoteChanges {
    /// Signed INITIAL_WINDOW_SIZE delta, to fan out to every live stream's
    /// send window.
    pub window_delta: i64,

    /// New SETTINGS_MAX_FRAME_SIZE for the writer.
    pub max_frame_size: Option<u32>,

    /// New SETTINGS_HEADER_TABLE_SIZE for the writer's encoder.
    pub header_table_size: Option<u32>,
}

impl SettingsPair {
    /// The local SETTINGS frame is assumed to have been flushed during the
    /// handshake, so ack tracking starts in the waiting state.
    pub fn new(local: frame::Settings) -> SettingsPair {
        SettingsPair {
            local,
            sync: Sync::WaitingAck,
            remote: Remote {
                initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
                max_frame_size: DEFAULT_MAX_FRAME_SIZE,
                max_concurrent_streams: None,
                enable_push: true,
                header_table_size: None,
            },
        }
    }

    /// Merge a SETTINGS frame received from the peer, returning the changes
    /// that need fanout. The caller acks on the wire.
    pub fn apply_remote(&mut self, frame: &frame::Settings) -> RemoteChanges {
        debug_assert!(!frame.is_ack());

        let mut changes = RemoteChanges::default();

        if let Some(val) = frame.initial_window_size() {
            changes.window_delta = i64::from(val) - i64::from(self.remote.initial_window_size);
            self.remote.initial_window_size = val;
        }

        if let Some(val) = frame.max_frame_size() {
            self.remote.max_frame_size = val;
            changes.max_frame_size = Some(val);
        }

        if let Some(val) = frame.max_concurrent_streams() {
            self.remote.max_concurrent_streams = Some(val);
        }

        if let Some(enabled) = frame.is_push_enabled() {
            self.remote.enable_push = enabled;
        }

        if let Some(val) = frame.header_table_size() {
            self.remote.header_table_size = Some(val);
            changes.header_table_size = Some(val);
        }

        changes
    }

    /// The peer acked our SETTINGS.
    pub fn recv_ack(&mut self) -> Result<(), Error> {
        match self.sync {
            Sync::WaitingAck => {
                tracing::debug!("received settings ACK; local settings in sync");
                self.sync = Sync::Synced;
                Ok(())
            }
            Sync::Synced => {
                // We haven't sent any SETTINGS frames to be ACKed, so
                // this is very bizarre! Remote is either buggy or malicious.
                proto_err!(conn: "received unexpected settings ack");
                Err(Error::library_go_away(Reason::PROTOCOL_ERROR))
            }
        }
    }

    pub fn is_synced(&self) -> bool {
        self.sync == Sync::Synced
    }

    // ===== local advertisement =====

    pub fn local_max_concurrent_streams(&self) -> u32 {
        self.local.max_concurrent_streams().unwrap_or(u32::MAX)
    }

    pub fn local_initial_window_size(&self) -> u32 {
        self.local
            .initial_window_size()
            .unwrap_or(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    pub fn local_max_header_list_size(&self) -> usize {
        // 16 MB "sane default" taken from golang http2
        const DEFAULT: usize = 16 << 20;
        self.local
            .max_header_list_size()
            .map(|v| v as usize)
            .unwrap_or(DEFAULT)
    }

    // ===== remote values =====

    pub fn remote_initial_window_size(&self) -> u32 {
        self.remote.initial_window_size
    }

    pub fn remote_push_enabled(&self) -> bool {
        self.remote.enable_push
    }
}
