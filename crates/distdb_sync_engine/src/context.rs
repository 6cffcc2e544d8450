//! Per-peer exchange state.

use std::collections::VecDeque;

use distdb_codec::{negotiate, SOFTWARE_VERSION_BASE};
use distdb_storage::{ContinueToken, SecurityOption, SyncStorage};
use distdb_sync_protocol::{SyncCode, SyncMode};

/// A pull the peer asked this device to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseTarget {
    /// Exclusive upper bound of the records to return, in local time.
    pub end_water_mark: u64,
    /// Session of the peer's request; responses are sent on it.
    pub session_id: u32,
}

/// Identifies an already sent fragment so it can be sent again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReSendInfo {
    /// Smallest timestamp of the fragment.
    pub start: u64,
    /// Largest timestamp of the fragment.
    pub end: u64,
    /// Session the fragment was sent on.
    pub session_id: u32,
    /// Transport sequence id of the fragment.
    pub sequence_id: u32,
    /// Packet id of the fragment.
    pub packet_id: u64,
}

/// Direction a watchdog feed applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedDirection {
    /// Waiting for the peer to acknowledge a large send.
    Send,
    /// Waiting for the peer to finish saving a large batch.
    Receive,
}

/// State of one synchronization relationship with a peer device.
///
/// The context is owned by a single engine and only touched while that
/// engine holds its lock.
#[derive(Debug)]
pub struct SyncTaskContext {
    pub(crate) device_id: String,
    pub(crate) mode: SyncMode,
    pub(crate) remote_version: u32,
    pub(crate) need_retry: bool,
    pub(crate) continue_token: Option<ContinueToken>,
    pub(crate) end_mark: u64,
    pub(crate) request_session_id: u32,
    pub(crate) response_session_id: u32,
    pub(crate) sequence_id: u32,
    pub(crate) packet_id: u64,
    pub(crate) session_end_timestamp: u64,
    pub(crate) sequence_start_timestamp: u64,
    pub(crate) sequence_end_timestamp: u64,
    pub(crate) task_error: Option<SyncCode>,
    pub(crate) receive_permit_checked: bool,
    pub(crate) send_permit_checked: bool,
    pub(crate) remote_security_option: Option<SecurityOption>,
    pub(crate) receive_water_mark_err: bool,
    pub(crate) response_targets: VecDeque<ResponseTarget>,
    pub(crate) send_feed: Option<u32>,
    pub(crate) receive_feed: Option<u32>,
    pub(crate) in_flight: Option<ReSendInfo>,
}

impl SyncTaskContext {
    /// Creates a context for `device_id` whose software version is not yet known.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            mode: SyncMode::Push,
            remote_version: 0,
            need_retry: false,
            continue_token: None,
            end_mark: 0,
            request_session_id: 0,
            response_session_id: 0,
            sequence_id: 0,
            packet_id: 0,
            session_end_timestamp: 0,
            sequence_start_timestamp: 0,
            sequence_end_timestamp: 0,
            task_error: None,
            receive_permit_checked: false,
            send_permit_checked: false,
            remote_security_option: None,
            receive_water_mark_err: false,
            response_targets: VecDeque::new(),
            send_feed: None,
            receive_feed: None,
            in_flight: None,
        }
    }

    /// Peer device.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Mode of the running target.
    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Peer software version, 0 when unknown.
    pub fn remote_version(&self) -> u32 {
        self.remote_version
    }

    /// Records the peer software version.
    pub fn set_remote_version(&mut self, version: u32) {
        self.remote_version = version;
    }

    /// Returns true once the peer version has been negotiated.
    pub fn is_version_known(&self) -> bool {
        self.remote_version > SOFTWARE_VERSION_BASE
    }

    /// Working protocol version with the peer.
    pub fn version(&self) -> u32 {
        negotiate(self.remote_version)
    }

    /// Upper bound of the running scan.
    pub fn end_mark(&self) -> u64 {
        self.end_mark
    }

    /// Session of requests this device initiates.
    pub fn request_session_id(&self) -> u32 {
        self.request_session_id
    }

    /// Session of the pull this device is answering.
    pub fn response_session_id(&self) -> u32 {
        self.response_session_id
    }

    /// Current transport sequence id.
    pub fn sequence_id(&self) -> u32 {
        self.sequence_id
    }

    pub(crate) fn next_sequence_id(&mut self) -> u32 {
        self.sequence_id = self.sequence_id.wrapping_add(1);
        self.sequence_id
    }

    /// Last packet id handed out.
    pub fn packet_id(&self) -> u64 {
        self.packet_id
    }

    pub(crate) fn next_packet_id(&mut self) -> u64 {
        self.packet_id += 1;
        self.packet_id
    }

    /// Largest timestamp of the final fragment of the current session.
    pub fn session_end_timestamp(&self) -> u64 {
        self.session_end_timestamp
    }

    /// Timestamp range of the last sent fragment.
    pub fn sequence_range(&self) -> (u64, u64) {
        (self.sequence_start_timestamp, self.sequence_end_timestamp)
    }

    pub(crate) fn set_sequence_range(&mut self, start: u64, end: u64) {
        self.sequence_start_timestamp = start;
        self.sequence_end_timestamp = end;
    }

    /// Error recorded against the running task.
    pub fn task_error(&self) -> Option<SyncCode> {
        self.task_error
    }

    /// Returns true if a scan is still open.
    pub fn has_continue_token(&self) -> bool {
        self.continue_token.is_some()
    }

    /// Returns true if the next read must restart from the local watermark.
    pub fn need_retry(&self) -> bool {
        self.need_retry
    }

    /// Security option the peer declared during ability negotiation.
    pub fn remote_security_option(&self) -> Option<SecurityOption> {
        self.remote_security_option
    }

    /// Records the peer's declared security option.
    pub fn set_remote_security_option(&mut self, option: SecurityOption) {
        self.remote_security_option = Some(option);
        self.send_permit_checked = false;
        self.receive_permit_checked = false;
    }

    /// Returns true if the last request was answered with a watermark exception.
    pub fn receive_water_mark_err(&self) -> bool {
        self.receive_water_mark_err
    }

    /// Pending watchdog feed, in milliseconds.
    pub fn feed(&self, direction: FeedDirection) -> Option<u32> {
        match direction {
            FeedDirection::Send => self.send_feed,
            FeedDirection::Receive => self.receive_feed,
        }
    }

    pub(crate) fn start_feed(&mut self, direction: FeedDirection, millis: u32) {
        match direction {
            FeedDirection::Send => self.send_feed = Some(millis),
            FeedDirection::Receive => self.receive_feed = Some(millis),
        }
    }

    pub(crate) fn stop_feed(&mut self, direction: FeedDirection) {
        match direction {
            FeedDirection::Send => self.send_feed = None,
            FeedDirection::Receive => self.receive_feed = None,
        }
    }

    /// Last data fragment handed to the communicator.
    pub fn in_flight(&self) -> Option<ReSendInfo> {
        self.in_flight
    }

    /// Pulls waiting to be answered.
    pub fn pending_response_targets(&self) -> usize {
        self.response_targets.len()
    }

    pub(crate) fn release_continue_token(&mut self, storage: &dyn SyncStorage) {
        if let Some(token) = self.continue_token.take() {
            storage.release_continue_token(token);
        }
    }

    /// Resets the per-task fields before a new target runs.
    pub(crate) fn begin_target(&mut self, mode: SyncMode, end_mark: u64) {
        self.mode = mode;
        self.end_mark = end_mark;
        self.need_retry = false;
        self.session_end_timestamp = 0;
        self.task_error = None;
        self.send_feed = None;
        self.receive_feed = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use distdb_codec::{SOFTWARE_VERSION_CURRENT, SOFTWARE_VERSION_RELEASE_2_0};
    use distdb_storage::{DataSizeSpec, MemorySyncStore, SecurityLabel};

    #[test]
    fn new_context_is_unnegotiated() {
        let ctx = SyncTaskContext::new("device-b");
        assert_eq!(ctx.device_id(), "device-b");
        assert!(!ctx.is_version_known());
        assert_eq!(ctx.packet_id(), 0);
        assert!(!ctx.has_continue_token());
    }

    #[test]
    fn version_is_capped() {
        let mut ctx = SyncTaskContext::new("device-b");
        ctx.set_remote_version(SOFTWARE_VERSION_CURRENT + 4);
        assert_eq!(ctx.version(), SOFTWARE_VERSION_CURRENT);
        ctx.set_remote_version(SOFTWARE_VERSION_RELEASE_2_0);
        assert_eq!(ctx.version(), SOFTWARE_VERSION_RELEASE_2_0);
    }

    #[test]
    fn packet_ids_start_at_one() {
        let mut ctx = SyncTaskContext::new("device-b");
        assert_eq!(ctx.next_packet_id(), 1);
        assert_eq!(ctx.next_packet_id(), 2);
    }

    #[test]
    fn security_option_resets_cached_checks() {
        let mut ctx = SyncTaskContext::new("device-b");
        ctx.send_permit_checked = true;
        ctx.receive_permit_checked = true;
        ctx.set_remote_security_option(SecurityOption::new(SecurityLabel::S2));
        assert!(!ctx.send_permit_checked);
        assert!(!ctx.receive_permit_checked);
    }

    #[test]
    fn releasing_token_frees_store_cursor() {
        let store = MemorySyncStore::default();
        for ts in 1..=3 {
            store.put_at(vec![ts as u8], b"v".to_vec(), ts).unwrap();
        }
        let batch = store.get_sync_data(0, 10, DataSizeSpec::new(1024, 1)).unwrap();
        let mut ctx = SyncTaskContext::new("device-b");
        ctx.continue_token = batch.token;
        assert_eq!(store.open_token_count(), 1);

        ctx.release_continue_token(&store);
        assert!(!ctx.has_continue_token());
        assert_eq!(store.open_token_count(), 0);
    }

    #[test]
    fn feeds_per_direction() {
        let mut ctx = SyncTaskContext::new("device-b");
        ctx.start_feed(FeedDirection::Send, 100);
        assert_eq!(ctx.feed(FeedDirection::Send), Some(100));
        assert_eq!(ctx.feed(FeedDirection::Receive), None);
        ctx.stop_feed(FeedDirection::Send);
        assert_eq!(ctx.feed(FeedDirection::Send), None);
    }
}
