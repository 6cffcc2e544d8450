//! Per-peer sync state machine.

use std::sync::Arc;
use std::time::Instant;

use distdb_storage::{short_device_id, SecurityOption, SyncStorage};
use distdb_sync_protocol::{Message, MessageHeader, MessageType, SyncCode, SyncMode};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::access::{AccessControl, AllowAll};
use crate::clock::{Clock, SystemClock};
use crate::communicator::Communicator;
use crate::config::SyncConfig;
use crate::context::{FeedDirection, ResponseTarget, SyncTaskContext};
use crate::data_sync::{AckStep, DataSync, DataSyncParts, RecvStep};
use crate::error::{SyncError, SyncResult};
use crate::metadata::{MemoryMetadata, Metadata};

/// The current state of a sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No exchange is running.
    Idle,
    /// A data packet is waiting for its acknowledgement.
    RequestSent,
    /// An acknowledgement is being processed.
    AckReceived,
    /// Everything was sent; the peer's data is still expected.
    WaitForRemoteData,
    /// A fragment is being sent again.
    Resend,
    /// The last exchange timed out.
    Timeout,
}

impl SyncState {
    /// Returns true if an exchange is in progress.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::RequestSent
                | SyncState::AckReceived
                | SyncState::WaitForRemoteData
                | SyncState::Resend
        )
    }

    /// Returns true if a new exchange can start.
    pub fn can_start_sync(&self) -> bool {
        matches!(self, SyncState::Idle | SyncState::Timeout)
    }
}

/// How a sync task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Both directions of a push-pull completed.
    Finished,
    /// A push delivered every record.
    SendFinished,
    /// A pull received every record.
    RecvFinished,
    /// The peer or the local policy refused the exchange.
    PermissionCheckFailed,
    /// The peer speaks an unsupported protocol version.
    VersionNotSupported,
    /// The exchange failed with a code.
    Failed(SyncCode),
    /// The exchange timed out.
    Timeout,
    /// The exchange was cancelled.
    Cancelled,
}

impl SyncStatus {
    fn completed(mode: SyncMode) -> Self {
        match mode {
            SyncMode::Push => SyncStatus::SendFinished,
            SyncMode::Pull => SyncStatus::RecvFinished,
            SyncMode::PushAndPull | SyncMode::ResponsePull => SyncStatus::Finished,
        }
    }

    fn from_error(err: &SyncError) -> Self {
        match err {
            SyncError::NotPermit => SyncStatus::PermissionCheckFailed,
            SyncError::VersionNotSupported { .. } => SyncStatus::VersionNotSupported,
            SyncError::Timeout => SyncStatus::Timeout,
            SyncError::Cancelled => SyncStatus::Cancelled,
            other => SyncStatus::Failed(other.code()),
        }
    }

    /// Returns true for a successful outcome.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            SyncStatus::Finished | SyncStatus::SendFinished | SyncStatus::RecvFinished
        )
    }
}

/// Final report of a sync task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Peer device.
    pub device: String,
    /// Mode the task ran in.
    pub mode: SyncMode,
    /// How it ended.
    pub status: SyncStatus,
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Tasks started with [`SyncEngine::start`].
    pub sessions_started: u64,
    /// Tasks that completed.
    pub sessions_completed: u64,
    /// Tasks that failed, timed out or were cancelled.
    pub sessions_failed: u64,
    /// Data requests received.
    pub requests_received: u64,
    /// Acknowledgements received.
    pub acks_received: u64,
    /// Fragments sent again.
    pub resends: u64,
    /// Last completed task.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct InitiatorTask {
    mode: SyncMode,
    end_mark: u64,
    send_finished: bool,
    recv_finished: bool,
    // the first packet went out and later pages are plain pushes
    remainder: bool,
}

#[derive(Debug)]
struct EngineInner {
    ctx: SyncTaskContext,
    task: Option<InitiatorTask>,
    responding: bool,
}

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    device_id: String,
    storage: Arc<dyn SyncStorage>,
    communicator: Arc<dyn Communicator>,
    config: SyncConfig,
    metadata: Option<Arc<dyn Metadata>>,
    access: Option<Arc<dyn AccessControl>>,
    clock: Option<Arc<dyn Clock>>,
    remote_version: u32,
    remote_security_option: Option<SecurityOption>,
}

impl SyncEngineBuilder {
    /// Sets the engine configuration.
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses `metadata` for the watermarks instead of a private in-memory store.
    pub fn with_metadata(mut self, metadata: Arc<dyn Metadata>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Sets the access policy. Everything is permitted by default.
    pub fn with_access_control(mut self, access: Arc<dyn AccessControl>) -> Self {
        self.access = Some(access);
        self
    }

    /// Sets the local clock. Wall time is used by default.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets the peer software version learned from ability negotiation.
    pub fn with_remote_version(mut self, version: u32) -> Self {
        self.remote_version = version;
        self
    }

    /// Sets the peer security option learned from ability negotiation.
    pub fn with_remote_security_option(mut self, option: SecurityOption) -> Self {
        self.remote_security_option = Some(option);
        self
    }

    /// Builds the engine.
    pub fn build(self) -> SyncEngine {
        let mut ctx = SyncTaskContext::new(self.device_id);
        ctx.set_remote_version(self.remote_version);
        if let Some(option) = self.remote_security_option {
            ctx.set_remote_security_option(option);
        }
        let parts = DataSyncParts {
            storage: self.storage,
            communicator: self.communicator,
            metadata: self
                .metadata
                .unwrap_or_else(|| Arc::new(MemoryMetadata::new())),
            access: self.access.unwrap_or_else(|| Arc::new(AllowAll)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        };
        SyncEngine {
            sync: DataSync::new(parts, self.config),
            inner: Mutex::new(EngineInner {
                ctx,
                task: None,
                responding: false,
            }),
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            outcomes: Mutex::new(None),
        }
    }
}

/// Drives data sync with one peer device.
///
/// The engine runs at most one task of its own (push, pull or push-pull) and
/// answers the peer's pulls once its own sending is done. Messages from the
/// peer are fed in through [`on_message`](Self::on_message); finished tasks
/// are reported through [`subscribe`](Self::subscribe).
pub struct SyncEngine {
    sync: DataSync,
    inner: Mutex<EngineInner>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    outcomes: Mutex<Option<UnboundedSender<SyncOutcome>>>,
}

impl SyncEngine {
    /// Starts building an engine that syncs `storage` with `peer`.
    pub fn builder(
        peer: impl Into<String>,
        storage: Arc<dyn SyncStorage>,
        communicator: Arc<dyn Communicator>,
    ) -> SyncEngineBuilder {
        SyncEngineBuilder {
            device_id: peer.into(),
            storage,
            communicator,
            config: SyncConfig::default(),
            metadata: None,
            access: None,
            clock: None,
            remote_version: 0,
            remote_security_option: None,
        }
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Peer device.
    pub fn device_id(&self) -> String {
        self.inner.lock().ctx.device_id().to_string()
    }

    /// Engine configuration.
    pub fn config(&self) -> &SyncConfig {
        self.sync.config()
    }

    /// Watermark store of this engine.
    pub fn metadata(&self) -> Arc<dyn Metadata> {
        self.sync.metadata().clone()
    }

    /// Routes task outcomes to the returned receiver, replacing any earlier one.
    pub fn subscribe(&self) -> UnboundedReceiver<SyncOutcome> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outcomes.lock() = Some(tx);
        rx
    }

    /// Runs `f` against the exchange context.
    pub fn with_context<R>(&self, f: impl FnOnce(&SyncTaskContext) -> R) -> R {
        f(&self.inner.lock().ctx)
    }

    /// Records the peer software version after ability negotiation.
    pub fn set_remote_version(&self, version: u32) {
        self.inner.lock().ctx.set_remote_version(version);
    }

    /// Records the peer security option after ability negotiation.
    pub fn set_remote_security_option(&self, option: SecurityOption) {
        self.inner.lock().ctx.set_remote_security_option(option);
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    fn emit(&self, outcome: SyncOutcome) {
        if let Some(tx) = self.outcomes.lock().as_ref() {
            let _ = tx.send(outcome);
        }
    }

    fn record_error(&self, err: &SyncError) {
        self.stats.write().last_error = Some(err.to_string());
    }

    fn next_end_mark(&self) -> u64 {
        let max_timestamp = self.sync.storage().get_max_timestamp();
        self.sync.now().max(max_timestamp).saturating_add(1)
    }

    fn release_token(&self, ctx: &mut SyncTaskContext) {
        ctx.release_continue_token(self.sync.storage().as_ref());
    }

    fn run_start_step(&self, ctx: &mut SyncTaskContext, mode: SyncMode) -> SyncResult<()> {
        match mode {
            SyncMode::Push => self.sync.push_start(ctx),
            SyncMode::Pull => self.sync.pull_request_start(ctx),
            SyncMode::PushAndPull => self.sync.push_pull_start(ctx),
            SyncMode::ResponsePull => self.sync.pull_response_start(ctx),
        }
    }

    /// Starts a task in `mode`.
    ///
    /// # Errors
    ///
    /// Fails when another task or a pull response is running, when `mode` is
    /// [`SyncMode::ResponsePull`], when the peer version has not been
    /// negotiated, or when the first packet cannot be sent.
    pub fn start(&self, mode: SyncMode) -> SyncResult<()> {
        let state = self.state();
        let mut inner = self.inner.lock();
        if mode == SyncMode::ResponsePull
            || !state.can_start_sync()
            || inner.task.is_some()
            || inner.responding
        {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{state:?}"),
                to: mode.to_string(),
            });
        }
        if !inner.ctx.is_version_known() {
            warn!(device = %short_device_id(inner.ctx.device_id()), "peer version unknown");
            return Err(SyncError::NeedAbilitySync);
        }

        let session_id = rand::thread_rng().gen_range(1..=u32::MAX);
        let end_mark = self.next_end_mark();
        let ctx = &mut inner.ctx;
        self.release_token(ctx);
        ctx.request_session_id = session_id;
        ctx.begin_target(mode, end_mark);
        inner.task = Some(InitiatorTask {
            mode,
            end_mark,
            send_finished: mode == SyncMode::Pull,
            recv_finished: mode == SyncMode::Push,
            remainder: false,
        });
        self.stats.write().sessions_started += 1;
        info!(
            device = %short_device_id(inner.ctx.device_id()),
            %mode,
            session_id,
            end_mark,
            "sync task started"
        );

        let ctx = &mut inner.ctx;
        let result = self
            .sync
            .check_permit_send_data(ctx, mode)
            .and_then(|()| self.run_start_step(ctx, mode));
        match result {
            Ok(()) => {
                self.set_state(SyncState::RequestSent);
                Ok(())
            }
            Err(err) => {
                self.fail_task(&mut inner, &err);
                Err(err)
            }
        }
    }

    /// Feeds a message received from the peer.
    ///
    /// # Errors
    ///
    /// Returns the failure that ended a task or aborted the handling of the
    /// message. Outcomes of tasks are reported through
    /// [`subscribe`](Self::subscribe) as well.
    pub fn on_message(&self, message: Message) -> SyncResult<()> {
        match message.message_type() {
            MessageType::Request => self.handle_data_request(message),
            MessageType::Response | MessageType::Notify => self.handle_ack(message),
        }
    }

    /// Decodes a payload framed by the transport and handles it.
    ///
    /// A payload that does not decode is dropped before it reaches the
    /// exchange: nothing is acked, stored or moved.
    ///
    /// # Errors
    ///
    /// Returns the decode failure, or whatever [`on_message`](Self::on_message)
    /// returns.
    pub fn on_wire_message(&self, header: MessageHeader, payload: &[u8]) -> SyncResult<()> {
        let session_id = header.session_id;
        let message = match Message::decode(header, payload) {
            Ok(message) => message,
            Err(err) => {
                let err = SyncError::from(err);
                warn!(%err, session_id, len = payload.len(), "undecodable message dropped");
                self.record_error(&err);
                return Err(err);
            }
        };
        self.on_message(message)
    }

    fn handle_data_request(&self, message: Message) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        self.stats.write().requests_received += 1;
        inner.ctx.stop_feed(FeedDirection::Receive);
        let session_id = message.header.session_id;
        let for_task = inner.task.is_some() && session_id == inner.ctx.request_session_id;

        match self.sync.request_recv(&mut inner.ctx, message) {
            Ok((step, pull_end)) => {
                if for_task && step == RecvStep::RecvFinished {
                    if let Some(task) = inner.task.as_mut() {
                        task.recv_finished = true;
                    }
                    self.advance_finished(&mut inner);
                }
                if pull_end > 0 {
                    debug!(session_id, pull_end, "pull response queued");
                    inner.ctx.response_targets.push_back(ResponseTarget {
                        end_water_mark: pull_end,
                        session_id,
                    });
                    self.try_start_response(&mut inner);
                }
                Ok(())
            }
            Err(err) => {
                if for_task {
                    self.fail_task(&mut inner, &err);
                } else {
                    warn!(%err, session_id, "data request rejected");
                    self.record_error(&err);
                }
                Err(err)
            }
        }
    }

    fn handle_ack(&self, message: Message) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        self.stats.write().acks_received += 1;
        inner.ctx.stop_feed(FeedDirection::Send);
        let session_id = message.header.session_id;
        let for_response = inner.responding && session_id == inner.ctx.response_session_id;
        let for_task =
            !for_response && inner.task.is_some() && session_id == inner.ctx.request_session_id;
        if !for_response && !for_task {
            debug!(session_id, "ack for an inactive session dropped");
            return Ok(());
        }
        if !for_response {
            self.set_state(SyncState::AckReceived);
        }

        let result = self
            .sync
            .ack_recv(&mut inner.ctx, &message)
            .and_then(|step| {
                if for_response {
                    self.advance_response(&mut inner, step)
                } else {
                    self.advance_task(&mut inner, step)
                }
            });
        if let Err(err) = &result {
            if for_response {
                warn!(%err, "pull response aborted");
                self.record_error(err);
                self.finish_response(&mut inner);
            } else {
                self.fail_task(&mut inner, err);
            }
        }
        result
    }

    fn advance_response(&self, inner: &mut EngineInner, step: AckStep) -> SyncResult<()> {
        match step {
            AckStep::SendData | AckStep::ReSendData => self.sync.pull_response_start(&mut inner.ctx),
            AckStep::NoDataSend => {
                info!(session_id = inner.ctx.response_session_id, "pull response finished");
                self.finish_response(inner);
                Ok(())
            }
            AckStep::KeepAlive => Ok(()),
        }
    }

    fn advance_task(&self, inner: &mut EngineInner, step: AckStep) -> SyncResult<()> {
        let Some(task) = inner.task else {
            return Ok(());
        };
        match step {
            AckStep::SendData => {
                if let Some(task) = inner.task.as_mut() {
                    task.remainder = true;
                }
                self.sync.push_start(&mut inner.ctx)?;
                self.set_state(SyncState::RequestSent);
            }
            AckStep::NoDataSend => {
                if let Some(task) = inner.task.as_mut() {
                    task.send_finished = true;
                }
                self.advance_finished(inner);
            }
            AckStep::ReSendData => {
                self.set_state(SyncState::Resend);
                self.stats.write().resends += 1;
                if task.remainder {
                    self.sync.push_start(&mut inner.ctx)?;
                } else {
                    self.run_start_step(&mut inner.ctx, task.mode)?;
                }
                self.set_state(SyncState::RequestSent);
            }
            AckStep::KeepAlive => self.set_state(SyncState::RequestSent),
        }
        Ok(())
    }

    fn advance_finished(&self, inner: &mut EngineInner) {
        let Some(task) = inner.task else {
            return;
        };
        if task.send_finished && task.recv_finished {
            self.complete_task(inner);
        } else if task.send_finished {
            if !inner.responding {
                self.set_state(SyncState::WaitForRemoteData);
            }
            self.try_start_response(inner);
        }
    }

    fn complete_task(&self, inner: &mut EngineInner) {
        let Some(task) = inner.task.take() else {
            return;
        };
        let status = SyncStatus::completed(task.mode);
        if !inner.responding {
            self.release_token(&mut inner.ctx);
            self.set_state(SyncState::Idle);
        }
        {
            let mut stats = self.stats.write();
            stats.sessions_completed += 1;
            stats.last_sync_time = Some(Instant::now());
            stats.last_error = None;
        }
        info!(
            device = %short_device_id(inner.ctx.device_id()),
            mode = %task.mode,
            ?status,
            "sync task finished"
        );
        self.emit(SyncOutcome {
            device: inner.ctx.device_id().to_string(),
            mode: task.mode,
            status,
        });
        self.try_start_response(inner);
    }

    fn fail_task(&self, inner: &mut EngineInner, err: &SyncError) {
        self.record_error(err);
        let Some(task) = inner.task.take() else {
            return;
        };
        if !inner.responding {
            self.release_token(&mut inner.ctx);
            self.set_state(SyncState::Idle);
        }
        self.stats.write().sessions_failed += 1;
        let status = SyncStatus::from_error(err);
        warn!(
            device = %short_device_id(inner.ctx.device_id()),
            mode = %task.mode,
            %err,
            "sync task failed"
        );
        self.emit(SyncOutcome {
            device: inner.ctx.device_id().to_string(),
            mode: task.mode,
            status,
        });
        self.try_start_response(inner);
    }

    fn try_start_response(&self, inner: &mut EngineInner) {
        let state = self.state();
        if inner.responding || !(state.can_start_sync() || state == SyncState::WaitForRemoteData) {
            return;
        }
        let Some(target) = inner.ctx.response_targets.pop_front() else {
            return;
        };
        inner.responding = true;
        let ctx = &mut inner.ctx;
        ctx.response_session_id = target.session_id;
        self.release_token(ctx);
        ctx.begin_target(SyncMode::ResponsePull, target.end_water_mark);
        info!(
            session_id = target.session_id,
            end_mark = target.end_water_mark,
            "pull response started"
        );
        let result = self
            .sync
            .check_permit_send_data(ctx, SyncMode::ResponsePull)
            .and_then(|()| self.sync.pull_response_start(ctx));
        match result {
            Ok(()) => self.set_state(SyncState::RequestSent),
            Err(err) => {
                warn!(%err, "pull response failed to start");
                self.record_error(&err);
                self.finish_response(inner);
            }
        }
    }

    fn finish_response(&self, inner: &mut EngineInner) {
        inner.responding = false;
        self.release_token(&mut inner.ctx);
        match inner.task {
            Some(task) => {
                inner.ctx.mode = task.mode;
                inner.ctx.end_mark = task.end_mark;
                self.set_state(SyncState::WaitForRemoteData);
            }
            None => self.set_state(SyncState::Idle),
        }
        self.try_start_response(inner);
    }

    /// Sends the last data fragment again on its original ids.
    ///
    /// Returns `false` when nothing is in flight.
    pub fn resend_in_flight(&self) -> SyncResult<bool> {
        let mut inner = self.inner.lock();
        let Some(info) = inner.ctx.in_flight() else {
            return Ok(false);
        };
        self.set_state(SyncState::Resend);
        self.stats.write().resends += 1;
        let result = self.sync.re_send(&mut inner.ctx, info);
        self.set_state(SyncState::RequestSent);
        result.map(|()| true)
    }

    /// Ends the running exchange after the peer stopped answering.
    pub fn on_timeout(&self) {
        let mut inner = self.inner.lock();
        self.release_token(&mut inner.ctx);
        inner.responding = false;
        if let Some(task) = inner.task.take() {
            self.stats.write().sessions_failed += 1;
            self.emit(SyncOutcome {
                device: inner.ctx.device_id().to_string(),
                mode: task.mode,
                status: SyncStatus::Timeout,
            });
        }
        self.record_error(&SyncError::Timeout);
        warn!(device = %short_device_id(inner.ctx.device_id()), "sync timed out");
        self.set_state(SyncState::Timeout);
    }

    /// Cancels the running exchange and drops queued pull responses.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        self.release_token(&mut inner.ctx);
        inner.responding = false;
        inner.ctx.response_targets.clear();
        if let Some(task) = inner.task.take() {
            self.stats.write().sessions_failed += 1;
            self.emit(SyncOutcome {
                device: inner.ctx.device_id().to_string(),
                mode: task.mode,
                status: SyncStatus::Cancelled,
            });
        }
        info!(device = %short_device_id(inner.ctx.device_id()), "sync cancelled");
        self.set_state(SyncState::Idle);
    }
}
