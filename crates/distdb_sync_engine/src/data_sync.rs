//! Single-version data synchronizer.
//!
//! [`DataSync`] builds and consumes the data packets of one peer exchange.
//! It owns no exchange state: everything it remembers between messages lives
//! in the [`SyncTaskContext`] passed to each call and in the [`Metadata`]
//! watermark store. The state machine in [`crate::SyncEngine`] decides which
//! operation runs next from the step each call returns.

use std::sync::Arc;

use distdb_codec::{has_packet_id, DataItem, SOFTWARE_VERSION_EARLIEST};
use distdb_storage::{
    hash_device_id, short_device_id, DataSizeSpec, StorageError, SyncStorage,
    MAX_SYNC_BLOCK_SIZE,
};
use distdb_sync_protocol::{
    DataAckPacket, DataRequestPacket, Message, MessageHeader, Payload, SyncCode, SyncMode,
};
use tracing::{debug, error, info, warn};

use crate::access::{AccessControl, PermissionFlags};
use crate::clock::{apply_offset, Clock};
use crate::communicator::Communicator;
use crate::config::SyncConfig;
use crate::context::{FeedDirection, ReSendInfo, SyncTaskContext};
use crate::error::{SyncError, SyncResult};
use crate::metadata::Metadata;

/// What the sender does after an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStep {
    /// Send the next page.
    SendData,
    /// Everything has been sent.
    NoDataSend,
    /// The peer disagreed with the local watermark; read again from it.
    ReSendData,
    /// The peer is still busy; keep waiting.
    KeepAlive,
}

/// What the receiver does after a data request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStep {
    /// The batch was applied and acknowledged.
    Applied,
    /// The batch was the final page of a pull response.
    RecvFinished,
    /// Nothing was applied; the next message decides.
    WaitNextMessage,
}

/// The collaborators a synchronizer drives.
#[derive(Clone)]
pub struct DataSyncParts {
    /// Local store.
    pub storage: Arc<dyn SyncStorage>,
    /// Link to the peer.
    pub communicator: Arc<dyn Communicator>,
    /// Watermark store.
    pub metadata: Arc<dyn Metadata>,
    /// Access policy.
    pub access: Arc<dyn AccessControl>,
    /// Local time source.
    pub clock: Arc<dyn Clock>,
}

/// Builds, sends and applies the data packets of single-version sync.
pub struct DataSync {
    storage: Arc<dyn SyncStorage>,
    communicator: Arc<dyn Communicator>,
    metadata: Arc<dyn Metadata>,
    access: Arc<dyn AccessControl>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

fn max_send_time(items: &[DataItem], init: u64) -> u64 {
    items.iter().map(|item| item.timestamp).fold(init, u64::max)
}

fn min_send_time(items: &[DataItem], local_mark: u64) -> u64 {
    items.iter().map(|item| item.timestamp).fold(local_mark, u64::min)
}

impl DataSync {
    /// Creates a synchronizer over `parts`.
    pub fn new(parts: DataSyncParts, config: SyncConfig) -> Self {
        Self {
            storage: parts.storage,
            communicator: parts.communicator,
            metadata: parts.metadata,
            access: parts.access,
            clock: parts.clock,
            config,
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Local store.
    pub fn storage(&self) -> &Arc<dyn SyncStorage> {
        &self.storage
    }

    /// Watermark store.
    pub fn metadata(&self) -> &Arc<dyn Metadata> {
        &self.metadata
    }

    /// Local time.
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    fn mtu_budget(&self, ctx: &SyncTaskContext) -> u32 {
        self.config
            .mtu_budget(self.communicator.mtu_size(&ctx.device_id))
    }

    fn size_spec(&self, ctx: &SyncTaskContext) -> DataSizeSpec {
        let block_size = match self.mtu_budget(ctx) as usize {
            0 => MAX_SYNC_BLOCK_SIZE,
            budget => budget.min(MAX_SYNC_BLOCK_SIZE),
        };
        DataSizeSpec::new(block_size, self.config.pack_item_size(ctx.version()))
    }

    fn marks(&self, device: &str) -> (u64, u64) {
        (
            self.metadata.get_local_water_mark(device),
            self.metadata.get_peer_water_mark(device),
        )
    }

    fn save_local_water_mark(&self, device: &str, mark: u64) -> SyncResult<()> {
        self.metadata
            .save_local_water_mark(device, mark)
            .inspect_err(|err| error!(device = %short_device_id(device), %err, "save local watermark failed"))
    }

    fn update_peer_water_mark(&self, device: &str, max_timestamp: u64) {
        if max_timestamp == 0 {
            return;
        }
        let mark = max_timestamp.saturating_add(1);
        if mark <= self.metadata.get_peer_water_mark(device) {
            return;
        }
        if let Err(err) = self.metadata.save_peer_water_mark(device, mark) {
            error!(device = %short_device_id(device), %err, "save peer watermark failed");
        }
    }

    /// Hands `message` to the communicator, feeding the send watchdog when
    /// the packet exceeds the MTU budget.
    pub fn send(
        &self,
        ctx: &mut SyncTaskContext,
        message: Message,
        packet_len: usize,
    ) -> SyncResult<()> {
        let fed = match self.config.feed_time(packet_len, self.mtu_budget(ctx)) {
            Some(millis) => {
                ctx.start_feed(FeedDirection::Send, millis);
                true
            }
            None => false,
        };
        if let Err(err) =
            self.communicator
                .send_message(&ctx.device_id, message, self.config.send_timeout)
        {
            error!(device = %short_device_id(&ctx.device_id), %err, "send message failed");
            if fed {
                ctx.stop_feed(FeedDirection::Send);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Reads the next page to send. A pending retry restarts the scan from the
    /// local watermark; otherwise an open scan continues.
    pub fn get_data(&self, ctx: &mut SyncTaskContext) -> SyncResult<Vec<DataItem>> {
        let mut items = if ctx.need_retry {
            ctx.need_retry = false;
            info!(device = %short_device_id(&ctx.device_id), "resend data");
            self.get_unsync_data(ctx)?
        } else if ctx.continue_token.is_none() {
            self.get_unsync_data(ctx)?
        } else {
            self.get_next_unsync_data(ctx)?
        };
        self.trans_to_send_items(&mut items);
        Ok(items)
    }

    /// Starts a scan over `[localWaterMark, endMark)`, releasing any open one.
    pub fn get_unsync_data(&self, ctx: &mut SyncTaskContext) -> SyncResult<Vec<DataItem>> {
        let start = self.metadata.get_local_water_mark(&ctx.device_id);
        let end = ctx.end_mark;
        ctx.release_continue_token(self.storage.as_ref());
        if end == 0 || start >= end {
            return Ok(Vec::new());
        }
        let batch = self
            .storage
            .get_sync_data(start, end, self.size_spec(ctx))
            .inspect_err(|err| error!(%err, start, end, "get unsync data failed"))?;
        ctx.continue_token = batch.token;
        Ok(batch.items)
    }

    /// Continues the open scan.
    pub fn get_next_unsync_data(&self, ctx: &mut SyncTaskContext) -> SyncResult<Vec<DataItem>> {
        let Some(token) = ctx.continue_token.take() else {
            return Ok(Vec::new());
        };
        let batch = self
            .storage
            .get_sync_data_next(token, self.size_spec(ctx))
            .inspect_err(|err| error!(%err, "get next unsync data failed"))?;
        ctx.continue_token = batch.token;
        Ok(batch.items)
    }

    fn trans_to_send_items(&self, items: &mut [DataItem]) {
        let local = hash_device_id(&self.communicator.local_identity());
        for item in items.iter_mut() {
            if item.orig_device.is_empty() {
                item.orig_device = local.clone();
            }
        }
    }

    fn trans_to_local_items(&self, ctx: &SyncTaskContext, items: &mut [DataItem]) {
        let offset = self.metadata.get_time_offset(&ctx.device_id);
        let now = self.clock.now();
        let local = hash_device_id(&self.communicator.local_identity());
        for item in items.iter_mut() {
            if item.orig_device == local {
                item.orig_device.clear();
            }
            item.timestamp = apply_offset(item.timestamp, offset).min(now);
            if item.write_timestamp != 0 {
                item.write_timestamp = apply_offset(item.write_timestamp, offset);
            }
            item.write_timestamp = item.write_timestamp.min(now);
        }
    }

    /// Applies a received batch after moving it into local time.
    pub fn save_data(&self, ctx: &SyncTaskContext, mut items: Vec<DataItem>) -> SyncResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        self.trans_to_local_items(ctx, &mut items);
        self.storage
            .put_sync_data(items, &ctx.device_id)
            .inspect_err(|err| error!(%err, "save sync data failed"))?;
        Ok(())
    }

    fn set_packet_id(&self, packet: &mut DataRequestPacket, ctx: &mut SyncTaskContext, version: u32) {
        if has_packet_id(version) {
            let packet_id = ctx.next_packet_id();
            packet.set_packet_id(packet_id);
        }
    }

    fn send_data_packet(
        &self,
        ctx: &mut SyncTaskContext,
        packet: DataRequestPacket,
        session_id: u32,
    ) -> SyncResult<()> {
        let packet_len = packet.calculate_len()?;
        let sequence_id = ctx.next_sequence_id();
        let (start, end) = ctx.sequence_range();
        ctx.in_flight = (!packet.data.is_empty()).then_some(ReSendInfo {
            start,
            end,
            session_id,
            sequence_id,
            packet_id: packet.packet_id(),
        });
        let message = Message::request(ctx.device_id.clone(), session_id, sequence_id, packet);
        self.send(ctx, message, packet_len)
    }

    /// Sends the next page of local changes.
    ///
    /// The local watermark moves past the page only once it has been handed
    /// to the communicator.
    pub fn push_start(&self, ctx: &mut SyncTaskContext) -> SyncResult<()> {
        let device = ctx.device_id.clone();
        let (local_mark, peer_mark) = self.marks(&device);
        let version = ctx.version();
        debug!(
            device = %short_device_id(&device),
            local_mark,
            end_mark = ctx.end_mark,
            peer_mark,
            "push start"
        );
        let items = self.get_data(ctx)?;
        let finished = ctx.continue_token.is_none();

        let max_time = max_send_time(&items, local_mark);
        ctx.set_sequence_range(min_send_time(&items, local_mark), max_time);
        let mut packet = DataRequestPacket::new(version);
        if finished {
            ctx.session_end_timestamp = max_time;
            packet.set_last_sequence();
        }
        let has_data = !items.is_empty();
        packet.data = items;
        let send_code = if finished {
            SyncCode::Ok
        } else {
            SyncCode::Unfinished
        };
        packet.set_basic_info(send_code, version, local_mark, peer_mark, SyncMode::Push);
        self.set_packet_id(&mut packet, ctx, version);
        let session_id = ctx.request_session_id;
        self.send_data_packet(ctx, packet, session_id)?;
        if has_data {
            self.save_local_water_mark(&device, max_time + 1)?;
        }
        Ok(())
    }

    /// Sends the first page of local changes together with a request for the
    /// peer's changes up to the end mark.
    pub fn push_pull_start(&self, ctx: &mut SyncTaskContext) -> SyncResult<()> {
        let device = ctx.device_id.clone();
        let (local_mark, peer_mark) = self.marks(&device);
        let version = ctx.version();
        debug!(
            device = %short_device_id(&device),
            local_mark,
            end_mark = ctx.end_mark,
            peer_mark,
            "push pull start"
        );
        // A cached store still asks the peer for its data.
        let items = match self.get_data(ctx) {
            Ok(items) => items,
            Err(SyncError::Storage(StorageError::KeyRevoked)) if has_packet_id(version) => {
                Vec::new()
            }
            Err(err) => return Err(err),
        };
        let finished = ctx.continue_token.is_none();

        let max_time = max_send_time(&items, local_mark);
        ctx.set_sequence_range(min_send_time(&items, local_mark), max_time);
        let mut packet = DataRequestPacket::new(version);
        if finished {
            ctx.session_end_timestamp = max_time;
            packet.set_last_sequence();
        }
        let has_data = !items.is_empty();
        packet.data = items;
        let send_code = if finished {
            SyncCode::Ok
        } else {
            SyncCode::Unfinished
        };
        packet.set_basic_info(send_code, version, local_mark, peer_mark, SyncMode::PushAndPull);
        packet.end_water_mark = ctx.end_mark;
        packet.session_id = ctx.request_session_id;
        self.set_packet_id(&mut packet, ctx, version);
        let session_id = ctx.request_session_id;
        self.send_data_packet(ctx, packet, session_id)?;
        if has_data {
            self.save_local_water_mark(&device, max_time + 1)?;
        }
        Ok(())
    }

    /// Asks the peer for its changes up to the end mark.
    pub fn pull_request_start(&self, ctx: &mut SyncTaskContext) -> SyncResult<()> {
        let (local_mark, peer_mark) = self.marks(&ctx.device_id);
        let version = ctx.version();
        let mut packet = DataRequestPacket::new(version);
        packet.local_water_mark = local_mark;
        packet.peer_water_mark = peer_mark;
        packet.mode = SyncMode::Pull;
        packet.end_water_mark = ctx.end_mark;
        packet.session_id = ctx.request_session_id;
        packet.set_last_sequence();
        self.set_packet_id(&mut packet, ctx, version);
        debug!(
            device = %short_device_id(&ctx.device_id),
            peer_mark,
            local_mark,
            end_mark = ctx.end_mark,
            "pull request"
        );
        ctx.set_sequence_range(local_mark, local_mark);
        let session_id = ctx.request_session_id;
        self.send_data_packet(ctx, packet, session_id)
    }

    /// Sends the next page answering the peer's pull.
    pub fn pull_response_start(&self, ctx: &mut SyncTaskContext) -> SyncResult<()> {
        let device = ctx.device_id.clone();
        let (local_mark, peer_mark) = self.marks(&device);
        debug!(
            device = %short_device_id(&device),
            local_mark,
            pull_end_mark = ctx.end_mark,
            peer_mark,
            "pull response"
        );
        let items = match self.get_data(ctx) {
            Ok(items) => items,
            Err(err) => {
                if has_packet_id(ctx.version()) {
                    if let Err(send_err) =
                        self.send_pull_response_packet(ctx, err.code(), Vec::new())
                    {
                        warn!(err = %send_err, code = %err.code(), "error response not sent");
                    }
                }
                return Err(err);
            }
        };
        let finished = ctx.continue_token.is_none();
        let ack_code = if finished {
            debug!("send last frame");
            SyncCode::SendFinished
        } else {
            SyncCode::Ok
        };
        let max_time = max_send_time(&items, local_mark);
        ctx.set_sequence_range(min_send_time(&items, local_mark), max_time);
        if finished {
            ctx.session_end_timestamp = max_time;
        }
        let has_data = !items.is_empty();
        self.send_pull_response_packet(ctx, ack_code, items)?;
        if has_data {
            self.save_local_water_mark(&device, max_time + 1)?;
        }
        Ok(())
    }

    fn send_pull_response_packet(
        &self,
        ctx: &mut SyncTaskContext,
        code: SyncCode,
        items: Vec<DataItem>,
    ) -> SyncResult<()> {
        let (local_mark, peer_mark) = self.marks(&ctx.device_id);
        let version = ctx.version();
        let mut packet = DataRequestPacket::new(version);
        packet.set_basic_info(code, version, local_mark, peer_mark, SyncMode::Push);
        if code == SyncCode::SendFinished {
            packet.set_last_sequence();
        }
        self.set_packet_id(&mut packet, ctx, version);
        info!(
            device = %short_device_id(&ctx.device_id),
            size = items.len(),
            %code,
            last_sequence = packet.is_last_sequence(),
            "send pull response"
        );
        packet.data = items;
        let packet_len = packet.calculate_len()?;
        self.send_reset_watchdog(ctx, packet_len);
        let session_id = ctx.response_session_id;
        self.send_data_packet(ctx, packet, session_id)
    }

    fn send_reset_watchdog(&self, ctx: &mut SyncTaskContext, packet_len: usize) {
        let Some(millis) = self.config.feed_time(packet_len, self.mtu_budget(ctx)) else {
            return;
        };
        let ack = DataAckPacket::new(ctx.version(), SyncCode::SaveDataNotify)
            .with_data(u64::from(millis));
        let message = Message::notify(
            ctx.device_id.clone(),
            ctx.response_session_id,
            ctx.sequence_id,
            ack,
        );
        match self.send(ctx, message, 0) {
            Ok(()) => info!(data = millis, "reset watchdog notify sent"),
            Err(err) => error!(%err, "reset watchdog notify failed"),
        }
    }

    fn send_save_data_notify(&self, ctx: &mut SyncTaskContext, version: u32, header: &MessageHeader) {
        let ack = DataAckPacket::new(version, SyncCode::SaveDataNotify);
        let message = Message::notify(
            ctx.device_id.clone(),
            header.session_id,
            header.sequence_id,
            ack,
        );
        if let Err(err) = self.send(ctx, message, 0) {
            warn!(%err, "save data notify failed");
        }
    }

    fn ack_data(&self, ctx: &SyncTaskContext, code: SyncCode, max_time: u64) -> u64 {
        if code == SyncCode::Ok && max_time != 0 {
            max_time + 1
        } else if code != SyncCode::WaterMarkInvalid {
            self.metadata.get_peer_water_mark(&ctx.device_id)
        } else {
            0
        }
    }

    /// Acknowledges `packet` with `code`.
    pub fn send_ack(
        &self,
        ctx: &mut SyncTaskContext,
        header: &MessageHeader,
        packet: &DataRequestPacket,
        code: SyncCode,
        max_time: u64,
    ) -> SyncResult<()> {
        let version = ctx.version();
        let mut ack =
            DataAckPacket::new(version, code).with_data(self.ack_data(ctx, code, max_time));
        let packet_id = if has_packet_id(version) {
            packet.packet_id()
        } else {
            0
        };
        ack.set_echo(self.metadata.get_local_water_mark(&ctx.device_id), packet_id);
        let message = Message::response(
            ctx.device_id.clone(),
            header.session_id,
            header.sequence_id,
            ack,
        );
        self.send(ctx, message, 0)
    }

    /// Like [`send_ack`](Self::send_ack), but a send failure is only logged.
    fn send_ack_or_warn(
        &self,
        ctx: &mut SyncTaskContext,
        header: &MessageHeader,
        packet: &DataRequestPacket,
        code: SyncCode,
        max_time: u64,
    ) {
        if let Err(err) = self.send_ack(ctx, header, packet, code, max_time) {
            warn!(
                %err,
                %code,
                device = %short_device_id(&ctx.device_id),
                session_id = header.session_id,
                "ack not sent"
            );
        }
    }

    fn send_local_water_mark_ack(
        &self,
        ctx: &mut SyncTaskContext,
        header: &MessageHeader,
        packet: &DataRequestPacket,
    ) -> SyncResult<()> {
        ctx.receive_water_mark_err = true;
        let (local_mark, peer_mark) = self.marks(&ctx.device_id);
        let version = ctx.version();
        let mut ack =
            DataAckPacket::new(version, SyncCode::LocalWaterMarkNotInit).with_data(peer_mark);
        let packet_id = if has_packet_id(version) {
            packet.packet_id()
        } else {
            0
        };
        ack.set_echo(local_mark, packet_id);
        let message = Message::response(
            ctx.device_id.clone(),
            header.session_id,
            header.sequence_id,
            ack,
        );
        self.send(ctx, message, 0)?;
        info!(peer_mark, local_mark, "local watermark not init");
        Ok(())
    }

    fn check_permit_receive_data(&self, ctx: &SyncTaskContext) -> bool {
        let Some(remote) = ctx.remote_security_option else {
            return true;
        };
        if remote.is_not_support() {
            return true;
        }
        let local = self.communicator.local_identity();
        let permit = self.access.check_device_security_ability(&local, remote);
        if !permit {
            error!(label = ?remote.label, flag = ?remote.flag, "receive permit check failed");
        }
        permit
    }

    fn run_permission_check(
        &self,
        ctx: &mut SyncTaskContext,
        header: &MessageHeader,
        packet: &DataRequestPacket,
    ) -> SyncResult<()> {
        let flags = PermissionFlags::for_mode(packet.mode);
        let properties = self.storage.properties();
        if !self.access.check_permission(&properties, &ctx.device_id, flags) {
            error!(
                flags = flags.bits(),
                device = %short_device_id(&ctx.device_id),
                "permission check failed"
            );
            if ctx.remote_version > SOFTWARE_VERSION_EARLIEST {
                self.send_ack_or_warn(ctx, header, packet, SyncCode::NotPermit, 0);
            }
            return Err(SyncError::NotPermit);
        }
        if has_packet_id(ctx.version())
            && packet.mode != SyncMode::Pull
            && !ctx.receive_permit_checked
        {
            if self.check_permit_receive_data(ctx) {
                ctx.receive_permit_checked = true;
            } else {
                let max_time = max_send_time(&packet.data, 0);
                self.send_ack_or_warn(
                    ctx,
                    header,
                    packet,
                    SyncCode::SecurityOptionCheckError,
                    max_time,
                );
                return Err(SyncError::SecurityOptionCheck);
            }
        }
        Ok(())
    }

    /// Gates a received request before anything is applied.
    ///
    /// Returns `Some(step)` when the request was answered and must not be
    /// processed further.
    pub fn request_recv_pre(
        &self,
        ctx: &mut SyncTaskContext,
        header: &MessageHeader,
        packet: &DataRequestPacket,
    ) -> SyncResult<Option<RecvStep>> {
        if !ctx.is_version_known() {
            return match self.communicator.remote_communicator_version(&ctx.device_id) {
                None => {
                    error!("remote communicator version unknown");
                    Err(SyncError::VersionNotSupported {
                        version: ctx.remote_version,
                    })
                }
                Some(0) => {
                    info!("remote is on the earliest version");
                    ctx.set_remote_version(SOFTWARE_VERSION_EARLIEST);
                    Ok(None)
                }
                Some(_) => {
                    info!("ability sync required");
                    self.send_ack_or_warn(ctx, header, packet, SyncCode::NeedAbilitySync, 0);
                    Ok(Some(RecvStep::WaitNextMessage))
                }
            };
        }
        if packet.send_code == SyncCode::VersionNotSupport {
            error!(version = packet.version, "version mismatch");
            self.send_ack_or_warn(ctx, header, packet, SyncCode::VersionNotSupport, 0);
            return Ok(Some(RecvStep::WaitNextMessage));
        }
        if !matches!(packet.send_code, SyncCode::Ok | SyncCode::SendFinished)
            && header.session_id == ctx.request_session_id
        {
            error!(code = %packet.send_code, "pull response reported an error");
            return Err(SyncError::from_remote(packet.send_code));
        }
        self.run_permission_check(ctx, header, packet)?;
        Ok(None)
    }

    fn pull_end_water_mark(&self, ctx: &SyncTaskContext, packet: &DataRequestPacket) -> u64 {
        if !matches!(packet.mode, SyncMode::Pull | SyncMode::PushAndPull) {
            return 0;
        }
        let offset = self.metadata.get_time_offset(&ctx.device_id);
        let end = apply_offset(packet.end_water_mark, offset);
        debug!(packet_end_mark = packet.end_water_mark, offset, end, "pull end watermark");
        end
    }

    fn remove_device_data(
        &self,
        ctx: &mut SyncTaskContext,
        header: &MessageHeader,
        packet: &DataRequestPacket,
        max_time: u64,
    ) -> SyncResult<()> {
        let device = ctx.device_id.clone();
        if let Err(err) = self.storage.remove_device_data(&device, true) {
            self.send_ack_or_warn(ctx, header, packet, err.code(), max_time);
            return Err(err.into());
        }
        self.metadata.save_peer_water_mark(&device, 0)?;
        if ctx.remote_version == SOFTWARE_VERSION_EARLIEST {
            self.save_local_water_mark(&device, 0)?;
        }
        Ok(())
    }

    fn remote_push_finished(&self, ctx: &SyncTaskContext, packet: &DataRequestPacket, session_id: u32) {
        if !matches!(packet.mode, SyncMode::Push | SyncMode::PushAndPull) {
            return;
        }
        if packet.send_code == SyncCode::Ok
            && session_id != 0
            && session_id != ctx.request_session_id
        {
            self.storage.notify_remote_push_finished(&ctx.device_id);
        }
    }

    /// Applies a received data request and acknowledges it.
    ///
    /// Returns the step and, for pull requests, the end watermark up to which
    /// the peer wants this device's changes (0 otherwise).
    pub fn request_recv(
        &self,
        ctx: &mut SyncTaskContext,
        message: Message,
    ) -> SyncResult<(RecvStep, u64)> {
        let Message { header, payload } = message;
        let Payload::Request(mut packet) = payload else {
            return Err(SyncError::invalid_message("expected a data request"));
        };
        if let Some(step) = self.request_recv_pre(ctx, &header, &packet)? {
            return Ok((step, 0));
        }
        let device = ctx.device_id.clone();
        info!(
            version = packet.version,
            size = packet.data.len(),
            code = %packet.send_code,
            device = %short_device_id(&device),
            "request received"
        );
        let packet_local_mark = packet.local_water_mark;
        let peer_mark = self.metadata.get_peer_water_mark(&device);
        ctx.receive_water_mark_err = false;
        let max_time = packet.max_timestamp();
        if packet_local_mark > peer_mark {
            info!(packet_local_mark, peer_mark, "peer is ahead of the recorded watermark");
            self.send_local_water_mark_ack(ctx, &header, &packet)?;
            return Ok((RecvStep::WaitNextMessage, 0));
        } else if packet_local_mark == 0 && peer_mark != 0 && self.config.clear_remote_stale_data {
            info!(device = %short_device_id(&device), "peer was rebuilt, clearing its data");
            self.remove_device_data(ctx, &header, &packet, max_time)?;
        }

        let mut pull_end = self.pull_end_water_mark(ctx, &packet);
        let data = std::mem::take(&mut packet.data);
        let had_data = !data.is_empty();
        if had_data && data.len() >= self.config.save_notify_threshold {
            self.send_save_data_notify(ctx, packet.version, &header);
        }
        if let Err(err) = self.save_data(ctx, data) {
            self.send_ack_or_warn(ctx, &header, &packet, err.code(), max_time);
            return Err(err);
        }
        let ack_result = if pull_end > 0 && !self.storage.is_readable() {
            pull_end = 0;
            self.send_ack(ctx, &header, &packet, SyncCode::KeyRevoked, max_time)
        } else {
            let code = if had_data {
                SyncCode::Ok
            } else {
                SyncCode::WaterMarkInvalid
            };
            self.send_ack(ctx, &header, &packet, code, max_time)
        };
        self.remote_push_finished(ctx, &packet, header.session_id);
        self.update_peer_water_mark(&device, max_time);
        ack_result?;
        if packet.send_code == SyncCode::SendFinished {
            return Ok((RecvStep::RecvFinished, pull_end));
        }
        Ok((RecvStep::Applied, pull_end))
    }

    /// Handles an acknowledgement of a sent request.
    pub fn ack_recv(&self, ctx: &mut SyncTaskContext, message: &Message) -> SyncResult<AckStep> {
        let packet = message
            .ack_packet()
            .ok_or_else(|| SyncError::invalid_message("expected a data ack"))?;
        let code = packet.recv_code;
        debug!(version = packet.version, %code, "ack received");
        if code == SyncCode::VersionNotSupport {
            error!("version mismatch");
            return Err(SyncError::VersionNotSupported {
                version: packet.version,
            });
        }
        if matches!(code, SyncCode::NeedAbilitySync | SyncCode::NotPermit) {
            info!(%code, device = %short_device_id(&ctx.device_id), "data sync aborted");
            ctx.release_continue_token(self.storage.as_ref());
            return Err(SyncError::from_remote(code));
        }
        let data = packet.data;
        if code == SyncCode::LocalWaterMarkNotInit {
            return self.deal_water_mark_exception(ctx, data, &packet.reserved);
        }
        if code == SyncCode::SaveDataNotify {
            if data != 0 {
                // only the low 32 bits carry the feed time
                ctx.start_feed(FeedDirection::Receive, data as u32);
                info!(data, "peer asked to reset the watchdog");
            }
            return Ok(AckStep::KeepAlive);
        }
        if code != SyncCode::Ok && code != SyncCode::WaterMarkInvalid {
            warn!(%code, "unexpected ack code");
            return Err(SyncError::from_remote(code));
        }
        let session_id = message.header.session_id;
        if (session_id == ctx.response_session_id || session_id == ctx.request_session_id)
            && ctx.continue_token.is_none()
        {
            return Ok(AckStep::NoDataSend);
        }
        Ok(AckStep::SendData)
    }

    fn deal_water_mark_exception(
        &self,
        ctx: &mut SyncTaskContext,
        ack_mark: u64,
        reserved: &[u64],
    ) -> SyncResult<AckStep> {
        let device = ctx.device_id.clone();
        let local_mark = self.metadata.get_local_water_mark(&device);
        info!(ack_mark, device = %short_device_id(&device), "local watermark not init");
        self.save_local_water_mark(&device, ack_mark)?;
        ctx.need_retry = true;
        if has_packet_id(ctx.version())
            && ctx.mode == SyncMode::PushAndPull
            && ctx.task_error == Some(SyncCode::KeyRevoked)
        {
            ctx.task_error = None;
        }
        let rebuilt = match reserved.first() {
            None => local_mark != 0 && ack_mark == 0,
            Some(&remote_local_mark) => {
                remote_local_mark == 0 && self.metadata.get_peer_water_mark(&device) != 0
            }
        };
        if rebuilt && self.config.clear_remote_stale_data {
            info!(device = %short_device_id(&device), "peer was rebuilt, clearing its data");
            self.storage.remove_device_data(&device, true)?;
            self.metadata.save_peer_water_mark(&device, 0)?;
        }
        Ok(AckStep::ReSendData)
    }

    /// Sends the records of `[info.start, info.end]` again on the original
    /// session, sequence and packet id.
    pub fn re_send(&self, ctx: &mut SyncTaskContext, info: ReSendInfo) -> SyncResult<()> {
        info!(start = info.start, end = info.end, "resend");
        let version = ctx.version();
        let batch = match self.storage.get_sync_data(
            info.start,
            info.end.saturating_add(1),
            self.size_spec(ctx),
        ) {
            Ok(batch) => batch,
            Err(err) => {
                if matches!(err, StorageError::Busy { .. } | StorageError::KeyRevoked) {
                    ctx.task_error = Some(err.code());
                }
                return Err(err.into());
            }
        };
        let finished = batch.token.is_none();
        if let Some(token) = batch.token {
            self.storage.release_continue_token(token);
        }
        let mut items = batch.items;
        self.trans_to_send_items(&mut items);

        let device = ctx.device_id.clone();
        let (local_mark, peer_mark) = self.marks(&device);
        let mut packet = DataRequestPacket::new(version);
        if ctx.session_end_timestamp == info.end {
            info!("resending the last sequence");
            packet.set_last_sequence();
        }
        packet.data = items;
        let send_code = if finished {
            SyncCode::Ok
        } else {
            SyncCode::Unfinished
        };
        packet.set_basic_info(send_code, version, info.start, peer_mark, SyncMode::Push);
        if has_packet_id(version) {
            packet.set_packet_id(info.packet_id);
        }
        let packet_len = packet.calculate_len()?;
        let message = Message::request(device.clone(), info.session_id, info.sequence_id, packet);
        self.send(ctx, message, packet_len)?;
        if local_mark < info.end {
            self.save_local_water_mark(&device, info.end + 1)?;
        }
        Ok(())
    }

    fn is_permit_remote_device_recv_data(&self, ctx: &SyncTaskContext) -> bool {
        match ctx.remote_security_option {
            None => return true,
            Some(remote) if remote.is_not_support() => return true,
            Some(_) => {}
        }
        match self.storage.get_security_option() {
            Ok(local) => self
                .access
                .check_device_security_ability(&ctx.device_id, local),
            Err(StorageError::NotSupport { .. }) => true,
            Err(err) => {
                error!(%err, "local security option unavailable");
                false
            }
        }
    }

    /// Confirms the peer may hold the local store's data before sending it.
    /// A positive answer is cached in the context.
    pub fn check_permit_send_data(&self, ctx: &mut SyncTaskContext, mode: SyncMode) -> SyncResult<()> {
        if !has_packet_id(ctx.version()) || mode == SyncMode::Pull || ctx.send_permit_checked {
            return Ok(());
        }
        let permit = self.is_permit_remote_device_recv_data(ctx);
        info!(
            %mode,
            device = %short_device_id(&ctx.device_id),
            permit,
            "send permit check"
        );
        if permit {
            ctx.send_permit_checked = true;
            return Ok(());
        }
        match mode {
            SyncMode::Push | SyncMode::PushAndPull => {
                ctx.task_error = Some(SyncCode::SecurityOptionCheckError);
                Err(SyncError::SecurityOptionCheck)
            }
            SyncMode::ResponsePull => {
                if let Err(err) = self.send_pull_response_packet(
                    ctx,
                    SyncCode::SecurityOptionCheckError,
                    Vec::new(),
                ) {
                    warn!(%err, "security failure response not sent");
                }
                Err(SyncError::SecurityOptionCheck)
            }
            SyncMode::Pull => Ok(()),
        }
    }
}
