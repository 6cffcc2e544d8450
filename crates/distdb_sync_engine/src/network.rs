//! In-process network for wiring engines together.
//!
//! Every send is encoded to bytes and decoded again before it is queued, so
//! messages crossing a [`LoopbackNetwork`] exercise the same wire codec a
//! real link would.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use distdb_sync_protocol::Message;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::communicator::Communicator;
use crate::error::{SyncError, SyncResult};
use crate::state::SyncEngine;

const MAX_DELIVERIES: usize = 100_000;

/// A message in transit.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Sending device.
    pub from: String,
    /// The decoded message; `header.target` names the receiver.
    pub message: Message,
}

/// A shared FIFO connecting [`LoopbackCommunicator`] endpoints.
#[derive(Debug, Default)]
pub struct LoopbackNetwork {
    queue: Mutex<VecDeque<Envelope>>,
    offline: Mutex<HashSet<String>>,
    versions: Mutex<HashMap<String, u16>>,
    mtu: Mutex<u32>,
}

impl LoopbackNetwork {
    /// Creates an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `identity` with communicator version 1 and returns its endpoint.
    pub fn endpoint(self: &Arc<Self>, identity: impl Into<String>) -> Arc<LoopbackCommunicator> {
        self.endpoint_with_version(identity, 1)
    }

    /// Registers `identity` with a communicator version and returns its endpoint.
    pub fn endpoint_with_version(
        self: &Arc<Self>,
        identity: impl Into<String>,
        version: u16,
    ) -> Arc<LoopbackCommunicator> {
        let identity = identity.into();
        self.versions.lock().insert(identity.clone(), version);
        Arc::new(LoopbackCommunicator {
            identity,
            network: Arc::clone(self),
        })
    }

    /// Makes sends to `device` fail, or succeed again.
    pub fn set_offline(&self, device: &str, offline: bool) {
        let mut set = self.offline.lock();
        if offline {
            set.insert(device.to_string());
        } else {
            set.remove(device);
        }
    }

    /// Overrides the communicator version reported for `device`; `None`
    /// makes the device unknown.
    pub fn set_communicator_version(&self, device: &str, version: Option<u16>) {
        let mut versions = self.versions.lock();
        match version {
            Some(version) => versions.insert(device.to_string(), version),
            None => versions.remove(device),
        };
    }

    /// Sets the MTU every endpoint reports.
    pub fn set_mtu(&self, mtu: u32) {
        *self.mtu.lock() = mtu;
    }

    /// Messages waiting for delivery.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Takes the oldest message in transit.
    pub fn pop(&self) -> Option<Envelope> {
        self.queue.lock().pop_front()
    }

    /// Delivers queued messages until the network is quiet.
    ///
    /// `route` maps `(target, from)` to the engine that handles the message;
    /// messages without an engine are dropped. Errors raised by an engine are
    /// logged and delivery continues. Returns the number of messages delivered.
    ///
    /// # Errors
    ///
    /// Fails when the exchange does not settle within a bounded number of
    /// deliveries.
    pub fn run_until_idle<'a, F>(&self, mut route: F) -> SyncResult<usize>
    where
        F: FnMut(&str, &str) -> Option<&'a SyncEngine>,
    {
        let mut delivered = 0;
        while let Some(envelope) = self.pop() {
            if delivered >= MAX_DELIVERIES {
                return Err(SyncError::transport_fatal("loopback exchange did not settle"));
            }
            let Envelope { from, message } = envelope;
            let target = message.header.target.clone();
            let Some(engine) = route(&target, &from) else {
                debug!(%target, %from, "no engine for message");
                continue;
            };
            delivered += 1;
            if let Err(err) = engine.on_message(message) {
                warn!(%target, %from, %err, "message handling failed");
            }
        }
        Ok(delivered)
    }
}

/// One device's view of a [`LoopbackNetwork`].
#[derive(Debug)]
pub struct LoopbackCommunicator {
    identity: String,
    network: Arc<LoopbackNetwork>,
}

impl Communicator for LoopbackCommunicator {
    fn send_message(&self, target: &str, message: Message, _timeout: Duration) -> SyncResult<()> {
        if self.network.offline.lock().contains(target) {
            return Err(SyncError::transport_retryable(format!("{target} is offline")));
        }
        message.validate()?;
        let bytes = message.encode_payload()?;
        let mut header = message.header.clone();
        header.target = target.to_string();
        let message = Message::decode(header, &bytes)?;
        self.network.queue.lock().push_back(Envelope {
            from: self.identity.clone(),
            message,
        });
        Ok(())
    }

    fn mtu_size(&self, _target: &str) -> u32 {
        *self.network.mtu.lock()
    }

    fn remote_communicator_version(&self, target: &str) -> Option<u16> {
        self.network.versions.lock().get(target).copied()
    }

    fn local_identity(&self) -> String {
        self.identity.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use distdb_codec::SOFTWARE_VERSION_CURRENT;
    use distdb_sync_protocol::{DataAckPacket, SyncCode};

    fn ack(target: &str) -> Message {
        Message::response(
            target,
            3,
            1,
            DataAckPacket::new(SOFTWARE_VERSION_CURRENT, SyncCode::Ok).with_data(9),
        )
    }

    #[test]
    fn messages_cross_the_wire() {
        let network = LoopbackNetwork::new();
        let a = network.endpoint("device-a");
        let _b = network.endpoint_with_version("device-b", 0);

        a.send_message("device-b", ack("device-b"), Duration::from_secs(1))
            .unwrap();
        assert_eq!(network.pending(), 1);
        let envelope = network.pop().unwrap();
        assert_eq!(envelope.from, "device-a");
        assert_eq!(envelope.message.header.target, "device-b");
        assert_eq!(envelope.message.ack_packet().unwrap().data, 9);

        assert_eq!(a.remote_communicator_version("device-b"), Some(0));
        assert_eq!(a.remote_communicator_version("device-z"), None);
    }

    #[test]
    fn offline_devices_refuse_sends() {
        let network = LoopbackNetwork::new();
        let a = network.endpoint("device-a");
        network.set_offline("device-b", true);
        let result = a.send_message("device-b", ack("device-b"), Duration::from_secs(1));
        assert!(result.unwrap_err().is_retryable());

        network.set_offline("device-b", false);
        a.send_message("device-b", ack("device-b"), Duration::from_secs(1))
            .unwrap();
        assert_eq!(network.pending(), 1);
    }

    #[test]
    fn unrouted_messages_are_dropped() {
        let network = LoopbackNetwork::new();
        let a = network.endpoint("device-a");
        network.set_mtu(512);
        assert_eq!(a.mtu_size("device-b"), 512);
        a.send_message("device-b", ack("device-b"), Duration::from_secs(1))
            .unwrap();
        let delivered = network.run_until_idle(|_, _| None).unwrap();
        assert_eq!(delivered, 0);
        assert_eq!(network.pending(), 0);
    }
}
