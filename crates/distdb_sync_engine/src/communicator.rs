//! Communicator abstraction for sync messages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use distdb_sync_protocol::Message;
use parking_lot::Mutex;

use crate::error::{SyncError, SyncResult};

/// Delivers sync messages to peer devices.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (a device bus, an in-process loopback, a mock for testing).
/// Sends are fire-and-forget; a returned error means the message never left.
pub trait Communicator: Send + Sync {
    /// Sends `message` to `target`.
    fn send_message(&self, target: &str, message: Message, timeout: Duration) -> SyncResult<()>;

    /// Largest frame the link to `target` carries, in bytes. Zero means unknown.
    fn mtu_size(&self, target: &str) -> u32;

    /// Communicator version of `target`, or `None` if the device is unknown.
    fn remote_communicator_version(&self, target: &str) -> Option<u16>;

    /// Identity of this device.
    fn local_identity(&self) -> String;
}

/// A mock communicator for testing.
///
/// Records every message it is asked to send.
#[derive(Debug)]
pub struct MockCommunicator {
    identity: String,
    mtu: AtomicU32,
    fail_sends: AtomicBool,
    remote_versions: Mutex<HashMap<String, u16>>,
    sent: Mutex<Vec<Message>>,
}

impl MockCommunicator {
    /// Creates a mock for the device `identity`.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            mtu: AtomicU32::new(0),
            fail_sends: AtomicBool::new(false),
            remote_versions: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Sets the reported MTU.
    pub fn set_mtu(&self, mtu: u32) {
        self.mtu.store(mtu, Ordering::SeqCst);
    }

    /// Makes every later send fail.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Registers the communicator version of a peer.
    pub fn set_remote_version(&self, device: impl Into<String>, version: u16) {
        self.remote_versions.lock().insert(device.into(), version);
    }

    /// Messages sent so far.
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    /// Drains the recorded messages.
    pub fn take_sent(&self) -> Vec<Message> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// The most recent message.
    pub fn last_sent(&self) -> Option<Message> {
        self.sent.lock().last().cloned()
    }
}

impl Communicator for MockCommunicator {
    fn send_message(&self, target: &str, message: Message, _timeout: Duration) -> SyncResult<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable(format!("send to {target} failed")));
        }
        message.validate()?;
        self.sent.lock().push(message);
        Ok(())
    }

    fn mtu_size(&self, _target: &str) -> u32 {
        self.mtu.load(Ordering::SeqCst)
    }

    fn remote_communicator_version(&self, target: &str) -> Option<u16> {
        self.remote_versions.lock().get(target).copied()
    }

    fn local_identity(&self) -> String {
        self.identity.clone()
    }
}
