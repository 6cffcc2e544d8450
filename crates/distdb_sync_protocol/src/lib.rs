//! # DistDB Sync Protocol
//!
//! Packet types and result codes for DistDB device-to-device sync.
//!
//! This crate provides:
//! - [`DataRequestPacket`], a batch of changes with watermarks and a packet id
//! - [`DataAckPacket`], the result code and watermark echo for a request
//! - [`SyncCode`] and [`SyncMode`]
//! - [`Message`], the envelope handed to a communicator
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod ack;
mod codes;
mod message;
mod mode;
mod request;

pub use ack::{is_packet_id_valid, DataAckPacket};
pub use codes::SyncCode;
pub use message::{Message, MessageHeader, MessageType, Payload};
pub use mode::SyncMode;
pub use request::{DataRequestPacket, IS_LAST_SEQUENCE};
