//! Message envelope exchanged through a communicator.

use distdb_codec::{CodecError, CodecResult};
use serde::Serialize;

use crate::ack::DataAckPacket;
use crate::request::DataRequestPacket;

/// Role of a message within an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MessageType {
    /// A data request.
    Request,
    /// An acknowledgement of a request.
    Response,
    /// An out-of-band acknowledgement, such as a watchdog notification.
    Notify,
}

/// Routing and correlation fields of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageHeader {
    /// Role of the message.
    pub message_type: MessageType,
    /// Device the message is addressed to.
    pub target: String,
    /// Session the message belongs to.
    pub session_id: u32,
    /// Transport-level sequence id.
    pub sequence_id: u32,
}

/// Decoded body of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Payload {
    /// Body of a [`MessageType::Request`].
    Request(DataRequestPacket),
    /// Body of a [`MessageType::Response`] or [`MessageType::Notify`].
    Ack(DataAckPacket),
}

/// A routed protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    /// Routing fields.
    pub header: MessageHeader,
    /// Body.
    pub payload: Payload,
}

impl Message {
    fn with(
        message_type: MessageType,
        target: impl Into<String>,
        session_id: u32,
        sequence_id: u32,
        payload: Payload,
    ) -> Self {
        Self {
            header: MessageHeader {
                message_type,
                target: target.into(),
                session_id,
                sequence_id,
            },
            payload,
        }
    }

    /// A request message.
    pub fn request(
        target: impl Into<String>,
        session_id: u32,
        sequence_id: u32,
        packet: DataRequestPacket,
    ) -> Self {
        Self::with(
            MessageType::Request,
            target,
            session_id,
            sequence_id,
            Payload::Request(packet),
        )
    }

    /// A response message.
    pub fn response(
        target: impl Into<String>,
        session_id: u32,
        sequence_id: u32,
        packet: DataAckPacket,
    ) -> Self {
        Self::with(
            MessageType::Response,
            target,
            session_id,
            sequence_id,
            Payload::Ack(packet),
        )
    }

    /// A notify message.
    pub fn notify(
        target: impl Into<String>,
        session_id: u32,
        sequence_id: u32,
        packet: DataAckPacket,
    ) -> Self {
        Self::with(
            MessageType::Notify,
            target,
            session_id,
            sequence_id,
            Payload::Ack(packet),
        )
    }

    /// Message role.
    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    /// Request body, if this is a request.
    pub fn request_packet(&self) -> Option<&DataRequestPacket> {
        match &self.payload {
            Payload::Request(packet) => Some(packet),
            Payload::Ack(_) => None,
        }
    }

    /// Ack body, if this is a response or notify.
    pub fn ack_packet(&self) -> Option<&DataAckPacket> {
        match &self.payload {
            Payload::Ack(packet) => Some(packet),
            Payload::Request(_) => None,
        }
    }

    /// Encoded body length.
    pub fn calculate_len(&self) -> CodecResult<usize> {
        match &self.payload {
            Payload::Request(packet) => packet.calculate_len(),
            Payload::Ack(packet) => packet.calculate_len(),
        }
    }

    /// Encodes the body.
    pub fn encode_payload(&self) -> CodecResult<Vec<u8>> {
        match &self.payload {
            Payload::Request(packet) => packet.serialize(),
            Payload::Ack(packet) => packet.serialize(),
        }
    }

    /// Rebuilds a message from its header and encoded body.
    pub fn decode(header: MessageHeader, bytes: &[u8]) -> CodecResult<Self> {
        let payload = match header.message_type {
            MessageType::Request => Payload::Request(DataRequestPacket::deserialize(bytes)?),
            MessageType::Response | MessageType::Notify => {
                Payload::Ack(DataAckPacket::deserialize(bytes)?)
            }
        };
        Ok(Self { header, payload })
    }

    /// Checks that the body matches the message role.
    pub fn validate(&self) -> CodecResult<()> {
        match (&self.header.message_type, &self.payload) {
            (MessageType::Request, Payload::Request(_))
            | (MessageType::Response | MessageType::Notify, Payload::Ack(_)) => Ok(()),
            _ => Err(CodecError::decoding_failed(
                "payload does not match message type",
            )),
        }
    }
}
