//! The logical message model: [`MessageType`], wire flag bits, media types
//! and the in-memory [`Message`] with its non-wire annotations.
//!
//! Grounded on `message.py`'s `Message` class and on the teacher's
//! `PhyPayload`/`DataPayload` enums in `parser.rs`, adapted from a single
//! polymorphic Python object to a Rust tagged union.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::identity::NodeId;

/// Discriminant for the three message types (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Data = 0,
    Ack = 1,
    Hello = 2,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(MessageType::Data),
            1 => Some(MessageType::Ack),
            2 => Some(MessageType::Hello),
            _ => None,
        }
    }
}

/// Wire flag bits (bit indices, §3).
pub mod flags {
    pub const RELAYED: u8 = 1 << 0;
    pub const PLEASE_RELAY: u8 = 1 << 1;
    pub const FRAGMENT: u8 = 1 << 2;
    pub const MEDIA: u8 = 1 << 3;
    pub const ENCRYPTED: u8 = 1 << 4;
}

/// Virtual flag: never on the wire, set by the radio-layer adapter to
/// report a failed CRC on the received frame.
pub const FLAG_BAD_CRC: u16 = 1 << 8;

/// Media payload kind carried by a `Data` frame with the `Media` flag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MediaType {
    ImageFci = 0,
    SensorData = 1,
    Other(u8),
}

impl MediaType {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => MediaType::ImageFci,
            1 => MediaType::SensorData,
            other => MediaType::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            MediaType::ImageFci => 0,
            MediaType::SensorData => 1,
            MediaType::Other(v) => v,
        }
    }
}

/// Payload carried by a `Data` message: either text or a media blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Media { media_type: MediaType, media_data: Vec<u8> },
}

/// Type-specific fields. The common fields (type tag is implicit in the
/// variant, flags, sender) live directly on [`Message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Data {
        uid: u32,
        ttl: u8,
        nick: String,
        payload: Payload,
    },
    Ack {
        uid: u32,
        ack_type: MessageType,
    },
    Hello {
        seen: u8,
        nick: String,
        status: String,
    },
}

/// A decoded or locally-originated mesh message, with the non-wire
/// annotations `message.py` keeps on the Python object (`ctime`,
/// `send_time`, `num_tx`, `acks`, `rssi`, `send_canceled`, `no_key`, ...).
#[derive(Debug, Clone)]
pub struct Message {
    pub flags: u8,
    pub bad_crc: bool,
    pub sender: NodeId,
    pub body: Body,

    /// Key the frame was/should be encrypted under, if any.
    pub key_name: Option<String>,
    /// Set when the frame was encrypted under a key we don't hold: the
    /// original ciphertext is kept verbatim for relaying and nothing else
    /// may inspect or acknowledge it.
    pub no_key: bool,
    /// Preserved ciphertext for a `no_key` frame (content-addressed by the
    /// wire-level header fields already decoded into `body`).
    pub ciphertext: Option<Vec<u8>>,

    pub rssi: i16,
    pub created_at: Instant,
    pub send_time: Instant,
    pub num_tx: u32,
    pub acks: BTreeMap<NodeId, bool>,
    pub send_canceled: bool,
}

impl Message {
    /// Build a locally-originated Data message, matching the defaults in
    /// `Message.__init__` (`ttl=15`, `num_tx=1`, fresh uid).
    pub fn new_data(sender: NodeId, nick: String, text: String, key_name: Option<String>) -> Self {
        let now = Instant::now();
        Message {
            flags: flags::PLEASE_RELAY,
            bad_crc: false,
            sender,
            body: Body::Data {
                uid: rand::random(),
                ttl: 15,
                nick,
                payload: Payload::Text(text),
            },
            key_name,
            no_key: false,
            ciphertext: None,
            rssi: 0,
            created_at: now,
            send_time: now,
            num_tx: 1,
            acks: BTreeMap::new(),
            send_canceled: false,
        }
    }

    /// Build a locally-originated media Data message (e.g. an on-device
    /// image sent through `!image`).
    pub fn new_media(
        sender: NodeId,
        nick: String,
        media_type: MediaType,
        media_data: Vec<u8>,
        key_name: Option<String>,
    ) -> Self {
        let now = Instant::now();
        Message {
            flags: flags::PLEASE_RELAY | flags::MEDIA,
            bad_crc: false,
            sender,
            body: Body::Data {
                uid: rand::random(),
                ttl: 15,
                nick,
                payload: Payload::Media { media_type, media_data },
            },
            key_name,
            no_key: false,
            ciphertext: None,
            rssi: 0,
            created_at: now,
            send_time: now,
            num_tx: 1,
            acks: BTreeMap::new(),
            send_canceled: false,
        }
    }

    pub fn new_ack(sender: NodeId, uid: u32, ack_type: MessageType) -> Self {
        let now = Instant::now();
        Message {
            flags: 0,
            bad_crc: false,
            sender,
            body: Body::Ack { uid, ack_type },
            key_name: None,
            no_key: false,
            ciphertext: None,
            rssi: 0,
            created_at: now,
            send_time: now,
            num_tx: 1,
            acks: BTreeMap::new(),
            send_canceled: false,
        }
    }

    pub fn new_hello(sender: NodeId, seen: u8, nick: String, status: String) -> Self {
        let now = Instant::now();
        Message {
            flags: 0,
            bad_crc: false,
            sender,
            body: Body::Hello { seen, nick, status },
            key_name: None,
            no_key: false,
            ciphertext: None,
            rssi: 0,
            created_at: now,
            send_time: now,
            num_tx: 1,
            acks: BTreeMap::new(),
            send_canceled: false,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self.body {
            Body::Data { .. } => MessageType::Data,
            Body::Ack { .. } => MessageType::Ack,
            Body::Hello { .. } => MessageType::Hello,
        }
    }

    pub fn is_relayed(&self) -> bool {
        self.flags & flags::RELAYED != 0
    }

    pub fn is_please_relay(&self) -> bool {
        self.flags & flags::PLEASE_RELAY != 0
    }

    pub fn is_media(&self) -> bool {
        self.flags & flags::MEDIA != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & flags::ENCRYPTED != 0
    }

    /// The `uid` of a `Data` message, if this is one.
    pub fn data_uid(&self) -> Option<u32> {
        match &self.body {
            Body::Data { uid, .. } => Some(*uid),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_data_has_please_relay_and_ttl_15() {
        let m = Message::new_data(NodeId::from_bytes([1; 6]), "a".into(), "hi".into(), None);
        assert!(m.is_please_relay());
        assert!(!m.is_relayed());
        match m.body {
            Body::Data { ttl, .. } => assert_eq!(ttl, 15),
            _ => panic!("expected Data"),
        }
    }
}
