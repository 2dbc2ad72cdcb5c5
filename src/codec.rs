//! Bit-exact encode/decode of the three on-air frame layouts (§4.1).
//!
//! All multi-byte integers are little-endian, matching `message.py`'s
//! `struct.pack("<BBLB6sB", ...)` calls. Grounded on the teacher's
//! `parser.rs`/`creator.rs` split between a decode side (`parse`/`decode`)
//! and an encode side (`*Creator::build`), here folded into one module
//! since our three frame kinds are flat rather than the LoRaWAN MAC
//! layer's nested structure.

use heapless::Vec as HVec;

use crate::error::CodecError;
use crate::identity::{NodeId, NODE_ID_LEN};
use crate::message::{flags, Body, MediaType, Message, MessageType, Payload};

/// Maximum size of an on-air frame. 255 bytes is the payload ceiling most
/// LoRa chips (SX1276/SX1262) support with an explicit header.
pub const MAX_FRAME_LEN: usize = 255;

/// Fixed-capacity buffer for an encoded frame, sized so it never needs a
/// heap allocation even though the rest of the crate is `std`-based —
/// mirrors the teacher's own `type Vec<T> = heapless::Vec<T, U256>;` in
/// the old `parser.rs` and `RadioBuffer<N>` in `device/src/radio.rs`.
pub type FrameBuf = HVec<u8, MAX_FRAME_LEN>;

fn push_all(buf: &mut FrameBuf, bytes: &[u8], total_len: usize) -> Result<(), CodecError> {
    buf.extend_from_slice(bytes).map_err(|_| CodecError::FrameTooLarge {
        len: total_len,
        max: MAX_FRAME_LEN,
    })
}

/// Encode a [`Message`] into its plaintext on-air representation. This is
/// the layout described in §4.1 *before* any Keychain encryption is
/// applied; [`crate::keychain::Keychain::encrypt`] consumes this output.
pub fn encode(msg: &Message) -> Result<FrameBuf, CodecError> {
    let mut buf = FrameBuf::new();
    match &msg.body {
        Body::Data { uid, ttl, nick, payload } => {
            if nick.len() > u8::MAX as usize {
                return Err(CodecError::FrameTooLarge { len: nick.len(), max: u8::MAX as usize });
            }
            let media_flag = if matches!(payload, Payload::Media { .. }) { flags::MEDIA } else { 0 };
            let header_len = 14 + nick.len()
                + match payload {
                    Payload::Text(t) => t.len(),
                    Payload::Media { media_data, .. } => 1 + media_data.len(),
                };
            push_all(&mut buf, &[MessageType::Data as u8], header_len)?;
            push_all(&mut buf, &[(msg.flags | media_flag) & !flags::ENCRYPTED], header_len)?;
            push_all(&mut buf, &uid.to_le_bytes(), header_len)?;
            push_all(&mut buf, &[*ttl], header_len)?;
            push_all(&mut buf, msg.sender.as_ref(), header_len)?;
            push_all(&mut buf, &[nick.len() as u8], header_len)?;
            push_all(&mut buf, nick.as_bytes(), header_len)?;
            match payload {
                Payload::Media { media_type, media_data } => {
                    push_all(&mut buf, &[media_type.to_u8()], header_len)?;
                    push_all(&mut buf, media_data, header_len)?;
                }
                Payload::Text(text) => {
                    push_all(&mut buf, text.as_bytes(), header_len)?;
                }
            }
        }
        Body::Ack { uid, ack_type } => {
            push_all(&mut buf, &[MessageType::Ack as u8], 13)?;
            push_all(&mut buf, &[msg.flags], 13)?;
            push_all(&mut buf, &uid.to_le_bytes(), 13)?;
            push_all(&mut buf, &[*ack_type as u8], 13)?;
            push_all(&mut buf, msg.sender.as_ref(), 13)?;
        }
        Body::Hello { seen, nick, status } => {
            let total = 10 + nick.len() + status.len();
            if nick.len() > u8::MAX as usize {
                return Err(CodecError::FrameTooLarge { len: nick.len(), max: u8::MAX as usize });
            }
            push_all(&mut buf, &[MessageType::Hello as u8], total)?;
            push_all(&mut buf, &[msg.flags], total)?;
            push_all(&mut buf, msg.sender.as_ref(), total)?;
            push_all(&mut buf, &[*seen], total)?;
            push_all(&mut buf, &[nick.len() as u8], total)?;
            push_all(&mut buf, nick.as_bytes(), total)?;
            push_all(&mut buf, status.as_bytes(), total)?;
        }
    }
    Ok(buf)
}

/// Decode a plaintext on-air frame (already decrypted, if it was
/// encrypted) into a [`Message`]. `rssi` and `bad_crc` are filled in by
/// the caller (the radio-layer adapter), since they are never on the
/// wire.
pub fn decode(buf: &[u8]) -> Result<Message, CodecError> {
    if buf.len() < 2 {
        return Err(CodecError::Truncated { need: 2, got: buf.len() });
    }
    let type_tag = buf[0];
    let flags = buf[1];
    let msg_type = MessageType::from_u8(type_tag).ok_or(CodecError::UnknownType(type_tag))?;

    match msg_type {
        MessageType::Data => decode_data(buf, flags),
        MessageType::Ack => decode_ack(buf, flags),
        MessageType::Hello => decode_hello(buf, flags),
    }
}

/// Read the `(type, flags, uid, ttl)` header of a Data frame without
/// decoding the rest. Valid for *both* plaintext and encrypted Data
/// frames: the Keychain envelope (§4.2) always keeps these first seven
/// bytes in the clear (with `Relayed` and `ttl` canonicalized) so a
/// `no_key` frame can still be deduplicated and relayed.
pub fn peek_data_header(buf: &[u8]) -> Result<(u8, u32, u8), CodecError> {
    if buf.len() < 7 {
        return Err(CodecError::Truncated { need: 7, got: buf.len() });
    }
    let flags = buf[1];
    let uid = u32::from_le_bytes(buf[2..6].try_into().unwrap());
    let ttl = buf[6];
    Ok((flags, uid, ttl))
}

fn read_sender(buf: &[u8], off: usize) -> Result<NodeId, CodecError> {
    if buf.len() < off + NODE_ID_LEN {
        return Err(CodecError::Truncated { need: off + NODE_ID_LEN, got: buf.len() });
    }
    let mut id = [0u8; NODE_ID_LEN];
    id.copy_from_slice(&buf[off..off + NODE_ID_LEN]);
    Ok(NodeId::from_bytes(id))
}

fn decode_data(buf: &[u8], flags: u8) -> Result<Message, CodecError> {
    const HEADER: usize = 14;
    if buf.len() < HEADER {
        return Err(CodecError::Truncated { need: HEADER, got: buf.len() });
    }
    let uid = u32::from_le_bytes(buf[2..6].try_into().unwrap());
    let ttl = buf[6];
    let sender = read_sender(buf, 7)?;
    let nick_len = buf[13] as usize;
    if buf.len() < HEADER + nick_len {
        return Err(CodecError::Truncated { need: HEADER + nick_len, got: buf.len() });
    }
    let nick = std::str::from_utf8(&buf[HEADER..HEADER + nick_len])
        .map_err(|_| CodecError::InvalidUtf8)?
        .to_string();
    let rest = &buf[HEADER + nick_len..];

    let payload = if flags & crate::message::flags::MEDIA != 0 {
        if rest.is_empty() {
            return Err(CodecError::Truncated { need: 1, got: 0 });
        }
        Payload::Media {
            media_type: MediaType::from_u8(rest[0]),
            media_data: rest[1..].to_vec(),
        }
    } else {
        Payload::Text(std::str::from_utf8(rest).map_err(|_| CodecError::InvalidUtf8)?.to_string())
    };

    Ok(Message {
        flags,
        bad_crc: false,
        sender,
        body: Body::Data { uid, ttl, nick, payload },
        key_name: None,
        no_key: false,
        ciphertext: None,
        rssi: 0,
        created_at: std::time::Instant::now(),
        send_time: std::time::Instant::now(),
        num_tx: 1,
        acks: Default::default(),
        send_canceled: false,
    })
}

fn decode_ack(buf: &[u8], flags: u8) -> Result<Message, CodecError> {
    const LEN: usize = 13;
    if buf.len() < LEN {
        return Err(CodecError::Truncated { need: LEN, got: buf.len() });
    }
    let uid = u32::from_le_bytes(buf[2..6].try_into().unwrap());
    let ack_type_raw = buf[6];
    let ack_type = MessageType::from_u8(ack_type_raw).ok_or(CodecError::UnknownType(ack_type_raw))?;
    let sender = read_sender(buf, 7)?;
    Ok(Message {
        flags,
        bad_crc: false,
        sender,
        body: Body::Ack { uid, ack_type },
        key_name: None,
        no_key: false,
        ciphertext: None,
        rssi: 0,
        created_at: std::time::Instant::now(),
        send_time: std::time::Instant::now(),
        num_tx: 1,
        acks: Default::default(),
        send_canceled: false,
    })
}

fn decode_hello(buf: &[u8], flags: u8) -> Result<Message, CodecError> {
    const HEADER: usize = 10;
    if buf.len() < HEADER {
        return Err(CodecError::Truncated { need: HEADER, got: buf.len() });
    }
    let sender = read_sender(buf, 2)?;
    let seen = buf[8];
    let nick_len = buf[9] as usize;
    if buf.len() < HEADER + nick_len {
        return Err(CodecError::Truncated { need: HEADER + nick_len, got: buf.len() });
    }
    let nick = std::str::from_utf8(&buf[HEADER..HEADER + nick_len])
        .map_err(|_| CodecError::InvalidUtf8)?
        .to_string();
    let status = std::str::from_utf8(&buf[HEADER + nick_len..])
        .map_err(|_| CodecError::InvalidUtf8)?
        .to_string();
    Ok(Message {
        flags,
        bad_crc: false,
        sender,
        body: Body::Hello { seen, nick, status },
        key_name: None,
        no_key: false,
        ciphertext: None,
        rssi: 0,
        created_at: std::time::Instant::now(),
        send_time: std::time::Instant::now(),
        num_tx: 1,
        acks: Default::default(),
        send_canceled: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario S1 from spec.md §8: exact on-air bytes for a plaintext
    /// Data message.
    #[test]
    fn s1_text_round_trip_exact_bytes() {
        let sender = NodeId::from_bytes([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]);
        let msg = Message {
            flags: 0,
            bad_crc: false,
            sender,
            body: Body::Data {
                uid: 0x1234_5678,
                ttl: 15,
                nick: "alice".to_string(),
                payload: Payload::Text("hi".to_string()),
            },
            key_name: None,
            no_key: false,
            ciphertext: None,
            rssi: 0,
            created_at: std::time::Instant::now(),
            send_time: std::time::Instant::now(),
            num_tx: 1,
            acks: Default::default(),
            send_canceled: false,
        };
        let encoded = encode(&msg).unwrap();
        let expected = [
            0x00, 0x00, 0x78, 0x56, 0x34, 0x12, 0x0F, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01, 0x05,
            0x61, 0x6C, 0x69, 0x63, 0x65, 0x68, 0x69,
        ];
        assert_eq!(encoded.as_slice(), &expected[..]);

        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.sender, sender);
        match decoded.body {
            Body::Data { uid, ttl, nick, payload } => {
                assert_eq!(uid, 0x1234_5678);
                assert_eq!(ttl, 15);
                assert_eq!(nick, "alice");
                assert_eq!(payload, Payload::Text("hi".to_string()));
            }
            _ => panic!("expected Data"),
        }
    }

    #[test]
    fn ack_round_trip() {
        let sender = NodeId::from_bytes([1, 2, 3, 4, 5, 6]);
        let msg = Message::new_ack(sender, 0xDEAD_BEEF, MessageType::Data);
        let encoded = encode(&msg).unwrap();
        assert_eq!(encoded.len(), 13);
        let decoded = decode(&encoded).unwrap();
        match decoded.body {
            Body::Ack { uid, ack_type } => {
                assert_eq!(uid, 0xDEAD_BEEF);
                assert_eq!(ack_type, MessageType::Data);
            }
            _ => panic!("expected Ack"),
        }
    }

    #[test]
    fn hello_round_trip() {
        let sender = NodeId::from_bytes([9; 6]);
        let msg = Message::new_hello(sender, 3, "bob".into(), "ok".into());
        let encoded = encode(&msg).unwrap();
        let decoded = decode(&encoded).unwrap();
        match decoded.body {
            Body::Hello { seen, nick, status } => {
                assert_eq!(seen, 3);
                assert_eq!(nick, "bob");
                assert_eq!(status, "ok");
            }
            _ => panic!("expected Hello"),
        }
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let buf = [0xFF, 0x00, 0, 0, 0, 0, 0];
        assert_eq!(decode(&buf), Err(CodecError::UnknownType(0xFF)));
    }

    #[test]
    fn decode_rejects_truncated_frame() {
        let buf = [0x00, 0x00, 0x01];
        assert!(matches!(decode(&buf), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn decode_rejects_non_utf8_nick() {
        let mut buf = vec![0x00, 0x00, 0, 0, 0, 0, 15, 1, 2, 3, 4, 5, 6, 1, 0xFF];
        buf.push(b'x');
        assert_eq!(decode(&buf), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn media_round_trip() {
        let sender = NodeId::from_bytes([2; 6]);
        let msg = Message::new_media(
            sender,
            "cam".into(),
            MediaType::SensorData,
            vec![3, 0, 0, 128, 63],
            None,
        );
        let encoded = encode(&msg).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert!(decoded.is_media());
        match decoded.body {
            Body::Data { payload: Payload::Media { media_type, media_data }, .. } => {
                assert_eq!(media_type, MediaType::SensorData);
                assert_eq!(media_data, vec![3, 0, 0, 128, 63]);
            }
            _ => panic!("expected media Data"),
        }
    }
}
