//! The mesh engine: receive dispatch, relay, ACK, HELLO, TX watchdog and
//! the send-queue drain (§4.9).
//!
//! There's no single `engine.py`/`freakwan.py` equivalent worth porting
//! line-by-line (the reference firmware's main loop is a thin
//! `while True` that calls into the pieces this crate already models as
//! separate modules); this is built directly from the spec's receive
//! path, relay rules, ack rules and send-queue drain, wiring together
//! [`crate::codec`], [`crate::keychain`], [`crate::cache`],
//! [`crate::neighbors`] and [`crate::send_queue`]. Structurally it mirrors
//! the teacher's `Device<R, C, T, RNG, N>` in `device/src/async_device/mod.rs`:
//! one generic struct, parameterized over the radio trait, owning every
//! subsystem rather than handing subsystems a back-reference to itself
//! (per the "cyclic references" note in spec.md §9).

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{info, trace, warn};

use crate::cache::ProcessedCache;
use crate::codec;
use crate::config::Settings;
use crate::duty_cycle::DutyCycleTracker;
use crate::error::FreakMeshError;
use crate::identity::NodeId;
use crate::journal::Journal;
use crate::keychain::Keychain;
use crate::message::{flags, Body, MediaType, Message, MessageType, Payload};
use crate::neighbors::NeighborTable;
use crate::radio::{RadioConfig, RadioDriver, RadioEvent};
use crate::send_queue::SendQueue;

/// TX watchdog threshold (§4.9 send-queue drain, step 3a).
pub const TX_WATCHDOG: Duration = Duration::from_secs(60);
/// Retransmission backoff window (§4.9 send-queue drain, step 3c).
pub const TX_AGAIN_MIN_DELAY: Duration = Duration::from_millis(3_000);
pub const TX_AGAIN_MAX_DELAY: Duration = Duration::from_millis(8_000);
/// Random relay jitter (§4.9 relay rules).
pub const RELAY_MAX_DELAY: Duration = Duration::from_millis(2_500);
pub const PROCESSED_CACHE_CAPACITY: usize = 64;
pub const PROCESSED_CACHE_MIN_LIFETIME: Duration = Duration::from_secs(60);
/// Fixed journal record size: largest plaintext Data frame plus margin.
pub const JOURNAL_RECORD_SIZE: usize = 256;

/// What the engine hands to local transports (serial console, and in
/// the future BT/IRC/Telegram bridges) when something worth showing a
/// human happens. Replaces the teacher's direct-field back-reference
/// pattern with a narrow outbound channel (spec.md §9, "cyclic
/// references").
#[derive(Debug, Clone)]
pub enum Surfaced {
    Text { sender: NodeId, nick: String, text: String, rssi: i16 },
    Media { sender: NodeId, nick: String, media_type: MediaType, data: Vec<u8>, rssi: i16 },
    NewNode { sender: NodeId },
    Raw { bytes: Vec<u8> },
}

/// Per-uid bookkeeping retained in [`ProcessedCache`]: enough to decide
/// Ack suppression (property 9) without re-decoding the original frame.
#[derive(Debug, Default)]
struct TrackedMessage {
    acks: BTreeMap<NodeId, bool>,
}

pub struct MeshEngine<R: RadioDriver> {
    radio: R,
    events: mpsc::Receiver<RadioEvent>,
    radio_config: RadioConfig,
    node_id: NodeId,
    settings: Settings,
    keychain: Keychain,
    journal: Journal,
    cache: ProcessedCache<u32, TrackedMessage>,
    neighbors: NeighborTable,
    send_queue: SendQueue,
    duty: DutyCycleTracker,
    surfaced_tx: mpsc::Sender<Surfaced>,
    tx_started_at: Option<Instant>,
}

impl<R: RadioDriver> MeshEngine<R> {
    pub fn new(
        mut radio: R,
        radio_config: RadioConfig,
        node_id: NodeId,
        settings: Settings,
        keychain: Keychain,
        journal: Journal,
        surfaced_tx: mpsc::Sender<Surfaced>,
    ) -> Result<Self, FreakMeshError> {
        let events = radio.events();
        radio.configure(radio_config).map_err(|e| FreakMeshError::Radio(e.to_string()))?;
        radio.receive().map_err(|e| FreakMeshError::Radio(e.to_string()))?;
        Ok(MeshEngine {
            radio,
            events,
            radio_config,
            node_id,
            settings,
            keychain,
            journal,
            cache: ProcessedCache::new(PROCESSED_CACHE_CAPACITY, PROCESSED_CACHE_MIN_LIFETIME),
            neighbors: NeighborTable::new(),
            send_queue: SendQueue::new(),
            duty: DutyCycleTracker::new(
                crate::duty_cycle::DEFAULT_NUM_SLOTS,
                Duration::from_secs(crate::duty_cycle::DEFAULT_SLOT_SECS),
            ),
            surfaced_tx,
            tx_started_at: None,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn keychain_mut(&mut self) -> &mut Keychain {
        &mut self.keychain
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Originate a text Data message: build it, insert its uid into the
    /// dedup cache right away (scenario S4 relies on this: the
    /// originator must recognize its own relayed echo), and enqueue it.
    pub fn send_text(&mut self, text: String, key_name: Option<String>) -> Result<(), FreakMeshError> {
        let msg = Message::new_data(self.node_id, self.settings.nick.clone(), text, key_name);
        self.originate(msg)
    }

    pub fn send_media(
        &mut self,
        media_type: MediaType,
        data: Vec<u8>,
        key_name: Option<String>,
    ) -> Result<(), FreakMeshError> {
        let msg = Message::new_media(self.node_id, self.settings.nick.clone(), media_type, data, key_name);
        self.originate(msg)
    }

    fn originate(&mut self, msg: Message) -> Result<(), FreakMeshError> {
        let uid = msg.data_uid().expect("new_data/new_media always build a Data body");
        self.cache.insert(uid, TrackedMessage::default(), Instant::now());
        self.send_queue.push(msg).map_err(|_| FreakMeshError::QueueFull)
    }

    /// Pull and handle the next pending radio event, if any. Returns
    /// `false` if the radio's event channel has closed.
    pub async fn poll_radio_event(&mut self) -> Result<bool, FreakMeshError> {
        match self.events.recv().await {
            Some(RadioEvent::Rx { bytes, rssi_dbm, bad_crc }) => {
                self.handle_rx(bytes, rssi_dbm, bad_crc)?;
                Ok(true)
            }
            Some(RadioEvent::TxDone) => {
                self.tx_started_at = None;
                self.radio.mark_tx_done();
                self.duty.end_tx(Instant::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// §4.9 receive path, steps 1-5.
    pub fn handle_rx(&mut self, bytes: Vec<u8>, rssi: i16, bad_crc: bool) -> Result<(), FreakMeshError> {
        if self.settings.check_crc && bad_crc {
            trace!(rssi, "dropping frame with bad CRC");
            return Ok(());
        }
        if bytes.len() < 2 {
            warn!("decode failure: frame too short to carry a type tag");
            self.surface_raw_if_promiscuous(&bytes);
            return Ok(());
        }

        let type_tag = bytes[0];
        let wire_flags = bytes[1];
        let is_encrypted_data = type_tag == MessageType::Data as u8 && wire_flags & flags::ENCRYPTED != 0;

        if is_encrypted_data {
            match self.keychain.decrypt(&bytes) {
                Ok((key_name, plaintext)) => match codec::decode(&plaintext) {
                    Ok(mut msg) => {
                        msg.rssi = rssi;
                        msg.bad_crc = bad_crc;
                        msg.key_name = Some(key_name);
                        self.dispatch(msg)
                    }
                    Err(e) => {
                        warn!(error = %e, "decode failure on decrypted frame");
                        self.surface_raw_if_promiscuous(&bytes);
                        Ok(())
                    }
                },
                Err(_) => {
                    let (hdr_flags, uid, ttl) = codec::peek_data_header(&bytes)?;
                    self.handle_no_key(bytes, hdr_flags, uid, ttl, rssi);
                    Ok(())
                }
            }
        } else {
            match codec::decode(&bytes) {
                Ok(mut msg) => {
                    msg.rssi = rssi;
                    msg.bad_crc = bad_crc;
                    self.dispatch(msg)
                }
                Err(e) => {
                    warn!(error = %e, "decode failure");
                    self.surface_raw_if_promiscuous(&bytes);
                    Ok(())
                }
            }
        }
    }

    fn surface_raw_if_promiscuous(&self, bytes: &[u8]) {
        if self.settings.promiscuous {
            let _ = self.surfaced_tx.try_send(Surfaced::Raw { bytes: bytes.to_vec() });
        }
    }

    fn dispatch(&mut self, msg: Message) -> Result<(), FreakMeshError> {
        match msg.message_type() {
            MessageType::Data => self.handle_data(msg),
            MessageType::Ack => {
                self.handle_ack(msg);
                Ok(())
            }
            MessageType::Hello => {
                self.handle_hello(msg);
                Ok(())
            }
        }
    }

    /// A Data frame whose encrypting key we don't hold: we can still read
    /// its (cleartext) header, dedup and relay it byte-identically, but
    /// never surface, journal or Ack it (§3 invariants).
    fn handle_no_key(&mut self, bytes: Vec<u8>, hdr_flags: u8, uid: u32, ttl: u8, rssi: i16) {
        if self.cache.is_duplicate(&uid) {
            return;
        }
        self.cache.insert(uid, TrackedMessage::default(), Instant::now());

        let please_relay = hdr_flags & flags::PLEASE_RELAY != 0;
        if !please_relay || self.settings.quiet || rssi > self.settings.relay_rssi_limit || ttl <= 1 {
            return;
        }

        let mut relayed = bytes;
        relayed[1] = hdr_flags | flags::RELAYED;
        relayed[6] = ttl - 1;

        // The original sender is unrecoverable without the key (it lives
        // inside the ciphertext, not the cleartext header); it's never
        // read on this path since `ciphertext` makes the drain bypass
        // `codec::encode` entirely, so a zeroed placeholder is harmless.
        let mut msg = Message::new_data(NodeId::from_bytes([0; 6]), String::new(), String::new(), None);
        msg.flags = relayed[1];
        msg.no_key = true;
        msg.ciphertext = Some(relayed);
        msg.num_tx = self.settings.relay_num_tx;
        msg.send_time = Instant::now() + random_duration(Duration::ZERO, RELAY_MAX_DELAY);
        if let Body::Data { uid: u, ttl: t, .. } = &mut msg.body {
            *u = uid;
            *t = ttl - 1;
        }
        let _ = self.send_queue.push(msg);
    }

    fn handle_data(&mut self, msg: Message) -> Result<(), FreakMeshError> {
        let uid = msg.data_uid().expect("dispatch only routes Data bodies here");
        if self.cache.is_duplicate(&uid) {
            if self.cache.is_promiscuous() {
                self.surface_data(&msg);
            }
            return Ok(());
        }
        self.cache.insert(uid, TrackedMessage::default(), Instant::now());

        if !msg.is_relayed() {
            // Open question (spec.md §9) resolved: a Relayed Data never
            // refreshes the neighbor table, only a direct one does —
            // its RSSI reflects the relay, not the original sender.
            let nick = match &msg.body {
                Body::Data { nick, .. } => nick.clone(),
                _ => unreachable!(),
            };
            self.neighbors.observe(msg.sender, nick, msg.rssi, Instant::now());
        }

        if let Err(e) = self.journal_append(&msg) {
            warn!(error = %e, "journal append rejected");
        }

        self.surface_data(&msg);
        self.maybe_ack(&msg);
        self.maybe_relay(&msg);
        Ok(())
    }

    fn surface_data(&self, msg: &Message) {
        if let Body::Data { nick, payload, .. } = &msg.body {
            let surfaced = match payload {
                Payload::Text(text) => {
                    Surfaced::Text { sender: msg.sender, nick: nick.clone(), text: text.clone(), rssi: msg.rssi }
                }
                Payload::Media { media_type, media_data } => Surfaced::Media {
                    sender: msg.sender,
                    nick: nick.clone(),
                    media_type: *media_type,
                    data: media_data.clone(),
                    rssi: msg.rssi,
                },
            };
            let _ = self.surfaced_tx.try_send(surfaced);
        }
    }

    fn journal_append(&self, msg: &Message) -> Result<(), FreakMeshError> {
        let encoded = codec::encode(msg)?;
        self.journal.append(&encoded)?;
        Ok(())
    }

    /// §4.9 Ack rules: only non-media, non-relayed Data, outside quiet mode.
    fn maybe_ack(&mut self, msg: &Message) {
        if self.settings.quiet || msg.is_relayed() {
            return;
        }
        let Body::Data { uid, payload, .. } = &msg.body else { return };
        if matches!(payload, Payload::Media { .. }) {
            return;
        }
        let ack = Message::new_ack(self.node_id, *uid, MessageType::Data);
        let _ = self.send_queue.push(ack);
    }

    /// §4.9 relay rules.
    fn maybe_relay(&mut self, msg: &Message) {
        if self.settings.quiet || !msg.is_please_relay() {
            return;
        }
        if msg.rssi > self.settings.relay_rssi_limit {
            return;
        }
        let Body::Data { ttl, .. } = &msg.body else { return };
        if *ttl <= 1 {
            return;
        }

        let mut relay = msg.clone();
        relay.flags |= flags::RELAYED;
        if let Body::Data { ttl, .. } = &mut relay.body {
            *ttl -= 1;
        }
        relay.num_tx = self.settings.relay_num_tx;
        relay.send_time = Instant::now() + random_duration(Duration::ZERO, RELAY_MAX_DELAY);
        relay.send_canceled = false;
        let _ = self.send_queue.push(relay);
    }

    /// §4.9 Ack handling: record the acking sender, suppress further
    /// retransmission once every known neighbor has acked (property 9).
    fn handle_ack(&mut self, msg: Message) {
        let Body::Ack { uid, ack_type } = &msg.body else { return };
        if *ack_type != MessageType::Data {
            return;
        }
        let uid = *uid;
        let sender = msg.sender;
        if let Some(tracked) = self.cache.get_mut(&uid) {
            tracked.acks.insert(sender, true);
            let acked_everyone = !self.neighbors.is_empty() && tracked.acks.len() >= self.neighbors.len();
            if acked_everyone {
                self.send_queue.cancel(|m| m.data_uid() == Some(uid));
            }
        }
    }

    fn handle_hello(&mut self, msg: Message) {
        let Body::Hello { nick, .. } = &msg.body else { return };
        let is_new = self.neighbors.get(&msg.sender).is_none();
        self.neighbors.observe(msg.sender, nick.clone(), msg.rssi, Instant::now());
        if is_new {
            info!(sender = %msg.sender, "new node");
            let _ = self.surfaced_tx.try_send(Surfaced::NewNode { sender: msg.sender });
        }
    }

    fn encode_for_wire(&self, msg: &Message) -> Result<Vec<u8>, FreakMeshError> {
        if let Some(ciphertext) = &msg.ciphertext {
            return Ok(ciphertext.clone());
        }
        let mut plain = codec::encode(msg)?;
        match &msg.key_name {
            Some(key) => {
                // `codec::encode` always clears the Encrypted bit (it
                // doesn't know whether a key is involved); set it back
                // before handing the frame to the Keychain so a receiver's
                // `handle_rx` knows to run it through `decrypt`.
                plain[1] |= flags::ENCRYPTED;
                Ok(self.keychain.encrypt(&plain, key)?)
            }
            None => Ok(plain.to_vec()),
        }
    }

    /// One pass of the §4.9 send-queue drain, meant to be called from a
    /// ~10 Hz cron tick.
    pub fn drain_send_queue(&mut self, now: Instant) -> Result<(), FreakMeshError> {
        if self.duty.duty_cycle(now) >= self.settings.duty_cycle_cap_pct {
            return Ok(());
        }
        if self.radio.modem_is_receiving_packet() {
            return Ok(());
        }
        let Some(msg) = self.send_queue.pop_due(now) else { return Ok(()) };

        if self.radio.tx_in_progress() {
            if let Some(started) = self.tx_started_at {
                if now.saturating_duration_since(started) > TX_WATCHDOG {
                    warn!("tx watchdog fired, resetting radio");
                    self.radio.reset().map_err(|e| FreakMeshError::Radio(e.to_string()))?;
                    self.radio.configure(self.radio_config).map_err(|e| FreakMeshError::Radio(e.to_string()))?;
                    self.radio.receive().map_err(|e| FreakMeshError::Radio(e.to_string()))?;
                    self.tx_started_at = None;
                    let _ = self.send_queue.push(msg);
                    return Ok(());
                }
            }
            let _ = self.send_queue.push(msg);
            return Ok(());
        }

        let bytes = self.encode_for_wire(&msg)?;
        self.radio.send(&bytes).map_err(|e| FreakMeshError::Radio(e.to_string()))?;
        self.duty.start_tx(now);
        self.tx_started_at = Some(now);

        if msg.num_tx > 1 && !msg.send_canceled && !self.settings.quiet {
            let mut again = msg;
            again.num_tx -= 1;
            again.send_time = now + random_duration(TX_AGAIN_MIN_DELAY, TX_AGAIN_MAX_DELAY);
            let _ = self.send_queue.push(again);
        }
        Ok(())
    }

    /// Periodic HELLO emitter: evicts stale neighbors first, then
    /// enqueues a Hello advertising the current neighbor count.
    pub fn emit_hello(&mut self, now: Instant) {
        if self.settings.quiet {
            return;
        }
        self.neighbors.purge_stale(now);
        let hello = Message::new_hello(self.node_id, self.neighbors().len() as u8, self.settings.nick.clone(), "ok".to_string());
        let _ = self.send_queue.push(hello);
    }
}

fn random_duration(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let millis = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
    Duration::from_millis(millis as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::mock::MockRadio;

    fn test_engine() -> (MeshEngine<MockRadio>, mpsc::Receiver<Surfaced>) {
        let (tx, rx) = mpsc::channel(32);
        let dir = std::env::temp_dir().join(format!("freakmesh-engine-{}", rand::random::<u64>()));
        let keychain = Keychain::open(dir.join("keys")).unwrap();
        let journal = Journal::open(dir.join("journal"), JOURNAL_RECORD_SIZE, 50).unwrap();
        let mut settings = Settings::default();
        settings.nick = "node-a".to_string();
        let config = RadioConfig { freq_hz: 869_500_000, bandwidth_hz: 125_000, coding_rate: 8, spreading_factor: 10, tx_power_dbm: 10 };
        let engine = MeshEngine::new(
            MockRadio::new(),
            config,
            NodeId::from_bytes([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]),
            settings,
            keychain,
            journal,
            tx,
        )
        .unwrap();
        (engine, rx)
    }

    fn encode_plain(msg: &Message) -> Vec<u8> {
        codec::encode(msg).unwrap().to_vec()
    }

    /// Scenario S2: a relay-eligible Data frame heard weakly gets
    /// enqueued for relay with ttl decremented and Relayed set.
    #[test]
    fn s2_relay_decrement() {
        let (mut engine, _rx) = test_engine();
        engine.settings_mut().relay_rssi_limit = -60;
        let sender = NodeId::from_bytes([1, 2, 3, 4, 5, 6]);
        let msg = Message::new_data(sender, "alice".into(), "hi".into(), None);
        let bytes = encode_plain(&msg);

        engine.handle_rx(bytes, -90, false).unwrap();

        let relay = engine
            .send_queue
            .iter()
            .find(|m| matches!(m.body, Body::Data { .. }))
            .expect("relay should be enqueued");
        assert!(relay.is_relayed());
        assert!(relay.is_please_relay());
        match &relay.body {
            Body::Data { ttl, uid, .. } => {
                assert_eq!(*ttl, 14);
                assert_eq!(*uid, msg.data_uid().unwrap());
            }
            _ => panic!("expected Data"),
        }
    }

    /// Scenario S3: a non-relayed Data frame triggers an Ack.
    #[test]
    fn s3_ack_emitted() {
        let (mut engine, _rx) = test_engine();
        let sender = NodeId::from_bytes([1, 2, 3, 4, 5, 6]);
        let msg = Message::new_data(sender, "alice".into(), "hi".into(), None);
        let uid = msg.data_uid().unwrap();
        let bytes = encode_plain(&msg);

        engine.handle_rx(bytes, -40, false).unwrap();

        let mut saw_ack = false;
        while let Some(m) = engine.send_queue.pop_due(Instant::now() + Duration::from_secs(1)) {
            if let Body::Ack { uid: acked, ack_type } = m.body {
                if acked == uid && ack_type == MessageType::Data {
                    saw_ack = true;
                }
            }
        }
        assert!(saw_ack, "expected an Ack to be enqueued");
    }

    /// Scenario S4: the originator drops its own relayed echo without
    /// surfacing, acking, or relaying it again.
    #[test]
    fn s4_dedup_of_own_relayed_message() {
        let (mut engine, mut rx) = test_engine();
        engine.send_text("hi".into(), None).unwrap();
        let sent = engine.send_queue.pop_due(Instant::now() + Duration::from_secs(1)).unwrap();
        let uid = sent.data_uid().unwrap();

        let mut echoed = sent.clone();
        echoed.flags |= flags::RELAYED;
        if let Body::Data { ttl, .. } = &mut echoed.body {
            *ttl -= 1;
        }
        let bytes = encode_plain(&echoed);

        engine.handle_rx(bytes, -90, false).unwrap();

        assert!(engine.send_queue.is_empty(), "dedup'd echo must not be relayed");
        assert!(rx.try_recv().is_err(), "dedup'd echo must not be surfaced");
        let _ = uid;
    }

    /// Property 8: relay gating on rssi and ttl. Acks may still be
    /// enqueued (they're gated on quiet mode only); no *relay* (a Data
    /// message carrying `Relayed`) may appear in either case.
    fn has_relay(engine: &MeshEngine<MockRadio>) -> bool {
        engine
            .send_queue
            .iter()
            .any(|m| matches!(m.body, Body::Data { .. }) && m.is_relayed())
    }

    #[test]
    fn property_8_relay_gating() {
        let (mut engine, _rx) = test_engine();
        engine.settings_mut().relay_rssi_limit = -60;
        let sender = NodeId::from_bytes([1; 6]);

        // Strong signal: never relayed.
        let strong = Message::new_data(sender, "a".into(), "hi".into(), None);
        engine.handle_rx(encode_plain(&strong), -10, false).unwrap();
        assert!(!has_relay(&engine));

        // ttl <= 1: never relayed even if weak.
        let mut low_ttl = Message::new_data(sender, "a".into(), "hi2".into(), None);
        if let Body::Data { ttl, .. } = &mut low_ttl.body {
            *ttl = 1;
        }
        engine.handle_rx(encode_plain(&low_ttl), -90, false).unwrap();
        assert!(!has_relay(&engine));
    }

    /// Property 9: once every neighbor has acked, send_canceled is set
    /// before the next retransmission.
    #[test]
    fn property_9_ack_suppression() {
        let (mut engine, _rx) = test_engine();
        let neighbor = NodeId::from_bytes([2; 6]);
        engine.neighbors.observe(neighbor, "bob".into(), -50, Instant::now());

        engine.send_text("hi".into(), None).unwrap();
        let msg = engine.send_queue.front().unwrap().clone();
        let uid = msg.data_uid().unwrap();

        let ack = Message::new_ack(neighbor, uid, MessageType::Data);
        engine.handle_ack(ack);

        let front = engine.send_queue.pop_due(Instant::now() + Duration::from_secs(1)).unwrap();
        assert!(front.send_canceled);
    }
}
