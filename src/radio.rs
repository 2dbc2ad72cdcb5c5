//! Abstract half-duplex LoRa radio contract (§4.8).
//!
//! Grounded on the teacher's `RadioKind`/`InterfaceVariant` split in
//! `mod_traits.rs`: a narrow trait the engine drives, implemented once
//! per board by code outside this crate. Unlike the teacher's poll-driven
//! `PhyRxTx`, events here are delivered over a channel rather than a
//! direct callback, per the concurrency model in SPEC_FULL.md §5: the
//! radio's interrupt context only needs to perform a non-blocking
//! `try_send` into a bounded `tokio::sync::mpsc` channel, never waiting on
//! the engine's lock.

use tokio::sync::mpsc;

/// One event surfaced by the radio driver to the engine.
#[derive(Debug, Clone)]
pub enum RadioEvent {
    /// A frame was received. `bad_crc` mirrors the virtual `BadCRC` flag
    /// from §3: the radio checked the frame's CRC in hardware and it
    /// failed, but the bytes are still delivered so promiscuous mode can
    /// inspect them.
    Rx { bytes: Vec<u8>, rssi_dbm: i16, bad_crc: bool },
    /// The in-flight transmission completed.
    TxDone,
}

/// Configuration applied by [`RadioDriver::configure`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadioConfig {
    pub freq_hz: u32,
    pub bandwidth_hz: u32,
    pub coding_rate: u8,
    pub spreading_factor: u8,
    pub tx_power_dbm: i8,
}

/// The operations the engine needs from a half-duplex LoRa radio.
/// Implemented once per board outside this crate; a board only needs to
/// translate its chip's register interface into these calls and feed
/// [`RadioEvent`]s into the channel returned by [`RadioDriver::events`].
pub trait RadioDriver: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Apply a new radio configuration. Called at startup and whenever a
    /// preset or individual radio parameter command changes it.
    fn configure(&mut self, config: RadioConfig) -> Result<(), Self::Error>;

    /// Enter continuous-receive mode. Frames subsequently arrive as
    /// [`RadioEvent::Rx`] on the channel from [`Self::events`].
    fn receive(&mut self) -> Result<(), Self::Error>;

    /// Transmit one frame. Completion arrives as [`RadioEvent::TxDone`].
    fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Listen-before-talk hint: true while the modem is in the middle of
    /// receiving a packet.
    fn modem_is_receiving_packet(&self) -> bool;

    fn tx_in_progress(&self) -> bool;

    fn receiving(&self) -> bool;

    /// Hard reset, used by the engine's TX watchdog to recover a radio
    /// wedged mid-transmission.
    fn reset(&mut self) -> Result<(), Self::Error>;

    /// Called by the engine when a [`RadioEvent::TxDone`] is consumed, so
    /// [`Self::tx_in_progress`] reflects hardware state rather than
    /// staying latched from the last [`Self::send`] forever.
    fn mark_tx_done(&mut self);

    /// The receiver half of the event channel this driver feeds. Taken
    /// once by the engine at construction time.
    fn events(&mut self) -> mpsc::Receiver<RadioEvent>;
}

/// An in-memory [`RadioDriver`], used by both unit tests in this crate
/// and by the integration tests under `tests/`. Kept as an ordinary
/// public module (not `#[cfg(test)]`-gated) so downstream integration
/// tests, which compile this crate without `cfg(test)`, can reach it.
pub mod mock {
    use super::*;
    use std::convert::Infallible;

    /// An in-memory radio for engine tests: `send` is recorded rather
    /// than transmitted, and test code injects [`RadioEvent`]s directly
    /// into the channel to simulate reception.
    pub struct MockRadio {
        pub sent: Vec<Vec<u8>>,
        pub config: Option<RadioConfig>,
        pub receiving_flag: bool,
        pub tx_in_progress_flag: bool,
        tx: mpsc::Sender<RadioEvent>,
        rx: Option<mpsc::Receiver<RadioEvent>>,
    }

    impl MockRadio {
        pub fn new() -> Self {
            let (tx, rx) = mpsc::channel(32);
            MockRadio {
                sent: Vec::new(),
                config: None,
                receiving_flag: false,
                tx_in_progress_flag: false,
                tx,
                rx: Some(rx),
            }
        }

        /// Test hook: simulate a frame arriving over the air.
        pub fn inject_rx(&self, bytes: Vec<u8>, rssi_dbm: i16, bad_crc: bool) {
            self.tx.try_send(RadioEvent::Rx { bytes, rssi_dbm, bad_crc }).unwrap();
        }

        pub fn inject_tx_done(&self) {
            self.tx.try_send(RadioEvent::TxDone).unwrap();
        }
    }

    impl Default for MockRadio {
        fn default() -> Self {
            Self::new()
        }
    }

    impl RadioDriver for MockRadio {
        type Error = Infallible;

        fn configure(&mut self, config: RadioConfig) -> Result<(), Self::Error> {
            self.config = Some(config);
            Ok(())
        }

        fn receive(&mut self) -> Result<(), Self::Error> {
            self.receiving_flag = true;
            Ok(())
        }

        fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
            self.sent.push(bytes.to_vec());
            self.tx_in_progress_flag = true;
            Ok(())
        }

        fn modem_is_receiving_packet(&self) -> bool {
            false
        }

        fn tx_in_progress(&self) -> bool {
            self.tx_in_progress_flag
        }

        fn receiving(&self) -> bool {
            self.receiving_flag
        }

        fn reset(&mut self) -> Result<(), Self::Error> {
            self.tx_in_progress_flag = false;
            self.receiving_flag = false;
            Ok(())
        }

        fn mark_tx_done(&mut self) {
            self.tx_in_progress_flag = false;
        }

        fn events(&mut self) -> mpsc::Receiver<RadioEvent> {
            self.rx.take().expect("events() channel already taken")
        }
    }

    #[test]
    fn mock_radio_records_sent_frames() {
        let mut radio = MockRadio::new();
        radio.send(&[1, 2, 3]).unwrap();
        assert_eq!(radio.sent, vec![vec![1, 2, 3]]);
        assert!(radio.tx_in_progress());
    }
}
