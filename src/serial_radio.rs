//! [`RadioDriver`] implementation that talks to a companion LoRa module
//! over a serial link (§1 "binary wires the library to a real or
//! simulated radio").
//!
//! Grounded on the teacher's `InterfaceVariant`/`RadioKind` split in
//! `mod_traits.rs`: one trait's worth of narrow, named operations
//! implemented against one transport. Here the transport is a blocking
//! `tokio_serial` port instead of an SPI/GPIO bus — `RadioDriver`'s
//! methods are plain synchronous calls, so a blocking port avoids
//! reaching for `block_on` inside what is otherwise an async engine
//! loop. The wire framing is this module's own: each direction uses a
//! tiny length-prefixed record,
//!
//! ```text
//! [op: u8][len: u8][payload: len bytes]
//! ```
//!
//! `op` distinguishes a control command (configure/receive/send/reset)
//! from an event pushed upstream (Rx/TxDone), so both directions share
//! one byte stream without a separate command channel. The reader runs
//! on its own OS thread (the port has no async-cancellation story worth
//! building for a point-to-point link) and forwards decoded events into
//! the channel [`RadioDriver::events`] hands to the engine via
//! `blocking_send`.

use std::io::{self, Read, Write};
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;
use tokio_serial::SerialPort;
use tracing::warn;

// `SerialPort` extends `Read + Write`, so its trait objects can call
// read/write methods directly without an explicit upcast.

use crate::codec::MAX_FRAME_LEN;
use crate::radio::{RadioConfig, RadioDriver, RadioEvent};

const OP_CONFIGURE: u8 = 0x01;
const OP_RECEIVE: u8 = 0x02;
const OP_SEND: u8 = 0x03;
const OP_RESET: u8 = 0x04;
const OP_EVENT_RX: u8 = 0x10;
const OP_EVENT_TX_DONE: u8 = 0x11;

#[derive(Debug, thiserror::Error)]
pub enum SerialRadioError {
    #[error("serial I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {0} bytes exceeds the serial link's single-byte length prefix")]
    FrameTooLarge(usize),
}

fn write_record(port: &mut dyn SerialPort, op: u8, payload: &[u8]) -> Result<(), SerialRadioError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(SerialRadioError::FrameTooLarge(payload.len()));
    }
    port.write_all(&[op, payload.len() as u8])?;
    if !payload.is_empty() {
        port.write_all(payload)?;
    }
    port.flush()?;
    Ok(())
}

fn read_record(port: &mut dyn SerialPort) -> io::Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 2];
    port.read_exact(&mut header)?;
    let mut payload = vec![0u8; header[1] as usize];
    if !payload.is_empty() {
        port.read_exact(&mut payload)?;
    }
    Ok((header[0], payload))
}

/// Drives a companion LoRa module over a serial port.
pub struct SerialRadio {
    port: Box<dyn SerialPort>,
    events_tx: Option<mpsc::Sender<RadioEvent>>,
    events_rx: Option<mpsc::Receiver<RadioEvent>>,
    reader_thread: Option<JoinHandle<()>>,
    receiving: bool,
    tx_in_progress: bool,
}

impl SerialRadio {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, SerialRadioError> {
        let port = tokio_serial::new(path, baud_rate).open()?;
        let (events_tx, events_rx) = mpsc::channel(32);
        Ok(SerialRadio {
            port,
            events_tx: Some(events_tx),
            events_rx: Some(events_rx),
            reader_thread: None,
            receiving: false,
            tx_in_progress: false,
        })
    }

    fn spawn_reader(&mut self) {
        if self.reader_thread.is_some() {
            return;
        }
        let Some(tx) = self.events_tx.clone() else { return };
        let mut reader = match self.port.try_clone() {
            Ok(clone) => clone,
            Err(e) => {
                warn!(error = %e, "failed to clone serial port for reader thread");
                return;
            }
        };
        self.reader_thread = Some(thread::spawn(move || loop {
            let (op, payload) = match read_record(&mut reader) {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "serial reader thread exiting");
                    return;
                }
            };
            let event = match op {
                OP_EVENT_RX if payload.len() >= 2 => {
                    let rssi_dbm = payload[0] as i8 as i16;
                    let bad_crc = payload[1] != 0;
                    RadioEvent::Rx { bytes: payload[2..].to_vec(), rssi_dbm, bad_crc }
                }
                OP_EVENT_TX_DONE => RadioEvent::TxDone,
                other => {
                    warn!(op = other, "unknown serial radio event, dropping");
                    continue;
                }
            };
            if tx.blocking_send(event).is_err() {
                return;
            }
        }));
    }
}

impl RadioDriver for SerialRadio {
    type Error = SerialRadioError;

    fn configure(&mut self, config: RadioConfig) -> Result<(), Self::Error> {
        let mut payload = Vec::with_capacity(11);
        payload.extend_from_slice(&config.freq_hz.to_le_bytes());
        payload.extend_from_slice(&config.bandwidth_hz.to_le_bytes());
        payload.push(config.coding_rate);
        payload.push(config.spreading_factor);
        payload.push(config.tx_power_dbm as u8);
        write_record(&mut self.port, OP_CONFIGURE, &payload)
    }

    fn receive(&mut self) -> Result<(), Self::Error> {
        self.spawn_reader();
        self.receiving = true;
        write_record(&mut self.port, OP_RECEIVE, &[])
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        self.tx_in_progress = true;
        write_record(&mut self.port, OP_SEND, bytes)
    }

    fn modem_is_receiving_packet(&self) -> bool {
        false
    }

    fn tx_in_progress(&self) -> bool {
        self.tx_in_progress
    }

    fn receiving(&self) -> bool {
        self.receiving
    }

    fn reset(&mut self) -> Result<(), Self::Error> {
        self.tx_in_progress = false;
        write_record(&mut self.port, OP_RESET, &[])
    }

    fn mark_tx_done(&mut self) {
        self.tx_in_progress = false;
    }

    fn events(&mut self) -> mpsc::Receiver<RadioEvent> {
        self.events_rx.take().expect("events() channel already taken")
    }
}
