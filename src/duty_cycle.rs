//! Regulatory duty-cycle accounting (§4.5).
//!
//! Grounded on `dutycycle.py`'s `DutyCycle` class: a fixed ring of slots,
//! each covering `slot_dur` seconds of wall-clock time, tagged by
//! `epoch = now / slot_dur`. Transmissions accumulate airtime into the
//! slot for the epoch they started in; stale slots (whose epoch has
//! rolled out of the valid window) are treated as empty rather than
//! explicitly cleared, same as the Python original.

use std::time::{Duration, Instant};

/// Number of slots in the ring. The Python default is also 12.
pub const DEFAULT_NUM_SLOTS: usize = 12;
/// Seconds covered by each slot. The Python default is also 300s (5 min),
/// giving a 1-hour tracking window across 12 slots.
pub const DEFAULT_SLOT_SECS: u64 = 300;

#[derive(Debug, Clone, Copy)]
struct Slot {
    epoch: i64,
    airtime_ms: u64,
}

/// Tracks airtime spent transmitting over a sliding window, and reports
/// the resulting duty cycle percentage.
pub struct DutyCycleTracker {
    slot_dur: Duration,
    slots: Vec<Slot>,
    started_at: Instant,
    tx_start: Option<(i64, Instant)>,
}

impl DutyCycleTracker {
    pub fn new(num_slots: usize, slot_dur: Duration) -> Self {
        DutyCycleTracker {
            slot_dur,
            slots: vec![Slot { epoch: -1, airtime_ms: 0 }; num_slots],
            started_at: Instant::now(),
            tx_start: None,
        }
    }

    fn epoch_at(&self, now: Instant) -> i64 {
        (now.saturating_duration_since(self.started_at).as_secs() / self.slot_dur.as_secs()) as i64
    }

    fn slot_index(&self, epoch: i64) -> usize {
        (epoch.rem_euclid(self.slots.len() as i64)) as usize
    }

    /// Mark the start of a transmission. Must be paired with [`Self::end_tx`].
    pub fn start_tx(&mut self, now: Instant) {
        let epoch = self.epoch_at(now);
        self.tx_start = Some((epoch, now));
    }

    /// Mark the end of the transmission started by the last [`Self::start_tx`]
    /// call, crediting its airtime to the slot for the epoch it *started* in
    /// (a transmission straddling a slot boundary is attributed entirely to
    /// its start slot, matching `dutycycle.py`).
    pub fn end_tx(&mut self, now: Instant) {
        let Some((epoch, start)) = self.tx_start.take() else {
            return;
        };
        let elapsed_ms = now.saturating_duration_since(start).as_millis() as u64;
        let idx = self.slot_index(epoch);
        if self.slots[idx].epoch == epoch {
            self.slots[idx].airtime_ms += elapsed_ms;
        } else {
            self.slots[idx] = Slot { epoch, airtime_ms: elapsed_ms };
        }
    }

    /// Duty cycle percentage over the tracked window, as of `now`. Slots
    /// whose epoch has aged out of the window (more than `num_slots` behind
    /// the current epoch) don't count, whether or not they still hold data.
    ///
    /// Matches `dutycycle.py`'s `get_duty_cycle()`: the average is taken
    /// over the slots that are actually valid right now, not over the full
    /// ring, so a freshly-started tracker (or one that hasn't yet lived a
    /// full window) reports the duty cycle of the time it has actually
    /// tracked rather than diluting it against slots that never existed.
    pub fn duty_cycle(&self, now: Instant) -> f64 {
        let current_epoch = self.epoch_at(now);
        let num_slots = self.slots.len() as i64;
        let valid_slots = self.slots.iter().filter(|s| s.epoch >= 0 && current_epoch - s.epoch < num_slots).count() as u64;
        if valid_slots == 0 {
            return 0.0;
        }
        let total_airtime_ms: u64 = self
            .slots
            .iter()
            .filter(|s| s.epoch >= 0 && current_epoch - s.epoch < num_slots)
            .map(|s| s.airtime_ms)
            .sum();
        let window_ms = (self.slot_dur.as_secs() * valid_slots * 1000) as f64;
        (total_airtime_ms as f64 / window_ms) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_transmission_contributes_expected_percentage() {
        let mut dc = DutyCycleTracker::new(2, Duration::from_secs(1));
        let t0 = Instant::now();
        dc.start_tx(t0);
        dc.end_tx(t0 + Duration::from_millis(20));
        // Only one of the two slots has ever been populated, so the
        // average is taken over that one valid slot: 1s * 1000ms = 1000ms;
        // 20ms / 1000ms * 100 = 2%.
        let pct = dc.duty_cycle(t0 + Duration::from_millis(20));
        assert!((pct - 2.0).abs() < 1e-9);
    }

    /// Scenario S6: once the window fills up, duty cycle approaches the
    /// ratio of transmit time to total elapsed time and old slots age out.
    #[test]
    fn old_slots_age_out_of_the_window() {
        let mut dc = DutyCycleTracker::new(2, Duration::from_secs(1));
        let t0 = Instant::now();
        dc.start_tx(t0);
        dc.end_tx(t0 + Duration::from_millis(500));

        // Jump far enough ahead that the original slot has aged out.
        let later = t0 + Duration::from_secs(10);
        assert_eq!(dc.duty_cycle(later), 0.0);
    }

    /// Scenario S6, literal figures: a 10% cap over 12 five-minute slots
    /// (a 1-hour window). Filling every slot with 30s of airtime puts the
    /// window at exactly the cap; one more transmission tips it over.
    #[test]
    fn s6_duty_cycle_cap_figures() {
        let mut dc = DutyCycleTracker::new(DEFAULT_NUM_SLOTS, Duration::from_secs(DEFAULT_SLOT_SECS));
        let t0 = Instant::now();

        let mut slot_start = t0;
        let mut last_tx_end = t0;
        for _ in 0..DEFAULT_NUM_SLOTS {
            dc.start_tx(slot_start);
            last_tx_end = slot_start + Duration::from_secs(30);
            dc.end_tx(last_tx_end);
            slot_start += Duration::from_secs(DEFAULT_SLOT_SECS as u64);
        }

        // 12 * 30s = 360s airtime out of a 3600s window = 10%.
        let pct = dc.duty_cycle(last_tx_end);
        assert!((pct - 10.0).abs() < 0.01, "expected ~10%, got {pct}");

        // One more second of transmission, still inside the same trailing
        // slot, pushes it over the cap.
        dc.start_tx(last_tx_end);
        let over = last_tx_end + Duration::from_secs(1);
        dc.end_tx(over);
        assert!(dc.duty_cycle(over) > 10.0);
    }

    #[test]
    fn repeated_transmissions_accumulate_within_a_slot() {
        let mut dc = DutyCycleTracker::new(4, Duration::from_secs(10));
        let t0 = Instant::now();
        for _ in 0..5 {
            dc.start_tx(t0);
            dc.end_tx(t0 + Duration::from_millis(100));
        }
        // Only the one slot that was ever written to counts as valid.
        let window_ms = 1.0 * 10.0 * 1000.0;
        let expected = (500.0 / window_ms) * 100.0;
        assert!((dc.duty_cycle(t0 + Duration::from_millis(500)) - expected).abs() < 1e-9);
    }
}
