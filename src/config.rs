//! User-facing settings and the LoRa parameter preset table (§4.12, §6).
//!
//! Grounded on `config.py` for *what* is persisted (nick, radio params,
//! toggles, default key) while replacing its YAML loader — an explicitly
//! excluded external collaborator — with `serde`+`toml`, the way the
//! teacher already gates optional (de)serialization behind a `serde`
//! cargo feature for its own wire types.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::FreakMeshError;

/// Valid LoRa channel bandwidths in Hz (§6).
pub const VALID_BANDWIDTHS: [u32; 10] =
    [7800, 10400, 15600, 20800, 31250, 41700, 62500, 125000, 250000, 500000];
/// Valid coding rate denominators (4/x), inclusive range.
pub const CODING_RATE_RANGE: (u8, u8) = (5, 8);
/// Valid spreading factor, inclusive range.
pub const SPREADING_FACTOR_RANGE: (u8, u8) = (6, 12);
/// Valid TX power in dBm, inclusive range.
pub const TX_POWER_RANGE: (i8, i8) = (2, 20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preset {
    pub spreading: u8,
    pub coding_rate: u8,
    pub bandwidth_hz: u32,
}

/// Exact preset dictionary from §6 — part of the interoperable surface,
/// not just a convenience default.
pub const PRESETS: &[(&str, Preset)] = &[
    ("superfast", Preset { spreading: 7, coding_rate: 5, bandwidth_hz: 500_000 }),
    ("veryfast", Preset { spreading: 8, coding_rate: 6, bandwidth_hz: 250_000 }),
    ("fast", Preset { spreading: 9, coding_rate: 8, bandwidth_hz: 250_000 }),
    ("mid", Preset { spreading: 10, coding_rate: 8, bandwidth_hz: 250_000 }),
    ("far", Preset { spreading: 11, coding_rate: 8, bandwidth_hz: 125_000 }),
    ("veryfar", Preset { spreading: 12, coding_rate: 8, bandwidth_hz: 125_000 }),
    ("superfar", Preset { spreading: 12, coding_rate: 8, bandwidth_hz: 62_500 }),
];

pub fn preset_by_name(name: &str) -> Option<Preset> {
    PRESETS.iter().find(|(n, _)| *n == name).map(|(_, p)| *p)
}

pub fn is_valid_bandwidth(hz: u32) -> bool {
    VALID_BANDWIDTHS.contains(&hz)
}

pub fn is_valid_coding_rate(cr: u8) -> bool {
    (CODING_RATE_RANGE.0..=CODING_RATE_RANGE.1).contains(&cr)
}

pub fn is_valid_spreading_factor(sf: u8) -> bool {
    (SPREADING_FACTOR_RANGE.0..=SPREADING_FACTOR_RANGE.1).contains(&sf)
}

pub fn is_valid_tx_power(dbm: i8) -> bool {
    (TX_POWER_RANGE.0..=TX_POWER_RANGE.1).contains(&dbm)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RadioSettings {
    pub freq_hz: u32,
    pub bandwidth_hz: u32,
    pub coding_rate: u8,
    pub spreading_factor: u8,
    pub tx_power_dbm: i8,
}

impl Default for RadioSettings {
    fn default() -> Self {
        let p = preset_by_name("mid").unwrap();
        RadioSettings {
            freq_hz: 869_500_000,
            bandwidth_hz: p.bandwidth_hz,
            coding_rate: p.coding_rate,
            spreading_factor: p.spreading,
            tx_power_dbm: 10,
        }
    }
}

/// Persisted user overrides (§4.12, §6-c). Mirrors `config.py`'s set of
/// user-editable keys, minus the WiFi/IRC/Telegram transport payloads
/// (out of core scope — only their on/off toggles are kept here).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    pub nick: String,
    pub quiet: bool,
    pub check_crc: bool,
    pub automsg: bool,
    pub promiscuous: bool,
    pub default_key: Option<String>,
    pub radio: RadioSettings,
    pub wifi_enabled: bool,
    pub irc_enabled: bool,
    pub telegram_enabled: bool,
    pub relay_rssi_limit: i16,
    pub relay_num_tx: u32,
    pub duty_cycle_cap_pct: f64,
    pub sleep_battery_perc: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            nick: "freakmesh".to_string(),
            quiet: false,
            check_crc: true,
            automsg: false,
            promiscuous: false,
            default_key: None,
            radio: RadioSettings::default(),
            wifi_enabled: false,
            irc_enabled: false,
            telegram_enabled: false,
            relay_rssi_limit: -60,
            relay_num_tx: 3,
            duty_cycle_cap_pct: 10.0,
            sleep_battery_perc: 10,
        }
    }
}

impl Settings {
    /// Load settings from `path`, falling back to defaults if the file
    /// doesn't exist yet (first run).
    pub fn load(path: &Path) -> Result<Self, FreakMeshError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                toml::from_str(&contents).map_err(|e| FreakMeshError::Config(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Settings::default()),
            Err(e) => Err(FreakMeshError::Io(e)),
        }
    }

    /// Persist settings to `path`, creating parent directories as needed.
    /// Backs the `config save` command.
    pub fn save(&self, path: &Path) -> Result<(), FreakMeshError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let toml = toml::to_string_pretty(self).map_err(|e| FreakMeshError::Config(e.to_string()))?;
        fs::write(path, toml)?;
        Ok(())
    }

    /// Backs the `config reset` command: discard overrides and rewrite
    /// the defaults to disk.
    pub fn reset(path: &Path) -> Result<Self, FreakMeshError> {
        let settings = Settings::default();
        settings.save(path)?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_presets_match_the_interoperable_table() {
        assert_eq!(preset_by_name("superfast").unwrap(), Preset { spreading: 7, coding_rate: 5, bandwidth_hz: 500_000 });
        assert_eq!(preset_by_name("superfar").unwrap(), Preset { spreading: 12, coding_rate: 8, bandwidth_hz: 62_500 });
        assert!(preset_by_name("nonexistent").is_none());
    }

    #[test]
    fn bandwidth_validation_matches_the_allowed_set() {
        assert!(is_valid_bandwidth(125_000));
        assert!(!is_valid_bandwidth(100_000));
    }

    #[test]
    fn range_validators_are_inclusive() {
        assert!(is_valid_coding_rate(5) && is_valid_coding_rate(8));
        assert!(!is_valid_coding_rate(4) && !is_valid_coding_rate(9));
        assert!(is_valid_spreading_factor(6) && is_valid_spreading_factor(12));
        assert!(is_valid_tx_power(2) && is_valid_tx_power(20));
        assert!(!is_valid_tx_power(1) && !is_valid_tx_power(21));
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("freakmesh-cfg-{}", rand::random::<u64>()));
        let path = dir.join("settings.toml");
        let mut settings = Settings::default();
        settings.nick = "alice".to_string();
        settings.save(&path).unwrap();
        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded, settings);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = std::env::temp_dir().join(format!("freakmesh-cfg-missing-{}", rand::random::<u64>()));
        let path = dir.join("settings.toml");
        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded, Settings::default());
    }
}
