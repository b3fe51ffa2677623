//! TOML config loading and validation for the node.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use presence_link::topic::is_valid_subject_id;
use presence_link::{Identity, TransportConfig};
use serde::Deserialize;

use crate::detector::{Detector, ImmediateDetector, PresenceDetector};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub transport: TransportConfig,
    pub detector: DetectorConfig,
    pub node: NodeSettings,
    pub source: SourceConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorMode {
    Debounced,
    Immediate,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Hardware address of the tracked device. Required.
    pub target_identity: String,
    pub mode: DetectorMode,
    pub debounce: u32,
    pub absence_timeout_ms: u64,
    /// Sightings must be strictly stronger than this (dBm).
    pub rssi_threshold: i32,
    pub scan_interval_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            target_identity: String::new(),
            mode: DetectorMode::Debounced,
            debounce: 3,
            absence_timeout_ms: 30_000,
            rssi_threshold: -80,
            scan_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    pub subject_id: String,
    pub status_refresh_ms: u64,
    pub reinit_delay_ms: u64,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            subject_id: "1".to_string(),
            status_refresh_ms: 60_000,
            reinit_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Built-in scan simulator (`sim` feature).
    Sim,
    /// `<address> <rssi>` lines from an external scanner on stdin.
    Stdin,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub scenario: String,
    pub background_devices: usize,
    pub commute_cycles: u32,
    /// Sightings buffered between cycles for push-style sources.
    pub queue_capacity: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Sim,
            scenario: "seated".to_string(),
            background_devices: 3,
            commute_cycles: 24,
            queue_capacity: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Signal strengths a BLE radio can report.
const RSSI_RANGE: std::ops::RangeInclusive<i32> = -127..=20;

impl Config {
    /// Validate everything. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.transport.validate_into(&mut errors);
        self.validate_detector(&mut errors);
        self.validate_node(&mut errors);
        self.validate_source(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_detector(&self, errors: &mut Vec<String>) {
        let d = &self.detector;

        if d.target_identity.trim().is_empty() {
            errors.push("detector.target_identity is required".to_string());
        } else if let Err(e) = d.target_identity.parse::<Identity>() {
            errors.push(format!("detector.target_identity: {e}"));
        }

        if d.debounce == 0 {
            errors.push("detector.debounce must be positive".to_string());
        }
        if d.scan_interval_ms == 0 {
            errors.push("detector.scan_interval_ms must be positive".to_string());
        }
        if d.absence_timeout_ms <= d.scan_interval_ms {
            errors.push(format!(
                "detector.absence_timeout_ms ({}) must exceed scan_interval_ms ({})",
                d.absence_timeout_ms, d.scan_interval_ms
            ));
        }
        if !RSSI_RANGE.contains(&d.rssi_threshold) {
            errors.push(format!(
                "detector.rssi_threshold {} out of range [{}, {}]",
                d.rssi_threshold,
                RSSI_RANGE.start(),
                RSSI_RANGE.end()
            ));
        }
    }

    fn validate_node(&self, errors: &mut Vec<String>) {
        let n = &self.node;
        if !is_valid_subject_id(&n.subject_id) {
            errors.push(format!(
                "node.subject_id '{}' is not usable in a topic",
                n.subject_id
            ));
        }
        if n.status_refresh_ms == 0 {
            errors.push("node.status_refresh_ms must be positive".to_string());
        }
        if n.reinit_delay_ms == 0 {
            errors.push("node.reinit_delay_ms must be positive".to_string());
        }
    }

    fn validate_source(&self, errors: &mut Vec<String>) {
        if self.source.kind == SourceKind::Sim && !cfg!(feature = "sim") {
            errors.push("source.kind = \"sim\" needs the `sim` feature".to_string());
        }
        if self.source.queue_capacity == 0 {
            errors.push("source.queue_capacity must be positive".to_string());
        }
    }

    /// Apply `MQTT_HOST`, `MQTT_PORT`, `SUBJECT_ID` and `SIM_SCENARIO`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MQTT_HOST") {
            self.transport.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT") {
            self.transport.port = port
                .parse()
                .with_context(|| format!("MQTT_PORT '{port}' is not a port number"))?;
        }
        if let Some(subject) = lookup("SUBJECT_ID") {
            self.node.subject_id = subject;
        }
        if let Some(scenario) = lookup("SIM_SCENARIO") {
            self.source.scenario = scenario;
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.detector.scan_interval_ms)
    }

    pub fn status_refresh(&self) -> Duration {
        Duration::from_millis(self.node.status_refresh_ms)
    }

    pub fn reinit_delay(&self) -> Duration {
        Duration::from_millis(self.node.reinit_delay_ms)
    }

    /// Build the detector this config describes.
    pub fn build_detector(&self) -> Result<Box<dyn Detector>> {
        let d = &self.detector;
        let target: Identity = d
            .target_identity
            .parse()
            .context("detector.target_identity")?;
        let timeout = Duration::from_millis(d.absence_timeout_ms);
        let subject = self.node.subject_id.clone();

        Ok(match d.mode {
            DetectorMode::Debounced => Box::new(PresenceDetector::new(
                subject,
                target,
                d.rssi_threshold,
                d.debounce,
                timeout,
            )),
            DetectorMode::Immediate => Box::new(ImmediateDetector::new(subject, target, d.rssi_threshold, timeout)),
        })
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, apply environment overrides, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let mut config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config.apply_env(|key| std::env::var(key).ok())?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
