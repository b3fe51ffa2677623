//! TOML config loading and validation for the hub.

use anyhow::{bail, Context, Result};
use presence_link::TransportConfig;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub transport: TransportConfig,
    pub sync: SyncSettings,
    pub hub: HubSettings,
    pub web: WebSettings,
    pub db: DbSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Persistence attempts per event, including the first.
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    pub reinit_delay_ms: u64,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self { reinit_delay_ms: 30_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSettings {
    pub bind: String,
    pub port: u16,
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DbSettings {
    pub url: String,
}

impl Default for DbSettings {
    fn default() -> Self {
        Self {
            url: "sqlite:presence.db?mode=rwc".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate everything. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.transport.validate_into(&mut errors);

        if self.sync.max_attempts == 0 {
            errors.push("sync.max_attempts must be positive".to_string());
        }
        if self.sync.retry_delay_ms == 0 {
            errors.push("sync.retry_delay_ms must be positive".to_string());
        }
        if self.hub.reinit_delay_ms == 0 {
            errors.push("hub.reinit_delay_ms must be positive".to_string());
        }

        if self.web.bind.parse::<IpAddr>().is_err() {
            errors.push(format!("web.bind '{}' is not an IP address", self.web.bind));
        }
        if self.web.port == 0 {
            errors.push("web.port must be non-zero".to_string());
        }

        if !self.db.url.starts_with("sqlite:") {
            errors.push(format!("db.url '{}' is not a sqlite: url", self.db.url));
        }

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

    /// Apply `MQTT_HOST`, `MQTT_PORT`, `DB_URL` and `WEB_PORT`.
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
        if let Some(url) = lookup("DB_URL") {
            self.db.url = url;
        }
        if let Some(port) = lookup("WEB_PORT") {
            self.web.port = port
                .parse()
                .with_context(|| format!("WEB_PORT '{port}' is not a port number"))?;
        }
        Ok(())
    }

    pub fn web_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .web
            .bind
            .parse()
            .with_context(|| format!("web.bind '{}'", self.web.bind))?;
        Ok(SocketAddr::new(ip, self.web.port))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.sync.retry_delay_ms)
    }

    pub fn reinit_delay(&self) -> Duration {
        Duration::from_millis(self.hub.reinit_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, apply environment overrides, and validate a TOML config file.
/// A missing file means "all defaults".
pub fn load(path: &str) -> Result<Config> {
    let mut config: Config = match std::fs::read_to_string(path) {
        Ok(contents) => {
            toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
        Err(e) => return Err(e).with_context(|| format!("failed to read config: {path}")),
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
