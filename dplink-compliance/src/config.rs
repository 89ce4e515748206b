//! Configuration for the compliance exerciser.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceConfig {
    /// Requested link settings.
    pub link: LinkConfig,
    /// Simulated sink behavior.
    pub sink: SinkConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Requested link settings for the training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Link rate: "rbr", "hbr", "hbr2", "hbr3".
    pub rate: String,
    /// Lane count: 1, 2 or 4.
    pub lanes: u8,
    /// Enable down-spread.
    pub spread: bool,
}

/// Simulated sink behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Highest rate the sink advertises: "rbr", "hbr", "hbr2", "hbr3".
    pub max_rate: String,
    /// Highest lane count the sink advertises.
    pub max_lanes: u8,
    /// Reject this many training sequences before converging.
    pub fail_attempts: u32,
    /// Converge only at this lane count or below.
    pub max_good_lanes: u8,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            sink: SinkConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            rate: "hbr2".into(),
            lanes: 4,
            spread: false,
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            max_rate: "hbr2".into(),
            max_lanes: 4,
            fail_attempts: 0,
            max_good_lanes: 4,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl ComplianceConfig {
    /// Load from `path`, falling back to defaults when the file is
    /// missing or malformed.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => match toml::from_str(&text) {
                Ok(cfg) => cfg,
                Err(e) => {
                    eprintln!("bad config {}: {e}; using defaults", path.display());
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

/// Parse a rate name from config.
pub fn parse_rate(name: &str) -> Option<dplink_core::LinkRate> {
    match name.to_ascii_lowercase().as_str() {
        "rbr" => Some(dplink_core::LinkRate::Rbr),
        "hbr" => Some(dplink_core::LinkRate::Hbr),
        "hbr2" => Some(dplink_core::LinkRate::Hbr2),
        "hbr3" => Some(dplink_core::LinkRate::Hbr3),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_roundtrip_through_toml() {
        let text = toml::to_string_pretty(&ComplianceConfig::default()).unwrap();
        let parsed: ComplianceConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.link.lanes, 4);
        assert_eq!(parsed.sink.max_rate, "hbr2");
    }

    #[test]
    fn rate_names() {
        assert_eq!(parse_rate("HBR2"), Some(dplink_core::LinkRate::Hbr2));
        assert_eq!(parse_rate("nonsense"), None);
    }
}
