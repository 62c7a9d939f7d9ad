//! Sanity checks for a loaded configuration.
//!
//! Invalid values are either reset to their default (and reported) or flagged
//! as fatal, in which case the server should refuse to start.

use std::fmt;

use crate::error::ConfigError;
use crate::{AuthConfig, Config, GeneralConfig, ProtocolConfig};

/// How serious a [`ConfigIssue`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The value is legal but unusual.
    Warning,
    /// The value was illegal and has been replaced by its default.
    Defaulted,
    /// The value is illegal and cannot be recovered.
    Fatal,
}

/// A single finding from [`Config::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    /// Stable numeric code, printed as four hex digits.
    pub code: u16,
    /// Short summary.
    pub message: &'static str,
    /// Longer explanation.
    pub details: String,
    /// How serious the issue is.
    pub severity: Severity,
}

impl ConfigIssue {
    fn new(code: u16, message: &'static str, details: impl Into<String>, severity: Severity) -> Self {
        Self {
            code,
            message,
            details: details.into(),
            severity,
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x} : {} - {}", self.code, self.message, self.details)
    }
}

impl Config {
    /// Check every section, resetting recoverable values to their defaults.
    pub fn validate(&mut self) -> Vec<ConfigIssue> {
        let mut issues = self.general.validate();
        issues.extend(self.auth.validate());
        issues.extend(self.protocol.validate());
        issues
    }

    /// Validate, log non-fatal findings, and fail if anything fatal remains.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        let issues = self.validate();
        let mut fatal = Vec::new();
        for issue in issues {
            match issue.severity {
                Severity::Fatal => {
                    log::error!("{issue}");
                    fatal.push(issue);
                }
                Severity::Warning | Severity::Defaulted => log::warn!("{issue}"),
            }
        }

        if fatal.is_empty() {
            Ok(self)
        } else {
            Err(ConfigError::Invalid(fatal))
        }
    }
}

impl GeneralConfig {
    fn validate(&mut self) -> Vec<ConfigIssue> {
        let defaults = GeneralConfig::default();
        let mut issues = Vec::new();

        if self.port < 100 {
            self.port = defaults.port;
            issues.push(ConfigIssue::new(
                0x0001,
                "Invalid port",
                format!("Port must be between 100 and 65535 - using {}", defaults.port),
                Severity::Defaulted,
            ));
        }

        if self.max_players < 1 {
            self.max_players = defaults.max_players;
            issues.push(ConfigIssue::new(
                0x0002,
                "Invalid max players",
                format!("At least one player slot is required - using {}", defaults.max_players),
                Severity::Defaulted,
            ));
        } else if self.max_players > 16 {
            issues.push(ConfigIssue::new(
                0x0003,
                "High max player count",
                "It is recommended to keep the max player count at most 16",
                Severity::Warning,
            ));
        }

        if self.max_cars < 1 {
            self.max_cars = defaults.max_cars;
            issues.push(ConfigIssue::new(
                0x0004,
                "Invalid max cars",
                format!("At least one vehicle is required - using {}", defaults.max_cars),
                Severity::Defaulted,
            ));
        } else if self.max_cars > 4 {
            issues.push(ConfigIssue::new(
                0x0005,
                "High max car count",
                "It is recommended to keep the vehicle limit at most 4",
                Severity::Warning,
            ));
        }

        if self.resource_folder.is_empty() {
            self.resource_folder = defaults.resource_folder;
            issues.push(ConfigIssue::new(
                0x0006,
                "Invalid resource folder",
                "Resource folder should be set - default value will be used",
                Severity::Defaulted,
            ));
        }

        if self.map.is_empty() {
            self.map = defaults.map;
            issues.push(ConfigIssue::new(
                0x0007,
                "Invalid map",
                "Map path should be set - default value will be used",
                Severity::Defaulted,
            ));
        }

        issues
    }
}

impl AuthConfig {
    fn validate(&mut self) -> Vec<ConfigIssue> {
        let defaults = AuthConfig::default();
        let mut issues = Vec::new();

        if self.max_key_length == 0 {
            self.max_key_length = defaults.max_key_length;
            issues.push(ConfigIssue::new(
                0x0101,
                "Invalid max key length",
                format!("Key length limit must be positive - using {}", defaults.max_key_length),
                Severity::Defaulted,
            ));
        }

        if self.api_url.is_empty() {
            self.api_url = defaults.api_url;
            issues.push(ConfigIssue::new(
                0x0102,
                "Invalid auth API URL",
                "Auth API URL should be set - default value will be used",
                Severity::Defaulted,
            ));
        }

        if self.idle.enable && self.idle.seconds == 0 {
            issues.push(ConfigIssue::new(
                0x0103,
                "Invalid idle limit",
                "Idle detection is enabled with a zero length limit",
                Severity::Fatal,
            ));
        }

        if self.online.enable && self.online.seconds == 0 {
            issues.push(ConfigIssue::new(
                0x0104,
                "Invalid online quota",
                "Online quota is enabled with a zero length limit",
                Severity::Fatal,
            ));
        }

        issues
    }
}

impl ProtocolConfig {
    fn validate(&mut self) -> Vec<ConfigIssue> {
        let defaults = ProtocolConfig::default();
        let mut issues = Vec::new();

        if self.read_timeout_secs == 0 {
            self.read_timeout_secs = defaults.read_timeout_secs;
            issues.push(ConfigIssue::new(
                0x0201,
                "Invalid read timeout",
                format!("Read timeout must be positive - using {}s", defaults.read_timeout_secs),
                Severity::Defaulted,
            ));
        }

        match (
            semver::Version::parse(&self.min_client_version),
            semver::Version::parse(&self.max_client_version),
        ) {
            (Ok(min), Ok(max)) if min >= max => issues.push(ConfigIssue::new(
                0x0203,
                "Empty client version range",
                format!("min_client_version {min} must be below max_client_version {max}"),
                Severity::Fatal,
            )),
            (Ok(_), Ok(_)) => {}
            _ => issues.push(ConfigIssue::new(
                0x0202,
                "Invalid client version bounds",
                "min_client_version and max_client_version must be semantic versions",
                Severity::Fatal,
            )),
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_clean() {
        let mut config = Config::default();
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_low_port_reset_to_default() {
        let mut config = Config::default();
        config.general.port = 80;
        let issues = config.validate();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, 0x0001);
        assert_eq!(issues[0].severity, Severity::Defaulted);
        assert_eq!(config.general.port, 30814);
    }

    #[test]
    fn test_high_player_count_only_warns() {
        let mut config = Config::default();
        config.general.max_players = 32;
        let issues = config.validate();
        assert_eq!(issues[0].severity, Severity::Warning);
        assert_eq!(config.general.max_players, 32);
    }

    #[test]
    fn test_zero_players_defaulted() {
        let mut config = Config::default();
        config.general.max_players = 0;
        config.validate();
        assert_eq!(config.general.max_players, 10);
    }

    #[test]
    fn test_issue_display_format() {
        let issue = ConfigIssue::new(0x0006, "Invalid resource folder", "unset", Severity::Defaulted);
        assert_eq!(issue.to_string(), "0x0006 : Invalid resource folder - unset");
    }

    #[test]
    fn test_fatal_issue_rejects_config() {
        let mut config = Config::default();
        config.auth.online.enable = true;
        config.auth.online.seconds = 0;
        let result = config.validated();
        assert!(matches!(result, Err(ConfigError::Invalid(ref v)) if v[0].code == 0x0104));
    }

    #[test]
    fn test_unparseable_version_bound_is_fatal() {
        let mut config = Config::default();
        config.protocol.min_client_version = "two".to_string();
        let issues = config.validate();
        assert_eq!(issues[0].code, 0x0202);
        assert_eq!(issues[0].severity, Severity::Fatal);
    }

    #[test]
    fn test_inverted_version_range_is_fatal() {
        let mut config = Config::default();
        config.protocol.min_client_version = "3.0.0".to_string();
        config.protocol.max_client_version = "2.0.0".to_string();
        assert_eq!(config.validate()[0].code, 0x0203);
    }

    #[test]
    fn test_recoverable_issues_pass_validation() {
        let mut config = Config::default();
        config.general.resource_folder.clear();
        config.general.max_cars = 0;
        let config = config.validated().unwrap();
        assert_eq!(config.general.resource_folder, "Resources");
        assert_eq!(config.general.max_cars, 2);
    }
}
