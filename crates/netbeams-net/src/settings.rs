//! Protocol settings snapshot handed to every connection.

use std::time::Duration;

use netbeams_config::Config;
use semver::Version;

/// Errors turning a [`Config`] into [`ProtocolSettings`].
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("invalid client version bound {value:?}: {source}")]
    Version {
        value: String,
        #[source]
        source: semver::Error,
    },

    #[error("client version range {min}..{max} is empty")]
    EmptyRange { min: Version, max: Version },
}

/// Outcome of checking a client version against a [`VersionRange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    Accepted,
    TooOld,
    TooNew,
}

/// Half-open range `[min, max)` of accepted client versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    min: Version,
    max: Version,
}

impl VersionRange {
    pub fn new(min: Version, max: Version) -> Result<Self, SettingsError> {
        if min >= max {
            return Err(SettingsError::EmptyRange { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn parse(min: &str, max: &str) -> Result<Self, SettingsError> {
        let parse = |value: &str| {
            Version::parse(value).map_err(|source| SettingsError::Version {
                value: value.to_string(),
                source,
            })
        };
        Self::new(parse(min)?, parse(max)?)
    }

    pub fn check(&self, version: &Version) -> VersionCheck {
        if *version < self.min {
            VersionCheck::TooOld
        } else if *version >= self.max {
            VersionCheck::TooNew
        } else {
            VersionCheck::Accepted
        }
    }
}

/// Parse the version a client reports during authentication.
///
/// Clients send short forms like `2.0`, so missing minor or patch components
/// are filled with zeros before strict parsing.
pub fn parse_client_version(raw: &str) -> Result<Version, semver::Error> {
    let raw = raw.trim().trim_start_matches('v');
    let core_end = raw.find(['-', '+']).unwrap_or(raw.len());
    let (core, suffix) = raw.split_at(core_end);

    let mut padded = core.to_string();
    for _ in core.matches('.').count()..2 {
        padded.push_str(".0");
    }
    padded.push_str(suffix);
    Version::parse(&padded)
}

/// Everything a connection needs to know about the server's protocol rules.
#[derive(Debug, Clone)]
pub struct ProtocolSettings {
    pub versions: VersionRange,
    /// Longest auth key forwarded to the gateway, in bytes.
    pub max_key_length: usize,
    /// Deadline for handshake reads and gameplay polls.
    pub read_timeout: Duration,
    /// How long mod sync tolerates silence from the client.
    pub mod_sync_grace: Duration,
    /// How long a playing client may go without sending anything.
    pub idle_limit: Option<Duration>,
    pub map: String,
    pub password: Option<String>,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            versions: VersionRange {
                min: Version::new(2, 0, 0),
                max: Version::new(3, 0, 0),
            },
            max_key_length: 50,
            read_timeout: Duration::from_secs(5),
            mod_sync_grace: Duration::from_secs(5),
            idle_limit: Some(Duration::from_secs(600)),
            map: "/levels/gridmap_v2/info.json".to_string(),
            password: None,
        }
    }
}

impl ProtocolSettings {
    pub fn from_config(config: &Config) -> Result<Self, SettingsError> {
        let protocol = &config.protocol;
        let password = &config.general.password;

        Ok(Self {
            versions: VersionRange::parse(&protocol.min_client_version, &protocol.max_client_version)?,
            max_key_length: config.auth.max_key_length,
            read_timeout: protocol.read_timeout(),
            mod_sync_grace: protocol.mod_sync_grace(),
            idle_limit: config.auth.idle.duration(),
            map: config.general.map.clone(),
            password: (!password.is_empty()).then(|| password.clone()),
        })
    }
}
