//! Client configuration, read from a TOML file.
//!
//! ```toml
//! relay_url = "http://localhost:5000"
//! pending_candidate_limit = 0
//! negotiation_timeout_secs = 30
//!
//! [[ice_servers]]
//! id = "default-stun"
//! type = "stun"
//! url = "stun:stun.l.google.com:19302"
//! ```

use directories::ProjectDirs;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::peer::state::DEFAULT_NEGOTIATION_TIMEOUT;
use crate::peer::types::{IceServerKind, ServerConfig};

// Logging is verbose in debug builds only
#[cfg(debug_assertions)]
pub const DEFAULT_LOG_FILTER: &str = "debug";

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_FILTER: &str = "info";

pub const DEFAULT_RELAY_URL: &str = "http://localhost:5000";

const CONFIG_FILE: &str = "broadcast-session.toml";

static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            kind: IceServerKind::Stun,
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            kind: IceServerKind::Stun,
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub relay_url: String,
    pub ice_servers: Vec<ServerConfig>,
    /// Early remote candidates held per link; 0 rejects them outright.
    pub pending_candidate_limit: usize,
    /// Negotiation watchdog; 0 disables it.
    pub negotiation_timeout_secs: u64,
    pub log_filter: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            pending_candidate_limit: 0,
            negotiation_timeout_secs: DEFAULT_NEGOTIATION_TIMEOUT.as_secs(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl SessionConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path`, or the default location when `None`. A missing file
    /// yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        tracing::debug!(path = %path.display(), "loaded config");
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.relay_url.trim().is_empty() {
            return Err(Error::Config("relay_url cannot be empty".to_string()));
        }
        for server in &self.ice_servers {
            server.validate().map_err(Error::Config)?;
        }
        Ok(())
    }

    pub fn negotiation_timeout(&self) -> Option<Duration> {
        match self.negotiation_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// `<config dir>/broadcast-session.toml` for the current platform
pub fn default_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "broadcast-session", "broadcast-session")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}
