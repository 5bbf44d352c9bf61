//! Call configuration: signaling endpoint, ICE servers, side-channel label,
//! step timeout and the capture sources available on this machine.

use crate::error::{Error, Result};
use crate::media::MediaConstraints;
use crate::utils::add_ice_url_scheme;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080";
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_CHANNEL_LABEL: &str = "chat";

/// ICE server entry
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl ServerConfig {
    pub fn stun(url: &str) -> Self {
        Self {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    /// URL with its `stun:`/`turn:` scheme filled in
    pub fn normalized_url(&self) -> String {
        add_ice_url_scheme(self)
    }
}

/// Which capture sources exist locally, tried camera first
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MediaConfig {
    pub constraints: MediaConstraints,
    pub camera: bool,
    pub screen: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            constraints: MediaConstraints::default(),
            camera: true,
            screen: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CallConfig {
    /// Relay endpoint (ws:// or wss://)
    pub signaling_url: String,

    pub ice_servers: Vec<ServerConfig>,

    /// Label both peers agree on for the side channel
    pub data_channel_label: String,

    /// Upper bound for each offer/answer creation and description step
    pub description_timeout_secs: u64,

    pub media: MediaConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.into(),
            ice_servers: vec![ServerConfig::stun(DEFAULT_STUN_URL)],
            data_channel_label: DEFAULT_CHANNEL_LABEL.into(),
            description_timeout_secs: 10,
            media: MediaConfig::default(),
        }
    }
}

impl CallConfig {
    /// Read a JSON config file; missing keys fall back to defaults
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: CallConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        info!(
            "Loaded config from {}: signaling={} ice_servers={}",
            path.display(),
            config.signaling_url,
            config.ice_servers.len()
        );
        Ok(config)
    }

    pub fn description_timeout(&self) -> Duration {
        Duration::from_secs(self.description_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.signaling_url.starts_with("ws://") || self.signaling_url.starts_with("wss://")) {
            return Err(Error::InvalidConfig(format!(
                "signaling_url must be ws:// or wss://, got '{}'",
                self.signaling_url
            )));
        }

        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(Error::InvalidConfig("ICE server URL cannot be empty".into()));
            }

            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(Error::InvalidConfig(format!(
                    "TURN server '{}' requires username and credential",
                    server.id
                )));
            }
        }

        if self.data_channel_label.is_empty() {
            return Err(Error::InvalidConfig("data_channel_label cannot be empty".into()));
        }

        if self.description_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "description_timeout_secs must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
