//! Configuration for a collaboration session.

use crate::codec::PresentationFilter;
use crate::presence::PresencePolicy;
use crate::protocol::{room_url, validate_room, DEFAULT_ROOM};
use crate::storage::StorageScope;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_SERVER_URL: &str = "ws://localhost:1234";
pub const DEFAULT_IDENTITY_PATH: &str = "collab-identity.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {name}: {value:?}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("Invalid room name: {0:?}")]
    InvalidRoom(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollabConfig {
    /// Relay base URL; the room name is appended as the path.
    #[serde(default = "default_server_url")]
    pub server_url: String,

    #[serde(default = "default_room")]
    pub room: String,

    #[serde(default)]
    pub presence: PresencePolicy,

    /// Fields never published to or accepted from peers.
    #[serde(default)]
    pub presentation: PresentationFilter,

    /// Where a stored identity lives when no identity provider is given.
    #[serde(default)]
    pub identity_scope: StorageScope,

    /// File backing the `local` identity scope.
    #[serde(default = "default_identity_path")]
    pub identity_path: PathBuf,
}

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

fn default_room() -> String {
    DEFAULT_ROOM.to_string()
}

fn default_identity_path() -> PathBuf {
    PathBuf::from(DEFAULT_IDENTITY_PATH)
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            room: default_room(),
            presence: PresencePolicy::default(),
            presentation: PresentationFilter::default(),
            identity_scope: StorageScope::default(),
            identity_path: default_identity_path(),
        }
    }
}

impl CollabConfig {
    /// Defaults for a given room.
    pub fn for_room(room: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            ..Self::default()
        }
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CollabConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden from the environment.
    ///
    /// - `COLLAB_SERVER_URL`
    /// - `COLLAB_ROOM`
    /// - `COLLAB_INCLUDE_CURSORLESS` (`true`/`false`/`1`/`0`)
    /// - `COLLAB_IDENTITY_PATH` (also selects the `local` identity scope)
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from a variable lookup.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(url) = lookup("COLLAB_SERVER_URL") {
            self.server_url = url;
        }
        if let Some(room) = lookup("COLLAB_ROOM") {
            self.room = room;
        }
        if let Some(value) = lookup("COLLAB_INCLUDE_CURSORLESS") {
            self.presence.include_cursorless = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        name: "COLLAB_INCLUDE_CURSORLESS",
                        value,
                    });
                }
            };
        }
        if let Some(path) = lookup("COLLAB_IDENTITY_PATH") {
            self.identity_path = PathBuf::from(path);
            self.identity_scope = StorageScope::Local;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        validate_room(&self.room).map_err(|_| ConfigError::InvalidRoom(self.room.clone()))?;
        Ok(())
    }

    /// Connection URL of the configured room.
    pub fn url(&self) -> Result<String> {
        room_url(&self.server_url, &self.room).map_err(|_| ConfigError::InvalidRoom(self.room.clone()))
    }
}
