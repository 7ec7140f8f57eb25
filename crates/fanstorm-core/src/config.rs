//! Run configuration
//!
//! Every field has a default so a config file only needs to mention what
//! differs. CLI flags are applied on top by the binary.

use crate::error::ConfigError;
use crate::types::{NodeCredentials, NodeFailurePolicy, RampPlan, RemoteNode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level load test configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub platform: PlatformConfig,
    pub owner: OwnerConfig,
    pub ramp: RampConfig,
    pub identity: IdentityConfig,
    pub broadcast: BroadcastConfig,
    pub media: MediaConfig,
    pub fleet: FleetConfig,
}

/// REST endpoints of the platform under test
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Accounts, follows and streaming API
    pub api_base_url: String,

    /// Viewer join/leave bookkeeping service
    pub streams_base_url: String,

    /// Shared secret for the streams service
    pub streams_token: String,

    /// Port of the media server for origin and edge URLs
    pub media_port: u16,

    /// Password given to every simulated fan account
    pub fan_password: String,

    /// Per-request timeout enforced by the HTTP client
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000".to_string(),
            streams_base_url: "http://localhost:3100".to_string(),
            streams_token: String::new(),
            media_port: 1935,
            fan_password: "Password42".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Broadcast owner credentials
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnerConfig {
    pub email: String,
    /// OAuth token exchanged for an influencer session
    pub oauth_token: String,
    /// Existing broadcast to join in fan-only mode
    pub influencer_id: Option<u64>,
}

/// Virtual user admission settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RampConfig {
    /// Maximum concurrent virtual users
    pub concurrency: usize,

    /// Delay between admissions
    #[serde(with = "humantime_serde")]
    pub ramp_interval: Duration,

    /// Total users to admit before stopping; unbounded when unset
    pub max_users: Option<u64>,

    /// Keep the admission slot until the viewer's playback ends
    pub hold_slot_during_playback: bool,
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            ramp_interval: Duration::from_millis(500),
            max_users: None,
            hold_slot_during_playback: true,
        }
    }
}

/// Which fan accounts the virtual users play
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Sequence number of the first existing account
    pub existing_offset: u64,

    /// Share of virtual users that sign up as brand new accounts (0-100)
    pub percent_new: u8,

    /// Username prefix for every simulated fan
    pub name_prefix: String,

    /// Sign up the existing account pool before ramping
    pub precreate: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            existing_offset: 0,
            percent_new: 0,
            name_prefix: "testfan".to_string(),
            precreate: false,
        }
    }
}

/// Broadcast provisioning settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Media file pushed to the origin
    pub video_path: PathBuf,

    /// Delay between readiness polls
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Give up waiting for readiness after this many polls
    pub max_polls: Option<u32>,

    /// Time given to the encoder before viewers start joining
    #[serde(with = "humantime_serde")]
    pub push_warmup: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            video_path: PathBuf::from("640.flv"),
            poll_interval: Duration::from_secs(5),
            max_polls: None,
            push_warmup: Duration::from_secs(3),
        }
    }
}

/// External media binaries
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub encoder_binary: String,
    pub decoder_binary: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            encoder_binary: "ffmpeg".to_string(),
            decoder_binary: "rtmpdump".to_string(),
        }
    }
}

/// Remote worker fleet
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// ssh destinations; empty runs everything in-process
    pub hosts: Vec<String>,

    /// Private key for every host
    pub key_file: Option<PathBuf>,

    /// ssh client binary
    pub ssh_binary: String,

    /// fanstorm binary on the remote hosts
    pub remote_binary: String,

    pub failure_policy: NodeFailurePolicy,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            key_file: None,
            ssh_binary: "ssh".to_string(),
            remote_binary: "fanstorm".to_string(),
            failure_policy: NodeFailurePolicy::Abort,
        }
    }
}

impl RunConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load a TOML config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Check the settings shared by both run modes
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ramp.concurrency == 0 {
            return Err(ConfigError::Invalid("users must be greater than zero".to_string()));
        }
        if self.identity.percent_new > 100 {
            return Err(ConfigError::Invalid(format!(
                "percentnew must be between 0 and 100, got {}",
                self.identity.percent_new
            )));
        }
        if self.identity.name_prefix.is_empty() {
            return Err(ConfigError::Invalid("name prefix must not be empty".to_string()));
        }
        Ok(())
    }

    /// Check the settings needed to run only the fan side
    pub fn validate_fan_only(&self) -> Result<u64, ConfigError> {
        self.validate()?;
        self.owner
            .influencer_id
            .ok_or_else(|| ConfigError::Invalid("influencerid is required in fan mode".to_string()))
    }

    pub fn ramp_plan(&self) -> Result<RampPlan, ConfigError> {
        Ok(RampPlan::new(self.ramp.concurrency, self.ramp.ramp_interval)?
            .with_max_users(self.ramp.max_users))
    }

    /// Worker nodes, all sharing the fleet key file
    pub fn remote_nodes(&self) -> Vec<RemoteNode> {
        self.fleet
            .hosts
            .iter()
            .filter(|h| !h.trim().is_empty())
            .map(|address| RemoteNode {
                address: address.trim().to_string(),
                credentials: NodeCredentials {
                    key_file: self.fleet.key_file.clone(),
                },
            })
            .collect()
    }
}
