//! Platform capabilities used by the load test

use crate::error::ClientResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Fan account returned by sign-in and sign-up
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanAccount {
    pub id: u64,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub username: String,
    pub token: String,
}

/// Stream server state reported for an influencer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    #[serde(default)]
    pub origin_ip: String,
    #[serde(default)]
    pub ready: bool,
}

/// Influencer account as seen by its owner
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfluencerAccount {
    pub id: u64,
    #[serde(default)]
    pub email: String,
    pub username: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub server_status: ServerStatus,
}

/// Public view of an influencer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfluencerProfile {
    pub id: u64,
    pub username: String,
}

/// Result of joining a stream as a viewer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinedStream {
    /// Host that redirects the viewer to an edge server
    pub origin_ip: String,
}

/// Viewer-side platform operations
#[async_trait]
pub trait StreamPlatform: Send + Sync {
    /// Sign in an existing fan. `Ok(None)` means the account is unknown.
    async fn sign_in(&self, email: &str, password: &str) -> ClientResult<Option<FanAccount>>;

    /// Create a fan account
    async fn sign_up(&self, email: &str, username: &str, password: &str) -> ClientResult<FanAccount>;

    async fn follow_influencer(&self, fan: &FanAccount, influencer_id: u64) -> ClientResult<()>;

    async fn join_stream(&self, influencer_id: u64, fan_id: u64) -> ClientResult<JoinedStream>;

    async fn leave_stream(&self, influencer_id: u64, fan_id: u64) -> ClientResult<()>;

    /// Resolve the playback URL a viewer of `stream_name` is redirected to
    async fn edge_url(&self, host: &str, stream_name: &str) -> ClientResult<String>;

    async fn influencer_profile(&self, influencer_id: u64) -> ClientResult<InfluencerProfile>;
}

/// Broadcaster-side platform operations
#[async_trait]
pub trait BroadcastOwner: Send + Sync {
    async fn sign_in_or_up(&self, email: &str, oauth_token: &str) -> ClientResult<InfluencerAccount>;

    async fn create_stream(&self, account: &InfluencerAccount) -> ClientResult<()>;

    async fn create_stream_alerts(&self, account: &InfluencerAccount) -> ClientResult<()>;

    /// Fetch the account with its current server status
    async fn status(&self, account: &InfluencerAccount) -> ClientResult<InfluencerAccount>;

    /// Ingest URL for the broadcast encoder
    fn origin_url(&self, origin_host: &str, stream_name: &str) -> String;
}
