//! Broadcast provisioning for the owner account

use crate::error::{RunError, RunResult};
use fanstorm_client::{BroadcastOwner, InfluencerAccount};
use fanstorm_core::{BroadcastConfig, BroadcastSession};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// A ready broadcast and the account that owns it
#[derive(Clone, Debug)]
pub struct ProvisionedBroadcast {
    pub session: BroadcastSession,
    pub account: InfluencerAccount,
}

/// Signs in the broadcast owner, starts a stream and waits for it to be ready
pub struct BroadcastProvisioner<'a> {
    owner: &'a dyn BroadcastOwner,
    poll_interval: Duration,
    max_polls: Option<u32>,
}

impl<'a> BroadcastProvisioner<'a> {
    pub fn new(owner: &'a dyn BroadcastOwner, config: &BroadcastConfig) -> Self {
        Self {
            owner,
            poll_interval: config.poll_interval,
            max_polls: config.max_polls,
        }
    }

    /// Owner sign-in and stream creation failures are fatal to the run
    pub async fn provision(
        &self,
        email: &str,
        oauth_token: &str,
        cancel: &CancellationToken,
    ) -> RunResult<ProvisionedBroadcast> {
        info!("Signing in broadcast owner {}", email);
        let account = self
            .owner
            .sign_in_or_up(email, oauth_token)
            .await
            .map_err(|source| {
                error!("Broadcast owner sign-in failed: {}", source);
                RunError::Broadcast {
                    stage: "owner sign-in",
                    source,
                }
            })?;

        self.owner
            .create_stream(&account)
            .await
            .map_err(|source| RunError::Broadcast {
                stage: "create stream",
                source,
            })?;
        self.owner
            .create_stream_alerts(&account)
            .await
            .map_err(|source| RunError::Broadcast {
                stage: "stream alerts",
                source,
            })?;
        info!("Stream created for {} ({})", account.username, account.id);

        let mut session = BroadcastSession::pending(account.id, account.username.clone());
        let account = self.wait_until_ready(account, &mut session, cancel).await?;
        Ok(ProvisionedBroadcast { session, account })
    }

    async fn wait_until_ready(
        &self,
        mut account: InfluencerAccount,
        session: &mut BroadcastSession,
        cancel: &CancellationToken,
    ) -> RunResult<InfluencerAccount> {
        let mut polls = 0u32;
        loop {
            polls += 1;
            account = self
                .owner
                .status(&account)
                .await
                .map_err(|source| RunError::Broadcast {
                    stage: "status poll",
                    source,
                })?;
            session.observe(&account.server_status.origin_ip, account.server_status.ready);

            if session.ready {
                info!(
                    "Broadcast {} ready on {} after {} polls",
                    session.display_name, session.origin_host, polls
                );
                return Ok(account);
            }
            if self.max_polls.is_some_and(|max| polls >= max) {
                return Err(RunError::BroadcastNotReady(polls));
            }

            debug!("Broadcast not ready yet (poll {})", polls);
            tokio::select! {
                _ = cancel.cancelled() => return Err(RunError::Cancelled),
                _ = sleep(self.poll_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fanstorm_client::{ClientError, ClientResult, ServerStatus};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeOwner {
        ready_after: u32,
        polls: AtomicU32,
        reject_sign_in: bool,
    }

    impl FakeOwner {
        fn ready_after(polls: u32) -> Self {
            Self {
                ready_after: polls,
                polls: AtomicU32::new(0),
                reject_sign_in: false,
            }
        }
    }

    #[async_trait]
    impl BroadcastOwner for FakeOwner {
        async fn sign_in_or_up(&self, email: &str, _oauth_token: &str) -> ClientResult<InfluencerAccount> {
            if self.reject_sign_in {
                return Err(ClientError::Status {
                    method: "POST".to_string(),
                    url: "/api/v1/influencers/instagram_sign_in_or_up".to_string(),
                    status: 403,
                    body: "bad token".to_string(),
                });
            }
            Ok(InfluencerAccount {
                id: 7,
                email: email.to_string(),
                username: "hrant".to_string(),
                token: "owner".to_string(),
                server_status: ServerStatus::default(),
            })
        }

        async fn create_stream(&self, _account: &InfluencerAccount) -> ClientResult<()> {
            Ok(())
        }

        async fn create_stream_alerts(&self, _account: &InfluencerAccount) -> ClientResult<()> {
            Ok(())
        }

        async fn status(&self, account: &InfluencerAccount) -> ClientResult<InfluencerAccount> {
            let poll = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            let mut fresh = account.clone();
            fresh.server_status = ServerStatus {
                origin_ip: "10.0.0.5".to_string(),
                ready: poll >= self.ready_after,
            };
            Ok(fresh)
        }

        fn origin_url(&self, origin_host: &str, stream_name: &str) -> String {
            format!("rtmp://{}/live/{}", origin_host, stream_name)
        }
    }

    fn config(max_polls: Option<u32>) -> BroadcastConfig {
        BroadcastConfig {
            poll_interval: Duration::from_secs(5),
            max_polls,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_two_polls() {
        let owner = FakeOwner::ready_after(2);
        let provisioner = BroadcastProvisioner::new(&owner, &config(None));

        let broadcast = provisioner
            .provision("owner@e.com", "oauth", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(owner.polls.load(Ordering::SeqCst), 2);
        assert!(broadcast.session.ready);
        assert_eq!(broadcast.session.session_id, 7);
        assert_eq!(broadcast.session.origin_host, "10.0.0.5");
        assert_eq!(broadcast.session.display_name, "hrant");
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_polls() {
        let owner = FakeOwner::ready_after(10);
        let provisioner = BroadcastProvisioner::new(&owner, &config(Some(3)));

        let err = provisioner
            .provision("owner@e.com", "oauth", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::BroadcastNotReady(3)));
    }

    #[tokio::test]
    async fn test_owner_sign_in_failure_is_fatal() {
        let owner = FakeOwner {
            reject_sign_in: true,
            ..FakeOwner::ready_after(1)
        };
        let provisioner = BroadcastProvisioner::new(&owner, &config(None));

        let err = provisioner
            .provision("owner@e.com", "oauth", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Broadcast { stage: "owner sign-in", .. }));
        assert_eq!(owner.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_polling() {
        let owner = FakeOwner::ready_after(u32::MAX);
        let provisioner = BroadcastProvisioner::new(&owner, &config(None));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = provisioner.provision("owner@e.com", "oauth", &cancel).await.unwrap_err();
        assert!(matches!(err, RunError::Cancelled));
    }
}
