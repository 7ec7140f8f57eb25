//! reqwest implementation of the platform traits

use crate::api::*;
use crate::edge::{edge_redirect_url, origin_url, parse_edge_redirect};
use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use fanstorm_core::PlatformConfig;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

const FAN_TOKEN_HEADER: &str = "X-FAN-TOKEN";
const INFLUENCER_TOKEN_HEADER: &str = "X-INFLUENCER-TOKEN";
const STREAMS_TOKEN_HEADER: &str = "X-STREAMS-TOKEN";

/// Shared HTTP client for every virtual user.
///
/// Cloning is cheap; the underlying connection pool is shared.
#[derive(Clone, Debug)]
pub struct HttpPlatformClient {
    client: Client,
    api_base_url: String,
    streams_base_url: String,
    streams_token: String,
    media_port: u16,
}

impl HttpPlatformClient {
    pub fn new(config: &PlatformConfig) -> ClientResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            streams_base_url: config.streams_base_url.trim_end_matches('/').to_string(),
            streams_token: config.streams_token.clone(),
            media_port: config.media_port,
        })
    }

    fn api(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url, path)
    }

    fn streams(&self, path: &str) -> String {
        format!("{}{}", self.streams_base_url, path)
    }

    /// Send a request, turning non-2xx responses into [`ClientError::Status`]
    async fn send(&self, request: RequestBuilder) -> ClientResult<Response> {
        let request = request.header("Accept", "*/*").build()?;
        let method = request.method().to_string();
        let url = request.url().to_string();
        debug!("{} {}", method, url);

        let response = self.client.execute(request).await?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(ClientError::Status {
            method,
            url,
            status,
            body,
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> ClientResult<T> {
        Ok(self.send(request).await?.json().await?)
    }
}

/// Responses that mean "no such account" rather than a failure
fn is_unknown_account(status: u16) -> bool {
    status == StatusCode::UNAUTHORIZED.as_u16()
        || status == StatusCode::NOT_FOUND.as_u16()
        || status == StatusCode::UNPROCESSABLE_ENTITY.as_u16()
}

#[async_trait]
impl StreamPlatform for HttpPlatformClient {
    async fn sign_in(&self, email: &str, password: &str) -> ClientResult<Option<FanAccount>> {
        let request = self
            .client
            .post(self.api("/api/v1/fans/sign_in"))
            .json(&json!({ "fan": { "email": email, "password": password } }));

        match self.send_json(request).await {
            Ok(account) => Ok(Some(account)),
            Err(ClientError::Status { status, .. }) if is_unknown_account(status) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn sign_up(&self, email: &str, username: &str, password: &str) -> ClientResult<FanAccount> {
        let request = self.client.post(self.api("/api/v1/fans")).json(&json!({
            "fan": {
                "email": email,
                "username": username,
                "password": password,
                "password_confirmation": password,
            }
        }));
        self.send_json(request).await
    }

    async fn follow_influencer(&self, fan: &FanAccount, influencer_id: u64) -> ClientResult<()> {
        let request = self
            .client
            .post(self.api(&format!("/api/v1/influencers/{}/followers", influencer_id)))
            .header(FAN_TOKEN_HEADER, &fan.token)
            .json(&json!({}));
        self.send(request).await?;
        Ok(())
    }

    async fn join_stream(&self, influencer_id: u64, fan_id: u64) -> ClientResult<JoinedStream> {
        let request = self
            .client
            .post(self.streams(&format!("/api/v1/streams/{}/watchers", influencer_id)))
            .header(STREAMS_TOKEN_HEADER, &self.streams_token)
            .json(&json!({ "fan_id": fan_id }));
        self.send_json(request).await
    }

    async fn leave_stream(&self, influencer_id: u64, fan_id: u64) -> ClientResult<()> {
        let request = self
            .client
            .delete(self.streams(&format!(
                "/api/v1/streams/{}/watchers/{}",
                influencer_id, fan_id
            )))
            .header(STREAMS_TOKEN_HEADER, &self.streams_token);
        self.send(request).await?;
        Ok(())
    }

    async fn edge_url(&self, host: &str, stream_name: &str) -> ClientResult<String> {
        let request = self
            .client
            .get(edge_redirect_url(host, self.media_port, stream_name));
        let body = self.send(request).await?.text().await?;
        parse_edge_redirect(&body, stream_name)
    }

    async fn influencer_profile(&self, influencer_id: u64) -> ClientResult<InfluencerProfile> {
        let request = self
            .client
            .get(self.api(&format!("/api/v1/influencers/{}/profile", influencer_id)));
        self.send_json(request).await
    }
}

#[async_trait]
impl BroadcastOwner for HttpPlatformClient {
    async fn sign_in_or_up(&self, email: &str, oauth_token: &str) -> ClientResult<InfluencerAccount> {
        let request = self
            .client
            .post(self.api("/api/v1/influencers/instagram_sign_in_or_up"))
            .json(&json!({ "influencer": { "email": email, "oauth_token": oauth_token } }));
        self.send_json(request).await
    }

    async fn create_stream(&self, account: &InfluencerAccount) -> ClientResult<()> {
        let request = self
            .client
            .post(self.api(&format!("/api/v1/influencers/{}/streamings", account.id)))
            .header(INFLUENCER_TOKEN_HEADER, &account.token)
            .json(&json!({}));
        self.send(request).await?;
        Ok(())
    }

    async fn create_stream_alerts(&self, account: &InfluencerAccount) -> ClientResult<()> {
        let request = self
            .client
            .post(self.api(&format!("/api/v1/influencers/{}/stream_alerts", account.id)))
            .header(INFLUENCER_TOKEN_HEADER, &account.token)
            .json(&json!({}));
        self.send(request).await?;
        Ok(())
    }

    async fn status(&self, account: &InfluencerAccount) -> ClientResult<InfluencerAccount> {
        let request = self
            .client
            .get(self.api(&format!("/api/v1/influencers/{}", account.id)))
            .header(INFLUENCER_TOKEN_HEADER, &account.token);
        let mut fresh: InfluencerAccount = self.send_json(request).await?;
        if fresh.token.is_empty() {
            fresh.token = account.token.clone();
        }
        Ok(fresh)
    }

    fn origin_url(&self, origin_host: &str, stream_name: &str) -> String {
        origin_url(origin_host, self.media_port, stream_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> HttpPlatformClient {
        let config = PlatformConfig {
            api_base_url: server.uri(),
            streams_base_url: format!("{}/", server.uri()),
            streams_token: "streams-secret".to_string(),
            request_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        HttpPlatformClient::new(&config).unwrap()
    }

    fn fan_json(id: u64, name: &str) -> serde_json::Value {
        json!({ "id": id, "email": format!("{}@e.com", name), "username": name, "token": "tok" })
    }

    #[tokio::test]
    async fn test_sign_in_known_fan() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/fans/sign_in"))
            .and(body_partial_json(json!({ "fan": { "email": "testfan1@e.com" } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(fan_json(11, "testfan1")))
            .mount(&server)
            .await;

        let account = client_for(&server)
            .sign_in("testfan1@e.com", "Password42")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.id, 11);
        assert_eq!(account.username, "testfan1");
    }

    #[tokio::test]
    async fn test_sign_in_unknown_fan_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/fans/sign_in"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let result = client_for(&server).sign_in("nobody@e.com", "x").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_sign_in_server_error_propagates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/fans/sign_in"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let err = client_for(&server).sign_in("a@e.com", "x").await.unwrap_err();
        assert_eq!(err.status(), Some(503));
        assert!(err.to_string().contains("maintenance"));
    }

    #[tokio::test]
    async fn test_join_and_leave_use_streams_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/streams/7/watchers"))
            .and(header(STREAMS_TOKEN_HEADER, "streams-secret"))
            .and(body_partial_json(json!({ "fan_id": 11 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "origin_ip": "10.9.9.9" })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/streams/7/watchers/11"))
            .and(header(STREAMS_TOKEN_HEADER, "streams-secret"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let joined = client.join_stream(7, 11).await.unwrap();
        assert_eq!(joined.origin_ip, "10.9.9.9");
        client.leave_stream(7, 11).await.unwrap();
    }

    #[tokio::test]
    async fn test_follow_sends_fan_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/influencers/7/followers"))
            .and(header(FAN_TOKEN_HEADER, "tok"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let fan: FanAccount = serde_json::from_value(fan_json(11, "testfan1")).unwrap();
        client_for(&server).follow_influencer(&fan, 7).await.unwrap();
    }

    #[tokio::test]
    async fn test_influencer_status_keeps_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/influencers/7"))
            .and(header(INFLUENCER_TOKEN_HEADER, "owner-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 7,
                "username": "hrant",
                "server_status": { "origin_ip": "10.1.1.1", "ready": true }
            })))
            .mount(&server)
            .await;

        let account = InfluencerAccount {
            id: 7,
            email: "owner@e.com".to_string(),
            username: "hrant".to_string(),
            token: "owner-token".to_string(),
            server_status: ServerStatus::default(),
        };
        let fresh = client_for(&server).status(&account).await.unwrap();
        assert!(fresh.server_status.ready);
        assert_eq!(fresh.server_status.origin_ip, "10.1.1.1");
        assert_eq!(fresh.token, "owner-token");
    }
}
