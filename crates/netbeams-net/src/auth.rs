//! Player authentication against the BeamMP auth API.
//!
//! The client hands the server an opaque key; the server exchanges it for an
//! account via `POST <base>/pkToUser`. Connections only see the
//! [`AuthGateway`] trait so tests can substitute the network call.

use std::time::Duration;

use async_trait::async_trait;
use netbeams_config::AuthConfig;
use serde::Deserialize;

use crate::player::{Account, Player};
use crate::service::{Service, ServiceError, ServiceStatus, StatusWatch};

/// Request timeout for the auth API.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from resolving an auth key.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The request never produced an HTTP response.
    #[error("auth request failed: {0}")]
    Transport(String),

    #[error("auth API answered with status {0}")]
    Status(u16),

    /// The response body was not a player object.
    #[error("invalid auth API response: {0}")]
    Decode(#[source] std::io::Error),

    #[error("auth task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Resolves auth keys to verified players.
#[async_trait]
pub trait AuthGateway: Send + Sync {
    async fn authenticate(&self, key: &str) -> Result<Player, AuthError>;
}

/// Player object as returned by `pkToUser`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ApiPlayer {
    #[serde(rename = "__v")]
    pub version: i64,
    #[serde(rename = "_id")]
    pub id: String,
    pub username: String,
    pub guest: bool,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    pub identifiers: Vec<String>,
    pub public_key: String,
    pub roles: String,
    pub uid: String,
}

impl From<ApiPlayer> for Player {
    fn from(api: ApiPlayer) -> Self {
        Player {
            display_name: api.username.clone(),
            address: None,
            slot: None,
            account: Account {
                name: api.username,
                public_key: api.public_key,
                id: api.id,
                guest: api.guest,
                identifiers: api.identifiers,
                roles: api.roles,
                user_id: api.uid,
            },
        }
    }
}

/// HTTP client for the BeamMP auth API.
///
/// `ureq` is blocking, so each request runs on the blocking thread pool.
pub struct BeamMpApi {
    agent: ureq::Agent,
    base_url: String,
    user_agent: String,
    status: StatusWatch,
}

impl BeamMpApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
        Self {
            agent,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_agent: format!("NetBeams/{}", env!("CARGO_PKG_VERSION")),
            status: StatusWatch::new(),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.api_url.as_str())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn pk_to_user(
        agent: &ureq::Agent,
        url: &str,
        user_agent: &str,
        key: &str,
    ) -> Result<ApiPlayer, AuthError> {
        let response = agent
            .post(url)
            .set("Content-Type", "application/json")
            .set("Accept", "application/json")
            .set("User-Agent", user_agent)
            .send_json(serde_json::json!({ "key": key }));

        match response {
            Ok(resp) if resp.status() == 200 => resp.into_json().map_err(AuthError::Decode),
            Ok(resp) => Err(AuthError::Status(resp.status())),
            Err(ureq::Error::Status(code, _)) => Err(AuthError::Status(code)),
            Err(e) => Err(AuthError::Transport(e.to_string())),
        }
    }
}

#[async_trait]
impl AuthGateway for BeamMpApi {
    async fn authenticate(&self, key: &str) -> Result<Player, AuthError> {
        let agent = self.agent.clone();
        let url = format!("{}/pkToUser", self.base_url);
        let user_agent = self.user_agent.clone();
        let key = key.to_string();

        let api_player = tokio::task::spawn_blocking(move || {
            Self::pk_to_user(&agent, &url, &user_agent, &key)
        })
        .await??;

        tracing::debug!(
            player = %api_player.username,
            uid = %api_player.uid,
            roles = %api_player.roles,
            guest = api_player.guest,
            "Resolved auth key"
        );
        Ok(api_player.into())
    }
}

#[async_trait]
impl Service for BeamMpApi {
    fn name(&self) -> &str {
        "BeamMP API"
    }

    fn status_watch(&self) -> &StatusWatch {
        &self.status
    }

    async fn start(&self) -> Result<ServiceStatus, ServiceError> {
        tracing::info!(url = %self.base_url, "Using auth API");
        Ok(ServiceStatus::Healthy)
    }

    async fn stop(&self) -> Result<ServiceStatus, ServiceError> {
        Ok(ServiceStatus::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    struct Captured {
        url: String,
        body: String,
        user_agent: Option<String>,
        accept: Option<String>,
    }

    /// Serve exactly one request with the given status and body.
    fn fake_api(status: u16, body: &'static str) -> (String, thread::JoinHandle<Captured>) {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let port = server.server_addr().to_ip().unwrap().port();

        let handle = thread::spawn(move || {
            let mut request = server.recv().unwrap();
            let header = |name: &'static str| {
                request
                    .headers()
                    .iter()
                    .find(|h| h.field.equiv(name))
                    .map(|h| h.value.to_string())
            };
            let user_agent = header("User-Agent");
            let accept = header("Accept");
            let url = request.url().to_string();

            let mut content = String::new();
            request.as_reader().read_to_string(&mut content).unwrap();

            let response = tiny_http::Response::from_string(body).with_status_code(status);
            request.respond(response).unwrap();

            Captured {
                url,
                body: content,
                user_agent,
                accept,
            }
        });

        (format!("http://127.0.0.1:{port}"), handle)
    }

    const PLAYER_JSON: &str = r#"{
        "__v": 0,
        "_id": "64f0c0ffee",
        "username": "driver",
        "guest": false,
        "createdAt": "2023-09-01T00:00:00Z",
        "identifiers": ["beammp:1234"],
        "public_key": "pk-abc",
        "roles": "USER",
        "uid": "1234",
        "extra": "ignored"
    }"#;

    #[test]
    fn test_api_player_into_player() {
        let api: ApiPlayer = serde_json::from_str(PLAYER_JSON).unwrap();
        let player = Player::from(api);
        assert_eq!(player.display_name, "driver");
        assert_eq!(player.account.public_key, "pk-abc");
        assert_eq!(player.account.user_id, "1234");
        assert_eq!(player.account.identifiers, vec!["beammp:1234"]);
        assert!(player.slot.is_none());
    }

    #[test]
    fn test_missing_fields_default() {
        let api: ApiPlayer = serde_json::from_str(r#"{"username": "guest", "guest": true}"#).unwrap();
        assert!(api.guest);
        assert!(api.public_key.is_empty());
    }

    #[tokio::test]
    async fn test_authenticate_success() {
        let (url, server) = fake_api(200, PLAYER_JSON);
        let api = BeamMpApi::new(url);

        let player = api.authenticate("secret-key").await.unwrap();
        assert_eq!(player.display_name, "driver");

        let captured = server.join().unwrap();
        assert_eq!(captured.url, "/pkToUser");
        let body: serde_json::Value = serde_json::from_str(&captured.body).unwrap();
        assert_eq!(body["key"], "secret-key");
        assert!(captured.user_agent.unwrap().starts_with("NetBeams/"));
        assert_eq!(captured.accept.as_deref(), Some("application/json"));
    }

    #[tokio::test]
    async fn test_non_200_is_failure() {
        let (url, server) = fake_api(401, r#"{"error": "invalid key"}"#);
        let api = BeamMpApi::new(url);

        let result = api.authenticate("bad").await;
        assert!(matches!(result, Err(AuthError::Status(401))));
        server.join().unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_body_is_failure() {
        let (url, server) = fake_api(200, "not json");
        let api = BeamMpApi::new(url);

        let result = api.authenticate("key").await;
        assert!(matches!(result, Err(AuthError::Decode(_))));
        server.join().unwrap();
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let api = BeamMpApi::new("https://auth.example.com/");
        assert_eq!(api.base_url(), "https://auth.example.com");
    }
}
