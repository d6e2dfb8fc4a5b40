//! Control-plane HTTP API used before the websocket is up

use crate::config::RuntimeConfig;
use crate::error::{ProbeError, ProbeResult};
use crate::tls;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

pub const ENROLL_PATH: &str = "/api/v1/probe/enroll";
pub const AUTH_TOKEN_PATH: &str = "/api/v1/probe/auth/token";
pub const WS_PATH: &str = "/api/v1/probe/ws";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollRequest {
    pub enroll_token: String,
    pub agent_id: String,
    pub name: String,
    pub os_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrollResponse {
    pub probe_id: i64,
    pub probe_secret: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub config: Option<RuntimeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub probe_id: i64,
    pub probe_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub access_token: String,
    #[serde(default)]
    pub config: Option<RuntimeConfig>,
}

impl AuthResponse {
    pub fn runtime_config(&self) -> RuntimeConfig {
        self.config.unwrap_or_default().normalized()
    }
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
}

impl ApiClient {
    pub fn new(server_url: &str, insecure: bool) -> ProbeResult<Self> {
        let base = Url::parse(server_url)
            .map_err(|e| ProbeError::Config(format!("invalid server_url: {e}")))?;
        Ok(Self {
            http: tls::http_client(insecure)?,
            base,
        })
    }

    fn endpoint(&self, path: &str) -> ProbeResult<Url> {
        self.base
            .join(path)
            .map_err(|e| ProbeError::Config(format!("invalid endpoint {path}: {e}")))
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> ProbeResult<T> {
        let url = self.endpoint(path)?;
        debug!(%url, "POST");
        let response = self.http.post(url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProbeError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }

    pub async fn enroll(&self, request: &EnrollRequest) -> ProbeResult<EnrollResponse> {
        let response: EnrollResponse = self.post(ENROLL_PATH, request).await?;
        if response.probe_id <= 0 || response.probe_secret.is_empty() {
            return Err(ProbeError::Api {
                status: 200,
                body: "enrollment response is missing probe credentials".into(),
            });
        }
        Ok(response)
    }

    pub async fn auth_token(&self, probe_id: i64, probe_secret: &str) -> ProbeResult<AuthResponse> {
        let request = AuthRequest {
            probe_id,
            probe_secret: probe_secret.to_string(),
        };
        self.post(AUTH_TOKEN_PATH, &request).await
    }

    /// `ws://` or `wss://` form of the session endpoint
    pub fn ws_url(&self) -> ProbeResult<Url> {
        let mut url = self.endpoint(WS_PATH)?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ProbeError::Config(format!("cannot derive websocket url from {}", self.base)))?;
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_follows_http_scheme() {
        let api = ApiClient::new("https://console.example/base/", false).unwrap();
        assert_eq!(api.ws_url().unwrap().as_str(), "wss://console.example/api/v1/probe/ws");

        let api = ApiClient::new("http://127.0.0.1:8080", false).unwrap();
        assert_eq!(api.ws_url().unwrap().as_str(), "ws://127.0.0.1:8080/api/v1/probe/ws");
    }
}
