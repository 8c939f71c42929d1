use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

use crate::licensing::api::looks_like_html;
use crate::licensing::config::{endpoints, LicensingConfig};
use crate::licensing::types::LicenseError;

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Serialize, Debug)]
struct StartRequest<'a> {
    device_id: &'a str,
    app_id: &'a str,
}

#[derive(Serialize, Debug)]
struct VerifyRequest<'a> {
    device_id: &'a str,
    app_id: &'a str,
    trial_token: &'a str,
    signature: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    verify_type: Option<&'a str>,
}

/// Token issued by the trial service
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct TrialStartResponse {
    pub trial_token: String,
    pub signature: String,
    pub expires_in_days: i64,
    #[serde(default)]
    pub first_launch_time: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct TrialVerifyResponse {
    /// `None` when the server did not say
    #[serde(default)]
    pub valid: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Token held by the caller, sent back for verification
#[derive(Clone, Copy, Debug)]
pub struct TrialCredentials<'a> {
    pub device_id: &'a str,
    pub app_id: &'a str,
    pub trial_token: &'a str,
    pub signature: &'a str,
}

// ============================================================================
// Service Traits
// ============================================================================

/// Remote trial service
#[async_trait]
pub trait TrialService: Send + Sync {
    async fn start(&self, device_id: &str, app_id: &str) -> Result<TrialStartResponse, LicenseError>;

    /// `full_check` asks the server for its explicit re-check
    async fn verify(&self, credentials: TrialCredentials<'_>, full_check: bool) -> Result<TrialVerifyResponse, LicenseError>;
}

/// Network reachability
#[async_trait]
pub trait Connectivity: Send + Sync {
    async fn is_network_available(&self) -> bool;
}

// ============================================================================
// HTTP Client
// ============================================================================

pub struct TrialApiClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl TrialApiClient {
    pub fn new(config: &LicensingConfig) -> Result<Self, LicenseError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.trial_timeout())
            .build()
            .map_err(|e| LicenseError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.trial_server_url.clone(),
            timeout: config.trial_timeout(),
        })
    }

    async fn post_json<B, R>(&self, url: &str, body: &B) -> Result<R, LicenseError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let response = self.client.post(url).json(body).send().await.map_err(|e| {
            if e.is_timeout() {
                LicenseError::Timeout(self.timeout.as_millis() as u64)
            } else {
                LicenseError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| LicenseError::Network(format!("Failed to read response: {}", e)))?;

        if looks_like_html(&text) {
            log::error!("Trial endpoint {} returned HTML (HTTP {})", url, status);
            return Err(LicenseError::HtmlResponse { endpoint: url.to_string() });
        }

        if !status.is_success() {
            let snippet: String = text.chars().take(200).collect();
            return Err(LicenseError::Server(format!("HTTP {}: {}", status, snippet)));
        }

        serde_json::from_str(&text).map_err(|e| LicenseError::Parse(format!("{}: {}", url, e)))
    }
}

#[async_trait]
impl TrialService for TrialApiClient {
    async fn start(&self, device_id: &str, app_id: &str) -> Result<TrialStartResponse, LicenseError> {
        let request = StartRequest { device_id, app_id };
        let response: TrialStartResponse = self.post_json(&endpoints::trial_start(&self.base_url), &request).await?;
        log::info!(
            "Trial started: expires_in_days={}, server first_launch_time={:?}",
            response.expires_in_days,
            response.first_launch_time
        );
        Ok(response)
    }

    async fn verify(&self, credentials: TrialCredentials<'_>, full_check: bool) -> Result<TrialVerifyResponse, LicenseError> {
        let request = VerifyRequest {
            device_id: credentials.device_id,
            app_id: credentials.app_id,
            trial_token: credentials.trial_token,
            signature: credentials.signature,
            verify_type: full_check.then_some("full_check"),
        };
        let response: TrialVerifyResponse = self.post_json(&endpoints::trial_verify(&self.base_url), &request).await?;
        log::debug!("Trial verify: valid={:?}, message={:?}", response.valid, response.message);
        Ok(response)
    }
}

// ============================================================================
// Reachability
// ============================================================================

/// Considers the network up when a TCP connection to the host succeeds
pub struct HostProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl HostProbe {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    /// Probe the host of `url`, using the scheme's default port
    pub fn for_url(url: &str, timeout: Duration) -> Result<Self, LicenseError> {
        let parsed = reqwest::Url::parse(url).map_err(|e| LicenseError::Parse(format!("Invalid URL {}: {}", url, e)))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| LicenseError::Parse(format!("URL has no host: {}", url)))?;
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| LicenseError::Parse(format!("URL has no port: {}", url)))?;
        Ok(Self::new(host, port, timeout))
    }
}

#[async_trait]
impl Connectivity for HostProbe {
    async fn is_network_available(&self) -> bool {
        let connect = tokio::net::TcpStream::connect((self.host.as_str(), self.port));
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                log::debug!("Reachability probe to {}:{} failed: {}", self.host, self.port, e);
                false
            }
            Err(_) => {
                log::debug!("Reachability probe to {}:{} timed out", self.host, self.port);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use serde_json::{json, Value};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client(base_url: String) -> TrialApiClient {
        let config = LicensingConfig {
            trial_server_url: base_url,
            ..Default::default()
        };
        TrialApiClient::new(&config).unwrap()
    }

    fn credentials() -> TrialCredentials<'static> {
        TrialCredentials {
            device_id: "device-1",
            app_id: "app",
            trial_token: "tok",
            signature: "sig",
        }
    }

    #[tokio::test]
    async fn test_start_parses_token() {
        let app = Router::new().route(
            "/start",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["device_id"], "device-1");
                assert_eq!(body["app_id"], "app");
                Json(json!({
                    "trial_token": "tok",
                    "signature": "sig",
                    "expires_in_days": 14,
                    "first_launch_time": 1_700_000_000_000i64
                }))
            }),
        );
        let client = client(serve(app).await);

        let response = client.start("device-1", "app").await.unwrap();
        assert_eq!(response.trial_token, "tok");
        assert_eq!(response.expires_in_days, 14);
        assert_eq!(response.first_launch_time, Some(1_700_000_000_000));
    }

    #[tokio::test]
    async fn test_start_without_server_anchor() {
        let app = Router::new().route(
            "/start",
            post(|| async { Json(json!({"trial_token": "t", "signature": "s", "expires_in_days": 10})) }),
        );
        let response = client(serve(app).await).start("d", "a").await.unwrap();
        assert_eq!(response.first_launch_time, None);
    }

    #[tokio::test]
    async fn test_verify_marks_full_check() {
        let app = Router::new().route(
            "/verify",
            post(|Json(body): Json<Value>| async move {
                let full = body.get("verify_type").and_then(Value::as_str) == Some("full_check");
                assert_eq!(body["trial_token"], "tok");
                Json(json!({"valid": !full, "message": if full { "revoked" } else { "ok" }}))
            }),
        );
        let client = client(serve(app).await);

        let quick = client.verify(credentials(), false).await.unwrap();
        assert_eq!(quick.valid, Some(true));

        let full = client.verify(credentials(), true).await.unwrap();
        assert_eq!(full.valid, Some(false));
        assert_eq!(full.message.as_deref(), Some("revoked"));
    }

    #[tokio::test]
    async fn test_verify_missing_valid_is_none() {
        let app = Router::new().route("/verify", post(|| async { Json(json!({"message": "hm"})) }));
        let response = client(serve(app).await).verify(credentials(), true).await.unwrap();
        assert_eq!(response.valid, None);
    }

    #[tokio::test]
    async fn test_server_error_and_malformed_body() {
        let app = Router::new()
            .route("/start", post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") }))
            .route("/verify", post(|| async { Json(json!({"valid": "yes"})) }));
        let client = client(serve(app).await);

        assert!(matches!(client.start("d", "a").await, Err(LicenseError::Server(_))));
        assert!(matches!(client.verify(credentials(), false).await, Err(LicenseError::Parse(_))));
    }

    #[tokio::test]
    async fn test_host_probe() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let up = HostProbe::new("127.0.0.1", port, Duration::from_secs(1));
        assert!(up.is_network_available().await);

        drop(listener);
        let down = HostProbe::new("127.0.0.1", 1, Duration::from_secs(1));
        assert!(!down.is_network_available().await);
    }

    #[test]
    fn test_probe_for_url() {
        let probe = HostProbe::for_url("https://licensing.example.com/api/trial", Duration::from_secs(1)).unwrap();
        assert_eq!(probe.host, "licensing.example.com");
        assert_eq!(probe.port, 443);
        assert!(HostProbe::for_url("not a url", Duration::from_secs(1)).is_err());
    }
}
