use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::licensing::config::{endpoints, LicensingConfig, MAX_VALIDITY_DAYS};
use crate::licensing::license_store::days_between;
use crate::licensing::types::LicenseError;

const PERPETUAL_VALIDITY_DAYS: i64 = 3650;
const DEFAULT_VALIDITY_DAYS: i64 = 365;

/// Only the first characters of a key ever reach the logs
pub fn mask_key(key: &str) -> String {
    let prefix: String = key.chars().take(4).collect();
    format!("{}...", prefix)
}

// ============================================================================
// Request / Response Types
// ============================================================================

/// Form body shared by validate, activate and details
#[derive(Serialize, Debug)]
struct LicenseForm<'a> {
    license_key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_id: Option<&'a str>,
    api_key: &'a str,
}

/// Outcome of validate / activate
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LicenseValidationResult {
    pub success: bool,
    pub message: String,
}

impl LicenseValidationResult {
    /// Accepts `{"success": bool}` as well as the older `{"result": "success"}`
    fn from_json(json: &Value) -> Result<Self, LicenseError> {
        let success = match (json.get("success"), json.get("result")) {
            (Some(Value::Bool(b)), _) => *b,
            (_, Some(Value::String(result))) => result.eq_ignore_ascii_case("success"),
            _ => return Err(LicenseError::Parse("missing 'success' field".to_string())),
        };

        let message = json
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("No message provided")
            .to_string();

        Ok(Self { success, message })
    }
}

/// License fields returned by the details endpoint
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LicenseDetails {
    pub activation_date: String,
    pub validity_days: i64,
    pub edition: String,
    pub capabilities: String,
    pub licensed_to: String,
    pub email: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum LicenseDetailsResult {
    Success(LicenseDetails),
    Error { message: String },
}

fn text_field(json: &Value, key: &str) -> Option<String> {
    match json.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number_field(json: &Value, key: &str) -> Option<i64> {
    match json.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn is_active_status(status: &Value) -> Option<bool> {
    match status {
        Value::Bool(b) => Some(*b),
        Value::String(s) => Some(s.eq_ignore_ascii_case("sold") || s.eq_ignore_ascii_case("active")),
        _ => None,
    }
}

/// Validity in days, falling back through the fields older servers send
fn resolve_validity(json: &Value) -> i64 {
    if let Some(days) = number_field(json, "validity").or_else(|| number_field(json, "valid")) {
        if in_range(days) {
            return days;
        }
        if days > MAX_VALIDITY_DAYS {
            log::warn!("Ignoring out-of-range validity of {} days", days);
        }
    }

    let expiration = text_field(json, "expiration_date").unwrap_or_default();
    if expiration.is_empty() || expiration == "0000-00-00" {
        return PERPETUAL_VALIDITY_DAYS;
    }

    text_field(json, "creation_date")
        .and_then(|created| days_between(&created, &expiration))
        .filter(|days| in_range(*days))
        .unwrap_or(DEFAULT_VALIDITY_DAYS)
}

fn in_range(days: i64) -> bool {
    (1..=MAX_VALIDITY_DAYS).contains(&days)
}

fn resolve_licensed_to(json: &Value) -> String {
    if let Some(name) = text_field(json, "licensed_to") {
        return name;
    }
    let first = text_field(json, "owner_first_name");
    let last = text_field(json, "owner_last_name");
    match (first, last) {
        (Some(f), Some(l)) => format!("{} {}", f, l),
        (Some(name), None) | (None, Some(name)) => name,
        (None, None) => "Licensed User".to_string(),
    }
}

impl LicenseDetailsResult {
    fn from_json(json: &Value) -> Result<Self, LicenseError> {
        let status = json
            .get("license_status")
            .ok_or_else(|| LicenseError::Parse("missing 'license_status' field".to_string()))?;

        let active = is_active_status(status)
            .ok_or_else(|| LicenseError::Parse(format!("unexpected 'license_status': {}", status)))?;

        if !active {
            return Ok(LicenseDetailsResult::Error {
                message: format!("License status: {} (expected active)", status),
            });
        }

        let activation_date = text_field(json, "activation_date")
            .or_else(|| text_field(json, "creation_date"))
            .unwrap_or_default();

        Ok(LicenseDetailsResult::Success(LicenseDetails {
            activation_date,
            validity_days: resolve_validity(json),
            edition: text_field(json, "edition").unwrap_or_else(|| "Pro".to_string()),
            capabilities: text_field(json, "capabilities").unwrap_or_else(|| "Full Features".to_string()),
            licensed_to: resolve_licensed_to(json),
            email: text_field(json, "owner_email_address")
                .or_else(|| text_field(json, "email"))
                .unwrap_or_default(),
        }))
    }
}

/// A misconfigured endpoint typically answers with a web page
pub fn looks_like_html(body: &str) -> bool {
    let head: String = body.trim_start().chars().take(64).collect::<String>().to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.starts_with("<html") || head.starts_with("<head")
}

// ============================================================================
// Service Trait
// ============================================================================

/// Remote license service
#[async_trait]
pub trait LicenseService: Send + Sync {
    async fn validate(&self, license_key: &str, device_id: &str) -> Result<LicenseValidationResult, LicenseError>;

    async fn activate(&self, license_key: &str, device_id: &str) -> Result<LicenseValidationResult, LicenseError>;

    async fn details(&self, license_key: &str) -> Result<LicenseDetailsResult, LicenseError>;
}

// ============================================================================
// HTTP Client
// ============================================================================

/// HTTP client for the license server API
pub struct LicenseApiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl LicenseApiClient {
    pub fn new(config: &LicensingConfig) -> Result<Self, LicenseError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.license_timeout())
            .build()
            .map_err(|e| LicenseError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.license_server_url.clone(),
            api_key: config.api_key.clone(),
            timeout: config.license_timeout(),
        })
    }

    /// POST a form and return the decoded JSON body
    async fn post_form(&self, url: &str, form: &LicenseForm<'_>) -> Result<Value, LicenseError> {
        log::debug!("POST {} (license_key={})", url, mask_key(form.license_key));

        let response = self.client.post(url).form(form).send().await.map_err(|e| {
            if e.is_timeout() {
                LicenseError::Timeout(self.timeout.as_millis() as u64)
            } else {
                LicenseError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| LicenseError::Network(format!("Failed to read response: {}", e)))?;

        if looks_like_html(&body) {
            log::error!("License endpoint {} returned HTML (HTTP {})", url, status);
            return Err(LicenseError::HtmlResponse { endpoint: url.to_string() });
        }

        if !status.is_success() {
            let snippet: String = body.chars().take(200).collect();
            return Err(LicenseError::Server(format!("HTTP {}: {}", status, snippet)));
        }

        if body.trim().is_empty() {
            return Err(LicenseError::Parse("Empty response from server".to_string()));
        }

        serde_json::from_str(&body).map_err(|e| LicenseError::Parse(format!("not valid JSON: {}", e)))
    }
}

#[async_trait]
impl LicenseService for LicenseApiClient {
    async fn validate(&self, license_key: &str, device_id: &str) -> Result<LicenseValidationResult, LicenseError> {
        let form = LicenseForm {
            license_key,
            device_id: Some(device_id),
            api_key: &self.api_key,
        };
        let json = self.post_form(&endpoints::license_validate(&self.base_url), &form).await?;
        let result = LicenseValidationResult::from_json(&json)?;
        log::debug!("Validate result: success={}, message={}", result.success, result.message);
        Ok(result)
    }

    async fn activate(&self, license_key: &str, device_id: &str) -> Result<LicenseValidationResult, LicenseError> {
        let form = LicenseForm {
            license_key,
            device_id: Some(device_id),
            api_key: &self.api_key,
        };
        let json = self.post_form(&endpoints::license_activate(&self.base_url), &form).await?;
        let result = LicenseValidationResult::from_json(&json)?;
        log::info!("Activate result: success={}, message={}", result.success, result.message);
        Ok(result)
    }

    async fn details(&self, license_key: &str) -> Result<LicenseDetailsResult, LicenseError> {
        let form = LicenseForm {
            license_key,
            device_id: None,
            api_key: &self.api_key,
        };
        let json = self.post_form(&endpoints::license_details(&self.base_url), &form).await?;
        LicenseDetailsResult::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        http::StatusCode,
        response::{Html, IntoResponse},
        routing::post,
        Form, Json, Router,
    };
    use serde_json::json;
    use std::collections::HashMap;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client(base_url: String) -> LicenseApiClient {
        let config = LicensingConfig {
            license_server_url: base_url,
            api_key: "secret".to_string(),
            ..Default::default()
        };
        LicenseApiClient::new(&config).unwrap()
    }

    async fn validate_handler(Form(form): Form<HashMap<String, String>>) -> impl IntoResponse {
        let ok = form.get("license_key").map(String::as_str) == Some("GOOD-KEY")
            && form.get("api_key").map(String::as_str) == Some("secret")
            && form.get("device_id").map(String::as_str) == Some("device-1");
        Json(json!({ "success": ok, "message": if ok { "License is valid" } else { "Invalid license key" } }))
    }

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key("ABCDEFGH"), "ABCD...");
        assert_eq!(mask_key("AB"), "AB...");
    }

    #[test]
    fn test_looks_like_html() {
        assert!(looks_like_html("<!DOCTYPE html><html></html>"));
        assert!(looks_like_html("  \n<html lang=\"en\">"));
        assert!(!looks_like_html("{\"success\": true}"));
        assert!(!looks_like_html(""));
    }

    #[test]
    fn test_validation_result_shapes() {
        let modern = LicenseValidationResult::from_json(&json!({"success": true, "message": "ok"})).unwrap();
        assert!(modern.success);

        let legacy = LicenseValidationResult::from_json(&json!({"result": "success"})).unwrap();
        assert!(legacy.success);
        assert_eq!(legacy.message, "No message provided");

        let rejected = LicenseValidationResult::from_json(&json!({"result": "error", "message": "nope"})).unwrap();
        assert!(!rejected.success);

        assert!(matches!(
            LicenseValidationResult::from_json(&json!({"message": "?"})),
            Err(LicenseError::Parse(_))
        ));
    }

    #[test]
    fn test_details_direct_fields() {
        let json = json!({
            "license_status": true,
            "activation_date": "2025-01-01",
            "validity": 365,
            "edition": "Enterprise",
            "capabilities": "all",
            "licensed_to": "Acme Corp"
        });
        let LicenseDetailsResult::Success(details) = LicenseDetailsResult::from_json(&json).unwrap() else {
            panic!("expected success");
        };
        assert_eq!(details.activation_date, "2025-01-01");
        assert_eq!(details.validity_days, 365);
        assert_eq!(details.edition, "Enterprise");
        assert_eq!(details.licensed_to, "Acme Corp");
    }

    #[test]
    fn test_details_legacy_fields() {
        let json = json!({
            "license_status": "sold",
            "creation_date": "2025-01-01",
            "expiration_date": "2025-07-01",
            "valid": "0",
            "owner_first_name": "Jane",
            "owner_last_name": "Doe",
            "owner_email_address": "jane@example.com"
        });
        let LicenseDetailsResult::Success(details) = LicenseDetailsResult::from_json(&json).unwrap() else {
            panic!("expected success");
        };
        assert_eq!(details.activation_date, "2025-01-01");
        assert_eq!(details.validity_days, 181);
        assert_eq!(details.licensed_to, "Jane Doe");
        assert_eq!(details.email, "jane@example.com");
        assert_eq!(details.edition, "Pro");
        assert_eq!(details.capabilities, "Full Features");
    }

    #[test]
    fn test_details_perpetual_license() {
        let json = json!({"license_status": "active", "activation_date": "2025-01-01", "expiration_date": "0000-00-00"});
        let LicenseDetailsResult::Success(details) = LicenseDetailsResult::from_json(&json).unwrap() else {
            panic!("expected success");
        };
        assert_eq!(details.validity_days, PERPETUAL_VALIDITY_DAYS);
        assert_eq!(details.licensed_to, "Licensed User");
    }

    #[test]
    fn test_details_out_of_range_validity_falls_back() {
        let json = json!({"license_status": "active", "activation_date": "2025-01-01", "validity": 1_000_000_000});
        let LicenseDetailsResult::Success(details) = LicenseDetailsResult::from_json(&json).unwrap() else {
            panic!("expected success");
        };
        assert_eq!(details.validity_days, PERPETUAL_VALIDITY_DAYS);

        let json = json!({
            "license_status": "active",
            "creation_date": "2025-01-01",
            "expiration_date": "9999-12-31",
            "validity": -5
        });
        let LicenseDetailsResult::Success(details) = LicenseDetailsResult::from_json(&json).unwrap() else {
            panic!("expected success");
        };
        assert_eq!(details.validity_days, DEFAULT_VALIDITY_DAYS);
    }

    #[test]
    fn test_details_inactive_and_malformed() {
        let inactive = LicenseDetailsResult::from_json(&json!({"license_status": "expired"})).unwrap();
        assert!(matches!(inactive, LicenseDetailsResult::Error { .. }));

        let revoked = LicenseDetailsResult::from_json(&json!({"license_status": false})).unwrap();
        assert!(matches!(revoked, LicenseDetailsResult::Error { .. }));

        assert!(matches!(
            LicenseDetailsResult::from_json(&json!({"activation_date": "2025-01-01"})),
            Err(LicenseError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_validate_posts_form_fields() {
        let base = serve(Router::new().route("/validate", post(validate_handler))).await;
        let client = client(base);

        let good = client.validate("GOOD-KEY", "device-1").await.unwrap();
        assert!(good.success);

        let bad = client.validate("BAD-KEY", "device-1").await.unwrap();
        assert!(!bad.success);
        assert_eq!(bad.message, "Invalid license key");
    }

    #[tokio::test]
    async fn test_details_over_http() {
        let app = Router::new().route(
            "/details",
            post(|Form(form): Form<HashMap<String, String>>| async move {
                assert!(!form.contains_key("device_id"));
                Json(json!({
                    "license_status": true,
                    "activation_date": "2025-01-01",
                    "validity": 365,
                    "edition": "Pro",
                    "capabilities": "Full Features",
                    "licensed_to": "Acme"
                }))
            }),
        );
        let client = client(serve(app).await);

        let result = client.details("GOOD-KEY").await.unwrap();
        assert!(matches!(result, LicenseDetailsResult::Success(d) if d.validity_days == 365));
    }

    #[tokio::test]
    async fn test_html_payload_is_configuration_error() {
        let app = Router::new().route(
            "/validate",
            post(|| async { Html("<!DOCTYPE html><html><body>Welcome to WordPress</body></html>") }),
        );
        let client = client(serve(app).await);

        let err = client.validate("GOOD-KEY", "device-1").await.unwrap_err();
        assert!(matches!(err, LicenseError::HtmlResponse { .. }));
        assert!(err.is_inconclusive());
    }

    #[tokio::test]
    async fn test_http_error_status_is_server_error() {
        let app = Router::new().route(
            "/activate",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "database unavailable") }),
        );
        let client = client(serve(app).await);

        let err = client.activate("GOOD-KEY", "device-1").await.unwrap_err();
        assert!(matches!(err, LicenseError::Server(msg) if msg.contains("500")));
    }

    #[tokio::test]
    async fn test_garbage_body_is_parse_error() {
        let app = Router::new().route("/validate", post(|| async { "ok" }));
        let client = client(serve(app).await);

        let err = client.validate("GOOD-KEY", "device-1").await.unwrap_err();
        assert!(matches!(err, LicenseError::Parse(_)));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_network_error() {
        let client = client("http://127.0.0.1:1".to_string());
        let err = client.validate("GOOD-KEY", "device-1").await.unwrap_err();
        assert!(err.is_inconclusive());
    }
}
