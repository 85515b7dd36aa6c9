//! Kiro credential store and token lifecycle.
//!
//! Auth flow:
//!   1. Credentials come from the environment (`REFRESH_TOKEN`) or the JSON
//!      file the Kiro desktop sign-in writes (`KIRO_CREDS_FILE`).
//!   2. `access_token()` refreshes proactively when the token is missing or
//!      close to expiry; a 403 from the upstream triggers `force_refresh()`.
//!   3. Refreshed credentials are written back to the file when the file was
//!      the source, preserving any keys this gateway doesn't understand.
//!
//! At most one refresh is in flight per process: refreshing requires the
//! write half of the state lock, and waiters re-check under the lock before
//! refreshing again.

use std::path::PathBuf;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use kiro_core::config::{GatewayConfig, CONNECT_TIMEOUT_SECS, DEFAULT_REGION, REFRESH_TIMEOUT_SECS};
use kiro_core::error::{GatewayError, Result};

/// Credential record. `extra` carries every credentials-file key the gateway
/// doesn't own, so rewrites preserve them.
#[derive(Debug)]
struct TokenState {
    access_token: String,
    refresh_token: String,
    expires_at: Option<DateTime<Utc>>,
    extra: serde_json::Map<String, serde_json::Value>,
}

/// Seam between the retry driver and the token lifecycle, so driver policy
/// is testable with a fake source.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    /// A currently-valid access token; refreshes when missing or near expiry.
    async fn access_token(&self) -> Result<String>;
    /// Unconditional refresh, used reactively on an upstream 403.
    async fn force_refresh(&self) -> Result<String>;
}

#[derive(Debug)]
pub struct TokenManager {
    client: reqwest::Client,
    state: RwLock<TokenState>,
    /// Set only when the credentials file was the source; refreshes are
    /// persisted back to it.
    creds_file: Option<PathBuf>,
    region: String,
    profile_arn: Option<String>,
    refresh_threshold: Duration,
    fingerprint: String,
}

impl TokenManager {
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let mut extra = serde_json::Map::new();
        let mut file_access = String::new();
        let mut file_refresh = None;
        let mut file_expires = None;
        let mut file_profile_arn = None;
        let mut file_region = None;
        let mut creds_file = None;

        if let Some(path) = &config.kiro_creds_file {
            let data = std::fs::read_to_string(path).map_err(|e| {
                GatewayError::Config(format!("cannot read credentials file {path}: {e}"))
            })?;
            let value: serde_json::Value = serde_json::from_str(&data).map_err(|e| {
                GatewayError::Config(format!("invalid credentials JSON in {path}: {e}"))
            })?;
            let Some(map) = value.as_object() else {
                return Err(GatewayError::Config(format!(
                    "credentials file {path} is not a JSON object"
                )));
            };

            extra = map.clone();
            file_access = extra
                .remove("accessToken")
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_default();
            file_refresh = extra
                .remove("refreshToken")
                .and_then(|v| v.as_str().map(String::from));
            file_expires = extra
                .remove("expiresAt")
                .and_then(|v| v.as_str().map(String::from))
                .and_then(|s| parse_expires_at(&s));
            // profileArn/region stay in `extra` (the gateway never mutates
            // them) but are surfaced through the accessors too.
            file_profile_arn = extra
                .get("profileArn")
                .and_then(|v| v.as_str().map(String::from));
            file_region = extra
                .get("region")
                .and_then(|v| v.as_str().map(String::from));
            creds_file = Some(PathBuf::from(path));
        }

        let refresh_token = config
            .refresh_token
            .clone()
            .or(file_refresh)
            .ok_or_else(|| {
                GatewayError::Config("REFRESH_TOKEN or KIRO_CREDS_FILE must be provided".into())
            })?;
        let region = config
            .kiro_region
            .clone()
            .or(file_region)
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        let profile_arn = config.profile_arn.clone().or(file_profile_arn);

        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(std::time::Duration::from_secs(REFRESH_TIMEOUT_SECS))
            .build()
            .map_err(|e| GatewayError::Config(format!("cannot build refresh client: {e}")))?;

        Ok(Self {
            client,
            state: RwLock::new(TokenState {
                access_token: file_access,
                refresh_token,
                expires_at: file_expires,
                extra,
            }),
            creds_file,
            region,
            profile_arn,
            refresh_threshold: Duration::seconds(config.token_refresh_threshold as i64),
            fingerprint: kiro_core::ids::machine_fingerprint(),
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn profile_arn(&self) -> Option<&str> {
        self.profile_arn.as_deref()
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Chat host: `generateAssistantResponse` lives here.
    pub fn api_host(&self) -> String {
        format!("https://codewhisperer.{}.amazonaws.com", self.region)
    }

    /// Listing host: `ListAvailableModels` lives here.
    pub fn q_host(&self) -> String {
        format!("https://q.{}.amazonaws.com", self.region)
    }

    fn refresh_url(&self) -> String {
        format!(
            "https://prod.{}.auth.desktop.kiro.dev/refreshToken",
            self.region
        )
    }

    /// Headers every upstream call carries: a User-Agent with the machine
    /// fingerprint and a fresh invocation id.
    pub fn upstream_headers(&self) -> Vec<(&'static str, String)> {
        vec![
            (
                "User-Agent",
                format!(
                    "KiroGateway/{} md/machine#{}",
                    env!("CARGO_PKG_VERSION"),
                    self.fingerprint
                ),
            ),
            ("amz-sdk-invocation-id", Uuid::new_v4().to_string()),
        ]
    }

    async fn refresh_locked(&self, state: &mut TokenState) -> Result<String> {
        info!("refreshing Kiro access token");

        let mut last_transient = None;
        for attempt in 0..2u32 {
            match self.try_refresh(&state.refresh_token).await {
                Ok(grant) => {
                    apply_grant(state, grant);
                    self.persist(state);
                    return Ok(state.access_token.clone());
                }
                Err(e) if attempt == 0 && is_transient(&e) => {
                    warn!(error = %e, "token refresh failed, retrying once");
                    last_transient = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_transient
            .unwrap_or_else(|| GatewayError::Network("token refresh failed".into())))
    }

    async fn try_refresh(&self, refresh_token: &str) -> Result<RefreshGrant> {
        let mut req = self
            .client
            .post(self.refresh_url())
            .json(&serde_json::json!({ "refreshToken": refresh_token }));
        for (name, value) in self.upstream_headers() {
            req = req.header(name, value);
        }

        let resp = req.send().await.map_err(transport_error)?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(transport_error)?;
        parse_refresh_response(status, &body)
    }

    /// Rewrite the credentials file. Failure is logged, never fatal: the
    /// in-memory record is already updated.
    fn persist(&self, state: &TokenState) {
        let Some(path) = &self.creds_file else {
            return;
        };
        let rendered = render_credentials(state);
        match serde_json::to_string_pretty(&rendered) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    warn!(path = %path.display(), error = %e, "failed to persist refreshed credentials");
                } else {
                    debug!(path = %path.display(), "credentials persisted");
                }
            }
            Err(e) => warn!(error = %e, "failed to render credentials"),
        }
    }
}

#[async_trait::async_trait]
impl TokenSource for TokenManager {
    async fn access_token(&self) -> Result<String> {
        // Fast path — read lock
        {
            let state = self.state.read().await;
            if !needs_refresh(&state, self.refresh_threshold, Utc::now()) {
                return Ok(state.access_token.clone());
            }
        }

        // Slow path — write lock; a waiter may find the token already fresh.
        let mut state = self.state.write().await;
        if !needs_refresh(&state, self.refresh_threshold, Utc::now()) {
            return Ok(state.access_token.clone());
        }
        self.refresh_locked(&mut state).await
    }

    async fn force_refresh(&self) -> Result<String> {
        let mut state = self.state.write().await;
        self.refresh_locked(&mut state).await
    }
}

fn needs_refresh(state: &TokenState, threshold: Duration, now: DateTime<Utc>) -> bool {
    if state.access_token.is_empty() {
        return true;
    }
    match state.expires_at {
        Some(at) => now + threshold >= at,
        // Unknown expiry: trust the token; a 403 still forces the reactive
        // path.
        None => false,
    }
}

#[derive(Debug)]
struct RefreshGrant {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

fn apply_grant(state: &mut TokenState, grant: RefreshGrant) {
    state.access_token = grant.access_token;
    if let Some(rt) = grant.refresh_token {
        state.refresh_token = rt;
    }
    state.expires_at = grant.expires_at;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_at: Option<String>,
}

fn parse_expires_at(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_refresh_response(status: u16, body: &str) -> Result<RefreshGrant> {
    match status {
        200..=299 => {
            let resp: RefreshResponse = serde_json::from_str(body).map_err(|e| {
                GatewayError::Network(format!("invalid refresh response: {e}"))
            })?;
            Ok(RefreshGrant {
                access_token: resp.access_token,
                refresh_token: resp.refresh_token,
                expires_at: resp.expires_at.as_deref().and_then(parse_expires_at),
            })
        }
        401 => Err(GatewayError::AuthInvalid(body.to_string())),
        400..=499 if body.contains("invalid_grant") => {
            Err(GatewayError::AuthInvalid(body.to_string()))
        }
        400..=499 => Err(GatewayError::Network(format!(
            "refresh endpoint rejected request ({status}): {body}"
        ))),
        _ => Err(GatewayError::Upstream {
            status,
            body: body.to_string(),
        }),
    }
}

fn is_transient(err: &GatewayError) -> bool {
    matches!(
        err,
        GatewayError::Timeout { .. }
            | GatewayError::Network(_)
            | GatewayError::Upstream { status: 500..=599, .. }
    )
}

fn transport_error(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout {
            ms: REFRESH_TIMEOUT_SECS * 1000,
        }
    } else {
        GatewayError::Network(e.to_string())
    }
}

/// Merge the mutable token fields over the preserved file keys.
fn render_credentials(state: &TokenState) -> serde_json::Value {
    let mut map = state.extra.clone();
    map.insert(
        "accessToken".to_string(),
        serde_json::Value::String(state.access_token.clone()),
    );
    map.insert(
        "refreshToken".to_string(),
        serde_json::Value::String(state.refresh_token.clone()),
    );
    match state.expires_at {
        Some(at) => {
            map.insert(
                "expiresAt".to_string(),
                serde_json::Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
        }
        None => {
            map.remove("expiresAt");
        }
    }
    serde_json::Value::Object(map)
}
