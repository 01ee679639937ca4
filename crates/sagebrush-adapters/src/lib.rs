//! Remote metadata client contract and the TMDB credits implementation.

use async_trait::async_trait;
use sagebrush_core::RawMetadata;
use sagebrush_storage::{HttpError, HttpFetcher};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "sagebrush-adapters";

pub const DEFAULT_TMDB_BASE_URL: &str = "https://api.themoviedb.org/3";

/// Outcome of a failed fetch. `NotFound` is permanent; everything else is `Transient`
/// and worth retrying on a later run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("remote id {remote_id} not found: {message}")]
    NotFound { remote_id: i64, message: String },
    #[error("fetch failed for remote id {remote_id} (status {status:?}): {message}")]
    Transient {
        remote_id: i64,
        status: Option<i64>,
        message: String,
    },
}

impl FetchError {
    pub fn remote_id(&self) -> i64 {
        match self {
            Self::NotFound { remote_id, .. } | Self::Transient { remote_id, .. } => *remote_id,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Decides whether an error means "this resource does not exist upstream".
///
/// The service is inconsistent about how it reports missing resources: sometimes an
/// HTTP 404, sometimes its own `status_code` 34 in a 200 or 404 body, sometimes only a
/// message. Any status in `status_codes` or any signature found in the lower-cased
/// message text counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotFoundPolicy {
    pub status_codes: Vec<i64>,
    pub message_signatures: Vec<String>,
}

impl Default for NotFoundPolicy {
    fn default() -> Self {
        Self {
            status_codes: vec![404, 34],
            message_signatures: [
                "404 client error",
                "status_code: 34",
                "\"status_code\":34",
                "the resource you requested could not be found",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
        }
    }
}

impl NotFoundPolicy {
    pub fn is_not_found(&self, status: Option<i64>, message: &str) -> bool {
        if status.is_some_and(|code| self.status_codes.contains(&code)) {
            return true;
        }
        let message = message.to_lowercase();
        self.message_signatures
            .iter()
            .any(|signature| message.contains(signature.as_str()))
    }

    pub fn classify(
        &self,
        remote_id: i64,
        status: Option<i64>,
        message: impl Into<String>,
    ) -> FetchError {
        let message = message.into();
        if self.is_not_found(status, &message) {
            FetchError::NotFound { remote_id, message }
        } else {
            FetchError::Transient {
                remote_id,
                status,
                message,
            }
        }
    }
}

/// Status envelope the service returns alongside (or instead of) a payload.
#[derive(Debug, Clone, Default, Deserialize)]
struct ServiceStatus {
    pub success: Option<bool>,
    pub status_code: Option<i64>,
    pub status_message: Option<String>,
}

fn parse_service_status(body: &str) -> Option<ServiceStatus> {
    serde_json::from_str::<ServiceStatus>(body).ok()
}

/// Classifies a non-success response from its HTTP status and the service's own
/// `status_code`, whichever matches.
pub fn classify_error_response(
    policy: &NotFoundPolicy,
    remote_id: i64,
    http_status: Option<u16>,
    body: &str,
) -> FetchError {
    let service = parse_service_status(body).unwrap_or_default();
    let detail = service
        .status_message
        .clone()
        .unwrap_or_else(|| body.trim().to_string());
    let message = match (http_status, service.status_code) {
        (Some(http), Some(code)) => format!("http {http}, status_code: {code}: {detail}"),
        (Some(http), None) => format!("http {http}: {detail}"),
        (None, Some(code)) => format!("status_code: {code}: {detail}"),
        (None, None) => detail,
    };

    let http_code = http_status.map(i64::from);
    if policy.is_not_found(http_code, &message)
        || policy.is_not_found(service.status_code, &message)
    {
        FetchError::NotFound { remote_id, message }
    } else {
        FetchError::Transient {
            remote_id,
            status: http_code.or(service.status_code),
            message,
        }
    }
}

/// Decodes a 2xx credits body. Non-JSON bodies and `"success": false` envelopes are
/// failures, classified like any other error response.
pub fn decode_credits(
    policy: &NotFoundPolicy,
    remote_id: i64,
    body: &[u8],
) -> Result<RawMetadata, FetchError> {
    let value: JsonValue = serde_json::from_slice(body).map_err(|err| {
        policy.classify(remote_id, None, format!("malformed credits response: {err}"))
    })?;

    if value.get("success").and_then(JsonValue::as_bool) == Some(false) {
        return Err(classify_error_response(
            policy,
            remote_id,
            None,
            &value.to_string(),
        ));
    }

    if !value.is_object() {
        return Err(policy.classify(
            remote_id,
            None,
            "malformed credits response: expected a JSON object",
        ));
    }

    Ok(RawMetadata::new(value))
}

/// One metadata fetch per entity against an external service.
#[async_trait]
pub trait MetadataClient: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch(&self, remote_id: i64) -> Result<RawMetadata, FetchError>;
}

#[derive(Debug, Clone)]
pub struct TmdbConfig {
    pub base_url: String,
    pub api_key: String,
}

pub struct TmdbCreditsClient {
    http: HttpFetcher,
    base_url: String,
    api_key: String,
    policy: NotFoundPolicy,
}

impl TmdbCreditsClient {
    pub fn new(http: HttpFetcher, config: TmdbConfig) -> Self {
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            policy: NotFoundPolicy::default(),
        }
    }

    pub fn credits_url(&self, remote_id: i64) -> String {
        format!("{}/movie/{remote_id}/credits", self.base_url)
    }
}

#[async_trait]
impl MetadataClient for TmdbCreditsClient {
    fn source_id(&self) -> &'static str {
        "tmdb"
    }

    async fn fetch(&self, remote_id: i64) -> Result<RawMetadata, FetchError> {
        let url = self.credits_url(remote_id);
        debug!(remote_id, "fetching credits");

        match self.http.get(&url, &[("api_key", self.api_key.as_str())]).await {
            Ok(resp) => decode_credits(&self.policy, remote_id, &resp.body),
            Err(HttpError::HttpStatus { status, body, .. }) => Err(classify_error_response(
                &self.policy,
                remote_id,
                Some(status),
                &body,
            )),
            Err(err) => {
                let status = err.status().map(i64::from);
                Err(self.policy.classify(remote_id, status, err.to_string()))
            }
        }
    }
}
