use crate::errors::MeaoError;
use reqwest::Response;
use serde_json::Value;
use tracing::warn;

/// Maps provider HTTP responses to the typed error hierarchy.
///
/// Classification: 401/403 → `Auth` (fatal); 429 → `RateLimit` with the
/// retry-after hint; 529/overloaded → retryable; context-length complaints →
/// `ContextLength` (fatal); other 4xx → non-retryable; 5xx → retryable.
pub struct ProviderErrorHandler;

impl ProviderErrorHandler {
    /// Check status and parse the JSON body of a non-streaming response.
    pub async fn check_response(resp: Response, provider: &str) -> Result<Value, MeaoError> {
        let resp = Self::check_http_status(resp, provider).await?;
        resp.json::<Value>().await.map_err(|e| MeaoError::Provider {
            message: format!("{} returned unparseable JSON: {}", provider, e),
            retryable: false,
        })
    }

    /// Check status only, returning the response for stream consumption.
    pub async fn check_http_status(resp: Response, provider: &str) -> Result<Response, MeaoError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        let body = resp.text().await.unwrap_or_default();
        let (error_type, error_message) = parse_error_body(&body);

        warn!(
            "{} API error: status={} type={} message={}",
            provider, status, error_type, error_message
        );

        Err(match status.as_u16() {
            401 | 403 => MeaoError::Auth(format!("{}: {}", provider, error_message)),
            429 => MeaoError::RateLimit { retry_after },
            400 if error_message.contains("context length")
                || error_message.contains("prompt is too long")
                || error_type == "context_length_exceeded" =>
            {
                MeaoError::ContextLength(error_message)
            }
            400..=499 => MeaoError::Provider {
                message: format!("{} rejected request ({}): {}", provider, error_type, error_message),
                retryable: false,
            },
            529 => MeaoError::Provider {
                message: format!("{} overloaded: {}", provider, error_message),
                retryable: true,
            },
            _ => MeaoError::Provider {
                message: format!("{} server error ({}): {}", provider, status, error_message),
                retryable: true,
            },
        })
    }

    /// Map a transport-level reqwest error (connect, timeout, TLS).
    pub fn network_error(e: &reqwest::Error, provider: &str) -> MeaoError {
        let kind = if e.is_timeout() { "timeout" } else { "network" };
        MeaoError::Provider {
            message: format!("{} {} error: {}", provider, kind, e),
            retryable: true,
        }
    }
}

fn parse_error_body(body: &str) -> (String, String) {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        if let Some(error) = json.get("error") {
            let error_type = error
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return (error_type, message);
        }
    }
    (
        "unknown".to_string(),
        crate::utils::truncate_chars(body, 200, "…"),
    )
}
