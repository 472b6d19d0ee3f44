use crate::agent::tools::base::{
    ApprovalPolicy, Tool, ToolCapability, ToolContext, ToolOutput,
};
use crate::net::NetworkGuard;
use crate::security::label::{DataClass, TrustLevel};
use crate::utils::http::{limited_text, DEFAULT_MAX_BODY_BYTES};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use scraper::{Html, Selector};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = "meao/0.4 (+https://github.com/meao-agent/meao)";

/// Fetches a URL with every hop cleared by the network guard.
///
/// Redirects are never followed automatically: the client is built with
/// `Policy::none` and pinned to the guard-resolved IP, and each `Location`
/// re-enters `check_url` until the redirect budget runs out.
pub struct WebFetchTool {
    guard: Arc<NetworkGuard>,
    timeout: Duration,
    cap: usize,
}

impl WebFetchTool {
    pub fn new(guard: Arc<NetworkGuard>, timeout: Duration, cap: usize) -> Self {
        Self {
            guard,
            timeout,
            cap,
        }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL from an allowlisted host and return its readable content."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "http(s) URL to fetch"
                },
                "extractMode": {
                    "type": "string",
                    "enum": ["text", "raw"],
                    "default": "text",
                    "description": "text extracts readable content from HTML; raw returns the body as-is"
                }
            },
            "required": ["url"]
        })
    }

    fn capability(&self) -> ToolCapability {
        ToolCapability {
            approval: ApprovalPolicy::Auto,
            // Marks the tool as network-outbound; host rules come from the
            // global allowlist
            network_policy: Some(crate::net::ToolNetworkPolicy::blocklist(Vec::new())),
            output_trust: TrustLevel::Untrusted,
            output_class: DataClass::Public,
            methods_requiring_approval: vec![
                "POST".to_string(),
                "PUT".to_string(),
                "DELETE".to_string(),
                "PATCH".to_string(),
            ],
            output_cap: self.cap,
            timeout: self.timeout,
            ..ToolCapability::default()
        }
    }

    fn action(&self) -> &str {
        "get"
    }

    fn approval_target(&self, args: &Value) -> Option<String> {
        args["url"].as_str().map(str::to_string)
    }

    fn request_method(&self, _args: &Value) -> Option<String> {
        Some("GET".to_string())
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let url_str = args["url"].as_str().unwrap_or_default();
        let raw_mode = args["extractMode"].as_str() == Some("raw");

        let mut current = url_str.to_string();
        for _hop in 0..=self.guard.max_redirects() {
            let check = self.guard.check_url(&current, "GET", None).await;
            if !check.allowed {
                return Ok(ToolOutput::fail(
                    check
                        .reason
                        .unwrap_or_else(|| "request blocked".to_string()),
                ));
            }

            let parsed = match url::Url::parse(&current) {
                Ok(parsed) => parsed,
                Err(e) => return Ok(ToolOutput::fail(format!("Invalid URL: {}", e))),
            };

            // Pin the connection to the guard-resolved address so the socket
            // cannot land on a different host than the one screened
            let mut builder = Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .timeout(self.timeout);
            if let (Some(ip), Some(host)) = (check.resolved_ip, parsed.host_str()) {
                let port = parsed.port_or_known_default().unwrap_or(443);
                builder = builder.resolve(host, SocketAddr::new(ip, port));
            }
            let client = match builder.build() {
                Ok(client) => client,
                Err(e) => {
                    return Ok(ToolOutput::fail(format!(
                        "failed to build HTTP client: {}",
                        e
                    )))
                }
            };

            let resp = match client
                .get(&current)
                .header("User-Agent", USER_AGENT)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => return Ok(ToolOutput::fail(format!("fetch failed: {}", e))),
            };

            let status = resp.status();
            if status.is_redirection() {
                let Some(location) = resp
                    .headers()
                    .get("location")
                    .and_then(|h| h.to_str().ok())
                else {
                    return Ok(ToolOutput::fail(format!(
                        "redirect ({}) without Location header",
                        status
                    )));
                };
                // Relative Location resolves against the current URL, then
                // the next loop iteration re-checks it
                current = match parsed.join(location) {
                    Ok(next) => next.to_string(),
                    Err(e) => {
                        return Ok(ToolOutput::fail(format!("invalid redirect target: {}", e)))
                    }
                };
                debug!("web_fetch: redirect hop → {}", current);
                continue;
            }

            let content_type = resp
                .headers()
                .get("content-type")
                .and_then(|h| h.to_str().ok())
                .unwrap_or("")
                .to_string();
            let body = match limited_text(resp, DEFAULT_MAX_BODY_BYTES).await {
                Ok(body) => body,
                Err(e) => return Ok(ToolOutput::fail(format!("error reading body: {}", e))),
            };

            let text = if raw_mode {
                body
            } else if content_type.contains("text/html") || looks_like_html(&body) {
                extract_readable(&body)
            } else {
                body
            };

            if !status.is_success() {
                return Ok(ToolOutput::fail(format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    crate::utils::truncate_chars(&text, 500, "…")
                )));
            }
            return Ok(ToolOutput::ok(text));
        }

        Ok(ToolOutput::fail(format!(
            "redirect limit exceeded ({})",
            self.guard.max_redirects()
        )))
    }
}

fn looks_like_html(body: &str) -> bool {
    let head: String = body.chars().take(256).collect::<String>().to_lowercase();
    head.trim_start().starts_with("<!doctype") || head.trim_start().starts_with("<html")
}

/// Title plus visible text, scripts and styles dropped.
fn extract_readable(html: &str) -> String {
    let document = Html::parse_document(html);

    let title = Selector::parse("title")
        .ok()
        .and_then(|sel| {
            document
                .select(&sel)
                .next()
                .map(|e| e.text().collect::<String>())
        })
        .unwrap_or_default();

    let body_text = ["article", "main", "body"]
        .iter()
        .find_map(|tag| {
            let sel = Selector::parse(tag).ok()?;
            let element = document.select(&sel).next()?;
            let text: String = element.text().collect::<Vec<_>>().join(" ");
            let text = normalize_whitespace(&text);
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        })
        .unwrap_or_else(|| normalize_whitespace(&html_escape::decode_html_entities(html)));

    let title = title.trim();
    if title.is_empty() {
        body_text
    } else {
        format!("# {}\n\n{}", title, body_text)
    }
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
