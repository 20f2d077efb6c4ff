// Conduit — Execution Sandbox
//
// Runs one declarative ability call. The sandbox renders the template from
// params, injects resolved credentials by type, applies caller header
// overrides and sends the request through an `HttpTransport`. Templates never
// see the credential map; callers only see the response, with any injected
// secret scrubbed out of it. Resolved credentials are dropped (and zeroed)
// before `execute` returns.

mod error;
mod template;
mod transport;

pub use error::SandboxError;
pub use template::{PreparedRequest, RequestTemplate};
pub use transport::{HttpResponse, HttpTransport, OutboundRequest, ReqwestTransport};

#[cfg(test)]
pub use transport::mock;

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::form_urlencoded;
use zeroize::Zeroizing;

use crate::store::CredentialType;
use crate::vault::ResolvedCredentials;
use template::set_header;

/// Replacement for any secret echoed back by the upstream.
const REDACTED: &str = "[REDACTED]";

/// Param key holding caller header overrides.
const PARAMS_HEADERS_KEY: &str = "headers";

/// Outcome of one sandboxed call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxResult {
    pub status_code: u16,
    pub body: Value,
    pub executed_at: DateTime<Utc>,
    pub execution_time_ms: u64,
}

pub struct Sandbox<'a> {
    transport: &'a dyn HttpTransport,
}

impl<'a> Sandbox<'a> {
    pub fn new(transport: &'a dyn HttpTransport) -> Self {
        Self { transport }
    }

    /// Render, inject and send. Takes ownership of `credentials` so they are
    /// gone once the call returns.
    pub async fn execute(
        &self,
        template: &RequestTemplate,
        params: &Map<String, Value>,
        credentials: Option<ResolvedCredentials>,
    ) -> Result<SandboxResult, SandboxError> {
        let prepared = template.render(params)?;
        let mut request = OutboundRequest {
            method: prepared.method,
            url: prepared.url,
            headers: prepared.headers,
            body: prepared.body,
        };

        if let Some(credentials) = &credentials {
            inject(&mut request, credentials)?;
        }
        apply_param_headers(&mut request, params)?;

        let host = request.url.host_str().unwrap_or_default().to_string();
        let method = request.method.clone();
        let injected = credentials.as_ref().map_or(0, |c| c.len());

        let executed_at = Utc::now();
        let start = Instant::now();
        let response = self.transport.send(request).await;
        let execution_time_ms = start.elapsed().as_millis() as u64;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                let e = match (e, &credentials) {
                    (SandboxError::Transport(message), Some(credentials)) => {
                        SandboxError::Transport(redact_text(message, credentials))
                    }
                    (e, _) => e,
                };
                tracing::warn!(
                    method = %method,
                    host = %host,
                    elapsed_ms = execution_time_ms,
                    error = %e,
                    "Ability request failed"
                );
                return Err(e);
            }
        };

        let body = parse_body(response.body, credentials.as_ref());
        drop(credentials);

        tracing::info!(
            method = %method,
            host = %host,
            status = response.status,
            elapsed_ms = execution_time_ms,
            injected,
            "Ability request completed"
        );

        Ok(SandboxResult {
            status_code: response.status,
            body,
            executed_at,
            execution_time_ms,
        })
    }
}

/// Place each credential where its type says it belongs.
fn inject(request: &mut OutboundRequest, credentials: &ResolvedCredentials) -> Result<(), SandboxError> {
    for credential in credentials.iter() {
        let value = credential.expose();
        match credential.credential_type() {
            CredentialType::Header => {
                set_header(&mut request.headers, credential.key(), value.to_string());
            }
            CredentialType::Cookie => {
                let pair = format!("{}={}", credential.key(), value);
                let cookie = match request.header("Cookie") {
                    Some(existing) if !existing.trim().is_empty() => {
                        format!("{}; {}", existing.trim_end_matches(&[';', ' '][..]), pair)
                    }
                    _ => pair,
                };
                set_header(&mut request.headers, "Cookie", cookie);
            }
            CredentialType::Query => {
                request
                    .url
                    .query_pairs_mut()
                    .append_pair(credential.key(), value);
            }
            CredentialType::Body => {
                let body = request.body.get_or_insert_with(|| Value::Object(Map::new()));
                let Value::Object(fields) = body else {
                    return Err(SandboxError::Injection(format!(
                        "cannot place body credential '{}' into a non-object body",
                        credential.key()
                    )));
                };
                fields.insert(credential.key().to_string(), Value::String(value.to_string()));
            }
        }
    }
    Ok(())
}

/// `params.headers` overrides everything else.
fn apply_param_headers(
    request: &mut OutboundRequest,
    params: &Map<String, Value>,
) -> Result<(), SandboxError> {
    match params.get(PARAMS_HEADERS_KEY) {
        None | Some(Value::Null) => Ok(()),
        Some(Value::Object(headers)) => {
            for (name, value) in headers {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                set_header(&mut request.headers, name, value);
            }
            Ok(())
        }
        Some(_) => Err(SandboxError::Template(
            "params.headers must be an object of header values".into(),
        )),
    }
}

/// Replace each secret, raw or form-encoded, with `[REDACTED]`.
fn redact_text(mut text: String, credentials: &ResolvedCredentials) -> String {
    for credential in credentials.iter() {
        let secret = credential.expose();
        if secret.is_empty() {
            continue;
        }
        if text.contains(secret) {
            text = text.replace(secret, REDACTED);
        }
        let encoded: Zeroizing<String> =
            Zeroizing::new(form_urlencoded::byte_serialize(secret.as_bytes()).collect());
        if encoded.as_str() != secret && text.contains(encoded.as_str()) {
            text = text.replace(encoded.as_str(), REDACTED);
        }
    }
    text
}

/// Redact decoded JSON, so escaped forms like `\/` cannot hide a secret.
fn redact_value(value: &mut Value, credentials: &ResolvedCredentials) {
    match value {
        Value::String(s) => *s = redact_text(std::mem::take(s), credentials),
        Value::Array(items) => {
            for item in items {
                redact_value(item, credentials);
            }
        }
        Value::Object(fields) => {
            let redacted: Map<String, Value> = std::mem::take(fields)
                .into_iter()
                .map(|(key, mut field)| {
                    redact_value(&mut field, credentials);
                    (redact_text(key, credentials), field)
                })
                .collect();
            *fields = redacted;
        }
        _ => {}
    }
}

/// JSON bodies are parsed then redacted; anything else comes back as a
/// redacted string. Empty bodies are `null`.
fn parse_body(text: String, credentials: Option<&ResolvedCredentials>) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    match serde_json::from_str::<Value>(&text) {
        Ok(mut value) => {
            if let Some(credentials) = credentials {
                redact_value(&mut value, credentials);
            }
            value
        }
        Err(_) => Value::String(match credentials {
            Some(credentials) => redact_text(text, credentials),
            None => text,
        }),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
