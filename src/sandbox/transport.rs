// Conduit — HTTP transport
//
// The only network primitive the sandbox uses. The sandbox hands it a fully
// built request; the transport never sees the credential map, only the
// headers it has already been given.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use super::SandboxError;

/// A request ready to go on the wire, credentials already injected.
#[derive(Clone)]
pub struct OutboundRequest {
    pub method: String,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl OutboundRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Header values may carry injected secrets, so Debug prints names only.
impl fmt::Debug for OutboundRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.headers.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("OutboundRequest")
            .field("method", &self.method)
            .field("host", &self.url.host_str())
            .field("path", &self.url.path())
            .field("headers", &names)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

/// Raw upstream response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Abstraction over the outbound HTTP client, enabling mock transports in tests.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> Result<HttpResponse, SandboxError>;
}

// ─── reqwest Implementation ─────────────────────────────────────────────────

/// Production transport backed by a shared `reqwest::Client`.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, SandboxError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            // Redirects could carry injected headers to another host.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| SandboxError::Transport(format!("HTTP client error: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: OutboundRequest) -> Result<HttpResponse, SandboxError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| SandboxError::Template(format!("invalid HTTP method '{}'", request.method)))?;

        let mut builder = self.client.request(method, request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        // The URL may carry query credentials; keep it out of the message.
        let response = builder
            .send()
            .await
            .map_err(|e| SandboxError::Transport(e.without_url().to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| {
                SandboxError::Transport(format!("failed to read response body: {}", e.without_url()))
            })?;

        Ok(HttpResponse { status, body })
    }
}

// ─── In-Memory Mock for Testing ──────────────────────────────────────────────

/// A scripted transport that records every request it receives.
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Handler = Box<dyn Fn(&OutboundRequest) -> Result<HttpResponse, SandboxError> + Send + Sync>;

    pub struct MockTransport {
        handler: Handler,
        requests: Mutex<Vec<OutboundRequest>>,
    }

    impl MockTransport {
        pub fn from_fn(
            f: impl Fn(&OutboundRequest) -> Result<HttpResponse, SandboxError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                handler: Box::new(f),
                requests: Mutex::new(Vec::new()),
            }
        }

        /// Answer every request with the same status and body.
        pub fn always(status: u16, body: &str) -> Self {
            let body = body.to_string();
            Self::from_fn(move |_| {
                Ok(HttpResponse {
                    status,
                    body: body.clone(),
                })
            })
        }

        /// Answer requests in order; the last response repeats once exhausted.
        pub fn sequence(responses: Vec<(u16, &str)>) -> Self {
            let queue: VecDeque<HttpResponse> = responses
                .into_iter()
                .map(|(status, body)| HttpResponse {
                    status,
                    body: body.to_string(),
                })
                .collect();
            let queue = Mutex::new(queue);
            Self::from_fn(move |_| {
                let mut queue = queue.lock().unwrap();
                let next = if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                };
                next.ok_or_else(|| SandboxError::Transport("no scripted response".into()))
            })
        }

        /// Fail every request at the network level.
        pub fn unreachable() -> Self {
            Self::from_fn(|_| Err(SandboxError::Transport("connection refused".into())))
        }

        pub fn requests(&self) -> Vec<OutboundRequest> {
            self.requests.lock().unwrap().clone()
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl HttpTransport for MockTransport {
        async fn send(&self, request: OutboundRequest) -> Result<HttpResponse, SandboxError> {
            self.requests.lock().unwrap().push(request.clone());
            (self.handler)(&request)
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
