//! HTTP client pool contract and the reqwest-backed implementation.
//!
//! The core consumes exactly one operation from the transport: submit a
//! request with a completion callback. `submit` never blocks; the callback
//! fires on an arbitrary transport thread, so step implementations wrap it to
//! post back onto the owning session's executor. Connection management,
//! request serialization, and TLS are opaque to the core.

use std::time::Duration;

use tracing::debug;

/// An HTTP request as steps describe it. The transport owns everything else.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// The slice of a response the core cares about.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

pub type ResponseCallback = Box<dyn FnOnce(Result<HttpResponse, String>) + Send>;

/// Narrow transport contract consumed by HTTP steps.
pub trait ClientPool: Send + Sync {
    /// Dispatch a request. Must not block; the callback may fire on any
    /// thread.
    fn submit(&self, request: HttpRequest, on_response: ResponseCallback);
}

/// Connection-pool knobs for the reqwest transport.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Maximum idle connections to keep per host.
    pub max_idle_per_host: usize,

    /// Request timeout.
    pub timeout: Duration,

    /// TCP keepalive duration.
    pub tcp_keepalive: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 32,
            timeout: Duration::from_secs(30),
            tcp_keepalive: Some(Duration::from_secs(60)),
        }
    }
}

/// reqwest-backed [`ClientPool`] running requests on its own runtime.
///
/// Completions are invoked from the runtime's worker threads; HTTP steps
/// route them back to the executor through the task queue.
pub struct ReqwestClientPool {
    client: reqwest::Client,
    runtime: tokio::runtime::Runtime,
}

impl ReqwestClientPool {
    pub fn new(config: ClientConfig) -> Result<Self, String> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(config.max_idle_per_host)
            .timeout(config.timeout);
        if let Some(keepalive) = config.tcp_keepalive {
            builder = builder.tcp_keepalive(keepalive);
        }
        let client = builder
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {}", e))?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("volley-http")
            .enable_all()
            .build()
            .map_err(|e| format!("Failed to build HTTP runtime: {}", e))?;

        Ok(Self { client, runtime })
    }
}

impl ClientPool for ReqwestClientPool {
    fn submit(&self, request: HttpRequest, on_response: ResponseCallback) {
        let client = self.client.clone();
        self.runtime.spawn(async move {
            let method = match reqwest::Method::from_bytes(request.method.as_bytes()) {
                Ok(method) => method,
                Err(_) => {
                    on_response(Err(format!("Unsupported HTTP method: {}", request.method)));
                    return;
                }
            };

            let mut builder = client.request(method, &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            match builder.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    debug!(url = %request.url, status, "Request completed");
                    on_response(Ok(HttpResponse { status, body }));
                }
                Err(e) => {
                    debug!(url = %request.url, error = %e, "Request failed");
                    on_response(Err(e.to_string()));
                }
            }
        });
    }
}
