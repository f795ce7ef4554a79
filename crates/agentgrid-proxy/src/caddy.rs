//! Caddy admin API client.
//!
//! Routes live under `/config/apps/http/servers/<server>/routes`. Adding a
//! host appends a `reverse_proxy` route matching that host; removing one
//! looks the route up by host and deletes it by index.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::HostRegistrar;
use crate::error::{ProxyError, ProxyResult};

// ── Route payloads ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Route {
    #[serde(default)]
    pub handle: Vec<Handler>,
    #[serde(rename = "match", default, skip_serializing_if = "Vec::is_empty")]
    pub matchers: Vec<HostMatch>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Handler {
    pub handler: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstreams: Vec<Upstream>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Upstream {
    pub dial: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostMatch {
    #[serde(default)]
    pub host: Vec<String>,
}

impl Route {
    /// A route sending requests for `hostname` to `target`.
    pub fn reverse_proxy(hostname: &str, target: &str) -> Self {
        Self {
            handle: vec![Handler {
                handler: "reverse_proxy".to_string(),
                upstreams: vec![Upstream {
                    dial: target.to_string(),
                }],
            }],
            matchers: vec![HostMatch {
                host: vec![hostname.to_string()],
            }],
        }
    }

    pub fn matches_host(&self, hostname: &str) -> bool {
        self.matchers
            .iter()
            .any(|m| m.host.iter().any(|h| h == hostname))
    }
}

// ── Client ─────────────────────────────────────────────────────────

/// Registers tenant hostnames through the Caddy admin endpoint.
#[derive(Debug, Clone)]
pub struct CaddyRegistrar {
    /// `host:port` of the admin endpoint.
    authority: String,
    server: String,
    timeout: Duration,
}

impl CaddyRegistrar {
    /// Build a client for an `http://host[:port]` admin URL.
    pub fn new(admin_url: &str, server: impl Into<String>) -> ProxyResult<Self> {
        let uri: Uri = admin_url
            .parse()
            .map_err(|_| ProxyError::InvalidUrl(admin_url.to_string()))?;
        if uri.scheme_str().is_some_and(|s| s != "http") {
            return Err(ProxyError::InvalidUrl(format!(
                "{admin_url}: only http admin endpoints are supported"
            )));
        }
        let host = uri
            .host()
            .ok_or_else(|| ProxyError::InvalidUrl(admin_url.to_string()))?;
        let port = uri.port_u16().unwrap_or(80);

        Ok(Self {
            authority: format!("{host}:{port}"),
            server: server.into(),
            timeout: Duration::from_secs(10),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn routes_path(&self) -> String {
        format!("/config/apps/http/servers/{}/routes", self.server)
    }

    /// Current routes of the configured server.
    pub async fn list_routes(&self) -> ProxyResult<Vec<Route>> {
        let body = self.request(Method::GET, &self.routes_path(), None).await?;
        if body.is_empty() {
            return Ok(Vec::new());
        }
        // An unconfigured server path reads back as `null`.
        let routes: Option<Vec<Route>> = serde_json::from_slice(&body)?;
        Ok(routes.unwrap_or_default())
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> ProxyResult<Bytes> {
        tokio::time::timeout(self.timeout, self.send(method, path, body))
            .await
            .map_err(|_| ProxyError::Timeout)?
    }

    async fn send(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> ProxyResult<Bytes> {
        let stream = tokio::net::TcpStream::connect(&self.authority)
            .await
            .map_err(|source| ProxyError::Connect {
                addr: self.authority.clone(),
                source,
            })?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ProxyError::Http(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(path)
            .header("host", &self.authority)
            .header("user-agent", "agentgrid-proxy/0.1");
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let req = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| ProxyError::Http(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| ProxyError::Http(e.to_string()))?;
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| ProxyError::Http(e.to_string()))?
            .to_bytes();

        debug!(%method, %path, %status, "proxy admin request");
        if status != StatusCode::OK {
            return Err(ProxyError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).trim().to_string(),
            });
        }
        Ok(bytes)
    }
}

#[async_trait]
impl HostRegistrar for CaddyRegistrar {
    async fn add_host(&self, hostname: &str, target: &str) -> ProxyResult<()> {
        let route = Route::reverse_proxy(hostname, target);
        let body = serde_json::to_vec(&route)?;
        self.request(Method::POST, &self.routes_path(), Some(body))
            .await?;
        info!(%hostname, %target, "proxy route added");
        Ok(())
    }

    async fn remove_host(&self, hostname: &str) -> ProxyResult<()> {
        let routes = self.list_routes().await?;
        let index = routes
            .iter()
            .position(|r| r.matches_host(hostname))
            .ok_or_else(|| ProxyError::RouteNotFound(hostname.to_string()))?;

        let path = format!("{}/{index}", self.routes_path());
        self.request(Method::DELETE, &path, None).await?;
        info!(%hostname, index, "proxy route removed");
        Ok(())
    }
}
