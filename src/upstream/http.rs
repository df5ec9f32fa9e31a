//! HTTP/1.1 completion endpoint client
//!
//! Each pooled handle is one keep-alive HTTP/1.1 connection driven by its own
//! background task. Requests are posted as-is to the configured endpoint;
//! the payload format belongs to the caller.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::{Method, Request, Uri};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::{Upstream, UpstreamError};
use crate::config::UpstreamConfig;
use crate::error::ConfigError;

/// Longest error body kept in an [`UpstreamError::Status`]
const MAX_ERROR_BODY: usize = 512;

/// An established HTTP/1.1 connection
pub struct HttpConnection {
    sender: http1::SendRequest<Full<Bytes>>,
}

impl HttpConnection {
    /// Whether the connection driver has shut down
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Plain HTTP/1.1 upstream speaking to a single completion endpoint
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    /// host:port used for the TCP connection
    addr: String,

    /// Value of the Host header
    authority: String,

    completion_path: String,
    ping_path: String,
    api_key: Option<String>,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidEndpoint {
            endpoint: config.endpoint.clone(),
            reason: reason.to_string(),
        };

        let uri = config
            .endpoint
            .parse::<Uri>()
            .map_err(|e| invalid(&e.to_string()))?;

        match uri.scheme_str() {
            Some("http") => {}
            Some(other) => return Err(invalid(&format!("unsupported scheme {:?}, only http is supported", other))),
            None => return Err(invalid("missing scheme")),
        }

        let host = uri.host().ok_or_else(|| invalid("missing host"))?;
        let port = uri.port_u16().unwrap_or(80);
        let authority = uri
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_else(|| host.to_string());

        let completion_path = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let ping_path = if config.ping_path.starts_with('/') {
            config.ping_path.clone()
        } else {
            format!("/{}", config.ping_path)
        };

        Ok(Self {
            addr: format!("{}:{}", host, port),
            authority,
            completion_path,
            ping_path,
            api_key: config.api_key.clone(),
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
        })
    }

    fn build_request(&self, method: Method, path: &str, body: Bytes) -> Result<Request<Full<Bytes>>, UpstreamError> {
        let mut req = Request::builder()
            .method(method)
            .uri(path)
            .header(hyper::header::HOST, &self.authority)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .header(hyper::header::ACCEPT, "application/json");

        if let Some(key) = &self.api_key {
            req = req.header(hyper::header::AUTHORIZATION, format!("Bearer {}", key));
        }

        req.body(Full::new(body))
            .map_err(|e| UpstreamError::Transport(format!("invalid request: {}", e)))
    }

    async fn send(&self, conn: &mut HttpConnection, req: Request<Full<Bytes>>) -> Result<Bytes, UpstreamError> {
        let exchange = async {
            conn.sender
                .ready()
                .await
                .map_err(|e| UpstreamError::Transport(e.to_string()))?;

            let response = conn
                .sender
                .send_request(req)
                .await
                .map_err(|e| UpstreamError::Transport(e.to_string()))?;

            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| UpstreamError::Transport(e.to_string()))?
                .to_bytes();

            if status.is_success() {
                Ok(body)
            } else {
                let text = String::from_utf8_lossy(&body);
                Err(UpstreamError::Status {
                    status: status.as_u16(),
                    body: text.chars().take(MAX_ERROR_BODY).collect(),
                })
            }
        };

        tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| UpstreamError::Timeout(self.request_timeout))?
    }
}

impl Upstream for HttpUpstream {
    type Handle = HttpConnection;
    type Payload = Bytes;
    type Output = Bytes;

    async fn connect(&self) -> Result<HttpConnection, UpstreamError> {
        debug!(addr = %self.addr, "Creating new connection");

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| UpstreamError::Timeout(self.connect_timeout))?
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        // Configure TCP keep-alive and disable Nagle for small JSON bodies
        stream
            .set_nodelay(true)
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        socket2::SockRef::from(&stream)
            .set_keepalive(true)
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        // Spawn connection driver task
        let addr = self.addr.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                warn!(addr = %addr, error = %e, "HTTP connection error");
            }
        });

        Ok(HttpConnection { sender })
    }

    async fn call(&self, handle: &mut HttpConnection, payload: Bytes) -> Result<Bytes, UpstreamError> {
        let req = self.build_request(Method::POST, &self.completion_path, payload)?;
        self.send(handle, req).await
    }

    async fn ping(&self, handle: &mut HttpConnection) -> Result<(), UpstreamError> {
        let req = self.build_request(Method::GET, &self.ping_path, Bytes::new())?;
        self.send(handle, req).await.map(|_| ())
    }

    // The server may have closed an idle keep-alive connection
    fn is_reusable(&self, handle: &HttpConnection) -> bool {
        !handle.is_closed()
    }
}
