//! Outbound message transport: the gateway boundary plus endpoint routing.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{TransportConfig, TransportKind};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no gateway backend can route {0}")]
    NoRoute(String),
    #[error("gateway request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("gateway {backend} returned {status}: {body}")]
    Rejected {
        backend: String,
        status: StatusCode,
        body: String,
    },
    #[error("invalid gateway configuration: {0}")]
    Config(String),
}

/// What the gateway said about one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Accepted for delivery; `reference` is stored as the message's sent ref.
    Accepted { reference: String },
    /// The gateway answered but refused to take the message.
    Declined,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        origin: &str,
        destination: &str,
        body: &str,
    ) -> Result<Delivery, TransportError>;
}

#[derive(Debug, Clone)]
pub struct Backend {
    pub name: String,
    pub url: Url,
    number_regex: Option<Regex>,
}

/// Picks the gateway backend for a destination number.
///
/// The first backend whose `number_regex` matches wins. Numbers no backend
/// claims go to one of the default backends, chosen by a hash of the number.
/// The pick is stable for a recipient within one build; the std hasher may
/// change between Rust releases, so routes can move after an upgrade.
#[derive(Debug, Clone)]
pub struct Router {
    backends: Vec<Backend>,
    defaults: Vec<usize>,
}

impl Router {
    pub fn from_config(cfg: &TransportConfig) -> Result<Self, TransportError> {
        let mut backends = Vec::with_capacity(cfg.backends.len());
        for b in &cfg.backends {
            let url = Url::parse(&b.url)
                .map_err(|e| TransportError::Config(format!("backend {}: {e}", b.name)))?;
            let number_regex = b
                .number_regex
                .as_deref()
                .map(Regex::new)
                .transpose()
                .map_err(|e| TransportError::Config(format!("backend {}: {e}", b.name)))?;
            backends.push(Backend {
                name: b.name.clone(),
                url,
                number_regex,
            });
        }
        let defaults = cfg
            .default_backends
            .iter()
            .map(|name| {
                backends
                    .iter()
                    .position(|b| &b.name == name)
                    .ok_or_else(|| {
                        TransportError::Config(format!("unknown default backend {name}"))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { backends, defaults })
    }

    pub fn route(&self, destination: &str) -> Option<&Backend> {
        if let Some(b) = self
            .backends
            .iter()
            .find(|b| b.number_regex.as_ref().is_some_and(|re| re.is_match(destination)))
        {
            return Some(b);
        }
        if self.defaults.is_empty() {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        destination.hash(&mut hasher);
        let pick = self.defaults[(hasher.finish() % self.defaults.len() as u64) as usize];
        self.backends.get(pick)
    }
}

/// Reply body accepted from the gateway; both fields are optional.
#[derive(Debug, Deserialize)]
struct GatewayReply {
    #[serde(default = "accepted_by_default")]
    accepted: bool,
    #[serde(default)]
    message_id: Option<String>,
}

fn accepted_by_default() -> bool {
    true
}

/// Posts each message as JSON to the routed gateway backend.
#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
    router: Router,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    pub fn new(router: Router, timeout: Duration) -> Result<Self, TransportError> {
        let http = Client::builder()
            .user_agent("bulk-sender/0.1")
            .timeout(timeout)
            .build()?;
        Ok(Self { http, router })
    }

    pub fn from_config(cfg: &TransportConfig) -> Result<Self, TransportError> {
        Self::new(
            Router::from_config(cfg)?,
            Duration::from_secs(cfg.timeout_seconds),
        )
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        origin: &str,
        destination: &str,
        body: &str,
    ) -> Result<Delivery, TransportError> {
        let backend = self
            .router
            .route(destination)
            .ok_or_else(|| TransportError::NoRoute(destination.to_string()))?;
        let payload = json!({
            "from": origin,
            "to": destination,
            "content": body,
            "backend": backend.name,
        });
        debug!(backend = %backend.name, url = %backend.url, "posting message to gateway");

        let res = self
            .http
            .post(backend.url.clone())
            .json(&payload)
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(backend = %backend.name, %status, "gateway refused request");
            return Err(TransportError::Rejected {
                backend: backend.name.clone(),
                status,
                body,
            });
        }

        let text = res.text().await?;
        // An empty or non-JSON 2xx body still means the gateway took it.
        let reply = serde_json::from_str::<GatewayReply>(&text).unwrap_or(GatewayReply {
            accepted: true,
            message_id: None,
        });
        if !reply.accepted {
            return Ok(Delivery::Declined);
        }
        let reference = reply
            .message_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(Delivery::Accepted { reference })
    }
}

/// Dry-run transport: logs every message and reports it accepted.
#[derive(Debug, Clone, Default)]
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn send(
        &self,
        origin: &str,
        destination: &str,
        body: &str,
    ) -> Result<Delivery, TransportError> {
        let reference = Uuid::new_v4().to_string();
        info!(
            origin,
            destination,
            chars = body.chars().count(),
            %reference,
            "dry run: message not handed to a gateway"
        );
        Ok(Delivery::Accepted { reference })
    }
}

/// Build the transport selected by `transport.kind`.
pub fn from_config(cfg: &TransportConfig) -> Result<Arc<dyn Transport>, TransportError> {
    match cfg.kind {
        TransportKind::Http => Ok(Arc::new(HttpTransport::from_config(cfg)?)),
        TransportKind::Log => Ok(Arc::new(LogTransport)),
    }
}
