use crate::logic::serve::presence::PresenceTracker;
use crate::logic::serve::publisher::Publisher;
use crate::logic::serve::rate_limit::TokenBucket;
use crate::logic::topic::{build_topic, last_update_topic, UNKNOWN_DEVICE};
use crate::logic::validation::{is_known_parameter, is_valid_topic, is_valid_value};
use chrono::{Local, SecondsFormat};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, error, warn};
use warp::http::{Method, StatusCode};

/// Most distinct parameter keys a report may carry
pub const MAX_PARAMETERS: usize = 5;
/// Largest request body accepted (128 KiB)
pub const MAX_BODY_BYTES: u64 = 128 * 1024;

/// Body expected by the counter firmware after a processed report
pub const OK_BODY: &str = "OK.ERR0";
pub const HEALTHY_BODY: &str = "HEALTHY";

/// What the transport hands to the handler for one request
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub method: Method,
    pub path: String,
    pub remote: Option<SocketAddr>,
    pub content_length: Option<u64>,
    pub query: String,
}

/// Why a request was turned away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    RateLimited,
    MethodNotAllowed,
    PayloadTooLarge,
    TooManyParameters(usize),
    UnknownParameter(String),
    InvalidValue { key: String, value: String },
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Rejection::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Rejection::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Rejection::TooManyParameters(_)
            | Rejection::UnknownParameter(_)
            | Rejection::InvalidValue { .. } => StatusCode::BAD_REQUEST,
        }
    }

    pub fn body(&self) -> &'static str {
        match self {
            Rejection::RateLimited => "Rate limit exceeded\n",
            _ => "",
        }
    }
}

/// Result of handling one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Loopback liveness probe, nothing processed
    Healthy,
    /// Report validated and forwarded (individual publishes may still have failed)
    Accepted { device_id: String, published: usize },
    Rejected(Rejection),
}

impl IngestOutcome {
    pub fn status(&self) -> StatusCode {
        match self {
            IngestOutcome::Healthy | IngestOutcome::Accepted { .. } => StatusCode::OK,
            IngestOutcome::Rejected(rejection) => rejection.status(),
        }
    }

    pub fn body(&self) -> &'static str {
        match self {
            IngestOutcome::Healthy => HEALTHY_BODY,
            IngestOutcome::Accepted { .. } => OK_BODY,
            IngestOutcome::Rejected(rejection) => rejection.body(),
        }
    }
}

/// Query parameters in first-seen key order, every value kept
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestParameters {
    entries: Vec<(String, Vec<String>)>,
}

impl RequestParameters {
    pub fn parse(query: &str) -> Self {
        let mut params = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match params.entries.iter_mut().find(|(k, _)| *k == key) {
                Some((_, values)) => values.push(value.into_owned()),
                None => params.entries.push((key.into_owned(), vec![value.into_owned()])),
            }
        }
        params
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn first(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(key, values)| values.iter().map(move |v| (key.as_str(), v.as_str())))
    }
}

/// Runs the per-request pipeline: admission, validation, presence, publish.
pub struct IngestHandler {
    tracker: Arc<PresenceTracker>,
    publisher: Arc<dyn Publisher>,
    limiter: Arc<TokenBucket>,
    base_topic: String,
}

impl IngestHandler {
    pub fn new(
        tracker: Arc<PresenceTracker>,
        publisher: Arc<dyn Publisher>,
        limiter: Arc<TokenBucket>,
        base_topic: impl Into<String>,
    ) -> Self {
        Self {
            tracker,
            publisher,
            limiter,
            base_topic: base_topic.into(),
        }
    }

    pub async fn handle(&self, request: IngestRequest) -> IngestOutcome {
        let remote = display_addr(request.remote);

        if !self.limiter.allow() {
            warn!(security = true, "Rate limit exceeded from {}", remote);
            return IngestOutcome::Rejected(Rejection::RateLimited);
        }

        if request.method != Method::GET && request.method != Method::HEAD {
            warn!(security = true, "Invalid method '{}' from {}", request.method, remote);
            return IngestOutcome::Rejected(Rejection::MethodNotAllowed);
        }

        if let Some(length) = request.content_length.filter(|l| *l > MAX_BODY_BYTES) {
            warn!(security = true, "Oversized body ({} bytes) from {}", length, remote);
            return IngestOutcome::Rejected(Rejection::PayloadTooLarge);
        }

        let params = RequestParameters::parse(&request.query);

        // liveness probes stay silent and side-effect free
        if params.is_empty() && request.remote.map(|a| is_loopback(a.ip())).unwrap_or(false) {
            return IngestOutcome::Healthy;
        }

        debug!(
            "connection from {} to {} with {} params",
            remote,
            request.path,
            params.len()
        );

        if let Err(rejection) = validate(&params) {
            match &rejection {
                Rejection::TooManyParameters(count) => {
                    warn!(security = true, "Too many params ({}) from {}", count, remote)
                }
                Rejection::UnknownParameter(key) => warn!(
                    security = true,
                    key = ?key,
                    "Invalid parameter key from {} (only GID, CPM, ACPM, uSV, AID allowed)",
                    remote
                ),
                Rejection::InvalidValue { key, value } => warn!(
                    security = true,
                    key = %key,
                    value = ?value,
                    "Invalid value for key '{}' from {}",
                    key,
                    remote
                ),
                _ => {}
            }
            return IngestOutcome::Rejected(rejection);
        }

        let device_id = params
            .first("GID")
            .filter(|gid| !gid.is_empty())
            .unwrap_or(UNKNOWN_DEVICE)
            .to_string();

        self.tracker.touch(&device_id).await;

        let now = Local::now();
        let mut published = 0;
        for (key, value) in params.iter() {
            let topic = build_topic(&self.base_topic, &device_id, key);
            if !is_valid_topic(&topic) {
                warn!(security = true, topic = ?topic, "Invalid topic format from {}", remote);
                continue;
            }
            if self.publish(&topic, value).await {
                published += 1;
            }
        }

        let topic = last_update_topic(&self.base_topic, &device_id);
        if is_valid_topic(&topic) {
            let timestamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);
            if self.publish(&topic, &timestamp).await {
                published += 1;
            }
        }

        IngestOutcome::Accepted {
            device_id,
            published,
        }
    }

    async fn publish(&self, topic: &str, payload: &str) -> bool {
        match self.publisher.publish(topic, payload, false).await {
            Ok(()) => {
                debug!("published to topic {}: {}", topic, payload);
                true
            }
            Err(e) => {
                error!("failed to publish to mqtt topic {}: {}", topic, e);
                false
            }
        }
    }
}

/// All-or-nothing gate run before anything is published
pub fn validate(params: &RequestParameters) -> Result<(), Rejection> {
    if params.len() > MAX_PARAMETERS {
        return Err(Rejection::TooManyParameters(params.len()));
    }
    for (key, value) in params.iter() {
        if !is_known_parameter(key) {
            return Err(Rejection::UnknownParameter(key.to_string()));
        }
        if !is_valid_value(key, value) {
            return Err(Rejection::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            });
        }
    }
    Ok(())
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        }
    }
}

fn display_addr(remote: Option<SocketAddr>) -> String {
    remote
        .map(|a| a.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
