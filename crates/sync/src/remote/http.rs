// JSON-over-HTTP remote repository.
//
// Talks to `{base_url}/v1/operations/{collection}`. The service has no push
// channel, so change subscriptions are served by a poll task per channel
// that compares a cheap fingerprint of the collection between polls.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};
use tracker_common::change::ChangeEvent;
use tracker_common::kind::EntityKind;
use tracker_common::patch::Patch;
use tracker_common::types::Entity;
use url::Url;

use super::{ChangeFeed, ChannelId, RemoteRepository, CHANGE_FEED_CAPACITY};
use crate::error::RemoteError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct HttpRepository {
    inner: Arc<HttpInner>,
    pollers: Mutex<HashMap<ChannelId, JoinHandle<()>>>,
}

struct HttpInner {
    client: reqwest::Client,
    base_url: Url,
    auth_token: Option<String>,
    poll_interval: Duration,
}

impl HttpRepository {
    pub fn new(
        base_url: &str,
        auth_token: Option<String>,
        poll_interval: Duration,
    ) -> Result<Self, RemoteError> {
        let base_url = validate_base_url(base_url)?;
        let poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("tracker-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::Unavailable(format!("failed to build http client: {e}")))?;

        Ok(Self {
            inner: Arc::new(HttpInner { client, base_url, auth_token, poll_interval }),
            pollers: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    fn pollers(&self) -> MutexGuard<'_, HashMap<ChannelId, JoinHandle<()>>> {
        self.pollers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for HttpRepository {
    fn drop(&mut self) {
        for (_, poller) in self.pollers().drain() {
            poller.abort();
        }
    }
}

impl HttpInner {
    fn collection_url(&self, kind: EntityKind, id: Option<&str>) -> Result<Url, RemoteError> {
        collection_url(&self.base_url, kind, id)
    }

    async fn list(
        &self,
        kind: EntityKind,
        listing_id: Option<&str>,
    ) -> Result<Vec<Entity>, RemoteError> {
        let mut request = self.client.get(self.collection_url(kind, None)?);
        if let Some(listing_id) = listing_id {
            request = request.query(&[("listing_id", listing_id)]);
        }

        let body = self.send(request, kind, None).await?;
        extract_items(kind, body)?
            .into_iter()
            .map(|item| Entity::from_value(kind, item).map_err(decode_error(kind)))
            .collect()
    }

    async fn send(
        &self,
        request: RequestBuilder,
        kind: EntityKind,
        id: Option<&str>,
    ) -> Result<Value, RemoteError> {
        let request = match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response =
            request.send().await.map_err(|e| RemoteError::Unavailable(e.to_string()))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            if let Some(id) = id {
                return Err(RemoteError::NotFound { kind, id: id.to_string() });
            }
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RemoteError::Rejected { status: status.as_u16(), message });
        }

        response.json::<Value>().await.map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

impl RemoteRepository for HttpRepository {
    async fn fetch_all(&self, kind: EntityKind) -> Result<Vec<Entity>, RemoteError> {
        self.inner.list(kind, None).await
    }

    async fn fetch_scoped(
        &self,
        kind: EntityKind,
        listing_id: &str,
    ) -> Result<Vec<Entity>, RemoteError> {
        self.inner.list(kind, Some(listing_id)).await
    }

    async fn mutate(&self, kind: EntityKind, id: &str, patch: &Patch) -> Result<Entity, RemoteError> {
        let url = self.inner.collection_url(kind, Some(id))?;
        let body = self.inner.send(self.inner.client.patch(url).json(patch), kind, Some(id)).await?;
        Entity::from_value(kind, extract_one(body)).map_err(decode_error(kind))
    }

    async fn create(&self, kind: EntityKind, draft: &Entity) -> Result<Entity, RemoteError> {
        let mut payload = draft.to_value().map_err(decode_error(kind))?;
        if let Some(object) = payload.as_object_mut() {
            object.remove("id");
        }

        let url = self.inner.collection_url(kind, None)?;
        let body = self.inner.send(self.inner.client.post(url).json(&payload), kind, None).await?;
        Entity::from_value(kind, extract_one(body)).map_err(decode_error(kind))
    }

    async fn subscribe_changes(&self, kind: EntityKind) -> Result<ChangeFeed, RemoteError> {
        let baseline = Fingerprint::of(&self.inner.list(kind, None).await?);
        let (tx, events) = mpsc::channel(CHANGE_FEED_CAPACITY);
        let channel = ChannelId::new(kind);

        let poller = tokio::spawn(poll_changes(Arc::clone(&self.inner), kind, baseline, tx));
        self.pollers().insert(channel.clone(), poller);
        debug!(
            %channel,
            interval_ms = self.inner.poll_interval.as_millis() as u64,
            "change poller started"
        );
        Ok(ChangeFeed { channel, events })
    }

    fn unsubscribe(&self, channel: &ChannelId) {
        if let Some(poller) = self.pollers().remove(channel) {
            poller.abort();
            debug!(%channel, "change poller stopped");
        }
    }
}

// ── Change polling ──────────────────────────────────────────────────

/// Cheap summary of a collection: moves whenever a row is inserted,
/// updated, or soft deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    count: usize,
    latest: Option<DateTime<Utc>>,
}

impl Fingerprint {
    fn of(entities: &[Entity]) -> Self {
        Self { count: entities.len(), latest: entities.iter().map(Entity::updated_at).max() }
    }
}

async fn poll_changes(
    inner: Arc<HttpInner>,
    kind: EntityKind,
    baseline: Fingerprint,
    tx: mpsc::Sender<ChangeEvent>,
) {
    let mut last = baseline;
    let mut ticker = tokio::time::interval(inner.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if tx.is_closed() {
            break;
        }

        match inner.list(kind, None).await {
            Ok(rows) => {
                let current = Fingerprint::of(&rows);
                if current == last {
                    continue;
                }
                last = current;
                if tx.send(ChangeEvent::collection_changed(kind)).await.is_err() {
                    break;
                }
            }
            Err(error) => warn!(%kind, %error, "change poll failed"),
        }
    }
    debug!(%kind, "change poller exited");
}

// ── Helpers ─────────────────────────────────────────────────────────

fn validate_base_url(value: &str) -> Result<Url, RemoteError> {
    let invalid = |message: String| RemoteError::Rejected { status: 0, message };
    let parsed = Url::parse(value).map_err(|e| invalid(format!("invalid base_url `{value}`: {e}")))?;
    match parsed.scheme() {
        "https" => Ok(parsed),
        "http" if is_loopback_host(parsed.host_str()) => Ok(parsed),
        _ => Err(invalid("base_url must use https (http is allowed only for localhost)".into())),
    }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok_and(|addr| addr.is_loopback())
}

fn collection_url(base: &Url, kind: EntityKind, id: Option<&str>) -> Result<Url, RemoteError> {
    let mut url = base.clone();
    {
        let mut segments = url.path_segments_mut().map_err(|()| RemoteError::Rejected {
            status: 0,
            message: format!("base_url `{base}` cannot carry a path"),
        })?;
        segments.pop_if_empty().extend(["v1", "operations", kind.collection()]);
        if let Some(id) = id {
            segments.push(id);
        }
    }
    Ok(url)
}

/// Accepts a bare array, `{"data": [...]}`, or `{"<collection>": [...]}`.
fn extract_items(kind: EntityKind, body: Value) -> Result<Vec<Value>, RemoteError> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut object) => {
            let items = object.remove("data").or_else(|| object.remove(kind.collection()));
            match items {
                Some(Value::Array(items)) => Ok(items),
                Some(Value::Null) | None if object.is_empty() => Ok(Vec::new()),
                _ => Err(RemoteError::Decode(format!("expected a list of {kind}"))),
            }
        }
        Value::Null => Ok(Vec::new()),
        _ => Err(RemoteError::Decode(format!("expected a list of {kind}"))),
    }
}

/// Accepts a bare object or `{"data": {...}}`.
fn extract_one(body: Value) -> Value {
    match body {
        Value::Object(mut object) if object.len() == 1 && object.contains_key("data") => {
            object.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn decode_error(kind: EntityKind) -> impl Fn(serde_json::Error) -> RemoteError {
    move |error| RemoteError::Decode(format!("{kind}: {error}"))
}
