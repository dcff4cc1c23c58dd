//! REST adapter for the remote backend.
//!
//! Talks to a PostgREST-style endpoint at `{url}/rest/v1/{entity}`. Every
//! request carries the `apikey` header and a bearer token, and every call is
//! bounded twice: by the client timeout and by an outer `tokio::time::timeout`
//! around send plus body read.
//!
//! Failure classification:
//!
//! | outcome                                   | class        |
//! |-------------------------------------------|--------------|
//! | DNS / connect / timeout / body read error | network      |
//! | HTTP 408, 429, 502, 503, 504              | network      |
//! | any other non-2xx                         | application  |
//! | request could not be built                | application  |
//!
//! A 2xx body that is not JSON is still a success and comes back as a string.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderValue;
use reqwest::{Client, Method, RequestBuilder, Url};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    ActivityEvent, BackendAdapter, BackendMode, ChangeEvent, ListQuery, SUBSCRIPTION_BUFFER,
    Subscription, validate_entity,
};
use crate::error::{
    ApplicationFailure, BackendError, ConfigError, NetworkFailure, NetworkFailureKind,
};

/// Connection settings for [`RemoteAdapter`].
#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub activity_entity: String,
    pub poll_interval: Duration,
}

/// How an HTTP status is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Network,
    Application,
}

/// Classify an HTTP status code.
#[must_use]
pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        408 | 429 | 502 | 503 | 504 => StatusClass::Network,
        _ => StatusClass::Application,
    }
}

#[derive(Clone)]
pub struct RemoteAdapter {
    client: Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
    activity_entity: String,
    poll_interval: Duration,
}

impl std::fmt::Debug for RemoteAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // api_key stays out of debug output
        f.debug_struct("RemoteAdapter")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("activity_entity", &self.activity_entity)
            .finish_non_exhaustive()
    }
}

impl RemoteAdapter {
    pub fn new(settings: RemoteSettings) -> crate::Result<Self> {
        let base_url = settings.url.trim_end_matches('/').to_string();
        let parsed = Url::parse(&base_url)
            .map_err(|e| ConfigError::ValidationError(format!("remote.url {base_url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::ValidationError(format!(
                "remote.url must be http(s), got {}",
                parsed.scheme()
            ))
            .into());
        }
        if HeaderValue::from_str(&settings.api_key).is_err() {
            return Err(ConfigError::ValidationError(
                "remote.api_key contains characters not allowed in an HTTP header".to_string(),
            )
            .into());
        }

        let client = Client::builder()
            .timeout(settings.timeout)
            .connect_timeout(settings.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ConfigError::ValidationError(format!("http client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            api_key: settings.api_key,
            timeout: settings.timeout,
            activity_entity: settings.activity_entity,
            poll_interval: settings.poll_interval.max(Duration::from_millis(100)),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/rest/v1/{path}", self.base_url))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Accept", "application/json")
    }

    /// Send `request`, bounded by the adapter timeout, and classify the result.
    async fn execute(&self, operation: &str, request: RequestBuilder) -> Result<Value, BackendError> {
        let exchange = async {
            let response = request
                .send()
                .await
                .map_err(|e| transport_failure(operation, &e))?;
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|e| transport_failure(operation, &e))?;
            Ok::<_, BackendError>((status, body))
        };

        let (status, body) = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(NetworkFailure::new(
                    operation,
                    NetworkFailureKind::Timeout,
                    format!("no response within {}ms", self.timeout.as_millis()),
                )
                .into());
            }
        };

        match classify_status(status) {
            StatusClass::Success => {
                debug!(operation, status, "Remote call succeeded");
                if body.trim().is_empty() {
                    return Ok(Value::Null);
                }
                Ok(serde_json::from_str(&body).unwrap_or_else(|e| {
                    debug!(operation, status, error = %e, "Success body is not JSON");
                    Value::String(body)
                }))
            }
            StatusClass::Network => {
                warn!(operation, status, "Remote unavailable");
                Err(NetworkFailure::new(
                    operation,
                    NetworkFailureKind::Unavailable,
                    format!("HTTP {status}"),
                )
                .into())
            }
            StatusClass::Application => {
                debug!(operation, status, "Remote rejected request");
                Err(application_failure(operation, status, &body).into())
            }
        }
    }
}

fn transport_failure(operation: &str, err: &reqwest::Error) -> BackendError {
    // Nothing left the process; retrying the same request cannot help
    if err.is_builder() {
        return ApplicationFailure::new(operation, format!("request not sent: {err}")).into();
    }
    let kind = if err.is_timeout() {
        NetworkFailureKind::Timeout
    } else if err.is_connect() {
        NetworkFailureKind::Connect
    } else {
        NetworkFailureKind::Transport
    };
    NetworkFailure::new(operation, kind, err.to_string()).into()
}

/// Build an application failure from a PostgREST-style error body
/// (`{"code", "message", "details", "hint"}`), falling back to raw text.
fn application_failure(operation: &str, status: u16, body: &str) -> ApplicationFailure {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let field = |name: &str| {
        parsed
            .as_ref()
            .and_then(|v| v.get(name))
            .and_then(Value::as_str)
            .map(str::to_owned)
    };

    let message = field("message")
        .or_else(|| field("error"))
        .unwrap_or_else(|| {
            let text = body.trim();
            if text.is_empty() {
                format!("HTTP {status}")
            } else {
                text.chars().take(512).collect()
            }
        });

    let mut failure = ApplicationFailure::new(operation, message).with_status(status);
    if let Some(code) = field("code") {
        failure = failure.with_code(code);
    }
    failure
}

/// Encode a filter value for a PostgREST `eq.` expression.
fn filter_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn list_params(query: &ListQuery) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = query
        .filters
        .iter()
        .map(|(field, value)| (field.clone(), format!("eq.{}", filter_value(value))))
        .collect();
    if let Some(field) = &query.order_by {
        let dir = if query.descending { "desc" } else { "asc" };
        params.push(("order".to_string(), format!("{field}.{dir}")));
    }
    if let Some(limit) = query.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    params
}

/// Representation responses come back as one-element arrays.
fn first_row(value: Value) -> Option<Value> {
    match value {
        Value::Array(rows) => rows.into_iter().next(),
        Value::Null => None,
        other => Some(other),
    }
}

#[async_trait]
impl BackendAdapter for RemoteAdapter {
    fn mode(&self) -> BackendMode {
        BackendMode::Remote
    }

    async fn create_record(&self, entity: &str, data: Value) -> Result<Value, BackendError> {
        validate_entity("create", entity)?;
        let operation = format!("create {entity}");
        let request = self
            .request(Method::POST, entity)
            .header("Prefer", "return=representation")
            .json(&data);
        let body = self.execute(&operation, request).await?;
        Ok(first_row(body).unwrap_or(data))
    }

    async fn update_record(
        &self,
        entity: &str,
        id: &str,
        patch: Value,
    ) -> Result<Value, BackendError> {
        validate_entity("update", entity)?;
        let operation = format!("update {entity}");
        let request = self
            .request(Method::PATCH, entity)
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=representation")
            .json(&patch);
        let body = self.execute(&operation, request).await?;
        first_row(body).ok_or_else(|| {
            ApplicationFailure::new(operation, format!("{entity} {id} not found"))
                .with_status(404)
                .with_code("not_found")
                .into()
        })
    }

    async fn delete_record(&self, entity: &str, id: &str) -> Result<(), BackendError> {
        validate_entity("delete", entity)?;
        let operation = format!("delete {entity}");
        let request = self
            .request(Method::DELETE, entity)
            .query(&[("id", format!("eq.{id}"))]);
        self.execute(&operation, request).await?;
        Ok(())
    }

    async fn list_records(
        &self,
        entity: &str,
        query: &ListQuery,
    ) -> Result<Vec<Value>, BackendError> {
        validate_entity("list", entity)?;
        let operation = format!("list {entity}");
        let request = self
            .request(Method::GET, entity)
            .query(&[("select", "*")])
            .query(&list_params(query));
        match self.execute(&operation, request).await? {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            other => Err(ApplicationFailure::new(
                operation,
                format!("expected an array, got {}", json_type(&other)),
            )
            .into()),
        }
    }

    async fn subscribe(&self, entity: &str) -> Result<Subscription, BackendError> {
        validate_entity("subscribe", entity)?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let adapter = self.clone();
        let wanted = entity.to_owned();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(adapter.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last: Option<Vec<Value>> = None;
            loop {
                interval.tick().await;
                match adapter.list_records(&wanted, &ListQuery::new()).await {
                    Ok(records) => {
                        if last.as_ref() == Some(&records) {
                            continue;
                        }
                        last = Some(records.clone());
                        let event = ChangeEvent::Refreshed {
                            entity: wanted.clone(),
                            records,
                        };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(entity = %wanted, error = %e, "Subscription poll failed"),
                }
            }
        });

        Ok(Subscription::new(entity, rx, task))
    }

    async fn record_activity(&self, event: &ActivityEvent) -> Result<(), BackendError> {
        let operation = format!("record activity {}", event.event_type);
        let request = self
            .request(Method::POST, &self.activity_entity)
            .header("Prefer", "return=minimal")
            .json(event);
        self.execute(&operation, request).await?;
        Ok(())
    }

    async fn probe(&self) -> Result<(), BackendError> {
        let request = self.request(Method::GET, "");
        match self.execute("probe", request).await {
            // Any answer other than an availability status means the remote is reachable
            Ok(_) | Err(BackendError::Application(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
