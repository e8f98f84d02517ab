//! JSON command envelope
//!
//! Requests are single-key objects `{"<commandName>": <payload>}` POSTed to a
//! resource. Responses carry any of `data`, `status` and `errors`;
//! [`ApiResponse::validate`] turns the failure shapes into typed errors.

use crate::error::{Error, Result};
use crate::executor::HttpExecutor;
use crate::metrics::CommandTimer;
use crate::resource::Resource;
use crate::topology::Deployment;
use crate::transport::HttpMethod;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Body of a command
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Serialized as `{}`
    Empty,
    /// JSON value; `null` is serialized as `{}`
    Json(Value),
    /// Pre-serialized JSON, inlined verbatim
    Raw(String),
}

/// A named command and its payload
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    name: String,
    payload: Payload,
}

impl Command {
    /// Command with an empty payload
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: Payload::Empty,
        }
    }

    pub fn with_json(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload: Payload::Json(payload),
        }
    }

    pub fn with_raw(name: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: Payload::Raw(payload.into()),
        }
    }

    /// Command whose payload is any serializable value
    pub fn from_serializable<T: Serialize>(name: impl Into<String>, payload: &T) -> Result<Self> {
        let value = serde_json::to_value(payload)
            .map_err(|e| Error::InvalidArgument(format!("Unserializable payload: {}", e)))?;
        Ok(Self::with_json(name, value))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Payload as a JSON value, with empty payloads normalized to `{}`
    pub fn payload_value(&self) -> Result<Value> {
        match &self.payload {
            Payload::Empty | Payload::Json(Value::Null) => Ok(Value::Object(Map::new())),
            Payload::Json(value) => Ok(value.clone()),
            Payload::Raw(raw) => match serde_json::from_str(raw) {
                Ok(Value::Null) => Ok(Value::Object(Map::new())),
                Ok(value) => Ok(value),
                Err(e) => Err(Error::InvalidArgument(format!("Raw payload is not JSON: {}", e))),
            },
        }
    }

    /// Wire form of the command
    pub fn to_json(&self) -> Result<String> {
        let name = serde_json::to_string(&self.name)
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let payload = match &self.payload {
            Payload::Empty | Payload::Json(Value::Null) => "{}".to_string(),
            Payload::Json(value) => {
                serde_json::to_string(value).map_err(|e| Error::InvalidArgument(e.to_string()))?
            }
            Payload::Raw(raw) => raw.clone(),
        };
        Ok(format!("{{{}:{}}}", name, payload))
    }

    /// Recover a command from its wire form
    pub fn parse(body: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| Error::InvalidArgument(format!("Command is not JSON: {}", e)))?;
        let Value::Object(map) = value else {
            return Err(Error::InvalidArgument("Command must be a JSON object".to_string()));
        };
        if map.len() != 1 {
            return Err(Error::InvalidArgument(format!(
                "Command must have exactly one key, found {}",
                map.len()
            )));
        }
        let Some((name, payload)) = map.into_iter().next() else {
            return Err(Error::InvalidArgument("Command has no name".to_string()));
        };
        Ok(Self::with_json(name, payload))
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// One entry of a response's `errors` array
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiErrorEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "errorCode", default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(rename = "exceptionClass", default, skip_serializing_if = "Option::is_none")]
    pub exception_class: Option<String>,
    /// Any other fields the server sent
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The `data` section of a response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiData {
    #[serde(default, deserialize_with = "null_as_empty", skip_serializing_if = "Vec::is_empty")]
    pub documents: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<Value>,
    #[serde(rename = "nextPageState", default, skip_serializing_if = "Option::is_none")]
    pub next_page_state: Option<String>,
}

/// Parsed response envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ApiData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Map<String, Value>>,
    #[serde(default, deserialize_with = "null_as_empty", skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ApiErrorEntry>,
}

impl ApiResponse {
    /// Parse a response body. Anything but an envelope object is a faulty response.
    pub fn parse(body: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(body).map_err(|e| {
            Error::FaultyResponse(format!("Response is not JSON ({}): {}", e, preview(body)))
        })?;
        if !value.is_object() {
            return Err(Error::FaultyResponse(format!(
                "Response is not a JSON object: {}",
                preview(body)
            )));
        }
        serde_json::from_value(value)
            .map_err(|e| Error::FaultyResponse(format!("Unexpected response shape: {}", e)))
    }

    /// Turn failure shapes into errors, returning the response otherwise.
    ///
    /// A status with `insertedIds` is returned as is even when `errors` is
    /// present, so partial inserts can be inspected.
    pub fn validate(self) -> Result<Self> {
        if self.status_value("insertedIds").is_some() {
            return Ok(self);
        }
        if !self.errors.is_empty() {
            return Err(Error::from_server_errors(self.errors));
        }
        if let Some(ok) = self.status_value("ok") {
            let succeeded = ok.as_bool().unwrap_or(false) || ok.as_f64() == Some(1.0);
            if !succeeded {
                return Err(Error::CommandFailed {
                    status: self.status.unwrap_or_default(),
                });
            }
        }
        Ok(self)
    }

    pub fn status_value(&self, key: &str) -> Option<&Value> {
        self.status.as_ref().and_then(|s| s.get(key))
    }

    /// String array under a status key (`namespaces`, `collections`)
    pub fn status_strings(&self, key: &str) -> Result<Vec<String>> {
        match self.status_value(key) {
            None => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str().map(String::from).ok_or_else(|| {
                        Error::FaultyResponse(format!("status.{} has a non-string entry", key))
                    })
                })
                .collect(),
            Some(other) => Err(Error::FaultyResponse(format!(
                "status.{} is not an array: {}",
                key, other
            ))),
        }
    }

    pub fn inserted_ids(&self) -> Vec<Value> {
        match self.status_value("insertedIds") {
            Some(Value::Array(ids)) => ids.clone(),
            _ => Vec::new(),
        }
    }

    pub fn status_u64(&self, key: &str) -> Option<u64> {
        self.status_value(key).and_then(Value::as_u64)
    }

    /// `status.moreData` flag
    pub fn has_more_data(&self) -> bool {
        self.status_value("moreData")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn documents(&self) -> &[Value] {
        self.data
            .as_ref()
            .map(|d| d.documents.as_slice())
            .unwrap_or(&[])
    }

    pub fn document(&self) -> Option<&Value> {
        self.data.as_ref().and_then(|d| d.document.as_ref())
    }

    pub fn next_page_state(&self) -> Option<&str> {
        self.data.as_ref().and_then(|d| d.next_page_state.as_deref())
    }
}

fn preview(body: &str) -> String {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

/// Runs commands against a deployment through the executor
#[derive(Clone)]
pub struct CommandRunner {
    deployment: Arc<Deployment>,
    executor: Arc<HttpExecutor>,
    call_timeout: Option<Duration>,
}

impl CommandRunner {
    pub fn new(deployment: Arc<Deployment>, executor: Arc<HttpExecutor>) -> Self {
        Self {
            deployment,
            executor,
            call_timeout: None,
        }
    }

    /// Bound every command (all retries and failovers included)
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn deployment(&self) -> &Arc<Deployment> {
        &self.deployment
    }

    pub fn executor(&self) -> &Arc<HttpExecutor> {
        &self.executor
    }

    /// Send a command and return its validated response
    pub async fn run_command(&self, resource: &dyn Resource, command: &Command) -> Result<ApiResponse> {
        let timer = CommandTimer::new(command.name());
        let result = self.send(resource, command).await;
        match &result {
            Ok(_) => timer.success(),
            Err(e) => timer.error(e.error_type()),
        }
        result
    }

    async fn send(&self, resource: &dyn Resource, command: &Command) -> Result<ApiResponse> {
        let body = command.to_json()?;
        let deadline = self.call_timeout.map(|t| Instant::now() + t);

        let http = self
            .executor
            .execute(&self.deployment, resource, HttpMethod::Post, Some(&body), deadline)
            .await?;
        debug!(
            command = %command.name(),
            node = %http.node_id,
            request_id = %http.request_id,
            "Command answered"
        );

        ApiResponse::parse(&http.body)?.validate()
    }
}
