//! Scripted transport used by unit tests

use crate::transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

type Reply = Result<HttpResponse, TransportError>;
type Handler = Box<dyn Fn(&HttpRequest) -> Reply + Send + Sync>;

/// Replies from a queue first, then from a handler.
///
/// Every request is recorded for later assertions.
pub(crate) struct ScriptedTransport {
    queue: Mutex<VecDeque<Reply>>,
    handler: Handler,
    requests: Mutex<Vec<HttpRequest>>,
    delay: Option<Duration>,
}

impl ScriptedTransport {
    /// Empty script; unscripted requests fail with a connection error
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            handler: Box::new(|request| {
                Err(TransportError::Connect(format!("unscripted request to {}", request.url)))
            }),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Answer unscripted requests with `handler`
    pub fn with_handler(
        mut self,
        handler: impl Fn(&HttpRequest) -> Reply + Send + Sync + 'static,
    ) -> Self {
        self.handler = Box::new(handler);
        self
    }

    /// Sleep before every reply
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, reply: Reply) {
        self.queue.lock().push_back(reply);
    }

    pub fn push_json(&self, status: u16, body: serde_json::Value) {
        self.push(Ok(HttpResponse::new(status, body.to_string())));
    }

    pub fn push_error(&self, error: TransportError) {
        self.push(Err(error));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Request bodies parsed as JSON
    pub fn bodies(&self) -> Vec<serde_json::Value> {
        self.requests
            .lock()
            .iter()
            .filter_map(|r| r.body.as_deref())
            .filter_map(|b| serde_json::from_str(b).ok())
            .collect()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Reply {
        self.requests.lock().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.queue.lock().pop_front();
        match scripted {
            Some(reply) => reply,
            None => (self.handler)(&request),
        }
    }
}
