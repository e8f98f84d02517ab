//! Retrying HTTP executor
//!
//! [`HttpExecutor::execute`] runs one logical call against a [`Deployment`]:
//!
//! 1. Datacenters are tried in deployment order.
//! 2. Inside a datacenter a node is picked round-robin and retried up to
//!    `max_attempts` times with exponential backoff.
//! 3. A node that used up its attempts is skipped for the rest of the call;
//!    once every node of a datacenter failed the next datacenter is tried.
//!
//! Client errors (4xx other than 401/403) and malformed requests end the call
//! immediately. When everything failed the caller gets
//! [`Error::ExhaustedTopology`] with the last error of each datacenter.

use crate::config::ClientConfig;
use crate::error::{DatacenterFailure, Error, Result};
use crate::metrics;
use crate::observer::{AttemptEvent, AttemptListener, AttemptOutcome, TracingListener};
use crate::resource::Resource;
use crate::selector::NodeSelector;
use crate::topology::Deployment;
use crate::transport::{
    HttpMethod, HttpRequest, HttpResponse, HttpTransport, TransportError, UserAgent,
    REQUEST_ID_HEADER, TOKEN_HEADER,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Retry settings applied per node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts on one node before it is marked failed (at least 1)
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub backoff: Duration,
    /// Upper bound for the doubled delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// What the executor does with an attempt's outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Success,
    Retryable,
    Fatal,
}

/// Classify a completed HTTP exchange
pub fn classify_status(status: u16) -> Classification {
    match status {
        200..=299 => Classification::Success,
        401 | 403 => Classification::Retryable,
        500..=599 => Classification::Retryable,
        _ => Classification::Fatal,
    }
}

/// Classify an exchange that did not complete
pub fn classify_transport_error(error: &TransportError) -> Classification {
    match error {
        TransportError::InvalidRequest(_) => Classification::Fatal,
        TransportError::Connect(_) | TransportError::Timeout(_) | TransportError::Other(_) => {
            Classification::Retryable
        }
    }
}

/// Successful exchange and where it landed
#[derive(Debug, Clone)]
pub struct HttpResult {
    pub status: u16,
    pub body: String,
    pub datacenter_id: String,
    pub node_id: String,
    pub request_id: String,
    /// Attempts spent on the whole call, this one included
    pub attempts: u32,
}

/// Failures accumulated during one call
struct Round {
    attempts: u32,
    failures: Vec<DatacenterFailure>,
}

impl Round {
    fn record(&mut self, datacenter: &str, error: String) {
        self.attempts += 1;
        match self.failures.last_mut() {
            Some(last) if last.datacenter == datacenter => {
                last.attempts += 1;
                last.last_error = error;
            }
            _ => self.failures.push(DatacenterFailure {
                datacenter: datacenter.to_string(),
                attempts: 1,
                last_error: error,
            }),
        }
    }

    fn exhausted(self, deadline_exceeded: bool) -> Error {
        Error::ExhaustedTopology {
            attempts: self.attempts,
            failures: self.failures,
            deadline_exceeded,
        }
    }
}

/// Sends requests to a deployment with retry and failover
pub struct HttpExecutor {
    transport: Arc<dyn HttpTransport>,
    retry: RetryPolicy,
    request_timeout: Duration,
    user_agent: UserAgent,
    listeners: Vec<Arc<dyn AttemptListener>>,
}

impl HttpExecutor {
    /// Executor with default retry policy, 10s attempts and a [`TracingListener`]
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(10),
            user_agent: UserAgent::new(),
            listeners: vec![Arc::new(TracingListener)],
        }
    }

    pub fn from_config(config: &ClientConfig, transport: Arc<dyn HttpTransport>) -> Self {
        Self::new(transport)
            .with_retry(config.retry.policy())
            .with_request_timeout(config.http.request_timeout())
            .with_user_agent(UserAgent::from_chunks(&config.user_agent))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = RetryPolicy {
            max_attempts: retry.max_attempts.max(1),
            ..retry
        };
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: UserAgent) -> Self {
        self.user_agent = user_agent;
        self
    }

    /// Register an additional attempt listener
    pub fn with_listener(mut self, listener: Arc<dyn AttemptListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn transport(&self) -> &Arc<dyn HttpTransport> {
        &self.transport
    }

    /// Run one call against the deployment.
    ///
    /// `deadline` bounds the whole call: attempt timeouts are clipped to the
    /// time left and no attempt or backoff starts after it.
    pub async fn execute(
        &self,
        deployment: &Deployment,
        resource: &dyn Resource,
        method: HttpMethod,
        body: Option<&str>,
        deadline: Option<Instant>,
    ) -> Result<HttpResult> {
        let mut selector = NodeSelector::new(deployment);
        let mut round = Round {
            attempts: 0,
            failures: Vec::new(),
        };
        let mut current = selector.next_datacenter(None);

        while let Some(dc_index) = current {
            let datacenter = &deployment.datacenters()[dc_index];

            while let Some(node) = selector.select_node(dc_index) {
                for try_count in 1..=self.retry.max_attempts {
                    let token = match self.remaining(deadline) {
                        None => datacenter.token_provider().token().await?,
                        Some(remaining) => {
                            match tokio::time::timeout(remaining, datacenter.token_provider().token())
                                .await
                            {
                                Ok(token) => token?,
                                Err(_) => {
                                    warn!(datacenter = %datacenter.id(), "Deadline exceeded while acquiring token");
                                    return Err(round.exhausted(true));
                                }
                            }
                        }
                    };
                    let Some(timeout) = self.attempt_timeout(deadline) else {
                        warn!(datacenter = %datacenter.id(), "Deadline exceeded before attempt");
                        return Err(round.exhausted(true));
                    };

                    let url = resource.resource(node);
                    if let Err(e) = reqwest::Url::parse(&url) {
                        return Err(Error::InvalidArgument(format!("Invalid URL '{}': {}", url, e)));
                    }

                    let request_id = Uuid::new_v4().to_string();
                    let mut request = HttpRequest::new(method, url, timeout)
                        .header("Content-Type", "application/json")
                        .header("Accept", "application/json")
                        .header("User-Agent", self.user_agent.header_value())
                        .header(TOKEN_HEADER, token.as_str())
                        .header(REQUEST_ID_HEADER, request_id.as_str());
                    if let Some(body) = body {
                        request = request.body(body);
                    }

                    debug!(
                        datacenter = %datacenter.id(),
                        node = %node.id(),
                        request_id = %request_id,
                        try_count,
                        "Sending {} {}",
                        method,
                        request.url
                    );

                    let started = Instant::now();
                    let reply = match tokio::time::timeout(timeout, self.transport.send(request)).await {
                        Ok(reply) => reply,
                        Err(_) => Err(TransportError::Timeout(format!(
                            "no response within {:?}",
                            timeout
                        ))),
                    };
                    let elapsed = started.elapsed();

                    let (classification, status, error_class) = match &reply {
                        Ok(response) => (classify_status(response.status), Some(response.status), None),
                        Err(e) => (classify_transport_error(e), None, Some(e.error_type().to_string())),
                    };
                    let outcome = match classification {
                        Classification::Success => AttemptOutcome::Success,
                        Classification::Retryable => AttemptOutcome::Retryable,
                        Classification::Fatal => AttemptOutcome::Fatal,
                    };
                    self.emit(AttemptEvent {
                        datacenter_id: datacenter.id().to_string(),
                        node_id: node.id().to_string(),
                        request_id: request_id.clone(),
                        timestamp: Utc::now(),
                        elapsed,
                        try_count,
                        http_status: status,
                        error_class,
                        outcome,
                    });
                    metrics::record_attempt(datacenter.id(), node.id(), outcome.as_str(), elapsed);

                    let last_error = match (classification, reply) {
                        (Classification::Success, Ok(HttpResponse { status, body })) => {
                            return Ok(HttpResult {
                                status,
                                body,
                                datacenter_id: datacenter.id().to_string(),
                                node_id: node.id().to_string(),
                                request_id,
                                attempts: round.attempts + 1,
                            });
                        }
                        (Classification::Fatal, Ok(HttpResponse { status, body })) => {
                            return Err(Error::HttpStatus { status, body });
                        }
                        (Classification::Fatal, Err(e)) => {
                            return Err(Error::InvalidArgument(e.to_string()));
                        }
                        (_, Ok(HttpResponse { status, .. })) => {
                            if status == 401 || status == 403 {
                                datacenter.token_provider().invalidate(&token).await;
                            }
                            format!("node {}: HTTP {}", node.id(), status)
                        }
                        (_, Err(e)) => format!("node {}: {}", node.id(), e),
                    };
                    round.record(datacenter.id(), last_error);

                    if try_count < self.retry.max_attempts {
                        let delay = self.retry.backoff_for(try_count);
                        if deadline.is_some_and(|d| Instant::now() + delay >= d) {
                            warn!(datacenter = %datacenter.id(), "Deadline exceeded during backoff");
                            return Err(round.exhausted(true));
                        }
                        tokio::time::sleep(delay).await;
                    }
                }

                warn!(
                    datacenter = %datacenter.id(),
                    node = %node.id(),
                    attempts = self.retry.max_attempts,
                    "Node failed, trying next node"
                );
                metrics::record_failover(datacenter.id(), "node");
                selector.mark_failed(dc_index, node);
            }

            current = selector.next_datacenter(Some(dc_index));
            if current.is_some() {
                warn!(datacenter = %datacenter.id(), "Datacenter exhausted, failing over");
                metrics::record_failover(datacenter.id(), "datacenter");
            }
        }

        warn!(attempts = round.attempts, "All datacenters exhausted");
        Err(round.exhausted(false))
    }

    /// Time left before the deadline; zero once it has passed
    fn remaining(&self, deadline: Option<Instant>) -> Option<Duration> {
        deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Timeout for the next attempt, or `None` when the deadline has passed
    fn attempt_timeout(&self, deadline: Option<Instant>) -> Option<Duration> {
        match self.remaining(deadline) {
            None => Some(self.request_timeout),
            Some(remaining) => (!remaining.is_zero()).then(|| remaining.min(self.request_timeout)),
        }
    }

    fn emit(&self, event: AttemptEvent) {
        for listener in &self.listeners {
            listener.on_attempt(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CredentialsTokenProvider, StaticTokenProvider, TokenProvider};
    use crate::observer::AuditTrail;
    use crate::resource::ApiRoot;
    use crate::testing::ScriptedTransport;
    use crate::topology::{Datacenter, Node};
    use crate::error::ErrorKind;
    use serde_json::json;

    fn static_token() -> Arc<dyn TokenProvider> {
        Arc::new(StaticTokenProvider::new("AstraCS:test"))
    }

    fn dc(id: &str, nodes: &[&str]) -> Datacenter {
        nodes.iter().fold(Datacenter::new(id, static_token()), |dc, n| {
            let endpoint = format!("http://{}.local:8181", n);
            dc.with_node(Node::new(*n, &endpoint, &endpoint).unwrap()).unwrap()
        })
    }

    fn host(request: &HttpRequest) -> String {
        reqwest::Url::parse(&request.url)
            .unwrap()
            .host_str()
            .unwrap()
            .trim_end_matches(".local")
            .to_string()
    }

    fn executor(transport: Arc<ScriptedTransport>, trail: Arc<AuditTrail>) -> HttpExecutor {
        HttpExecutor::new(transport)
            .with_retry(RetryPolicy {
                max_attempts: 3,
                backoff: Duration::from_millis(100),
                max_backoff: Duration::from_secs(2),
            })
            .with_listener(trail)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(10), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify_status(200), Classification::Success);
        assert_eq!(classify_status(201), Classification::Success);
        assert_eq!(classify_status(401), Classification::Retryable);
        assert_eq!(classify_status(403), Classification::Retryable);
        assert_eq!(classify_status(404), Classification::Fatal);
        assert_eq!(classify_status(400), Classification::Fatal);
        assert_eq!(classify_status(503), Classification::Retryable);
        assert_eq!(
            classify_transport_error(&TransportError::Timeout("t".into())),
            Classification::Retryable
        );
        assert_eq!(
            classify_transport_error(&TransportError::InvalidRequest("bad".into())),
            Classification::Fatal
        );
    }

    #[tokio::test]
    async fn test_success_attaches_headers() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_json(200, json!({"status": {"ok": 1}}));
        let trail = Arc::new(AuditTrail::new());
        let executor = executor(transport.clone(), trail.clone())
            .with_user_agent(UserAgent::new().with_chunk("my-app", Some("1.0")));
        let deployment = Deployment::single(dc("dc1", &["n1"])).unwrap();

        let result = executor
            .execute(&deployment, &ApiRoot, HttpMethod::Post, Some("{\"findNamespaces\":{}}"), None)
            .await
            .unwrap();
        assert_eq!(result.status, 200);
        assert_eq!(result.node_id, "n1");
        assert_eq!(result.attempts, 1);

        let request = &transport.requests()[0];
        assert_eq!(request.url, "http://n1.local:8181/api/json/v1");
        assert_eq!(request.header_value("x-cassandra-token"), Some("AstraCS:test"));
        assert_eq!(request.header_value("content-type"), Some("application/json"));
        assert_eq!(request.header_value("accept"), Some("application/json"));
        assert!(request.header_value("user-agent").unwrap().starts_with("my-app/1.0 lodestar/"));
        let request_id = request.header_value(REQUEST_ID_HEADER).unwrap();
        assert_eq!(Uuid::parse_str(request_id).unwrap().get_version_num(), 4);
        assert_eq!(result.request_id, request_id);
        assert_eq!(trail.events()[0].outcome, AttemptOutcome::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_bounded_when_everything_fails() {
        let transport =
            Arc::new(ScriptedTransport::new().with_handler(|_| Ok(HttpResponse::new(503, "down"))));
        let trail = Arc::new(AuditTrail::new());
        let executor = executor(transport.clone(), trail.clone());
        let deployment =
            Deployment::new(vec![dc("dc1", &["a1", "a2"]), dc("dc2", &["b1", "b2"])]).unwrap();

        let err = executor
            .execute(&deployment, &ApiRoot, HttpMethod::Post, None, None)
            .await
            .unwrap_err();

        assert_eq!(transport.call_count(), 12);
        match err {
            Error::ExhaustedTopology {
                attempts,
                failures,
                deadline_exceeded,
            } => {
                assert_eq!(attempts, 12);
                assert!(!deadline_exceeded);
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].datacenter, "dc1");
                assert_eq!(failures[0].attempts, 6);
                assert!(failures[1].last_error.contains("HTTP 503"));
            }
            other => panic!("expected ExhaustedTopology, got {:?}", other),
        }
        assert_eq!(trail.len(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_order_follows_deployment() {
        let transport = Arc::new(ScriptedTransport::new().with_handler(|request| {
            match host(request).as_str() {
                "b1" => Ok(HttpResponse::new(200, "{}")),
                other => Err(TransportError::Connect(format!("{} refused", other))),
            }
        }));
        let trail = Arc::new(AuditTrail::new());
        let executor = executor(transport.clone(), trail.clone());
        let deployment =
            Deployment::new(vec![dc("dc1", &["a1", "a2"]), dc("dc2", &["b1"])]).unwrap();

        let result = executor
            .execute(&deployment, &ApiRoot, HttpMethod::Post, None, None)
            .await
            .unwrap();
        assert_eq!(result.datacenter_id, "dc2");
        assert_eq!(result.attempts, 7);

        let route: Vec<String> = trail.route().into_iter().map(|(_, n)| n).collect();
        assert_eq!(route, vec!["a1", "a1", "a1", "a2", "a2", "a2", "b1"]);
        let tries: Vec<u32> = trail.events().iter().map(|e| e.try_count).collect();
        assert_eq!(tries, vec![1, 2, 3, 1, 2, 3, 1]);
    }

    #[tokio::test]
    async fn test_client_error_is_fatal() {
        let transport = Arc::new(
            ScriptedTransport::new().with_handler(|_| Ok(HttpResponse::new(404, "no route"))),
        );
        let executor = executor(transport.clone(), Arc::new(AuditTrail::new()));
        let deployment = Deployment::new(vec![dc("dc1", &["a1", "a2"]), dc("dc2", &["b1"])]).unwrap();

        let err = executor
            .execute(&deployment, &ApiRoot, HttpMethod::Post, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HttpStatus { status: 404, .. }));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_url_is_fatal() {
        let transport = Arc::new(ScriptedTransport::new());
        let executor = executor(transport.clone(), Arc::new(AuditTrail::new()));
        let deployment = Deployment::single(dc("dc1", &["a1"])).unwrap();
        let broken = |_: &Node| "::not a url::".to_string();

        let err = executor
            .execute(&deployment, &broken, HttpMethod::Get, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_invalidates_token() {
        let transport = Arc::new(ScriptedTransport::new().with_handler({
            let issued = parking_lot::Mutex::new(0u32);
            move |request| {
                if request.url.ends_with("/v1/auth") {
                    let mut n = issued.lock();
                    *n += 1;
                    return Ok(HttpResponse::new(201, json!({"authToken": format!("t{}", n)}).to_string()));
                }
                match request.header_value(TOKEN_HEADER) {
                    Some("t1") => Ok(HttpResponse::new(401, "expired")),
                    _ => Ok(HttpResponse::new(200, "{}")),
                }
            }
        }));
        let provider = Arc::new(
            CredentialsTokenProvider::new("http://auth.local:8081", "u", "p", transport.clone()).unwrap(),
        );
        let datacenter = Datacenter::new("dc1", provider.clone())
            .with_node(Node::new("n1", "http://n1.local:8181", "http://n1.local:8181").unwrap())
            .unwrap();
        let deployment = Deployment::single(datacenter).unwrap();
        let executor = executor(transport.clone(), Arc::new(AuditTrail::new()));

        let result = executor
            .execute(&deployment, &ApiRoot, HttpMethod::Post, None, None)
            .await
            .unwrap();
        assert_eq!(result.attempts, 2);
        assert_eq!(provider.renewals(), 2);
        assert_eq!(provider.current().await.unwrap().value(), "t2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_the_call() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .with_delay(Duration::from_secs(5))
                .with_handler(|_| Ok(HttpResponse::new(200, "{}"))),
        );
        let executor = executor(transport.clone(), Arc::new(AuditTrail::new()));
        let deployment = Deployment::single(dc("dc1", &["a1", "a2"])).unwrap();

        let started = Instant::now();
        let err = executor
            .execute(
                &deployment,
                &ApiRoot,
                HttpMethod::Post,
                None,
                Some(started + Duration::from_secs(2)),
            )
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(3));
        match err {
            Error::ExhaustedTopology {
                attempts,
                deadline_exceeded,
                failures,
            } => {
                assert!(deadline_exceeded);
                assert_eq!(attempts, 1);
                assert!(failures[0].last_error.contains("timed out"));
            }
            other => panic!("expected ExhaustedTopology, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_token_renewal() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .with_delay(Duration::from_secs(8))
                .with_handler(|request| {
                    if request.url.ends_with("/v1/auth") {
                        Ok(HttpResponse::new(201, json!({"authToken": "t1"}).to_string()))
                    } else {
                        Ok(HttpResponse::new(200, "{}"))
                    }
                }),
        );
        let provider = Arc::new(
            CredentialsTokenProvider::new("http://auth.local:8081", "u", "p", transport.clone()).unwrap(),
        );
        let datacenter = Datacenter::new("dc1", provider.clone())
            .with_node(Node::new("n1", "http://n1.local:8181", "http://n1.local:8181").unwrap())
            .unwrap();
        let deployment = Deployment::single(datacenter).unwrap();
        let executor = executor(transport.clone(), Arc::new(AuditTrail::new()));

        let started = Instant::now();
        let err = executor
            .execute(
                &deployment,
                &ApiRoot,
                HttpMethod::Post,
                None,
                Some(started + Duration::from_secs(1)),
            )
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(
            err,
            Error::ExhaustedTopology { deadline_exceeded: true, attempts: 0, .. }
        ));
        // Only the renewal request went out
        assert_eq!(transport.call_count(), 1);
        assert!(provider.current().await.is_none());
    }

    #[tokio::test]
    async fn test_auth_failure_surfaces_without_failover() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_json(401, json!({"description": "bad credentials"}));
        let provider: Arc<dyn TokenProvider> = Arc::new(
            CredentialsTokenProvider::new("http://auth.local:8081", "u", "bad", transport.clone()).unwrap(),
        );
        let datacenter = Datacenter::new("dc1", provider)
            .with_node(Node::new("n1", "http://n1.local:8181", "http://n1.local:8181").unwrap())
            .unwrap();
        let deployment = Deployment::new(vec![datacenter, dc("dc2", &["b1"])]).unwrap();
        let executor = executor(transport.clone(), Arc::new(AuditTrail::new()));

        let err = executor
            .execute(&deployment, &ApiRoot, HttpMethod::Post, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
        assert_eq!(transport.call_count(), 1);
    }
}
