//! Client observability metrics
//!
//! Emits through the `metrics` facade; nothing is recorded unless the
//! application installs a recorder/exporter.

use std::time::{Duration, Instant};

/// Record one HTTP attempt
pub fn record_attempt(datacenter: &str, node: &str, outcome: &str, duration: Duration) {
    metrics::counter!(
        "lodestar_http_attempts_total",
        "datacenter" => datacenter.to_string(),
        "node" => node.to_string(),
        "outcome" => outcome.to_string(),
    )
    .increment(1);

    metrics::histogram!(
        "lodestar_http_attempt_duration_seconds",
        "datacenter" => datacenter.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// Record a move away from a node or datacenter ("node" / "datacenter")
pub fn record_failover(datacenter: &str, scope: &str) {
    metrics::counter!(
        "lodestar_failovers_total",
        "datacenter" => datacenter.to_string(),
        "scope" => scope.to_string(),
    )
    .increment(1);
}

/// Record a token renewal outcome
pub fn record_token_renewal(datacenter: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    metrics::counter!(
        "lodestar_token_renewals_total",
        "datacenter" => datacenter.to_string(),
        "status" => status,
    )
    .increment(1);
}

/// Record a command outcome
pub fn record_command(command: &str, status: &str) {
    metrics::counter!(
        "lodestar_commands_total",
        "command" => command.to_string(),
        "status" => status.to_string(),
    )
    .increment(1);
}

/// Guard for timing a command from send to validated response
pub struct CommandTimer {
    command: String,
    start: Instant,
}

impl CommandTimer {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            start: Instant::now(),
        }
    }

    /// Record success and duration
    pub fn success(self) {
        self.finish("ok");
    }

    /// Record error and duration
    pub fn error(self, error_type: &str) {
        self.finish(error_type);
    }

    fn finish(self, status: &str) {
        metrics::histogram!(
            "lodestar_command_duration_seconds",
            "command" => self.command.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());
        record_command(&self.command, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_timer() {
        let timer = CommandTimer::new("findNamespaces");
        std::thread::sleep(Duration::from_millis(1));
        timer.success();

        CommandTimer::new("insertOne").error("document_already_exists");
    }

    #[test]
    fn test_recorders_without_exporter() {
        record_attempt("dc1", "n1", "success", Duration::from_millis(3));
        record_failover("dc1", "node");
        record_token_renewal("dc1", true);
        record_command("find", "ok");
    }
}
