//! Entry point: namespace administration
//!
//! [`DataApiClient`] owns the command runner (deployment plus executor) and
//! hands out [`Namespace`] handles that share it.

use crate::command::{Command, CommandRunner};
use crate::config::{ClientConfig, InsertManyConfig};
use crate::error::{Error, Result};
use crate::executor::HttpExecutor;
use crate::namespace::Namespace;
use crate::observer::AttemptListener;
use crate::resource::ApiRoot;
use crate::transport::{HttpTransport, ReqwestTransport};
use regex::Regex;
use serde_json::json;
use std::sync::{Arc, OnceLock};
use tracing::info;

const NAME_PATTERN: &str = r"^[A-Za-z][A-Za-z0-9_]{0,47}$";

/// Check a namespace or collection name before it is sent anywhere
pub(crate) fn validate_name(kind: &str, name: &str) -> Result<()> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(NAME_PATTERN).expect("name pattern compiles"));
    if pattern.is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "Invalid {} name '{}': must start with a letter and contain at most 48 letters, digits or underscores",
            kind, name
        )))
    }
}

/// Client for one Data API deployment
#[derive(Clone)]
pub struct DataApiClient {
    runner: CommandRunner,
    insert_many: InsertManyConfig,
}

impl DataApiClient {
    pub fn new(runner: CommandRunner) -> Self {
        Self {
            runner,
            insert_many: InsertManyConfig::default(),
        }
    }

    /// Build the client described by a config, over HTTP
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new(&config.http)?);
        Self::with_transport(config, transport, Vec::new())
    }

    /// Build from a config over the given transport, with extra attempt listeners
    pub fn with_transport(
        config: &ClientConfig,
        transport: Arc<dyn HttpTransport>,
        listeners: Vec<Arc<dyn AttemptListener>>,
    ) -> Result<Self> {
        let deployment = config.build_deployment(Arc::clone(&transport))?;
        let executor = listeners
            .into_iter()
            .fold(HttpExecutor::from_config(config, transport), |executor, listener| {
                executor.with_listener(listener)
            });
        let runner = CommandRunner::new(Arc::new(deployment), Arc::new(executor))
            .with_call_timeout(config.http.call_timeout());

        Ok(Self {
            runner,
            insert_many: config.insert_many.clone(),
        })
    }

    pub fn with_insert_many_config(mut self, config: InsertManyConfig) -> Self {
        self.insert_many = config;
        self
    }

    pub fn runner(&self) -> &CommandRunner {
        &self.runner
    }

    pub async fn create_namespace(&self, name: &str) -> Result<()> {
        validate_name("namespace", name)?;
        self.runner
            .run_command(&ApiRoot, &Command::with_json("createNamespace", json!({ "name": name })))
            .await?;
        info!(namespace = %name, "Namespace created");
        Ok(())
    }

    pub async fn list_namespace_names(&self) -> Result<Vec<String>> {
        self.runner
            .run_command(&ApiRoot, &Command::new("findNamespaces"))
            .await?
            .status_strings("namespaces")
    }

    /// Drop a namespace. Dropping a namespace that does not exist succeeds.
    pub async fn drop_namespace(&self, name: &str) -> Result<()> {
        validate_name("namespace", name)?;
        let command = Command::with_json("dropNamespace", json!({ "name": name }));
        match self.runner.run_command(&ApiRoot, &command).await {
            Ok(_) => {
                info!(namespace = %name, "Namespace dropped");
                Ok(())
            }
            Err(Error::NamespaceNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn namespace_exists(&self, name: &str) -> Result<bool> {
        Ok(self.list_namespace_names().await?.iter().any(|n| n == name))
    }

    /// Handle on a namespace; no request is made
    pub fn namespace(&self, name: &str) -> Result<Namespace> {
        validate_name("namespace", name)?;
        Ok(Namespace::new(
            name,
            self.runner.clone(),
            self.insert_many.clone(),
        ))
    }
}
