//! Collection administration within a namespace

use crate::client::validate_name;
use crate::collection::Collection;
use crate::command::{Command, CommandRunner};
use crate::config::InsertManyConfig;
use crate::error::{Error, Result};
use crate::resource::{namespace_resource, NamespaceResource};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

/// Vector search settings of a collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorOptions {
    pub dimension: u32,
    /// `cosine`, `euclidean` or `dot_product`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
}

/// Options sent with `createCollection`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector: Option<VectorOptions>,
    /// Raw indexing rules (`allow` / `deny` lists)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indexing: Option<serde_json::Value>,
}

impl CollectionOptions {
    fn is_empty(&self) -> bool {
        self.vector.is_none() && self.indexing.is_none()
    }
}

/// Handle on one namespace
#[derive(Clone)]
pub struct Namespace {
    name: String,
    runner: CommandRunner,
    resource: NamespaceResource,
    insert_many: InsertManyConfig,
}

impl Namespace {
    pub(crate) fn new(name: &str, runner: CommandRunner, insert_many: InsertManyConfig) -> Self {
        Self {
            name: name.to_string(),
            runner,
            resource: namespace_resource(name),
            insert_many,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create a collection and return its handle
    pub async fn create_collection(&self, name: &str, options: CollectionOptions) -> Result<Collection> {
        validate_name("collection", name)?;
        let mut payload = json!({ "name": name });
        if !options.is_empty() {
            payload["options"] = serde_json::to_value(&options)
                .map_err(|e| Error::InvalidArgument(format!("Invalid collection options: {}", e)))?;
        }
        self.runner
            .run_command(&self.resource, &Command::with_json("createCollection", payload))
            .await?;
        info!(namespace = %self.name, collection = %name, "Collection created");
        self.collection(name)
    }

    pub async fn list_collection_names(&self) -> Result<Vec<String>> {
        self.runner
            .run_command(&self.resource, &Command::new("findCollections"))
            .await?
            .status_strings("collections")
    }

    /// Drop a collection. Dropping a collection that does not exist succeeds.
    pub async fn drop_collection(&self, name: &str) -> Result<()> {
        validate_name("collection", name)?;
        let command = Command::with_json("deleteCollection", json!({ "name": name }));
        match self.runner.run_command(&self.resource, &command).await {
            Ok(_) => {
                info!(namespace = %self.name, collection = %name, "Collection dropped");
                Ok(())
            }
            Err(Error::CollectionNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Handle on a collection; no request is made
    pub fn collection(&self, name: &str) -> Result<Collection> {
        validate_name("collection", name)?;
        Ok(Collection::new(
            &self.name,
            name,
            self.runner.clone(),
            self.insert_many.clone(),
        ))
    }
}
