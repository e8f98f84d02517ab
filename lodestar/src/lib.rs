//! Lodestar - resilient client core for multi-datacenter Data API deployments
//!
//! Talks to a document/vector database HTTP front end spread over several
//! nodes and datacenters, and keeps calls alive while individual nodes or
//! whole datacenters fail.
//!
//! # Architecture
//!
//! - **Topology**: ordered datacenters, each with its nodes and token provider
//! - **Selector**: round-robin node choice with per-call failure tracking
//! - **Auth**: static tokens or credential-based tokens with single-flight renewal
//! - **Executor**: retry with backoff, node and datacenter failover, deadlines
//! - **Command**: `{"<name>": payload}` envelope, response validation, error mapping
//! - **Cursor**: lazy pagination over opaque page states
//!
//! # Facades
//!
//! - [`DataApiClient`]: create, list and drop namespaces
//! - [`Namespace`]: create, list and drop collections
//! - [`Collection`]: insert, find, count, delete and update documents

pub mod auth;
pub mod client;
pub mod collection;
pub mod command;
pub mod config;
pub mod cursor;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod namespace;
pub mod observer;
pub mod resource;
pub mod selector;
pub mod topology;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::{CredentialsTokenProvider, StaticTokenProvider, Token, TokenProvider};
pub use client::DataApiClient;
pub use collection::{ChunkFailure, Collection, InsertManyOptions, InsertManyResult, UpdateResult};
pub use command::{ApiData, ApiErrorEntry, ApiResponse, Command, CommandRunner, Payload};
pub use config::{default_config_path, ClientConfig};
pub use cursor::{Cursor, CursorState, FindOptions, Page, PageSource};
pub use error::{ApiFailure, DatacenterFailure, Error, ErrorKind, Result};
pub use executor::{HttpExecutor, HttpResult, RetryPolicy};
pub use namespace::{CollectionOptions, Namespace, VectorOptions};
pub use observer::{AttemptEvent, AttemptListener, AttemptOutcome, AuditTrail, TracingListener};
pub use resource::{ApiRoot, Resource, ResourceExt};
pub use topology::{Datacenter, Deployment, Node};
pub use transport::{HttpMethod, HttpTransport, ReqwestTransport, UserAgent};
