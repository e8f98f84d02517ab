use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lodestar::config::LoggingConfig;
use lodestar::{
    default_config_path, ClientConfig, CollectionOptions, DataApiClient, FindOptions,
    InsertManyOptions, VectorOptions,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "lodestar")]
#[command(about = "Lodestar CLI - Data API administration")]
#[command(version)]
struct Cli {
    /// Configuration file path (defaults to ~/.lodestar/config.toml)
    #[arg(short, long, env = "LODESTAR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a starter config file
    Init {
        /// Data API endpoint of the first node
        #[arg(long, default_value = "http://localhost:8181")]
        endpoint: String,

        /// Static application token
        #[arg(long, env = "LODESTAR_TOKEN")]
        token: String,
    },

    #[command(flatten)]
    Api(ApiCommand),
}

/// Commands that talk to the deployment
#[derive(Subcommand, Debug)]
enum ApiCommand {
    /// List namespaces
    Namespaces,

    /// Create a namespace
    CreateNamespace { name: String },

    /// Drop a namespace (no error if it does not exist)
    DropNamespace { name: String },

    /// List collections of a namespace
    Collections { namespace: String },

    /// Create a collection
    CreateCollection {
        namespace: String,
        name: String,

        /// Vector dimension, enables vector search
        #[arg(long)]
        dimension: Option<u32>,

        /// Similarity metric (cosine, euclidean, dot_product)
        #[arg(long, requires = "dimension")]
        metric: Option<String>,
    },

    /// Drop a collection (no error if it does not exist)
    DropCollection { namespace: String, name: String },

    /// Insert documents from a JSONL file
    Insert {
        namespace: String,
        collection: String,

        /// File with one JSON document per line
        #[arg(short, long)]
        input: PathBuf,

        /// Documents per insertMany command
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Chunks in flight at once
        #[arg(long)]
        concurrency: Option<usize>,

        /// Stop at the first failing chunk
        #[arg(long)]
        ordered: bool,
    },

    /// Print documents matching a filter, one JSON document per line
    Find {
        namespace: String,
        collection: String,

        /// JSON filter
        #[arg(short, long)]
        filter: Option<String>,

        /// Maximum number of documents
        #[arg(short, long)]
        limit: Option<u64>,
    },

    /// Count documents matching a filter
    Count {
        namespace: String,
        collection: String,

        /// JSON filter
        #[arg(short, long)]
        filter: Option<String>,

        /// Fail when more documents match (at most 1000)
        #[arg(long, default_value = "1000")]
        upper_bound: u64,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| logging.level.clone()),
    );
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| logging.format.clone());
    let json = format.eq_ignore_ascii_case("json");

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

fn load_config(path: &Path) -> Result<ClientConfig> {
    if path.exists() {
        ClientConfig::load(path).with_context(|| format!("loading {}", path.display()))
    } else {
        Ok(ClientConfig::default())
    }
}

fn parse_filter(filter: Option<&str>) -> Result<Value> {
    match filter {
        Some(raw) => serde_json::from_str(raw).context("filter must be valid JSON"),
        None => Ok(Value::Object(Default::default())),
    }
}

fn read_jsonl(path: &Path) -> Result<Vec<Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("{}:{}", path.display(), i + 1))
        })
        .collect()
}

fn init_config(path: &Path, endpoint: &str, token: &str) -> Result<()> {
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    let mut config = ClientConfig::from_toml_str(&format!(
        "[[datacenters]]\nid = \"dc1\"\n\n[[datacenters.nodes]]\nid = \"dc1-n1\"\nendpoint = \"{}\"\n",
        endpoint
    ))?;
    for datacenter in &mut config.datacenters {
        datacenter.token = Some(token.to_string());
    }
    config.save(path)?;
    tracing::info!("Wrote {}", path.display());
    Ok(())
}

async fn run(client: &DataApiClient, command: ApiCommand) -> Result<()> {
    match command {
        ApiCommand::Namespaces => {
            for name in client.list_namespace_names().await? {
                println!("{}", name);
            }
        }
        ApiCommand::CreateNamespace { name } => {
            client.create_namespace(&name).await?;
            tracing::info!("Created namespace {}", name);
        }
        ApiCommand::DropNamespace { name } => {
            client.drop_namespace(&name).await?;
            tracing::info!("Dropped namespace {}", name);
        }
        ApiCommand::Collections { namespace } => {
            for name in client.namespace(&namespace)?.list_collection_names().await? {
                println!("{}", name);
            }
        }
        ApiCommand::CreateCollection {
            namespace,
            name,
            dimension,
            metric,
        } => {
            let options = CollectionOptions {
                vector: dimension.map(|dimension| VectorOptions { dimension, metric }),
                ..Default::default()
            };
            client
                .namespace(&namespace)?
                .create_collection(&name, options)
                .await?;
            tracing::info!("Created collection {}.{}", namespace, name);
        }
        ApiCommand::DropCollection { namespace, name } => {
            client.namespace(&namespace)?.drop_collection(&name).await?;
            tracing::info!("Dropped collection {}.{}", namespace, name);
        }
        ApiCommand::Insert {
            namespace,
            collection,
            input,
            chunk_size,
            concurrency,
            ordered,
        } => {
            let documents = read_jsonl(&input)?;
            let collection = client.namespace(&namespace)?.collection(&collection)?;
            let result = collection
                .insert_many(
                    &documents,
                    InsertManyOptions {
                        ordered,
                        chunk_size,
                        concurrency,
                    },
                )
                .await?;
            tracing::info!(
                "Inserted {} of {} documents",
                result.inserted_ids.len(),
                documents.len()
            );
            for failed in &result.failed_chunks {
                tracing::warn!(
                    offset = failed.offset,
                    documents = failed.documents,
                    kind = %failed.kind,
                    "{}",
                    failed.message
                );
            }
            for error in &result.errors {
                tracing::warn!(
                    code = ?error.error_code,
                    "{}",
                    error.message.as_deref().unwrap_or("insert failed")
                );
            }
        }
        ApiCommand::Find {
            namespace,
            collection,
            filter,
            limit,
        } => {
            let collection = client.namespace(&namespace)?.collection(&collection)?;
            let mut cursor = collection.find::<Value>(FindOptions {
                filter: Some(parse_filter(filter.as_deref())?),
                limit,
                ..Default::default()
            });
            while let Some(document) = cursor.next().await? {
                println!("{}", document);
            }
        }
        ApiCommand::Count {
            namespace,
            collection,
            filter,
            upper_bound,
        } => {
            let collection = client.namespace(&namespace)?.collection(&collection)?;
            let count = collection
                .count_documents(parse_filter(filter.as_deref())?, upper_bound)
                .await?;
            println!("{}", count);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = load_config(&config_path)?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Init { endpoint, token } => init_config(&config_path, &endpoint, &token),
        Commands::Api(command) => {
            let client = DataApiClient::from_config(&config)
                .with_context(|| format!("building client from {}", config_path.display()))?;
            run(&client, command).await
        }
    }
}
