//! Document operations on one collection

use crate::command::{ApiErrorEntry, ApiResponse, Command, CommandRunner};
use crate::config::InsertManyConfig;
use crate::cursor::{Cursor, FindOptions, Page, PageSource};
use crate::error::{Error, ErrorKind, Result, MAX_COUNT_UPPER_BOUND};
use crate::resource::{collection_resource, CollectionResource};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

/// Largest number of documents in one `insertMany` command
pub const MAX_CHUNK_SIZE: usize = 100;

/// Per-call overrides for [`Collection::insert_many`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertManyOptions {
    /// Insert in order and stop at the first failing chunk
    pub ordered: bool,
    pub chunk_size: Option<usize>,
    pub concurrency: Option<usize>,
}

/// A chunk whose `insertMany` command failed as a whole
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    /// Index of the chunk's first document in the input
    pub offset: usize,
    pub documents: usize,
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of an `insert_many`, possibly partial
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertManyResult {
    pub inserted_ids: Vec<Value>,
    /// Server errors reported alongside inserted ids
    pub errors: Vec<ApiErrorEntry>,
    /// Chunks that produced no response to inspect
    pub failed_chunks: Vec<ChunkFailure>,
}

impl InsertManyResult {
    fn absorb(&mut self, response: ApiResponse) {
        self.inserted_ids.extend(response.inserted_ids());
        self.errors.extend(response.errors);
    }

    fn fail_chunk(&mut self, offset: usize, documents: usize, error: &Error) {
        self.failed_chunks.push(ChunkFailure {
            offset,
            documents,
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    /// Whether every document was inserted without error
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty() && self.failed_chunks.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<Value>,
}

/// Handle on one collection
#[derive(Clone)]
pub struct Collection {
    namespace: String,
    name: String,
    runner: CommandRunner,
    resource: Arc<CollectionResource>,
    insert_many: InsertManyConfig,
}

impl Collection {
    pub(crate) fn new(
        namespace: &str,
        name: &str,
        runner: CommandRunner,
        insert_many: InsertManyConfig,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            runner,
            resource: Arc::new(collection_resource(namespace, name)),
            insert_many,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn run(&self, command: Command) -> Result<ApiResponse> {
        self.runner.run_command(self.resource.as_ref(), &command).await
    }

    /// Insert one document and return its id
    pub async fn insert_one<D: Serialize>(&self, document: &D) -> Result<Value> {
        let document = to_document(document)?;
        let response = self
            .run(Command::with_json("insertOne", json!({ "document": document })))
            .await?;
        if let Some(id) = response.inserted_ids().into_iter().next() {
            return Ok(id);
        }
        if !response.errors.is_empty() {
            return Err(Error::from_server_errors(response.errors));
        }
        Err(Error::FaultyResponse("insertOne returned no inserted id".to_string()))
    }

    /// Insert documents in chunks.
    ///
    /// Ordered inserts run one chunk at a time and stop at the first chunk
    /// that reports errors. Unordered inserts run up to `concurrency` chunks
    /// at once; ids are then not in input order.
    ///
    /// A chunk whose command fails is listed in `failed_chunks` and the ids
    /// of the other chunks are kept. The error is returned only when no
    /// chunk produced anything to inspect.
    pub async fn insert_many<D: Serialize>(
        &self,
        documents: &[D],
        options: InsertManyOptions,
    ) -> Result<InsertManyResult> {
        let chunk_size = options.chunk_size.unwrap_or(self.insert_many.chunk_size);
        let concurrency = options.concurrency.unwrap_or(self.insert_many.concurrency);
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidArgument(format!(
                "chunk size must be between 1 and {}, got {}",
                MAX_CHUNK_SIZE, chunk_size
            )));
        }
        if concurrency == 0 {
            return Err(Error::InvalidArgument("concurrency must be at least 1".to_string()));
        }
        if options.ordered && concurrency > 1 {
            return Err(Error::InvalidArgument(
                "ordered inserts cannot run with concurrency above 1".to_string(),
            ));
        }

        let documents = documents.iter().map(to_document).collect::<Result<Vec<_>>>()?;
        let mut result = InsertManyResult::default();
        if documents.is_empty() {
            return Ok(result);
        }
        debug!(
            collection = %self.name,
            documents = documents.len(),
            chunk_size,
            concurrency,
            ordered = options.ordered,
            "insertMany"
        );

        let mut first_error = None;
        if options.ordered {
            for (index, chunk) in documents.chunks(chunk_size).enumerate() {
                match self.insert_chunk(chunk, true).await {
                    Ok(response) => {
                        let failed = !response.errors.is_empty();
                        result.absorb(response);
                        if failed {
                            warn!(collection = %self.name, "Ordered insert stopped at failing chunk");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(collection = %self.name, error = %e, "Ordered insert stopped at failing chunk");
                        result.fail_chunk(index * chunk_size, chunk.len(), &e);
                        first_error = Some(e);
                        break;
                    }
                }
            }
        } else {
            let responses: Vec<(usize, usize, Result<ApiResponse>)> =
                stream::iter(documents.chunks(chunk_size).enumerate())
                    .map(|(index, chunk)| async move {
                        (index * chunk_size, chunk.len(), self.insert_chunk(chunk, false).await)
                    })
                    .buffer_unordered(concurrency)
                    .collect()
                    .await;
            for (offset, len, response) in responses {
                match response {
                    Ok(response) => result.absorb(response),
                    Err(e) => {
                        warn!(collection = %self.name, offset, error = %e, "insertMany chunk failed");
                        result.fail_chunk(offset, len, &e);
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        // Nothing to inspect: surface the error itself
        if result.inserted_ids.is_empty() && result.errors.is_empty() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }
        Ok(result)
    }

    async fn insert_chunk(&self, chunk: &[Value], ordered: bool) -> Result<ApiResponse> {
        self.run(Command::with_json(
            "insertMany",
            json!({ "documents": chunk, "options": { "ordered": ordered } }),
        ))
        .await
    }

    /// First document matching `filter`
    pub async fn find_one<T: DeserializeOwned>(
        &self,
        filter: Value,
        options: FindOptions,
    ) -> Result<Option<T>> {
        let options = FindOptions {
            filter: Some(filter),
            skip: None,
            limit: None,
            ..options
        };
        let response = self
            .run(Command::with_json("findOne", options.to_payload(None)))
            .await?;
        match response.document() {
            None | Some(Value::Null) => Ok(None),
            Some(document) => Ok(Some(serde_json::from_value(document.clone())?)),
        }
    }

    /// Lazy cursor over the documents matching `options`
    pub fn find<T>(&self, options: FindOptions) -> Cursor<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let source = Arc::new(FindSource::<T> {
            collection: self.clone(),
            _marker: PhantomData,
        });
        Cursor::new(source, options)
    }

    /// Count documents matching `filter`, failing when more than `upper_bound` match
    pub async fn count_documents(&self, filter: Value, upper_bound: u64) -> Result<u64> {
        if upper_bound > MAX_COUNT_UPPER_BOUND {
            return Err(Error::InvalidArgument(format!(
                "upper bound {} exceeds the maximum of {}",
                upper_bound, MAX_COUNT_UPPER_BOUND
            )));
        }
        let response = self
            .run(Command::with_json("countDocuments", json!({ "filter": filter })))
            .await?;
        let count = response
            .status_u64("count")
            .ok_or_else(|| Error::FaultyResponse("countDocuments returned no count".to_string()))?;
        if response.has_more_data() || count > upper_bound {
            return Err(Error::TooManyDocuments { limit: upper_bound });
        }
        Ok(count)
    }

    pub async fn delete_one(&self, filter: Value) -> Result<u64> {
        let response = self
            .run(Command::with_json("deleteOne", json!({ "filter": filter })))
            .await?;
        Ok(response.status_u64("deletedCount").unwrap_or(0))
    }

    /// Delete every matching document, repeating while the server reports more
    pub async fn delete_many(&self, filter: Value) -> Result<u64> {
        let mut deleted = 0;
        loop {
            let response = self
                .run(Command::with_json("deleteMany", json!({ "filter": filter })))
                .await?;
            let round = response.status_u64("deletedCount").unwrap_or(0);
            deleted += round;
            if !response.has_more_data() {
                return Ok(deleted);
            }
            if round == 0 {
                warn!(collection = %self.name, "deleteMany reports more data but deleted nothing, stopping");
                return Ok(deleted);
            }
        }
    }

    pub async fn update_one(&self, filter: Value, update: Value, upsert: bool) -> Result<UpdateResult> {
        let response = self
            .run(Command::with_json(
                "updateOne",
                json!({ "filter": filter, "update": update, "options": { "upsert": upsert } }),
            ))
            .await?;
        Ok(UpdateResult {
            matched_count: response.status_u64("matchedCount").unwrap_or(0),
            modified_count: response.status_u64("modifiedCount").unwrap_or(0),
            upserted_id: response.status_value("upsertedId").cloned(),
        })
    }
}

fn to_document<D: Serialize>(document: &D) -> Result<Value> {
    let value = serde_json::to_value(document)
        .map_err(|e| Error::InvalidArgument(format!("Unserializable document: {}", e)))?;
    if !value.is_object() {
        return Err(Error::InvalidArgument(format!(
            "Documents must serialize to JSON objects, got {}",
            value
        )));
    }
    Ok(value)
}

/// Runs `find` pages for a cursor
struct FindSource<T> {
    collection: Collection,
    _marker: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T> PageSource<T> for FindSource<T>
where
    T: DeserializeOwned + Send + 'static,
{
    async fn fetch_page(&self, options: &FindOptions, page_state: Option<&str>) -> Result<Page<T>> {
        let response = self
            .collection
            .run(Command::with_json("find", options.to_payload(page_state)))
            .await?;
        let results = response
            .documents()
            .iter()
            .map(|d| serde_json::from_value(d.clone()).map_err(Error::from))
            .collect::<Result<Vec<T>>>()?;
        Ok(Page::new(
            results,
            response.next_page_state().map(String::from),
        ))
    }
}
