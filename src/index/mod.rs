//! Core handle
//!
//! `SolrCore` wraps one core on one server: it reads the schema once at
//! connect time, answers queries, deletes, fetches stored documents back as
//! `Document`s and runs reconciled bulk loads. With a block-join condition
//! set, parents and their children are kept together as one unit.

mod cache;
mod reconcile;
mod replication;
mod select;

pub use cache::{BlockRole, ExistenceCache};
pub use reconcile::{check_version, Reconciled};
pub use replication::{IndexVersion, ReplicationStatus, ReplicationTicket};
pub use select::Row;

use std::io::BufRead;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::config::{ConnectionConfig, LoadOptions, SelectOptions};
use crate::document::{Document, DocumentFactory};
use crate::error::{DocumentWarning, Result, SolrError};
use crate::loader::BulkLoader;
use crate::markup::escape;
use crate::schema::{Schema, ROOT_FIELD};
use crate::transport::{params, HttpTransport, Params, ServerInfo, Transport, Upload};

/// Instance and data directories reported by the core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoreDirectories {
    pub instance_dir: String,
    pub data_dir: String,
}

/// Outcome of one `load_docs` batch.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Fragments handed to the upload workers.
    pub enqueued: usize,
    /// Documents skipped without failing the batch.
    pub warnings: Vec<DocumentWarning>,
    /// One response per upload worker.
    pub responses: Vec<Value>,
}

pub struct SolrCore {
    transport: Arc<dyn Transport>,
    core: String,
    context: String,
    schema: Arc<Schema>,
    factory: DocumentFactory,
    blockjoin_condition: Option<String>,
    server: ServerInfo,
    directories: CoreDirectories,
    cache: ExistenceCache,
    load_lock: Mutex<()>,
}

impl SolrCore {
    /// Connect over HTTP.
    pub async fn open(
        config: &ConnectionConfig,
        core: impl Into<String>,
        blockjoin_condition: Option<String>,
    ) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(config)?);
        Self::connect(transport, core, blockjoin_condition).await
    }

    /// Read server versions, schema and directories of `core`.
    ///
    /// A block-join condition needs the `_root_` field in the schema and must
    /// be a valid query on the core.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        core: impl Into<String>,
        blockjoin_condition: Option<String>,
    ) -> Result<Self> {
        let core = core.into();
        let server = ServerInfo::fetch(transport.as_ref()).await?;
        let context = format!("[{} on {}]", core, transport.endpoint());

        let luke = match transport
            .request(&format!("{}/admin/luke", core), params(&[("show", "schema")]), None)
            .await
        {
            Ok(luke) => luke,
            Err(e) if e.status() == Some(404) => {
                return Err(SolrError::response(format!("Core \"{}\" does not exist", core), 404));
            }
            Err(e) => return Err(e),
        };
        let schema = Arc::new(Schema::from_luke(&luke)?);
        let directories = read_directories(transport.as_ref(), &core).await?;

        let solr_core = Self {
            factory: DocumentFactory::new(Arc::clone(&schema)),
            transport,
            core,
            context,
            schema,
            blockjoin_condition,
            server,
            directories,
            cache: ExistenceCache::new(),
            load_lock: Mutex::new(()),
        };
        if let Some(condition) = &solr_core.blockjoin_condition {
            solr_core.check_blockjoin(condition).await?;
        }
        log::debug!(
            "{} Core opened (solr {}, lucene {})",
            solr_core.context,
            solr_core.server.solr_version,
            solr_core.server.lucene_version
        );
        Ok(solr_core)
    }

    async fn check_blockjoin(&self, condition: &str) -> Result<()> {
        if !self.schema.fields.contains_key(ROOT_FIELD) {
            return Err(SolrError::MissingRequiredField(format!(
                "Missing field {} required by blockjoin enabled cores",
                ROOT_FIELD
            )));
        }
        match self.select(params(&[("q", condition), ("rows", "0")])).await {
            Ok(_) => Ok(()),
            Err(SolrError::Response { message, status }) => Err(SolrError::response(
                format!("Invalid blockjoin condition '{}': {}", condition, message),
                status,
            )),
            Err(e) => Err(e),
        }
    }

    pub fn name(&self) -> &str {
        &self.core
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn id_field(&self) -> &str {
        &self.schema.id_field
    }

    pub fn factory(&self) -> &DocumentFactory {
        &self.factory
    }

    pub fn blockjoin_condition(&self) -> Option<&str> {
        self.blockjoin_condition.as_deref()
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server
    }

    pub fn directories(&self) -> &CoreDirectories {
        &self.directories
    }

    pub fn endpoint(&self) -> String {
        self.transport.endpoint()
    }

    /// Request a handler of this core. Resources starting with `/` are
    /// passed through unchanged.
    pub async fn request(&self, resource: &str, params: Params, upload: Option<Upload>) -> Result<Value> {
        let resource = if resource.starts_with('/') {
            resource.to_string()
        } else {
            format!("{}/{}", self.core, resource)
        };
        self.transport.request(&resource, params, upload).await
    }

    pub async fn ping(&self) -> Result<Value> {
        let ts = Utc::now().timestamp().to_string();
        self.request("admin/ping", params(&[("ts", &ts)]), None).await
    }

    pub async fn select(&self, params: Params) -> Result<Value> {
        self.request("select", params, None).await
    }

    pub async fn update(&self, params: Params, upload: Upload) -> Result<Value> {
        self.request("update", params, Some(upload)).await
    }

    /// Run `body` through the extracting handler and return the extracted
    /// html.
    pub async fn extract_html(&self, body: impl Into<String>, content_type: &str) -> Result<String> {
        let response = self
            .request(
                "update/extract",
                params(&[("extractOnly", "true"), ("extractFormat", "html")]),
                Some(Upload::text(body, content_type)),
            )
            .await?;
        response
            .get("")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SolrError::ResponseFormat(format!("missing extracted content - {}", response)))
    }

    pub async fn commit(&self) -> Result<Value> {
        let response = self.update(Vec::new(), Upload::xml("<commit/>")).await?;
        log::info!("{} Commit QTime: {}", self.context, qtime(&response));
        Ok(response)
    }

    pub async fn optimize(&self) -> Result<Value> {
        let response = self.update(Vec::new(), Upload::xml("<optimize/>")).await?;
        log::info!("{} Optimize QTime: {}", self.context, qtime(&response));
        Ok(response)
    }

    /// Delete every document matching any of `queries` in one request.
    pub async fn delete_by_queries<I, S>(&self, queries: I) -> Result<Value>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut body = String::from("<delete>");
        for query in queries {
            body.push_str("<query>");
            body.push_str(&escape(query.as_ref()));
            body.push_str("</query>");
        }
        body.push_str("</delete>");
        log::debug!("{} Deleting: {}", self.context, body);
        self.update(Vec::new(), Upload::xml(body)).await
    }

    pub async fn delete_by_query(&self, query: &str) -> Result<Value> {
        self.delete_by_queries([query]).await
    }

    pub async fn delete_by_ids<I, S>(&self, ids: I) -> Result<Value>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let id_field = self.id_field();
        let queries: Vec<String> = ids
            .into_iter()
            .map(|id| format!("{}:{}", id_field, quote(id.as_ref())))
            .collect();
        self.delete_by_queries(queries).await
    }

    /// Delete whole blocks: each parent together with its children. Without
    /// block-join this is `delete_by_ids`.
    pub async fn delete_by_parent_ids<I, S>(&self, ids: I) -> Result<Value>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.blockjoin_condition.is_none() {
            return self.delete_by_ids(ids).await;
        }
        let id_field = self.id_field();
        let queries: Vec<String> = ids
            .into_iter()
            .map(|id| {
                let id = quote(id.as_ref());
                format!("{}:{} OR {}:{}", ROOT_FIELD, id, id_field, id)
            })
            .collect();
        self.delete_by_queries(queries).await
    }

    /// Delete every document and commit.
    pub async fn drop_index(&self) -> Result<Value> {
        let response = self.delete_by_query("*:*").await?;
        log::info!("{} Delete QTime: {}", self.context, qtime(&response));
        self.clear_cache().await;
        self.commit().await
    }

    /// Forget cached block-join roles.
    pub async fn clear_cache(&self) {
        self.cache.clear().await;
    }

    /// Ids of parents that have children, or of the single parent `id`.
    /// Empty without block-join.
    pub async fn list_blockjoin_parent_ids(&self, id: Option<&str>) -> Result<Vec<String>> {
        let condition = match &self.blockjoin_condition {
            Some(condition) => condition,
            None => return Ok(Vec::new()),
        };
        let mut query = format!("({}) AND {}:[* TO *]", condition, ROOT_FIELD);
        if let Some(id) = id {
            query = format!("{} AND {}:{}", query, self.id_field(), quote(id));
        }
        self.list_ids(&query, id.is_some()).await
    }

    /// Ids of block-join children, or of the single child `id`.
    pub async fn list_blockjoin_child_ids(&self, id: Option<&str>) -> Result<Vec<String>> {
        let condition = match &self.blockjoin_condition {
            Some(condition) => condition,
            None => return Ok(Vec::new()),
        };
        let mut query = format!("-({}) AND {}:[* TO *]", condition, ROOT_FIELD);
        if let Some(id) = id {
            query = format!("{} AND {}:{}", query, self.id_field(), quote(id));
        }
        self.list_ids(&query, id.is_some()).await
    }

    async fn list_ids(&self, query: &str, single: bool) -> Result<Vec<String>> {
        let mut options = SelectOptions::default();
        if single {
            options = options.with_limit(1);
        }
        let rows = self.select_all(query, &[self.id_field()], &options).await?;
        Ok(rows.iter().filter_map(|row| row.first()).map(value_text).collect())
    }

    pub async fn is_blockjoin_parent(&self, id: &str, prefetch: bool) -> Result<bool> {
        self.has_role(BlockRole::Parent, id, prefetch).await
    }

    pub async fn is_blockjoin_child(&self, id: &str, prefetch: bool) -> Result<bool> {
        self.has_role(BlockRole::Child, id, prefetch).await
    }

    /// With `prefetch` the first lookup lists every id of the role once and
    /// later lookups hit the cache. Without it each lookup is one query.
    async fn has_role(&self, role: BlockRole, id: &str, prefetch: bool) -> Result<bool> {
        if self.blockjoin_condition.is_none() {
            return Ok(false);
        }
        if !prefetch {
            let ids = match role {
                BlockRole::Parent => self.list_blockjoin_parent_ids(Some(id)).await?,
                BlockRole::Child => self.list_blockjoin_child_ids(Some(id)).await?,
            };
            return Ok(!ids.is_empty());
        }
        if let Some(found) = self.cache.lookup(role, id).await {
            return Ok(found);
        }
        log::info!("{} Prefetching {:?} ids", self.context, role);
        let ids = match role {
            BlockRole::Parent => self.list_blockjoin_parent_ids(None).await?,
            BlockRole::Child => self.list_blockjoin_child_ids(None).await?,
        };
        Ok(self.cache.fill(role, ids, id).await)
    }

    /// Fetch a stored document. Reserved `_name_` fields are dropped unless
    /// listed in `include_reserved`. Children are attached when
    /// `get_child_docs` is set and the core uses block-join.
    pub async fn get_doc(&self, id: &str, include_reserved: &[&str], get_child_docs: bool) -> Result<Document> {
        let mut doc = self.fetch_doc(id, include_reserved).await?;
        if let (Some(condition), true) = (&self.blockjoin_condition, get_child_docs) {
            let query = format!(
                "{{!child of=\"{}\"}}{}:{}",
                condition.replace('"', "\\\""),
                self.id_field(),
                quote(id)
            );
            let rows = self
                .select_all(&query, &[self.id_field()], &SelectOptions::default())
                .await?;
            for row in &rows {
                if let Some(child_id) = row.first() {
                    let child = self.fetch_doc(&value_text(child_id), include_reserved).await?;
                    doc.add_child(child);
                }
            }
        }
        Ok(doc)
    }

    async fn fetch_doc(&self, id: &str, include_reserved: &[&str]) -> Result<Document> {
        let query = format!("{}:{}", self.id_field(), quote(id));
        let response = self.select(params(&[("q", &query), ("rows", "1")])).await?;
        let stored = response
            .pointer("/response/docs/0")
            .and_then(Value::as_object)
            .ok_or_else(|| SolrError::NotFound(format!("Document \"{}\" not found", id)))?;
        self.document_from_json(stored, include_reserved)
    }

    fn document_from_json(&self, stored: &Map<String, Value>, include_reserved: &[&str]) -> Result<Document> {
        let id_field = self.id_field();
        let id_type = self
            .schema
            .id_type()
            .ok_or_else(|| SolrError::document(format!("Id field {} is not in schema", id_field)))?;
        let id = stored
            .get(id_field)
            .ok_or_else(|| SolrError::ResponseFormat(format!("stored doc without {} - {:?}", id_field, stored)))?;
        let mut doc = Document::new(id_type.deserialize_json(id)?, Arc::clone(&self.schema))?;

        for (name, value) in stored {
            if name == id_field || (is_reserved(name) && !include_reserved.contains(&name.as_str())) {
                continue;
            }
            let field = self.schema.field(name).ok_or_else(|| {
                SolrError::ResponseFormat(format!("Field {} returned by select is not in schema", name))
            })?;
            match value {
                Value::Array(values) => {
                    let values = values
                        .iter()
                        .map(|v| field.field_type.deserialize_json(v))
                        .collect::<Result<Vec<_>>>()?;
                    doc.set_field_values(name, values)?;
                }
                other => doc.set_field(name, field.field_type.deserialize_json(other)?)?,
            }
        }
        Ok(doc)
    }

    /// Load documents holding only an id.
    pub async fn load_empty_docs<I, S>(&self, ids: I) -> Result<Value>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut body = String::from("<add>");
        for id in ids {
            body.push_str(&format!(
                "<doc><field name=\"{}\" null=\"false\">{}</field></doc>",
                escape(self.id_field()),
                escape(id.as_ref())
            ));
        }
        body.push_str("</add>");
        self.update(Vec::new(), Upload::xml(body)).await
    }

    /// Reconcile each document with the index and stream the results to
    /// `options.parallel` upload workers. One batch runs at a time per core.
    pub async fn load_docs<I>(&self, docs: I, options: &LoadOptions) -> Result<LoadReport>
    where
        I: IntoIterator<Item = Document>,
    {
        self.load_batch(docs.into_iter().map(Ok), options).await
    }

    /// Parse `<add>` markup and load it. Documents the factory skips are
    /// reported with the reconcile warnings.
    pub async fn load_xml<R: BufRead>(&self, input: R, options: &LoadOptions) -> Result<LoadReport> {
        let mut parsed = self.factory.from_xml(input);
        let mut report = self.load_batch(parsed.by_ref(), options).await?;
        let mut warnings = parsed.take_warnings();
        warnings.append(&mut report.warnings);
        report.warnings = warnings;
        Ok(report)
    }

    async fn load_batch<I>(&self, docs: I, options: &LoadOptions) -> Result<LoadReport>
    where
        I: Iterator<Item = Result<Document>>,
    {
        let _batch = self.load_lock.lock().await;
        let result = self.run_batch(docs, options).await;
        self.clear_cache().await;
        result
    }

    async fn run_batch<I>(&self, docs: I, options: &LoadOptions) -> Result<LoadReport>
    where
        I: Iterator<Item = Result<Document>>,
    {
        let loader = BulkLoader::start(
            Arc::clone(&self.transport),
            &format!("{}/update", self.core),
            options.parallel,
            options.keepalive(),
        );
        let mut report = LoadReport::default();

        for doc in docs {
            let reconciled = match doc {
                Ok(doc) => self.reconcile(doc, options.merge_child_docs).await,
                Err(e) => Err(e),
            };
            match reconciled {
                Ok(Reconciled::Load(fragment)) => {
                    loader.push(fragment);
                    report.enqueued += 1;
                }
                Ok(Reconciled::Skip(warning)) => {
                    log::warn!("{} Skipping {}", self.context, warning);
                    report.warnings.push(warning);
                }
                Err(e) => {
                    if let Err(upload) = loader.finish().await {
                        log::error!("{} Upload failed while aborting batch: {}", self.context, upload);
                    }
                    return Err(e);
                }
            }
        }

        report.responses = loader.finish().await?;
        log::info!("{} Loaded {} documents", self.context, report.enqueued);
        Ok(report)
    }
}

impl std::fmt::Debug for SolrCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolrCore")
            .field("core", &self.core)
            .field("endpoint", &self.transport.endpoint())
            .field("blockjoin_condition", &self.blockjoin_condition)
            .finish()
    }
}

async fn read_directories(transport: &dyn Transport, core: &str) -> Result<CoreDirectories> {
    let system = transport
        .request(&format!("{}/admin/system", core), Vec::new(), None)
        .await?;
    let dir = |key: &str| {
        system
            .pointer(&format!("/core/directory/{}", key))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SolrError::ResponseFormat(format!("missing core directory {} - {}", key, system)))
    };
    Ok(CoreDirectories {
        instance_dir: dir("instance")?,
        data_dir: dir("data")?,
    })
}

/// `_version_`, `_root_` and the like.
fn is_reserved(name: &str) -> bool {
    name.len() > 1 && name.starts_with('_') && name.ends_with('_')
}

/// Quote a term for the standard query parser.
pub fn quote(term: &str) -> String {
    let mut quoted = String::with_capacity(term.len() + 2);
    quoted.push('"');
    for c in term.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Plain text of a JSON scalar, as used for ids and facet values.
pub(crate) fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn qtime(response: &Value) -> i64 {
    response
        .pointer("/responseHeader/QTime")
        .and_then(Value::as_i64)
        .unwrap_or(-1)
}
