//! In-process search server
//!
//! `SimulatedSolr` answers the handlers solrcl uses (system info, luke,
//! select, update, replication, core admin) for a single core held in
//! memory. Used by integration tests and examples that must run without a
//! live server. Query support covers what the client itself generates:
//! `*:*`, term and phrase clauses, `[* TO *]`, `AND`/`OR`/`-`, parentheses
//! and the `{!child of=".."}` block-join parser.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SubsecRound, Utc};
use futures_util::StreamExt;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

use super::{check_non_json, check_response, resource_path, with_json_writer, Params, RequestBody, Transport, Upload};
use crate::error::{Result, SolrError};
use crate::markup::{parse_tree, Element};
use crate::schema::{
    datetime_to_replication, solr_to_datetime, FieldKind, Schema, SolrField, ROOT_FIELD, VERSION_FIELD,
};

const SOLR_SPEC_VERSION: &str = "4.10.4";
const FIRST_VERSION: i64 = 1_500_000_000_000;

type StoredDoc = Map<String, Value>;
/// Handler failure: status code and message.
type SimResult<T> = std::result::Result<T, (u16, String)>;

/// What a `fetchindex` command does.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicationMode {
    Succeed,
    /// Replication runs but is reported as failed.
    Fail,
    /// The command is accepted and nothing happens.
    Ignore,
}

struct ReplicationState {
    mode: ReplicationMode,
    last_current_date: Option<DateTime<Utc>>,
    replicated_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    fetches: u32,
}

struct SimState {
    docs: Vec<StoredDoc>,
    next_version: i64,
    generation: i64,
    index_version: i64,
    cores: BTreeSet<String>,
    uploads: Vec<String>,
    requests: Vec<String>,
    network_failures: u32,
    upload_failure: Option<u16>,
    replication: ReplicationState,
}

pub struct SimulatedSolr {
    core: String,
    luke_schema: Value,
    schema: Schema,
    state: Mutex<SimState>,
}

impl SimulatedSolr {
    /// Serve `core` with the schema described by a luke `show=schema` response.
    pub fn new(core: impl Into<String>, luke_schema: Value) -> Result<Self> {
        let core = core.into();
        let schema = Schema::from_luke(&luke_schema)?;
        let mut cores = BTreeSet::new();
        cores.insert(core.clone());
        Ok(Self {
            core,
            luke_schema,
            schema,
            state: Mutex::new(SimState {
                docs: Vec::new(),
                next_version: FIRST_VERSION,
                generation: 1,
                index_version: 1,
                cores,
                uploads: Vec::new(),
                requests: Vec::new(),
                network_failures: 0,
                upload_failure: None,
                replication: ReplicationState {
                    mode: ReplicationMode::Succeed,
                    last_current_date: None,
                    replicated_at: None,
                    failed_at: None,
                    fetches: 0,
                },
            }),
        })
    }

    /// Serve `core` with `sample_schema()`.
    pub fn sample(core: impl Into<String>) -> Result<Self> {
        Self::new(core, sample_schema())
    }

    pub fn core(&self) -> &str {
        &self.core
    }

    /// Raw bodies of every update request, in arrival order.
    pub async fn uploads(&self) -> Vec<String> {
        self.state.lock().await.uploads.clone()
    }

    /// Ids of the top-level documents of each `<add>` upload, in the order
    /// they appear in the body.
    pub async fn uploaded_ids(&self) -> Vec<Vec<String>> {
        let uploads = self.uploads().await;
        uploads
            .iter()
            .filter_map(|body| parse_tree(body).ok())
            .filter(|root| root.name == "add")
            .map(|root| {
                root.children
                    .iter()
                    .filter(|c| c.name == "doc")
                    .filter_map(|doc| {
                        doc.children
                            .iter()
                            .find(|f| f.attr("name") == Some(self.schema.id_field.as_str()))
                            .map(|f| f.text.clone())
                    })
                    .collect()
            })
            .collect()
    }

    /// Absolute paths of every request received.
    pub async fn requests(&self) -> Vec<String> {
        self.state.lock().await.requests.clone()
    }

    pub async fn doc_count(&self) -> usize {
        self.state.lock().await.docs.len()
    }

    /// Stored form of a document, as select would return it.
    pub async fn stored(&self, id: &str) -> Option<Value> {
        let state = self.state.lock().await;
        state
            .docs
            .iter()
            .find(|d| self.id_of(d).as_deref() == Some(id))
            .map(|d| Value::Object(d.clone()))
    }

    /// Fail the next `n` requests with a network error.
    pub async fn fail_next_requests(&self, n: u32) {
        self.state.lock().await.network_failures = n;
    }

    /// Reject update requests that carry a body with `status`.
    pub async fn fail_uploads(&self, status: Option<u16>) {
        self.state.lock().await.upload_failure = status;
    }

    pub async fn set_replication_mode(&self, mode: ReplicationMode) {
        self.state.lock().await.replication.mode = mode;
    }

    /// `fetchindex` commands received so far.
    pub async fn fetch_count(&self) -> u32 {
        self.state.lock().await.replication.fetches
    }

    fn id_of(&self, doc: &StoredDoc) -> Option<String> {
        doc.get(&self.schema.id_field).map(value_text)
    }

    fn route(&self, state: &mut SimState, path: &str, params: &Params, body: Option<String>) -> Result<Value> {
        let not_found = || check_non_json(404, Some("text/html;charset=ISO-8859-1"));
        let route = path.strip_prefix("/solr/").ok_or_else(not_found)?;

        let handled = match route {
            "admin/info/system" => Ok(ok(json!({
                "lucene": {
                    "solr-spec-version": SOLR_SPEC_VERSION,
                    "lucene-spec-version": SOLR_SPEC_VERSION,
                }
            }))),
            "admin/cores" => cores_admin(state, params),
            _ => {
                let (core, handler) = route.split_once('/').ok_or_else(not_found)?;
                if core != self.core || !state.cores.contains(core) {
                    return Err(not_found());
                }
                match handler {
                    "admin/luke" => self.luke(state, params),
                    "admin/system" => Ok(ok(json!({
                        "core": {
                            "schema": "schema.xml",
                            "directory": {
                                "instance": format!("/var/solr/{}/", core),
                                "data": format!("/var/solr/{}/data/", core),
                            }
                        }
                    }))),
                    "admin/ping" => Ok(ok(json!({"status": "OK"}))),
                    "select" => self.select(state, params),
                    "update" => self.update(state, body),
                    "update/extract" => extract(params, body),
                    "replication" => replication(state, params),
                    _ => return Err(not_found()),
                }
            }
        };

        match handled {
            Ok(value) => check_response(value, 200),
            Err((status, message)) => check_response(error_response(status, &message), status),
        }
    }

    fn luke(&self, state: &SimState, params: &Params) -> SimResult<Value> {
        match param(params, "show") {
            Some("schema") => Ok(self.luke_schema.clone()),
            Some("index") => Ok(ok(json!({
                "index": {
                    "numDocs": state.docs.len(),
                    "version": state.index_version,
                    "segmentCount": 1,
                }
            }))),
            other => Err((400, format!("Unsupported show parameter {:?}", other))),
        }
    }

    fn select(&self, state: &SimState, params: &Params) -> SimResult<Value> {
        let q = param(params, "q").ok_or((400, "missing query".to_string()))?;
        let query = QueryParser::parse(q, &self.schema)?;
        let rows = usize_param(params, "rows", 10)?;
        let start = usize_param(params, "start", 0)?;

        let eval = Evaluator {
            index: &state.docs,
            id_field: &self.schema.id_field,
        };
        let mut hits: Vec<&StoredDoc> = state.docs.iter().filter(|d| eval.matches(&query, d)).collect();
        if let Some(sort) = param(params, "sort").filter(|s| !s.trim().is_empty()) {
            sort_docs(&mut hits, sort)?;
        }

        let fields: Option<Vec<&str>> = param(params, "fl")
            .map(|fl| fl.split(',').map(str::trim).filter(|f| !f.is_empty()).collect::<Vec<_>>())
            .filter(|fl| !fl.is_empty() && !fl.contains(&"*"));
        let docs: Vec<Value> = hits
            .iter()
            .skip(start)
            .take(rows)
            .map(|d| project(d, fields.as_deref()))
            .collect();

        let mut body = json!({
            "response": {"numFound": hits.len(), "start": start, "docs": docs}
        });
        if param(params, "facet") == Some("true") {
            body["facet_counts"] = json!({"facet_fields": self.facets(&hits, params)?});
        }
        Ok(ok(body))
    }

    fn facets(&self, hits: &[&StoredDoc], params: &Params) -> SimResult<Value> {
        let limit: i64 = param(params, "facet.limit")
            .map(|l| l.parse().map_err(|_| (400, format!("Invalid facet.limit {}", l))))
            .transpose()?
            .unwrap_or(100);
        let mincount = usize_param(params, "facet.mincount", 1)?.max(1);

        let mut out = Map::new();
        for field in params_all(params, "facet.field") {
            if !self.schema.has_field(field) {
                return Err((400, format!("undefined field {}", field)));
            }
            let mut counts: HashMap<String, usize> = HashMap::new();
            for doc in hits {
                for value in values_of(doc, field) {
                    *counts.entry(value_text(value)).or_default() += 1;
                }
            }
            let mut counts: Vec<(String, usize)> =
                counts.into_iter().filter(|(_, c)| *c >= mincount).collect();
            counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            if limit >= 0 {
                counts.truncate(limit as usize);
            }
            let flat: Vec<Value> = counts
                .into_iter()
                .flat_map(|(v, c)| [json!(v), json!(c)])
                .collect();
            out.insert(field.to_string(), Value::Array(flat));
        }
        Ok(Value::Object(out))
    }

    fn update(&self, state: &mut SimState, body: Option<String>) -> SimResult<Value> {
        let body = body.ok_or((400, "missing content stream".to_string()))?;
        state.uploads.push(body.clone());
        let root = parse_tree(&body).map_err(|e| (400, e.to_string()))?;

        match root.name.as_str() {
            "add" => self.apply_add(state, &root)?,
            "delete" => self.apply_delete(state, &root)?,
            "commit" | "optimize" => state.generation += 1,
            other => return Err((400, format!("Unexpected tag <{}>", other))),
        }
        Ok(ok(json!({})))
    }

    fn apply_add(&self, state: &mut SimState, root: &Element) -> SimResult<()> {
        let mut staged = state.docs.clone();
        let mut next_version = state.next_version;
        for element in root.children.iter().filter(|c| c.name == "doc") {
            let incoming = self.read_doc(element)?;
            self.add_block(&mut staged, &mut next_version, incoming)?;
        }
        state.docs = staged;
        state.next_version = next_version;
        state.index_version += 1;
        Ok(())
    }

    fn read_doc(&self, element: &Element) -> SimResult<IncomingDoc> {
        let mut doc = IncomingDoc::default();
        for child in &element.children {
            match child.name.as_str() {
                "field" => {
                    let name = child.attr("name").ok_or((400, "field without name".to_string()))?;
                    let field = self
                        .schema
                        .field(name)
                        .ok_or_else(|| (400, format!("ERROR: unknown field '{}'", name)))?;
                    if child.attr("update").is_some() {
                        doc.atomic = true;
                    }
                    if child.attr("null") == Some("true") {
                        doc.nulls.push(name.to_string());
                        continue;
                    }
                    let value = typed_value(field, &child.text)?;
                    if field.multi_valued {
                        let slot = doc
                            .fields
                            .entry(name.to_string())
                            .or_insert_with(|| Value::Array(Vec::new()));
                        if let Value::Array(values) = slot {
                            values.push(value);
                        }
                    } else if doc.fields.contains_key(name) {
                        return Err((
                            400,
                            format!("multiple values encountered for non multiValued field {}", name),
                        ));
                    } else {
                        doc.fields.insert(name.to_string(), value);
                    }
                }
                "doc" => doc.children.push(self.read_doc(child)?),
                _ => {}
            }
        }
        Ok(doc)
    }

    fn add_block(&self, docs: &mut Vec<StoredDoc>, next_version: &mut i64, mut incoming: IncomingDoc) -> SimResult<()> {
        let id = self
            .id_of(&incoming.fields)
            .ok_or((400, "Document is missing mandatory uniqueKey field".to_string()))?;
        let existing = docs.iter().position(|d| self.id_of(d).as_deref() == Some(id.as_str()));
        let requested = incoming.fields.remove(VERSION_FIELD).and_then(|v| v.as_i64());
        if let Some(requested) = requested {
            let current = existing.and_then(|i| docs[i].get(VERSION_FIELD)).and_then(Value::as_i64);
            let conflict = match requested {
                v if v > 1 => current != Some(v),
                1 => current.is_none(),
                v if v < 0 => current.is_some(),
                _ => false,
            };
            if conflict {
                return Err((
                    409,
                    format!(
                        "version conflict for {} expected={} actual={}",
                        id,
                        requested,
                        current.unwrap_or(-1)
                    ),
                ));
            }
        }

        if incoming.atomic {
            let mut target = existing.map(|i| docs[i].clone()).unwrap_or_default();
            for (name, value) in incoming.fields {
                target.insert(name, value);
            }
            for name in &incoming.nulls {
                target.remove(name);
            }
            target.insert(VERSION_FIELD.to_string(), bump(next_version));
            match existing {
                Some(i) => docs[i] = target,
                None => docs.push(target),
            }
            return Ok(());
        }

        let block = !incoming.children.is_empty();
        let mut flat = Vec::new();
        for child in incoming.children {
            self.flatten(child, &id, next_version, &mut flat)?;
        }
        let mut parent = incoming.fields;
        if block {
            parent.insert(ROOT_FIELD.to_string(), json!(id));
        }
        parent.insert(VERSION_FIELD.to_string(), bump(next_version));
        flat.push(parent);

        for doc in &flat {
            let doc_id = self.id_of(doc);
            docs.retain(|d| self.id_of(d) != doc_id);
        }
        docs.extend(flat);
        Ok(())
    }

    fn flatten(&self, doc: IncomingDoc, root: &str, next_version: &mut i64, out: &mut Vec<StoredDoc>) -> SimResult<()> {
        let mut fields = doc.fields;
        if self.id_of(&fields).is_none() {
            return Err((400, "Child document is missing mandatory uniqueKey field".to_string()));
        }
        for child in doc.children {
            self.flatten(child, root, next_version, out)?;
        }
        fields.insert(ROOT_FIELD.to_string(), json!(root));
        fields.insert(VERSION_FIELD.to_string(), bump(next_version));
        out.push(fields);
        Ok(())
    }

    fn apply_delete(&self, state: &mut SimState, root: &Element) -> SimResult<()> {
        for element in &root.children {
            match element.name.as_str() {
                "query" => {
                    let query = QueryParser::parse(&element.text, &self.schema)?;
                    let eval = Evaluator {
                        index: &state.docs,
                        id_field: &self.schema.id_field,
                    };
                    let keep: Vec<bool> = state.docs.iter().map(|d| !eval.matches(&query, d)).collect();
                    let mut flags = keep.into_iter();
                    state.docs.retain(|_| flags.next().unwrap_or(true));
                }
                "id" => {
                    let id = element.text.trim();
                    state.docs.retain(|d| self.id_of(d).as_deref() != Some(id));
                }
                other => return Err((400, format!("Unexpected tag <{}> in delete", other))),
            }
        }
        state.index_version += 1;
        Ok(())
    }
}

#[async_trait]
impl Transport for SimulatedSolr {
    async fn request(&self, resource: &str, params: Params, upload: Option<Upload>) -> Result<Value> {
        let path = resource_path(resource);
        let params = with_json_writer(params);
        {
            let mut state = self.state.lock().await;
            state.requests.push(path.clone());
            if state.network_failures > 0 {
                state.network_failures -= 1;
                return Err(SolrError::Network(format!("Connection refused: {}", path)));
            }
            if let (Some(status), Some(_)) = (state.upload_failure, upload.as_ref()) {
                if path.ends_with("/update") {
                    return Err(SolrError::response("Simulated upload failure", status));
                }
            }
        }

        let body = match upload {
            Some(upload) => Some(collect_body(upload.body).await?),
            None => None,
        };
        let mut state = self.state.lock().await;
        self.route(&mut state, &path, &params, body)
    }

    fn endpoint(&self) -> String {
        format!("simulated/{}", self.core)
    }
}

/// Luke `show=schema` response of the sample test core.
///
/// Block-join parents are marked with `_is_parent:true`.
pub fn sample_schema() -> Value {
    let single = "I-S-------------";
    let multi = "I-S-M-----------";
    json!({
        "responseHeader": {"status": 0, "QTime": 1},
        "schema": {
            "uniqueKeyField": "id",
            "types": {
                "string": {"className": "org.apache.solr.schema.StrField"},
                "long": {"className": "org.apache.solr.schema.TrieLongField"},
                "int": {"className": "org.apache.solr.schema.TrieIntField"},
                "date": {"className": "org.apache.solr.schema.TrieDateField"},
                "bool": {"className": "org.apache.solr.schema.BoolField"},
                "float": {"className": "org.apache.solr.schema.TrieFloatField"},
                "text": {"className": "org.apache.solr.schema.TextField"}
            },
            "fields": {
                "_version_": {"type": "long", "flags": single, "copySources": []},
                "_root_": {"type": "string", "flags": single, "copySources": []},
                "_is_parent": {"type": "bool", "flags": single, "copySources": []},
                "id": {"type": "string", "flags": single, "copySources": []},
                "testdate": {"type": "date", "flags": single, "copySources": []},
                "testint": {"type": "int", "flags": single, "copySources": []},
                "testfloat": {"type": "float", "flags": single, "copySources": []},
                "testmulti": {"type": "string", "flags": multi, "copySources": []},
                "testtext": {"type": "text", "flags": multi, "copySources": ["testmulti"]}
            },
            "dynamicFields": {
                "*_s": {"type": "string", "flags": single},
                "*_ms": {"type": "string", "flags": multi}
            }
        }
    })
}

#[derive(Default)]
struct IncomingDoc {
    fields: StoredDoc,
    nulls: Vec<String>,
    atomic: bool,
    children: Vec<IncomingDoc>,
}

async fn collect_body(body: RequestBody) -> Result<String> {
    let bytes = match body {
        RequestBody::Text(text) => return Ok(text),
        RequestBody::Stream(mut stream) => {
            let mut buf = Vec::new();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| SolrError::Network(e.to_string()))?;
                buf.extend_from_slice(&chunk);
            }
            buf
        }
    };
    String::from_utf8(bytes).map_err(|e| SolrError::response(format!("Invalid body: {}", e), 400))
}

fn ok(mut body: Value) -> Value {
    if let Value::Object(map) = &mut body {
        map.insert("responseHeader".to_string(), json!({"status": 0, "QTime": 0}));
    }
    body
}

fn error_response(status: u16, message: &str) -> Value {
    json!({
        "responseHeader": {"status": status, "QTime": 0},
        "error": {"msg": message, "code": status}
    })
}

fn bump(next_version: &mut i64) -> Value {
    *next_version += 1;
    json!(*next_version)
}

fn param<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

fn params_all<'a>(params: &'a Params, key: &'a str) -> impl Iterator<Item = &'a str> {
    params.iter().filter(move |(k, _)| k == key).map(|(_, v)| v.as_str())
}

fn usize_param(params: &Params, key: &str, default: usize) -> SimResult<usize> {
    match param(params, key) {
        Some(v) => v.trim().parse().map_err(|_| (400, format!("Invalid {} {}", key, v))),
        None => Ok(default),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn values_of<'a>(doc: &'a StoredDoc, field: &str) -> Vec<&'a Value> {
    match doc.get(field) {
        Some(Value::Array(values)) => values.iter().collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(value) => vec![value],
    }
}

fn typed_value(field: &SolrField, text: &str) -> SimResult<Value> {
    let bad = || (400, format!("ERROR: Error adding field '{}'='{}'", field.name, text));
    Ok(match field.field_type.kind {
        FieldKind::Bool => Value::Bool(text.trim() == "true"),
        FieldKind::Int | FieldKind::Long => json!(text.trim().parse::<i64>().map_err(|_| bad())?),
        FieldKind::Float => json!(text.trim().parse::<f64>().map_err(|_| bad())?),
        FieldKind::Date => {
            solr_to_datetime(text.trim()).map_err(|_| bad())?;
            Value::String(text.trim().to_string())
        }
        _ => Value::String(text.to_string()),
    })
}

fn project(doc: &StoredDoc, fields: Option<&[&str]>) -> Value {
    match fields {
        None => Value::Object(doc.clone()),
        Some(fields) => Value::Object(
            fields
                .iter()
                .filter_map(|f| doc.get(*f).map(|v| (f.to_string(), v.clone())))
                .collect(),
        ),
    }
}

fn sort_docs(hits: &mut [&StoredDoc], sort: &str) -> SimResult<()> {
    let mut keys = Vec::new();
    for clause in sort.split(',') {
        let mut parts = clause.split_whitespace();
        let field = parts.next().ok_or((400, format!("Invalid sort {}", sort)))?;
        let descending = match parts.next().map(str::to_ascii_lowercase).as_deref() {
            Some("asc") | None => false,
            Some("desc") => true,
            _ => return Err((400, format!("Invalid sort {}", sort))),
        };
        keys.push((field.to_string(), descending));
    }
    hits.sort_by(|a, b| {
        keys.iter()
            .map(|(field, descending)| {
                let order = compare_values(a.get(field), b.get(field));
                if *descending {
                    order.reverse()
                } else {
                    order
                }
            })
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });
    Ok(())
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            x.as_f64().partial_cmp(&y.as_f64()).unwrap_or(Ordering::Equal)
        }
        (Some(x), Some(y)) => value_text(x).cmp(&value_text(y)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn extract(params: &Params, body: Option<String>) -> SimResult<Value> {
    let body = body.ok_or((400, "missing content stream".to_string()))?;
    if param(params, "extractOnly") != Some("true") {
        return Err((400, "Only extractOnly requests are supported".to_string()));
    }
    Ok(ok(json!({"": body, "null_metadata": []})))
}

fn cores_admin(state: &mut SimState, params: &Params) -> SimResult<Value> {
    let require = |key: &str| -> SimResult<String> {
        param(params, key)
            .map(str::to_string)
            .ok_or_else(|| (400, format!("Missing parameter {}", key)))
    };
    match param(params, "action").unwrap_or("STATUS") {
        "STATUS" => {
            let status: Map<String, Value> = state
                .cores
                .iter()
                .map(|c| (c.clone(), json!({"name": c})))
                .collect();
            Ok(ok(json!({"status": status})))
        }
        "CREATE" => {
            let name = require("name")?;
            if !state.cores.insert(name.clone()) {
                return Err((400, format!("Core with name '{}' already exists.", name)));
            }
            Ok(ok(json!({"core": name})))
        }
        "RELOAD" => {
            let core = require("core")?;
            known_core(state, &core)?;
            Ok(ok(json!({})))
        }
        "UNLOAD" => {
            let core = require("core")?;
            known_core(state, &core)?;
            state.cores.remove(&core);
            Ok(ok(json!({})))
        }
        "SWAP" => {
            known_core(state, &require("core")?)?;
            known_core(state, &require("other")?)?;
            Ok(ok(json!({})))
        }
        other => Err((400, format!("Unsupported operation: {}", other))),
    }
}

fn known_core(state: &SimState, core: &str) -> SimResult<()> {
    if state.cores.contains(core) {
        Ok(())
    } else {
        Err((400, format!("No such core: {}", core)))
    }
}

fn replication(state: &mut SimState, params: &Params) -> SimResult<Value> {
    let now = Utc::now().trunc_subsecs(0);
    let repl = &mut state.replication;
    match param(params, "command") {
        Some("details") => {
            repl.last_current_date = Some(now);
            let mut slave = Map::new();
            slave.insert("currentDate".into(), json!(datetime_to_replication(&now)));
            slave.insert("isReplicating".into(), json!("false"));
            if let Some(at) = repl.replicated_at {
                slave.insert("indexReplicatedAt".into(), json!(datetime_to_replication(&at)));
            }
            if let Some(at) = repl.failed_at {
                slave.insert("replicationFailedAt".into(), json!(datetime_to_replication(&at)));
            }
            Ok(ok(json!({
                "details": {
                    "indexVersion": state.index_version,
                    "generation": state.generation,
                    "slave": slave,
                }
            })))
        }
        Some("fetchindex") => {
            repl.fetches += 1;
            if repl.mode != ReplicationMode::Ignore {
                let at = match repl.last_current_date {
                    Some(last) => now.max(last + ChronoDuration::seconds(1)),
                    None => now,
                };
                repl.replicated_at = Some(at);
                if repl.mode == ReplicationMode::Fail {
                    repl.failed_at = Some(at);
                } else {
                    state.generation += 1;
                }
            }
            Ok(ok(json!({"status": "OK"})))
        }
        other => Err((400, format!("Unknown replication command {:?}", other))),
    }
}

#[derive(Debug)]
enum Query {
    All,
    Term { field: String, value: String },
    Exists(String),
    Not(Box<Query>),
    And(Vec<Query>),
    Or(Vec<Query>),
    /// Children of the parents matching `inner`; `parents` selects every parent.
    ChildOf { parents: Box<Query>, inner: Box<Query> },
}

struct Evaluator<'a> {
    index: &'a [StoredDoc],
    id_field: &'a str,
}

impl Evaluator<'_> {
    fn matches(&self, query: &Query, doc: &StoredDoc) -> bool {
        match query {
            Query::All => true,
            Query::Term { field, value } => values_of(doc, field).iter().any(|v| value_text(v) == *value),
            Query::Exists(field) => !values_of(doc, field).is_empty(),
            Query::Not(inner) => !self.matches(inner, doc),
            Query::And(items) => items.iter().all(|q| self.matches(q, doc)),
            Query::Or(items) => items.iter().any(|q| self.matches(q, doc)),
            Query::ChildOf { parents, inner } => {
                if self.matches(parents, doc) {
                    return false;
                }
                let root = match doc.get(ROOT_FIELD) {
                    Some(root) => value_text(root),
                    None => return false,
                };
                self.index.iter().any(|p| {
                    p.get(self.id_field).map(value_text).as_deref() == Some(root.as_str())
                        && self.matches(parents, p)
                        && self.matches(inner, p)
                })
            }
        }
    }
}

struct QueryParser<'a> {
    src: &'a str,
    pos: usize,
    schema: &'a Schema,
}

impl<'a> QueryParser<'a> {
    fn parse(src: &'a str, schema: &'a Schema) -> SimResult<Query> {
        let mut parser = Self { src, pos: 0, schema };
        let query = parser.or_expr()?;
        parser.skip_ws();
        if parser.pos < parser.src.len() {
            return Err(parser.syntax_error());
        }
        Ok(query)
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn syntax_error(&self) -> (u16, String) {
        (
            400,
            format!(
                "org.apache.solr.search.SyntaxError: Cannot parse '{}' at offset {}",
                self.src, self.pos
            ),
        )
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let rest = self.rest();
        let delimited = rest.starts_with(keyword)
            && rest[keyword.len()..].starts_with(|c: char| c.is_whitespace() || c == '(' || c == '-');
        if delimited {
            self.pos += keyword.len();
        }
        delimited
    }

    fn or_expr(&mut self) -> SimResult<Query> {
        let mut items = vec![self.and_expr()?];
        loop {
            self.skip_ws();
            if self.eat_keyword("OR") || (!self.rest().is_empty() && !self.rest().starts_with(')')) {
                items.push(self.and_expr()?);
            } else {
                break;
            }
        }
        Ok(if items.len() == 1 { items.remove(0) } else { Query::Or(items) })
    }

    fn and_expr(&mut self) -> SimResult<Query> {
        let mut items = vec![self.unary()?];
        loop {
            self.skip_ws();
            if self.eat_keyword("AND") {
                items.push(self.unary()?);
            } else {
                break;
            }
        }
        Ok(if items.len() == 1 { items.remove(0) } else { Query::And(items) })
    }

    fn unary(&mut self) -> SimResult<Query> {
        self.skip_ws();
        if self.eat("-") || self.eat_keyword("NOT") {
            return Ok(Query::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> SimResult<Query> {
        self.skip_ws();
        if self.eat("(") {
            let query = self.or_expr()?;
            self.skip_ws();
            if !self.eat(")") {
                return Err(self.syntax_error());
            }
            return Ok(query);
        }
        if self.eat("{!child of=\"") {
            let end = self.rest().find("\"}").ok_or_else(|| self.syntax_error())?;
            let condition = &self.rest()[..end];
            self.pos += end + 2;
            let parents = QueryParser::parse(condition, self.schema)?;
            let inner = self.or_expr()?;
            return Ok(Query::ChildOf {
                parents: Box::new(parents),
                inner: Box::new(inner),
            });
        }
        if self.eat("*:*") {
            return Ok(Query::All);
        }

        let colon = self.rest().find(':').ok_or_else(|| self.syntax_error())?;
        let field = &self.rest()[..colon];
        if field.is_empty() || !field.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.') {
            return Err(self.syntax_error());
        }
        if !self.schema.has_field(field) {
            return Err((400, format!("undefined field {}", field)));
        }
        self.pos += colon + 1;

        if self.eat("[* TO *]") {
            return Ok(Query::Exists(field.to_string()));
        }
        let value = if self.eat("\"") {
            self.quoted()?
        } else {
            self.bare()?
        };
        Ok(Query::Term {
            field: field.to_string(),
            value,
        })
    }

    fn quoted(&mut self) -> SimResult<String> {
        let mut value = String::new();
        let mut escaped = false;
        for (i, c) in self.rest().char_indices() {
            if escaped {
                value.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                self.pos += i + 1;
                return Ok(value);
            } else {
                value.push(c);
            }
        }
        Err(self.syntax_error())
    }

    fn bare(&mut self) -> SimResult<String> {
        let mut value = String::new();
        let mut escaped = false;
        let mut consumed = self.rest().len();
        for (i, c) in self.rest().char_indices() {
            if escaped {
                value.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c.is_whitespace() || c == ')' {
                consumed = i;
                break;
            } else {
                value.push(c);
            }
        }
        if value.is_empty() {
            return Err(self.syntax_error());
        }
        self.pos += consumed;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::params;

    async fn loaded() -> SimulatedSolr {
        let solr = SimulatedSolr::sample("test").unwrap();
        let body = r#"<add>
            <doc><field name="id">A</field><field name="testint">1</field><field name="_is_parent">true</field>
              <doc><field name="id">A.1</field><field name="testmulti">x</field></doc>
            </doc>
            <doc><field name="id">B</field><field name="testint">2</field><field name="testmulti">b 1</field></doc>
        </add>"#;
        solr.request("test/update", Vec::new(), Some(Upload::xml(body)))
            .await
            .unwrap();
        solr
    }

    async fn ids(solr: &SimulatedSolr, q: &str) -> Vec<String> {
        let response = solr
            .request("test/select", params(&[("q", q), ("fl", "id"), ("rows", "100")]), None)
            .await
            .unwrap();
        response["response"]["docs"]
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["id"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_block_add_sets_root() {
        let solr = loaded().await;
        assert_eq!(solr.doc_count().await, 3);
        let parent = solr.stored("A").await.unwrap();
        assert_eq!(parent["_root_"], json!("A"));
        assert_eq!(solr.stored("A.1").await.unwrap()["_root_"], json!("A"));
        assert!(solr.stored("B").await.unwrap().get("_root_").is_none());
        assert!(parent["_version_"].as_i64().unwrap() > 1);
    }

    #[tokio::test]
    async fn test_queries() {
        let solr = loaded().await;
        assert_eq!(ids(&solr, "*:*").await.len(), 3);
        assert_eq!(ids(&solr, "testint:1").await, vec!["A"]);
        assert_eq!(ids(&solr, "testmulti:\"b 1\"").await, vec!["B"]);
        assert_eq!(ids(&solr, "(_is_parent:true) AND _root_:[* TO *]").await, vec!["A"]);
        assert_eq!(ids(&solr, "-(_is_parent:true) AND _root_:[* TO *]").await, vec!["A.1"]);
        assert_eq!(ids(&solr, "{!child of=\"_is_parent:true\"}id:\"A\"").await, vec!["A.1"]);
        assert_eq!(ids(&solr, "id:A OR id:B").await.len(), 2);
        assert_eq!(ids(&solr, "-testint:[* TO *]").await, vec!["A.1"]);
    }

    #[tokio::test]
    async fn test_query_errors() {
        let solr = loaded().await;
        let undefined = solr
            .request("test/select", params(&[("q", "nosuchfield:x")]), None)
            .await;
        assert_eq!(undefined.unwrap_err().status(), Some(400));
        let broken = solr.request("test/select", params(&[("q", "(id:A")]), None).await;
        assert!(matches!(broken, Err(SolrError::Response { status: 400, .. })));
    }

    #[tokio::test]
    async fn test_atomic_update_and_delete() {
        let solr = loaded().await;
        let body = r#"<add><doc><field name="id" null="false">B</field><field name="testint" null="false" update="set">7</field><field name="testmulti" null="true" update="set"></field></doc></add>"#;
        solr.request("test/update", Vec::new(), Some(Upload::xml(body)))
            .await
            .unwrap();
        let b = solr.stored("B").await.unwrap();
        assert_eq!(b["testint"], json!(7));
        assert!(b.get("testmulti").is_none());

        let delete = "<delete><query>_root_:\"A\" OR id:\"A\"</query></delete>";
        solr.request("test/update", Vec::new(), Some(Upload::xml(delete)))
            .await
            .unwrap();
        assert_eq!(solr.doc_count().await, 1);
    }

    #[tokio::test]
    async fn test_version_conflict() {
        let solr = loaded().await;
        let body = r#"<add><doc><field name="id">B</field><field name="_version_">5</field></doc></add>"#;
        let result = solr.request("test/update", Vec::new(), Some(Upload::xml(body))).await;
        assert_eq!(result.unwrap_err().status(), Some(409));
        assert_eq!(solr.stored("B").await.unwrap()["testint"], json!(2));
    }

    #[tokio::test]
    async fn test_facets() {
        let solr = loaded().await;
        let response = solr
            .request(
                "test/select",
                params(&[("q", "*:*"), ("rows", "0"), ("facet", "true"), ("facet.field", "testint"), ("facet.limit", "-1")]),
                None,
            )
            .await
            .unwrap();
        assert_eq!(response["facet_counts"]["facet_fields"]["testint"], json!(["1", 1, "2", 1]));
    }

    #[tokio::test]
    async fn test_unknown_core_is_404() {
        let solr = loaded().await;
        let result = solr.request("nope/select", params(&[("q", "*:*")]), None).await;
        assert_eq!(result.unwrap_err().status(), Some(404));
    }

    #[tokio::test]
    async fn test_injected_network_failure() {
        let solr = loaded().await;
        solr.fail_next_requests(1).await;
        assert!(matches!(
            solr.request("test/admin/ping", Vec::new(), None).await,
            Err(SolrError::Network(_))
        ));
        assert!(solr.request("test/admin/ping", Vec::new(), None).await.is_ok());
    }
}
