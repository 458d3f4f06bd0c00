//! Server-wide core administration.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ConnectionConfig;
use crate::error::{Result, SolrError};
use crate::transport::{params, HttpTransport, Params, ServerInfo, Transport};

/// Arguments of a `CREATE` core command.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoreSpec {
    pub name: String,
    pub instance_dir: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_config")]
    pub config: String,
    #[serde(default = "default_schema")]
    pub schema: String,
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_config() -> String {
    "solrconfig.xml".to_string()
}

fn default_schema() -> String {
    "schema.xml".to_string()
}

impl CoreSpec {
    pub fn new(name: impl Into<String>, instance_dir: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance_dir: instance_dir.into(),
            data_dir: default_data_dir(),
            config: default_config(),
            schema: default_schema(),
        }
    }
}

pub struct SolrAdmin {
    transport: Arc<dyn Transport>,
    server: ServerInfo,
}

impl SolrAdmin {
    pub async fn open(config: &ConnectionConfig) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(config)?);
        Self::connect(transport).await
    }

    pub async fn connect(transport: Arc<dyn Transport>) -> Result<Self> {
        let server = ServerInfo::fetch(transport.as_ref()).await?;
        log::debug!(
            "[{}] Admin connected (solr {})",
            transport.endpoint(),
            server.solr_version
        );
        Ok(Self { transport, server })
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server
    }

    /// Request an admin handler; relative resources live under `admin/`.
    pub async fn request(&self, resource: &str, params: Params) -> Result<Value> {
        let resource = if resource.starts_with('/') {
            resource.to_string()
        } else {
            format!("admin/{}", resource)
        };
        self.transport.request(&resource, params, None).await
    }

    async fn cores_action(&self, pairs: &[(&str, &str)]) -> Result<Value> {
        log::info!("[{}] Core admin {:?}", self.transport.endpoint(), pairs);
        self.request("cores", params(pairs)).await
    }

    /// Names of the cores the server hosts.
    pub async fn cores(&self) -> Result<Vec<String>> {
        let status = self.cores_action(&[("action", "STATUS")]).await?;
        let cores = status
            .get("status")
            .and_then(Value::as_object)
            .ok_or_else(|| SolrError::ResponseFormat(format!("missing key status - {}", status)))?;
        Ok(cores.keys().cloned().collect())
    }

    pub async fn reload(&self, core: &str) -> Result<Value> {
        self.cores_action(&[("action", "RELOAD"), ("core", core)]).await
    }

    pub async fn create(&self, spec: &CoreSpec) -> Result<Value> {
        self.cores_action(&[
            ("action", "CREATE"),
            ("name", &spec.name),
            ("instanceDir", &spec.instance_dir),
            ("dataDir", &spec.data_dir),
            ("config", &spec.config),
            ("schema", &spec.schema),
        ])
        .await
    }

    pub async fn swap(&self, core: &str, other: &str) -> Result<Value> {
        self.cores_action(&[("action", "SWAP"), ("core", core), ("other", other)])
            .await
    }

    pub async fn unload(&self, core: &str, delete_instance_dir: bool) -> Result<Value> {
        let delete = if delete_instance_dir { "true" } else { "false" };
        self.cores_action(&[("action", "UNLOAD"), ("core", core), ("deleteInstanceDir", delete)])
            .await
    }
}
