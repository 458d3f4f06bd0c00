// solrcl - typed client for Solr cores

pub mod admin;
pub mod config;
pub mod document;
pub mod error;
pub mod index;
pub mod loader;
mod markup;
pub mod schema;
pub mod transport;

pub use admin::{CoreSpec, SolrAdmin};
pub use config::{ConnectionConfig, LoadOptions, ReplicationPolicy, SelectOptions};
pub use document::{Document, DocumentFactory, FieldEntry};
pub use error::{DocumentWarning, Result, SolrError};
pub use index::{LoadReport, SolrCore};
pub use schema::{FieldValue, Schema, SolrField, SolrType};
pub use transport::{HttpTransport, SimulatedSolr, Transport};
