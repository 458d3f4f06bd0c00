//! Reconcile an incoming document with what the index already holds.
//!
//! Documents outside any block are sent as atomic field updates. A document
//! that is, or becomes, a block-join parent is merged with its stored
//! version, the stored block is deleted and the whole block is sent again.
//! Children cannot be updated on their own.

use super::SolrCore;
use crate::document::Document;
use crate::error::{DocumentWarning, Result, SolrError};
use crate::schema::{FieldValue, VERSION_FIELD};

/// What to do with one incoming document.
#[derive(Debug, PartialEq, Eq)]
pub enum Reconciled {
    /// Serialized fragment to upload.
    Load(String),
    Skip(DocumentWarning),
}

/// Optimistic concurrency check of a requested `_version_` against the
/// stored one (`None` when the document does not exist).
///
/// * existing: `0` and `1` accept anything, `> 1` must match exactly,
///   negative values are rejected.
/// * missing: `> 0` is rejected, anything else is accepted.
pub fn check_version(id: &str, requested: i64, stored: Option<i64>) -> std::result::Result<(), DocumentWarning> {
    let rejected = match stored {
        Some(current) => {
            if requested > 1 && requested != current {
                Some(format!(
                    "version conflict: requested {}, stored {}",
                    requested, current
                ))
            } else if requested < 0 {
                Some(format!("document exists but version {} requires it not to", requested))
            } else {
                None
            }
        }
        None if requested > 0 => Some(format!(
            "document does not exist but version {} requires it to",
            requested
        )),
        None => None,
    };
    match rejected {
        Some(message) => Err(DocumentWarning::new(message).for_doc(id)),
        None => Ok(()),
    }
}

fn version_of(doc: &Document) -> i64 {
    doc.first_value(VERSION_FIELD)
        .and_then(FieldValue::as_i64)
        .unwrap_or(0)
}

/// The server would reject a block whose children carry stale versions.
fn strip_versions(doc: &mut Document) {
    doc.remove_field(VERSION_FIELD);
    for child in doc.child_docs_mut() {
        strip_versions(child);
    }
}

impl SolrCore {
    pub(crate) async fn reconcile(&self, incoming: Document, merge_child_docs: bool) -> Result<Reconciled> {
        let id = incoming.id();

        if incoming.has_child_docs() || self.is_blockjoin_parent(&id, true).await? {
            let requested = version_of(&incoming);
            let mut block = match self.get_doc(&id, &[VERSION_FIELD], true).await {
                Ok(mut stored) => {
                    if let Err(warning) = check_version(&id, requested, Some(version_of(&stored))) {
                        return Ok(Reconciled::Skip(warning));
                    }
                    stored.update(&incoming, merge_child_docs);
                    self.delete_by_parent_ids([id.as_str()]).await?;
                    stored
                }
                Err(SolrError::NotFound(_)) => {
                    if let Err(warning) = check_version(&id, requested, None) {
                        return Ok(Reconciled::Skip(warning));
                    }
                    incoming
                }
                Err(e) => return Err(e),
            };
            strip_versions(&mut block);
            log::debug!("{} Reloading block {}", self.context, id);
            return Ok(Reconciled::Load(block.to_xml(false)));
        }

        if self.is_blockjoin_child(&id, true).await? {
            return Ok(Reconciled::Skip(
                DocumentWarning::new("it is a child blockjoin doc: updating it alone is not supported").for_doc(id),
            ));
        }

        Ok(Reconciled::Load(incoming.to_xml(true)))
    }
}
