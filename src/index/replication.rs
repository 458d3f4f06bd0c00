//! Index replication on a slave core.
//!
//! The server only reports when the last replication ended and whether it
//! failed, so a replication is known to have happened once its end time is
//! later than the server time read just before asking for it.

use chrono::NaiveDateTime;
use serde_json::Value;
use tokio::time::{sleep, Instant};

use super::SolrCore;
use crate::config::ReplicationPolicy;
use crate::error::{Result, SolrError};
use crate::schema::replication_to_datetime;
use crate::transport::{params, Params};

/// Reported when a slave has never replicated.
const NEVER_REPLICATED: &str = "Fri Jan 01 00:00:00 CEST 1960";

/// A requested replication: the server time just before the request and
/// the master it was asked to pull from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicationTicket {
    pub started_at: NaiveDateTime,
    pub master_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicationStatus {
    pub last_replication: NaiveDateTime,
    pub succeeded: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexVersion {
    /// Version of the searcher's index as reported by luke.
    pub index_version: i64,
    /// Version of the latest replicable commit.
    pub replication_version: i64,
    pub generation: i64,
}

fn slave_section(details: &Value) -> Result<&Value> {
    details
        .pointer("/details/slave")
        .ok_or_else(|| SolrError::ResponseFormat(format!("missing key slave - {}", details)))
}

fn current_date(details: &Value) -> Result<NaiveDateTime> {
    let date = slave_section(details)?
        .get("currentDate")
        .and_then(Value::as_str)
        .ok_or_else(|| SolrError::ResponseFormat(format!("missing key currentDate - {}", details)))?;
    replication_to_datetime(date)
}

fn date_or_never(slave: &Value, key: &str) -> Result<NaiveDateTime> {
    replication_to_datetime(slave.get(key).and_then(Value::as_str).unwrap_or(NEVER_REPLICATED))
}

fn is_replicating(slave: &Value) -> bool {
    match slave.get("isReplicating") {
        Some(Value::Bool(running)) => *running,
        Some(Value::String(running)) => running == "true",
        _ => false,
    }
}

fn integer(value: &Value, pointer: &str) -> Result<i64> {
    value
        .pointer(pointer)
        .and_then(Value::as_i64)
        .ok_or_else(|| SolrError::ResponseFormat(format!("missing {} - {}", pointer, value)))
}

impl SolrCore {
    pub async fn replication_command(&self, command: &str, mut extra: Params) -> Result<Value> {
        let mut p = params(&[("command", command)]);
        p.append(&mut extra);
        self.request("replication", p, None).await
    }

    async fn fetch_index(&self, master_url: Option<&str>) -> Result<Value> {
        let extra = match master_url {
            Some(url) => params(&[("masterUrl", url)]),
            None => Vec::new(),
        };
        self.replication_command("fetchindex", extra).await
    }

    /// Ask the slave to pull the index from `master_url` (the configured
    /// master by default).
    pub async fn start_replication(
        &self,
        master_url: Option<&str>,
        policy: &ReplicationPolicy,
    ) -> Result<ReplicationTicket> {
        let details = self.replication_command("details", Vec::new()).await?;
        let started_at = current_date(&details)?;
        sleep(policy.settle()).await;
        self.fetch_index(master_url).await?;
        log::info!("{} Replication requested at {}", self.context, started_at);
        Ok(ReplicationTicket {
            started_at,
            master_url: master_url.map(str::to_string),
        })
    }

    /// Wait for a running replication to end and report the last one.
    pub async fn check_last_replication_status(&self, policy: &ReplicationPolicy) -> Result<ReplicationStatus> {
        let polling_since = Instant::now();
        let mut network_errors = 0;
        let slave = loop {
            let details = match self.replication_command("details", Vec::new()).await {
                Ok(details) => details,
                Err(SolrError::Network(e)) if network_errors < policy.max_network_errors => {
                    network_errors += 1;
                    log::warn!(
                        "{} Network error while polling replication ({} of {}): {}",
                        self.context,
                        network_errors,
                        policy.max_network_errors,
                        e
                    );
                    sleep(policy.status_poll()).await;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let slave = slave_section(&details)?;
            if !is_replicating(slave) {
                break slave.clone();
            }
            if polling_since.elapsed() >= policy.timeout() {
                return Err(SolrError::Replication(format!(
                    "Replication started but not ended in {} seconds",
                    policy.timeout().as_secs()
                )));
            }
            log::debug!("{} Replication running", self.context);
            sleep(policy.status_poll()).await;
        };

        let last_replication = date_or_never(&slave, "indexReplicatedAt")?;
        let failed_at = date_or_never(&slave, "replicationFailedAt")?;
        let succeeded = last_replication != failed_at;
        if !succeeded {
            log::error!("{} Last replication at {} failed", self.context, last_replication);
        }
        Ok(ReplicationStatus {
            last_replication,
            succeeded,
        })
    }

    /// Wait until a replication newer than `ticket` ends, asking for it
    /// again up to `policy.max_attempts` times.
    pub async fn wait_replication(
        &self,
        ticket: &ReplicationTicket,
        policy: &ReplicationPolicy,
    ) -> Result<ReplicationStatus> {
        let mut attempts = 1;
        let status = loop {
            let status = self.check_last_replication_status(policy).await?;
            if status.last_replication > ticket.started_at {
                break status;
            }
            if attempts >= policy.max_attempts {
                return Err(SolrError::Replication(format!(
                    "Replication not started on slave after {} attempts",
                    attempts
                )));
            }
            attempts += 1;
            log::warn!(
                "{} Replication not started yet, asking again ({} of {})",
                self.context,
                attempts,
                policy.max_attempts
            );
            sleep(policy.poll_interval()).await;
            self.fetch_index(ticket.master_url.as_deref()).await?;
        };

        if !status.succeeded {
            return Err(SolrError::Replication(
                "Replication failed: see the slave server log".to_string(),
            ));
        }
        log::info!(
            "{} Replication done in {} s",
            self.context,
            (status.last_replication - ticket.started_at).num_seconds()
        );
        Ok(status)
    }

    pub async fn start_and_wait_replication(
        &self,
        master_url: Option<&str>,
        policy: &ReplicationPolicy,
    ) -> Result<ReplicationStatus> {
        let ticket = self.start_replication(master_url, policy).await?;
        self.wait_replication(&ticket, policy).await
    }

    pub async fn get_index_version(&self) -> Result<IndexVersion> {
        let luke = self
            .request("admin/luke", params(&[("show", "index"), ("numTerms", "0")]), None)
            .await?;
        let details = self.replication_command("details", Vec::new()).await?;
        Ok(IndexVersion {
            index_version: integer(&luke, "/index/version")?,
            replication_version: integer(&details, "/details/indexVersion")?,
            generation: integer(&details, "/details/generation")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_never_replicated_default() {
        let slave = json!({"currentDate": "Mon Mar 02 10:00:00 CET 2015"});
        let never = date_or_never(&slave, "indexReplicatedAt").unwrap();
        assert_eq!(never, date_or_never(&slave, "replicationFailedAt").unwrap());
        assert!(never < replication_to_datetime("Mon Mar 02 10:00:00 CET 2015").unwrap());
    }

    #[test]
    fn test_is_replicating() {
        assert!(is_replicating(&json!({"isReplicating": "true"})));
        assert!(is_replicating(&json!({"isReplicating": true})));
        assert!(!is_replicating(&json!({"isReplicating": "false"})));
        assert!(!is_replicating(&json!({})));
    }

    #[test]
    fn test_current_date() {
        let details = json!({"details": {"slave": {"currentDate": "Tue Mar 03 08:30:05 CET 2015"}}});
        let date = current_date(&details).unwrap();
        assert_eq!(date.to_string(), "2015-03-03 08:30:05");
        assert!(current_date(&json!({"details": {}})).is_err());
    }
}
