//! Paged selects.

use std::collections::HashMap;

use futures_util::stream::{self, StreamExt};
use serde_json::Value;

use super::{value_text, SolrCore};
use crate::config::SelectOptions;
use crate::error::{Result, SolrError};
use crate::transport::{params, Params};

/// One result row: the requested fields in request order, `Null` where a
/// document has no value.
pub type Row = Vec<Value>;

fn page_params(query: &str, fl: &str, rows: usize, start: usize, sort: &str) -> Params {
    let rows = rows.to_string();
    let start = start.to_string();
    let mut p = params(&[("q", query), ("fl", fl), ("rows", &rows), ("start", &start)]);
    if !sort.is_empty() {
        p.push(("sort".to_string(), sort.to_string()));
    }
    p
}

fn push_rows(response: &Value, fields: &[&str], rows: &mut Vec<Row>, limit: usize) -> Result<()> {
    let docs = response
        .pointer("/response/docs")
        .and_then(Value::as_array)
        .ok_or_else(|| SolrError::ResponseFormat(format!("missing key docs - {}", response)))?;
    for doc in docs {
        if rows.len() >= limit {
            break;
        }
        rows.push(
            fields
                .iter()
                .map(|f| doc.get(*f).cloned().unwrap_or(Value::Null))
                .collect(),
        );
    }
    Ok(())
}

fn num_found(response: &Value) -> Result<usize> {
    response
        .pointer("/response/numFound")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .ok_or_else(|| SolrError::ResponseFormat(format!("missing key numFound - {}", response)))
}

impl SolrCore {
    /// Every row matching `query`. The first page holds
    /// `options.start_blocksize` rows so small result sets cost one request.
    /// Remaining pages of `options.blocksize` rows are fetched
    /// `options.parallel` at a time and may arrive out of order unless a
    /// sort is given. `fields` defaults to the id field.
    pub async fn select_all(&self, query: &str, fields: &[&str], options: &SelectOptions) -> Result<Vec<Row>> {
        let id_field = [self.id_field()];
        let fields = if fields.is_empty() { &id_field[..] } else { fields };
        let fl = fields.join(",");

        let mut parallel = options.parallel.max(1);
        if !options.sort.is_empty() && parallel > 1 {
            log::warn!("{} Sorted select runs a single request stream", self.context);
            parallel = 1;
        }
        let limit = options.limit.unwrap_or(usize::MAX);
        let mut blocksize = options.blocksize.max(1);
        if let Some(limit) = options.limit {
            blocksize = blocksize.min(limit.max(1));
        }

        let first = self
            .select(page_params(query, &fl, options.start_blocksize, 0, &options.sort))
            .await?;
        let total = num_found(&first)?;
        log::debug!("{} {} records found for {}", self.context, total, query);

        let mut rows = Vec::new();
        push_rows(&first, fields, &mut rows, limit)?;
        if rows.len() >= limit || options.start_blocksize >= total {
            return Ok(rows);
        }

        let mut pages = stream::iter((options.start_blocksize..total).step_by(blocksize))
            .map(|start| self.select(page_params(query, &fl, blocksize, start, &options.sort)))
            .buffer_unordered(parallel);
        while let Some(page) = pages.next().await {
            push_rows(&page?, fields, &mut rows, limit)?;
            if rows.len() >= limit {
                break;
            }
        }
        Ok(rows)
    }

    pub async fn num_records(&self) -> Result<usize> {
        num_found(&self.select(params(&[("q", "*:*"), ("rows", "0")])).await?)
    }

    /// `(value, count)` pairs of `field` over the documents matching
    /// `filter` (all documents by default).
    pub async fn list_field_values(&self, field: &str, filter: Option<&str>) -> Result<Vec<(String, u64)>> {
        let response = self
            .select(params(&[
                ("q", filter.unwrap_or("*:*")),
                ("rows", "0"),
                ("facet", "true"),
                ("facet.field", field),
                ("facet.limit", "-1"),
                ("facet.mincount", "1"),
            ]))
            .await?;
        let flat = response
            .pointer("/facet_counts/facet_fields")
            .and_then(|f| f.get(field))
            .and_then(Value::as_array)
            .ok_or_else(|| SolrError::ResponseFormat(format!("missing facet {} - {}", field, response)))?;

        flat.chunks(2)
            .map(|pair| match pair {
                [value, count] => count
                    .as_u64()
                    .map(|count| (value_text(value), count))
                    .ok_or_else(|| SolrError::ResponseFormat(format!("bad facet count {}", count))),
                _ => Err(SolrError::ResponseFormat(format!("odd facet list for {}", field))),
            })
            .collect()
    }

    pub async fn list_fields(&self, fields: &[&str], filter: Option<&str>, options: &SelectOptions) -> Result<Vec<Row>> {
        self.select_all(filter.unwrap_or("*:*"), fields, options).await
    }

    /// Like `list_fields` restricted to block-join parents.
    pub async fn list_parent_fields(
        &self,
        fields: &[&str],
        filter: Option<&str>,
        options: &SelectOptions,
    ) -> Result<Vec<Row>> {
        let query = match (&self.blockjoin_condition, filter) {
            (Some(condition), Some(filter)) => format!("({}) AND ({})", condition, filter),
            (Some(condition), None) => condition.clone(),
            (None, filter) => filter.unwrap_or("*:*").to_string(),
        };
        self.select_all(&query, fields, options).await
    }

    /// Rows keyed by the id field. The id is prepended to `fields` and the
    /// map values hold the remaining fields.
    pub async fn list_fields_dict(
        &self,
        fields: &[&str],
        filter: Option<&str>,
        options: &SelectOptions,
    ) -> Result<HashMap<String, Row>> {
        let mut all = vec![self.id_field()];
        all.extend(fields.iter().copied().filter(|f| *f != self.id_field()));
        let rows = self.list_fields(&all, filter, options).await?;
        Ok(rows
            .into_iter()
            .filter_map(|mut row| {
                if row.is_empty() {
                    return None;
                }
                let id = value_text(&row.remove(0));
                Some((id, row))
            })
            .collect())
    }

    /// Rows of documents without any value for `null_field`.
    pub async fn list_null_field(&self, null_field: &str, fields: &[&str], options: &SelectOptions) -> Result<Vec<Row>> {
        let query = format!("-{}:[* TO *]", null_field);
        self.select_all(&query, fields, options).await
    }
}
