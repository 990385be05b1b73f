//! Row listing with derived status and pagination.
//!
//! Status is never stored: it comes from the row's result artifact. A row
//! with no artifact is pending, one whose artifact does not decode is
//! unreadable, and otherwise the stored code decides.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::storage::{RowResult, RowStore, StorageError};

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 1000;

/// Status derived for one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RowStatus {
    Success,
    Failed,
    Pending,
    Unreadable,
}

impl RowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowStatus::Success => "success",
            RowStatus::Failed => "failed",
            RowStatus::Pending => "pending",
            RowStatus::Unreadable => "unreadable",
        }
    }

    fn from_result(result: &RowResult) -> Self {
        if result.succeeded() {
            RowStatus::Success
        } else {
            RowStatus::Failed
        }
    }
}

impl fmt::Display for RowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "success" | "done" => Ok(RowStatus::Success),
            "failed" => Ok(RowStatus::Failed),
            "pending" => Ok(RowStatus::Pending),
            "unreadable" => Ok(RowStatus::Unreadable),
            other => Err(format!("unknown row status '{}'", other)),
        }
    }
}

/// One listed row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowSummary {
    pub row_index: u64,
    pub status: RowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_data: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub aborted: bool,
    /// Why an unreadable artifact could not be decoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Page request. Pages are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowQuery {
    pub page: usize,
    pub page_size: usize,
    pub status: Option<RowStatus>,
}

impl Default for RowQuery {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            status: None,
        }
    }
}

impl RowQuery {
    fn bounds(&self, len: usize) -> (usize, usize) {
        let size = self.page_size.clamp(1, MAX_PAGE_SIZE);
        let start = self.page.max(1).saturating_sub(1).saturating_mul(size).min(len);
        let end = start.saturating_add(size).min(len);
        (start, end)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowPage {
    pub rows: Vec<RowSummary>,
    pub page: usize,
    pub page_size: usize,
    /// Rows matching the filter across all pages.
    pub total_rows: usize,
    pub total_pages: usize,
}

/// Lists a job's rows sorted by index.
///
/// Rows `1..=total_items` are listed even before their artifact exists, so
/// pending rows are visible once ingestion has recorded the total. Without
/// a status filter only the requested page's artifacts are read.
pub async fn list_rows(
    store: &RowStore,
    job_id: Uuid,
    total_items: u64,
    query: RowQuery,
) -> Result<RowPage, StorageError> {
    let mut indexes: BTreeSet<u64> = (1..=total_items).collect();
    indexes.extend(
        store
            .list_row_artifacts(job_id)
            .await?
            .into_iter()
            .filter(|a| a.extension == "json")
            .map(|a| a.row_index),
    );

    let page_size = query.page_size.clamp(1, MAX_PAGE_SIZE);
    let (rows, total_rows) = match query.status {
        None => {
            let total_rows = indexes.len();
            let (start, end) = query.bounds(total_rows);
            let mut rows = Vec::with_capacity(end - start);
            for row_index in indexes.into_iter().skip(start).take(end - start) {
                rows.push(summarize(store, job_id, row_index).await?);
            }
            (rows, total_rows)
        }
        Some(status) => {
            let mut matching = Vec::new();
            for row_index in indexes {
                let summary = summarize(store, job_id, row_index).await?;
                if summary.status == status {
                    matching.push(summary);
                }
            }
            let total_rows = matching.len();
            let (start, end) = query.bounds(total_rows);
            (matching.drain(start..end).collect(), total_rows)
        }
    };

    Ok(RowPage {
        rows,
        page: query.page.max(1),
        page_size,
        total_rows,
        total_pages: total_rows.div_ceil(page_size),
    })
}

async fn summarize(
    store: &RowStore,
    job_id: Uuid,
    row_index: u64,
) -> Result<RowSummary, StorageError> {
    let mut summary = RowSummary {
        row_index,
        status: RowStatus::Pending,
        code: None,
        row_data: None,
        finished_at: None,
        aborted: false,
        error: None,
    };
    match store.read_row_result(job_id, row_index).await {
        Ok(Some(result)) => {
            summary.status = RowStatus::from_result(&result);
            summary.code = Some(result.code);
            summary.finished_at = Some(result.finished_at);
            summary.aborted = result.aborted;
            summary.row_data = Some(result.row_data);
        }
        Ok(None) => {}
        Err(StorageError::Unreadable { message, .. }) => {
            summary.status = RowStatus::Unreadable;
            summary.error = Some(message);
        }
        Err(e) => return Err(e),
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn result(job_id: Uuid, row_index: u64, code: i32) -> RowResult {
        let mut row_data = Map::new();
        row_data.insert("n".into(), Value::String(row_index.to_string()));
        RowResult {
            job_id,
            row_index,
            code,
            out: String::new(),
            err: String::new(),
            row_data,
            finished_at: Utc::now(),
            result: None,
            aborted: false,
            backend: None,
        }
    }

    async fn seeded() -> (TempDir, RowStore, Uuid) {
        let dir = TempDir::new().unwrap();
        let store = RowStore::new(dir.path());
        let job = Uuid::new_v4();
        for (index, code) in [(3, 0), (1, 0), (2, 1), (5, 0)] {
            store.write_row_result(&result(job, index, code)).await.unwrap();
        }
        std::fs::write(store.result_path(job, 4), "{ not json").unwrap();
        (dir, store, job)
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("SUCCESS".parse::<RowStatus>(), Ok(RowStatus::Success));
        assert_eq!("done".parse::<RowStatus>(), Ok(RowStatus::Success));
        assert!("running".parse::<RowStatus>().is_err());
    }

    #[tokio::test]
    async fn test_lists_sorted_with_derived_status() {
        let (_dir, store, job) = seeded().await;
        let page = list_rows(&store, job, 6, RowQuery::default()).await.unwrap();

        let got: Vec<(u64, RowStatus)> = page.rows.iter().map(|r| (r.row_index, r.status)).collect();
        assert_eq!(
            got,
            vec![
                (1, RowStatus::Success),
                (2, RowStatus::Failed),
                (3, RowStatus::Success),
                (4, RowStatus::Unreadable),
                (5, RowStatus::Success),
                (6, RowStatus::Pending),
            ]
        );
        assert_eq!(page.total_pages, 1);
        assert!(page.rows[3].error.is_some());
    }

    #[tokio::test]
    async fn test_filter_and_paginate() {
        let (_dir, store, job) = seeded().await;
        let query = RowQuery {
            page: 2,
            page_size: 2,
            status: Some(RowStatus::Success),
        };
        let page = list_rows(&store, job, 6, query).await.unwrap();
        assert_eq!(page.total_rows, 3);
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.rows.len(), 1);
        assert_eq!(page.rows[0].row_index, 5);
    }

    #[tokio::test]
    async fn test_page_past_end_is_empty() {
        let (_dir, store, job) = seeded().await;
        let query = RowQuery {
            page: 9,
            page_size: 2,
            status: None,
        };
        let page = list_rows(&store, job, 0, query).await.unwrap();
        assert!(page.rows.is_empty());
        assert_eq!(page.total_rows, 5);
        assert_eq!(page.total_pages, 3);
    }

    #[tokio::test]
    async fn test_unfiltered_page_reads_only_its_rows() {
        let (_dir, store, job) = seeded().await;
        // Reading row 10 fails outright: its result path is a directory
        std::fs::create_dir_all(store.result_path(job, 10)).unwrap();

        let first = RowQuery {
            page: 1,
            page_size: 3,
            status: None,
        };
        let page = list_rows(&store, job, 10, first).await.unwrap();
        assert_eq!(page.total_rows, 10);
        assert_eq!(page.total_pages, 4);
        let indexes: Vec<u64> = page.rows.iter().map(|r| r.row_index).collect();
        assert_eq!(indexes, vec![1, 2, 3]);

        let filtered = RowQuery {
            status: Some(RowStatus::Pending),
            ..RowQuery::default()
        };
        assert!(list_rows(&store, job, 10, filtered).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_job_dir_lists_pending() {
        let dir = TempDir::new().unwrap();
        let store = RowStore::new(dir.path());
        let page = list_rows(&store, Uuid::new_v4(), 2, RowQuery::default())
            .await
            .unwrap();
        assert_eq!(page.rows.len(), 2);
        assert!(page.rows.iter().all(|r| r.status == RowStatus::Pending));
    }
}
