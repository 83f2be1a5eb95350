// SPDX-License-Identifier: MIT OR Apache-2.0

//! Concurrent per-query execution with one result file per query.
//!
//! [`execute_and_save`] spawns one task per query on the current tokio
//! runtime. Each task runs its query, serializes the result and writes it
//! to `layer{L}_feature{F}.txt`; tasks complete in no particular order.
//! A failing task does not stop the others: failures are collected in the
//! returned [`PersistSummary`].
//!
//! # Example
//!
//! ```no_run
//! use candle_counterfactual::persist::{QueryKey, execute_and_save};
//!
//! struct Query { layer: usize, feature: usize }
//!
//! impl QueryKey for Query {
//!     fn layer_index(&self) -> usize { self.layer }
//!     fn feature_index(&self) -> usize { self.feature }
//! }
//!
//! # async fn example() -> candle_counterfactual::Result<()> {
//! let queries = vec![Query { layer: 3, feature: 17 }];
//! let summary = execute_and_save(queries, "scores", true, |q: Query| async move {
//!     Ok(q.feature * 2)
//! })
//! .await?;
//! assert!(summary.is_complete());
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::{CfError, Result};
use crate::features::FeatureRecord;

/// Identifies the output file of a query.
pub trait QueryKey {
    /// Layer of the queried feature.
    fn layer_index(&self) -> usize;
    /// Index of the queried feature.
    fn feature_index(&self) -> usize;
}

impl QueryKey for FeatureRecord {
    fn layer_index(&self) -> usize {
        self.layer_index
    }

    fn feature_index(&self) -> usize {
        self.feature_index
    }
}

/// Output file name for one query.
#[must_use]
pub fn result_file_name(layer_index: usize, feature_index: usize) -> String {
    format!("layer{layer_index}_feature{feature_index}.txt")
}

#[derive(Serialize)]
struct Timed<'a, T> {
    result: &'a T,
    time: f64,
}

/// A query whose task failed.
#[derive(Debug)]
pub struct PersistFailure {
    /// `(layer, feature)` of the query; `None` if its task panicked.
    pub key: Option<(usize, usize)>,
    /// What went wrong.
    pub error: CfError,
}

/// Outcome of [`execute_and_save`].
#[derive(Debug, Default)]
pub struct PersistSummary {
    /// Files written, in completion order.
    pub written: Vec<PathBuf>,
    /// Failed queries.
    pub failures: Vec<PersistFailure>,
}

impl PersistSummary {
    /// Whether every query was written.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

async fn process_and_save<Q, F, Fut, T>(
    query: Q,
    f: Arc<F>,
    output_dir: Arc<Path>,
    record_time: bool,
) -> Result<PathBuf>
where
    Q: QueryKey,
    F: Fn(Q) -> Fut,
    Fut: Future<Output = Result<T>>,
    T: Serialize,
{
    let (layer, feature) = (query.layer_index(), query.feature_index());
    info!(layer, feature, "executing query");

    let start = Instant::now();
    let result = f(query).await?;
    let elapsed = start.elapsed().as_secs_f64();

    let bytes = if record_time {
        serde_json::to_vec(&Timed {
            result: &result,
            time: elapsed,
        })?
    } else {
        serde_json::to_vec(&result)?
    };
    let path = output_dir.join(result_file_name(layer, feature));
    tokio::fs::write(&path, bytes).await?;

    info!(path = %path.display(), "saved result");
    Ok(path)
}

/// Run `f` on every query concurrently and save each result under
/// `output_dir`.
///
/// With `record_time`, each file holds `{"result": ..., "time": seconds}`
/// instead of the bare result.
///
/// # Errors
///
/// Returns [`CfError::Io`] if `output_dir` cannot be created. Per-query
/// failures are reported in the summary instead.
pub async fn execute_and_save<Q, F, Fut, T>(
    queries: Vec<Q>,
    output_dir: impl AsRef<Path>,
    record_time: bool,
    f: F,
) -> Result<PersistSummary>
where
    Q: QueryKey + Send + 'static,
    F: Fn(Q) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Serialize + Send + 'static,
{
    let output_dir: Arc<Path> = Arc::from(output_dir.as_ref());
    tokio::fs::create_dir_all(&output_dir).await?;

    let f = Arc::new(f);
    let mut set = JoinSet::new();
    for query in queries {
        let key = (query.layer_index(), query.feature_index());
        let f = Arc::clone(&f);
        let dir = Arc::clone(&output_dir);
        set.spawn(async move { (key, process_and_save(query, f, dir, record_time).await) });
    }

    let mut summary = PersistSummary::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(path))) => summary.written.push(path),
            Ok((key, Err(error))) => {
                warn!(layer = key.0, feature = key.1, "query failed: {error}");
                summary.failures.push(PersistFailure {
                    key: Some(key),
                    error,
                });
            }
            Err(join_error) => {
                warn!("query task did not complete: {join_error}");
                summary.failures.push(PersistFailure {
                    key: None,
                    error: CfError::Task(join_error.to_string()),
                });
            }
        }
    }
    Ok(summary)
}

/// Blocking version of [`execute_and_save`] for non-async callers.
///
/// Creates a single-threaded tokio runtime internally. Do **not** call from
/// within an existing async context.
///
/// # Errors
///
/// Returns [`CfError::Task`] if the runtime cannot be created, plus the
/// errors of [`execute_and_save`].
pub fn execute_and_save_blocking<Q, F, Fut, T>(
    queries: Vec<Q>,
    output_dir: impl AsRef<Path>,
    record_time: bool,
    f: F,
) -> Result<PersistSummary>
where
    Q: QueryKey + Send + 'static,
    F: Fn(Q) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Serialize + Send + 'static,
{
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| CfError::Task(format!("failed to create tokio runtime: {e}")))?;
    rt.block_on(execute_and_save(queries, output_dir, record_time, f))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn records() -> Vec<FeatureRecord> {
        (0..4).map(|f| FeatureRecord::new(f, 2, Vec::new())).collect()
    }

    #[tokio::test]
    async fn one_file_per_query() {
        let dir = tempfile::tempdir().unwrap();
        let summary = execute_and_save(records(), dir.path(), false, |r: FeatureRecord| async move {
            Ok(vec![r.feature_index; 2])
        })
        .await
        .unwrap();

        assert!(summary.is_complete());
        assert_eq!(summary.written.len(), 4);
        let body = std::fs::read_to_string(dir.path().join("layer2_feature3.txt")).unwrap();
        assert_eq!(body, "[3,3]");
    }

    #[tokio::test]
    async fn record_time_wraps_result() {
        let dir = tempfile::tempdir().unwrap();
        execute_and_save(records(), dir.path(), true, |r: FeatureRecord| async move {
            Ok(r.feature_index)
        })
        .await
        .unwrap();

        let body = std::fs::read(dir.path().join("layer2_feature1.txt")).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["result"], 1);
        assert!(value["time"].as_f64().unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn failures_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let summary = execute_and_save(records(), dir.path(), false, |r: FeatureRecord| async move {
            if r.feature_index == 2 {
                Err(CfError::ExternalModel("scorer unavailable".into()))
            } else {
                Ok(r.feature_index)
            }
        })
        .await
        .unwrap();

        assert_eq!(summary.written.len(), 3);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].key, Some((2, 2)));
        assert!(!dir.path().join("layer2_feature2.txt").exists());
    }

    #[test]
    fn blocking_wrapper_runs_outside_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested");
        let summary = execute_and_save_blocking(records(), &out, false, |r: FeatureRecord| async move {
            Ok(r.layer_index)
        })
        .unwrap();
        assert_eq!(summary.written.len(), 4);
        assert!(out.join("layer2_feature0.txt").exists());
    }
}
