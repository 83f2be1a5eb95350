// SPDX-License-Identifier: MIT OR Apache-2.0

//! Result rows, the per-run output directory, and periodic checkpoints.
//!
//! One [`ResultRow`] per feature is built up over the three passes of a
//! run. The whole [`ResultTable`] is re-serialized on every checkpoint;
//! writes go to a temporary file that is synced and renamed over
//! `results.json`, so a reader never sees a partially written table and a
//! crash leaves either the previous checkpoint or the new one.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CfError, Result};
use crate::explain::{InterventionExample, NeuronPrompter};

/// Results file name inside a run directory.
pub const RESULTS_FILE: &str = "results.json";

/// Run snapshot file name inside a run directory.
pub const CONFIG_FILE: &str = "config.json";

/// Completed iterations between two checkpoints within a pass.
pub const CHECKPOINT_INTERVAL: usize = 10;

/// A prompt paired with the max activation of the example it was cut from.
pub type PromptExample = (String, f32);

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// Completions of one scorer prompt under both conditions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completions {
    /// Feature clamped to zero.
    pub clean: String,
    /// Feature clamped to `steering_factor × max_act`.
    pub intervened: String,
}

/// One scorer prompt and its completions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    /// Prompt text.
    pub text: String,
    /// Max activation of the source example.
    pub max_act: f32,
    /// Completions keyed by condition.
    pub completions: Completions,
}

/// Everything recorded about one feature.
///
/// `feat_idx`, `scorer_examples` and `completions` are written by the
/// generation pass; the remaining fields stay `None` until the explainer
/// passes fill them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    /// Feature index.
    pub feat_idx: usize,
    /// Scorer prompts with their source max activation.
    #[serde(default)]
    pub scorer_examples: Vec<PromptExample>,
    /// Clean and intervened completions per scorer prompt.
    #[serde(default)]
    pub completions: Vec<CompletionRecord>,
    /// Steering evidence gathered for the explainer.
    #[serde(default)]
    pub explainer_intervention_examples: Option<Vec<InterventionExample>>,
    /// Candidate explanations.
    #[serde(default)]
    pub explanations: Option<Vec<String>>,
    /// Prompts the explainer saw (nulls in random-explanation runs).
    #[serde(default)]
    pub explainer_prompts: Option<Vec<Option<String>>>,
    /// Explainer prompts with their max activation (nulls in
    /// random-explanation runs).
    #[serde(default)]
    pub explainer_examples: Option<Vec<Option<PromptExample>>>,
    /// Formatter holding the explainer evidence.
    #[serde(default)]
    pub neuron_prompter: Option<NeuronPrompter>,
}

impl ResultRow {
    /// A row holding only the generation-pass fields.
    #[must_use]
    pub fn new(
        feat_idx: usize,
        scorer_examples: Vec<PromptExample>,
        completions: Vec<CompletionRecord>,
    ) -> Self {
        Self {
            feat_idx,
            scorer_examples,
            completions,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// ResultTable
// ---------------------------------------------------------------------------

/// Rows in processing order, serialized as a JSON array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultTable {
    rows: Vec<ResultRow>,
}

impl ResultTable {
    /// An empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self { rows: Vec::new() }
    }

    /// Append a row.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Configuration`] if a row for the same feature
    /// already exists.
    pub fn push(&mut self, row: ResultRow) -> Result<()> {
        if self.rows.iter().any(|r| r.feat_idx == row.feat_idx) {
            return Err(CfError::Configuration(format!(
                "duplicate result row for feature {}",
                row.feat_idx
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Mutable access to the row of one feature.
    pub fn get_mut(&mut self, feat_idx: usize) -> Option<&mut ResultRow> {
        self.rows.iter_mut().find(|r| r.feat_idx == feat_idx)
    }

    /// All rows.
    #[must_use]
    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    /// Mutable rows, for passes that fill fields in order.
    pub fn rows_mut(&mut self) -> &mut [ResultRow] {
        &mut self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Load a table written by a previous run.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Io`] or [`CfError::Serialization`].
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

// ---------------------------------------------------------------------------
// Checkpointer
// ---------------------------------------------------------------------------

/// Persists the whole table every [`CHECKPOINT_INTERVAL`] iterations and
/// at the end of each pass.
#[derive(Debug, Clone)]
pub struct Checkpointer {
    path: PathBuf,
    interval: usize,
    completed: usize,
}

impl Checkpointer {
    /// Checkpoint to `path` every [`CHECKPOINT_INTERVAL`] iterations.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            interval: CHECKPOINT_INTERVAL,
            completed: 0,
        }
    }

    /// Destination file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Iterations completed in the current pass.
    #[must_use]
    pub const fn completed(&self) -> usize {
        self.completed
    }

    /// Count one finished iteration and save if the interval is reached.
    ///
    /// Returns whether a checkpoint was written.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Io`] or [`CfError::Serialization`] on write
    /// failure.
    pub fn record_iteration(&mut self, table: &ResultTable) -> Result<bool> {
        self.completed += 1;
        if self.completed % self.interval == 0 {
            self.save(table)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Save at the end of a pass and reset the iteration count.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Io`] or [`CfError::Serialization`] on write
    /// failure.
    pub fn finish_pass(&mut self, table: &ResultTable) -> Result<()> {
        self.save(table)?;
        info!(
            "Pass finished after {} iterations, {} rows saved to {}",
            self.completed,
            table.len(),
            self.path.display()
        );
        self.completed = 0;
        Ok(())
    }

    /// Write the table to a sibling temporary file, sync it, and rename it
    /// over the destination.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Io`] or [`CfError::Serialization`] on write
    /// failure.
    pub fn save(&self, table: &ResultTable) -> Result<()> {
        let bytes = serde_json::to_vec(table)?;
        atomic_write(&self.path, &bytes)?;
        debug!("checkpoint: {} rows -> {}", table.len(), self.path.display());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RunDirectory
// ---------------------------------------------------------------------------

/// Output directory of one run: `config.json` and `results.json`.
#[derive(Debug, Clone)]
pub struct RunDirectory {
    dir: PathBuf,
}

impl RunDirectory {
    /// Claim `dir` for a new run, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::DestinationExists`] if `dir` already holds a
    /// results file; nothing is created or written in that case.
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let results = dir.join(RESULTS_FILE);
        if results.exists() {
            return Err(CfError::DestinationExists(results));
        }
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The run directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Path of the results file.
    #[must_use]
    pub fn results_path(&self) -> PathBuf {
        self.dir.join(RESULTS_FILE)
    }

    /// Path of the run snapshot.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    /// A checkpointer writing to this run's results file.
    #[must_use]
    pub fn checkpointer(&self) -> Checkpointer {
        Checkpointer::new(self.results_path())
    }

    /// Write the run snapshot once.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Io`] or [`CfError::Serialization`] on write
    /// failure.
    pub fn write_snapshot<T: Serialize>(&self, snapshot: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        atomic_write(&self.config_path(), &bytes)
    }
}

/// Write `bytes` to `<path>.tmp`, fsync it, rename it over `path`, then
/// fsync the parent directory so the rename survives a crash.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        sync_dir(parent)?;
    }
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

// Directory handles cannot be synced outside unix.
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn row(feat_idx: usize) -> ResultRow {
        ResultRow::new(
            feat_idx,
            vec![("a prompt".into(), 2.5)],
            vec![CompletionRecord {
                text: "a prompt".into(),
                max_act: 2.5,
                completions: Completions {
                    clean: " x".into(),
                    intervened: " y".into(),
                },
            }],
        )
    }

    #[test]
    fn duplicate_feature_rejected() {
        let mut table = ResultTable::new();
        table.push(row(3)).unwrap();
        assert!(matches!(table.push(row(3)), Err(CfError::Configuration(_))));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn schema_field_names() {
        let mut table = ResultTable::new();
        table.push(row(1)).unwrap();
        let value = serde_json::to_value(&table).unwrap();
        let first = &value[0];
        assert_eq!(first["feat_idx"], 1);
        assert_eq!(first["scorer_examples"][0][0], "a prompt");
        assert_eq!(first["completions"][0]["completions"]["clean"], " x");
        assert_eq!(first["completions"][0]["completions"]["intervened"], " y");
        assert!(first["explanations"].is_null());
        assert!(first["neuron_prompter"].is_null());
    }

    #[test]
    fn checkpoint_every_interval_and_at_pass_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RESULTS_FILE);
        let mut ckpt = Checkpointer::new(&path);
        let mut table = ResultTable::new();

        for feat in 0..25 {
            table.push(row(feat)).unwrap();
            let saved = ckpt.record_iteration(&table).unwrap();
            assert_eq!(saved, (feat + 1) % CHECKPOINT_INTERVAL == 0);
            if saved {
                let on_disk = ResultTable::from_json_file(&path).unwrap();
                assert_eq!(on_disk.rows(), &table.rows()[..feat + 1]);
            }
        }
        assert_eq!(ResultTable::from_json_file(&path).unwrap().len(), 20);

        ckpt.finish_pass(&table).unwrap();
        assert_eq!(ckpt.completed(), 0);
        assert_eq!(ResultTable::from_json_file(&path).unwrap(), table);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn save_replaces_previous_checkpoint_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunDirectory::create(dir.path().join("run")).unwrap();
        let ckpt = run.checkpointer();

        let mut table = ResultTable::new();
        table.push(row(0)).unwrap();
        ckpt.save(&table).unwrap();
        table.push(row(1)).unwrap();
        ckpt.save(&table).unwrap();

        assert_eq!(ResultTable::from_json_file(run.results_path()).unwrap(), table);
        let names: Vec<String> = std::fs::read_dir(run.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![RESULTS_FILE.to_string()]);

        run.write_snapshot(&serde_json::json!({"seed": 22})).unwrap();
        assert!(!run.config_path().with_extension("json.tmp").exists());
        let snapshot: serde_json::Value =
            serde_json::from_slice(&std::fs::read(run.config_path()).unwrap()).unwrap();
        assert_eq!(snapshot["seed"], 22);
    }

    #[test]
    fn existing_results_file_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunDirectory::create(dir.path().join("run")).unwrap();
        run.checkpointer().save(&ResultTable::new()).unwrap();

        let err = RunDirectory::create(run.path()).unwrap_err();
        assert!(matches!(err, CfError::DestinationExists(_)));
        assert!(!run.config_path().exists());
    }
}
