//! Checkpoint tags, retention, and the default directory store.
//!
//! A checkpoint tag is a path-like string whose final component ends in
//! `-<step>`, e.g. `./model/checkpoint-1500`. The tag's step is the number of
//! completed training steps; resuming from it executes step 1500 next.
//!
//! # Layout
//!
//! ```text
//! <dir>/
//! ├── LATEST                         # tag of the newest checkpoint
//! ├── checkpoint-1000/
//! │   ├── stage0-generator.safetensors
//! │   ├── stage0-discriminator.safetensors
//! │   └── session_state.json
//! └── checkpoint-1500/
//!     └── ...
//! ```
//!
//! Cascades write one `stage<i>-*` pair per stage. Only the newest
//! `keep_last_n` checkpoint directories are kept.
//!
//! # Usage
//!
//! ```rust
//! use adversarial_trainer_rs::checkpoint::CheckpointTag;
//!
//! let tag = CheckpointTag::parse("./model/checkpoint-1500")?;
//! assert_eq!(tag.step(), 1500);
//!
//! assert!(CheckpointTag::parse("./model/checkpoint-latest").is_err());
//! # Ok::<(), adversarial_trainer_rs::GanError>(())
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{GanError, Result};
use crate::lr_decay::LearningRateState;
use crate::objective::{ParameterGroup, ParameterGroups};
use crate::phases::UpdateCounters;

/// Name of the pointer file holding the newest tag.
pub const LATEST_FILE: &str = "LATEST";

/// Name of the session state file inside a checkpoint directory.
pub const STATE_FILE: &str = "session_state.json";

const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// Current session state format version.
const STATE_VERSION: u32 = 1;

/// A parsed checkpoint tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointTag {
    raw: String,
    step: u64,
}

impl CheckpointTag {
    /// Parses the step from the suffix after the last `-` of the final path
    /// component.
    ///
    /// # Errors
    ///
    /// Returns [`GanError::RecoveryParse`] when there is no numeric suffix.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let fail = |reason: &str| GanError::RecoveryParse {
            tag: trimmed.to_string(),
            reason: reason.to_string(),
        };
        let name = trimmed
            .trim_end_matches(['/', '\\'])
            .rsplit(['/', '\\'])
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| fail("empty tag"))?;
        let (_, suffix) = name
            .rsplit_once('-')
            .ok_or_else(|| fail("no '-<step>' suffix"))?;
        let step = suffix
            .parse::<u64>()
            .map_err(|e| fail(&format!("step suffix {suffix:?}: {e}")))?;
        Ok(Self {
            raw: trimmed.to_string(),
            step,
        })
    }

    /// Tag of the checkpoint for `step` under `dir`.
    #[must_use]
    pub fn for_step(dir: &Path, step: u64) -> Self {
        Self {
            raw: dir
                .join(format!("{CHECKPOINT_PREFIX}{step}"))
                .to_string_lossy()
                .into_owned(),
            step,
        }
    }

    /// Completed steps at the checkpoint.
    #[must_use]
    pub fn step(&self) -> u64 {
        self.step
    }

    /// The raw tag.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The tag as a directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        Path::new(&self.raw)
    }
}

impl std::fmt::Display for CheckpointTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Orchestration state stored next to the parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Format version.
    pub version: u32,
    /// Completed steps.
    pub global_step: u64,
    /// Equilibrium balance term, when a controller is in use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equilibrium_k: Option<f32>,
    /// Update counters.
    #[serde(default)]
    pub counters: UpdateCounters,
    /// Learning rates in effect.
    pub learning_rates: LearningRateState,
    /// Number of stages saved.
    pub stages: usize,
}

impl SessionSnapshot {
    /// Creates a snapshot of the current format version.
    #[must_use]
    pub fn new(global_step: u64, learning_rates: LearningRateState, stages: usize) -> Self {
        Self {
            version: STATE_VERSION,
            global_step,
            equilibrium_k: None,
            counters: UpdateCounters::default(),
            learning_rates,
            stages,
        }
    }
}

/// Checkpoint directory store with retention.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    keep_last_n: usize,
}

impl CheckpointManager {
    /// Creates a manager rooted at `dir`. `keep_last_n == 0` keeps every
    /// checkpoint.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, keep_last_n: usize) -> Self {
        Self {
            dir: dir.into(),
            keep_last_n,
        }
    }

    /// Root directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reads the raw tag from the `LATEST` file, if present.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file exists but cannot be read.
    pub fn latest_tag(&self) -> Result<Option<String>> {
        let path = self.dir.join(LATEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        let raw = raw.trim();
        Ok((!raw.is_empty()).then(|| raw.to_string()))
    }

    /// Saves parameters of every stage plus the session snapshot, points
    /// `LATEST` at the new checkpoint, and prunes old ones.
    ///
    /// # Errors
    ///
    /// Returns a checkpoint error if any file cannot be written.
    pub fn save(
        &self,
        stages: &[&ParameterGroups],
        snapshot: &SessionSnapshot,
    ) -> Result<CheckpointTag> {
        let tag = CheckpointTag::for_step(&self.dir, snapshot.global_step);
        let target = tag.path();
        fs::create_dir_all(target).map_err(|e| {
            GanError::Checkpoint(format!("failed to create {}: {e}", target.display()))
        })?;

        for (i, groups) in stages.iter().enumerate() {
            for group in [ParameterGroup::Generator, ParameterGroup::Discriminator] {
                let Some(varmap) = groups.varmap(group) else {
                    continue;
                };
                let path = target.join(parameter_file(i, group));
                varmap.save(&path).map_err(|e| {
                    GanError::Checkpoint(format!("failed to save {}: {e}", path.display()))
                })?;
            }
        }

        let state = serde_json::to_string_pretty(snapshot)?;
        fs::write(target.join(STATE_FILE), state)?;

        let latest = self.dir.join(LATEST_FILE);
        let staging = self.dir.join(format!("{LATEST_FILE}.tmp"));
        fs::write(&staging, tag.as_str())?;
        fs::rename(&staging, &latest)?;

        let removed = self.prune()?;
        info!(tag = %tag, removed, "saved checkpoint");
        Ok(tag)
    }

    /// Loads parameters of every stage from `tag`. Returns the session
    /// snapshot when the checkpoint carries one.
    ///
    /// # Errors
    ///
    /// Returns a checkpoint error for missing or mismatched parameter files,
    /// or an incompatible snapshot version.
    pub fn restore(
        &self,
        tag: &CheckpointTag,
        stages: &[&ParameterGroups],
    ) -> Result<Option<SessionSnapshot>> {
        let source = tag.path();
        if !source.is_dir() {
            return Err(GanError::Checkpoint(format!(
                "checkpoint {} does not exist",
                source.display()
            )));
        }

        for (i, groups) in stages.iter().enumerate() {
            for group in [ParameterGroup::Generator, ParameterGroup::Discriminator] {
                let Some(varmap) = groups.varmap(group) else {
                    continue;
                };
                let path = source.join(parameter_file(i, group));
                let mut varmap = varmap.clone();
                varmap.load(&path).map_err(|e| {
                    GanError::Checkpoint(format!("failed to load {}: {e}", path.display()))
                })?;
            }
        }

        let state_path = source.join(STATE_FILE);
        if !state_path.exists() {
            debug!(tag = %tag, "checkpoint has no session state");
            return Ok(None);
        }
        let snapshot: SessionSnapshot = serde_json::from_str(&fs::read_to_string(state_path)?)?;
        if snapshot.version != STATE_VERSION {
            return Err(GanError::Checkpoint(format!(
                "incompatible session state version: {} (expected {STATE_VERSION})",
                snapshot.version
            )));
        }
        Ok(Some(snapshot))
    }

    /// Lists checkpoint directories, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the directory cannot be read.
    pub fn list(&self) -> Result<Vec<CheckpointTag>> {
        let mut tags = Vec::new();
        if !self.dir.exists() {
            return Ok(tags);
        }
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_checkpoint = path.is_dir()
                && path
                    .file_name()
                    .and_then(|s| s.to_str())
                    .is_some_and(|s| s.starts_with(CHECKPOINT_PREFIX));
            if !is_checkpoint {
                continue;
            }
            if let Ok(tag) = CheckpointTag::parse(&path.to_string_lossy()) {
                tags.push(tag);
            }
        }
        tags.sort_by_key(CheckpointTag::step);
        Ok(tags)
    }

    /// Deletes all but the newest `keep_last_n` checkpoints. Returns how
    /// many were removed.
    ///
    /// # Errors
    ///
    /// Returns a checkpoint error if a directory cannot be deleted.
    pub fn prune(&self) -> Result<usize> {
        if self.keep_last_n == 0 {
            return Ok(0);
        }
        let tags = self.list()?;
        let excess = tags.len().saturating_sub(self.keep_last_n);
        for tag in &tags[..excess] {
            fs::remove_dir_all(tag.path()).map_err(|e| {
                GanError::Checkpoint(format!("failed to delete old checkpoint {tag}: {e}"))
            })?;
        }
        Ok(excess)
    }
}

fn parameter_file(stage: usize, group: ParameterGroup) -> String {
    format!("stage{stage}-{group}.safetensors")
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use tempfile::TempDir;

    fn groups_with_weights(value: f32) -> ParameterGroups {
        let groups = ParameterGroups::new();
        for group in [ParameterGroup::Generator, ParameterGroup::Discriminator] {
            let vb = groups.builder(group, DType::F32, &Device::Cpu).unwrap();
            let w = vb
                .get_with_hints(3, "w", candle_nn::Init::Const(f64::from(value)))
                .unwrap();
            assert_eq!(w.dims(), &[3]);
        }
        groups
    }

    fn first_weight(groups: &ParameterGroups, group: ParameterGroup) -> Vec<f32> {
        groups.vars(group)[0].as_tensor().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_tag_parsing() {
        assert_eq!(CheckpointTag::parse("./model/checkpoint-1500").unwrap().step(), 1500);
        assert_eq!(CheckpointTag::parse("model-7/").unwrap().step(), 7);
        assert_eq!(CheckpointTag::parse("a-b-c-42").unwrap().step(), 42);
        assert_eq!(CheckpointTag::parse(" run-3\n").unwrap().as_str(), "run-3");
    }

    #[test]
    fn test_unparsable_tags() {
        for raw in ["", "./model/checkpoint", "./model/checkpoint-", "x-12abc", "/-/"] {
            let err = CheckpointTag::parse(raw).unwrap_err();
            assert!(matches!(err, GanError::RecoveryParse { .. }), "{raw:?}");
            assert!(!err.is_fatal());
        }
    }

    #[test]
    fn test_step_comes_from_final_component_only() {
        assert!(CheckpointTag::parse("./run-5/checkpoint").is_err());
    }

    #[test]
    fn test_no_latest_file() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path(), 3);
        assert!(manager.latest_tag().unwrap().is_none());
        assert!(manager.list().unwrap().is_empty());
    }

    #[test]
    fn test_save_restore_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path(), 3);
        let saved = groups_with_weights(1.5);
        let mut snapshot = SessionSnapshot::new(200, LearningRateState::uniform(1e-4), 1);
        snapshot.equilibrium_k = Some(0.25);

        let tag = manager.save(&[&saved], &snapshot).unwrap();
        assert_eq!(tag.step(), 200);
        let latest = manager.latest_tag().unwrap().unwrap();
        assert_eq!(CheckpointTag::parse(&latest).unwrap(), tag);

        let restored = groups_with_weights(0.0);
        let loaded = manager.restore(&tag, &[&restored]).unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert_eq!(
            first_weight(&restored, ParameterGroup::Generator),
            vec![1.5, 1.5, 1.5]
        );
        assert_eq!(
            first_weight(&restored, ParameterGroup::Discriminator),
            vec![1.5, 1.5, 1.5]
        );
    }

    #[test]
    fn test_retention_keeps_newest() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path(), 2);
        let groups = groups_with_weights(1.0);
        for step in [100, 200, 300] {
            let snapshot = SessionSnapshot::new(step, LearningRateState::default(), 1);
            manager.save(&[&groups], &snapshot).unwrap();
        }
        let steps: Vec<u64> = manager.list().unwrap().iter().map(CheckpointTag::step).collect();
        assert_eq!(steps, vec![200, 300]);
        assert!(!temp_dir.path().join("checkpoint-100").exists());
    }

    #[test]
    fn test_restore_missing_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path(), 2);
        let tag = CheckpointTag::for_step(temp_dir.path(), 5);
        let groups = groups_with_weights(1.0);
        assert!(matches!(
            manager.restore(&tag, &[&groups]),
            Err(GanError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_incompatible_version() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path(), 2);
        let groups = groups_with_weights(1.0);
        let mut snapshot = SessionSnapshot::new(10, LearningRateState::default(), 1);
        snapshot.version = 99;
        let tag = manager.save(&[&groups], &snapshot).unwrap();
        assert!(manager.restore(&tag, &[&groups]).is_err());
    }

    #[test]
    fn test_snapshot_without_k_omits_field() {
        let snapshot = SessionSnapshot::new(1, LearningRateState::default(), 1);
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(!json.contains("equilibrium_k"));
        let back: SessionSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.equilibrium_k, None);
    }
}
