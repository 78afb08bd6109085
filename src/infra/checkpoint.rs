// ============================================================
// Layer 6 — Checkpoint Store
// ============================================================
// Persists the full training state so a run can be resumed.
//
// Layout of the output directory:
//
//   out_dir/
//     train_config.json         ← configuration of the run
//     ckpt-0/
//       encoder.mpk.gz          ← encoder weights
//       optimizer.mpk.gz        ← Adam moments
//       state.json              ← step, scheduled values, save time
//     ckpt-500/
//       ...
//       KEEP                    ← present: never pruned
//
// Saving is atomic at the directory level: everything is written
// into ckpt-<step>.tmp first, synced to disk, and the directory
// is renamed once all three files exist. A crash mid-save leaves
// only a .tmp directory, which is never listed as a checkpoint
// and is removed the next time the store is opened for training.
//
// Saving a step that already has a checkpoint moves the old one
// to ckpt-<step>.old before the rename and deletes it after, so
// there is always one complete copy on disk. A .old directory
// found at startup is moved back if its step has no checkpoint.
//
// Retention, applied after every save:
//   - at most `max_to_keep` checkpoints without a KEEP marker
//   - when the oldest one is pushed out, it is kept permanently
//     instead of deleted if at least `keep_every` seconds passed
//     since the last permanently kept checkpoint (or since the
//     store was opened)
//
// Weights use NamedMpkGzFileRecorder with full precision, so a
// resumed run continues from bit-identical parameters.
//
// Reference: Burn Book §5 (Records and Checkpointing)

use anyhow::{anyhow, Context, Result};
use burn::{
    optim::Optimizer,
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkGzFileRecorder, Record, Recorder},
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use crate::application::train_use_case::TrainConfig;
use crate::ml::encoder::ContrastiveEncoder;

pub const CONFIG_FILE: &str = "train_config.json";
const STATE_FILE: &str = "state.json";
const ENCODER_FILE: &str = "encoder";
const OPTIMIZER_FILE: &str = "optimizer";
const KEEP_MARKER: &str = "KEEP";
const PREFIX: &str = "ckpt-";
const TMP_SUFFIX: &str = ".tmp";
const OLD_SUFFIX: &str = ".old";

type CheckpointRecorder = NamedMpkGzFileRecorder<FullPrecisionSettings>;

/// Scalar part of the training state, stored as state.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub step:          i64,
    pub learning_rate: f64,
    pub dropout_rate:  f64,
    /// Seconds since the Unix epoch
    pub saved_at:      u64,
}

/// A complete checkpoint directory
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointEntry {
    pub step:      i64,
    pub path:      PathBuf,
    pub saved_at:  u64,
    pub permanent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionPolicy {
    pub max_to_keep:     usize,
    /// Minimum seconds between permanently kept checkpoints
    pub keep_every_secs: Option<u64>,
}

/// What retention decided for the current set of checkpoints
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetentionPlan {
    pub delete:         Vec<i64>,
    pub preserve:       Vec<i64>,
    pub last_preserved: u64,
}

/// Decide which checkpoints to delete and which to keep forever.
///
/// `entries` must be sorted by step. Permanent entries never count
/// against `max_to_keep`.
pub fn plan_retention(
    entries:        &[CheckpointEntry],
    policy:         &RetentionPolicy,
    last_preserved: u64,
) -> RetentionPlan {
    let mut plan = RetentionPlan { last_preserved, ..Default::default() };
    let candidates: Vec<&CheckpointEntry> = entries.iter().filter(|e| !e.permanent).collect();

    let excess = candidates.len().saturating_sub(policy.max_to_keep);
    for entry in candidates.into_iter().take(excess) {
        match policy.keep_every_secs {
            Some(interval) if entry.saved_at.saturating_sub(plan.last_preserved) >= interval => {
                plan.preserve.push(entry.step);
                plan.last_preserved = entry.saved_at;
            }
            _ => plan.delete.push(entry.step),
        }
    }
    plan
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Manages the checkpoints of one output directory.
pub struct CheckpointStore {
    dir:            PathBuf,
    policy:         RetentionPolicy,
    last_preserved: u64,
}

impl CheckpointStore {
    /// Open `dir` for training: creates it if needed and removes
    /// half-written checkpoints left by an earlier crash.
    pub fn new(dir: impl Into<PathBuf>, policy: RetentionPolicy) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create output directory '{}'", dir.display()))?;

        let entries: Vec<_> = fs::read_dir(&dir)?.filter_map(|e| e.ok()).collect();
        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(PREFIX) {
                continue;
            }
            let path = entry.path();

            if name.ends_with(TMP_SUFFIX) {
                tracing::warn!("Removing incomplete checkpoint '{}'", name);
                fs::remove_dir_all(&path)
                    .with_context(|| format!("Cannot remove '{}'", path.display()))?;
            } else if let Some(original) = name.strip_suffix(OLD_SUFFIX) {
                let original = dir.join(original);
                if original.exists() {
                    fs::remove_dir_all(&path)
                        .with_context(|| format!("Cannot remove '{}'", path.display()))?;
                } else {
                    tracing::warn!("Restoring replaced checkpoint '{}'", name);
                    fs::rename(&path, &original)
                        .with_context(|| format!("Cannot restore '{}'", path.display()))?;
                }
            }
        }

        Ok(Self { dir, policy, last_preserved: now_secs() })
    }

    /// Open `dir` read-only, for evaluation.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir:            dir.into(),
            policy:         RetentionPolicy { max_to_keep: usize::MAX, keep_every_secs: None },
            last_preserved: 0,
        }
    }

    /// Every complete checkpoint, oldest first
    pub fn list(&self) -> Result<Vec<CheckpointEntry>> {
        let mut entries = Vec::new();
        if !self.dir.exists() {
            return Ok(entries);
        }

        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("Cannot read '{}'", self.dir.display()))?
            .filter_map(|e| e.ok())
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(step) = name.strip_prefix(PREFIX).and_then(|s| s.parse::<i64>().ok()) else {
                continue;
            };

            let path = entry.path();
            match Self::load_state(&path) {
                Ok(state) => entries.push(CheckpointEntry {
                    step,
                    saved_at: state.saved_at,
                    permanent: path.join(KEEP_MARKER).exists(),
                    path,
                }),
                Err(e) => tracing::warn!("Ignoring '{}': {e:#}", path.display()),
            }
        }

        entries.sort_by_key(|e| e.step);
        Ok(entries)
    }

    pub fn latest(&self) -> Result<Option<CheckpointEntry>> {
        Ok(self.list()?.pop())
    }

    /// `explicit` when given, otherwise the latest checkpoint
    pub fn checkpoint_or_latest(&self, explicit: Option<&Path>) -> Result<PathBuf> {
        match explicit {
            Some(path) => Ok(path.to_path_buf()),
            None => self
                .latest()?
                .map(|entry| entry.path)
                .ok_or_else(|| anyhow!("No checkpoints in '{}'", self.dir.display())),
        }
    }

    /// Atomically write a checkpoint for `state.step`, then prune.
    pub fn save<B, O>(
        &mut self,
        state:   &CheckpointState,
        encoder: &ContrastiveEncoder<B>,
        optim:   &O,
    ) -> Result<PathBuf>
    where
        B: AutodiffBackend,
        O: Optimizer<ContrastiveEncoder<B>, B>,
    {
        let name = format!("{PREFIX}{}", state.step);
        let tmp = self.dir.join(format!("{name}{TMP_SUFFIX}"));
        let target = self.dir.join(&name);

        if tmp.exists() {
            fs::remove_dir_all(&tmp)?;
        }
        fs::create_dir_all(&tmp)
            .with_context(|| format!("Cannot create '{}'", tmp.display()))?;

        write_record::<B, _>(encoder.clone().into_record(), tmp.join(ENCODER_FILE))?;
        write_record::<B, _>(optim.to_record(), tmp.join(OPTIMIZER_FILE))?;
        fs::write(tmp.join(STATE_FILE), serde_json::to_string_pretty(state)?)
            .with_context(|| format!("Cannot write state to '{}'", tmp.display()))?;

        // Replacing a step: the new copy inherits a KEEP marker, and
        // the old copy stays on disk until the new one is in place
        let replaced = if target.exists() {
            if target.join(KEEP_MARKER).exists() {
                fs::write(tmp.join(KEEP_MARKER), b"")?;
            }
            let old = self.dir.join(format!("{name}{OLD_SUFFIX}"));
            if old.exists() {
                fs::remove_dir_all(&old)?;
            }
            fs::rename(&target, &old)
                .with_context(|| format!("Cannot move '{}' aside", target.display()))?;
            Some(old)
        } else {
            None
        };

        sync_dir(&tmp)?;
        fs::rename(&tmp, &target)
            .with_context(|| format!("Cannot move checkpoint into '{}'", target.display()))?;
        File::open(&self.dir).and_then(|d| d.sync_all()).ok();

        if let Some(old) = replaced {
            fs::remove_dir_all(&old)
                .with_context(|| format!("Cannot delete replaced '{}'", old.display()))?;
        }

        tracing::debug!("Saved checkpoint '{}'", target.display());
        self.apply_retention()?;
        Ok(target)
    }

    fn apply_retention(&mut self) -> Result<()> {
        let entries = self.list()?;
        let plan = plan_retention(&entries, &self.policy, self.last_preserved);
        self.last_preserved = plan.last_preserved;

        for entry in &entries {
            if plan.preserve.contains(&entry.step) {
                fs::write(entry.path.join(KEEP_MARKER), b"")?;
                tracing::info!("Keeping checkpoint {} permanently", entry.step);
            } else if plan.delete.contains(&entry.step) {
                fs::remove_dir_all(&entry.path)
                    .with_context(|| format!("Cannot delete '{}'", entry.path.display()))?;
                tracing::debug!("Deleted checkpoint {}", entry.step);
            }
        }
        Ok(())
    }

    // ─── Loading ──────────────────────────────────────────────────────────────

    pub fn load_state(checkpoint: &Path) -> Result<CheckpointState> {
        let path = checkpoint.join(STATE_FILE);
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Cannot read '{}'", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("Malformed '{}'", path.display()))
    }

    /// Restore encoder weights from a checkpoint directory
    pub fn load_encoder<B: Backend>(
        checkpoint: &Path,
        encoder:    ContrastiveEncoder<B>,
        device:     &B::Device,
    ) -> Result<ContrastiveEncoder<B>> {
        let record = read_record::<B, _>(checkpoint.join(ENCODER_FILE), device)?;
        Ok(encoder.load_record(record))
    }

    /// Restore the optimizer state from a checkpoint directory
    pub fn load_optimizer<B, O>(checkpoint: &Path, optim: O, device: &B::Device) -> Result<O>
    where
        B: AutodiffBackend,
        O: Optimizer<ContrastiveEncoder<B>, B>,
    {
        let record = read_record::<B, O::Record>(checkpoint.join(OPTIMIZER_FILE), device)?;
        Ok(optim.load_record(record))
    }

    // ─── Run configuration ────────────────────────────────────────────────────

    pub fn save_config(&self, cfg: &TrainConfig) -> Result<()> {
        let path = self.dir.join(CONFIG_FILE);
        let json = serde_json::to_string_pretty(cfg)?;
        fs::write(&path, json)
            .with_context(|| format!("Cannot write config to '{}'", path.display()))?;
        tracing::debug!("Saved training config to '{}'", path.display());
        Ok(())
    }

    pub fn load_config(&self) -> Result<TrainConfig> {
        let path = self.dir.join(CONFIG_FILE);
        let json = fs::read_to_string(&path).with_context(|| {
            format!(
                "Cannot read config from '{}'. Make sure 'train' has written to this directory.",
                path.display()
            )
        })?;
        serde_json::from_str(&json).with_context(|| format!("Malformed '{}'", path.display()))
    }
}

/// Flush every file of `dir`, then the directory itself
fn sync_dir(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)?.filter_map(|e| e.ok()) {
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            File::open(entry.path())
                .and_then(|f| f.sync_all())
                .with_context(|| format!("Cannot sync '{}'", entry.path().display()))?;
        }
    }
    // Directories cannot be opened for syncing on every platform
    if let Ok(d) = File::open(dir) {
        d.sync_all().ok();
    }
    Ok(())
}

fn write_record<B: Backend, R: Record<B>>(record: R, path: PathBuf) -> Result<()> {
    <CheckpointRecorder as Recorder<B>>::record(&CheckpointRecorder::new(), record, path.clone())
        .with_context(|| format!("Failed to save record to '{}'", path.display()))?;
    Ok(())
}

fn read_record<B: Backend, R: Record<B>>(path: PathBuf, device: &B::Device) -> Result<R> {
    <CheckpointRecorder as Recorder<B>>::load(&CheckpointRecorder::new(), path.clone(), device)
        .with_context(|| format!("Cannot load record '{}'", path.display()))
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::encoder::EncoderConfig;
    use burn::{
        backend::{Autodiff, NdArray},
        optim::AdamConfig,
    };

    type TestBackend = Autodiff<NdArray>;

    fn entry(step: i64, saved_at: u64) -> CheckpointEntry {
        CheckpointEntry { step, path: PathBuf::new(), saved_at, permanent: false }
    }

    fn state(step: i64) -> CheckpointState {
        CheckpointState { step, learning_rate: 1e-4, dropout_rate: 0.1, saved_at: now_secs() }
    }

    #[test]
    fn test_plan_keeps_newest() {
        let entries: Vec<_> = (0..5).map(|s| entry(s, 0)).collect();
        let policy = RetentionPolicy { max_to_keep: 2, keep_every_secs: None };
        let plan = plan_retention(&entries, &policy, 0);
        assert_eq!(plan.delete, vec![0, 1, 2]);
        assert!(plan.preserve.is_empty());
    }

    #[test]
    fn test_plan_preserves_on_interval() {
        let entries: Vec<_> = (0..5).map(|s| entry(s, s as u64 * 1000)).collect();
        let policy = RetentionPolicy { max_to_keep: 1, keep_every_secs: Some(1500) };
        let plan = plan_retention(&entries, &policy, 0);
        assert_eq!(plan.preserve, vec![2]);
        assert_eq!(plan.delete, vec![0, 1, 3]);
        assert_eq!(plan.last_preserved, 2000);
    }

    #[test]
    fn test_plan_ignores_permanent_entries() {
        let mut entries: Vec<_> = (0..3).map(|s| entry(s, 0)).collect();
        entries[0].permanent = true;
        let policy = RetentionPolicy { max_to_keep: 2, keep_every_secs: None };
        assert!(plan_retention(&entries, &policy, 0).delete.is_empty());
    }

    #[test]
    fn test_save_prunes_and_restores() {
        let tmp = tempfile::tempdir().unwrap();
        let device = Default::default();
        let encoder = EncoderConfig::new(2).with_width(2).init::<TestBackend>(&device);
        let optim = AdamConfig::new().init::<TestBackend, ContrastiveEncoder<TestBackend>>();

        let policy = RetentionPolicy { max_to_keep: 2, keep_every_secs: None };
        let mut store = CheckpointStore::new(tmp.path(), policy).unwrap();
        for step in [0, 5, 10] {
            store.save(&state(step), &encoder, &optim).unwrap();
        }

        let steps: Vec<i64> = store.list().unwrap().iter().map(|e| e.step).collect();
        assert_eq!(steps, vec![5, 10]);

        let latest = store.latest().unwrap().unwrap();
        assert_eq!(CheckpointStore::load_state(&latest.path).unwrap().step, 10);

        let fresh = EncoderConfig::new(2).with_width(2).init::<NdArray>(&Default::default());
        let restored = CheckpointStore::load_encoder(&latest.path, fresh, &Default::default()).unwrap();
        let expected = encoder.stem.weight.val().into_data().to_vec::<f32>().unwrap();
        let actual = restored.stem.weight.val().into_data().to_vec::<f32>().unwrap();
        assert_eq!(expected, actual);

        let optim = AdamConfig::new().init::<TestBackend, ContrastiveEncoder<TestBackend>>();
        assert!(CheckpointStore::load_optimizer(&latest.path, optim, &device).is_ok());

        assert_eq!(store.checkpoint_or_latest(None).unwrap(), latest.path);
        let explicit = tmp.path().join("elsewhere");
        assert_eq!(store.checkpoint_or_latest(Some(&explicit)).unwrap(), explicit);
        assert!(CheckpointStore::open(tmp.path().join("empty")).checkpoint_or_latest(None).is_err());
    }

    #[test]
    fn test_incomplete_checkpoints_are_ignored_and_cleaned() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("ckpt-7.tmp")).unwrap();
        fs::create_dir(tmp.path().join("ckpt-3")).unwrap();

        let reader = CheckpointStore::open(tmp.path());
        assert!(reader.list().unwrap().is_empty());

        let policy = RetentionPolicy { max_to_keep: 3, keep_every_secs: None };
        CheckpointStore::new(tmp.path(), policy).unwrap();
        assert!(!tmp.path().join("ckpt-7.tmp").exists());
    }

    #[test]
    fn test_keep_marker_survives_pruning() {
        let tmp = tempfile::tempdir().unwrap();
        let device = Default::default();
        let encoder = EncoderConfig::new(1).with_width(1).init::<TestBackend>(&device);
        let optim = AdamConfig::new().init::<TestBackend, ContrastiveEncoder<TestBackend>>();

        let policy = RetentionPolicy { max_to_keep: 1, keep_every_secs: Some(0) };
        let mut store = CheckpointStore::new(tmp.path(), policy).unwrap();
        for step in [1, 2, 3] {
            store.save(&state(step), &encoder, &optim).unwrap();
        }

        let entries = store.list().unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].permanent && entries[1].permanent && !entries[2].permanent);
    }

    #[test]
    fn test_resaving_a_step_replaces_it_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let device = Default::default();
        let first = EncoderConfig::new(1).with_width(1).init::<TestBackend>(&device);
        let second = EncoderConfig::new(1).with_width(1).init::<TestBackend>(&device);
        let optim = AdamConfig::new().init::<TestBackend, ContrastiveEncoder<TestBackend>>();

        let policy = RetentionPolicy { max_to_keep: 3, keep_every_secs: None };
        let mut store = CheckpointStore::new(tmp.path(), policy).unwrap();
        store.save(&state(4), &first, &optim).unwrap();
        fs::write(tmp.path().join("ckpt-4").join(KEEP_MARKER), b"").unwrap();
        store.save(&state(4), &second, &optim).unwrap();

        let names: Vec<String> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["ckpt-4".to_string()]);

        let entries = store.list().unwrap();
        assert!(entries[0].permanent);
        let fresh = EncoderConfig::new(1).with_width(1).init::<NdArray>(&Default::default());
        let restored = CheckpointStore::load_encoder(&entries[0].path, fresh, &Default::default()).unwrap();
        let expected = second.stem.weight.val().into_data().to_vec::<f32>().unwrap();
        let actual = restored.stem.weight.val().into_data().to_vec::<f32>().unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn test_replaced_checkpoint_is_restored_after_a_crash() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("ckpt-8.old")).unwrap();
        fs::create_dir(tmp.path().join("ckpt-9.old")).unwrap();
        fs::create_dir(tmp.path().join("ckpt-9")).unwrap();

        let policy = RetentionPolicy { max_to_keep: 3, keep_every_secs: None };
        CheckpointStore::new(tmp.path(), policy).unwrap();
        assert!(tmp.path().join("ckpt-8").is_dir());
        assert!(!tmp.path().join("ckpt-8.old").exists());
        assert!(tmp.path().join("ckpt-9").is_dir());
        assert!(!tmp.path().join("ckpt-9.old").exists());
    }
}
