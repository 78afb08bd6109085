// ============================================================
// Layer 5 — Training Loop
// ============================================================
// Drives the training step over the batch stream and does the
// bookkeeping around it.
//
//   restore (latest checkpoint → initial checkpoint → fresh)
//     │
//     ▼
//   loop:  interrupted?  → stop
//          next batch?   → none: stop (stream exhausted)
//          step += 1, recompute warmed-up values
//          train step    (Record on summary steps)
//          step % checkpoint_frequency == 0 → save + prune
//          summary step                     → flush means
//          step == train_batches            → stop
//     │
//     ▼
//   final save (unless this step was just saved)
//
// The step counter starts at -1 so the first batch is step 0,
// which is both a checkpoint and a summary step.
//
// Key Burn 0.20 insight:
//   - The loop is generic over the Optimizer so the same code
//     trains on Autodiff<Wgpu> and, in tests, Autodiff<NdArray>
//   - optim.step() consumes the encoder and returns the updated
//     one; the state keeps whichever is current
//
// Reference: Burn Book §5, Kingma & Ba (2015) Adam

use anyhow::{Context, Result};
use burn::{optim::Optimizer, tensor::backend::AutodiffBackend};
use std::{
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::data::batcher::SceneBatch;
use crate::domain::schedule::Schedule;
use crate::domain::traits::SummarySink;
use crate::infra::checkpoint::{now_secs, CheckpointState, CheckpointStore};
use crate::infra::metrics::SummaryAccumulator;
use crate::ml::encoder::ContrastiveEncoder;
use crate::ml::step::{SummaryMode, TrainStep};

/// Cadences and schedules of one run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopSettings {
    /// Last step to run
    pub train_batches:        u64,
    pub checkpoint_frequency: u64,
    /// 0 disables summaries
    pub summary_frequency:    u64,
    pub learning_rate:        Schedule,
    pub dropout_rate:         Schedule,
}

impl LoopSettings {
    fn is_summary_step(&self, step: i64) -> bool {
        self.summary_frequency != 0 && step % self.summary_frequency as i64 == 0
    }

    fn is_checkpoint_step(&self, step: i64) -> bool {
        step % self.checkpoint_frequency.max(1) as i64 == 0
    }
}

/// Everything a checkpoint captures
pub struct TrainingState<B: AutodiffBackend, O> {
    pub step:          i64,
    pub learning_rate: f64,
    pub dropout_rate:  f64,
    pub encoder:       ContrastiveEncoder<B>,
    pub optim:         O,
}

impl<B, O> TrainingState<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<ContrastiveEncoder<B>, B>,
{
    /// Step -1 with the given (freshly initialised) encoder
    pub fn fresh(encoder: ContrastiveEncoder<B>, optim: O, settings: &LoopSettings) -> Self {
        Self::at_step(-1, encoder, optim, settings)
    }

    fn at_step(step: i64, encoder: ContrastiveEncoder<B>, optim: O, settings: &LoopSettings) -> Self {
        Self {
            step,
            learning_rate: settings.learning_rate.at(step),
            dropout_rate: settings.dropout_rate.at(step),
            encoder,
            optim,
        }
    }

    /// Resume from the newest checkpoint in `store`, else from
    /// `initial_checkpoint`, else start fresh.
    pub fn restore(
        store:              &CheckpointStore,
        initial_checkpoint: Option<&Path>,
        encoder:            ContrastiveEncoder<B>,
        optim:              O,
        settings:           &LoopSettings,
        device:             &B::Device,
    ) -> Result<Self> {
        let source = match store.latest()? {
            Some(entry) => Some(entry.path),
            None => initial_checkpoint.map(Path::to_path_buf),
        };

        let Some(path) = source else {
            tracing::info!("No checkpoint found, starting from random weights");
            return Ok(Self::fresh(encoder, optim, settings));
        };

        let saved = CheckpointStore::load_state(&path)?;
        let encoder = CheckpointStore::load_encoder(&path, encoder, device)?;
        let optim = CheckpointStore::load_optimizer(&path, optim, device)?;
        tracing::info!("Restored step {} from '{}'", saved.step, path.display());

        // Scheduled values are recomputed, never read back
        Ok(Self::at_step(saved.step, encoder, optim, settings))
    }
}

/// Why the loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Finished,
    Exhausted,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub final_step: i64,
    pub steps_run:  u64,
    pub last_loss:  Option<f64>,
    pub stop:       StopReason,
}

pub struct Trainer<B: AutodiffBackend, O> {
    settings:   LoopSettings,
    state:      TrainingState<B, O>,
    step_fn:    TrainStep,
    store:      CheckpointStore,
    sink:       Box<dyn SummarySink>,
    summaries:  SummaryAccumulator,
    last_saved: Option<i64>,
}

impl<B, O> Trainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<ContrastiveEncoder<B>, B>,
{
    pub fn new(
        settings: LoopSettings,
        state:    TrainingState<B, O>,
        step_fn:  TrainStep,
        store:    CheckpointStore,
        sink:     Box<dyn SummarySink>,
    ) -> Self {
        let summaries = SummaryAccumulator::new(step_fn.aggregator().weights().layer_names());
        Self { settings, state, step_fn, store, sink, summaries, last_saved: None }
    }

    pub fn state(&self) -> &TrainingState<B, O> {
        &self.state
    }

    /// Train until the last step, the end of `batches`, or an interrupt.
    pub fn run<I>(&mut self, batches: I, interrupt: &AtomicBool) -> Result<RunReport>
    where
        I: IntoIterator<Item = SceneBatch<B>>,
    {
        let mut batches = batches.into_iter();
        let mut steps_run = 0u64;
        let mut last_loss = None;

        tracing::info!(
            "Training from step {} to step {}",
            self.state.step + 1,
            self.settings.train_batches
        );

        let stop = loop {
            if self.state.step >= self.settings.train_batches as i64 {
                break StopReason::Finished;
            }
            if interrupt.load(Ordering::SeqCst) {
                break StopReason::Interrupted;
            }
            let Some(batch) = batches.next() else {
                break StopReason::Exhausted;
            };

            self.state.step += 1;
            let step = self.state.step;

            if self.settings.learning_rate.is_warmup_enabled() {
                self.state.learning_rate = self.settings.learning_rate.at(step);
            }
            if self.settings.dropout_rate.is_warmup_enabled() {
                self.state.dropout_rate = self.settings.dropout_rate.at(step);
            }

            let mode = if self.settings.is_summary_step(step) {
                SummaryMode::Record
            } else {
                SummaryMode::Skip
            };

            let (encoder, outcome) = self
                .step_fn
                .run(
                    &self.state.encoder,
                    &mut self.state.optim,
                    batch.images,
                    step,
                    self.state.learning_rate,
                    self.state.dropout_rate,
                    mode,
                    self.sink.as_mut(),
                )
                .with_context(|| format!("Training step {step} failed"))?;
            self.state.encoder = encoder;

            steps_run += 1;
            last_loss = Some(outcome.loss);
            self.summaries.update(&outcome);

            if self.settings.is_checkpoint_step(step) {
                self.save_checkpoint()?;
            }

            if mode == SummaryMode::Record {
                tracing::info!(
                    "step {:>7} | loss={:.4} | lr={:.2e} | dropout={:.3}",
                    step,
                    self.summaries.mean_loss().unwrap_or(outcome.loss),
                    self.state.learning_rate,
                    self.state.dropout_rate,
                );
                self.summaries.flush(
                    self.sink.as_mut(),
                    step,
                    &[
                        ("learning_rate", self.state.learning_rate),
                        ("dropout_rate", self.state.dropout_rate),
                        ("gradient_norm", outcome.gradient_norm),
                    ],
                )?;
            }
        };

        match stop {
            StopReason::Finished => tracing::info!("Reached step {}", self.state.step),
            StopReason::Exhausted => {
                tracing::warn!("Dataset exhausted after step {}", self.state.step)
            }
            StopReason::Interrupted => {
                tracing::warn!("Interrupted after step {}", self.state.step)
            }
        }

        if steps_run > 0 && self.last_saved != Some(self.state.step) {
            self.save_checkpoint()?;
        }
        self.sink.flush()?;

        Ok(RunReport { final_step: self.state.step, steps_run, last_loss, stop })
    }

    fn save_checkpoint(&mut self) -> Result<()> {
        let state = CheckpointState {
            step:          self.state.step,
            learning_rate: self.state.learning_rate,
            dropout_rate:  self.state.dropout_rate,
            saved_at:      now_secs(),
        };
        let path = self.store.save(&state, &self.state.encoder, &self.state.optim)?;
        tracing::info!("Checkpoint saved to '{}'", path.display());
        self.last_saved = Some(self.state.step);
        Ok(())
    }
}
