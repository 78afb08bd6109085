// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// This is the entry point for all user interaction.
// It uses the `clap` crate to parse command line arguments.
// All business logic is delegated to Layer 2 (application).
//
// Three commands are supported:
//   1. `train`    — contrastive training, resumable from out_dir
//   2. `project`  — PCA and t-SNE of one representation layer to CSV
//   3. `classify` — fine-tuning experiments with fewer bands or scenes
//
// Ctrl-C during `train` or `classify` does not kill the process:
// it sets a flag the loops poll between steps, so the current
// step finishes and the results so far are written.
//
// Reference: Rust Book §7 (Modules), §12 (CLI programs)

pub mod commands;

use anyhow::{Context, Result};
use clap::Parser;
use commands::{ClassifyArgs, Commands, ProjectArgs, TrainArgs};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::ml::trainer::StopReason;

#[derive(Parser, Debug)]
#[command(
    name = "csf",
    version = "0.1.0",
    about = "Learn multi-band image representations with a multi-layer contrastive objective."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Match on the subcommand and dispatch to the correct use case.
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Train(args) => run_train(args),
            Commands::Project(args) => run_project(args),
            Commands::Classify(args) => run_classify(args),
        }
    }
}

/// A flag that Ctrl-C sets instead of killing the process
fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted, finishing current step...");
        flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl-C handler")?;
    Ok(interrupted)
}

fn run_train(args: TrainArgs) -> Result<()> {
    use crate::application::train_use_case::TrainUseCase;

    let interrupted = interrupt_flag()?;
    let use_case = TrainUseCase::new(args.into(), interrupted);
    let report = use_case.execute()?;

    match report.stop {
        StopReason::Finished => println!("Training complete at step {}.", report.final_step),
        StopReason::Exhausted => println!("Ran out of data at step {}.", report.final_step),
        StopReason::Interrupted => println!("Interrupted at step {}.", report.final_step),
    }
    if let Some(loss) = report.last_loss {
        println!("Last loss: {loss:.4}");
    }
    Ok(())
}

fn run_project(args: ProjectArgs) -> Result<()> {
    use crate::application::project_use_case::ProjectUseCase;

    let files = ProjectUseCase::new(args.into()).execute()?;
    println!("PCA projection written to {}", files.pca.display());
    println!("t-SNE projection written to {}", files.tsne.display());
    Ok(())
}

fn run_classify(args: ClassifyArgs) -> Result<()> {
    use crate::application::classify_use_case::ClassifyUseCase;

    let report = ClassifyUseCase::new(args.into(), interrupt_flag()?).execute()?;

    for r in &report.results {
        println!(
            "{:<18} bands={:<2} scenes={:<5} test_acc={:.1}% test_top2={:.1}%",
            r.run.experiment,
            r.run.kept_bands,
            r.run.n_scenes,
            r.test_accuracy * 100.0,
            r.test_top2_accuracy * 100.0,
        );
    }
    if report.interrupted {
        println!("Interrupted after {} runs.", report.results.len());
    }
    println!("Results written to {}", report.csv.display());
    Ok(())
}
