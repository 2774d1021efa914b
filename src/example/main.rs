//! Self-play driver CLI: boots a [`BatchedScheduler`] and drives
//! `select`/`update` ticks against a stand-in evaluator, since the real
//! neural network is out of scope for this crate (see SPEC_FULL.md §1).
//!
//! `DUMMY_Q`/`dummy_policy` name and value match the original's own
//! `Constants.h` placeholders used for smoke-testing the engine without a
//! trained model (see DESIGN.md's "CLI / process entry" entry).

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Context;
use clap::Parser;
use log::info;

use mcts::policy::NUM_PLANES;
use mcts::record::PolicyTensor;
use mcts::scheduler::BatchedScheduler;

/// Every legal move is equally likely and the position is assumed even;
/// the real evaluator is a neural network supplied by the host, out of
/// scope for this crate (see spec.md §1, "Out of scope").
const DUMMY_Q: f32 = 0.0;

fn dummy_policy() -> PolicyTensor {
    [[[0.0f32; NUM_PLANES]; 8]; 8]
}

/// Drives a batched PUCT self-play engine against a dummy uniform
/// evaluator, for smoke-testing the tree/scheduler plumbing without a
/// trained network attached.
#[derive(Parser)]
#[command(name = "selfplay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Simulations run per move before autoplay advances the root.
    #[arg(long, default_value_t = 800)]
    sims_per_move: u64,

    /// Initial PUCT exploration temperature.
    #[arg(long, default_value_t = 1.0)]
    temperature: f32,

    /// PUCT exploration constant.
    #[arg(long, default_value_t = 1.5)]
    cpuct: f32,

    /// Number of independent trees evaluated per scheduler tick.
    #[arg(long, default_value_t = 64)]
    batch_size: usize,

    /// Number of sectors the engines are split across, so the host can
    /// evaluate one sector while workers advance another.
    #[arg(long, default_value_t = 2)]
    num_sectors: usize,

    /// Worker threads spawned per sector to apply updates/selections.
    #[arg(long, default_value_t = 4)]
    num_threads: usize,

    /// Number of select/update ticks to run before exiting.
    #[arg(long, default_value_t = 1_000)]
    ticks: u64,

    /// Directory (and filename prefix) for self-play record output.
    /// Omit to skip writing records to disk.
    #[arg(long)]
    output_prefix: Option<String>,
}

fn main() -> anyhow::Result<()> {
    env_logger::try_init().ok();
    let cli = Cli::parse();

    let scheduler = BatchedScheduler::new(
        cli.sims_per_move,
        cli.temperature,
        true,
        cli.output_prefix.as_deref(),
        cli.num_threads,
        cli.batch_size,
        cli.num_sectors,
        cli.cpuct,
    )
    .context("failed to construct the batched scheduler")?;

    info!(
        "driving {} engines ({} sectors x {} batch) for {} ticks",
        scheduler.num_engines(),
        cli.num_sectors,
        cli.batch_size,
        cli.ticks
    );

    for tick in 0..cli.ticks {
        let rows = scheduler.select();
        let q = vec![DUMMY_Q; rows.len()];
        let policy = vec![dummy_policy(); rows.len()];
        scheduler.update(q, policy);

        if tick % 100 == 0 {
            info!(
                "tick {tick}: sector {}, {:.1}% of games over",
                scheduler.current_sector(),
                scheduler.proportion_of_games_over() * 100.0
            );
        }
    }

    info!("done: {:.1}% of games over", scheduler.proportion_of_games_over() * 100.0);
    Ok(())
}
