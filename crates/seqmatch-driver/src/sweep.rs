// SPDX-License-Identifier: AGPL-3.0-only

//! Sweep scheduling, measurement and telemetry.
//!
//! A sweep scores every (target, query) pair. The planner partitions the
//! query axis into chunks whose score buffer fits the DMA budget, a
//! calibration run sizes the repetition count so the measured window spans
//! the configured minimum, and the whole chunk walk then runs that many
//! times between two power samples. Per-sweep duration and energy append
//! one line each to the output directory, so successive runs accumulate
//! into a series; the score dump is replaced on every run.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::dma::DmaRegistry;
use crate::error::{DriverError, Result};
use crate::job::JobBinding;
use crate::power::{PowerMeter, PLATFORM_RAIL_OFFSET_WATTS};
use crate::seqio::SequenceSet;
use crate::session::AcceleratorSession;
use seqmatch_hw::layout::{CELL_BYTES, MAX_SEQ_LENGTH, SCORE_SENTINEL};
use seqmatch_hw::message::WaitMode;
use seqmatch_hw::plan::{self, LARGE_PROBLEM_THRESHOLD};

/// Per-sweep durations, one line per sweep, in nanoseconds.
pub const TIMES_FILE: &str = "times.txt";

/// Per-sweep energy, one line per sweep, in joules.
pub const ENERGY_FILE: &str = "energy.txt";

/// Raw score cells of the last chunk layout, overwritten each sweep.
pub const SCORES_FILE: &str = "scores.bin";

/// Default DMA budget a sweep may occupy, in bytes.
pub const DEFAULT_BUDGET_BYTES: u64 = 420_000_000;

/// Default minimum span of the measured window.
pub const DEFAULT_MIN_EXEC_TIME: Duration = Duration::from_secs(100);

/// Knobs of one measured sweep.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// DMA bytes the sweep may occupy, live allocations included.
    pub budget_bytes: u64,
    /// Repeat the sweep until the measured window spans at least this.
    pub min_exec_time: Duration,
    /// Completion mode for every chunk invocation.
    pub wait_mode: WaitMode,
    /// Watts added to the measured rail for the rails the meter cannot see.
    pub rail_offset_watts: f64,
    /// Directory receiving the telemetry files.
    pub output_dir: PathBuf,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            budget_bytes: DEFAULT_BUDGET_BYTES,
            min_exec_time: DEFAULT_MIN_EXEC_TIME,
            wait_mode: WaitMode::default(),
            rail_offset_watts: PLATFORM_RAIL_OFFSET_WATTS,
            output_dir: PathBuf::from("."),
        }
    }
}

/// What one measured sweep produced.
#[derive(Debug, Clone)]
pub struct SweepOutcome {
    /// Times the full chunk walk ran inside the measured window.
    pub repetitions: u32,
    /// Duration of one sweep (measured window divided by repetitions).
    pub sweep_duration: Duration,
    /// Mean power over the window, rail offset included, in watts.
    pub watts: f64,
    /// Energy of one sweep, in joules.
    pub joules: f64,
    /// Score cells after the last chunk, raw little-endian u32s.
    pub scores: Bytes,
    /// Query width of a full chunk.
    pub chunk_queries: u32,
    /// Chunk invocations per sweep.
    pub chunks: usize,
}

/// Score every pair, measure the run, persist the telemetry.
///
/// The plan is computed against the budget before anything is allocated or
/// any register is touched, so a sweep that does not fit fails with the
/// core and DMA pool exactly as they were. Chunks share one score buffer
/// sized for a single chunk; each invocation overwrites it, and the
/// persisted block is the state after the final chunk. Cells still holding
/// [`SCORE_SENTINEL`] afterwards were never written by the core.
///
/// # Errors
///
/// Returns [`DriverError::BudgetExceeded`] or [`DriverError::EmptySweep`]
/// from planning, allocation and transport errors from the run, and I/O
/// errors from persisting telemetry.
#[allow(clippy::cast_possible_truncation)]
pub fn run_sweep(
    session: &mut AcceleratorSession,
    registry: &DmaRegistry,
    meter: &mut dyn PowerMeter,
    targets: &SequenceSet,
    queries: &SequenceSet,
    config: &SweepConfig,
) -> Result<SweepOutcome> {
    let plan = plan::plan_chunks(
        targets.count(),
        queries.count(),
        config.budget_bytes,
        registry.allocated_bytes(),
    )?;
    tracing::info!(
        "Planned sweep: {}x{} pairs in {} chunks of {} queries",
        targets.count(),
        queries.count(),
        plan.chunks.len(),
        plan.chunk_queries
    );

    let mut output = registry.allocate(plan.score_cells * CELL_BYTES, true)?;
    output.as_u32_slice_mut().fill(SCORE_SENTINEL);

    let binding = JobBinding::new(
        registry,
        targets.sequences().id(),
        targets.lengths().id(),
        queries.sequences().id(),
        queries.lengths().id(),
        output.id(),
        MAX_SEQ_LENGTH as u32,
    )?;

    let repetitions = if targets.count() >= LARGE_PROBLEM_THRESHOLD {
        // Large problems are their own measurement window; calibration
        // would double the first chunk's work for nothing
        1
    } else {
        let began = Instant::now();
        session.run_message(&binding.chunk_message(&plan.chunks[0], config.wait_mode))?;
        let chunk_duration = began.elapsed();
        let reps = plan::repetitions(chunk_duration, plan.calibration_factor, config.min_exec_time);
        tracing::debug!(
            "Calibration: chunk took {chunk_duration:?}, factor {}, {reps} repetitions",
            plan.calibration_factor
        );
        reps
    };

    let before = meter.sample()?;
    let began = Instant::now();
    for _ in 0..repetitions {
        for chunk in &plan.chunks {
            session.run_message(&binding.chunk_message(chunk, config.wait_mode))?;
        }
    }
    let window = began.elapsed();
    let after = meter.sample()?;

    let sweep_duration = window / repetitions;
    let watts = meter.watts(&before, &after) + config.rail_offset_watts;
    let joules = watts * sweep_duration.as_secs_f64();

    std::fs::create_dir_all(&config.output_dir)?;
    append_line(
        &config.output_dir.join(TIMES_FILE),
        &format!("{}", sweep_duration.as_nanos()),
    )?;
    append_line(&config.output_dir.join(ENERGY_FILE), &format!("{joules:.6}"))?;
    std::fs::write(config.output_dir.join(SCORES_FILE), output.as_slice())?;

    let scores = Bytes::copy_from_slice(output.as_slice());
    tracing::info!(
        "Sweep complete: {} chunks x {repetitions} repetitions, {sweep_duration:?} per sweep, \
         {watts:.3} W, {joules:.6} J",
        plan.chunks.len()
    );

    Ok(SweepOutcome {
        repetitions,
        sweep_duration,
        watts,
        joules,
        scores,
        chunk_queries: plan.chunk_queries,
        chunks: plan.chunks.len(),
    })
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| DriverError::open_failed(path, e))?;
    writeln!(file, "{line}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power::ConstantMeter;
    use crate::seqio::load_sequences;
    use crate::virt::virtual_setup;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "seqmatch-sweep-{}-{name}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn record_file(name: &str, records: &[(&str, &str)]) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "seqmatch-sweep-in-{}-{name}",
            std::process::id()
        ));
        let mut text = String::new();
        for (desc, bases) in records {
            text.push('@');
            text.push_str(desc);
            text.push('\n');
            text.push_str(bases);
            text.push('\n');
        }
        std::fs::write(&path, text).unwrap();
        path
    }

    fn quick_config(dir: PathBuf) -> SweepConfig {
        SweepConfig {
            min_exec_time: Duration::ZERO,
            wait_mode: WaitMode::Polling,
            output_dir: dir,
            ..SweepConfig::default()
        }
    }

    #[test]
    fn over_budget_sweep_touches_nothing() {
        let (registry, _device, _channel) = virtual_setup(1 << 20).unwrap();
        let targets_path = record_file("t-budget", &[("t0", "ACGT")]);
        let queries_path = record_file("q-budget", &[("q0", "ACG")]);
        let targets = load_sequences(&registry, &targets_path, MAX_SEQ_LENGTH).unwrap();
        let queries = load_sequences(&registry, &queries_path, MAX_SEQ_LENGTH).unwrap();
        let live_before = registry.allocated_bytes();

        // Session deliberately unbound: planning must fail before any
        // transport use, so the error is the budget, not the session
        let mut session = AcceleratorSession::new();
        let mut meter = ConstantMeter::from_watts(5.0);
        let config = SweepConfig {
            budget_bytes: 3,
            ..quick_config(temp_dir("budget"))
        };

        let err = run_sweep(
            &mut session,
            &registry,
            &mut meter,
            &targets,
            &queries,
            &config,
        )
        .unwrap_err();
        assert!(matches!(err, DriverError::BudgetExceeded { .. }));
        assert_eq!(registry.allocated_bytes(), live_before);
    }

    #[test]
    fn sweep_persists_times_energy_and_scores() {
        let (registry, _device, channel) = virtual_setup(1 << 20).unwrap();
        let mut session = AcceleratorSession::new();
        session.open_command_device(Box::new(channel)).unwrap();

        let targets_path = record_file("t-persist", &[("t0", "AAACGTAA"), ("t1", "ACGTTTTT")]);
        let queries_path = record_file("q-persist", &[("q0", "ACGT")]);
        let targets = load_sequences(&registry, &targets_path, MAX_SEQ_LENGTH).unwrap();
        let queries = load_sequences(&registry, &queries_path, MAX_SEQ_LENGTH).unwrap();

        let dir = temp_dir("persist");
        let mut meter = ConstantMeter::from_watts(5.0);
        let config = quick_config(dir.clone());

        let first = run_sweep(
            &mut session,
            &registry,
            &mut meter,
            &targets,
            &queries,
            &config,
        )
        .unwrap();
        let second = run_sweep(
            &mut session,
            &registry,
            &mut meter,
            &targets,
            &queries,
            &config,
        )
        .unwrap();

        // One target row of one query each: end positions 5 and 3
        let expect_scores: Vec<u8> = [5u32, 3]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        assert_eq!(first.scores, expect_scores);
        assert_eq!(second.scores, expect_scores);
        assert_eq!(first.repetitions, 1);
        assert_eq!(first.chunks, 1);
        assert_eq!(first.chunk_queries, 1);
        assert!((first.watts - (5.0 + PLATFORM_RAIL_OFFSET_WATTS)).abs() < 1e-9);

        let times = std::fs::read_to_string(dir.join(TIMES_FILE)).unwrap();
        assert_eq!(times.lines().count(), 2);
        assert!(times.lines().all(|l| l.parse::<u128>().is_ok()));

        let energy = std::fs::read_to_string(dir.join(ENERGY_FILE)).unwrap();
        assert_eq!(energy.lines().count(), 2);
        assert!(energy.lines().all(|l| l.parse::<f64>().is_ok()));

        let scores = std::fs::read(dir.join(SCORES_FILE)).unwrap();
        assert_eq!(scores, expect_scores);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn transient_score_buffer_is_returned_to_the_pool() {
        let (registry, _device, channel) = virtual_setup(1 << 20).unwrap();
        let mut session = AcceleratorSession::new();
        session.open_command_device(Box::new(channel)).unwrap();

        let targets_path = record_file("t-pool", &[("t0", "ACGTACGT")]);
        let queries_path = record_file("q-pool", &[("q0", "ACGT")]);
        let targets = load_sequences(&registry, &targets_path, MAX_SEQ_LENGTH).unwrap();
        let queries = load_sequences(&registry, &queries_path, MAX_SEQ_LENGTH).unwrap();

        let live_before = registry.allocated_bytes();
        let dir = temp_dir("pool");
        let mut meter = ConstantMeter::from_watts(5.0);
        run_sweep(
            &mut session,
            &registry,
            &mut meter,
            &targets,
            &queries,
            &quick_config(dir.clone()),
        )
        .unwrap();

        assert_eq!(registry.allocated_bytes(), live_before);
        let _ = std::fs::remove_dir_all(dir);
    }
}
