//! End-to-end sweeps against the virtual scan core.
//!
//! Everything here runs the public API exactly as a tool on the board
//! would, with the in-process core model standing in for silicon.

use std::path::PathBuf;
use std::time::Duration;

use seqmatch_driver::hw::layout::{MAX_SEQ_LENGTH, SCORE_SENTINEL};
use seqmatch_driver::prelude::*;
use seqmatch_driver::sweep::{ENERGY_FILE, SCORES_FILE, TIMES_FILE};
use seqmatch_driver::virt::virtual_setup;

fn write_records(name: &str, records: &[(&str, &str)]) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "seqmatch-vsweep-{}-{name}.fq",
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
    std::fs::write(&path, text).expect("writing sequence fixture");
    path
}

fn out_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "seqmatch-vsweep-out-{}-{name}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn open_virtual(capacity: usize) -> (DmaRegistry, seqmatch_driver::VirtDevice, AcceleratorSession) {
    let (registry, device, channel) = virtual_setup(capacity).expect("virtual setup");
    let mut session = AcceleratorSession::new();
    session
        .open_command_device(Box::new(channel))
        .expect("binding the virtual channel");
    (registry, device, session)
}

fn sweep_config(dir: PathBuf, mode: WaitMode) -> SweepConfig {
    SweepConfig {
        min_exec_time: Duration::ZERO,
        wait_mode: mode,
        output_dir: dir,
        ..SweepConfig::default()
    }
}

fn sentinel_cells(scores: &[u8]) -> usize {
    scores
        .chunks_exact(4)
        .filter(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]) == SCORE_SENTINEL)
        .count()
}

#[test]
fn two_by_one_sweep_scores_both_pairs() {
    let (registry, _core, mut session) = open_virtual(1 << 20);

    let targets_path = write_records("pairs-t", &[("t0", "AAACGTAA"), ("t1", "ACGTTTTT")]);
    let queries_path = write_records("pairs-q", &[("q0", "ACGT")]);
    let targets = load_sequences(&registry, &targets_path, MAX_SEQ_LENGTH).expect("targets");
    let queries = load_sequences(&registry, &queries_path, MAX_SEQ_LENGTH).expect("queries");

    let dir = out_dir("pairs");
    let mut meter = ConstantMeter::from_watts(5.0);
    let outcome = run_sweep(
        &mut session,
        &registry,
        &mut meter,
        &targets,
        &queries,
        &sweep_config(dir.clone(), WaitMode::Interrupt),
    )
    .expect("sweep");

    // ACGT ends at index 5 of AAACGTAA and index 3 of ACGTTTTT
    let expect: Vec<u8> = [5u32, 3].iter().flat_map(|v| v.to_le_bytes()).collect();
    assert_eq!(outcome.scores, expect);
    assert_eq!(sentinel_cells(&outcome.scores), 0);
    assert_eq!(outcome.chunks, 1);
    assert!(outcome.repetitions >= 1);
    assert!(outcome.joules > 0.0);

    let persisted = std::fs::read(dir.join(SCORES_FILE)).expect("scores.bin");
    assert_eq!(persisted, expect);
    assert!(dir.join(TIMES_FILE).exists());
    assert!(dir.join(ENERGY_FILE).exists());

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn tight_budget_splits_the_query_axis() {
    let (registry, _core, mut session) = open_virtual(1 << 20);

    // Identical pairs everywhere so every chunk writes the same value and
    // chunk boundaries cannot leak into the scores
    let targets_path = write_records(
        "chunk-t",
        &[("t0", "AAACGTAA"), ("t1", "AAACGTAA"), ("t2", "AAACGTAA")],
    );
    let queries_path = write_records(
        "chunk-q",
        &[
            ("q0", "ACGT"),
            ("q1", "ACGT"),
            ("q2", "ACGT"),
            ("q3", "ACGT"),
            ("q4", "ACGT"),
        ],
    );
    let targets = load_sequences(&registry, &targets_path, MAX_SEQ_LENGTH).expect("targets");
    let queries = load_sequences(&registry, &queries_path, MAX_SEQ_LENGTH).expect("queries");

    // Room for exactly two query columns beyond the live buffers: the five
    // queries become 2 + 2 + 1
    let budget = registry.allocated_bytes() + 2 * 4 * u64::from(targets.count());
    let dir = out_dir("chunk");
    let mut meter = ConstantMeter::from_watts(5.0);
    let config = SweepConfig {
        budget_bytes: budget,
        ..sweep_config(dir.clone(), WaitMode::Polling)
    };

    let outcome = run_sweep(
        &mut session,
        &registry,
        &mut meter,
        &targets,
        &queries,
        &config,
    )
    .expect("sweep");

    assert_eq!(outcome.chunk_queries, 2);
    assert_eq!(outcome.chunks, 3);
    // Score block is one chunk wide: 3 targets x 2 queries
    assert_eq!(outcome.scores.len(), 3 * 2 * 4);
    assert_eq!(sentinel_cells(&outcome.scores), 0);
    for cell in outcome.scores.chunks_exact(4) {
        assert_eq!(u32::from_le_bytes([cell[0], cell[1], cell[2], cell[3]]), 5);
    }

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn polling_and_interrupt_modes_agree() {
    let (registry, _core, mut session) = open_virtual(1 << 20);

    let targets_path = write_records("modes-t", &[("t0", "GATTACAGATTACA"), ("t1", "TTTTACGT")]);
    let queries_path = write_records("modes-q", &[("q0", "GATTACA"), ("q1", "ACGT")]);
    let targets = load_sequences(&registry, &targets_path, MAX_SEQ_LENGTH).expect("targets");
    let queries = load_sequences(&registry, &queries_path, MAX_SEQ_LENGTH).expect("queries");

    let mut meter = ConstantMeter::from_watts(5.0);

    let dir_poll = out_dir("modes-poll");
    let polled = run_sweep(
        &mut session,
        &registry,
        &mut meter,
        &targets,
        &queries,
        &sweep_config(dir_poll.clone(), WaitMode::Polling),
    )
    .expect("polled sweep");

    let dir_irq = out_dir("modes-irq");
    let interrupted = run_sweep(
        &mut session,
        &registry,
        &mut meter,
        &targets,
        &queries,
        &sweep_config(dir_irq.clone(), WaitMode::Interrupt),
    )
    .expect("interrupt sweep");

    assert_eq!(polled.scores, interrupted.scores);
    assert_eq!(sentinel_cells(&polled.scores), 0);

    let _ = std::fs::remove_dir_all(dir_poll);
    let _ = std::fs::remove_dir_all(dir_irq);
}

#[test]
fn fire_and_forget_dispatches_without_scores() {
    let (registry, _core, mut session) = open_virtual(1 << 20);

    let targets_path = write_records("ff-t", &[("t0", "ACGTACGT")]);
    let queries_path = write_records("ff-q", &[("q0", "ACGT")]);
    let targets = load_sequences(&registry, &targets_path, MAX_SEQ_LENGTH).expect("targets");
    let queries = load_sequences(&registry, &queries_path, MAX_SEQ_LENGTH).expect("queries");

    let dir = out_dir("ff");
    let mut meter = ConstantMeter::from_watts(5.0);

    // Dispatch-only mode: the sweep returns without waiting, so the only
    // guarantees are that it completes and the snapshot has the right shape
    let outcome = run_sweep(
        &mut session,
        &registry,
        &mut meter,
        &targets,
        &queries,
        &sweep_config(dir.clone(), WaitMode::FireAndForget),
    )
    .expect("fire-and-forget sweep");
    assert_eq!(outcome.scores.len(), 4);

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn successive_sweeps_accumulate_telemetry_lines() {
    let (registry, _core, mut session) = open_virtual(1 << 20);

    let targets_path = write_records("series-t", &[("t0", "ACGTACGT")]);
    let queries_path = write_records("series-q", &[("q0", "ACGT")]);
    let targets = load_sequences(&registry, &targets_path, MAX_SEQ_LENGTH).expect("targets");
    let queries = load_sequences(&registry, &queries_path, MAX_SEQ_LENGTH).expect("queries");

    let dir = out_dir("series");
    let mut meter = ConstantMeter::from_watts(5.0);
    let config = sweep_config(dir.clone(), WaitMode::Polling);

    for _ in 0..3 {
        run_sweep(
            &mut session,
            &registry,
            &mut meter,
            &targets,
            &queries,
            &config,
        )
        .expect("sweep");
    }

    let times = std::fs::read_to_string(dir.join(TIMES_FILE)).expect("times.txt");
    assert_eq!(times.lines().count(), 3);
    let energy = std::fs::read_to_string(dir.join(ENERGY_FILE)).expect("energy.txt");
    assert_eq!(energy.lines().count(), 3);

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn stale_buffer_id_fails_the_bind() {
    let (registry, _core, _session) = open_virtual(1 << 20);

    let t = registry.allocate(MAX_SEQ_LENGTH, false).expect("alloc");
    let tl = registry.allocate(4, false).expect("alloc");
    let q = registry.allocate(MAX_SEQ_LENGTH, false).expect("alloc");
    let ql = registry.allocate(4, false).expect("alloc");
    let out = registry.allocate(4, false).expect("alloc");

    let stale = q.id();
    drop(q);

    let err = JobBinding::new(
        &registry,
        t.id(),
        tl.id(),
        stale,
        ql.id(),
        out.id(),
        MAX_SEQ_LENGTH as u32,
    )
    .unwrap_err();
    assert!(matches!(err, DriverError::NotFound { .. }));
}
