//! Sweep a handful of sequence pairs on the in-process core model
//!
//! Runs the whole stack (DMA staging, session, command channel, measured
//! sweep) with no board attached.

use seqmatch_driver::hw::layout::MAX_SEQ_LENGTH;
use seqmatch_driver::prelude::*;
use seqmatch_driver::virt::virtual_setup;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("seqmatch_driver=debug")
        .init();

    println!("🧬 seqmatch virtual sweep\n");

    let (registry, _core, channel) = virtual_setup(16 << 20)?;
    let mut session = AcceleratorSession::new();
    session.open_command_device(Box::new(channel))?;

    // Stage a tiny data set through the normal file path
    let dir = std::env::temp_dir();
    let targets_path = dir.join("seqmatch-demo-targets.fq");
    let queries_path = dir.join("seqmatch-demo-queries.fq");
    std::fs::write(&targets_path, "@t0\nAAACGTAA\n@t1\nACGTTTTT\n")?;
    std::fs::write(&queries_path, "@q0\nACGT\n@q1\nGATTACA\n")?;

    let targets = load_sequences(&registry, &targets_path, MAX_SEQ_LENGTH)?;
    let queries = load_sequences(&registry, &queries_path, MAX_SEQ_LENGTH)?;
    println!(
        "📤 Staged {} targets x {} queries\n",
        targets.count(),
        queries.count()
    );

    let mut meter = ConstantMeter::from_watts(5.0);
    let config = SweepConfig {
        min_exec_time: std::time::Duration::from_millis(50),
        wait_mode: WaitMode::Interrupt,
        output_dir: dir.join("seqmatch-demo-out"),
        ..SweepConfig::default()
    };

    let outcome = run_sweep(
        &mut session,
        &registry,
        &mut meter,
        &targets,
        &queries,
        &config,
    )?;

    println!(
        "✅ {} chunk(s) x {} repetition(s)",
        outcome.chunks, outcome.repetitions
    );
    println!(
        "   {:?} per sweep, {:.3} W, {:.6} J",
        outcome.sweep_duration, outcome.watts, outcome.joules
    );

    println!("\nBest-match end positions:");
    let cells: Vec<u32> = outcome
        .scores
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    for (ti, tdesc) in targets.descriptions().iter().enumerate() {
        for (qi, qdesc) in queries.descriptions().iter().enumerate() {
            let cell = cells[ti * queries.count() as usize + qi];
            println!("  {tdesc} x {qdesc}: {cell}");
        }
    }

    println!("\n🎉 Sweep complete (telemetry in {})", config.output_dir.display());
    Ok(())
}
