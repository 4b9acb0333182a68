//! `seqmatch` — command-line interface for the ZCU104 scan accelerator.
//!
//! ```text
//! USAGE:
//!   seqmatch run <targets> <queries>   Score every pair, measure, persist
//!   seqmatch plan <targets> <queries>  Show the chunk partition for counts
//!   seqmatch status                    Probe the board-side interfaces
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use seqmatch_driver::cma::UdmabufHeap;
use seqmatch_driver::hw::{layout, plan, regs};
use seqmatch_driver::power::{PLATFORM_RAIL_OFFSET_WATTS, ZCU104_POWER_PATH};
use seqmatch_driver::prelude::*;
use seqmatch_driver::sweep::{DEFAULT_BUDGET_BYTES, SCORES_FILE};
use seqmatch_driver::virt::virtual_setup;
use seqmatch_driver::DEFAULT_DEVICE_PATH;

/// Arena behind the in-process core model.
const VIRTUAL_ARENA_BYTES: usize = 64 << 20;

#[derive(Parser)]
#[command(name = "seqmatch", about = "ZCU104 sequence-scan accelerator CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Score every (target, query) pair and persist the telemetry.
    Run(RunArgs),
    /// Show how a sweep of the given counts would be partitioned.
    Plan {
        /// Number of target sequences.
        targets: u32,
        /// Number of query sequences.
        queries: u32,
        /// DMA budget in bytes.
        #[arg(long, default_value_t = DEFAULT_BUDGET_BYTES)]
        budget: u64,
    },
    /// Probe the device nodes and sysfs attributes the driver uses.
    Status,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Target sequence file.
    targets: PathBuf,
    /// Query sequence file.
    queries: PathBuf,

    /// Command device node (kernel transport, the default).
    #[arg(long, default_value = DEFAULT_DEVICE_PATH, conflicts_with_all = ["mmio_base", "virtual_core"])]
    device: PathBuf,
    /// Map the register window at this physical base instead (hex).
    #[arg(long, value_parser = parse_hex, conflicts_with = "virtual_core")]
    mmio_base: Option<u64>,
    /// Run against the in-process core model instead of hardware.
    #[arg(long = "virtual")]
    virtual_core: bool,

    /// Completion mode for each chunk.
    #[arg(long, value_enum, default_value_t = WaitArg::Interrupt)]
    wait: WaitArg,
    /// DMA budget in bytes, live allocations included.
    #[arg(long, default_value_t = DEFAULT_BUDGET_BYTES)]
    budget: u64,
    /// Repeat the sweep until the measured window spans this many seconds.
    #[arg(long, default_value_t = 100)]
    min_exec_seconds: u64,
    /// Directory receiving times.txt, energy.txt and scores.bin.
    #[arg(long, default_value = ".")]
    out: PathBuf,

    /// hwmon attribute to read rail power from.
    #[arg(long, default_value = ZCU104_POWER_PATH, conflicts_with = "constant_watts")]
    power_hwmon: PathBuf,
    /// Assume this constant power draw instead of reading a meter.
    #[arg(long)]
    constant_watts: Option<f64>,
    /// Watts added for the rails the meter cannot see.
    #[arg(long, default_value_t = PLATFORM_RAIL_OFFSET_WATTS)]
    rail_offset_watts: f64,
}

#[derive(Clone, Copy, ValueEnum)]
enum WaitArg {
    /// Block on the completion interrupt.
    Interrupt,
    /// Poll the DONE bit.
    Polling,
    /// Dispatch and return immediately.
    FireAndForget,
}

impl From<WaitArg> for WaitMode {
    fn from(arg: WaitArg) -> Self {
        match arg {
            WaitArg::Interrupt => Self::Interrupt,
            WaitArg::Polling => Self::Polling,
            WaitArg::FireAndForget => Self::FireAndForget,
        }
    }
}

fn parse_hex(s: &str) -> Result<u64, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).map_err(|e| format!("bad hex address {s:?}: {e}"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Run(args) => cmd_run(args)?,
        Cmd::Plan {
            targets,
            queries,
            budget,
        } => cmd_plan(targets, queries, budget)?,
        Cmd::Status => cmd_status(),
    }

    Ok(())
}

fn cmd_run(args: RunArgs) -> Result<()> {
    let mut session = AcceleratorSession::new();
    let mut virtual_core = None;

    let registry = if args.virtual_core {
        let (registry, core, channel) = virtual_setup(VIRTUAL_ARENA_BYTES)?;
        session.open_command_device(Box::new(channel))?;
        virtual_core = Some(core);
        tracing::info!("Transport: in-process core model");
        registry
    } else {
        let registry = DmaRegistry::new(Box::new(UdmabufHeap::open_default()?));
        if let Some(base) = args.mmio_base {
            session.open_mmio(PhysAddr::new(base), regs::WINDOW_SIZE)?;
            tracing::info!("Transport: register window at {base:#x}");
        } else {
            session.open_kernel_device(&args.device)?;
            tracing::info!("Transport: {}", args.device.display());
        }
        registry
    };

    let targets = load_sequences(&registry, &args.targets, layout::MAX_SEQ_LENGTH)?;
    let queries = load_sequences(&registry, &args.queries, layout::MAX_SEQ_LENGTH)?;

    // The virtual core has no rail to read; default to a constant unless
    // the caller asked for a specific meter
    let mut meter: Box<dyn PowerMeter> = match args.constant_watts {
        Some(watts) => Box::new(ConstantMeter::from_watts(watts)),
        None if args.virtual_core => Box::new(ConstantMeter::from_watts(5.0)),
        None => Box::new(HwmonMeter::new(&args.power_hwmon)),
    };

    let config = SweepConfig {
        budget_bytes: args.budget,
        min_exec_time: Duration::from_secs(args.min_exec_seconds),
        wait_mode: args.wait.into(),
        rail_offset_watts: args.rail_offset_watts,
        output_dir: args.out.clone(),
    };

    let outcome = run_sweep(
        &mut session,
        &registry,
        meter.as_mut(),
        &targets,
        &queries,
        &config,
    )?;

    println!("Pairs        : {} x {}", targets.count(), queries.count());
    println!(
        "Chunks       : {} x {} queries",
        outcome.chunks, outcome.chunk_queries
    );
    println!("Repetitions  : {}", outcome.repetitions);
    println!("Sweep time   : {:?}", outcome.sweep_duration);
    println!("Power        : {:.3} W", outcome.watts);
    println!("Energy       : {:.6} J", outcome.joules);
    println!(
        "Scores       : {} cells -> {}",
        outcome.scores.len() / 4,
        args.out.join(SCORES_FILE).display()
    );

    drop(virtual_core);
    Ok(())
}

fn cmd_plan(targets: u32, queries: u32, budget: u64) -> Result<()> {
    let plan = plan::plan_chunks(targets, queries, budget, 0)?;

    println!("Pairs        : {targets} x {queries}");
    println!("Chunk width  : {} queries", plan.chunk_queries);
    println!("Chunks       : {}", plan.chunks.len());
    println!("Calibration  : x{}", plan.calibration_factor);
    println!(
        "Score block  : {} cells ({} bytes)",
        plan.score_cells,
        plan.score_cells * layout::CELL_BYTES
    );
    println!();

    for (i, chunk) in plan.chunks.iter().enumerate() {
        println!(
            "  [{i:3}] targets {:6}..{:<6} x queries {:6}..{:<6}",
            chunk.target_offset,
            chunk.target_offset + chunk.target_count,
            chunk.query_offset,
            chunk.query_offset + chunk.query_count,
        );
    }

    Ok(())
}

fn cmd_status() {
    let probes = [
        ("command device", DEFAULT_DEVICE_PATH),
        ("udmabuf pool", seqmatch_driver::cma::DEFAULT_POOL_DEVICE),
        ("pool phys attr", seqmatch_driver::cma::DEFAULT_POOL_PHYS_ATTR),
        ("register window", "/dev/mem"),
        ("power rail", ZCU104_POWER_PATH),
    ];

    for (label, path) in probes {
        let state = if std::path::Path::new(path).exists() {
            "present"
        } else {
            "missing"
        };
        println!("{label:16} {state:8} {path}");
    }

    println!();
    println!("Register base  : {}", regs::DEFAULT_BASE);
    println!("Window size    : {:#x}", regs::WINDOW_SIZE);
    println!("Completion IRQ : line {}", regs::IRQ_LINE);
    println!("Sequence stride: {} bases", layout::MAX_SEQ_LENGTH);
}
