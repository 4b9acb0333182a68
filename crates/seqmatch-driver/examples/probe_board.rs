//! Probe the board-side interfaces the driver uses
//!
//! Safe to run anywhere. Reports which device nodes and sysfs attributes are
//! present without touching the core.

use std::path::Path;

use seqmatch_driver::cma::{DEFAULT_POOL_DEVICE, DEFAULT_POOL_PHYS_ATTR, DEFAULT_POOL_SIZE_ATTR};
use seqmatch_driver::hw::regs;
use seqmatch_driver::power::ZCU104_POWER_PATH;
use seqmatch_driver::{HwmonMeter, PowerMeter, DEFAULT_DEVICE_PATH};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter("seqmatch_driver=info")
        .init();

    println!("🧬 seqmatch board probe\n");

    for (label, path) in [
        ("command device", DEFAULT_DEVICE_PATH),
        ("udmabuf pool", DEFAULT_POOL_DEVICE),
        ("pool phys attr", DEFAULT_POOL_PHYS_ATTR),
        ("pool size attr", DEFAULT_POOL_SIZE_ATTR),
        ("register window", "/dev/mem"),
        ("power rail", ZCU104_POWER_PATH),
    ] {
        let mark = if Path::new(path).exists() {
            "✅"
        } else {
            "❌"
        };
        println!("{mark} {label:16} {path}");
    }

    println!("\nRegister window : {} + {:#x}", regs::DEFAULT_BASE, regs::WINDOW_SIZE);
    println!("Completion IRQ  : line {}", regs::IRQ_LINE);

    let mut meter = HwmonMeter::zcu104();
    match meter.sample() {
        Ok(sample) => println!("Rail power      : {:.3} W", sample.microwatts as f64 / 1e6),
        Err(e) => println!("Rail power      : unavailable ({e})"),
    }
}
