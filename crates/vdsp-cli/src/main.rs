// SPDX-License-Identifier: AGPL-3.0-only

//! `vdsp`: command-line front end for the accelerator host stack.
//!
//! ```text
//! USAGE:
//!   vdsp selftest                Boot, exchange, load a library, recover
//!   vdsp layout                  Print the shared command region layout
//!   vdsp heaps                   List the buffer heaps
//!   vdsp bench [-n N] [-s SIZE]  Measure request round trips
//! ```
//!
//! Every command runs against the in-process simulated accelerator, with
//! settings taken from `VDSP_*` environment variables.

use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, Subcommand};
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;
use vdsp_chip::comm::{cmd, queue_offset, sync, CMD_STRIDE, COMM_REGION_SIZE};
use vdsp_chip::library::LibraryPackage;
use vdsp_driver::prelude::*;

#[derive(Parser)]
#[command(name = "vdsp", about = "DSP accelerator host stack", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the whole lifecycle against the simulated accelerator.
    Selftest {
        /// Skip the forced timeout and reboot.
        #[arg(long)]
        no_recovery: bool,
    },
    /// Print the command region layout.
    Layout,
    /// List the registered buffer heaps.
    Heaps,
    /// Measure submission round trips.
    Bench {
        /// Requests to send.
        #[arg(short = 'n', long, default_value_t = 1000)]
        iterations: u32,
        /// Payload size in bytes; above 16 the payload is staged.
        #[arg(short, long, default_value_t = 16)]
        size: usize,
        /// Queue priority.
        #[arg(short, long, default_value_t = 0)]
        priority: u32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();
    let config = VdspConfig::from_env().context("reading VDSP_* settings")?;

    match cli.command {
        Cmd::Selftest { no_recovery } => cmd_selftest(config, !no_recovery)?,
        Cmd::Layout => cmd_layout(&config),
        Cmd::Heaps => cmd_heaps(config)?,
        Cmd::Bench {
            iterations,
            size,
            priority,
        } => cmd_bench(config, iterations, size, priority)?,
    }

    Ok(())
}

fn attach(config: VdspConfig) -> Result<(std::sync::Arc<SimulatedDsp>, Device)> {
    let (sim, platform) = SimulatedDsp::platform(&config).context("building the simulator")?;
    let device = Device::attach(config, platform).context("attaching the device")?;
    Ok((sim, device))
}

fn step(name: &str, f: impl FnOnce() -> Result<()>) -> Result<()> {
    let start = Instant::now();
    f().with_context(|| format!("selftest step '{name}'"))?;
    println!("  ok  {name:<28} {:>8.2?}", start.elapsed());
    Ok(())
}

fn cmd_selftest(config: VdspConfig, recovery: bool) -> Result<()> {
    let config = config
        .with_cmd_timeout(Duration::from_millis(500))
        .with_boot_timeout(Duration::from_secs(2));
    let (sim, device) = attach(config)?;

    println!("vdsp selftest");
    println!("=============");

    let session = device.open().context("first open")?;
    step("boot handshake", || {
        ensure!(device.link_state() == LinkState::Operational, "link not up");
        println!("      queues {:?}", device.queue_priorities());
        Ok(())
    })?;

    step("inline echo", || {
        let reply = session.submit(&Request::new(&b"ping"[..]).with_output(4))?;
        ensure!(reply.output.as_ref() == b"ping", "echo mismatch: {:?}", reply.output);
        Ok(())
    })?;

    step("staged echo", || {
        let payload: Vec<u8> = (0..=255u8).collect();
        let reply = session.submit(&Request::new(payload.clone()).with_output(payload.len()))?;
        ensure!(reply.output.as_ref() == &payload[..], "staged echo mismatch");
        Ok(())
    })?;

    step("buffer write-back", || {
        let id = session.alloc_from(HeapKind::Unified, 64, BufferAttr::default())?;
        session.submit(&Request::new(&b"written by dsp"[..]).with_buffer(BufferRef::read_write(id)))?;
        let view = session.map_user(id)?;
        ensure!(view.read(0, 14)? == b"written by dsp", "buffer not written");
        session.unmap_user(id)?;
        session.free(id)?;
        Ok(())
    })?;

    step("library load and route", || {
        let mut code = vec![0u8; 64];
        code[8..12].copy_from_slice(&0x10u32.to_le_bytes());
        let package = LibraryPackage::build(&code, 0x100, 0x20, &[8]);
        let id = session.alloc_from(HeapKind::Unified, package.len(), BufferAttr::default())?;
        session.map_user(id)?.write(0, &package)?;
        session.unmap_user(id)?;

        session.load_library("selftest", id)?;
        let req = Request::new(&b"lib"[..]).with_output(3).with_namespace("selftest")?;
        ensure!(session.submit(&req)?.output.as_ref() == b"lib", "library echo mismatch");
        session.unload_library("selftest")?;
        ensure!(
            session.library_state("selftest")? == LibraryState::Idle,
            "library still loaded"
        );
        session.free(id)?;
        Ok(())
    })?;

    if recovery {
        step("timeout recovery", || {
            sim.hang_next(1);
            match session.submit(&Request::new(&b"hang"[..])) {
                Err(VdspError::Timeout { .. }) => {}
                other => bail!("expected a timeout, got {other:?}"),
            }
            ensure!(device.generation() == 1, "no reboot recorded");
            let reply = session.submit(&Request::new(&b"back"[..]).with_output(4))?;
            ensure!(reply.generation == 1, "reply from a stale generation");
            Ok(())
        })?;
    }

    step("close and power off", || {
        session.close()?;
        ensure!(!sim.is_powered(), "accelerator still powered");
        Ok(())
    })?;

    let stats = sim.stats();
    println!();
    println!(
        "boots {}  commands {}  loads {}  unloads {}  coredumps {}",
        stats.boots, stats.commands, stats.loads, stats.unloads, stats.coredumps
    );
    Ok(())
}

fn cmd_layout(config: &VdspConfig) {
    println!("Command region: {COMM_REGION_SIZE:#x} bytes, {CMD_STRIDE:#x} per queue");
    println!();
    println!("  {:>5}  {:>8}  {:>8}", "queue", "offset", "priority");
    for (i, prio) in config.queue_priorities.iter().enumerate() {
        println!("  {i:>5}  {:#08x}  {prio:>8}", queue_offset(i));
    }
    println!();
    println!("Sync word at {:#x}; handshake data at {:#x} (v1) / {:#x} (v2)",
        sync::OFFSET, sync::V1_DATA_OFFSET, sync::V2_DATA_OFFSET);
    println!();
    println!("Command slot:");
    for (name, offset) in [
        ("flags", cmd::FLAGS),
        ("in_data_size", cmd::IN_DATA_SIZE),
        ("out_data_size", cmd::OUT_DATA_SIZE),
        ("buffer_size", cmd::BUFFER_SIZE),
        ("in_data", cmd::IN_DATA),
        ("out_data", cmd::OUT_DATA),
        ("buffer_data", cmd::BUFFER_DATA),
        ("nsid", cmd::NSID),
    ] {
        println!("  {offset:#06x}  {name}");
    }
    println!("  {:#06x}  (end)", cmd::END);
    println!();
    println!(
        "IOVA window {:#x}..{:#x}, firmware region {:#x} bytes",
        config.iova_base,
        config.iova_base + config.iova_size,
        config.firmware_region_size
    );
}

fn cmd_heaps(config: VdspConfig) -> Result<()> {
    let (_sim, device) = attach(config)?;
    println!("  {:>2}  {:<10}  {:<10}  {}", "id", "heap", "contiguous", "exportable");
    for heap in device.heaps() {
        println!(
            "  {:>2}  {:<10}  {:<10}  {}",
            heap.id,
            heap.kind.to_string(),
            heap.contiguous,
            heap.exportable
        );
    }
    Ok(())
}

fn cmd_bench(config: VdspConfig, iterations: u32, size: usize, priority: u32) -> Result<()> {
    ensure!(iterations > 0, "need at least one iteration");
    let (_sim, device) = attach(config)?;
    let session = device.open()?;
    let payload = vec![0xa5u8; size];
    let request = Request::new(payload).with_output(size).with_priority(priority);

    // Warm up the staging path once.
    session.submit(&request)?;

    let mut samples = Vec::with_capacity(iterations as usize);
    let total = Instant::now();
    for _ in 0..iterations {
        let start = Instant::now();
        session.submit(&request)?;
        samples.push(start.elapsed());
    }
    let elapsed = total.elapsed();
    samples.sort_unstable();
    info!("bench: {iterations} requests in {elapsed:?}");

    let pick = |q: f64| samples[((samples.len() - 1) as f64 * q) as usize];
    println!("Round trip, {size} byte payload, priority {priority}:");
    println!("  requests   {iterations}");
    println!("  min        {:?}", samples[0]);
    println!("  median     {:?}", pick(0.5));
    println!("  p99        {:?}", pick(0.99));
    println!("  max        {:?}", samples[samples.len() - 1]);
    println!(
        "  throughput {:.0} req/s",
        f64::from(iterations) / elapsed.as_secs_f64()
    );
    Ok(())
}
