//! Redzone Probe
//!
//! Exercises the execution memory subsystem end to end in a real process.
//!
//! # Usage
//!
//! ```text
//! redzone-probe [OPTIONS] <COMMAND>
//!
//! Commands:
//!   layout    Initialize from REDZONE_* variables and print the layout
//!   overflow  Write through a region into its guard zone
//!   scan      Read a whole region, guard zone included
//!
//! Options:
//!   -v, --verbose  Increase verbosity (can be repeated)
//!   -h, --help     Print help information
//!   -V, --version  Print version information
//! ```
//!
//! `overflow` exits 0 when every write lands (the handler ceded what was
//! needed) and 1 when the handler declares the region exhausted. `scan`
//! reads the way an external collector would; it only completes when the
//! zones were installed readable.

use std::process::ExitCode;

use clap::{Parser, Subcommand};

use redzone_runtime::{log, LogLevel, MemoryConfig, MemoryManager, RegionKind};

/// Execution memory probe
#[derive(Parser)]
#[command(name = "redzone-probe")]
#[command(version)]
#[command(about = "Exercise guard zones and print the execution memory layout", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolved layout
    Layout,

    /// Write words from a region's min up into its guard zone
    Overflow {
        /// Region to overflow (heap, det or nondet)
        #[arg(long)]
        region: RegionKind,

        /// Bytes to write past the start of the guard zone
        #[arg(long, value_name = "BYTES")]
        into_zone: usize,
    },

    /// Read every word from a region's min up to its end
    Scan {
        /// Region to read (heap, det or nondet)
        #[arg(long)]
        region: RegionKind,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = MemoryConfig::from_env();
    match cli.verbose {
        0 => {}
        1 => config.log.level = LogLevel::Debug,
        _ => config.log.level = LogLevel::Trace,
    }

    match cli.command {
        Commands::Layout => {
            let memory = redzone_runtime::init(config);
            println!("{}", memory.report());
            memory.shutdown();
            ExitCode::SUCCESS
        }
        Commands::Overflow { region, into_zone } => {
            let memory = redzone_runtime::init(config);
            let code = overflow(&memory, region, into_zone);
            memory.shutdown();
            code
        }
        Commands::Scan { region } => {
            let memory = redzone_runtime::init(config);
            let code = scan(&memory, region);
            memory.shutdown();
            code
        }
    }
}

fn overflow(memory: &MemoryManager, kind: RegionKind, into_zone: usize) -> ExitCode {
    let region = *memory.region(kind);
    if region.is_absent() {
        log::error(format!("{} is not part of the arena", kind));
        return ExitCode::from(2);
    }
    let Some(zone) = memory.zone(kind) else {
        log::error(format!("{} has no guard zone", kind));
        return ExitCode::from(2);
    };

    let word = std::mem::size_of::<usize>();
    let target = (zone.zone_start + into_zone).min(region.end);
    let words = (target - region.min) / word;
    let base = region.min as *mut usize;

    for i in 0..words {
        // Addresses below `end` belong to this region; faults are handled
        // by the installed handler.
        unsafe { base.add(i).write_volatile(i) };
    }
    memory.record_high_water(kind, region.min + words * word);

    let after = memory.zone(kind).unwrap_or(zone);
    println!(
        "resumed: {} zone_start={:#x} zone_left={}",
        kind, after.zone_start, after.zone_left
    );
    ExitCode::SUCCESS
}

fn scan(memory: &MemoryManager, kind: RegionKind) -> ExitCode {
    let region = *memory.region(kind);
    if region.is_absent() {
        log::error(format!("{} is not part of the arena", kind));
        return ExitCode::from(2);
    }

    let words = (region.end - region.min) / std::mem::size_of::<usize>();
    let base = region.min as *const usize;
    let mut sum = 0usize;
    for i in 0..words {
        sum = sum.wrapping_add(unsafe { base.add(i).read_volatile() });
    }

    let zone_left = memory.zone(kind).map_or(0, |zone| zone.zone_left);
    println!("scanned: {} words={} sum={} zone_left={}", kind, words, sum, zone_left);
    ExitCode::SUCCESS
}
