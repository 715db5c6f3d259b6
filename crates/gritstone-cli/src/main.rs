//! Gritstone command-line driver.
//!
//! Runs harness phases against the built-in in-memory store. This is the
//! self-exercise mode: it validates the harness itself and demonstrates the
//! phase flow end to end. Production runs against a real store wire their
//! own `StoreClient` through the library API instead.
//!
//! # Quick Start
//!
//! ```bash
//! # Populate, exercise, check and clean 640 indices with seed 42
//! gritstone run --seed 42 --count 640 --phases populate,exercise,check,clean
//!
//! # One-pair smoke run
//! gritstone smoke --seed 42
//!
//! # Exercise racing a table drop
//! gritstone drop-race --seed 42 --count 640 --drop-after-ms 20
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use gritstone::{
    Consistency, DropTableScenario, Durability, Harness, HarnessConfig, MemStore, MemStoreConfig,
    PhaseName, PhaseReport, SchemaDescriptor,
};

/// Gritstone - deterministic stress testing for key-value stores.
#[derive(Parser)]
#[command(name = "gritstone")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct CommonArgs {
    /// Seed fixing all pseudo-randomness for the run.
    #[arg(long, default_value_t = 0)]
    seed: i64,

    /// First index of the range (must be block-aligned).
    #[arg(long, default_value_t = 0)]
    start: i64,

    /// Number of indices (must be block-aligned).
    #[arg(long, default_value_t = 640)]
    count: i64,

    /// Worker threads (thread pairs for exercise).
    #[arg(long, default_value_t = 2)]
    threads: usize,

    /// Read consistency (ABSOLUTE, NONE_REQUIRED, NONE_REQUIRED_NO_MASTER,
    /// or lag=<ms>,timeout=<ms>).
    #[arg(long, default_value = "NONE_REQUIRED")]
    consistency: String,

    /// Write durability (COMMIT_NO_SYNC, COMMIT_SYNC, COMMIT_WRITE_NO_SYNC,
    /// or masterSync=..,replicaSync=..,replicaAck=..).
    #[arg(long, default_value = "COMMIT_NO_SYNC")]
    durability: String,

    /// Target total throughput in operations per second.
    #[arg(long)]
    throttle: Option<u64>,

    /// Probability of injected transient store faults.
    #[arg(long, default_value_t = 0.0)]
    fault_probability: f64,

    /// Emit phase reports as JSON.
    #[arg(long)]
    json: bool,

    /// Schema-descriptor hand-off file (written by populate, read by
    /// check/clean).
    #[arg(long)]
    descriptor: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a sequence of phases against the in-memory store.
    Run {
        #[command(flatten)]
        common: CommonArgs,

        /// Comma-separated phases: populate,exercise,check,clean.
        #[arg(long, default_value = "populate,exercise,check,clean")]
        phases: String,

        /// Percentage of exercise operations that are reads.
        #[arg(long, default_value_t = 50)]
        read_percent: u8,
    },

    /// One-block end-to-end run with two paired writers.
    Smoke {
        /// Seed fixing all pseudo-randomness for the run.
        #[arg(long, default_value_t = 42)]
        seed: i64,
    },

    /// Exercise phase racing a concurrent table drop.
    DropRace {
        #[command(flatten)]
        common: CommonArgs,

        /// Percentage of exercise operations that are reads.
        #[arg(long, default_value_t = 50)]
        read_percent: u8,

        /// Delay before the drop is issued.
        #[arg(long, default_value_t = 20)]
        drop_after_ms: u64,

        /// Watchdog budget for the drop itself.
        #[arg(long, default_value_t = 10_000)]
        drop_budget_ms: u64,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            common,
            phases,
            read_percent,
        } => {
            let phases = parse_phases(&phases)?;
            run_phases(&common, read_percent, &phases)
        }
        Commands::Smoke { seed } => {
            let common = CommonArgs {
                seed,
                start: 0,
                count: 64,
                threads: 1,
                consistency: "NONE_REQUIRED".to_string(),
                durability: "COMMIT_NO_SYNC".to_string(),
                throttle: None,
                fault_probability: 0.0,
                json: false,
                descriptor: None,
            };
            run_phases(
                &common,
                50,
                &[
                    PhaseName::Populate,
                    PhaseName::Exercise,
                    PhaseName::Check,
                    PhaseName::Clean,
                ],
            )
        }
        Commands::DropRace {
            common,
            read_percent,
            drop_after_ms,
            drop_budget_ms,
        } => run_drop_race(&common, read_percent, drop_after_ms, drop_budget_ms),
    }
}

fn parse_phases(list: &str) -> Result<Vec<PhaseName>> {
    list.split(',')
        .map(|name| match name.trim() {
            "populate" => Ok(PhaseName::Populate),
            "exercise" => Ok(PhaseName::Exercise),
            "check" => Ok(PhaseName::Check),
            "clean" => Ok(PhaseName::Clean),
            other => anyhow::bail!("unknown phase {other:?}"),
        })
        .collect()
}

fn build_config(common: &CommonArgs, read_percent: u8) -> Result<HarnessConfig> {
    let consistency: Consistency = common
        .consistency
        .parse()
        .with_context(|| format!("bad --consistency {:?}", common.consistency))?;
    let durability: Durability = common
        .durability
        .parse()
        .with_context(|| format!("bad --durability {:?}", common.durability))?;

    let mut config = HarnessConfig::default()
        .with_seed(common.seed)
        .with_read_percent(read_percent)
        .with_consistency(consistency)
        .with_durability(durability);
    if let Some(ops_per_sec) = common.throttle {
        config = config.with_throttle(ops_per_sec);
    }
    Ok(config)
}

fn build_store(common: &CommonArgs) -> Arc<MemStore> {
    let store_config = if common.fault_probability > 0.0 {
        MemStoreConfig::with_faults(common.fault_probability, common.seed as u64)
    } else {
        MemStoreConfig::reliable()
    };
    Arc::new(MemStore::new(store_config))
}

fn emit(report: &PhaseReport, json: bool) -> Result<()> {
    if json {
        println!("{}", report.to_json()?);
    } else {
        println!("{report}");
    }
    Ok(())
}

fn run_phases(common: &CommonArgs, read_percent: u8, phases: &[PhaseName]) -> Result<()> {
    let config = build_config(common, read_percent)?;
    let store = build_store(common);
    let harness = Harness::new(Arc::clone(&store), config)?;

    let mut all_passed = true;
    for phase in phases {
        let report = match phase {
            PhaseName::Populate => {
                let report = harness.populate(common.start, common.count, common.threads)?;
                if let Some(path) = &common.descriptor {
                    SchemaDescriptor {
                        table: "gritstone_records".to_string(),
                        schema_id: 1,
                        seed: common.seed,
                    }
                    .save(path)?;
                }
                report
            }
            PhaseName::Exercise => harness.exercise(common.start, common.count, common.threads)?,
            PhaseName::Check | PhaseName::Clean => {
                if let Some(path) = &common.descriptor {
                    let descriptor = SchemaDescriptor::load(path)?;
                    if descriptor.seed != common.seed {
                        anyhow::bail!(
                            "descriptor seed {} does not match --seed {}",
                            descriptor.seed,
                            common.seed
                        );
                    }
                }
                match phase {
                    PhaseName::Check => harness.check(common.start, common.count, common.threads)?,
                    _ => harness.clean(common.start, common.count, common.threads)?,
                }
            }
        };
        all_passed &= report.passed;
        emit(&report, common.json)?;
    }

    if all_passed {
        println!("PASSED ({} phases)", phases.len());
        Ok(())
    } else {
        anyhow::bail!("one or more phases failed; reproduce with --seed {}", common.seed)
    }
}

fn run_drop_race(
    common: &CommonArgs,
    read_percent: u8,
    drop_after_ms: u64,
    drop_budget_ms: u64,
) -> Result<()> {
    let config = build_config(common, read_percent)?;
    let op_timeout = config.op_timeout;
    let store = build_store(common);
    let scenario = Arc::new(DropTableScenario::new());

    let harness = Harness::new(Arc::clone(&store), config)?
        .with_interceptor(Box::new(Arc::clone(&scenario)));

    let populate = harness.populate(common.start, common.count, common.threads)?;
    emit(&populate, common.json)?;

    let driver = {
        let scenario = Arc::clone(&scenario);
        let store = Arc::clone(&store);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(drop_after_ms));
            scenario.run_drop(store, op_timeout, Duration::from_millis(drop_budget_ms))
        })
    };

    let exercise = harness.exercise(common.start, common.count, common.threads)?;
    emit(&exercise, common.json)?;

    let drop_result = driver.join().expect("drop driver panicked");
    if let Err(err) = &drop_result {
        println!("table drop failed: {err}");
    }

    if populate.passed && exercise.passed && drop_result.is_ok() {
        println!("PASSED (drop race)");
        Ok(())
    } else {
        anyhow::bail!("drop-race scenario failed; reproduce with --seed {}", common.seed)
    }
}
