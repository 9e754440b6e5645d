#![forbid(unsafe_code)]

//! `tm-sim run` executes a campaign across many seeds.
//! `tm-sim replay` replays one seed with its trace.

use std::env;
use std::process;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tm_core::config::SyncConfig;
use tm_sim::campaign::{CampaignConfig, replay_seed, run_campaign};
use tm_sim::{SimulationConfig, TraceEventKind};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "tm-sim: deterministic convergence simulation for tm sync",
    long_about = None
)]
struct Cli {
    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(
        about = "Run a simulation campaign across multiple seeds",
        after_help = "EXAMPLES:\n    # Run 100 seeds with defaults\n    tm-sim run --seeds 100\n\n\
                      # Harsher network\n    tm-sim run --seeds 200 --clients 6 --drop 30 --max-delay 4"
    )]
    Run(RunArgs),

    #[command(
        about = "Replay a single seed with detailed trace output",
        after_help = "EXAMPLES:\n    # Replay seed 42\n    tm-sim replay --seed 42 --trace"
    )]
    Replay(ReplayArgs),
}

#[derive(Args, Debug, Clone, Copy)]
struct WorldArgs {
    /// Number of simulated clients.
    #[arg(long, default_value = "3")]
    clients: usize,

    /// Rounds of activity per seed (one round is 100 ms of simulated time).
    #[arg(long, default_value = "60")]
    rounds: u64,

    /// Fault-free rounds after activity stops.
    #[arg(long, default_value = "40")]
    quiet_rounds: u64,

    /// Percent chance per round that a client acts.
    #[arg(long, default_value = "30")]
    action_rate: u8,

    /// Percent of calls lost in transit.
    #[arg(long, default_value = "10")]
    drop: u8,

    /// Percent of calls refused by the server.
    #[arg(long, default_value = "5")]
    refuse: u8,

    /// Maximum delivery delay in rounds.
    #[arg(long, default_value = "2")]
    max_delay: u8,

    /// Push debounce in simulated milliseconds.
    #[arg(long, default_value = "300")]
    push_delay_ms: u64,

    /// Pull interval in simulated milliseconds.
    #[arg(long, default_value = "1000")]
    pull_interval_ms: u64,
}

impl WorldArgs {
    fn campaign(self, seed_start: u64, seeds: u64) -> CampaignConfig {
        CampaignConfig {
            seed_range: seed_start..seed_start.saturating_add(seeds),
            client_count: self.clients,
            rounds: self.rounds,
            quiet_rounds: self.quiet_rounds,
            action_rate_percent: self.action_rate,
            fault_drop_percent: self.drop,
            fault_error_percent: self.refuse,
            fault_max_delay: self.max_delay,
            sync: SyncConfig {
                push_delay_ms: self.push_delay_ms,
                pull_interval_ms: self.pull_interval_ms,
            },
        }
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Number of seeds to run.
    #[arg(long, default_value = "100")]
    seeds: u64,

    /// Starting seed value.
    #[arg(long, default_value = "0")]
    seed_start: u64,

    #[command(flatten)]
    world: WorldArgs,
}

#[derive(Args, Debug)]
struct ReplayArgs {
    /// Seed to replay.
    #[arg(long)]
    seed: u64,

    /// Print every trace event.
    #[arg(long)]
    trace: bool,

    #[command(flatten)]
    world: WorldArgs,
}

#[derive(Debug, Serialize)]
struct ReplayOutput {
    config: SimulationConfig,
    trace_events: usize,
    tasks: usize,
    faults_injected: usize,
    converged: bool,
    oracle_passed: bool,
    violations: Vec<String>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("TM_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "tm_core=debug,tm_sim=debug,info"
        } else {
            "warn"
        })
    });

    let format = env::var("TM_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry.with(fmt::layer().json().with_ansi(false)).init();
        }
        _ => {
            registry.with(fmt::layer().compact()).init();
        }
    }
}

fn run(args: &RunArgs, json: bool) -> Result<bool> {
    let config = args.world.campaign(args.seed_start, args.seeds);
    let report = run_campaign(&config)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "campaign seeds_run={} clients={} rounds={} drop={}% refuse={}%",
            report.seeds_run, args.world.clients, args.world.rounds, args.world.drop, args.world.refuse
        );
        println!(
            "results passed={} failed={} interesting_states={} all_passed={}",
            report.seeds_passed,
            report.failures.len(),
            report.interesting_states_reached,
            report.all_passed()
        );
        for failure in report.failures.iter().take(5) {
            println!("failure seed={} violations={}", failure.seed, failure.violations.len());
            for violation in failure.violations.iter().take(3) {
                println!("  - {violation}");
            }
        }
        if report.failures.len() > 5 {
            println!("failures_truncated count={}", report.failures.len() - 5);
        }
        if let Some(seed) = report.first_failure {
            println!("hint: tm-sim replay --seed {seed} --trace");
        }
    }
    Ok(report.all_passed())
}

fn replay(args: &ReplayArgs, json: bool) -> Result<bool> {
    let config = args.world.campaign(args.seed, 1);
    let detail = replay_seed(args.seed, &config)?;
    let result = &detail.result;

    let out = ReplayOutput {
        config: config.sim_config_for_seed(args.seed),
        trace_events: result.trace.len(),
        tasks: result.server.len(),
        faults_injected: result.faults_injected,
        converged: result.convergence.converged,
        oracle_passed: detail.oracle.passed,
        violations: detail.oracle.violations.iter().map(ToString::to_string).collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("replay seed={} clients={} rounds={}", args.seed, args.world.clients, args.world.rounds);
        println!(
            "result converged={} oracle_passed={} tasks={} trace_events={} faults={}",
            out.converged, out.oracle_passed, out.tasks, out.trace_events, out.faults_injected
        );
        if args.trace {
            for event in &result.trace {
                let line = match &event.kind {
                    TraceEventKind::Act(action) => format!("act {action:?}"),
                    TraceEventKind::Send {
                        seq,
                        call,
                        delay_rounds,
                        fault,
                    } => format!("send #{seq} {call} delay={delay_rounds} fault={fault:?}"),
                    TraceEventKind::Settle { seq, ok } => format!("settle #{seq} ok={ok}"),
                    TraceEventKind::Refresh => "refresh".to_string(),
                };
                println!("round={:<4} client={} {line}", event.round, event.client);
            }
        }
        for state in &result.states {
            println!("client id={} tasks={} unsent={}", state.id, state.records.len(), state.unsent);
        }
        for violation in &out.violations {
            println!("violation={violation}");
        }
    }
    Ok(detail.oracle.passed)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let passed = match &cli.command {
        Command::Run(args) => run(args, cli.json)?,
        Command::Replay(args) => replay(args, cli.json)?,
    };

    // Exit code 1 on any failure for CI integration
    if !passed {
        process::exit(1);
    }
    Ok(())
}
