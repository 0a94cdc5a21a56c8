mod area;
mod config;
mod error;
mod firmware;
mod job;
mod lanes;
mod logging;
mod mailbox;
mod persist;
mod queue;
mod roster;
mod server;
mod sim;
mod sync_log;
mod types;
mod work_mgr;

use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::error;

use crate::config::{ServeArgs, ServeConfig};

#[derive(Parser)]
#[command(
    name = "robot_dispatch",
    about = "Work dispatch server for a fleet of programmable robots",
    after_help = "Without a command the fleet demo runs."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Simulated fleet against a seeded storage area, with a summary.
    Demo,

    /// One simulated run, printed as CSV.
    Bench {
        /// Robots in the fleet (default 4)
        robots: Option<usize>,
        /// Decisions per robot (default 50)
        rounds: Option<usize>,
        /// Simulated job time in milliseconds (default 1)
        work_ms: Option<u64>,
        flags: Vec<RunFlag>,
    },

    /// Sweep robot and round sets, one CSV row per combination.
    Stress {
        /// Comma-separated robot counts, "-" for the default 1,2,4,8
        #[arg(value_parser = parse_set)]
        robot_sets: Option<NumberSet>,
        /// Comma-separated round counts, "-" for the default 20,50
        #[arg(value_parser = parse_set)]
        round_sets: Option<NumberSet>,
        /// Simulated job time in milliseconds (default 1)
        work_ms: Option<u64>,
        flags: Vec<RunFlag>,
    },

    /// Serve robot reports, firmware and the sync feed over HTTP.
    Serve(ServeArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum RunFlag {
    /// Report invariant violations on stderr
    Validate,
    /// One robot stops reporting halfway through
    Offline,
}

/// A comma-separated list; `None` keeps the default.
#[derive(Clone, Debug)]
struct NumberSet(Option<Vec<usize>>);

fn parse_set(arg: &str) -> Result<NumberSet, String> {
    if arg == "-" {
        return Ok(NumberSet(None));
    }
    let mut values = Vec::new();
    for part in arg.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(format!("empty entry in {arg:?}"));
        }
        let value = part
            .parse::<usize>()
            .map_err(|err| format!("{part:?}: {err}"))?;
        values.push(value);
    }
    Ok(NumberSet(Some(values)))
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn serve(args: &ServeArgs) -> ExitCode {
    let config = match ServeConfig::resolve(args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Config error: {err}");
            return ExitCode::from(2);
        }
    };
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to start runtime");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(server::run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "server stopped");
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Demo) {
        Command::Demo => {
            logging::init("warn");
            exit_code(sim::run_demo())
        }
        Command::Bench {
            robots,
            rounds,
            work_ms,
            flags,
        } => {
            logging::init("warn");
            exit_code(sim::run_benchmark(
                robots,
                rounds,
                work_ms,
                flags.contains(&RunFlag::Validate),
                flags.contains(&RunFlag::Offline),
            ))
        }
        Command::Stress {
            robot_sets,
            round_sets,
            work_ms,
            flags,
        } => {
            logging::init("warn");
            exit_code(sim::run_stress(
                robot_sets.and_then(|set| set.0),
                round_sets.and_then(|set| set.0),
                work_ms,
                flags.contains(&RunFlag::Validate),
                flags.contains(&RunFlag::Offline),
            ))
        }
        Command::Serve(args) => {
            logging::init("info");
            serve(&args)
        }
    }
}
