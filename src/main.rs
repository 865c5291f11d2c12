use anyhow::Result;
use clap::Parser;
use std::io::Write;
use std::process::ExitCode;

mod cli;
mod config;
mod error;
mod external;
mod legend;
mod logging;
mod orchestrator;
mod pipeline;
mod sweep;
mod template;

use cli::{Command, RootArgs, SweepArgs};
use config::Overrides;
use pipeline::RunOptions;

fn main() -> ExitCode {
    let args = RootArgs::parse();
    logging::init(args.verbose);
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(error::exit_code_for(&err))
        }
    }
}

fn run(args: RootArgs) -> Result<()> {
    match args.command {
        Command::Run(run) => sweep(&run.sweep, true),
        Command::Plan(plan) => sweep(&plan.sweep, false),
        Command::Merge(merge) => {
            let merged = template::merge(&merge.file)?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(merged.render().as_bytes())?;
            stdout.flush()?;
            Ok(())
        }
    }
}

fn sweep(args: &SweepArgs, execute_jobs: bool) -> Result<()> {
    let options = RunOptions {
        settings: args.settings.clone(),
        run_dir: args.run_dir.clone(),
        overrides: Overrides {
            threads: args.threads,
            keep_all: args.keep_all,
        },
        allow_dirty: args.allow_dirty,
        execute_jobs,
    };
    pipeline::run(&options)?;
    Ok(())
}
