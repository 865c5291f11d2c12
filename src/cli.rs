//! CLI argument parsing.
use crate::config::DEFAULT_SETTINGS_FILE;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "megasweep",
    version,
    about = "Parameter sweeps over detector geometries and simulation sources",
    after_help = "Examples:\n  megasweep run --settings sweep.yaml --run-dir /scratch/run1\n  megasweep plan --settings sweep.yaml --run-dir /tmp/preview\n  megasweep merge Detector.geo.setup",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    /// Log at debug level (MEGASWEEP_LOG overrides)
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Run(RunArgs),
    Plan(PlanArgs),
    Merge(MergeArgs),
}

/// Inputs shared by `run` and `plan`.
#[derive(Args, Debug, Clone)]
pub struct SweepArgs {
    /// YAML settings document
    #[arg(long, value_name = "FILE", default_value = DEFAULT_SETTINGS_FILE)]
    pub settings: PathBuf,

    /// Directory receiving every generated document and log
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub run_dir: PathBuf,

    /// Concurrency limit (overrides the settings document)
    #[arg(long, value_name = "N")]
    pub threads: Option<usize>,

    /// Keep intermediate simulation files
    #[arg(long)]
    pub keep_all: bool,

    /// Accept a run directory that already holds other files
    #[arg(long)]
    pub allow_dirty: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Generate, validate, and run every combination")]
pub struct RunArgs {
    #[command(flatten)]
    pub sweep: SweepArgs,
}

#[derive(Parser, Debug)]
#[command(about = "Generate and validate documents without running jobs")]
pub struct PlanArgs {
    #[command(flatten)]
    pub sweep: SweepArgs,
}

#[derive(Parser, Debug)]
#[command(about = "Print a geometry template with every include inlined")]
pub struct MergeArgs {
    /// Geometry template to flatten
    #[arg(value_name = "FILE")]
    pub file: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_defaults_and_overrides_parse() {
        let args = RootArgs::try_parse_from(["megasweep", "run", "--threads", "3", "--keep-all"])
            .expect("parse");
        let Command::Run(run) = args.command else {
            panic!("expected run");
        };
        assert_eq!(run.sweep.settings, PathBuf::from("config.yaml"));
        assert_eq!(run.sweep.run_dir, PathBuf::from("."));
        assert_eq!(run.sweep.threads, Some(3));
        assert!(run.sweep.keep_all);
        assert!(!run.sweep.allow_dirty);
    }

    #[test]
    fn verbose_is_global() {
        let args =
            RootArgs::try_parse_from(["megasweep", "merge", "a.geo", "--verbose"]).expect("parse");
        assert!(args.verbose);
        assert!(matches!(
            &args.command,
            Command::Merge(MergeArgs { file }) if file.as_path() == std::path::Path::new("a.geo")
        ));
    }

    #[test]
    fn a_subcommand_is_required() {
        assert!(RootArgs::try_parse_from(["megasweep"]).is_err());
    }
}
