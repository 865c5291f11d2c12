//! The end-to-end run: settings and template checks, run directory,
//! geometry variants, simulation documents, jobs, summary.
//!
//! Each stage tags its fatal errors with a [`Stage`] so the process exit
//! code tells callers where the run stopped.
use crate::config::{Overrides, Settings};
use crate::error::{Stage, StageContext};
use crate::external::ExternalTools;
use crate::legend::{Legend, LEGEND_FILE};
use crate::orchestrator::reporter::spawn_reporter;
use crate::orchestrator::watchdog::{abort_process, spawn_watchdog, StatvfsProbe, WatchdogConfig};
use crate::orchestrator::{run_jobs, OrchestratorContext};
use crate::template::{merge, MergedDocument};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

pub mod geometry;
pub mod simulation;
pub mod summary;
pub mod workspace;

pub use summary::RunSummary;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub settings: PathBuf,
    pub run_dir: PathBuf,
    pub overrides: Overrides,
    pub allow_dirty: bool,
    /// False for `plan`: documents are generated and validated, jobs are not run.
    pub execute_jobs: bool,
}

pub fn run(options: &RunOptions) -> Result<RunSummary> {
    let started = Instant::now();
    let mut settings = Settings::load(&options.settings).stage(Stage::Settings)?;
    settings.apply(options.overrides);
    settings.check_inputs().stage(Stage::Settings)?;
    let document = merge(&settings.geometry.template)
        .with_context(|| format!("merge {}", settings.geometry.template.display()))
        .stage(Stage::Geometry)?;
    simulation::check_settings(&settings.simulation).stage(Stage::Simulation)?;

    let mut inputs: Vec<PathBuf> = settings
        .input_files()
        .into_iter()
        .map(Path::to_path_buf)
        .collect();
    inputs.extend(settings.command_programs());
    inputs.extend(document.sources());
    let inputs: Vec<&Path> = inputs.iter().map(PathBuf::as_path).collect();
    let run_dir = workspace::prepare_run_dir(&options.run_dir, &inputs, options.allow_dirty)
        .stage(Stage::RunDirectory)?;
    let legend = Legend::open(&run_dir.join(LEGEND_FILE)).stage(Stage::RunDirectory)?;
    tracing::info!(
        run_dir = %run_dir.display(),
        legend = %legend.path().display(),
        threads = settings.threads,
        keep_all = settings.keep_all,
        "starting sweep"
    );

    let ctx = Arc::new(OrchestratorContext::new(legend));
    let tools = ExternalTools {
        run_dir: run_dir.clone(),
        check: settings.commands.check.clone(),
        primary: settings.commands.primary.clone(),
        secondary: settings.commands.secondary.clone(),
        settings: settings.tools.clone(),
    };

    let background = Background::start(&ctx, &settings, &run_dir)?;
    let result = drive(&ctx, &tools, &settings, &document, &run_dir, options.execute_jobs);
    background.stop(&ctx);

    let mut summary = result?;
    summary.planned_only = !options.execute_jobs;
    summary.peak_in_flight = ctx.peak_in_flight();
    summary.elapsed_seconds = started.elapsed().as_secs_f64();
    let path = summary.write()?;
    tracing::debug!(path = %path.display(), "wrote summary");
    summary.log();
    Ok(summary)
}

fn drive(
    ctx: &OrchestratorContext,
    tools: &ExternalTools,
    settings: &Settings,
    document: &MergedDocument,
    run_dir: &Path,
    execute_jobs: bool,
) -> Result<RunSummary> {
    let variants = geometry::write_variants(document, &settings.geometry, run_dir, ctx.legend())
        .stage(Stage::Geometry)?;
    let report = geometry::validate_variants(ctx, tools, variants, settings.threads)
        .stage(Stage::Geometry)?;

    let jobs = if report.accepted.is_empty() {
        tracing::warn!("every geometry variant was rejected; no simulation jobs will run");
        Vec::new()
    } else {
        let geometries: Vec<String> = report
            .accepted
            .iter()
            .map(|path| path.display().to_string())
            .collect();
        simulation::write_run_documents(&settings.simulation, &geometries, run_dir, ctx.legend())
            .stage(Stage::Simulation)?
    };
    let generated = jobs.len();

    let outcomes = if execute_jobs {
        run_jobs(ctx, tools, jobs, settings.threads, settings.keep_all)
    } else {
        tracing::info!(documents = generated, "plan only; not running jobs");
        Vec::new()
    };
    Ok(RunSummary::new(
        run_dir,
        &report,
        generated,
        outcomes,
        &settings.notifications,
    ))
}

/// Watchdog and status reporter threads for the duration of a run.
struct Background {
    handles: Vec<JoinHandle<()>>,
}

impl Background {
    fn start(ctx: &Arc<OrchestratorContext>, settings: &Settings, run_dir: &Path) -> Result<Self> {
        let mut handles = Vec::new();
        if settings.watchdog.min_free_bytes > 0 {
            let config = WatchdogConfig {
                min_free_bytes: settings.watchdog.min_free_bytes,
                interval: settings.watchdog.interval,
            };
            let handle = spawn_watchdog(
                Arc::clone(ctx),
                StatvfsProbe::new(run_dir),
                config,
                abort_process,
            )
            .context("start free-space watchdog")?;
            handles.push(handle);
        } else {
            tracing::debug!("free-space watchdog disabled");
        }
        handles.push(
            spawn_reporter(Arc::clone(ctx), settings.status_interval, settings.threads)
                .context("start status reporter")?,
        );
        Ok(Self { handles })
    }

    fn stop(self, ctx: &OrchestratorContext) {
        ctx.request_exit();
        for handle in self.handles {
            if handle.join().is_err() {
                tracing::warn!("background thread panicked");
            }
        }
    }
}
