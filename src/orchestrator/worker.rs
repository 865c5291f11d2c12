//! Per-job execution: seed, primary stage, secondary stage, cleanup.
use super::{
    run_bounded, Collaborators, JobStage, JobState, OrchestratorContext, ProgressStage, RunJob,
};
use crate::external::draw_seed;
use crate::legend::LegendRecord;
use anyhow::Result;
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutcome {
    pub ordinal: usize,
    pub state: JobState,
    pub seed: Option<u32>,
    pub failure: Option<String>,
    pub seconds: f64,
}

/// Run every job on at most `limit` workers and report each one's outcome.
///
/// Every job that was dispatched ends `Succeeded` or `Failed`, whatever the
/// collaborators do.
pub fn run_jobs<C: Collaborators>(
    ctx: &OrchestratorContext,
    collaborators: &C,
    jobs: Vec<RunJob>,
    limit: usize,
    keep_all: bool,
) -> Vec<JobOutcome> {
    let first = ctx.register_jobs(jobs.len());
    ctx.add_total(ProgressStage::Primary, jobs.len());
    let ordinals: Vec<usize> = jobs.iter().map(|job| job.ordinal).collect();
    tracing::info!(jobs = jobs.len(), limit, "dispatching simulation jobs");

    let results = run_bounded(ctx, limit, jobs, |index, job| {
        run_one(ctx, collaborators, first + index, &job, keep_all)
    });

    let outcomes: Vec<JobOutcome> = results
        .into_iter()
        .zip(ordinals)
        .enumerate()
        .map(|(index, (result, ordinal))| match result {
            Some(outcome) => outcome,
            None => {
                let id = first + index;
                ctx.transition(id, JobState::Failed);
                JobOutcome {
                    ordinal,
                    state: ctx.job_state(id).unwrap_or(JobState::Queued),
                    seed: None,
                    failure: Some("job did not complete".to_string()),
                    seconds: 0.0,
                }
            }
        })
        .collect();

    let never_dispatched = ctx.job_states()[first..]
        .iter()
        .filter(|state| !state.is_terminal())
        .count();
    if never_dispatched > 0 {
        tracing::warn!(jobs = never_dispatched, "jobs were never dispatched");
    }
    outcomes
}

fn run_one<C: Collaborators>(
    ctx: &OrchestratorContext,
    collaborators: &C,
    id: usize,
    job: &RunJob,
    keep_all: bool,
) -> JobOutcome {
    ctx.transition(id, JobState::Dispatched);
    let started = Instant::now();
    let seed = draw_seed();
    let result = execute(ctx, collaborators, job, seed, keep_all);
    let elapsed = started.elapsed();
    ctx.record_duration(elapsed);

    let failure = match result {
        Ok(None) => None,
        Ok(Some(reason)) => Some(reason),
        Err(err) => Some(format!("{err:#}")),
    };
    let state = match &failure {
        None => {
            tracing::info!(run = %job.output_base, seconds = elapsed.as_secs_f64(), "job succeeded");
            JobState::Succeeded
        }
        Some(reason) => {
            tracing::error!(run = %job.output_base, %reason, "job failed");
            JobState::Failed
        }
    };
    ctx.transition(id, state);
    JobOutcome {
        ordinal: job.ordinal,
        state,
        seed: Some(seed),
        failure,
        seconds: round_seconds(elapsed),
    }
}

/// `Ok(None)` on success, `Ok(Some(reason))` when a stage exits non-zero.
fn execute<C: Collaborators>(
    ctx: &OrchestratorContext,
    collaborators: &C,
    job: &RunJob,
    seed: u32,
    keep_all: bool,
) -> Result<Option<String>> {
    ctx.legend().append(&LegendRecord::Job {
        ordinal: job.ordinal,
        document: job.document.display().to_string(),
        seed,
    })?;

    for stage in [JobStage::Primary, JobStage::Secondary] {
        let report = collaborators.run_stage(stage, job, seed);
        ctx.complete(stage.into());
        let report = report?;
        if !report.success() {
            return Ok(Some(format!("{stage} stage: {report}")));
        }
        if stage == JobStage::Primary {
            ctx.add_total(ProgressStage::Secondary, 1);
        }
    }

    if !keep_all {
        let removed = collaborators.cleanup(job)?;
        tracing::debug!(run = %job.output_base, removed, "removed intermediate files");
    }
    Ok(None)
}

fn round_seconds(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 1000.0).round() / 1000.0
}
