//! Shared run state and the bounded job pool.
//!
//! `OrchestratorContext` owns everything workers touch concurrently: stage
//! progress counters, the job-duration average, the exit flag, the legend
//! and the per-job state board. All of it is internally locked, so workers
//! only ever hold `&OrchestratorContext`.
use crate::external::ExitReport;
use crate::legend::Legend;
use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub mod pool;
pub mod reporter;
pub mod watchdog;
pub mod worker;

pub use pool::run_bounded;
pub use worker::{run_jobs, JobOutcome};

/// Weight of the newest sample in the job-duration moving average.
pub const DURATION_EMA_WEIGHT: f64 = 1.0 / 11.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Dispatched,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// The two external stages of a simulation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    Primary,
    Secondary,
}

impl JobStage {
    pub fn label(self) -> &'static str {
        match self {
            JobStage::Primary => "primary",
            JobStage::Secondary => "secondary",
        }
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Stages whose progress is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStage {
    Validation,
    Primary,
    Secondary,
}

impl ProgressStage {
    fn slot(self) -> usize {
        match self {
            ProgressStage::Validation => 0,
            ProgressStage::Primary => 1,
            ProgressStage::Secondary => 2,
        }
    }
}

impl From<JobStage> for ProgressStage {
    fn from(stage: JobStage) -> Self {
        match stage {
            JobStage::Primary => ProgressStage::Primary,
            JobStage::Secondary => ProgressStage::Secondary,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageProgress {
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub validation: StageProgress,
    pub primary: StageProgress,
    pub secondary: StageProgress,
    pub mean_job_seconds: Option<f64>,
    pub in_flight: usize,
}

/// One accepted simulation document waiting to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunJob {
    pub ordinal: usize,
    pub document: PathBuf,
    pub geometry: Option<String>,
    pub output_base: String,
}

/// The external processes a run drives.
pub trait Collaborators: Sync {
    fn check_geometry(&self, geometry: &Path) -> Result<ExitReport>;
    fn run_stage(&self, stage: JobStage, job: &RunJob, seed: u32) -> Result<ExitReport>;
    /// Remove the job's intermediate simulation files; returns how many.
    fn cleanup(&self, job: &RunJob) -> Result<usize>;
}

#[derive(Debug)]
pub struct OrchestratorContext {
    legend: Legend,
    progress: Mutex<[StageProgress; 3]>,
    duration_ema: Mutex<Option<f64>>,
    exit: AtomicBool,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    jobs: Mutex<Vec<JobState>>,
}

impl OrchestratorContext {
    pub fn new(legend: Legend) -> Self {
        Self {
            legend,
            progress: Mutex::new([StageProgress::default(); 3]),
            duration_ema: Mutex::new(None),
            exit: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn legend(&self) -> &Legend {
        &self.legend
    }

    pub fn add_total(&self, stage: ProgressStage, count: usize) {
        self.progress.lock()[stage.slot()].total += count;
    }

    pub fn complete(&self, stage: ProgressStage) {
        self.progress.lock()[stage.slot()].completed += 1;
    }

    /// Fold one job duration into the moving average.
    pub fn record_duration(&self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64();
        let mut ema = self.duration_ema.lock();
        *ema = Some(match *ema {
            Some(current) => current + DURATION_EMA_WEIGHT * (sample - current),
            None => sample,
        });
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let progress = *self.progress.lock();
        ProgressSnapshot {
            validation: progress[ProgressStage::Validation.slot()],
            primary: progress[ProgressStage::Primary.slot()],
            secondary: progress[ProgressStage::Secondary.slot()],
            mean_job_seconds: *self.duration_ema.lock(),
            in_flight: self.in_flight(),
        }
    }

    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::SeqCst);
    }

    pub fn should_exit(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }

    /// Count a unit of work as in flight until the guard drops.
    pub fn enter(&self) -> InFlightGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard { ctx: self }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Add `count` queued jobs; returns the id of the first.
    pub fn register_jobs(&self, count: usize) -> usize {
        let mut jobs = self.jobs.lock();
        let first = jobs.len();
        jobs.resize(first + count, JobState::Queued);
        first
    }

    /// Move a job forward. Terminal states never change; returns whether
    /// the transition was applied.
    pub fn transition(&self, id: usize, next: JobState) -> bool {
        let mut jobs = self.jobs.lock();
        let Some(state) = jobs.get_mut(id) else {
            return false;
        };
        let allowed = matches!(
            (*state, next),
            (JobState::Queued, JobState::Dispatched)
                | (JobState::Dispatched, JobState::Succeeded)
                | (JobState::Dispatched, JobState::Failed)
        );
        if allowed {
            *state = next;
        } else {
            tracing::debug!(job = id, from = ?*state, to = ?next, "ignored job transition");
        }
        allowed
    }

    pub fn job_state(&self, id: usize) -> Option<JobState> {
        self.jobs.lock().get(id).copied()
    }

    pub fn job_states(&self) -> Vec<JobState> {
        self.jobs.lock().clone()
    }
}

/// Decrements the in-flight count on drop, including during unwinding.
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    ctx: &'a OrchestratorContext,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.ctx.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::context;
    use super::*;

    #[test]
    fn terminal_states_are_immutable() {
        let (_dir, ctx) = context();
        let first = ctx.register_jobs(2);
        assert_eq!(first, 0);
        assert!(!ctx.transition(0, JobState::Succeeded));
        assert!(ctx.transition(0, JobState::Dispatched));
        assert!(ctx.transition(0, JobState::Failed));
        assert!(!ctx.transition(0, JobState::Succeeded));
        assert!(!ctx.transition(0, JobState::Dispatched));
        assert_eq!(ctx.job_states(), [JobState::Failed, JobState::Queued]);
        assert!(!ctx.transition(9, JobState::Dispatched));
    }

    #[test]
    fn duration_average_weights_new_samples() {
        let (_dir, ctx) = context();
        assert_eq!(ctx.snapshot().mean_job_seconds, None);
        ctx.record_duration(Duration::from_secs(11));
        ctx.record_duration(Duration::from_secs(0));
        let mean = ctx.snapshot().mean_job_seconds.expect("mean");
        assert!((mean - 10.0).abs() < 1e-9);
    }

    #[test]
    fn guards_release_in_flight_slots() {
        let (_dir, ctx) = context();
        {
            let _a = ctx.enter();
            let _b = ctx.enter();
            assert_eq!(ctx.in_flight(), 2);
        }
        assert_eq!(ctx.in_flight(), 0);
        assert_eq!(ctx.peak_in_flight(), 2);

        ctx.add_total(ProgressStage::Primary, 3);
        ctx.complete(ProgressStage::Primary);
        let snapshot = ctx.snapshot();
        assert_eq!(
            snapshot.primary,
            StageProgress {
                completed: 1,
                total: 3
            }
        );
        assert!(!ctx.should_exit());
        ctx.request_exit();
        assert!(ctx.should_exit());
    }
}
