//! End-of-run summary.
use crate::config::Notifications;
use crate::orchestrator::{JobOutcome, JobState};
use crate::pipeline::geometry::GeometryReport;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GeometryCounts {
    pub generated: usize,
    pub accepted: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobCounts {
    pub generated: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub not_run: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_dir: PathBuf,
    pub planned_only: bool,
    pub geometries: GeometryCounts,
    pub jobs: JobCounts,
    pub peak_in_flight: usize,
    pub elapsed_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub outcomes: Vec<JobOutcome>,
}

impl RunSummary {
    pub fn new(
        run_dir: &Path,
        geometry: &GeometryReport,
        generated_jobs: usize,
        outcomes: Vec<JobOutcome>,
        notifications: &Notifications,
    ) -> Self {
        let count = |state: JobState| outcomes.iter().filter(|o| o.state == state).count();
        let jobs = JobCounts {
            generated: generated_jobs,
            succeeded: count(JobState::Succeeded),
            failed: count(JobState::Failed),
            not_run: generated_jobs.saturating_sub(
                count(JobState::Succeeded) + count(JobState::Failed),
            ),
        };
        Self {
            run_dir: run_dir.to_path_buf(),
            planned_only: false,
            geometries: GeometryCounts {
                generated: geometry.generated,
                accepted: geometry.accepted.len(),
                rejected: geometry.rejected,
            },
            jobs,
            peak_in_flight: 0,
            elapsed_seconds: 0.0,
            hook: notifications.hook.clone(),
            address: notifications.address.clone(),
            outcomes,
        }
    }

    pub fn write(&self) -> Result<PathBuf> {
        let path = self.run_dir.join(SUMMARY_FILE);
        let text = serde_json::to_string_pretty(self).context("serialize run summary")?;
        fs::write(&path, text.as_bytes()).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    pub fn log(&self) {
        tracing::info!(
            geometries_accepted = self.geometries.accepted,
            geometries_rejected = self.geometries.rejected,
            jobs_succeeded = self.jobs.succeeded,
            jobs_failed = self.jobs.failed,
            jobs_not_run = self.jobs.not_run,
            elapsed_seconds = self.elapsed_seconds,
            "run finished"
        );
        if self.hook.is_some() || self.address.is_some() {
            tracing::info!("notification destinations are recorded in the summary only");
        }
    }
}
