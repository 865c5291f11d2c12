//! Periodic progress logging.
use super::watchdog::sleep_unless_exit;
use super::{OrchestratorContext, ProgressSnapshot, StageProgress};
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Log a progress line every `interval` until the exit flag is raised.
pub fn spawn_reporter(
    ctx: Arc<OrchestratorContext>,
    interval: Duration,
    threads: usize,
) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("megasweep-status".to_string())
        .spawn(move || {
            while sleep_unless_exit(&ctx, interval) {
                tracing::info!("{}", describe(&ctx.snapshot(), threads));
            }
        })
}

/// One-line rendering of a snapshot, with a rough time-to-finish.
pub fn describe(snapshot: &ProgressSnapshot, threads: usize) -> String {
    let mut line = format!(
        "validation {}, primary {}, secondary {}, running {}",
        fraction(snapshot.validation),
        fraction(snapshot.primary),
        fraction(snapshot.secondary),
        snapshot.in_flight
    );
    if let Some(mean) = snapshot.mean_job_seconds {
        line.push_str(&format!(", mean job {mean:.1}s"));
        let remaining = snapshot
            .primary
            .total
            .saturating_sub(snapshot.primary.completed);
        if remaining > 0 {
            let eta = mean * remaining as f64 / threads.max(1) as f64;
            line.push_str(&format!(", about {} left", human_duration(eta)));
        }
    }
    line
}

fn fraction(progress: StageProgress) -> String {
    format!("{}/{}", progress.completed, progress.total)
}

fn human_duration(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let (hours, minutes, secs) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h{minutes:02}m")
    } else if minutes > 0 {
        format!("{minutes}m{secs:02}s")
    } else {
        format!("{secs}s")
    }
}
