//! Free-space watchdog for the run directory.
//!
//! Simulation output can fill a disk within minutes. Once free space drops
//! below the floor the watchdog raises the exit flag and hands control to
//! its trip action, which in production aborts the process on the spot.
use super::OrchestratorContext;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Granularity at which sleeping threads notice the exit flag.
pub(crate) const EXIT_POLL: Duration = Duration::from_millis(50);

/// Source of the free-space reading.
pub trait StorageProbe: Send + 'static {
    fn available_bytes(&self) -> io::Result<u64>;
}

/// Reads free space of a filesystem with `statvfs(3)`.
#[derive(Debug, Clone)]
pub struct StatvfsProbe {
    path: PathBuf,
}

impl StatvfsProbe {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl StorageProbe for StatvfsProbe {
    #[allow(clippy::unnecessary_cast)]
    fn available_bytes(&self) -> io::Result<u64> {
        let c_path = CString::new(self.path.as_os_str().as_bytes())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let mut stats = std::mem::MaybeUninit::<libc::statvfs>::uninit();
        // SAFETY: c_path is NUL-terminated and stats is a valid out-pointer.
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), stats.as_mut_ptr()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: statvfs returned 0, so it filled the struct.
        let stats = unsafe { stats.assume_init() };
        Ok((stats.f_bavail as u64).saturating_mul(stats.f_frsize as u64))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    pub min_free_bytes: u64,
    pub interval: Duration,
}

/// Poll `probe` every `interval` until the exit flag is raised.
///
/// When free space falls below the floor, `on_exhausted` runs with the
/// reading. Probe errors are logged and retried on the next tick.
pub fn spawn_watchdog<P, F>(
    ctx: Arc<OrchestratorContext>,
    probe: P,
    config: WatchdogConfig,
    on_exhausted: F,
) -> io::Result<JoinHandle<()>>
where
    P: StorageProbe,
    F: FnOnce(u64) + Send + 'static,
{
    std::thread::Builder::new()
        .name("megasweep-watchdog".to_string())
        .spawn(move || {
            loop {
                match probe.available_bytes() {
                    Ok(available) if available < config.min_free_bytes => {
                        tracing::error!(
                            available,
                            required = config.min_free_bytes,
                            "free space below floor; aborting run"
                        );
                        ctx.request_exit();
                        on_exhausted(available);
                        return;
                    }
                    Ok(available) => tracing::trace!(available, "free space ok"),
                    Err(err) => tracing::warn!(error = %err, "free space probe failed"),
                }
                if !sleep_unless_exit(&ctx, config.interval) {
                    return;
                }
            }
        })
}

/// Sleep for `duration`, waking early on exit; false when exit was raised.
pub(crate) fn sleep_unless_exit(ctx: &OrchestratorContext, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if ctx.should_exit() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(EXIT_POLL.min(deadline - now));
    }
}

/// Production trip action.
pub fn abort_process(_available: u64) {
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::test_support::context;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::mpsc;

    struct Shrinking {
        remaining: Arc<AtomicU64>,
    }

    impl StorageProbe for Shrinking {
        fn available_bytes(&self) -> io::Result<u64> {
            Ok(self.remaining.load(Ordering::SeqCst))
        }
    }

    #[test]
    fn trips_within_one_interval_of_falling_below_floor() {
        let (_dir, ctx) = context();
        let ctx = Arc::new(ctx);
        let remaining = Arc::new(AtomicU64::new(10_000));
        let (tx, rx) = mpsc::channel();
        let config = WatchdogConfig {
            min_free_bytes: 1_000,
            interval: Duration::from_millis(100),
        };

        let handle = spawn_watchdog(
            Arc::clone(&ctx),
            Shrinking {
                remaining: Arc::clone(&remaining),
            },
            config,
            move |available| {
                let _ = tx.send(available);
            },
        )
        .expect("spawn watchdog");

        assert!(rx.recv_timeout(Duration::from_millis(250)).is_err());
        remaining.store(10, Ordering::SeqCst);
        let tripped_at = rx
            .recv_timeout(config.interval * 3)
            .expect("watchdog should trip");
        assert_eq!(tripped_at, 10);
        assert!(ctx.should_exit());
        handle.join().expect("join watchdog");
    }

    #[test]
    fn exit_flag_stops_a_healthy_watchdog() {
        let (_dir, ctx) = context();
        let ctx = Arc::new(ctx);
        let handle = spawn_watchdog(
            Arc::clone(&ctx),
            Shrinking {
                remaining: Arc::new(AtomicU64::new(u64::MAX)),
            },
            WatchdogConfig {
                min_free_bytes: 1,
                interval: Duration::from_secs(60),
            },
            |_| panic!("must not trip"),
        )
        .expect("spawn watchdog");
        ctx.request_exit();
        handle.join().expect("join watchdog");
    }

    #[test]
    fn statvfs_reads_the_temp_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let available = StatvfsProbe::new(dir.path())
            .available_bytes()
            .expect("statvfs");
        assert!(available > 0);
    }
}
