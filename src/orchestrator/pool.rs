//! Fixed-size worker pool fed through a rendezvous channel.
//!
//! The dispatcher blocks in `send` until a worker is idle, so at most
//! `limit` items are ever in flight and nobody polls.
use super::OrchestratorContext;
use crossbeam::channel;
use std::panic::{self, AssertUnwindSafe};

/// Run `work` over `items` on at most `limit` threads.
///
/// Results come back in item order. A slot is `None` when its item was
/// never dispatched (the exit flag was raised) or its worker panicked.
pub fn run_bounded<T, R, F>(
    ctx: &OrchestratorContext,
    limit: usize,
    items: Vec<T>,
    work: F,
) -> Vec<Option<R>>
where
    T: Send,
    R: Send,
    F: Fn(usize, T) -> R + Sync,
{
    let total = items.len();
    let mut results: Vec<Option<R>> = (0..total).map(|_| None).collect();
    if total == 0 {
        return results;
    }
    let workers = limit.clamp(1, total);
    let (job_tx, job_rx) = channel::bounded::<(usize, T)>(0);
    let (result_tx, result_rx) = channel::unbounded::<(usize, R)>();

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let work = &work;
            scope.spawn(move || {
                for (index, item) in job_rx.iter() {
                    let slot = ctx.enter();
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(index, item)));
                    drop(slot);
                    match outcome {
                        Ok(result) => {
                            if result_tx.send((index, result)).is_err() {
                                break;
                            }
                        }
                        Err(_) => tracing::error!(item = index, "worker panicked"),
                    }
                }
            });
        }
        drop(job_rx);
        drop(result_tx);

        for (index, item) in items.into_iter().enumerate() {
            if ctx.should_exit() {
                tracing::warn!(remaining = total - index, "exit requested; stopping dispatch");
                break;
            }
            if job_tx.send((index, item)).is_err() {
                break;
            }
        }
        drop(job_tx);
    });

    for (index, result) in result_rx.try_iter() {
        results[index] = Some(result);
    }
    results
}
