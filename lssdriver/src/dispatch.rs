//! Hands a work list to the worker pool and collects the results.
//!
//! At most one item per worker is in flight. Kernels run on tokio's blocking pool and report
//! back over an mpsc channel. When shutdown is signalled no further items are handed out and
//! results of items still running are dropped.

use crate::err::DriverError;
use crate::kernels::KernelError;
use crate::scheduler::WorkerScheduler;
use crate::task::spawn_blocking_named;
use lsscache::logger::format_elapsed;
use lsscache::{info, warn, WorkList};
use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

#[derive(Debug)]
pub struct DispatchReport<R> {
    /// Successful results in work list order.
    pub results: Vec<R>,
    pub failed: usize,
    /// Items never started or abandoned in flight because of shutdown.
    pub cancelled: usize,
}

impl<R> DispatchReport<R> {
    pub fn is_complete(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }
}

struct Outcome<R> {
    worker: usize,
    ordinal: usize,
    elapsed: Duration,
    result: Result<R, KernelError>,
}

pub async fn dispatch<T, R, F>(
    stage: &'static str,
    list: WorkList<T>,
    kernel: F,
    scheduler: &mut WorkerScheduler,
    mut shutdown: watch::Receiver<bool>,
) -> Result<DispatchReport<R>, DriverError>
where
    T: Send + Sync + 'static,
    R: Send + 'static,
    F: Fn(&T) -> Result<R, KernelError> + Send + Sync + 'static,
{
    let start = Instant::now();
    let total = list.len();
    let kernel = Arc::new(kernel);
    let (tx, mut rx) = mpsc::channel::<Outcome<R>>(scheduler.worker_count());
    let mut pending: VecDeque<(usize, T)> = list.into_items().into_iter().enumerate().collect();
    let mut results: Vec<(usize, R)> = Vec::with_capacity(total);
    let mut failed = 0;
    let mut shutdown_open = true;
    info!("{}: dispatching {} items to {} workers", stage, total, scheduler.worker_count());

    loop {
        if *shutdown.borrow() {
            let cancelled = pending.len() + scheduler.active_count();
            warn!("{}: shutdown requested, {} items not completed", stage, cancelled);
            scheduler.reset();
            return Ok(finish(results, failed, cancelled));
        }
        while let Some(worker) = scheduler.next_free_worker() {
            let Some((ordinal, item)) = pending.pop_front() else {
                break;
            };
            let kernel = Arc::clone(&kernel);
            let tx = tx.clone();
            start_on(scheduler, worker, || {
                spawn_blocking_named(stage, move || {
                    let started = Instant::now();
                    let result = panic::catch_unwind(AssertUnwindSafe(|| kernel(&item)))
                        .unwrap_or_else(|_| Err(KernelError::new(stage, "kernel panicked")));
                    let _ = tx.blocking_send(Outcome { worker, ordinal, elapsed: started.elapsed(), result });
                })
                .map(drop)
            })?;
        }
        if scheduler.all_idle() && pending.is_empty() {
            break;
        }
        tokio::select! {
            changed = shutdown.changed(), if shutdown_open => {
                if changed.is_err() {
                    shutdown_open = false;
                }
            }
            outcome = rx.recv() => {
                let Some(outcome) = outcome else {
                    return Err(DriverError::Shutdown(format!("{} result channel closed", stage)));
                };
                scheduler.release(outcome.worker, outcome.elapsed)?;
                match outcome.result {
                    Ok(r) => results.push((outcome.ordinal, r)),
                    Err(e) => {
                        warn!("{}: item {} left for the next run: {}", stage, outcome.ordinal, e);
                        failed += 1;
                    }
                }
            }
        }
    }

    info!("{}: {} of {} items done in {}", stage, results.len(), total, format_elapsed(start.elapsed()));
    scheduler.report(stage);
    Ok(finish(results, failed, 0))
}

/// Marks `worker` busy only once its task has been spawned.
fn start_on(scheduler: &mut WorkerScheduler, worker: usize, spawn: impl FnOnce() -> io::Result<()>) -> Result<(), DriverError> {
    spawn()?;
    scheduler.assign(worker)?;
    Ok(())
}

fn finish<R>(mut results: Vec<(usize, R)>, failed: usize, cancelled: usize) -> DispatchReport<R> {
    results.sort_by_key(|(ordinal, _)| *ordinal);
    DispatchReport { results: results.into_iter().map(|(_, r)| r).collect(), failed, cancelled }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn list(n: u32) -> WorkList<u32> {
        WorkList::from_items((0..n).collect()).expect("non empty")
    }

    #[tokio::test]
    async fn results_come_back_in_list_order() {
        let (_tx, rx) = watch::channel(false);
        let mut scheduler = WorkerScheduler::new(4);
        let report = dispatch("square", list(20), |x: &u32| Ok(x * x), &mut scheduler, rx).await.expect("dispatch");
        assert!(report.is_complete());
        assert_eq!(report.results, (0..20).map(|x| x * x).collect::<Vec<u32>>());
        assert_eq!(scheduler.stats().iter().map(|s| s.items).sum::<u64>(), 20);
        assert!(scheduler.all_idle());
    }

    #[tokio::test]
    async fn never_exceeds_worker_count() {
        let (_tx, rx) = watch::channel(false);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
        let kernel = move |x: &u32| {
            let now = r.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            r.fetch_sub(1, Ordering::SeqCst);
            Ok(*x)
        };
        let mut scheduler = WorkerScheduler::new(2);
        let report = dispatch("bounded", list(10), kernel, &mut scheduler, rx).await.expect("dispatch");
        assert_eq!(report.results.len(), 10);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn kernel_errors_fail_only_their_item() {
        let (_tx, rx) = watch::channel(false);
        let mut scheduler = WorkerScheduler::new(3);
        let kernel = |x: &u32| if x % 3 == 0 { Err(KernelError::new("odd", "no convergence")) } else { Ok(*x) };
        let report = dispatch("odd", list(9), kernel, &mut scheduler, rx).await.expect("dispatch");
        assert_eq!(report.failed, 3);
        assert_eq!(report.cancelled, 0);
        assert_eq!(report.results, vec![1, 2, 4, 5, 7, 8]);
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn panicking_kernel_counts_as_failed() {
        let (_tx, rx) = watch::channel(false);
        let mut scheduler = WorkerScheduler::new(2);
        let kernel = |x: &u32| if *x == 2 { panic!("diverged") } else { Ok(*x) };
        let report = dispatch("panicky", list(4), kernel, &mut scheduler, rx).await.expect("dispatch");
        assert_eq!(report.failed, 1);
        assert_eq!(report.results, vec![0, 1, 3]);
    }

    #[tokio::test]
    async fn shutdown_stops_handing_out_items() {
        let (tx, rx) = watch::channel(false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let shutdown = Mutex::new(Some(tx));
        let kernel = move |x: &u32| {
            s.lock().expect("lock").push(*x);
            if *x == 1 {
                if let Some(tx) = shutdown.lock().expect("lock").take() {
                    let _ = tx.send(true);
                }
            }
            Ok(*x)
        };
        let mut scheduler = WorkerScheduler::new(1);
        let report = dispatch("stoppable", list(10), kernel, &mut scheduler, rx).await.expect("dispatch");
        assert!(report.cancelled > 0);
        assert_eq!(report.results.len() + report.cancelled, 10);
        assert!(seen.lock().expect("lock").len() < 10);
        assert!(scheduler.all_idle());
    }

    #[test]
    fn worker_stays_free_when_its_task_cannot_start() {
        let mut scheduler = WorkerScheduler::new(2);
        let worker = scheduler.next_free_worker().expect("free worker");
        let err = start_on(&mut scheduler, worker, || Err(io::Error::other("blocking pool shut down"))).unwrap_err();
        assert!(matches!(err, DriverError::Io(_)));
        assert!(scheduler.all_idle());
        assert_eq!(scheduler.next_free_worker(), Some(worker));

        start_on(&mut scheduler, worker, || Ok(())).expect("spawned");
        assert_eq!(scheduler.active_count(), 1);
    }

    #[tokio::test]
    async fn already_signalled_shutdown_starts_nothing() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).expect("send");
        let mut scheduler = WorkerScheduler::new(2);
        let report = dispatch("idle", list(4), |x: &u32| Ok(*x), &mut scheduler, rx).await.expect("dispatch");
        assert_eq!((report.results.len(), report.cancelled), (0, 4));
    }
}
