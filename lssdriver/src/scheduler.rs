use crate::err::DriverError;
use lsscache::info;
use lsscache::logger::format_elapsed;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub items: u64,
    pub busy: Duration,
}

#[derive(Debug, Clone, Default)]
struct Worker {
    active: bool,
    stats: WorkerStats,
}

/// Tracks which of a fixed set of workers are busy and what each has done. Workers are
/// numbered from 0 and are handed out lowest id first.
#[derive(Debug, Clone)]
pub struct WorkerScheduler {
    workers: Vec<Worker>,
}

impl WorkerScheduler {
    pub fn new(workers: usize) -> Self {
        WorkerScheduler { workers: vec![Worker::default(); workers.max(1)] }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn next_free_worker(&self) -> Option<usize> {
        self.workers.iter().position(|w| !w.active)
    }

    pub fn assign(&mut self, worker: usize) -> Result<(), DriverError> {
        let w = self.worker_mut(worker)?;
        if w.active {
            return Err(DriverError::new(format!("worker {} is already busy", worker)));
        }
        w.active = true;
        Ok(())
    }

    pub fn release(&mut self, worker: usize, elapsed: Duration) -> Result<(), DriverError> {
        let w = self.worker_mut(worker)?;
        if !w.active {
            return Err(DriverError::new(format!("worker {} was not assigned", worker)));
        }
        w.active = false;
        w.stats.items += 1;
        w.stats.busy += elapsed;
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.workers.iter().filter(|w| w.active).count()
    }

    pub fn all_idle(&self) -> bool {
        self.active_count() == 0
    }

    /// Marks every worker idle without crediting it, used when in-flight work is abandoned.
    pub fn reset(&mut self) {
        for w in &mut self.workers {
            w.active = false;
        }
    }

    pub fn stats(&self) -> Vec<WorkerStats> {
        self.workers.iter().map(|w| w.stats).collect()
    }

    pub fn report(&self, stage: &str) {
        for (id, stats) in self.stats().iter().enumerate().filter(|(_, s)| s.items > 0) {
            info!("{} worker {}: {} items in {}", stage, id, stats.items, format_elapsed(stats.busy));
        }
    }

    fn worker_mut(&mut self, worker: usize) -> Result<&mut Worker, DriverError> {
        let count = self.workers.len();
        self.workers.get_mut(worker).ok_or_else(|| DriverError::new(format!("worker {} out of range 0..{}", worker, count)))
    }
}
