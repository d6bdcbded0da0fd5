//! Drives an lsscache store: loads settings, works out what each stage is missing, hands the
//! work to a pool of kernels and stores what comes back.

pub mod coordinator;
pub mod dispatch;
pub mod err;
pub mod kernels;
pub mod scheduler;
pub mod settings;
pub mod task;

pub use coordinator::{read_linear_pk, Coordinator, LinearPkFile, RunSummary, StageSummary};
pub use dispatch::{dispatch, DispatchReport};
pub use err::DriverError;
pub use kernels::{KernelError, Kernels};
pub use lsscache;
pub use scheduler::{WorkerScheduler, WorkerStats};
pub use settings::{AppConfig, Parallelism};
