//! The boundary to the numerical code. Kernels receive fully resolved work items, never touch the
//! store, and either return a complete result or fail the item.

use lsscache::*;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("{stage} kernel failed: {message}")]
pub struct KernelError {
    pub stage: &'static str,
    pub message: String,
}

impl KernelError {
    pub fn new(stage: &'static str, message: impl Into<String>) -> Self {
        KernelError { stage, message: message.into() }
    }
}

pub trait Kernels: Send + Sync + 'static {
    fn transfer(&self, item: &TransferItem) -> Result<TransferResult, KernelError>;
    fn growth(&self, item: &GrowthItem) -> Result<GrowthResult, KernelError>;
    fn filter_pk(&self, item: &FilterPkItem) -> Result<FilterPkResult, KernelError>;
    fn loop_integral(&self, item: &LoopIntegralItem) -> Result<LoopIntegralResult, KernelError>;
    fn matsubara_xy(&self, item: &MatsubaraXyItem) -> Result<MatsubaraXyResult, KernelError>;
    fn oneloop_pk(&self, item: &OneLoopPkItem) -> Result<OneLoopPkResult, KernelError>;
    fn resum_pk(&self, item: &ResumPkItem) -> Result<ResumPkResult, KernelError>;
    fn multipole_pk(&self, item: &MultipolePkItem) -> Result<MultipolePkResult, KernelError>;
}
