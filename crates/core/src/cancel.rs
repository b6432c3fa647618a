use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors::{FleetError, Result};

/// 协作式取消标志
///
/// 执行器在每个协议调用边界观察它；核对器先完成当前增删批次
/// 再让步，避免把 Allow 型列表留在比新旧期望都更严的中间态。
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// 在协议调用边界调用：已取消则返回终态错误
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(FleetError::Cancelled)
        } else {
            Ok(())
        }
    }
}
