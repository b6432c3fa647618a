use async_trait::async_trait;
use uuid::Uuid;

use crate::cancel::CancelFlag;
use crate::errors::Result;
use crate::models::{Device, Task};
use crate::traits::session::DeviceSession;

/// 一次执行的上下文
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub retry_count: u32,
    pub task: Task,
    pub device: Device,
    pub cancel: CancelFlag,
}

/// 执行产出
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub output: Option<String>,
}

/// 把任务动作翻译成协议调用的无状态执行器接口
///
/// 对调度器而言调用是同步的：工作协程在整个执行期间挂起等待。
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        ctx: &ExecutionContext,
        session: &mut dyn DeviceSession,
    ) -> Result<ExecutionOutcome>;
}
