use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ErrorKind;
use crate::models::device::DeviceId;
use crate::models::task::TaskId;

/// 一次任务在一台设备上的执行实例
///
/// 状态机：Pending → Running → {Succeeded, Failed, AwaitingRetry}，
/// AwaitingRetry 在退避到期后以新实例重新进入 Pending，超过重试上限
/// 进入 Exhausted。Failed/Succeeded/Exhausted 是终态且必被记录。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: Uuid,
    pub task_id: TaskId,
    pub device_id: DeviceId,
    pub status: TaskRunStatus,
    /// 已经历的重试次数，首次执行为 0
    pub retry_count: u32,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskRunStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "SUCCEEDED")]
    Succeeded,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "AWAITING_RETRY")]
    AwaitingRetry,
    #[serde(rename = "EXHAUSTED")]
    Exhausted,
}

impl TaskRun {
    pub fn new(task_id: TaskId, device_id: DeviceId, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            device_id,
            status: TaskRunStatus::Pending,
            retry_count: 0,
            scheduled_at,
            started_at: None,
            finished_at: None,
            output: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// 从失败实例派生重试实例：同一 (任务, 设备) 身份，重试计数递增
    pub fn retry_of(origin: &TaskRun, earliest_retry_at: DateTime<Utc>) -> Self {
        let mut run = TaskRun::new(origin.task_id, origin.device_id, earliest_retry_at);
        run.retry_count = origin.retry_count + 1;
        run
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            TaskRunStatus::Succeeded | TaskRunStatus::Failed | TaskRunStatus::Exhausted
        )
    }

    pub fn update_status(&mut self, status: TaskRunStatus) {
        self.status = status;
        match status {
            TaskRunStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
            }
            TaskRunStatus::Succeeded
            | TaskRunStatus::Failed
            | TaskRunStatus::AwaitingRetry
            | TaskRunStatus::Exhausted => {
                if self.finished_at.is_none() {
                    self.finished_at = Some(Utc::now());
                }
            }
            _ => {}
        }
    }
}

/// 追加写入执行结果汇的记录单元
///
/// 携带设备、任务、重试次数等上下文，满足"无需复跑即可定位"的要求。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub task_run_id: Uuid,
    pub task_id: TaskId,
    pub device_id: DeviceId,
    pub retry_count: u32,
    pub outcome: TaskRunStatus,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub output: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    pub fn from_run(run: &TaskRun, error_kind: Option<ErrorKind>) -> Self {
        Self {
            task_run_id: run.id,
            task_id: run.task_id,
            device_id: run.device_id,
            retry_count: run.retry_count,
            outcome: run.status,
            error_kind,
            error: run.error.clone(),
            output: run.output.clone(),
            scheduled_at: run.scheduled_at,
            started_at: run.started_at,
            finished_at: run.finished_at,
        }
    }
}
