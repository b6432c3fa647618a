use async_trait::async_trait;

use crate::errors::Result;
use crate::models::{Device, DeviceHealth, DeviceId, HealthState, Target, Task, TaskId};

/// 任务定义存取（外部存储的接口边界）
///
/// 装载时完成校验，非法任务不会进入调度器。
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn load_tasks(&self) -> Result<Vec<Task>>;
    async fn task(&self, id: TaskId) -> Result<Task>;
}

/// 设备目录：身份信息、目标展开与健康读模型
///
/// 健康状态只由健康检查和连接池写入，其余组件只读。
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn device(&self, id: DeviceId) -> Result<Device>;

    async fn all_devices(&self) -> Vec<Device>;

    /// 把任务目标展开为去重且按 id 排序的设备集合
    async fn expand(&self, target: &Target) -> Result<Vec<Device>>;

    async fn health(&self, id: DeviceId) -> Option<DeviceHealth>;

    async fn update_health(&self, id: DeviceId, state: HealthState);

    /// 认证失败后置位，供外部面板呈现；引擎不会据此拒绝后续尝试
    async fn flag_auth_failure(&self, id: DeviceId);
}
