use async_trait::async_trait;

use crate::models::HealthState;
use crate::traits::vault::DeviceEndpoint;

/// 连通性探测：TCP 连接协议端口，带超时
///
/// 结果只用于更新健康读模型和重启后的恢复复查，调度决策
/// 从不信任它（acquire 永远发起真实连接）。
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, endpoint: &DeviceEndpoint) -> HealthState;
}
