use async_trait::async_trait;

use crate::errors::Result;
use crate::models::DeviceId;

/// 凭据保管库解析出的连接端点
///
/// 引擎运行期只持有设备标识，端点与口令在建立连接的瞬间才解析，
/// 且从不落盘。
#[derive(Debug, Clone)]
pub struct DeviceEndpoint {
    pub device_id: DeviceId,
    pub address: String,
    pub api_port: u16,
    pub use_tls: bool,
    pub username: String,
    pub password: String,
}

/// 凭据保管库（外部协作方）
#[async_trait]
pub trait CredentialVault: Send + Sync {
    async fn resolve(&self, device_id: DeviceId) -> Result<DeviceEndpoint>;
}
