//! 静态凭据保管库
//!
//! 凭据与设备身份分开存放在单独的 TOML 文件里；引擎运行期只握
//! 设备标识，端点与口令在连接瞬间解析，绝不回写任何存储。

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use mikrofleet_core::{CredentialVault, DeviceEndpoint, DeviceId, FleetError, Result};

#[derive(Debug, Deserialize)]
struct CredentialDocument {
    #[serde(default)]
    credentials: Vec<CredentialEntry>,
}

#[derive(Debug, Deserialize)]
struct CredentialEntry {
    device_id: DeviceId,
    address: String,
    #[serde(default = "default_api_port")]
    api_port: u16,
    #[serde(default)]
    use_tls: bool,
    username: String,
    password: String,
}

fn default_api_port() -> u16 {
    8728
}

pub struct StaticVault {
    entries: HashMap<DeviceId, CredentialEntry>,
}

impl StaticVault {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FleetError::Configuration(format!("读取凭据文件 {} 失败: {e}", path.display()))
        })?;
        let doc: CredentialDocument = toml::from_str(&content).map_err(|e| {
            FleetError::Configuration(format!("解析凭据文件 {} 失败: {e}", path.display()))
        })?;
        Ok(Self {
            entries: doc
                .credentials
                .into_iter()
                .map(|entry| (entry.device_id, entry))
                .collect(),
        })
    }
}

#[async_trait]
impl CredentialVault for StaticVault {
    async fn resolve(&self, device_id: DeviceId) -> Result<DeviceEndpoint> {
        let entry = self
            .entries
            .get(&device_id)
            .ok_or_else(|| FleetError::Vault(format!("设备 {device_id} 没有凭据")))?;
        Ok(DeviceEndpoint {
            device_id,
            address: entry.address.clone(),
            api_port: entry.api_port,
            use_tls: entry.use_tls,
            username: entry.username.clone(),
            password: entry.password.clone(),
        })
    }
}
