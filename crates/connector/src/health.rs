//! 后台健康检查
//!
//! 周期性对设备的协议端口做 TCP 连通探测并更新健康读模型。
//! 结果是建议性的：调度永远发起真实连接，不信任陈旧标志。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use mikrofleet_core::{CredentialVault, DeviceDirectory, DeviceEndpoint, HealthProbe, HealthState};

/// TCP 连通探测
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn probe(&self, endpoint: &DeviceEndpoint) -> HealthState {
        let connect = TcpStream::connect((endpoint.address.as_str(), endpoint.api_port));
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(_)) => HealthState::Reachable,
            _ => HealthState::Unreachable,
        }
    }
}

/// 健康检查循环
pub struct HealthChecker {
    directory: Arc<dyn DeviceDirectory>,
    vault: Arc<dyn CredentialVault>,
    probe: Arc<dyn HealthProbe>,
    interval: Duration,
}

impl HealthChecker {
    pub fn new(
        directory: Arc<dyn DeviceDirectory>,
        vault: Arc<dyn CredentialVault>,
        probe: Arc<dyn HealthProbe>,
        interval: Duration,
    ) -> Self {
        Self {
            directory,
            vault,
            probe,
            interval,
        }
    }

    /// 探测全部设备一轮
    pub async fn sweep(&self) {
        for device in self.directory.all_devices().await {
            let endpoint = match self.vault.resolve(device.id).await {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    warn!("设备 {} 凭据解析失败，跳过探测: {e}", device.label());
                    continue;
                }
            };
            let state = self.probe.probe(&endpoint).await;
            debug!("设备 {} 健康探测: {state:?}", device.label());
            self.directory.update_health(device.id, state).await;
        }
    }

    /// 后台运行，直到收到关闭信号
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!("健康检查启动，间隔 {:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                _ = shutdown.recv() => {
                    info!("健康检查退出");
                    return;
                }
            }
        }
    }
}
