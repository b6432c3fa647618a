//! 设备连接池
//!
//! 每台设备一个会话槽位，惰性建立、跨 TaskRun 复用。acquire 快速
//! 失败：设备不可达直接返回错误交给重试队列，从不原地等待设备
//! 恢复。健康状态随真实连接结果同步更新。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use mikrofleet_core::{
    CredentialVault, Device, DeviceDirectory, DeviceId, DeviceSession, HealthState, Result,
    SessionFactory,
};

pub struct ConnectionPool {
    vault: Arc<dyn CredentialVault>,
    factory: Arc<dyn SessionFactory>,
    directory: Arc<dyn DeviceDirectory>,
    idle: Mutex<HashMap<DeviceId, Box<dyn DeviceSession>>>,
}

impl ConnectionPool {
    pub fn new(
        vault: Arc<dyn CredentialVault>,
        factory: Arc<dyn SessionFactory>,
        directory: Arc<dyn DeviceDirectory>,
    ) -> Self {
        Self {
            vault,
            factory,
            directory,
            idle: Mutex::new(HashMap::new()),
        }
    }

    /// 取得设备会话：优先复用空闲槽位，否则解析凭据并新建
    ///
    /// 调用方持有该设备的准入锁，因此同一设备同一时刻至多有一个
    /// 会话被借出。
    pub async fn acquire(&self, device: &Device) -> Result<Box<dyn DeviceSession>> {
        if let Some(session) = self.idle.lock().await.remove(&device.id) {
            if session.is_usable() {
                debug!("复用设备 {} 的空闲会话", device.label());
                return Ok(session);
            }
            // 槽位里的会话已失效，丢弃后重建
            debug!("设备 {} 的空闲会话已失效，重建", device.label());
        }

        let endpoint = self.vault.resolve(device.id).await?;
        match self.factory.open(&endpoint).await {
            Ok(session) => {
                self.directory
                    .update_health(device.id, HealthState::Reachable)
                    .await;
                Ok(session)
            }
            Err(e) => {
                if e.is_transient() {
                    self.directory
                        .update_health(device.id, HealthState::Unreachable)
                        .await;
                }
                Err(e)
            }
        }
    }

    /// 归还会话；协议层已标记不可用的直接丢弃，下次 acquire 惰性重建
    pub async fn release(&self, device_id: DeviceId, session: Box<dyn DeviceSession>) {
        if session.is_usable() {
            self.idle.lock().await.insert(device_id, session);
        } else {
            warn!("设备 {device_id} 的会话不再可用，予以丢弃");
        }
    }

    /// 主动作废某设备的空闲槽位（例如重启之后）
    pub async fn invalidate(&self, device_id: DeviceId) {
        self.idle.lock().await.remove(&device_id);
    }

    /// 当前空闲会话数，测试与观测用
    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }
}
