use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

/// 优雅关闭管理器
///
/// 组件订阅关闭信号；触发后工作协程在完成手头的 TaskRun 之后退出。
pub struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    is_shutdown: Arc<RwLock<bool>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            is_shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// 订阅关闭信号
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// 取信号发送端（分发器按工作协程逐个订阅）
    pub fn sender(&self) -> &broadcast::Sender<()> {
        &self.shutdown_tx
    }

    /// 触发关闭，幂等
    pub async fn shutdown(&self) {
        let mut is_shutdown = self.is_shutdown.write().await;
        if *is_shutdown {
            debug!("关闭已经触发过");
            return;
        }
        *is_shutdown = true;

        let subscriber_count = self.shutdown_tx.receiver_count();
        info!("触发系统关闭，通知 {subscriber_count} 个订阅者");
        let _ = self.shutdown_tx.send(());
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
