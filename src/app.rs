use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::info;

use mikrofleet_connector::{ApiSessionFactory, ConnectionPool, HealthChecker, TcpProbe};
use mikrofleet_core::AppConfig;
use mikrofleet_dispatcher::{Dispatcher, RetryQueue, RunQueue, Scheduler};
use mikrofleet_infrastructure::{
    load_fleet_file, FsBackupStorage, JsonlRecordSink, MemoryDeviceDirectory, MemoryTaskStore,
    StaticVault,
};
use mikrofleet_worker::CommandExecutor;

use crate::shutdown::ShutdownManager;

/// 组件装配与生命周期
pub struct Application {
    config: AppConfig,
    scheduler: Arc<Scheduler>,
    dispatcher: Arc<Dispatcher>,
    retry: Arc<RetryQueue>,
    health: Option<HealthChecker>,
    shutdown: ShutdownManager,
}

impl Application {
    pub fn build(config: AppConfig) -> Result<Self> {
        let (devices, groups, tasks) =
            load_fleet_file(&config.fleet_file).context("装载设备群定义失败")?;
        let store = Arc::new(MemoryTaskStore::new(tasks));
        let directory = Arc::new(MemoryDeviceDirectory::new(devices, groups));

        let vault = Arc::new(
            StaticVault::load(&config.credentials_file).context("装载凭据文件失败")?,
        );
        let sink = Arc::new(
            JsonlRecordSink::open(&config.records_file).context("打开执行记录文件失败")?,
        );
        let storage = Arc::new(FsBackupStorage::new(&config.backup_root));

        let connect_timeout = Duration::from_secs(config.connector.connect_timeout_seconds);
        let io_timeout = Duration::from_secs(config.connector.io_timeout_seconds);
        let factory = Arc::new(ApiSessionFactory::new(connect_timeout, io_timeout));
        let pool = Arc::new(ConnectionPool::new(
            vault.clone(),
            factory,
            directory.clone(),
        ));

        let probe = Arc::new(TcpProbe::new(Duration::from_secs(
            config.health.probe_timeout_seconds,
        )));
        let executor = Arc::new(CommandExecutor::new(
            storage,
            probe.clone(),
            vault.clone(),
            Duration::from_secs(config.connector.reboot_grace_seconds),
        ));

        let queue = Arc::new(RunQueue::new());
        let retry = Arc::new(RetryQueue::new(
            queue.clone(),
            sink.clone(),
            config.retry.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            directory.clone(),
            queue.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            queue,
            pool,
            executor,
            retry.clone(),
            sink,
            store,
            directory.clone(),
            config.dispatcher.worker_count,
        ));
        let health = HealthChecker::new(
            directory,
            vault,
            probe,
            Duration::from_secs(config.health.check_interval_seconds),
        );

        Ok(Self {
            config,
            scheduler,
            dispatcher,
            retry,
            health: Some(health),
            shutdown: ShutdownManager::new(),
        })
    }

    /// 启动全部后台组件并等待关闭信号
    pub async fn run(mut self) -> Result<()> {
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        if let Some(health) = self.health.take() {
            handles.push(tokio::spawn(health.run(self.shutdown.subscribe())));
        }
        handles.push(tokio::spawn(self.scheduler.clone().run(
            Duration::from_secs(self.config.scheduler.poll_interval_seconds),
            self.shutdown.subscribe(),
        )));
        handles.push(tokio::spawn(self.retry.clone().run(
            Duration::from_secs(self.config.retry.sweep_interval_seconds),
            self.shutdown.subscribe(),
        )));
        handles.extend(self.dispatcher.spawn_workers(self.shutdown.sender()));

        info!(
            "mikrofleet 已启动: {} 个工作协程, 调度间隔 {}s",
            self.config.dispatcher.worker_count, self.config.scheduler.poll_interval_seconds
        );

        tokio::signal::ctrl_c()
            .await
            .context("等待 Ctrl-C 信号失败")?;
        info!("收到中断信号，开始优雅关闭");
        self.shutdown.shutdown().await;

        for handle in handles {
            let _ = handle.await;
        }
        info!("全部组件已退出");
        Ok(())
    }
}
