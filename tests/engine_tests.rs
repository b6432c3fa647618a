//! 端到端场景：调度器 → 分发器 → 连接池/执行器 → 重试队列
//!
//! 设备侧用可编排的假会话工厂代替真实 RouterOS。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use tokio::sync::broadcast;

use mikrofleet_connector::{ConnectionPool, TcpProbe};
use mikrofleet_core::{
    Action, RetryConfig, Schedule, Target, Task, TaskRunStatus,
};
use mikrofleet_dispatcher::test_utils::{devices, ScriptedSessionFactory, StaticEndpointVault};
use mikrofleet_dispatcher::{Dispatcher, RetryQueue, RunQueue, Scheduler};
use mikrofleet_infrastructure::{
    FsBackupStorage, MemoryDeviceDirectory, MemoryRecordSink, MemoryTaskStore,
};
use mikrofleet_worker::CommandExecutor;

struct Engine {
    scheduler: Arc<Scheduler>,
    dispatcher: Arc<Dispatcher>,
    retry: Arc<RetryQueue>,
    sink: Arc<MemoryRecordSink>,
    factory: Arc<ScriptedSessionFactory>,
    shutdown: broadcast::Sender<()>,
    _backup_dir: tempfile::TempDir,
}

fn engine(tasks: Vec<Task>, device_ids: &[i64], groups: Vec<mikrofleet_core::DeviceGroup>) -> Engine {
    let backup_dir = tempfile::tempdir().expect("临时目录");
    let queue = Arc::new(RunQueue::new());
    let sink = Arc::new(MemoryRecordSink::new());
    let store = Arc::new(MemoryTaskStore::new(tasks));
    let directory = Arc::new(MemoryDeviceDirectory::new(devices(device_ids), groups));
    let vault = Arc::new(StaticEndpointVault);
    let factory = Arc::new(ScriptedSessionFactory::new());
    let pool = Arc::new(ConnectionPool::new(
        vault.clone(),
        factory.clone(),
        directory.clone(),
    ));
    let executor = Arc::new(CommandExecutor::new(
        Arc::new(FsBackupStorage::new(backup_dir.path())),
        Arc::new(TcpProbe::new(Duration::from_millis(100))),
        vault,
        Duration::from_millis(1),
    ));
    let retry = Arc::new(RetryQueue::new(
        queue.clone(),
        sink.clone(),
        RetryConfig {
            jitter_factor: 0.0,
            ..RetryConfig::default()
        },
    ));
    let scheduler = Arc::new(Scheduler::new(store.clone(), directory.clone(), queue.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        queue,
        pool,
        executor,
        retry.clone(),
        sink.clone(),
        store,
        directory,
        4,
    ));
    let (shutdown, _) = broadcast::channel(8);
    Engine {
        scheduler,
        dispatcher,
        retry,
        sink,
        factory,
        shutdown,
        _backup_dir: backup_dir,
    }
}

fn at(s: &str) -> DateTime<Utc> {
    s.parse().expect("时间字面量")
}

async fn wait_until<F: Fn() -> bool>(condition: F, what: &str) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("等待超时: {what}");
}

/// 场景：Daily 任务触发时设备不可达 → AwaitingRetry → 退避到期重新
/// 入队 → 成功。恰好一条 Succeeded 记录，重试周期逐条有记录。
#[tokio::test]
async fn daily_task_on_unreachable_device_retries_then_succeeds_once() {
    let task = Task {
        id: 1,
        name: "日常巡检".to_string(),
        action: Action::RunScript {
            script: "/system/identity/print".to_string(),
        },
        target: Target::Devices(vec![1]),
        schedule: Schedule::Daily(NaiveTime::from_hms_opt(3, 0, 0).unwrap()),
        timeout_seconds: 10,
        max_retries: 3,
        enabled: true,
    };
    let engine = engine(vec![task], &[1], vec![]);
    engine.factory.fail_first(1, 1);
    let handles = engine.dispatcher.spawn_workers(&engine.shutdown);

    // 上膛，然后越过 03:00 触发
    engine.scheduler.tick(at("2026-03-01T02:00:00Z")).await.unwrap();
    let fired = engine.scheduler.tick(at("2026-03-01T03:00:05Z")).await.unwrap();
    assert_eq!(fired, 1);

    let sink = engine.sink.clone();
    wait_until(
        || {
            sink.records()
                .iter()
                .any(|r| r.outcome == TaskRunStatus::AwaitingRetry)
        },
        "首次尝试进入重试等待",
    )
    .await;

    // 退避到期：把时钟拨到未来做一次扫描
    let rearmed = engine.retry.sweep(Utc::now() + chrono::Duration::hours(1));
    assert_eq!(rearmed, 1);

    let sink = engine.sink.clone();
    wait_until(
        || {
            sink.records()
                .iter()
                .any(|r| r.outcome == TaskRunStatus::Succeeded)
        },
        "重试后成功",
    )
    .await;

    let records = engine.sink.records();
    let succeeded: Vec<_> = records
        .iter()
        .filter(|r| r.outcome == TaskRunStatus::Succeeded)
        .collect();
    let awaiting = records
        .iter()
        .filter(|r| r.outcome == TaskRunStatus::AwaitingRetry)
        .count();
    // 恰好一条 Succeeded，不重复；重试周期逐条可见
    assert_eq!(succeeded.len(), 1);
    assert_eq!(succeeded[0].retry_count, 1);
    assert_eq!(awaiting, 1);

    let _ = engine.shutdown.send(());
    for handle in handles {
        let _ = handle.await;
    }
}

/// 场景：三台设备的分组下发 BlackList 封禁，其中一台不可达。
/// 组级完成度是成员结果的合取：两条 Succeeded + 一条 AwaitingRetry，
/// 补试后第三条 Succeeded；从不把分组折叠成单条原子成败。
#[tokio::test]
async fn group_blacklist_add_reports_per_device_outcomes() {
    let group = mikrofleet_core::DeviceGroup {
        id: 20,
        name: "全部边界".to_string(),
        device_ids: vec![1, 2, 3],
    };
    let task = Task {
        id: 2,
        name: "封禁扫描源".to_string(),
        action: Action::MutateAddressList {
            list: "BLAddress".to_string(),
            semantics: None,
            add: vec!["203.0.113.9".to_string()],
            remove: vec![],
            comment: Some("scanner".to_string()),
        },
        target: Target::Group(20),
        schedule: Schedule::Once(at("2026-03-01T12:30:00Z")),
        timeout_seconds: 10,
        max_retries: 2,
        enabled: true,
    };
    let engine = engine(vec![task], &[1, 2, 3], vec![group]);
    engine.factory.fail_first(3, 1);
    let handles = engine.dispatcher.spawn_workers(&engine.shutdown);

    engine.scheduler.tick(at("2026-03-01T12:00:00Z")).await.unwrap();
    let fired = engine.scheduler.tick(at("2026-03-01T13:00:00Z")).await.unwrap();
    assert_eq!(fired, 3, "每台成员设备一个独立实例");

    let sink = engine.sink.clone();
    wait_until(
        || {
            let records = sink.records();
            records
                .iter()
                .filter(|r| r.outcome == TaskRunStatus::Succeeded)
                .count()
                == 2
                && records
                    .iter()
                    .any(|r| r.outcome == TaskRunStatus::AwaitingRetry)
        },
        "两台成功、一台进入重试等待",
    )
    .await;

    // 不可达设备恢复后补试成功
    assert_eq!(engine.retry.sweep(Utc::now() + chrono::Duration::hours(1)), 1);
    let sink = engine.sink.clone();
    wait_until(
        || {
            sink.records()
                .iter()
                .filter(|r| r.outcome == TaskRunStatus::Succeeded)
                .count()
                == 3
        },
        "第三台补试成功",
    )
    .await;

    let records = engine.sink.records();
    let mut succeeded_devices: Vec<i64> = records
        .iter()
        .filter(|r| r.outcome == TaskRunStatus::Succeeded)
        .map(|r| r.device_id)
        .collect();
    succeeded_devices.sort_unstable();
    assert_eq!(succeeded_devices, vec![1, 2, 3]);

    let _ = engine.shutdown.send(());
    for handle in handles {
        let _ = handle.await;
    }
}
