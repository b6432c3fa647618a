//! 执行结果汇
//!
//! 追加写 JSONL：一行一条记录，带齐设备、任务、重试次数与时间戳。
//! 任何终态（Succeeded/Failed/Exhausted）和每次 AwaitingRetry 周期
//! 都会落一条，不存在被吞掉的结果。

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use mikrofleet_core::{ExecutionRecord, ExecutionRecordSink, FleetError, Result};

pub struct JsonlRecordSink {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl JsonlRecordSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FleetError::Storage(format!("创建记录目录 {} 失败: {e}", parent.display()))
            })?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                FleetError::Storage(format!("打开记录文件 {} 失败: {e}", path.display()))
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl ExecutionRecordSink for JsonlRecordSink {
    async fn record(&self, record: &ExecutionRecord) -> Result<()> {
        let line = serde_json::to_string(record)
            .map_err(|e| FleetError::Internal(format!("执行记录序列化失败: {e}")))?;
        let mut file = self
            .file
            .lock()
            .map_err(|_| FleetError::Internal("记录文件锁中毒".to_string()))?;
        writeln!(file, "{line}").map_err(|e| {
            FleetError::Storage(format!("写入记录文件 {} 失败: {e}", self.path.display()))
        })?;
        Ok(())
    }
}

/// 内存结果汇，测试与嵌入式运行用
#[derive(Default)]
pub struct MemoryRecordSink {
    records: Mutex<Vec<ExecutionRecord>>,
}

impl MemoryRecordSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ExecutionRecordSink for MemoryRecordSink {
    async fn record(&self, record: &ExecutionRecord) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| FleetError::Internal("记录锁中毒".to_string()))?
            .push(record.clone());
        Ok(())
    }
}
