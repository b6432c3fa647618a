use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{FleetError, Result};

/// 应用配置
///
/// TOML 文件加环境变量覆盖（前缀 `MIKROFLEET`，层级分隔符 `__`），
/// 全部字段都有可运行的缺省值。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 设备、分组与任务定义文件
    pub fleet_file: PathBuf,
    /// 凭据文件（与设备身份分开存放）
    pub credentials_file: PathBuf,
    /// 执行结果汇的 JSONL 输出路径
    pub records_file: PathBuf,
    /// 备份存储根目录
    pub backup_root: PathBuf,
    pub scheduler: SchedulerConfig,
    pub dispatcher: DispatcherConfig,
    pub connector: ConnectorConfig,
    pub health: HealthConfig,
    pub retry: RetryConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            fleet_file: PathBuf::from("config/fleet.toml"),
            credentials_file: PathBuf::from("config/credentials.toml"),
            records_file: PathBuf::from("data/records.jsonl"),
            backup_root: PathBuf::from("data/backups"),
            scheduler: SchedulerConfig::default(),
            dispatcher: DispatcherConfig::default(),
            connector: ConnectorConfig::default(),
            health: HealthConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 调度轮询间隔（秒）
    pub poll_interval_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// 并发工作协程数，即同时打开的设备会话上限
    pub worker_count: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { worker_count: 8 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    pub connect_timeout_seconds: u64,
    /// 单次协议往返超时
    pub io_timeout_seconds: u64,
    /// 重启后健康复查前的宽限期
    pub reboot_grace_seconds: u64,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: 5,
            io_timeout_seconds: 10,
            reboot_grace_seconds: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval_seconds: u64,
    pub probe_timeout_seconds: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: 60,
            probe_timeout_seconds: 3,
        }
    }
}

/// 重试策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 基础重试间隔（秒）
    pub base_interval_seconds: u64,
    /// 最大重试间隔（秒）
    pub max_interval_seconds: u64,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
    /// 到期票据的扫描间隔（秒）
    pub sweep_interval_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_interval_seconds: 60,
            max_interval_seconds: 3600,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            sweep_interval_seconds: 5,
        }
    }
}

impl AppConfig {
    /// 从文件加载并套用环境变量覆盖
    pub fn load(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("MIKROFLEET")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| FleetError::Configuration(format!("配置加载失败: {e}")))?;

        let app_config: AppConfig = settings
            .try_deserialize()
            .map_err(|e| FleetError::Configuration(format!("配置解析失败: {e}")))?;

        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dispatcher.worker_count == 0 {
            return Err(FleetError::Configuration(
                "dispatcher.worker_count 必须大于 0".to_string(),
            ));
        }
        if self.scheduler.poll_interval_seconds == 0 {
            return Err(FleetError::Configuration(
                "scheduler.poll_interval_seconds 必须大于 0".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(FleetError::Configuration(
                "retry.backoff_multiplier 不能小于 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(FleetError::Configuration(
                "retry.jitter_factor 必须在 0.0-1.0 之间".to_string(),
            ));
        }
        if self.retry.base_interval_seconds == 0
            || self.retry.max_interval_seconds < self.retry.base_interval_seconds
        {
            return Err(FleetError::Configuration(
                "retry 间隔配置不合法".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatcher.worker_count, 8);
        assert_eq!(config.retry.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_load_from_toml_with_partial_overrides() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[dispatcher]
worker_count = 3

[retry]
base_interval_seconds = 10
max_interval_seconds = 120
"#
        )
        .unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.dispatcher.worker_count, 3);
        assert_eq!(config.retry.base_interval_seconds, 10);
        // 未覆盖的字段保持缺省
        assert_eq!(config.scheduler.poll_interval_seconds, 30);
    }

    #[test]
    fn test_invalid_jitter_rejected() {
        let mut config = AppConfig::default();
        config.retry.jitter_factor = 1.5;
        assert!(config.validate().is_err());
    }
}
