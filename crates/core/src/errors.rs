use thiserror::Error;

/// 引擎统一错误类型定义
///
/// 瞬时错误（设备不可达、超时、连接被重置）交给重试队列，
/// 其余错误对当前 TaskRun 是终态。
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("设备不可达: {device}")]
    Unreachable { device: String },

    #[error("操作超时: {operation}")]
    Timeout { operation: String },

    #[error("连接被重置: {0}")]
    ConnectionReset(String),

    #[error("设备认证失败: {device}")]
    AuthenticationFailed { device: String },

    #[error("设备拒绝执行命令: {message}")]
    CommandRejected { message: String },

    #[error("地址列表核对冲突: 列表 {list} 缺失 {} 项、多余 {} 项", missing.len(), extra.len())]
    ReconciliationConflict {
        list: String,
        missing: Vec<String>,
        extra: Vec<String>,
    },

    #[error("备份完整性校验失败: {device} - {message}")]
    BackupIntegrity { device: String, message: String },

    #[error("无效的调度表达式: {expr} - {message}")]
    InvalidSchedule { expr: String, message: String },

    #[error("任务已取消")]
    Cancelled,

    #[error("任务未找到: {id}")]
    TaskNotFound { id: i64 },

    #[error("设备未找到: {id}")]
    DeviceNotFound { id: i64 },

    #[error("协议错误: {0}")]
    Protocol(String),

    #[error("凭据解析失败: {0}")]
    Vault(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl FleetError {
    /// 瞬时错误路由到重试队列，其余直接终态
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FleetError::Unreachable { .. }
                | FleetError::Timeout { .. }
                | FleetError::ConnectionReset(_)
        )
    }

    /// 错误发生后会话是否仍可复用
    ///
    /// 超时和连接级故障之后会话状态不可信，必须丢弃重建。
    pub fn poisons_session(&self) -> bool {
        matches!(
            self,
            FleetError::Unreachable { .. }
                | FleetError::Timeout { .. }
                | FleetError::ConnectionReset(_)
                | FleetError::Protocol(_)
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FleetError::Unreachable { .. } => ErrorKind::Unreachable,
            FleetError::Timeout { .. } => ErrorKind::Timeout,
            FleetError::ConnectionReset(_) => ErrorKind::ConnectionReset,
            FleetError::AuthenticationFailed { .. } => ErrorKind::AuthenticationFailed,
            FleetError::CommandRejected { .. } => ErrorKind::CommandRejected,
            FleetError::ReconciliationConflict { .. } => ErrorKind::ReconciliationConflict,
            FleetError::BackupIntegrity { .. } => ErrorKind::BackupIntegrity,
            FleetError::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Other,
        }
    }
}

/// 记录到执行结果中的错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Unreachable,
    Timeout,
    ConnectionReset,
    AuthenticationFailed,
    CommandRejected,
    ReconciliationConflict,
    BackupIntegrity,
    Cancelled,
    Other,
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        // 只有不可达、超时、连接重置三类是瞬时错误
        assert!(FleetError::Unreachable {
            device: "r1".into()
        }
        .is_transient());
        assert!(FleetError::Timeout {
            operation: "login".into()
        }
        .is_transient());
        assert!(FleetError::ConnectionReset("eof".into()).is_transient());

        assert!(!FleetError::AuthenticationFailed {
            device: "r1".into()
        }
        .is_transient());
        assert!(!FleetError::CommandRejected {
            message: "bad script".into()
        }
        .is_transient());
        assert!(!FleetError::ReconciliationConflict {
            list: "WhiteList".into(),
            missing: vec!["10.0.0.1".into()],
            extra: vec![],
        }
        .is_transient());
        assert!(!FleetError::Cancelled.is_transient());
    }

    #[test]
    fn test_session_poisoning() {
        assert!(FleetError::Timeout {
            operation: "print".into()
        }
        .poisons_session());
        assert!(!FleetError::CommandRejected {
            message: "x".into()
        }
        .poisons_session());
    }
}
