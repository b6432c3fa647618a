//! RouterOS API 会话
//!
//! 负责登录、命令执行与地址列表的查询/增删。每次协议往返都带
//! 超时；超时与连接级故障会把会话标记为不可复用。

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use mikrofleet_core::{
    AddressListEntry, CommandReply, DeviceEndpoint, DeviceSession, EntryOp, EntryRejection,
    FleetError, Result, SessionFactory,
};

use crate::protocol::{parse_reply, read_sentence, write_sentence, ReplyKind};
use crate::tls;

const ADDRESS_LIST_PATH: &str = "/ip/firewall/address-list";

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// 基于 RouterOS 二进制 API 的设备会话
pub struct ApiSession {
    stream: Box<dyn AsyncStream>,
    label: String,
    io_timeout: Duration,
    usable: bool,
}

impl ApiSession {
    /// 建立连接并登录
    ///
    /// 连接阶段的失败一律按不可达处理（快速失败，从不等待设备恢复）；
    /// 登录被设备拒绝按认证失败处理。
    pub async fn open(
        endpoint: &DeviceEndpoint,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Result<Self> {
        let label = format!("{}:{}", endpoint.address, endpoint.api_port);
        let connect = TcpStream::connect((endpoint.address.as_str(), endpoint.api_port));
        let tcp = tokio::time::timeout(connect_timeout, connect)
            .await
            .map_err(|_| FleetError::Unreachable {
                device: label.clone(),
            })?
            .map_err(|e| FleetError::Unreachable {
                device: format!("{label} ({e})"),
            })?;

        let stream: Box<dyn AsyncStream> = if endpoint.use_tls {
            let tls_stream = tls::handshake(tcp, &endpoint.address, connect_timeout)
                .await
                .map_err(|e| FleetError::Unreachable {
                    device: format!("{label} (TLS: {e})"),
                })?;
            Box::new(tls_stream)
        } else {
            Box::new(tcp)
        };

        let mut session = Self {
            stream,
            label,
            io_timeout,
            usable: true,
        };
        session.login(&endpoint.username, &endpoint.password).await?;
        debug!("已登录设备 {}", session.label);
        Ok(session)
    }

    async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let words = vec![
            "/login".to_string(),
            format!("=name={username}"),
            format!("=password={password}"),
        ];
        match self.call_raw(&words, "login").await {
            Ok(_) => Ok(()),
            Err(FleetError::CommandRejected { .. }) => {
                self.usable = false;
                Err(FleetError::AuthenticationFailed {
                    device: self.label.clone(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// 发送一个句子并收取全部回复，直到 `!done`
    ///
    /// `!trap` 不会中断收取：记下错误信息，读到 `!done` 后再返回，
    /// 保证会话停留在句子边界上。
    async fn call_raw(&mut self, words: &[String], operation: &str) -> Result<CommandReply> {
        if !self.usable {
            return Err(FleetError::ConnectionReset(format!(
                "会话已失效: {}",
                self.label
            )));
        }

        let result = tokio::time::timeout(self.io_timeout, self.exchange(words)).await;
        match result {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                if e.poisons_session() {
                    self.usable = false;
                }
                Err(e)
            }
            Err(_) => {
                self.usable = false;
                Err(FleetError::Timeout {
                    operation: format!("{operation}@{}", self.label),
                })
            }
        }
    }

    async fn exchange(&mut self, words: &[String]) -> Result<CommandReply> {
        write_sentence(&mut self.stream, words).await?;

        let mut rows: CommandReply = Vec::new();
        let mut trap: Option<String> = None;
        loop {
            let sentence = read_sentence(&mut self.stream).await?;
            let (kind, attrs) = parse_reply(&sentence)?;
            match kind {
                ReplyKind::Re => rows.push(attrs),
                ReplyKind::Trap => {
                    let message = attrs
                        .get("message")
                        .cloned()
                        .unwrap_or_else(|| "未知设备错误".to_string());
                    trap.get_or_insert(message);
                }
                ReplyKind::Fatal => {
                    let message = attrs
                        .get("message")
                        .cloned()
                        .unwrap_or_else(|| "fatal".to_string());
                    return Err(FleetError::ConnectionReset(message));
                }
                ReplyKind::Done => break,
            }
        }

        match trap {
            Some(message) => Err(FleetError::CommandRejected { message }),
            None => Ok(rows),
        }
    }

    fn entry_from_row(list: &str, row: &BTreeMap<String, String>) -> Option<AddressListEntry> {
        Some(AddressListEntry {
            id: row.get(".id").cloned(),
            list: row
                .get("list")
                .cloned()
                .unwrap_or_else(|| list.to_string()),
            address: row.get("address")?.clone(),
            timeout: row.get("timeout").cloned(),
            comment: row.get("comment").cloned(),
            disabled: row.get("disabled").map(String::as_str) == Some("true"),
        })
    }
}

#[async_trait]
impl DeviceSession for ApiSession {
    async fn execute(&mut self, command: &str, args: &[(String, String)]) -> Result<CommandReply> {
        let mut words = Vec::with_capacity(args.len() + 1);
        words.push(command.to_string());
        for (key, value) in args {
            if let Some(query_key) = key.strip_prefix('?') {
                words.push(format!("?{query_key}={value}"));
            } else {
                words.push(format!("={key}={value}"));
            }
        }
        self.call_raw(&words, command).await
    }

    async fn query_address_list(&mut self, list: &str) -> Result<Vec<AddressListEntry>> {
        let words = vec![
            format!("{ADDRESS_LIST_PATH}/print"),
            format!("?list={list}"),
        ];
        let rows = self.call_raw(&words, "address-list/print").await?;
        Ok(rows
            .iter()
            .filter_map(|row| Self::entry_from_row(list, row))
            .collect())
    }

    async fn mutate_address_list(
        &mut self,
        list: &str,
        adds: &[AddressListEntry],
        removes: &[String],
    ) -> Result<Vec<EntryRejection>> {
        let mut rejections = Vec::new();

        for entry in adds {
            let mut words = vec![
                format!("{ADDRESS_LIST_PATH}/add"),
                format!("=list={list}"),
                format!("=address={}", entry.address),
            ];
            if let Some(comment) = &entry.comment {
                words.push(format!("=comment={comment}"));
            }
            if let Some(timeout) = &entry.timeout {
                words.push(format!("=timeout={timeout}"));
            }
            match self.call_raw(&words, "address-list/add").await {
                Ok(_) => {}
                // 值已存在的 add 是无操作，保持幂等
                Err(FleetError::CommandRejected { message })
                    if message.contains("already have") =>
                {
                    debug!("地址 {} 已在列表 {} 中，跳过", entry.address, list);
                }
                Err(FleetError::CommandRejected { message }) => {
                    rejections.push(EntryRejection {
                        address: entry.address.clone(),
                        op: EntryOp::Add,
                        reason: message,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        for address in removes {
            let query = vec![
                format!("{ADDRESS_LIST_PATH}/print"),
                format!("?list={list}"),
                format!("?address={address}"),
            ];
            let rows = self.call_raw(&query, "address-list/print").await?;
            if rows.is_empty() {
                // 已缺失的 remove 是无操作
                continue;
            }
            for row in rows {
                let Some(id) = row.get(".id") else {
                    warn!("设备返回的地址列表行缺少 .id: {row:?}");
                    continue;
                };
                let words = vec![
                    format!("{ADDRESS_LIST_PATH}/remove"),
                    format!("=.id={id}"),
                ];
                match self.call_raw(&words, "address-list/remove").await {
                    Ok(_) => {}
                    Err(FleetError::CommandRejected { message }) => {
                        rejections.push(EntryRejection {
                            address: address.clone(),
                            op: EntryOp::Remove,
                            reason: message,
                        });
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(rejections)
    }

    fn is_usable(&self) -> bool {
        self.usable
    }

    fn invalidate(&mut self) {
        self.usable = false;
    }
}

/// 生产用会话工厂
pub struct ApiSessionFactory {
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl ApiSessionFactory {
    pub fn new(connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            io_timeout,
        }
    }
}

#[async_trait]
impl SessionFactory for ApiSessionFactory {
    async fn open(&self, endpoint: &DeviceEndpoint) -> Result<Box<dyn DeviceSession>> {
        let session = ApiSession::open(endpoint, self.connect_timeout, self.io_timeout).await?;
        Ok(Box::new(session))
    }
}
