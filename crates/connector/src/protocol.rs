//! RouterOS API 线协议编解码
//!
//! 句子由若干词组成，词带变长长度前缀，空词结束一个句子。
//! 回复句子的首词是 `!re`/`!done`/`!trap`/`!fatal` 之一，
//! 属性词形如 `=key=value`。

use std::collections::BTreeMap;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use mikrofleet_core::{FleetError, Result};

/// 单词长度上限，超出按协议错误处理
const MAX_WORD_LEN: u32 = 16 * 1024 * 1024;

/// 变长长度前缀编码
pub fn encode_length(len: u32, buf: &mut Vec<u8>) {
    if len < 0x80 {
        buf.push(len as u8);
    } else if len < 0x4000 {
        let v = len | 0x8000;
        buf.extend_from_slice(&v.to_be_bytes()[2..]);
    } else if len < 0x20_0000 {
        let v = len | 0xC0_0000;
        buf.extend_from_slice(&v.to_be_bytes()[1..]);
    } else if len < 0x1000_0000 {
        let v = len | 0xE000_0000;
        buf.extend_from_slice(&v.to_be_bytes());
    } else {
        buf.push(0xF0);
        buf.extend_from_slice(&len.to_be_bytes());
    }
}

/// 读取变长长度前缀
pub async fn read_length<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u32> {
    let first = read_byte(reader).await?;
    let len = if first & 0x80 == 0 {
        u32::from(first)
    } else if first & 0xC0 == 0x80 {
        let b1 = read_byte(reader).await?;
        (u32::from(first & 0x3F) << 8) | u32::from(b1)
    } else if first & 0xE0 == 0xC0 {
        let b1 = read_byte(reader).await?;
        let b2 = read_byte(reader).await?;
        (u32::from(first & 0x1F) << 16) | (u32::from(b1) << 8) | u32::from(b2)
    } else if first & 0xF0 == 0xE0 {
        let b1 = read_byte(reader).await?;
        let b2 = read_byte(reader).await?;
        let b3 = read_byte(reader).await?;
        (u32::from(first & 0x0F) << 24)
            | (u32::from(b1) << 16)
            | (u32::from(b2) << 8)
            | u32::from(b3)
    } else if first == 0xF0 {
        let mut raw = [0u8; 4];
        reader
            .read_exact(&mut raw)
            .await
            .map_err(|e| FleetError::ConnectionReset(e.to_string()))?;
        u32::from_be_bytes(raw)
    } else {
        return Err(FleetError::Protocol(format!(
            "非法的长度前缀字节: 0x{first:02X}"
        )));
    };

    if len > MAX_WORD_LEN {
        return Err(FleetError::Protocol(format!("单词长度越界: {len}")));
    }
    Ok(len)
}

async fn read_byte<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u8> {
    let mut byte = [0u8; 1];
    reader
        .read_exact(&mut byte)
        .await
        .map_err(|e| FleetError::ConnectionReset(e.to_string()))?;
    Ok(byte[0])
}

/// 写出一个完整句子（含结尾空词）并刷新
pub async fn write_sentence<W: AsyncWrite + Unpin>(writer: &mut W, words: &[String]) -> Result<()> {
    let mut buf = Vec::new();
    for word in words {
        let bytes = word.as_bytes();
        encode_length(bytes.len() as u32, &mut buf);
        buf.extend_from_slice(bytes);
    }
    buf.push(0);
    writer
        .write_all(&buf)
        .await
        .map_err(|e| FleetError::ConnectionReset(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| FleetError::ConnectionReset(e.to_string()))?;
    Ok(())
}

/// 读取一个句子，直到空词
pub async fn read_sentence<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<String>> {
    let mut words = Vec::new();
    loop {
        let len = read_length(reader).await?;
        if len == 0 {
            return Ok(words);
        }
        let mut raw = vec![0u8; len as usize];
        reader
            .read_exact(&mut raw)
            .await
            .map_err(|e| FleetError::ConnectionReset(e.to_string()))?;
        words.push(String::from_utf8_lossy(&raw).into_owned());
    }
}

/// 回复句子类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Re,
    Done,
    Trap,
    Fatal,
}

/// 解析一个回复句子为类别加属性映射
pub fn parse_reply(words: &[String]) -> Result<(ReplyKind, BTreeMap<String, String>)> {
    let first = words
        .first()
        .ok_or_else(|| FleetError::Protocol("空回复句子".to_string()))?;
    let kind = match first.as_str() {
        "!re" => ReplyKind::Re,
        "!done" => ReplyKind::Done,
        "!trap" => ReplyKind::Trap,
        "!fatal" => ReplyKind::Fatal,
        other => {
            return Err(FleetError::Protocol(format!("未知回复词: {other}")));
        }
    };

    let mut attrs = BTreeMap::new();
    for word in &words[1..] {
        if let Some(rest) = word.strip_prefix('=') {
            if let Some((key, value)) = rest.split_once('=') {
                attrs.insert(key.to_string(), value.to_string());
            }
        } else if kind == ReplyKind::Fatal {
            // !fatal 的正文可能不带键
            attrs.insert("message".to_string(), word.clone());
        }
    }
    Ok((kind, attrs))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip_length(len: u32) -> u32 {
        let mut buf = Vec::new();
        encode_length(len, &mut buf);
        let mut reader = buf.as_slice();
        read_length(&mut reader).await.unwrap()
    }

    #[tokio::test]
    async fn test_length_encoding_boundaries() {
        // 各档编码的边界值
        for len in [0, 1, 0x7F, 0x80, 0x3FFF, 0x4000, 0x1F_FFFF, 0x20_0000, 0xFF_FFFF] {
            assert_eq!(roundtrip_length(len).await, len, "len={len}");
        }
    }

    #[tokio::test]
    async fn test_length_prefix_sizes() {
        let mut buf = Vec::new();
        encode_length(0x7F, &mut buf);
        assert_eq!(buf.len(), 1);

        buf.clear();
        encode_length(0x80, &mut buf);
        assert_eq!(buf.len(), 2);

        buf.clear();
        encode_length(0x4000, &mut buf);
        assert_eq!(buf.len(), 3);
    }

    #[tokio::test]
    async fn test_sentence_roundtrip() {
        let words = vec![
            "/ip/firewall/address-list/print".to_string(),
            "?list=WhiteList".to_string(),
        ];
        let mut buf = Vec::new();
        for word in &words {
            encode_length(word.len() as u32, &mut buf);
            buf.extend_from_slice(word.as_bytes());
        }
        buf.push(0);

        let mut reader = buf.as_slice();
        let parsed = read_sentence(&mut reader).await.unwrap();
        assert_eq!(parsed, words);
    }

    #[test]
    fn test_parse_trap_reply() {
        let words = vec![
            "!trap".to_string(),
            "=message=failure: already have such entry".to_string(),
        ];
        let (kind, attrs) = parse_reply(&words).unwrap();
        assert_eq!(kind, ReplyKind::Trap);
        assert_eq!(
            attrs.get("message").map(String::as_str),
            Some("failure: already have such entry")
        );
    }

    #[test]
    fn test_parse_re_attributes() {
        let words = vec![
            "!re".to_string(),
            "=.id=*1A".to_string(),
            "=address=10.0.0.5".to_string(),
            "=list=WhiteList".to_string(),
        ];
        let (kind, attrs) = parse_reply(&words).unwrap();
        assert_eq!(kind, ReplyKind::Re);
        assert_eq!(attrs.get(".id").map(String::as_str), Some("*1A"));
        assert_eq!(attrs.get("address").map(String::as_str), Some("10.0.0.5"));
    }
}
