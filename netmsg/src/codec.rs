//! 帧编解码
//!
//! 帧格式:
//! ```text
//! ┌────────────┬────────────┬────────────────────────────────┐
//! │   Id (4B)  │  Size (4B) │        Body (raw bytes)        │
//! │   u32 LE   │   u32 LE   │         恰好 Size 字节          │
//! └────────────┴────────────┴────────────────────────────────┘
//! ```
//!
//! 握手值（8 字节 u64）不带帧头，直接以小端序裸写在流上。
//! 无魔数、无版本号：两端由同一份类型定义构建，协议为封闭系统。

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::MAX_BODY_SIZE;
use crate::error::{NetError, Result};
use crate::message::{Message, MessageHeader, MessageId};

/// 帧头大小: 4 字节类型编号 + 4 字节消息体长度
const HEADER_SIZE: usize = 8;

/// 握手值大小
const HANDSHAKE_SIZE: usize = 8;

/// 帧读取器
pub struct FrameReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// 创建新的帧读取器
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// 读取并解码一帧消息
    ///
    /// 先读定长帧头，再按头部声明的长度读消息体。
    pub async fn read_frame<T: MessageId>(&mut self) -> Result<Message<T>> {
        // 读取帧头
        let mut header = [0u8; HEADER_SIZE];
        self.reader.read_exact(&mut header).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                NetError::ConnectionClosed
            } else {
                NetError::Io(e)
            }
        })?;

        let raw_id = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

        let id = T::from_wire(raw_id).ok_or(NetError::UnknownMessageId(raw_id))?;

        // 检查消息体大小
        if size > MAX_BODY_SIZE {
            return Err(NetError::FrameTooLarge {
                size,
                max: MAX_BODY_SIZE,
            });
        }

        // 读取消息体
        let mut body = vec![0u8; size];
        if size > 0 {
            self.reader.read_exact(&mut body).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    NetError::ConnectionClosed
                } else {
                    NetError::Io(e)
                }
            })?;
        }

        Ok(Message {
            header: MessageHeader {
                id,
                size: size as u32,
            },
            body,
        })
    }

    /// 读取一个不带帧头的 8 字节握手值
    pub async fn read_handshake(&mut self) -> Result<u64> {
        let mut raw = [0u8; HANDSHAKE_SIZE];
        self.reader.read_exact(&mut raw).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                NetError::ConnectionClosed
            } else {
                NetError::Io(e)
            }
        })?;
        Ok(u64::from_le_bytes(raw))
    }
}

/// 帧写入器
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// 创建新的帧写入器
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// 编码并写入一帧消息
    pub async fn write_frame<T: MessageId>(&mut self, msg: &Message<T>) -> Result<()> {
        if msg.body.len() > MAX_BODY_SIZE {
            return Err(NetError::FrameTooLarge {
                size: msg.body.len(),
                max: MAX_BODY_SIZE,
            });
        }

        // 构造帧头
        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&msg.header.id.to_wire().to_le_bytes());
        header[4..8].copy_from_slice(&msg.header.size.to_le_bytes());

        // 写入帧头和消息体
        self.writer.write_all(&header).await?;
        if !msg.body.is_empty() {
            self.writer.write_all(&msg.body).await?;
        }
        self.writer.flush().await?;

        Ok(())
    }

    /// 写入一个不带帧头的 8 字节握手值
    pub async fn write_handshake(&mut self, value: u64) -> Result<()> {
        self.writer.write_all(&value.to_le_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
