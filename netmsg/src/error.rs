//! 错误类型定义

use thiserror::Error;

/// 网络库错误类型
#[derive(Error, Debug)]
pub enum NetError {
    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 地址解析失败
    #[error("Address resolution failed: {addr}")]
    Resolution { addr: String },

    /// 连接超时
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// 连接已关闭
    #[error("Connection closed")]
    ConnectionClosed,

    /// 握手应答与预期不符
    #[error("Handshake response mismatch")]
    HandshakeMismatch,

    /// 帧大小超限
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// 未知的消息类型编号
    #[error("Unknown message id: {0}")]
    UnknownMessageId(u32),

    /// 消息体剩余字节不足以弹出请求的类型
    #[error("Message body underflow: need {needed} bytes, {available} available")]
    Underflow { needed: usize, available: usize },

    /// 对空队列执行非阻塞弹出
    #[error("Queue is empty")]
    QueueEmpty,
}

/// 网络库操作结果类型
pub type Result<T> = std::result::Result<T, NetError>;
