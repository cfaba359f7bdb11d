//! 协议常量定义

use std::time::Duration;

/// 消息体最大大小（超过则视为帧损坏并断开连接）
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// 连接超时（秒）
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// 连接超时 Duration
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(CONNECT_TIMEOUT_SECS);

/// 服务端分配的首个客户端 ID
///
/// 从 10000 起单调递增，与客户端侧默认 ID (0) 明显区分。
pub const FIRST_CLIENT_ID: u32 = 10000;
