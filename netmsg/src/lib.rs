//! 消息帧 TCP 客户端/服务端网络库
//!
//! 包含:
//! - 消息类型与定长字段编码 (Message, FixedField)
//! - 线程安全双端队列 (TsQueue)
//! - 帧编解码与握手 (FrameReader, FrameWriter)
//! - 连接状态机 (Connection)
//! - 客户端/服务端编排器 (Client, Server)

mod client;
mod codec;
mod connection;
mod constants;
mod error;
mod message;
mod queue;
mod server;
mod transport;

pub use client::Client;
pub use codec::{FrameReader, FrameWriter};
pub use connection::{Connection, ConnectionState, Role};
pub use constants::*;
pub use error::{NetError, Result};
pub use message::{FixedField, Message, MessageHeader, MessageId, OwnedMessage};
pub use queue::TsQueue;
pub use server::{Server, ServerContext, ServerHandler};
pub use transport::{TcpListener, TcpTransport, Transport, TransportConfig, TransportListener};
