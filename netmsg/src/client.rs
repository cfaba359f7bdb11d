//! 客户端编排器
//!
//! 恰好持有一条连接和一个专属 IO 线程。线程内运行单线程 tokio
//! 运行时，该连接的全部读写和关闭都串行发生在这个执行上下文里。

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::connection::{run_session, wait_shutdown, Command, Connection, ConnectionState, Role};
use crate::error::{NetError, Result};
use crate::message::{Message, MessageId, OwnedMessage};
use crate::queue::TsQueue;
use crate::transport::{TcpTransport, Transport, TransportConfig};

/// 客户端编排器
pub struct Client<T: MessageId> {
    /// 当前连接，未连接时为 None
    connection: Option<Arc<Connection<T>>>,
    /// 入站消息共享队列，应用层轮询取用
    inbound: Arc<TsQueue<OwnedMessage<T>>>,
    /// IO 线程句柄
    io_thread: Option<thread::JoinHandle<()>>,
    /// 关闭信号发送端
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl<T: MessageId> Client<T> {
    /// 创建未连接的客户端
    pub fn new() -> Self {
        Self {
            connection: None,
            inbound: Arc::new(TsQueue::new()),
            io_thread: None,
            shutdown_tx: None,
        }
    }

    /// 连接服务器
    ///
    /// 同步解析主机名并启动 IO 线程。解析失败或运行时创建失败
    /// 直接返回错误且无任何副作用。返回 `Ok` 只说明启动成功，
    /// 握手在后台完成，以 [`Client::is_connected`] 为准。
    pub fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        // 地址只在连接时解析一次
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|_| NetError::Resolution {
                addr: format!("{}:{}", host, port),
            })?
            .collect();
        if addrs.is_empty() {
            return Err(NetError::Resolution {
                addr: format!("{}:{}", host, port),
            });
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        // 旧连接（若有）先行释放
        self.disconnect();

        let (conn, cmd_rx) = Connection::pair(Role::Client);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let io_conn = Arc::clone(&conn);
        let inbound = Arc::clone(&self.inbound);
        let handle = thread::Builder::new()
            .name("netmsg-client".into())
            .spawn(move || {
                runtime.block_on(client_io(io_conn, cmd_rx, addrs, inbound, shutdown_rx));
            })?;

        info!("client connecting to {}:{}", host, port);
        self.connection = Some(conn);
        self.shutdown_tx = Some(shutdown_tx);
        self.io_thread = Some(handle);
        Ok(())
    }

    /// 断开连接并回收 IO 线程
    ///
    /// 未连接时为空操作。返回前等待 IO 线程退出，保证套接字
    /// 已在其执行上下文内关闭完毕。
    pub fn disconnect(&mut self) {
        if let Some(conn) = &self.connection {
            conn.disconnect();
        }
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.io_thread.take() {
            let _ = handle.join();
        }
        if let Some(conn) = self.connection.take() {
            conn.set_state(ConnectionState::Closed);
        }
    }

    /// 是否存在处于开放状态的连接
    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().map_or(false, |c| c.is_open())
    }

    /// 入站消息队列，供应用层轮询
    pub fn incoming(&self) -> &TsQueue<OwnedMessage<T>> {
        &self.inbound
    }

    /// 发送一条消息
    ///
    /// 未连接时静默丢弃（仅留一条调试日志），不向调用方报错。
    pub fn send(&self, message: Message<T>) {
        match &self.connection {
            Some(conn) if conn.is_open() => conn.send(message),
            _ => debug!("send while disconnected, message dropped"),
        }
    }
}

impl<T: MessageId> Default for Client<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: MessageId> Drop for Client<T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// 客户端 IO 线程主体
async fn client_io<T: MessageId>(
    conn: Arc<Connection<T>>,
    cmd_rx: mpsc::UnboundedReceiver<Command<T>>,
    addrs: Vec<SocketAddr>,
    inbound: Arc<TsQueue<OwnedMessage<T>>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = drive_client(conn, cmd_rx, addrs, inbound) => {}
        _ = wait_shutdown(&mut shutdown_rx) => {}
    }
}

/// 建立传输并驱动会话直至其自然结束
async fn drive_client<T: MessageId>(
    conn: Arc<Connection<T>>,
    cmd_rx: mpsc::UnboundedReceiver<Command<T>>,
    addrs: Vec<SocketAddr>,
    inbound: Arc<TsQueue<OwnedMessage<T>>>,
) {
    let config = TransportConfig::default();
    let transport = match connect_any(&addrs, &config).await {
        Ok(transport) => transport,
        Err(e) => {
            warn!("connect failed: {}", e);
            conn.set_state(ConnectionState::Closed);
            return;
        }
    };

    let (reader, writer) = transport.split();
    run_session(conn, reader, writer, cmd_rx, inbound, None).await;
}

/// 依次尝试解析出的各个地址
async fn connect_any(addrs: &[SocketAddr], config: &TransportConfig) -> Result<TcpTransport> {
    let mut last_err = None;
    for addr in addrs {
        match TcpTransport::connect(*addr, config).await {
            Ok(transport) => return Ok(transport),
            Err(e) => {
                debug!("connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    // addrs 非空，至少记录过一次错误
    Err(last_err.unwrap_or(NetError::ConnectionTimeout))
}
