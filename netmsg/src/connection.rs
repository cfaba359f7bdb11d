//! 连接状态机
//!
//! 一个 `Connection` 对应一个存活或濒死的传输端点。真正的 IO 由
//! 编排器运行时里的专属会话任务驱动：先完成握手，随后并行运行
//! 读循环和写循环。跨线程请求（发送、断开）通过命令通道投递给
//! 会话任务，套接字的关闭永远发生在拥有它的执行上下文内部。

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::codec::{FrameReader, FrameWriter};
use crate::error::{NetError, Result};
use crate::message::{Message, MessageId, OwnedMessage};
use crate::queue::TsQueue;

/// 握手混淆密钥
const SCRAMBLE_KEY: u64 = 0xBADC_0FFE_E0DD_F00D;

/// 握手混淆变换
///
/// 半字节交换后异或固定密钥，自身为对合变换。仅用于拒绝
/// 不兼容的对端，不是加密，不提供任何认证强度。
pub(crate) fn scramble(input: u64) -> u64 {
    let swapped = ((input & 0xF0F0_F0F0_F0F0_F0F0) >> 4) | ((input & 0x0F0F_0F0F_0F0F_0F0F) << 4);
    swapped ^ SCRAMBLE_KEY
}

/// 连接归属方
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// 客户端发起的连接
    Client,
    /// 服务端接受的连接
    Server,
}

/// 连接状态
///
/// `Closed` 为终态，不可逆。连接断开后只能新建连接，不支持重连。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// 已建立传输，握手尚未开始
    Connecting = 0,
    /// 服务端已发出质询值
    HandshakeSent = 1,
    /// 等待对端的握手数据
    HandshakePending = 2,
    /// 握手完成，可正常收发
    Open = 3,
    /// 已关闭（终态）
    Closed = 4,
}

impl ConnectionState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::HandshakeSent,
            2 => ConnectionState::HandshakePending,
            3 => ConnectionState::Open,
            _ => ConnectionState::Closed,
        }
    }
}

/// 投递给会话任务的跨线程请求
pub(crate) enum Command<T: MessageId> {
    /// 发送一条消息
    Message(Message<T>),
    /// 请求关闭连接
    Disconnect,
}

/// 连接句柄
///
/// 注册表、应用线程和会话任务共享同一个 `Arc<Connection>`。
/// 句柄本身不持有套接字，所有 IO 请求经由命令通道排队。
pub struct Connection<T: MessageId> {
    role: Role,
    /// 服务端分配的连接 ID，客户端侧恒为 0
    id: AtomicU32,
    state: AtomicU8,
    outbound: mpsc::UnboundedSender<Command<T>>,
    /// 服务端构造时生成的质询值
    handshake_out: u64,
    /// 预先算好的期望应答
    handshake_check: u64,
}

impl<T: MessageId> Connection<T> {
    /// 创建连接句柄与配套的命令接收端
    ///
    /// 服务端角色在构造时生成随机 64 位质询值并预先计算期望应答；
    /// 客户端不主动发起握手，两个值从零开始。
    pub(crate) fn pair(role: Role) -> (Arc<Self>, mpsc::UnboundedReceiver<Command<T>>) {
        let (outbound, cmd_rx) = mpsc::unbounded_channel();
        let (handshake_out, handshake_check) = match role {
            Role::Server => {
                let nonce: u64 = rand::random();
                (nonce, scramble(nonce))
            }
            Role::Client => (0, 0),
        };

        let conn = Arc::new(Self {
            role,
            id: AtomicU32::new(0),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            outbound,
            handshake_out,
            handshake_check,
        });
        (conn, cmd_rx)
    }

    /// 连接 ID（服务端分配；客户端侧无意义，恒为 0）
    pub fn id(&self) -> u32 {
        self.id.load(Ordering::SeqCst)
    }

    pub(crate) fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::SeqCst);
    }

    /// 连接归属方
    pub fn role(&self) -> Role {
        self.role
    }

    /// 当前状态
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_raw(self.state.load(Ordering::SeqCst))
    }

    /// 是否已完成握手并可收发
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    // Closed 为终态，一旦进入不再离开
    pub(crate) fn set_state(&self, next: ConnectionState) {
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != ConnectionState::Closed as u8).then_some(next as u8)
            });
    }

    /// 异步发送一条消息
    ///
    /// 调用方永不阻塞：消息进入连接私有的出站队列，由会话任务
    /// 按入队顺序写到传输上。连接关闭后入队失败，消息被丢弃。
    pub fn send(&self, message: Message<T>) {
        if self.outbound.send(Command::Message(message)).is_err() {
            debug!("send on closed connection {}", self.id());
        }
    }

    /// 请求关闭连接
    ///
    /// 只是向会话任务投递关闭请求，套接字由拥有它的执行上下文
    /// 关闭，不会与进行中的读写并发。
    pub fn disconnect(&self) {
        let _ = self.outbound.send(Command::Disconnect);
    }
}

/// 等待编排器的关闭信号
pub(crate) async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}

/// 驱动一条连接的完整生命周期
///
/// 先执行握手，成功后进入开放阶段：读循环与写循环在 `select!`
/// 中并行，任何一方结束（IO 错误、对端关闭或断开请求）都会结束
/// 会话，连接进入 `Closed`，两个半边随之析构、套接字关闭。
pub(crate) async fn run_session<R, W, T>(
    conn: Arc<Connection<T>>,
    reader: R,
    writer: W,
    mut cmd_rx: mpsc::UnboundedReceiver<Command<T>>,
    inbound: Arc<TsQueue<OwnedMessage<T>>>,
    on_validated: Option<Box<dyn FnOnce() + Send>>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    T: MessageId,
{
    let mut frame_reader = FrameReader::new(reader);
    let mut frame_writer = FrameWriter::new(writer);

    match perform_handshake(&conn, &mut frame_reader, &mut frame_writer).await {
        Ok(()) => {}
        Err(NetError::HandshakeMismatch) => {
            // 静默关闭，不给对端任何区分信号
            warn!("connection {} failed handshake, closing", conn.id());
            conn.set_state(ConnectionState::Closed);
            return;
        }
        Err(e) => {
            warn!("handshake aborted on connection {}: {}", conn.id(), e);
            conn.set_state(ConnectionState::Closed);
            return;
        }
    }

    conn.set_state(ConnectionState::Open);
    debug!("connection {} open", conn.id());

    if let Some(callback) = on_validated {
        callback();
    }

    // 服务端收到的消息携带来源 ID，客户端只有唯一对端
    let origin = match conn.role() {
        Role::Server => Some(conn.id()),
        Role::Client => None,
    };

    tokio::select! {
        result = read_loop(&mut frame_reader, origin, &inbound) => {
            if let Err(e) = result {
                debug!("read loop ended on connection {}: {}", conn.id(), e);
            }
        }
        result = write_loop(&mut frame_writer, &mut cmd_rx) => {
            if let Err(e) = result {
                debug!("write loop ended on connection {}: {}", conn.id(), e);
            }
        }
    }

    conn.set_state(ConnectionState::Closed);
    debug!("connection {} closed", conn.id());
}

/// 质询/应答握手，先于一切消息流量
///
/// 服务端：裸写 64 位质询值，等待应答，与预算值逐字节比对；
/// 不符则以 [`NetError::HandshakeMismatch`] 收场。
/// 客户端：等待质询值，施加同一混淆变换后回写，写成功即完成。
async fn perform_handshake<R, W, T>(
    conn: &Connection<T>,
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    T: MessageId,
{
    match conn.role() {
        Role::Server => {
            writer.write_handshake(conn.handshake_out).await?;
            conn.set_state(ConnectionState::HandshakeSent);

            conn.set_state(ConnectionState::HandshakePending);
            let response = reader.read_handshake().await?;
            if response != conn.handshake_check {
                return Err(NetError::HandshakeMismatch);
            }
            Ok(())
        }
        Role::Client => {
            conn.set_state(ConnectionState::HandshakePending);
            let challenge = reader.read_handshake().await?;
            writer.write_handshake(scramble(challenge)).await?;
            Ok(())
        }
    }
}

/// 读循环：帧头 → 消息体 → 入队 → 立即重新待命
async fn read_loop<R, T>(
    reader: &mut FrameReader<R>,
    origin: Option<u32>,
    inbound: &TsQueue<OwnedMessage<T>>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    T: MessageId,
{
    loop {
        let message = reader.read_frame::<T>().await?;
        inbound.push_back(OwnedMessage { origin, message });
    }
}

/// 写循环：按入队顺序排空出站队列
///
/// 唯一的写者，同一连接永远不会有两条并行的写链。
async fn write_loop<W, T>(
    writer: &mut FrameWriter<W>,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command<T>>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: MessageId,
{
    while let Some(command) = cmd_rx.recv().await {
        match command {
            Command::Message(message) => writer.write_frame(&message).await?,
            Command::Disconnect => break,
        }
    }
    Ok(())
}
