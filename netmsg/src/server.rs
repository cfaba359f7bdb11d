//! 服务端编排器
//!
//! 持有监听器、连接注册表和共享入站队列，在专属 IO 线程的
//! 单线程 tokio 运行时上运行自续租的 accept 循环。应用层通过
//! [`ServerHandler`] 的四个钩子介入连接准入、验证、断开和消息分发。

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::connection::{run_session, wait_shutdown, Connection, ConnectionState, Role};
use crate::constants::FIRST_CLIENT_ID;
use crate::error::Result;
use crate::message::{Message, MessageId, OwnedMessage};
use crate::queue::TsQueue;
use crate::transport::{TcpListener, Transport, TransportListener};

/// 服务端扩展点
///
/// 具体服务器实现此 trait 并在构造 [`Server`] 时注入。
/// 钩子的调用线程各不相同：`on_client_connect` 与
/// `on_client_validated` 来自 IO 线程，`on_message` 与
/// `on_client_disconnect` 来自调用 `update`/发送接口的应用线程。
pub trait ServerHandler<T: MessageId>: Send + Sync + 'static {
    /// 新连接准入判定，返回 `false` 直接丢弃该传输
    ///
    /// 默认拒绝一切连接，具体服务器必须显式放行。
    fn on_client_connect(&self, _client: &Arc<Connection<T>>) -> bool {
        false
    }

    /// 服务端握手成功后触发
    fn on_client_validated(&self, _client: &Arc<Connection<T>>) {}

    /// 发送时发现连接已断开后触发
    fn on_client_disconnect(&self, _client: &Arc<Connection<T>>) {}

    /// 所有入站应用消息的唯一分发点
    fn on_message(&self, _ctx: &ServerContext<T>, _client: &Arc<Connection<T>>, _message: Message<T>) {}
}

/// 服务端共享状态
///
/// accept 循环、会话任务与应用线程共享的部分。钩子回调会拿到
/// 它的引用，以便在处理消息时继续向单个或全部客户端发送。
pub struct ServerContext<T: MessageId> {
    /// 存活连接注册表
    registry: Mutex<Vec<Arc<Connection<T>>>>,
    /// 单调递增的连接 ID 分配器
    next_id: AtomicU32,
    /// 所有连接共用的入站消息队列
    inbound: Arc<TsQueue<OwnedMessage<T>>>,
    /// 应用注入的钩子实现
    handler: Arc<dyn ServerHandler<T>>,
}

impl<T: MessageId> ServerContext<T> {
    fn new(handler: Arc<dyn ServerHandler<T>>) -> Self {
        Self {
            registry: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(FIRST_CLIENT_ID),
            inbound: Arc::new(TsQueue::new()),
            handler,
        }
    }

    // 注册表只是 Arc 列表，毒锁直接取回继续用
    fn lock_registry(&self) -> MutexGuard<'_, Vec<Arc<Connection<T>>>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 当前注册的连接数（含尚未被清理的已断开连接）
    pub fn client_count(&self) -> usize {
        self.lock_registry().len()
    }

    fn find_client(&self, id: u32) -> Option<Arc<Connection<T>>> {
        self.lock_registry().iter().find(|c| c.id() == id).cloned()
    }

    fn close_all(&self) {
        for client in self.lock_registry().iter() {
            client.set_state(ConnectionState::Closed);
        }
    }

    /// 向单个客户端发送
    ///
    /// 连接已不在开放状态时触发 `on_client_disconnect`，
    /// 并按其自身 ID 将对应条目移出注册表。
    pub fn message_client(&self, client: &Arc<Connection<T>>, message: Message<T>) {
        if client.is_open() {
            client.send(message);
        } else {
            self.handler.on_client_disconnect(client);
            self.lock_registry().retain(|c| c.id() != client.id());
        }
    }

    /// 向除 `exclude` 以外的所有开放连接广播
    ///
    /// 扫描期间只标记失效连接，扫描结束后一次性移除，
    /// 避免边遍历边改注册表。
    pub fn message_all_clients(&self, message: Message<T>, exclude: Option<u32>) {
        // 快照后立刻放锁，钩子回调在锁外执行
        let snapshot: Vec<Arc<Connection<T>>> = self.lock_registry().clone();

        let mut dead = Vec::new();
        for client in &snapshot {
            if client.is_open() {
                if exclude != Some(client.id()) {
                    client.send(message.clone());
                }
            } else {
                self.handler.on_client_disconnect(client);
                dead.push(client.id());
            }
        }

        if !dead.is_empty() {
            self.lock_registry().retain(|c| !dead.contains(&c.id()));
        }
    }
}

/// 服务端编排器
pub struct Server<T: MessageId> {
    ctx: Arc<ServerContext<T>>,
    port: u16,
    local_addr: Option<SocketAddr>,
    /// IO 线程句柄
    io_thread: Option<thread::JoinHandle<()>>,
    /// 关闭信号发送端
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl<T: MessageId> Server<T> {
    /// 创建服务端，`port` 为 0 时由系统分配端口
    pub fn new(port: u16, handler: Arc<dyn ServerHandler<T>>) -> Self {
        Self {
            ctx: Arc::new(ServerContext::new(handler)),
            port,
            local_addr: None,
            io_thread: None,
            shutdown_tx: None,
        }
    }

    /// 绑定端口并启动 IO 线程
    ///
    /// 绑定同步完成，失败直接返回给调用方；成功后 accept 循环
    /// 在后台运行时上自行续租。
    pub fn start(&mut self) -> Result<()> {
        if self.io_thread.is_some() {
            warn!("server already started");
            return Ok(());
        }

        let std_listener = std::net::TcpListener::bind(("0.0.0.0", self.port))?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = Arc::clone(&self.ctx);
        let handle = thread::Builder::new()
            .name("netmsg-server".into())
            .spawn(move || {
                runtime.block_on(server_io(std_listener, ctx, shutdown_rx));
            })?;

        info!("server listening on {}", local_addr);
        self.local_addr = Some(local_addr);
        self.io_thread = Some(handle);
        self.shutdown_tx = Some(shutdown_tx);
        Ok(())
    }

    /// 停止 IO 线程
    ///
    /// 返回前等待线程退出；运行时析构时所有会话任务随之取消，
    /// 套接字在其执行上下文内关闭。注册表条目留待惰性清理。
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.io_thread.take() {
            let _ = handle.join();
            info!("server stopped");
        }
        self.ctx.close_all();
        self.local_addr = None;
    }

    /// 实际监听地址（`start` 成功后可用）
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// 当前注册的连接数
    pub fn client_count(&self) -> usize {
        self.ctx.client_count()
    }

    /// 向单个客户端发送，见 [`ServerContext::message_client`]
    pub fn message_client(&self, client: &Arc<Connection<T>>, message: Message<T>) {
        self.ctx.message_client(client, message);
    }

    /// 广播，见 [`ServerContext::message_all_clients`]
    pub fn message_all_clients(&self, message: Message<T>, exclude: Option<u32>) {
        self.ctx.message_all_clients(message, exclude);
    }

    /// 取出并分发入站消息
    ///
    /// `wait_for_message` 为真时先阻塞等待队列非空；随后按到达
    /// 顺序最多分发 `max_messages` 条，队列提前取空则提前返回。
    /// 来源连接已被移出注册表的消息直接丢弃。
    pub fn update(&self, max_messages: usize, wait_for_message: bool) {
        if wait_for_message {
            self.ctx.inbound.wait();
        }

        let mut handled = 0;
        while handled < max_messages {
            let owned = match self.ctx.inbound.pop_front() {
                Ok(owned) => owned,
                Err(_) => break,
            };

            match owned.origin.and_then(|id| self.ctx.find_client(id)) {
                Some(client) => {
                    self.ctx
                        .handler
                        .on_message(&self.ctx, &client, owned.message)
                }
                None => debug!("dropping message from departed connection"),
            }
            handled += 1;
        }
    }
}

impl<T: MessageId> Drop for Server<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 服务端 IO 线程主体
async fn server_io<T: MessageId>(
    std_listener: std::net::TcpListener,
    ctx: Arc<ServerContext<T>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let listener = match TcpListener::from_std(std_listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to register listener: {}", e);
            return;
        }
    };

    tokio::select! {
        _ = accept_loop(listener, ctx) => {}
        _ = wait_shutdown(&mut shutdown_rx) => {}
    }
}

/// 自续租的 accept 循环
///
/// 无论单次结果如何都立即回到 accept 待命。被准入钩子拒绝的
/// 传输当场丢弃：不进注册表，也不会发出任何握手字节。
async fn accept_loop<T: MessageId>(listener: TcpListener, ctx: Arc<ServerContext<T>>) {
    loop {
        match listener.accept().await {
            Ok(transport) => {
                let (conn, cmd_rx) = Connection::pair(Role::Server);

                if ctx.handler.on_client_connect(&conn) {
                    let id = ctx.next_id.fetch_add(1, Ordering::SeqCst);
                    conn.set_id(id);
                    ctx.lock_registry().push(Arc::clone(&conn));
                    info!("connection {} approved", id);

                    let validated_ctx = Arc::clone(&ctx);
                    let validated_conn = Arc::clone(&conn);
                    let on_validated: Box<dyn FnOnce() + Send> = Box::new(move || {
                        info!("connection {} validated", validated_conn.id());
                        validated_ctx.handler.on_client_validated(&validated_conn);
                    });

                    let (reader, writer) = transport.split();
                    tokio::spawn(run_session(
                        conn,
                        reader,
                        writer,
                        cmd_rx,
                        Arc::clone(&ctx.inbound),
                        Some(on_validated),
                    ));
                } else {
                    info!("connection denied");
                }
            }
            Err(e) => {
                error!("accept failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use std::io::Read;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    enum TestMsg {
        Ping,
        Data,
        RelayAll,
        Notice,
    }

    impl MessageId for TestMsg {
        fn to_wire(self) -> u32 {
            match self {
                TestMsg::Ping => 0,
                TestMsg::Data => 1,
                TestMsg::RelayAll => 2,
                TestMsg::Notice => 3,
            }
        }

        fn from_wire(raw: u32) -> Option<Self> {
            match raw {
                0 => Some(TestMsg::Ping),
                1 => Some(TestMsg::Data),
                2 => Some(TestMsg::RelayAll),
                3 => Some(TestMsg::Notice),
                _ => None,
            }
        }
    }

    /// 放行一切连接的测试钩子：回显 Ping、转发 RelayAll、记录 Data
    #[derive(Default)]
    struct TestHandler {
        validated: AtomicU32,
        disconnected: AtomicU32,
        seen_data: Mutex<Vec<u32>>,
        clients: Mutex<Vec<Arc<Connection<TestMsg>>>>,
    }

    impl ServerHandler<TestMsg> for TestHandler {
        fn on_client_connect(&self, _client: &Arc<Connection<TestMsg>>) -> bool {
            true
        }

        fn on_client_validated(&self, client: &Arc<Connection<TestMsg>>) {
            self.validated.fetch_add(1, Ordering::SeqCst);
            self.clients.lock().unwrap().push(Arc::clone(client));
        }

        fn on_client_disconnect(&self, _client: &Arc<Connection<TestMsg>>) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }

        fn on_message(
            &self,
            ctx: &ServerContext<TestMsg>,
            client: &Arc<Connection<TestMsg>>,
            mut message: Message<TestMsg>,
        ) {
            match message.id() {
                TestMsg::Ping => client.send(message),
                TestMsg::Data => {
                    self.seen_data.lock().unwrap().push(message.pop().unwrap());
                }
                TestMsg::RelayAll => {
                    let mut relay = Message::new(TestMsg::Notice);
                    relay.push(&client.id());
                    ctx.message_all_clients(relay, Some(client.id()));
                }
                TestMsg::Notice => {}
            }
        }
    }

    /// 全部使用默认钩子实现：准入一律拒绝
    #[derive(Default)]
    struct DenyAllHandler {
        validated: AtomicU32,
    }

    impl ServerHandler<TestMsg> for DenyAllHandler {
        fn on_client_validated(&self, _client: &Arc<Connection<TestMsg>>) {
            self.validated.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn eventually(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn micros_now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_micros() as u64
    }

    /// 作用域退出（含 panic 展开）时叫停消息泵线程
    struct StopGuard<'a>(&'a AtomicBool);

    impl Drop for StopGuard<'_> {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn start_server(handler: Arc<dyn ServerHandler<TestMsg>>) -> (Server<TestMsg>, u16) {
        let mut server = Server::new(0, handler);
        server.start().unwrap();
        let port = server.local_addr().unwrap().port();
        (server, port)
    }

    #[test]
    fn test_start_stop_lifecycle() {
        let (mut server, port) = start_server(Arc::new(TestHandler::default()));
        assert!(port > 0);

        // 同端口二次绑定应同步报错
        let mut conflict = Server::<TestMsg>::new(port, Arc::new(TestHandler::default()));
        assert!(conflict.start().is_err());

        server.stop();
        assert!(server.local_addr().is_none());
    }

    #[test]
    fn test_ping_round_trip_scenario() {
        let handler = Arc::new(TestHandler::default());
        let (mut server, port) = start_server(handler.clone());
        let stop = AtomicBool::new(false);

        thread::scope(|s| {
            let _guard = StopGuard(&stop);
            s.spawn(|| {
                while !stop.load(Ordering::SeqCst) {
                    server.update(64, false);
                    thread::sleep(Duration::from_millis(1));
                }
            });

            let mut client = Client::new();
            client.connect("127.0.0.1", port).unwrap();
            assert!(eventually(|| client.is_connected(), Duration::from_secs(5)));

            let sent_at = micros_now();
            let mut ping = Message::new(TestMsg::Ping);
            ping.push(&sent_at);
            client.send(ping);

            assert!(eventually(
                || !client.incoming().is_empty(),
                Duration::from_secs(5)
            ));
            let mut owned = client.incoming().pop_front().unwrap();
            assert_eq!(owned.origin, None);
            assert_eq!(owned.message.id(), TestMsg::Ping);

            // 原样回显的时间戳给出非负往返时长
            let echoed = owned.message.pop::<u64>().unwrap();
            assert_eq!(echoed, sent_at);
            assert!(micros_now() >= echoed);

            client.disconnect();
        });

        server.stop();
        assert_eq!(handler.validated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_update_respects_max_and_fifo_order() {
        let handler = Arc::new(TestHandler::default());
        let (mut server, port) = start_server(handler.clone());

        let mut client = Client::new();
        client.connect("127.0.0.1", port).unwrap();
        assert!(eventually(|| client.is_connected(), Duration::from_secs(5)));

        for seq in 0u32..5 {
            let mut msg = Message::new(TestMsg::Data);
            msg.push(&seq);
            client.send(msg);
        }

        // 留出到达时间后分批分发
        thread::sleep(Duration::from_millis(300));
        server.update(3, true);
        assert_eq!(*handler.seen_data.lock().unwrap(), vec![0, 1, 2]);

        server.update(usize::MAX, false);
        assert_eq!(*handler.seen_data.lock().unwrap(), vec![0, 1, 2, 3, 4]);

        client.disconnect();
        server.stop();
    }

    #[test]
    fn test_update_blocks_until_message_arrives() {
        let handler = Arc::new(TestHandler::default());
        let (mut server, port) = start_server(handler.clone());

        let mut client = Client::new();
        client.connect("127.0.0.1", port).unwrap();
        assert!(eventually(|| client.is_connected(), Duration::from_secs(5)));

        let dispatched = AtomicBool::new(false);
        thread::scope(|s| {
            s.spawn(|| {
                server.update(1, true);
                dispatched.store(true, Ordering::SeqCst);
            });

            thread::sleep(Duration::from_millis(100));
            assert!(!dispatched.load(Ordering::SeqCst));

            let mut msg = Message::new(TestMsg::Data);
            msg.push(&7u32);
            client.send(msg);

            assert!(eventually(
                || dispatched.load(Ordering::SeqCst),
                Duration::from_secs(5)
            ));
        });

        client.disconnect();
        server.stop();
    }

    #[test]
    fn test_broadcast_excludes_sender_scenario() {
        let handler = Arc::new(TestHandler::default());
        let (mut server, port) = start_server(handler.clone());
        let stop = AtomicBool::new(false);

        thread::scope(|s| {
            let _guard = StopGuard(&stop);
            s.spawn(|| {
                while !stop.load(Ordering::SeqCst) {
                    server.update(64, false);
                    thread::sleep(Duration::from_millis(1));
                }
            });

            // A 先完成握手，确保拿到第一个分配的 ID
            let mut client_a = Client::new();
            client_a.connect("127.0.0.1", port).unwrap();
            assert!(eventually(
                || handler.validated.load(Ordering::SeqCst) == 1,
                Duration::from_secs(5)
            ));

            let mut client_b = Client::<TestMsg>::new();
            client_b.connect("127.0.0.1", port).unwrap();

            // 两端都要等服务端侧验证完成，广播才会送达
            assert!(eventually(
                || handler.validated.load(Ordering::SeqCst) == 2,
                Duration::from_secs(5)
            ));
            assert!(eventually(|| client_a.is_connected(), Duration::from_secs(5)));
            assert!(eventually(|| client_b.is_connected(), Duration::from_secs(5)));

            client_a.send(Message::new(TestMsg::RelayAll));

            // B 收到且仅收到一条携带 A 的 ID 的转发
            assert!(eventually(
                || !client_b.incoming().is_empty(),
                Duration::from_secs(5)
            ));
            let mut owned = client_b.incoming().pop_front().unwrap();
            assert_eq!(owned.message.id(), TestMsg::Notice);
            assert_eq!(owned.message.pop::<u32>().unwrap(), FIRST_CLIENT_ID);

            // 发送者自己收不到转发
            thread::sleep(Duration::from_millis(300));
            assert!(client_a.incoming().is_empty());
            assert!(client_b.incoming().is_empty());

            client_a.disconnect();
            client_b.disconnect();
        });

        server.stop();
    }

    #[test]
    fn test_rejected_client_gets_no_handshake_bytes() {
        let handler = Arc::new(DenyAllHandler::default());
        let (mut server, port) = start_server(handler.clone());

        // 裸连后对端应当直接关闭，不发一个字节
        let mut stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 8];
        match stream.read(&mut buf) {
            Ok(0) => {}
            Err(ref e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
                ) => {}
            Ok(n) => panic!("rejected client received {} handshake bytes", n),
            Err(e) => panic!("expected immediate close, got {}", e),
        }

        // 库客户端同样永远到不了开放状态
        let mut client = Client::<TestMsg>::new();
        client.connect("127.0.0.1", port).unwrap();
        assert!(!eventually(
            || client.is_connected(),
            Duration::from_millis(500)
        ));

        assert_eq!(server.client_count(), 0);
        assert_eq!(handler.validated.load(Ordering::SeqCst), 0);

        client.disconnect();
        server.stop();
    }

    #[test]
    fn test_broadcast_sweep_removes_dead_connection() {
        let handler = Arc::new(TestHandler::default());
        let (mut server, port) = start_server(handler.clone());

        let mut client = Client::<TestMsg>::new();
        client.connect("127.0.0.1", port).unwrap();
        assert!(eventually(|| client.is_connected(), Duration::from_secs(5)));
        assert_eq!(server.client_count(), 1);

        client.disconnect();

        // 广播扫描发现死连接：触发断开钩子并批量移除
        assert!(eventually(
            || {
                server.message_all_clients(Message::new(TestMsg::Notice), None);
                server.client_count() == 0
            },
            Duration::from_secs(5)
        ));
        assert_eq!(handler.disconnected.load(Ordering::SeqCst), 1);

        server.stop();
    }

    #[test]
    fn test_message_client_removes_dead_entry() {
        let handler = Arc::new(TestHandler::default());
        let (mut server, port) = start_server(handler.clone());

        let mut client = Client::<TestMsg>::new();
        client.connect("127.0.0.1", port).unwrap();
        assert!(eventually(
            || handler.validated.load(Ordering::SeqCst) == 1,
            Duration::from_secs(5)
        ));

        let server_side = handler.clients.lock().unwrap()[0].clone();
        client.disconnect();
        assert!(eventually(
            || server_side.state() == ConnectionState::Closed,
            Duration::from_secs(5)
        ));

        server.message_client(&server_side, Message::new(TestMsg::Notice));
        assert_eq!(server.client_count(), 0);
        assert_eq!(handler.disconnected.load(Ordering::SeqCst), 1);

        server.stop();
    }
}
