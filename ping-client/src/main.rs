//! 演示客户端
//!
//! 行式控制台交互: `ping` 测往返延迟，`all` 给其他客户端打招呼，
//! `quit` 退出。只消费网络库的公开接口。

use std::io::{self, BufRead, Write};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use netmsg::{Client, Message, MessageId};
use tracing::warn;
use tracing_subscriber::EnvFilter;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 60000;

/// 演示协议的消息类型，两端共用同一份定义
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
enum GameMsg {
    PingServer = 0,
    ServerMessage = 1,
    ServerAccept = 2,
    MessageAll = 3,
}

impl MessageId for GameMsg {
    fn to_wire(self) -> u32 {
        self as u32
    }

    fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(GameMsg::PingServer),
            1 => Some(GameMsg::ServerMessage),
            2 => Some(GameMsg::ServerAccept),
            3 => Some(GameMsg::MessageAll),
            _ => None,
        }
    }
}

fn micros_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// 发送 Ping：消息体携带当前时间戳，服务端原样回显
fn ping_server(client: &Client<GameMsg>) {
    let mut msg = Message::new(GameMsg::PingServer);
    msg.push(&micros_now());
    client.send(msg);
}

fn message_all(client: &Client<GameMsg>) {
    client.send(Message::new(GameMsg::MessageAll));
}

/// 在给定时间窗口内轮询并打印到达的消息
fn drain_incoming(client: &Client<GameMsg>, window: Duration) {
    let deadline = Instant::now() + window;
    while Instant::now() < deadline {
        match client.incoming().pop_front() {
            Ok(owned) => print_message(owned.message),
            Err(_) => thread::sleep(Duration::from_millis(10)),
        }
    }
}

fn print_message(mut message: Message<GameMsg>) {
    match message.id() {
        GameMsg::ServerAccept => println!("已连接到服务器"),
        GameMsg::PingServer => match message.pop::<u64>() {
            Ok(then) => {
                let rtt = micros_now().saturating_sub(then);
                println!("往返延迟: {:?}", Duration::from_micros(rtt));
            }
            Err(e) => warn!("malformed ping echo: {}", e),
        },
        GameMsg::ServerMessage => match message.pop::<u32>() {
            Ok(id) => println!("来自客户端 {} 的问候", id),
            Err(e) => warn!("malformed relay: {}", e),
        },
        GameMsg::MessageAll => {}
    }
}

fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("ping_client=debug".parse()?)
                .add_directive("netmsg=debug".parse()?),
        )
        .init();

    let host = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = std::env::args()
        .nth(2)
        .map(|p| p.parse::<u16>())
        .transpose()?
        .unwrap_or(DEFAULT_PORT);

    let mut client: Client<GameMsg> = Client::new();
    client.connect(&host, port)?;

    // 等待握手完成
    let deadline = Instant::now() + Duration::from_secs(5);
    while !client.is_connected() {
        if Instant::now() > deadline {
            println!("连接 {}:{} 失败", host, port);
            return Ok(());
        }
        thread::sleep(Duration::from_millis(10));
    }
    drain_incoming(&client, Duration::from_millis(100));

    println!("命令: ping | all | quit");
    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }

        match line.trim() {
            "ping" => ping_server(&client),
            "all" => message_all(&client),
            "quit" => break,
            "" => {}
            other => println!("未知命令: {}", other),
        }

        // 收取命令触发的应答
        drain_incoming(&client, Duration::from_millis(500));

        if !client.is_connected() {
            println!("连接已断开");
            break;
        }
    }

    client.disconnect();
    Ok(())
}
