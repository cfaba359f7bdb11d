//! 演示服务端
//!
//! 回显客户端的 Ping，并把 MessageAll 转发给其余所有客户端。
//! 只消费网络库的公开接口，不包含任何协议逻辑。

use std::sync::Arc;

use anyhow::Result;
use netmsg::{Connection, Message, MessageId, Server, ServerContext, ServerHandler};
use tracing::info;
use tracing_subscriber::EnvFilter;

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

struct GameServer;

impl ServerHandler<GameMsg> for GameServer {
    fn on_client_connect(&self, client: &Arc<Connection<GameMsg>>) -> bool {
        // 准入即致意，消息在握手完成前排队等待
        client.send(Message::new(GameMsg::ServerAccept));
        true
    }

    fn on_client_validated(&self, client: &Arc<Connection<GameMsg>>) {
        info!("client {} validated", client.id());
    }

    fn on_client_disconnect(&self, client: &Arc<Connection<GameMsg>>) {
        info!("client {} disconnected", client.id());
    }

    fn on_message(
        &self,
        ctx: &ServerContext<GameMsg>,
        client: &Arc<Connection<GameMsg>>,
        message: Message<GameMsg>,
    ) {
        match message.id() {
            GameMsg::PingServer => {
                info!("client {} pinged the server", client.id());
                // 原样回显，时间戳不动
                client.send(message);
            }
            GameMsg::MessageAll => {
                info!("client {} messages all", client.id());
                let mut relay = Message::new(GameMsg::ServerMessage);
                relay.push(&client.id());
                ctx.message_all_clients(relay, Some(client.id()));
            }
            _ => {}
        }
    }
}

fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("ping_server=debug".parse()?)
                .add_directive("netmsg=debug".parse()?),
        )
        .init();

    let port = std::env::args()
        .nth(1)
        .map(|p| p.parse::<u16>())
        .transpose()?
        .unwrap_or(DEFAULT_PORT);

    let mut server = Server::new(port, Arc::new(GameServer));
    server.start()?;
    info!("ping server running on port {}", port);

    loop {
        server.update(usize::MAX, true);
    }
}
