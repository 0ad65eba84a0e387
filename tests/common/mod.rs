#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use termbridge::bridge::{Bridge, BridgeConfig};
use termbridge::process::Launcher;
use termbridge::server::Server;
use termbridge::session::SessionRegistry;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: SessionRegistry,
    pub cancel: CancellationToken,
}

impl TestServer {
    pub fn terminal_url(&self) -> String {
        format!("ws://{}/terminal", self.addr)
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.registry.shutdown();
    }
}

/// Starts a server on an ephemeral port with the given launcher.
pub async fn start_server(launcher: impl Launcher + 'static) -> TestServer {
    start_server_with(launcher, BridgeConfig::default()).await
}

pub async fn start_server_with(launcher: impl Launcher + 'static, config: BridgeConfig) -> TestServer {
    let registry = SessionRegistry::new();
    let bridge = Bridge::new(registry.clone(), Arc::new(launcher), config);
    let server = Server::new(bridge, "/terminal", 8192);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(server.serve(listener, cancel.clone()));

    TestServer { addr, registry, cancel }
}

/// Collect text messages until the server closes the socket.
///
/// Returns the texts and whether a close frame was seen.
pub async fn read_until_close(ws: &mut Ws) -> (Vec<String>, bool) {
    let mut texts = Vec::new();
    let mut saw_close = false;
    loop {
        let next = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timeout waiting for message");
        match next {
            Some(Ok(Message::Text(text))) => texts.push(text.to_string()),
            Some(Ok(Message::Close(_))) => saw_close = true,
            Some(Ok(_)) => {}
            Some(Err(_)) | None => break,
        }
    }
    (texts, saw_close)
}
