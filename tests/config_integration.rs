//! Config files loaded from disk and used to build a working server.

mod common;

use std::io::Write;
use std::time::Duration;

use common::read_until_close;
use futures::SinkExt;
use termbridge::bridge::CredentialPolicy;
use termbridge::config::{Config, ConfigError, LauncherKind, Overrides};
use termbridge::server::Server;
use termbridge::session::{ConnectionParams, SessionRegistry};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn loads_file_with_defaults_for_missing_sections() {
    let file = write_config("[bridge]\ncredential_policy = \"once\"\n");
    let config = Config::load(file.path()).unwrap().unwrap();
    assert_eq!(config.bridge.credential_policy, CredentialPolicy::Once);
    assert_eq!(config.server.terminal_path, "/terminal");
    assert_eq!(config.process.launcher, LauncherKind::Ssh);
}

#[test]
fn parse_error_names_file() {
    let file = write_config("[server\nbind = ");
    let err = Config::load(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::ParseFailed(..)));
    assert!(err.to_string().contains(&file.path().display().to_string()));
}

#[test]
fn invalid_values_are_rejected() {
    let file = write_config("[server]\nterminal_path = \"no-slash\"\n");
    assert!(matches!(Config::load(file.path()), Err(ConfigError::Invalid(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn server_built_from_config_file() {
    let file = write_config(
        r#"
[server]
terminal_path = "/tty"

[bridge]
exit_drain_ms = 100

[process]
launcher = "command"
program = "/bin/sh"
args = ["-c", "echo from-config"]
"#,
    );
    let mut config = Config::load_or_default(Some(file.path())).unwrap();
    config.apply(Overrides {
        bind: Some("127.0.0.1:0".parse().unwrap()),
        ..Overrides::default()
    });

    let registry = SessionRegistry::new();
    let server = Server::from_config(&config, registry.clone()).unwrap();
    let listener = tokio::net::TcpListener::bind(config.server.bind).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(server.serve(listener, cancel.clone()));

    let session = registry.create(ConnectionParams::new("h", "u"));
    let (mut ws, _) = connect_async(format!("ws://{addr}/tty")).await.unwrap();
    ws.send(Message::text(format!("SESSION {}", session.id))).await.unwrap();
    let (texts, _) = read_until_close(&mut ws).await;
    assert!(texts.concat().starts_with("from-config\n"));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
