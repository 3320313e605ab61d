use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use maldetete::client::{ClientHandler, Connection, Target};
use maldetete::config::DEFAULT_BANNER;
use maldetete::server::Acceptor;
use maldetete::shell::ShellCommand;
use maldetete::{ClientConfig, IdentitySource, ServerConfig};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::LineEnding;
use russh::keys::{Algorithm, PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{client, ChannelMsg};

async fn start_server(channel_open_timeout: Duration) -> anyhow::Result<SocketAddr> {
    let config = ServerConfig {
        listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        channel_open_timeout,
        shell: ShellCommand::new("/bin/sh", &[]),
        ..Default::default()
    };
    let acceptor = Acceptor::bind(config).await?;
    let addr = acceptor.local_addr()?;
    tokio::spawn(acceptor.serve());
    Ok(addr)
}

fn client_config(addr: SocketAddr, dir: &tempfile::TempDir) -> anyhow::Result<ClientConfig> {
    let path = dir.path().join("id_ed25519");
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519)?.write_openssh_file(&path, LineEnding::LF)?;
    let mut config = ClientConfig::new(Target::parse_with_user(&addr.to_string(), || "tester".into()));
    config.identity = IdentitySource::File(path);
    Ok(config)
}

#[tokio::test]
async fn any_key_gets_a_shell() -> anyhow::Result<()> {
    let _ = env_logger::try_init();
    let addr = start_server(Duration::from_secs(20)).await?;
    let dir = tempfile::tempdir()?;

    let connection = Connection::connect(&client_config(addr, &dir)?).await?;
    let mut channel = connection.open_shell("dumb", 80, 24).await?;
    channel.data(&b"echo hello; exit\n"[..]).await?;

    let mut output = Vec::new();
    let finished = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => output.extend_from_slice(&data),
                ChannelMsg::Close => break,
                _ => {}
            }
        }
    })
    .await;

    assert!(finished.is_ok(), "shell never finished");
    assert!(String::from_utf8_lossy(&output).contains("hello"));
    connection.close().await?;
    Ok(())
}

#[tokio::test]
async fn passwords_are_refused() -> anyhow::Result<()> {
    let _ = env_logger::try_init();
    let addr = start_server(Duration::from_secs(20)).await?;

    let mut session = client::connect(Arc::new(client::Config::default()), addr, ClientHandler).await?;
    let auth = session.authenticate_password("root", "hunter2").await?;
    assert!(!auth.success());
    Ok(())
}

#[tokio::test]
async fn idle_connections_are_dropped() -> anyhow::Result<()> {
    let _ = env_logger::try_init();
    let addr = start_server(Duration::from_secs(1)).await?;
    let dir = tempfile::tempdir()?;

    let connection = Connection::connect(&client_config(addr, &dir)?).await?;
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(connection.open_shell("dumb", 80, 24).await.is_err());
    Ok(())
}

/// Remembers the banner the server sent.
#[derive(Clone, Default)]
struct BannerRecorder(Arc<Mutex<Option<String>>>);

impl client::Handler for BannerRecorder {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn auth_banner(
        &mut self,
        banner: &str,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        *self.0.lock().unwrap() = Some(banner.to_string());
        Ok(())
    }
}

#[tokio::test]
async fn banner_is_shown_before_login() -> anyhow::Result<()> {
    let _ = env_logger::try_init();
    let addr = start_server(Duration::from_secs(20)).await?;
    let recorder = BannerRecorder::default();

    let mut session = client::connect(Arc::new(client::Config::default()), addr, recorder.clone()).await?;
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)?;
    let auth = session
        .authenticate_publickey("tester", PrivateKeyWithHashAlg::new(Arc::new(key), None))
        .await?;

    assert!(auth.success());
    assert_eq!(recorder.0.lock().unwrap().as_deref(), Some(DEFAULT_BANNER));
    Ok(())
}
