///
/// Run the server with:
/// maldetete -p 2222 -k <host key path>
///
use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use maldetete::config::DEFAULT_PORT;
use maldetete::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = ServerConfig {
        listen_addr: cli.listen,
        port: cli.port,
        identity: cli.private_key.into(),
        ..Default::default()
    };
    maldetete::server::run(config).await?;
    Ok(())
}

#[derive(clap::Parser)]
#[clap(about = "An SSH server that lets every public key in")]
pub struct Cli {
    #[clap(long, short, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[clap(long, default_value = "0.0.0.0")]
    listen: IpAddr,

    /// Host key file; a fresh key is generated when omitted.
    #[clap(long, short = 'k')]
    private_key: Option<PathBuf>,
}
