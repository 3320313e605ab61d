///
/// Run the client with:
/// maldetete-client -k <private key path> user@host:port
///
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use maldetete::client::Target;
use maldetete::ClientConfig;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let mut config = ClientConfig::new(cli.target);
    config.identity = cli.private_key.into();
    maldetete::client::run(config).await?;
    Ok(())
}

#[derive(clap::Parser)]
#[clap(about = "Open a shell on an SSH server with a public key")]
pub struct Cli {
    /// user@host:port; user and port are optional.
    #[clap(index = 1)]
    target: Target,

    /// Private key to authenticate with; a fresh RSA key is generated
    /// when omitted.
    #[clap(long, short = 'k')]
    private_key: Option<PathBuf>,
}
