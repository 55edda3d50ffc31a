mod evtun;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "evtun",
    version,
    about = "evtun - reverse tunnel client exposing server-defined local ports"
)]
struct Cli {
    /// JSON file with the metadata announced to the tunnel server on every connect. Overrides client.metadata_file and the inline [metadata] table; defaults to {}.
    metadata: Option<std::path::PathBuf>,

    /// Path to evtun config file (.toml/.yaml/.yml) or a directory containing one. If omitted, auto-detects evtun.toml > evtun.yaml > evtun.yml from CWD; then falls back to the OS default path (Linux: /etc/evtun/evtun.toml; others: user config dir). A missing default file means built-in defaults.
    #[arg(long, env = "EVTUN_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Tunnel server address as HOST[:PORT] (default port 9000). Overrides client.server_addr.
    #[arg(long, env = "EVTUN_SERVER")]
    server: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    evtun::run(evtun::RunOptions {
        config_path: cli.config,
        metadata_file: cli.metadata,
        server_addr: cli.server,
    })
    .await
}
