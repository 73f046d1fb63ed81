use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use lsf::{extractor::Registry, http::AppState, server};
use lsf_core::{logging, Config};

#[derive(Parser, Debug)]
#[command(name = "lsf")]
#[command(about = "Live Stream Forwarder", long_about = None, version)]
struct Args {
    /// Configuration file (YAML or TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Listen address
    #[arg(short = 'l', long)]
    listen_address: Option<String>,

    /// Listen port (0 picks a free port)
    #[arg(short = 'p', long)]
    listen_port: Option<u16>,

    /// Default outbound proxy URL
    #[arg(long)]
    proxy: Option<String>,

    /// Append logs to this file
    #[arg(long)]
    log_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long)]
    log_format: Option<String>,

    /// Mount the /debug/{method} routes
    #[arg(long)]
    debug_routes: bool,
}

impl Args {
    /// Command-line flags win over file and environment.
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.listen_address {
            config.server.host = host;
        }
        if let Some(port) = self.listen_port {
            config.server.port = port;
        }
        if let Some(proxy) = self.proxy {
            config.upstream.proxy = Some(proxy);
        }
        if let Some(path) = self.log_file {
            config.logging.file_path = Some(path);
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
        if self.debug_routes {
            config.server.debug_routes = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;

    // Site-specific extractors register here.
    let state = AppState::from_config(&config, Registry::new())?;

    let listener = tokio::net::TcpListener::bind(config.http_address())
        .await
        .map_err(|e| anyhow::anyhow!("create listener error: {e}"))?;
    let addr = listener.local_addr()?;

    println!("listening on {addr} ...");
    println!("access in player with room id. eg. http://{addr}/<platform>/<room>\n");
    info!(%addr, debug_routes = config.server.debug_routes, "LSF server started");

    server::run(listener, state, CancellationToken::new()).await;

    info!("Server shutdown complete");
    Ok(())
}
