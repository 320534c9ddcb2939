use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dirserve::{AppState, Config, routes};

#[derive(Parser, Debug)]
#[command(name = "dirserve")]
#[command(about = "Serve a directory tree over HTTP with listings and archive downloads")]
#[command(version)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, env = "DIRSERVE_PORT", default_value = "8080")]
    port: u16,

    /// Address to bind to
    #[arg(short, long, env = "DIRSERVE_BIND", default_value = "0.0.0.0")]
    bind: String,

    /// Root directory to serve files from
    #[arg(short, long, env = "DIRSERVE_ROOT", default_value = ".")]
    root: PathBuf,

    /// URL prefix to mount the file server at (overrides the config file)
    #[arg(long, env = "DIRSERVE_ROUTE")]
    route: Option<String>,

    /// Accept file uploads into directories
    #[arg(long, env = "DIRSERVE_ALLOW_UPLOAD")]
    allow_upload: bool,

    /// Accept file deletion
    #[arg(long, env = "DIRSERVE_ALLOW_DELETE")]
    allow_delete: bool,

    /// Enable verbose logging
    #[arg(short, long, env = "DIRSERVE_VERBOSE")]
    verbose: bool,

    /// Config file path (optional)
    #[arg(short, long, env = "DIRSERVE_CONFIG")]
    config: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(route) = &self.route {
            config.route = route.clone();
        }
        config.allow_upload |= self.allow_upload;
        config.allow_delete |= self.allow_delete;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "dirserve=debug,tower_http=debug"
    } else {
        "dirserve=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = if let Some(config_path) = &cli.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };
    cli.apply(&mut config);

    let root_dir = cli
        .root
        .canonicalize()
        .map_err(|e| format!("Root directory {} is not usable: {}", cli.root.display(), e))?;

    if !root_dir.is_dir() {
        return Err(format!("Root path is not a directory: {}", root_dir.display()).into());
    }

    info!("Serving files from: {}", root_dir.display());
    let mount = config.mount_point();
    info!(
        "Mounted at {} (upload: {}, delete: {})",
        if mount.is_empty() { "/" } else { mount.as_str() },
        config.allow_upload,
        config.allow_delete
    );

    let state = AppState::with_config(root_dir, config)?;
    let app = routes::app(state);

    let addr: SocketAddr = format!("{}:{}", cli.bind, cli.port).parse()?;
    info!("Starting dirserve on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}
