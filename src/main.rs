use clap::Parser;
use nbjava_bridge::config::BridgeConfig;
use nbjava_bridge::debug::{DebugRegistry, LaunchConfiguration, WorkspaceFolder};
use nbjava_bridge::extension::{ExtensionContext, activate};
use nbjava_bridge::logging::{LogConfig, init_logging};
use serde_json::json;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// Minimal extension host for the NetBeans Java language server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Extension install directory (defaults to the parent of the executable's directory)
    #[arg(long, value_name = "DIR")]
    extension_dir: Option<PathBuf>,

    /// Workspace root the server runs in (defaults to current directory)
    #[arg(long, value_name = "DIR")]
    workspace_root: Option<PathBuf>,

    /// Language server executable (overrides NBJAVA_SERVER_PATH env var)
    #[arg(long, value_name = "PATH")]
    server_path: Option<PathBuf>,

    /// Debug adapter port on 127.0.0.1 (overrides NBJAVA_DEBUG_PORT env var)
    #[arg(long, value_name = "PORT")]
    debug_port: Option<u16>,

    /// Start a Java debug session for PROGRAM once the server is ready
    #[arg(long, value_name = "PROGRAM")]
    launch: Option<String>,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides NBJAVA_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

fn default_extension_dir() -> std::io::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    Ok(exe
        .parent()
        .and_then(|bin| bin.parent())
        .map(PathBuf::from)
        .unwrap_or_default())
}

fn build_config(args: &Args) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    let mut builder = BridgeConfig::builder().apply_env()?;
    if let Some(path) = &args.server_path {
        builder = builder.server_path(path);
    }
    if let Some(port) = args.debug_port {
        builder = builder.debug_port(port);
    }
    Ok(builder.build()?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_config = LogConfig::from_env().with_overrides(args.log_level.clone(), args.log_file.clone());
    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let config = build_config(&args)?;
    let extension_dir = match args.extension_dir.clone() {
        Some(dir) => dir,
        None => default_extension_dir()?,
    };
    let workspace_root = match args.workspace_root.clone() {
        Some(root) => root,
        None => std::env::current_dir()?,
    };

    info!(
        "Starting bridge; extension dir: {}, workspace: {}",
        extension_dir.display(),
        workspace_root.display()
    );

    let registry = DebugRegistry::new(config.request_timeout);
    let mut ctx = ExtensionContext::new(extension_dir, Some(workspace_root.clone()));
    let extension = activate(&mut ctx, &registry, &config)?;

    let mut debug_connection = None;
    match extension.ready().await {
        Ok(()) => {
            info!("Language server ready");
            if let Some(program) = &args.launch {
                let mut launch = LaunchConfiguration::new();
                launch.insert("type", config.language_id.as_str());
                launch.insert("name", format!("Launch {program}"));
                launch.insert("request", "launch");
                launch.insert("program", json!(program));

                let folder = WorkspaceFolder::new(&workspace_root);
                match registry.start_debugging(Some(&folder), launch, None).await {
                    Ok(connection) => {
                        info!("Debug session '{}' started", connection.session().name);
                        debug_connection = Some(connection);
                    }
                    Err(e) => error!("Failed to start debug session: {}", e),
                }
            }
        }
        Err(e) => error!("Language server did not start: {}", e),
    }

    info!("Bridge running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    if let Some(connection) = debug_connection {
        if let Err(e) = connection.disconnect().await {
            warn!("Debug disconnect failed: {}", e);
        }
    }
    extension.deactivate().await?;
    ctx.dispose();

    info!("Bridge stopped");
    Ok(())
}
