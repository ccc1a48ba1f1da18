use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn, LevelFilter};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use threecompute_backend::api::{create_router, AppState};
use threecompute_backend::auth::{AuthState, SessionKey, UserStore};
use threecompute_backend::container::{ContainerDriver, DockerCli, DriverConfig, MAX_USERS};
use threecompute_backend::files::FilesConfig;
use threecompute_backend::observability;
use threecompute_backend::terminal::Hub;
use threecompute_backend::webhook::WebhookConfig;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "3compute workspace backend: per-user sandbox containers with multiplexed web terminals"
)]
struct Cli {
    /// Host address to bind to
    #[arg(long, default_value = "0.0.0.0", env = "HOST_IP")]
    host: String,
    /// Port to listen on
    #[arg(short, long, default_value_t = 5555)]
    port: u16,
    /// Override the config file path
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Enable debug logging
    #[arg(long)]
    debug: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
    /// Reduce output to only errors
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    /// "development" or "production".
    app_env: String,
    /// HMAC secret for session cookies. Required.
    session_secret: String,
    /// First port of the first user's reserved range.
    port_base: u16,
    /// Truthy in CI: skips host-isolation packet-filter rules.
    ci: bool,
    /// Shared secret for the GitHub deployment webhook.
    github_webhook_secret: String,
    /// Script run on a successful main-branch workflow.
    deploy_script: String,
    /// Browser origin allowed by CORS.
    frontend_origin: String,
    /// Host directory holding one upload directory per user.
    uploads_root: String,
    /// Persistent user record file.
    users_file: String,
    container: ContainerSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ContainerSection {
    /// Container engine binary.
    binary: String,
    /// In-container user the sandboxes run as.
    uid: u32,
    gid: u32,
    /// CPU cap per container.
    cpu_per_user: f64,
    /// Memory cap per container in MB; probed from the host when unset.
    memory_per_user_mb: Option<u64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_env: "development".to_string(),
            session_secret: String::new(),
            port_base: 8000,
            ci: false,
            github_webhook_secret: String::new(),
            deploy_script: "/opt/deploy.sh".to_string(),
            frontend_origin: "http://localhost:3000".to_string(),
            uploads_root: "/tmp/uploads".to_string(),
            users_file: "users.json".to_string(),
            container: ContainerSection::default(),
        }
    }
}

impl Default for ContainerSection {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            uid: 999,
            gid: 995,
            cpu_per_user: 1.0,
            memory_per_user_mb: None,
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    let mut builder = config::Config::builder();
    match path {
        Some(path) => {
            builder = builder.add_source(config::File::from(path.clone()));
        }
        None => {
            builder = builder.add_source(config::File::with_name("3compute").required(false));
        }
    }
    builder = builder.add_source(config::Environment::default().try_parsing(true));

    builder
        .build()
        .context("loading configuration")?
        .try_deserialize()
        .context("parsing configuration")
}

fn init_logging(cli: &Cli) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let level = if cli.quiet {
        LevelFilter::Error
    } else if cli.debug || cli.verbose == 1 {
        LevelFilter::Debug
    } else if cli.verbose >= 2 {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    };

    let level_str = match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "threecompute_backend={level_str},tower_http={level_str}"
        ))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .ok();

    // Also init env_logger for compatibility with log crate users.
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.filter_level(level);
    builder.try_init().ok();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let config = load_config(cli.config.as_ref())?;
    let production = config.app_env == "production";

    if config.session_secret.is_empty() {
        anyhow::bail!("SESSION_SECRET environment variable is not set");
    }
    if config.github_webhook_secret.is_empty() {
        warn!("GITHUB_WEBHOOK_SECRET is not set; deployment webhook requests will be rejected");
    }

    let memory_per_user_mb = config
        .container
        .memory_per_user_mb
        .unwrap_or_else(|| observability::memory_per_user_mb(MAX_USERS));
    info!(
        "resource limits: {:.1} cpu, {} MB memory per user",
        config.container.cpu_per_user, memory_per_user_mb
    );

    let driver = Arc::new(DockerCli::new(DriverConfig {
        binary: config.container.binary.clone(),
        uploads_root: PathBuf::from(&config.uploads_root),
        uid: config.container.uid,
        gid: config.container.gid,
        cpu_per_user: config.container.cpu_per_user,
        memory_per_user_mb,
        ci: config.ci,
    }));

    // The isolated network is the one hard startup requirement; per-user
    // failures later are contained, this one is not.
    driver
        .setup_isolated_network()
        .await
        .context("failed to setup isolated network")?;

    if let Err(err) = driver.setup_uploads_root().await {
        warn!("failed to setup uploads directory: {err}");
    }

    let (hub, hub_channels) = Hub::new(driver.clone());
    tokio::spawn(hub.clone().run(hub_channels));

    let auth = AuthState::new(
        SessionKey::new(config.session_secret.clone()),
        UserStore::new(
            config.users_file.as_str(),
            config.port_base,
            config.uploads_root.as_str(),
        ),
        production,
    );

    let state = AppState {
        hub: hub.clone(),
        driver,
        auth,
        files: FilesConfig {
            root: PathBuf::from(&config.uploads_root),
            uid: config.container.uid,
            gid: config.container.gid,
        },
        webhook: WebhookConfig {
            secret: config.github_webhook_secret.clone(),
            deploy_script: PathBuf::from(&config.deploy_script),
        },
    };

    let router = create_router(state, &config.frontend_origin, !production);

    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("Serving on http://{addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(hub))
        .await
        .context("server error")?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal(hub: Arc<Hub>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate()).ok();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = async {
                match terminate.as_mut() {
                    Some(stream) => { stream.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutting down server...");
    hub.stop();
}
