use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser};
use lloggs::LoggingArgs;
use tracing::info;

use lapse_server::auth::TokenVerifier;
use lapse_server::{AppState, Config, FileManager, MetadataDb, UploadPolicy, router};

#[derive(Parser)]
#[command(name = "lapse-server")]
#[command(about = "Ephemeral file upload server")]
struct Args {
    /// Address to listen on
    #[arg(long, short, default_value = "127.0.0.1:8081")]
    listen: SocketAddr,

    /// Storage root directory
    #[arg(long, short = 'b', default_value = ".")]
    base_path: PathBuf,

    /// SQLite database path [default: <base-path>/database.db]
    #[arg(long)]
    database: Option<PathBuf>,

    /// Storage backend for new uploads
    #[arg(long, default_value = "on-disk")]
    file_location: String,

    /// Allow uploads without a token
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    allow_guest_uploads: bool,

    /// Delete guest uploads after --guest-file-deletion-time
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    enable_guest_file_deletion: bool,

    /// Hours before guest uploads are deleted
    #[arg(long, default_value_t = 12)]
    guest_file_deletion_time: u64,

    /// Max guest upload size in MiB, 0 to use --max-file-size
    #[arg(long, default_value_t = 15)]
    max_guest_file_size: u64,

    /// Max upload size in MiB, 0 for unlimited
    #[arg(long, default_value_t = 50)]
    max_file_size: u64,

    /// Secret used to verify upload tokens
    #[arg(long, env = "LAPSE_HMAC_SECRET_KEY", hide_env_values = true)]
    hmac_secret_key: Option<String>,

    /// Seconds between expiry checks when nothing is scheduled
    #[arg(long, default_value_t = 60)]
    idle_interval: u64,

    #[command(flatten)]
    logging: LoggingArgs,
}

impl Args {
    fn config(&self) -> Config {
        let mut policy = UploadPolicy::from_mib(self.max_file_size, self.max_guest_file_size);
        policy.allow_guest_uploads = self.allow_guest_uploads;
        policy.guest_file_lifetime = self
            .enable_guest_file_deletion
            .then(|| Duration::from_secs(self.guest_file_deletion_time.saturating_mul(3600)));

        Config {
            listen_addr: self.listen,
            database_path: self
                .database
                .clone()
                .unwrap_or_else(|| self.base_path.join("database.db")),
            base_path: self.base_path.clone(),
            file_location: self.file_location.clone(),
            hmac_secret: self.hmac_secret_key.clone().filter(|s| !s.is_empty()),
            idle_interval: Duration::from_secs(self.idle_interval.max(1)),
            policy,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    let _guard = args.logging.setup(|v| match v {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    })?;
    let config = args.config();

    info!(listen = %config.listen_addr, base_path = ?config.base_path, "Starting server");

    tokio::fs::create_dir_all(&config.base_path).await?;
    let db = Arc::new(MetadataDb::open(&config.database_path)?);
    info!(db_path = ?config.database_path, "Opened metadata database");

    let files = Arc::new(FileManager::for_mode(
        &config.file_location,
        &config.base_path,
        db.clone(),
        config.idle_interval,
    )?);

    // the schedule only lives in memory; pick up what a previous run left
    files.rehydrate()?;
    files.scheduler().start();

    let tokens = config.hmac_secret.as_deref().map(TokenVerifier::new);
    if tokens.is_none() {
        info!("No HMAC secret configured, only guest uploads are possible");
    }
    let app = router(AppState::new(
        Arc::clone(&files),
        db,
        config.policy.clone(),
        tokens,
    ));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!("Listening on {}", config.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    files.scheduler().stop().await;
    Ok(())
}
