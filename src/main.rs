use actix_web::middleware::Logger;
use actix_web::{App, HttpServer, web};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use env_logger::Env;
use log::{info, warn};
use std::io;
use std::time::Duration;

use sqlgate::auth::{AuthGuard, generate_secret};
use sqlgate::config::{Config, PoolConfig, ServerConfig};
use sqlgate::executor::PgManager;
use sqlgate::pool::Pool;
use sqlgate::server::{AppState, configure_routes};

/// HTTP gateway running parameterized SQL against PostgreSQL
#[derive(Debug, Parser)]
#[command(name = "sqlgate", version, about)]
struct Cli {
    /// PostgreSQL connection string
    #[arg(short, long, env = "PG_DSN")]
    dsn: Option<String>,

    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(short, long, env = "PORT", default_value_t = 5499)]
    port: u16,

    /// Bearer secret required on every request; unset disables auth
    #[arg(short, long, env = "PG_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Maximum number of concurrent database connections
    #[arg(long, env = "PG_POOL_SIZE", default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..))]
    pool_size: u32,

    /// Open every connection at startup instead of on first use
    #[arg(long, env = "PG_POOL_EAGER")]
    eager: bool,

    /// Seconds to wait for a free connection before failing the request
    #[arg(long, env = "PG_ACQUIRE_TIMEOUT", default_value_t = 30)]
    acquire_timeout: u64,

    /// Seconds in-flight requests get to finish on shutdown
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 10)]
    shutdown_timeout: u64,

    #[arg(long, env = "MAX_BODY_SIZE_MB", default_value_t = 10)]
    max_body_size_mb: usize,

    /// Print a random secret suitable for --secret and exit
    #[arg(long)]
    gen_secret: bool,
}

impl Cli {
    fn into_config(self) -> Config {
        let Some(database_url) = self.dsn else {
            Cli::command()
                .error(
                    ErrorKind::MissingRequiredArgument,
                    "a connection string is required (--dsn or PG_DSN)",
                )
                .exit()
        };

        Config {
            server: ServerConfig {
                host: self.host,
                port: self.port,
                max_body_size_mb: self.max_body_size_mb,
                shutdown_timeout_secs: self.shutdown_timeout,
            },
            pool: PoolConfig::default()
                .with_max_size(self.pool_size as usize)
                .with_eager(self.eager)
                .with_acquire_timeout(Duration::from_secs(self.acquire_timeout))
                .with_shutdown_grace(Duration::from_secs(self.shutdown_timeout)),
            database_url,
            secret: self.secret.filter(|secret| !secret.is_empty()),
        }
    }
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    if cli.gen_secret {
        println!("{}", generate_secret());
        return Ok(());
    }

    env_logger::Builder::from_env(Env::default().default_filter_or("sqlgate=info,actix_web=info"))
        .init();

    let config = cli.into_config();
    let bind_addr = (config.server.host.clone(), config.server.port);

    let guard = AuthGuard::new(config.secret.as_deref());
    if !guard.is_enabled() {
        warn!("No secret configured; requests are accepted without authentication");
    }

    let manager = PgManager::new(&config.database_url).map_err(io::Error::other)?;
    let pool = Pool::new(manager, config.pool.clone())
        .await
        .map_err(io::Error::other)?;

    info!(
        "Starting sqlgate on {}:{} (pool size {}, {})",
        bind_addr.0,
        bind_addr.1,
        config.pool.max_size,
        if config.pool.eager { "eager" } else { "lazy" }
    );

    let state = web::Data::new(AppState::new(pool.clone()));
    let guard = web::Data::new(guard);
    let payload = web::PayloadConfig::new(config.server.max_body_size_bytes());

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(state.clone())
            .app_data(guard.clone())
            .app_data(payload.clone())
            .configure(configure_routes::<PgManager>)
    })
    .shutdown_timeout(config.server.shutdown_timeout_secs)
    .bind(bind_addr)?
    .run()
    .await?;

    info!("Listener stopped, draining connection pool");
    pool.close().await;

    Ok(())
}
