use std::{net::SocketAddr, sync::Arc};

use anyhow::{anyhow, Context};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderName, Method};
use axum::response::IntoResponse;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

use relaycron_backend::clock::SystemClock;
use relaycron_backend::config::Config;
use relaycron_backend::db::{
    postgres_cron_repository::PostgresCronRepository,
    postgres_drone_repository::PostgresDroneRepository,
    postgres_job_repository::PostgresJobRepository,
    postgres_secret_repository::PostgresSecretRepository,
    postgres_tenant_repository::PostgresTenantRepository,
    postgres_workflow_repository::PostgresWorkflowRepository,
};
use relaycron_backend::responses::JsonResponse;
use relaycron_backend::routes::{self, TENANT_HEADER};
use relaycron_backend::utils::encryption::KeyRing;
use relaycron_backend::{worker, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = Config::from_env().context("invalid configuration")?;

    let global_governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_millisecond(config.rate_limit_ms)
            .burst_size(config.rate_limit_burst)
            .use_headers()
            .error_handler(|_err| {
                JsonResponse::too_many_requests(
                    "Too many requests. Please wait a moment and try again.",
                    None,
                )
                .into_response()
            })
            .finish()
            .ok_or_else(|| anyhow!("invalid rate limiter settings"))?,
    );
    let governor_limiter = global_governor_conf.limiter().clone();
    std::thread::spawn(move || {
        let interval = std::time::Duration::from_secs(60);
        loop {
            std::thread::sleep(interval);
            governor_limiter.retain_recent();
        }
    });

    let pool = establish_connection(&config.database_url).await?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let cipher = KeyRing::new(config.master_keys.clone()).context("invalid master keys")?;
    let bind_addr = config.bind_addr;

    let state = AppState {
        tenants: Arc::new(PostgresTenantRepository { pool: pool.clone() }),
        jobs: Arc::new(PostgresJobRepository { pool: pool.clone() }),
        crons: Arc::new(PostgresCronRepository { pool: pool.clone() }),
        drones: Arc::new(PostgresDroneRepository { pool: pool.clone() }),
        workflows: Arc::new(PostgresWorkflowRepository { pool: pool.clone() }),
        secrets: Arc::new(PostgresSecretRepository { pool }),
        cipher: Arc::new(cipher),
        clock: Arc::new(SystemClock),
        config: Arc::new(config),
    };

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE, HeaderName::from_static(TENANT_HEADER)]);

    worker::start_background_workers(state.clone()).await;

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(GovernorLayer {
            config: global_governor_conf,
        })
        .layer(cors);

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;
    info!(addr = %bind_addr, "relaycron listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")?;
    Ok(())
}

/// `RUST_LOG` picks the filter; `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn establish_connection(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPool::connect(database_url)
        .await
        .context("failed to connect to the database")?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .context("failed to verify database connection")?;

    info!("connected to the database");
    Ok(pool)
}
