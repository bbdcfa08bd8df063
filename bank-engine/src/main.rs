use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use bank_core::payto::Iban;
use bank_engine::config::Config;
use bank_engine::database::Database;
use bank_engine::handlers::{self, AppState};
use bank_engine::{auth, errors, metrics};
use dotenv::dotenv;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Exit codes: 0 normal, 1 startup/configuration failure, 2 database
/// migration failure.
const EXIT_CONFIG: i32 = 1;
const EXIT_MIGRATION: i32 = 2;

/// Largest accepted request body (after decompression).
const MAX_BODY_BYTES: usize = 4096;

async fn seed_admin(db: &Database, config: &Config) -> anyhow::Result<()> {
    if db.account_password_hash("admin").await?.is_some() {
        return Ok(());
    }
    let password = config
        .bank
        .admin_password
        .clone()
        .context("admin account missing and bank.admin_password not set")?;
    let hash = auth::hash_password(password).await?;
    let payto = match config.bank.wire_type.as_str() {
        "x-taler-bank" => format!("payto://x-taler-bank/{}/admin", config.bank.hostname),
        _ => format!(
            "payto://iban/{}",
            Iban::random(&config.bank.iban_country, &mut rand::thread_rng())
        ),
    };
    db.seed_admin(&hash, &payto).await?;
    info!("seeded the admin account");
    Ok(())
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    };
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        std::process::exit(EXIT_CONFIG);
    }

    info!("Starting bank engine on port {}", config.server.port);

    let db = match Database::new(
        &config.database.url,
        config.database.max_connections,
        &config.bank.currency,
    )
    .await
    {
        Ok(db) => db,
        Err(e) => {
            error!("Failed to connect to database: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    if let Err(e) = db.run_migrations().await {
        error!("Database migration failed: {e}");
        std::process::exit(EXIT_MIGRATION);
    }

    if let Err(e) = seed_admin(&db, &config).await {
        error!("Admin seeding failed: {e}");
        std::process::exit(EXIT_CONFIG);
    }

    metrics::register_metrics();

    let workers = config.server.workers;
    let bind = (config.server.host.clone(), config.server.port);
    let state = web::Data::new(AppState {
        db: Arc::new(db),
        config: Arc::new(config),
    });

    HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .app_data(state.clone())
            .app_data(
                web::JsonConfig::default()
                    .limit(MAX_BODY_BYTES)
                    .error_handler(errors::json_error_handler),
            )
            .configure(handlers::configure_routes)
    })
    .workers(workers)
    .bind(bind)?
    .run()
    .await
}
