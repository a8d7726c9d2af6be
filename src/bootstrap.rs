use std::{sync::Arc, time::Duration};

use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::info;

use crate::{
    accrual::AccrualClient,
    api::AppState,
    config::Config,
    error::AppResult,
    ledger::LedgerRepository,
    reconcile::{Pipeline, PipelineConfig, PipelineHandle},
};

pub async fn initialize_app(config: &Config) -> AppResult<(AppState, PipelineHandle)> {
    info!("initializing application components");

    let pool = initialize_database(&config.database_url).await?;
    let ledger = Arc::new(LedgerRepository::new(pool));
    let accrual = Arc::new(AccrualClient::new(config));

    let pipeline = Pipeline::spawn(
        ledger.clone(),
        accrual,
        PipelineConfig::from_config(config),
    );

    let state = AppState {
        ledger,
        jwt_secret: config.jwt_secret.clone(),
        jwt_ttl: config.jwt_ttl,
    };

    Ok((state, pipeline))
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("connecting to database");

    let pool = PgPoolOptions::new()
        .max_connections(30)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await?;

    info!("running database migrations");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("database initialized");
    Ok(pool)
}
