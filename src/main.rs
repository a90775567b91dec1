//! Draw Settlement Worker
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Surrounding application (HTTP, admin)           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ Engine handles
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Settlement Engine                        │
//! │  ┌─────────────────────────────────────────────────────────┐│
//! │  │                    Services Layer                        ││
//! │  │  IdempotencyGate  Ledger  DrawService  MarketService    ││
//! │  └─────────────────────────────────────────────────────────┘│
//! │  ┌─────────────────────────────────────────────────────────┐│
//! │  │                    Data Layer                            ││
//! │  │  PostgreSQL (row locks)    In-memory store (tests)      ││
//! │  └─────────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! This binary prepares the schema, loads the campaign catalog and runs the
//! stale-record sweeper until ctrl-c.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use draw_settlement::{db, services::StaticCatalog, Config, Engine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 환경변수 로드
    dotenvy::dotenv().ok();

    // 로깅 초기화
    // RUST_LOG=debug,sqlx=warn 형태로 레벨 제어 가능
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "draw_settlement=debug,sqlx=warn".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("🚀 Starting draw settlement worker");

    // 설정 로드
    let config = Config::from_env()?;
    tracing::info!(environment = ?config.environment, backend = ?config.storage_backend, "📋 Configuration loaded");

    // 저장소 (PostgreSQL이면 마이그레이션 포함)
    let store = db::open_store(&config).await?;
    store.health_check().await?;

    // 캠페인 카탈로그
    let catalog = StaticCatalog::from_file(&config.campaign_config_path)
        .with_context(|| format!("loading campaign catalog from {}", config.campaign_config_path))?;

    let engine = Engine::new(store, Arc::new(catalog), &config);
    tracing::info!("⚙️  Settlement engine ready");

    // stale 레코드 sweeper
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(engine.sweeper().run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    shutdown_tx.send(true).ok();
    sweeper.await?;

    Ok(())
}
