//! Draw Settlement Library
//!
//! # Overview
//!
//! 포인트 추첨/마켓 경제의 정산 코어. 멱등성 게이트, 원장, 천장 계산기,
//! 추첨 파이프라인, 마켓 정산을 제공합니다. HTTP/인증/알림 등은 이 라이브러리를
//! 호출하는 바깥 애플리케이션의 몫입니다.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Engine                            │
//! │                                                          │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌─────────┐  │
//! │  │DrawService│ │ Market   │  │ Ledger   │  │Inventory│  │
//! │  └────┬─────┘  └────┬─────┘  └────┬─────┘  └────┬────┘  │
//! │       │  PityCalculator            │             │       │
//! │       └──────┬──────┴──────────────┴─────────────┘       │
//! │              │  IdempotencyGate                          │
//! └──────────────┼───────────────────────────────────────────┘
//!                ▼
//!       ┌──────────────────┐
//!       │ SettlementStore  │  PostgreSQL | in-memory
//!       └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - `config`: 환경 설정 관리
//! - `error`: 에러 타입 및 reason code
//! - `services`: 게이트, 원장, 천장, 추첨, 마켓, 인벤토리, 카탈로그, sweeper
//! - `db`: 저장소 trait과 백엔드
//! - `types`: 공통 타입 정의
//!
//! ## Usage
//!
//! ```rust,ignore
//! use draw_settlement::{db, Config, Engine, services::{DrawRequest, StaticCatalog}};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let store = db::open_store(&config).await?;
//!     let catalog = std::sync::Arc::new(StaticCatalog::from_file(&config.campaign_config_path)?);
//!     let engine = Engine::new(store, catalog, &config);
//!
//!     let outcome = engine.draws.draw(DrawRequest::single("req-1", 42, "spring")).await?;
//!     println!("{:?}", outcome.awards);
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

pub mod config;
pub mod db;
pub mod error;
pub mod services;
pub mod types;

// Re-exports for convenience
pub use config::Config;
pub use db::{Database, MemoryStore, SettlementStore};
pub use error::{SettlementError, Result};
pub use services::{
    CampaignCatalog, DrawService, IdempotencyGate, InventoryService, Ledger, MarketService, StaleRecordSweeper,
};

/// 서비스 핸들 묶음 - 시작 시 한 번 명시적으로 구성해서 호출자에게 전달
#[derive(Clone)]
pub struct Engine {
    pub store: Arc<dyn SettlementStore>,
    pub catalog: Arc<dyn CampaignCatalog>,
    pub gate: IdempotencyGate,
    pub ledger: Ledger,
    pub draws: DrawService,
    pub market: MarketService,
    pub inventory: InventoryService,
    pub config: Arc<Config>,
}

impl Engine {
    pub fn new(store: Arc<dyn SettlementStore>, catalog: Arc<dyn CampaignCatalog>, config: &Config) -> Self {
        let gate = IdempotencyGate::new(store.clone(), config.idempotency_ttl);
        Self {
            ledger: Ledger::new(store.clone(), gate.clone()),
            draws: DrawService::new(store.clone(), gate.clone(), catalog.clone()),
            market: MarketService::new(
                store.clone(),
                gate.clone(),
                config.market_fee_bps,
                config.listing_lock_mode,
            ),
            inventory: InventoryService::new(store.clone()),
            gate,
            store,
            catalog,
            config: Arc::new(config.clone()),
        }
    }

    pub fn sweeper(&self) -> StaleRecordSweeper {
        StaleRecordSweeper::new(self.gate.clone(), self.config.sweep_interval)
    }
}
