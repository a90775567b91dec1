//! Database Module
//!
//! # Interview Q&A
//!
//! Q: 정산 코어의 정합성은 어디서 보장하는가?
//! A: 저장소 계층의 트랜잭션 + 행 잠금
//!
//!    1. 잔액/판매 등록은 `SELECT ... FOR UPDATE`로 잠근 뒤에만 변경
//!    2. 멱등성 키는 `INSERT ... ON CONFLICT DO NOTHING`으로 선점
//!    3. 차감/지급/기록/완료 표시는 하나의 트랜잭션에서 커밋
//!    4. 워커가 여러 프로세스에 분산되어도 애플리케이션 mutex에 의존하지 않음
//!
//! Q: 테스트는 어떻게 DB 없이 돌리는가?
//! A: `MemoryStore`가 같은 `SettlementStore`/`UnitOfWork` trait을 구현
//!    - 유닛 단위로 전체 상태를 직렬화 (행 잠금보다 강한 보장)
//!    - 서비스 코드는 백엔드를 구분하지 않음
//!
//! Q: 커넥션 풀은 어떻게 관리하는가?
//! A: SQLx의 PgPool 사용
//!    - 최대 커넥션 수는 `DB_MAX_CONNECTIONS`
//!    - acquire_timeout 3초
//!    - 트랜잭션마다 `SET LOCAL lock_timeout`

mod memory;
mod models;
mod postgres;
mod repository;

use std::sync::Arc;
use std::time::Duration;

pub use memory::MemoryStore;
pub use models::*;
pub use repository::{LockMode, SettlementStore, UnitOfWork};

use anyhow::Result;
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::config::{Config, StorageBackend};

/// PostgreSQL 연결 및 쿼리 담당
pub struct Database {
    pool: PgPool,
    lock_timeout: Duration,
}

impl Database {
    /// 데이터베이스 연결
    ///
    /// # Connection Pool Settings
    ///
    /// - max_connections: 설정값 (트래픽에 따라 조정)
    /// - min_connections: 1 (idle 시 최소 유지)
    /// - acquire_timeout: 3초 (커넥션 획득 대기)
    pub async fn connect(database_url: &str, max_connections: u32, lock_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(3))
            .connect(database_url)
            .await?;

        Ok(Self { pool, lock_timeout })
    }

    /// 마이그레이션 실행
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

/// Builds the configured backend.
pub async fn open_store(config: &Config) -> Result<Arc<dyn SettlementStore>> {
    match config.storage_backend {
        StorageBackend::Postgres => {
            let db = Database::connect(&config.database_url, config.db_max_connections, config.lock_timeout)
                .await?;
            tracing::info!("🗄️  Database connected");
            db.run_migrations().await?;
            tracing::info!("📦 Migrations completed");
            Ok(Arc::new(db))
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory store; state is lost on exit");
            Ok(Arc::new(MemoryStore::with_lock_timeout(config.lock_timeout)))
        }
    }
}
