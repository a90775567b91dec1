//! Repository Pattern Implementation
//!
//! Storage is split in two traits:
//!
//! - [`SettlementStore`]: the handle shared by every worker. Opens atomic
//!   units and serves side-effect-free reads.
//! - [`UnitOfWork`]: one atomic unit. Every mutation of a shared row goes
//!   through here, and rows read with `lock_*` stay exclusively held until
//!   `commit`/`rollback` (or drop, which rolls back).
//!
//! ```text
//!   service ──begin()──▶ UnitOfWork ──lock_balance / lock_listing──▶ rows held
//!      │                    │
//!      │                    ├─ save_* / insert_* / append_*
//!      │                    └─ commit() ──▶ visible to everyone, locks released
//!      └── reads (find_*, list_*) never take row locks
//! ```
//!
//! Business rules (delta arithmetic, status checks, pity) live in the
//! services; the backends only provide row primitives with the right locking
//! behavior. PostgreSQL implements them with `SELECT ... FOR UPDATE` and
//! `INSERT ... ON CONFLICT DO NOTHING`; the in-memory backend serializes
//! whole units.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{
    Account, AccountKind, Balance, DrawRecord, DrawStreak, IdempotencyRecord, InventoryItem,
    LedgerEntry, LedgerTotals, Listing, MarketOrder, NewLedgerEntry, PrizeStock,
};
use crate::error::Result;
use crate::types::{AssetCode, PageRequest, TimeRange, UserId};

/// How a listing row lock is acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Block, bounded by the store's lock timeout.
    Wait,
    /// Fail immediately with `LockAcquisitionTimeout` if another unit holds it.
    NoWait,
}

/// Shared store handle.
#[async_trait]
pub trait SettlementStore: Send + Sync {
    /// Opens an atomic unit.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>>;

    async fn health_check(&self) -> Result<()>;

    async fn find_idempotency_record(&self, key: &str) -> Result<Option<IdempotencyRecord>>;

    async fn find_account(&self, owner_id: UserId, kind: AccountKind) -> Result<Option<Account>>;

    async fn find_balance(&self, account_id: Uuid, asset: &AssetCode) -> Result<Option<Balance>>;

    /// Newest first, plus total count for the filter.
    async fn list_ledger_entries(
        &self,
        account_id: Uuid,
        asset: &AssetCode,
        range: TimeRange,
        page: PageRequest,
    ) -> Result<(Vec<LedgerEntry>, u64)>;

    async fn list_draw_records(
        &self,
        user_id: UserId,
        campaign_code: Option<&str>,
        page: PageRequest,
    ) -> Result<(Vec<DrawRecord>, u64)>;

    async fn find_draw_streak(&self, user_id: UserId, campaign_code: &str) -> Result<Option<DrawStreak>>;

    async fn list_items(&self, owner_id: UserId) -> Result<Vec<InventoryItem>>;

    async fn find_listing(&self, listing_id: Uuid) -> Result<Option<Listing>>;

    async fn find_order_for_listing(&self, listing_id: Uuid) -> Result<Option<MarketOrder>>;
}

/// One atomic unit of reads and writes.
#[async_trait]
pub trait UnitOfWork: Send {
    // ============ Idempotency ============

    /// Inserts a new record. Returns `false` (and writes nothing) when the key
    /// already exists; a concurrent insert of the same key never overwrites.
    async fn insert_idempotency_record(&mut self, record: &IdempotencyRecord) -> Result<bool>;

    async fn lock_idempotency_record(&mut self, key: &str) -> Result<Option<IdempotencyRecord>>;

    async fn save_idempotency_record(&mut self, record: &IdempotencyRecord) -> Result<()>;

    /// Moves every `pending` record with `expires_at <= now` to `failed`.
    async fn expire_idempotency_records(&mut self, now: DateTime<Utc>) -> Result<u64>;

    // ============ Ledger ============

    async fn get_or_create_account(&mut self, owner_id: UserId, kind: AccountKind) -> Result<Account>;

    /// Get-or-create the balance row and hold its lock.
    async fn lock_balance(&mut self, account_id: Uuid, asset: &AssetCode) -> Result<Balance>;

    async fn save_balance(&mut self, balance: &Balance) -> Result<()>;

    async fn append_ledger_entry(&mut self, entry: NewLedgerEntry) -> Result<LedgerEntry>;

    /// Sums every entry of one balance. Callers lock the balance first so the
    /// sum and the row reflect the same set of deltas.
    async fn ledger_totals(&mut self, account_id: Uuid, asset: &AssetCode) -> Result<LedgerTotals>;

    // ============ Draws ============

    /// Get-or-create the streak row and hold its lock.
    async fn lock_draw_streak(&mut self, user_id: UserId, campaign_code: &str) -> Result<DrawStreak>;

    async fn save_draw_streak(&mut self, streak: &DrawStreak) -> Result<()>;

    async fn insert_draw_record(&mut self, record: &DrawRecord) -> Result<()>;

    /// Get-or-create the stock row (seeded with `initial`) and hold its lock.
    async fn lock_prize_stock(
        &mut self,
        campaign_code: &str,
        prize_code: &str,
        initial: Option<i64>,
    ) -> Result<PrizeStock>;

    async fn save_prize_stock(&mut self, stock: &PrizeStock) -> Result<()>;

    // ============ Inventory ============

    async fn insert_item(&mut self, item: &InventoryItem) -> Result<()>;

    async fn lock_item(&mut self, item_id: Uuid) -> Result<Option<InventoryItem>>;

    async fn save_item(&mut self, item: &InventoryItem) -> Result<()>;

    // ============ Market ============

    async fn insert_listing(&mut self, listing: &Listing) -> Result<()>;

    async fn lock_listing(&mut self, listing_id: Uuid, mode: LockMode) -> Result<Option<Listing>>;

    async fn save_listing(&mut self, listing: &Listing) -> Result<()>;

    async fn insert_order(&mut self, order: &MarketOrder) -> Result<()>;

    // ============ Completion ============

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
