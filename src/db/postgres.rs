//! PostgreSQL backend.
//!
//! Every [`UnitOfWork`] is one `sqlx::Transaction`. Row locks come from
//! `SELECT ... FOR UPDATE`, get-or-create from `INSERT ... ON CONFLICT DO
//! NOTHING` followed by the locking select, and `SET LOCAL lock_timeout`
//! bounds every wait so a contended row surfaces as
//! `LockAcquisitionTimeout` instead of an unbounded queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Postgres, Transaction};
use uuid::Uuid;

use super::models::*;
use super::repository::{LockMode, SettlementStore, UnitOfWork};
use super::Database;
use crate::error::{Result, SettlementError};
use crate::types::{AssetCode, PageRequest, TimeRange, UserId};

// ============ Row Types ============

#[derive(Debug, FromRow)]
struct AccountRow {
    id: Uuid,
    owner_id: i64,
    kind: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<AccountRow> for Account {
    type Error = SettlementError;

    fn try_from(row: AccountRow) -> Result<Self> {
        Ok(Account {
            id: row.id,
            owner_id: row.owner_id,
            kind: row.kind.parse()?,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct BalanceRow {
    account_id: Uuid,
    asset_code: String,
    available: i64,
    frozen: i64,
    total_earned: i64,
    total_consumed: i64,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BalanceRow> for Balance {
    type Error = SettlementError;

    fn try_from(row: BalanceRow) -> Result<Self> {
        Ok(Balance {
            account_id: row.account_id,
            asset_code: AssetCode::new(&row.asset_code)?,
            available: row.available,
            frozen: row.frozen,
            total_earned: row.total_earned,
            total_consumed: row.total_consumed,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct LedgerEntryRow {
    id: i64,
    account_id: Uuid,
    asset_code: String,
    delta_available: i64,
    delta_frozen: i64,
    business_type: String,
    idempotency_key: Option<String>,
    available_after: i64,
    frozen_after: i64,
    memo: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<LedgerEntryRow> for LedgerEntry {
    type Error = SettlementError;

    fn try_from(row: LedgerEntryRow) -> Result<Self> {
        Ok(LedgerEntry {
            id: row.id,
            account_id: row.account_id,
            asset_code: AssetCode::new(&row.asset_code)?,
            delta_available: row.delta_available,
            delta_frozen: row.delta_frozen,
            business_type: row.business_type.parse()?,
            idempotency_key: row.idempotency_key,
            available_after: row.available_after,
            frozen_after: row.frozen_after,
            memo: row.memo,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct IdempotencyRow {
    key: String,
    state: String,
    fingerprint: String,
    result: Option<serde_json::Value>,
    error_code: Option<String>,
    error_message: Option<String>,
    owner: Uuid,
    attempts: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<IdempotencyRow> for IdempotencyRecord {
    type Error = SettlementError;

    fn try_from(row: IdempotencyRow) -> Result<Self> {
        Ok(IdempotencyRecord {
            key: row.key,
            state: row.state.parse()?,
            fingerprint: row.fingerprint,
            result: row.result,
            error_code: row.error_code,
            error_message: row.error_message,
            owner: row.owner,
            attempts: row.attempts,
            created_at: row.created_at,
            updated_at: row.updated_at,
            expires_at: row.expires_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct DrawStreakRow {
    user_id: i64,
    campaign_code: String,
    streak: i32,
    total_draws: i64,
    updated_at: DateTime<Utc>,
}

impl From<DrawStreakRow> for DrawStreak {
    fn from(row: DrawStreakRow) -> Self {
        DrawStreak {
            user_id: row.user_id,
            campaign_code: row.campaign_code,
            streak: row.streak,
            total_draws: row.total_draws,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct DrawRecordRow {
    id: Uuid,
    user_id: i64,
    campaign_code: String,
    idempotency_key: String,
    cost_asset: String,
    cost_amount: i64,
    tier: String,
    prize_code: String,
    streak_before: i32,
    hard_pity_triggered: bool,
    degraded_from: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<DrawRecordRow> for DrawRecord {
    type Error = SettlementError;

    fn try_from(row: DrawRecordRow) -> Result<Self> {
        Ok(DrawRecord {
            id: row.id,
            user_id: row.user_id,
            campaign_code: row.campaign_code,
            idempotency_key: row.idempotency_key,
            cost_asset: AssetCode::new(&row.cost_asset)?,
            cost_amount: row.cost_amount,
            tier: row.tier.parse()?,
            prize_code: row.prize_code,
            streak_before: row.streak_before,
            hard_pity_triggered: row.hard_pity_triggered,
            degraded_from: row.degraded_from.map(|t| t.parse()).transpose()?,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct PrizeStockRow {
    campaign_code: String,
    prize_code: String,
    remaining: Option<i64>,
    updated_at: DateTime<Utc>,
}

impl From<PrizeStockRow> for PrizeStock {
    fn from(row: PrizeStockRow) -> Self {
        PrizeStock {
            campaign_code: row.campaign_code,
            prize_code: row.prize_code,
            remaining: row.remaining,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct ItemRow {
    id: Uuid,
    owner_id: i64,
    item_code: String,
    status: String,
    source: String,
    acquired_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ItemRow> for InventoryItem {
    type Error = SettlementError;

    fn try_from(row: ItemRow) -> Result<Self> {
        Ok(InventoryItem {
            id: row.id,
            owner_id: row.owner_id,
            item_code: row.item_code,
            status: row.status.parse()?,
            source: row.source,
            acquired_at: row.acquired_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ListingRow {
    id: Uuid,
    seller_id: i64,
    item_id: Option<Uuid>,
    offer_asset: Option<String>,
    offer_amount: Option<i64>,
    price_asset: String,
    price_amount: i64,
    status: String,
    buyer_id: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ListingRow> for Listing {
    type Error = SettlementError;

    fn try_from(row: ListingRow) -> Result<Self> {
        let offer = match (row.item_id, row.offer_asset, row.offer_amount) {
            (Some(item_id), None, None) => ListingOffer::Item { item_id },
            (None, Some(asset), Some(amount)) => ListingOffer::Fungible {
                asset_code: AssetCode::new(&asset)?,
                amount,
            },
            _ => {
                return Err(SettlementError::Database(format!(
                    "listing {} has an inconsistent offer",
                    row.id
                )))
            }
        };
        Ok(Listing {
            id: row.id,
            seller_id: row.seller_id,
            offer,
            price_asset: AssetCode::new(&row.price_asset)?,
            price_amount: row.price_amount,
            status: row.status.parse()?,
            buyer_id: row.buyer_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct OrderRow {
    id: Uuid,
    listing_id: Uuid,
    buyer_id: i64,
    seller_id: i64,
    price_asset: String,
    price_amount: i64,
    fee_amount: i64,
    idempotency_key: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for MarketOrder {
    type Error = SettlementError;

    fn try_from(row: OrderRow) -> Result<Self> {
        Ok(MarketOrder {
            id: row.id,
            listing_id: row.listing_id,
            buyer_id: row.buyer_id,
            seller_id: row.seller_id,
            price_asset: AssetCode::new(&row.price_asset)?,
            price_amount: row.price_amount,
            fee_amount: row.fee_amount,
            idempotency_key: row.idempotency_key,
            created_at: row.created_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = SettlementError>,
{
    rows.into_iter().map(T::try_from).collect()
}

const LISTING_COLUMNS: &str = "id, seller_id, item_id, offer_asset, offer_amount, price_asset, \
     price_amount, status, buyer_id, created_at, updated_at";

// ============ Shared Handle ============

#[async_trait]
impl SettlementStore for Database {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let mut tx = self.pool.begin().await?;
        // SET은 파라미터 바인딩 불가 - 정수 값만 포맷
        sqlx::query(&format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn find_idempotency_record(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        sqlx::query_as::<_, IdempotencyRow>("SELECT * FROM idempotency_records WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?
            .map(IdempotencyRecord::try_from)
            .transpose()
    }

    async fn find_account(&self, owner_id: UserId, kind: AccountKind) -> Result<Option<Account>> {
        sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts WHERE owner_id = $1 AND kind = $2")
            .bind(owner_id)
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(Account::try_from)
            .transpose()
    }

    async fn find_balance(&self, account_id: Uuid, asset: &AssetCode) -> Result<Option<Balance>> {
        sqlx::query_as::<_, BalanceRow>(
            "SELECT * FROM balances WHERE account_id = $1 AND asset_code = $2",
        )
        .bind(account_id)
        .bind(asset.as_str())
        .fetch_optional(&self.pool)
        .await?
        .map(Balance::try_from)
        .transpose()
    }

    async fn list_ledger_entries(
        &self,
        account_id: Uuid,
        asset: &AssetCode,
        range: TimeRange,
        page: PageRequest,
    ) -> Result<(Vec<LedgerEntry>, u64)> {
        let rows = sqlx::query_as::<_, LedgerEntryRow>(
            r#"
            SELECT *
            FROM ledger_entries
            WHERE account_id = $1
              AND asset_code = $2
              AND ($3::timestamptz IS NULL OR created_at >= $3)
              AND ($4::timestamptz IS NULL OR created_at < $4)
            ORDER BY id DESC
            LIMIT $5 OFFSET $6
            "#,
        )
        .bind(account_id)
        .bind(asset.as_str())
        .bind(range.from)
        .bind(range.to)
        .bind(i64::from(page.limit))
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await?;

        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM ledger_entries
            WHERE account_id = $1
              AND asset_code = $2
              AND ($3::timestamptz IS NULL OR created_at >= $3)
              AND ($4::timestamptz IS NULL OR created_at < $4)
            "#,
        )
        .bind(account_id)
        .bind(asset.as_str())
        .bind(range.from)
        .bind(range.to)
        .fetch_one(&self.pool)
        .await?;

        Ok((convert_all(rows)?, count.0 as u64))
    }

    async fn list_draw_records(
        &self,
        user_id: UserId,
        campaign_code: Option<&str>,
        page: PageRequest,
    ) -> Result<(Vec<DrawRecord>, u64)> {
        let rows = sqlx::query_as::<_, DrawRecordRow>(
            r#"
            SELECT *
            FROM draw_records
            WHERE user_id = $1 AND ($2::text IS NULL OR campaign_code = $2)
            ORDER BY created_at DESC, id
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(user_id)
        .bind(campaign_code)
        .bind(i64::from(page.limit))
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await?;

        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM draw_records WHERE user_id = $1 AND ($2::text IS NULL OR campaign_code = $2)",
        )
        .bind(user_id)
        .bind(campaign_code)
        .fetch_one(&self.pool)
        .await?;

        Ok((convert_all(rows)?, count.0 as u64))
    }

    async fn find_draw_streak(&self, user_id: UserId, campaign_code: &str) -> Result<Option<DrawStreak>> {
        let row = sqlx::query_as::<_, DrawStreakRow>(
            "SELECT * FROM draw_streaks WHERE user_id = $1 AND campaign_code = $2",
        )
        .bind(user_id)
        .bind(campaign_code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(DrawStreak::from))
    }

    async fn list_items(&self, owner_id: UserId) -> Result<Vec<InventoryItem>> {
        let rows = sqlx::query_as::<_, ItemRow>(
            "SELECT * FROM inventory_items WHERE owner_id = $1 ORDER BY acquired_at DESC, id",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn find_listing(&self, listing_id: Uuid) -> Result<Option<Listing>> {
        sqlx::query_as::<_, ListingRow>(&format!("SELECT {LISTING_COLUMNS} FROM listings WHERE id = $1"))
            .bind(listing_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Listing::try_from)
            .transpose()
    }

    async fn find_order_for_listing(&self, listing_id: Uuid) -> Result<Option<MarketOrder>> {
        sqlx::query_as::<_, OrderRow>("SELECT * FROM market_orders WHERE listing_id = $1")
            .bind(listing_id)
            .fetch_optional(&self.pool)
            .await?
            .map(MarketOrder::try_from)
            .transpose()
    }
}

// ============ Unit of Work ============

struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn insert_idempotency_record(&mut self, record: &IdempotencyRecord) -> Result<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_records (
                key, state, fingerprint, result, error_code, error_message,
                owner, attempts, created_at, updated_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(&record.key)
        .bind(record.state.as_str())
        .bind(&record.fingerprint)
        .bind(&record.result)
        .bind(&record.error_code)
        .bind(&record.error_message)
        .bind(record.owner)
        .bind(record.attempts)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.expires_at)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();

        Ok(inserted == 1)
    }

    async fn lock_idempotency_record(&mut self, key: &str) -> Result<Option<IdempotencyRecord>> {
        sqlx::query_as::<_, IdempotencyRow>(
            "SELECT * FROM idempotency_records WHERE key = $1 FOR UPDATE",
        )
        .bind(key)
        .fetch_optional(&mut *self.tx)
        .await?
        .map(IdempotencyRecord::try_from)
        .transpose()
    }

    async fn save_idempotency_record(&mut self, record: &IdempotencyRecord) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE idempotency_records
            SET state = $2, result = $3, error_code = $4, error_message = $5,
                owner = $6, attempts = $7, updated_at = $8, expires_at = $9
            WHERE key = $1
            "#,
        )
        .bind(&record.key)
        .bind(record.state.as_str())
        .bind(&record.result)
        .bind(&record.error_code)
        .bind(&record.error_message)
        .bind(record.owner)
        .bind(record.attempts)
        .bind(record.updated_at)
        .bind(record.expires_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn expire_idempotency_records(&mut self, now: DateTime<Utc>) -> Result<u64> {
        let expired = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET state = 'failed', error_code = 'EXPIRED',
                error_message = 'pending record expired', updated_at = $1
            WHERE state = 'pending' AND expires_at <= $1
            "#,
        )
        .bind(now)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();
        Ok(expired)
    }

    async fn get_or_create_account(&mut self, owner_id: UserId, kind: AccountKind) -> Result<Account> {
        sqlx::query(
            r#"
            INSERT INTO accounts (id, owner_id, kind, created_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (owner_id, kind) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(owner_id)
        .bind(kind.as_str())
        .execute(&mut *self.tx)
        .await?;

        sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts WHERE owner_id = $1 AND kind = $2")
            .bind(owner_id)
            .bind(kind.as_str())
            .fetch_one(&mut *self.tx)
            .await?
            .try_into()
    }

    async fn lock_balance(&mut self, account_id: Uuid, asset: &AssetCode) -> Result<Balance> {
        sqlx::query(
            r#"
            INSERT INTO balances (account_id, asset_code)
            VALUES ($1, $2)
            ON CONFLICT (account_id, asset_code) DO NOTHING
            "#,
        )
        .bind(account_id)
        .bind(asset.as_str())
        .execute(&mut *self.tx)
        .await?;

        sqlx::query_as::<_, BalanceRow>(
            "SELECT * FROM balances WHERE account_id = $1 AND asset_code = $2 FOR UPDATE",
        )
        .bind(account_id)
        .bind(asset.as_str())
        .fetch_one(&mut *self.tx)
        .await?
        .try_into()
    }

    async fn save_balance(&mut self, balance: &Balance) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE balances
            SET available = $3, frozen = $4, total_earned = $5, total_consumed = $6, updated_at = $7
            WHERE account_id = $1 AND asset_code = $2
            "#,
        )
        .bind(balance.account_id)
        .bind(balance.asset_code.as_str())
        .bind(balance.available)
        .bind(balance.frozen)
        .bind(balance.total_earned)
        .bind(balance.total_consumed)
        .bind(balance.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn append_ledger_entry(&mut self, entry: NewLedgerEntry) -> Result<LedgerEntry> {
        sqlx::query_as::<_, LedgerEntryRow>(
            r#"
            INSERT INTO ledger_entries (
                account_id, asset_code, delta_available, delta_frozen, business_type,
                idempotency_key, available_after, frozen_after, memo, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            RETURNING *
            "#,
        )
        .bind(entry.account_id)
        .bind(entry.asset_code.as_str())
        .bind(entry.delta_available)
        .bind(entry.delta_frozen)
        .bind(entry.business_type.as_str())
        .bind(&entry.idempotency_key)
        .bind(entry.available_after)
        .bind(entry.frozen_after)
        .bind(&entry.memo)
        .fetch_one(&mut *self.tx)
        .await?
        .try_into()
    }

    async fn ledger_totals(&mut self, account_id: Uuid, asset: &AssetCode) -> Result<LedgerTotals> {
        let (available, frozen, entries): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(delta_available), 0)::BIGINT,
                COALESCE(SUM(delta_frozen), 0)::BIGINT,
                COUNT(*)
            FROM ledger_entries
            WHERE account_id = $1 AND asset_code = $2
            "#,
        )
        .bind(account_id)
        .bind(asset.as_str())
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(LedgerTotals { available, frozen, entries })
    }

    async fn lock_draw_streak(&mut self, user_id: UserId, campaign_code: &str) -> Result<DrawStreak> {
        sqlx::query(
            r#"
            INSERT INTO draw_streaks (user_id, campaign_code)
            VALUES ($1, $2)
            ON CONFLICT (user_id, campaign_code) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(campaign_code)
        .execute(&mut *self.tx)
        .await?;

        let row = sqlx::query_as::<_, DrawStreakRow>(
            "SELECT * FROM draw_streaks WHERE user_id = $1 AND campaign_code = $2 FOR UPDATE",
        )
        .bind(user_id)
        .bind(campaign_code)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row.into())
    }

    async fn save_draw_streak(&mut self, streak: &DrawStreak) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE draw_streaks
            SET streak = $3, total_draws = $4, updated_at = $5
            WHERE user_id = $1 AND campaign_code = $2
            "#,
        )
        .bind(streak.user_id)
        .bind(&streak.campaign_code)
        .bind(streak.streak)
        .bind(streak.total_draws)
        .bind(streak.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_draw_record(&mut self, record: &DrawRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO draw_records (
                id, user_id, campaign_code, idempotency_key, cost_asset, cost_amount,
                tier, prize_code, streak_before, hard_pity_triggered, degraded_from, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(&record.campaign_code)
        .bind(&record.idempotency_key)
        .bind(record.cost_asset.as_str())
        .bind(record.cost_amount)
        .bind(record.tier.as_str())
        .bind(&record.prize_code)
        .bind(record.streak_before)
        .bind(record.hard_pity_triggered)
        .bind(record.degraded_from.map(|t| t.as_str()))
        .bind(record.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn lock_prize_stock(
        &mut self,
        campaign_code: &str,
        prize_code: &str,
        initial: Option<i64>,
    ) -> Result<PrizeStock> {
        sqlx::query(
            r#"
            INSERT INTO prize_stock (campaign_code, prize_code, remaining)
            VALUES ($1, $2, $3)
            ON CONFLICT (campaign_code, prize_code) DO NOTHING
            "#,
        )
        .bind(campaign_code)
        .bind(prize_code)
        .bind(initial)
        .execute(&mut *self.tx)
        .await?;

        let row = sqlx::query_as::<_, PrizeStockRow>(
            "SELECT * FROM prize_stock WHERE campaign_code = $1 AND prize_code = $2 FOR UPDATE",
        )
        .bind(campaign_code)
        .bind(prize_code)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row.into())
    }

    async fn save_prize_stock(&mut self, stock: &PrizeStock) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE prize_stock SET remaining = $3, updated_at = $4
            WHERE campaign_code = $1 AND prize_code = $2
            "#,
        )
        .bind(&stock.campaign_code)
        .bind(&stock.prize_code)
        .bind(stock.remaining)
        .bind(stock.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_item(&mut self, item: &InventoryItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO inventory_items (id, owner_id, item_code, status, source, acquired_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(item.id)
        .bind(item.owner_id)
        .bind(&item.item_code)
        .bind(item.status.as_str())
        .bind(&item.source)
        .bind(item.acquired_at)
        .bind(item.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn lock_item(&mut self, item_id: Uuid) -> Result<Option<InventoryItem>> {
        sqlx::query_as::<_, ItemRow>("SELECT * FROM inventory_items WHERE id = $1 FOR UPDATE")
            .bind(item_id)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(InventoryItem::try_from)
            .transpose()
    }

    async fn save_item(&mut self, item: &InventoryItem) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE inventory_items
            SET owner_id = $2, status = $3, source = $4, acquired_at = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(item.id)
        .bind(item.owner_id)
        .bind(item.status.as_str())
        .bind(&item.source)
        .bind(item.acquired_at)
        .bind(item.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_listing(&mut self, listing: &Listing) -> Result<()> {
        let (item_id, offer_asset, offer_amount) = match &listing.offer {
            ListingOffer::Item { item_id } => (Some(*item_id), None, None),
            ListingOffer::Fungible { asset_code, amount } => (None, Some(asset_code.as_str()), Some(*amount)),
        };
        sqlx::query(&format!(
            "INSERT INTO listings ({LISTING_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ))
        .bind(listing.id)
        .bind(listing.seller_id)
        .bind(item_id)
        .bind(offer_asset)
        .bind(offer_amount)
        .bind(listing.price_asset.as_str())
        .bind(listing.price_amount)
        .bind(listing.status.as_str())
        .bind(listing.buyer_id)
        .bind(listing.created_at)
        .bind(listing.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn lock_listing(&mut self, listing_id: Uuid, mode: LockMode) -> Result<Option<Listing>> {
        let suffix = match mode {
            LockMode::Wait => "FOR UPDATE",
            LockMode::NoWait => "FOR UPDATE NOWAIT",
        };
        sqlx::query_as::<_, ListingRow>(&format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE id = $1 {suffix}"
        ))
        .bind(listing_id)
        .fetch_optional(&mut *self.tx)
        .await?
        .map(Listing::try_from)
        .transpose()
    }

    async fn save_listing(&mut self, listing: &Listing) -> Result<()> {
        sqlx::query("UPDATE listings SET status = $2, buyer_id = $3, updated_at = $4 WHERE id = $1")
            .bind(listing.id)
            .bind(listing.status.as_str())
            .bind(listing.buyer_id)
            .bind(listing.updated_at)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn insert_order(&mut self, order: &MarketOrder) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO market_orders (
                id, listing_id, buyer_id, seller_id, price_asset, price_amount,
                fee_amount, idempotency_key, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(order.id)
        .bind(order.listing_id)
        .bind(order.buyer_id)
        .bind(order.seller_id)
        .bind(order.price_asset.as_str())
        .bind(order.price_amount)
        .bind(order.fee_amount)
        .bind(&order.idempotency_key)
        .bind(order.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
