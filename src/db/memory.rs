//! In-process store.
//!
//! Backs tests and local runs without PostgreSQL. A unit of work takes the
//! single store mutex for its whole lifetime and mutates a private copy of
//! the state; `commit` swaps the copy in, dropping the unit discards it.
//! Units are therefore fully serialized, which is strictly stronger than the
//! row-level locking the PostgreSQL backend provides.
//!
//! Listing row locks held by another session are tracked separately so
//! `lock_listing` honors `LockMode` the way `FOR UPDATE [NOWAIT]` does.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::models::*;
use super::repository::{LockMode, SettlementStore, UnitOfWork};
use crate::error::{Result, SettlementError};
use crate::types::{AssetCode, PageRequest, TimeRange, UserId};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    idempotency: HashMap<String, IdempotencyRecord>,
    accounts: HashMap<(UserId, AccountKind), Account>,
    balances: HashMap<(Uuid, AssetCode), Balance>,
    ledger: Vec<LedgerEntry>,
    next_entry_id: i64,
    streaks: HashMap<(UserId, String), DrawStreak>,
    draws: Vec<DrawRecord>,
    prize_stock: HashMap<(String, String), PrizeStock>,
    items: HashMap<Uuid, InventoryItem>,
    listings: HashMap<Uuid, Listing>,
    orders: HashMap<Uuid, MarketOrder>,
}

type RowHolds = Arc<parking_lot::Mutex<HashSet<Uuid>>>;

/// 메모리 기반 저장소
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    lock_timeout: Duration,
    listing_holds: RowHolds,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(Duration::from_secs(3))
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            lock_timeout,
            listing_holds: RowHolds::default(),
        }
    }

    /// Holds the listing row lock outside any unit, like another session
    /// sitting on `SELECT ... FOR UPDATE`. Released on drop.
    #[cfg(test)]
    pub(crate) fn hold_listing(&self, listing_id: Uuid) -> ListingHold {
        self.listing_holds.lock().insert(listing_id);
        ListingHold {
            holds: self.listing_holds.clone(),
            listing_id,
        }
    }
}

#[cfg(test)]
pub(crate) struct ListingHold {
    holds: RowHolds,
    listing_id: Uuid,
}

#[cfg(test)]
impl Drop for ListingHold {
    fn drop(&mut self) {
        self.holds.lock().remove(&self.listing_id);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn paginate<T: Clone>(rows: Vec<&T>, page: PageRequest) -> (Vec<T>, u64) {
    let total = rows.len() as u64;
    let items = rows
        .into_iter()
        .skip(page.offset() as usize)
        .take(page.limit as usize)
        .cloned()
        .collect();
    (items, total)
}

#[async_trait]
impl SettlementStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let guard = tokio::time::timeout(self.lock_timeout, self.state.clone().lock_owned())
            .await
            .map_err(|_| SettlementError::LockAcquisitionTimeout("memory store".to_string()))?;
        let working = guard.clone();
        Ok(Box::new(MemoryUnitOfWork {
            guard,
            working,
            listing_holds: self.listing_holds.clone(),
            lock_timeout: self.lock_timeout,
        }))
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    async fn find_idempotency_record(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        Ok(self.state.lock().await.idempotency.get(key).cloned())
    }

    async fn find_account(&self, owner_id: UserId, kind: AccountKind) -> Result<Option<Account>> {
        Ok(self.state.lock().await.accounts.get(&(owner_id, kind)).cloned())
    }

    async fn find_balance(&self, account_id: Uuid, asset: &AssetCode) -> Result<Option<Balance>> {
        Ok(self.state.lock().await.balances.get(&(account_id, asset.clone())).cloned())
    }

    async fn list_ledger_entries(
        &self,
        account_id: Uuid,
        asset: &AssetCode,
        range: TimeRange,
        page: PageRequest,
    ) -> Result<(Vec<LedgerEntry>, u64)> {
        let state = self.state.lock().await;
        let rows = state
            .ledger
            .iter()
            .rev()
            .filter(|e| e.account_id == account_id && &e.asset_code == asset && range.contains(e.created_at))
            .collect();
        Ok(paginate(rows, page))
    }

    async fn list_draw_records(
        &self,
        user_id: UserId,
        campaign_code: Option<&str>,
        page: PageRequest,
    ) -> Result<(Vec<DrawRecord>, u64)> {
        let state = self.state.lock().await;
        let rows = state
            .draws
            .iter()
            .rev()
            .filter(|d| d.user_id == user_id && campaign_code.map_or(true, |c| d.campaign_code == c))
            .collect();
        Ok(paginate(rows, page))
    }

    async fn find_draw_streak(&self, user_id: UserId, campaign_code: &str) -> Result<Option<DrawStreak>> {
        let state = self.state.lock().await;
        Ok(state.streaks.get(&(user_id, campaign_code.to_string())).cloned())
    }

    async fn list_items(&self, owner_id: UserId) -> Result<Vec<InventoryItem>> {
        let state = self.state.lock().await;
        let mut items: Vec<_> = state.items.values().filter(|i| i.owner_id == owner_id).cloned().collect();
        items.sort_by(|a, b| b.acquired_at.cmp(&a.acquired_at).then(a.id.cmp(&b.id)));
        Ok(items)
    }

    async fn find_listing(&self, listing_id: Uuid) -> Result<Option<Listing>> {
        Ok(self.state.lock().await.listings.get(&listing_id).cloned())
    }

    async fn find_order_for_listing(&self, listing_id: Uuid) -> Result<Option<MarketOrder>> {
        let state = self.state.lock().await;
        Ok(state.orders.values().find(|o| o.listing_id == listing_id).cloned())
    }
}

struct MemoryUnitOfWork {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    listing_holds: RowHolds,
    lock_timeout: Duration,
}

impl MemoryUnitOfWork {
    fn listing_held(&self, listing_id: Uuid) -> bool {
        self.listing_holds.lock().contains(&listing_id)
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn insert_idempotency_record(&mut self, record: &IdempotencyRecord) -> Result<bool> {
        if self.working.idempotency.contains_key(&record.key) {
            return Ok(false);
        }
        self.working.idempotency.insert(record.key.clone(), record.clone());
        Ok(true)
    }

    async fn lock_idempotency_record(&mut self, key: &str) -> Result<Option<IdempotencyRecord>> {
        Ok(self.working.idempotency.get(key).cloned())
    }

    async fn save_idempotency_record(&mut self, record: &IdempotencyRecord) -> Result<()> {
        self.working.idempotency.insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn expire_idempotency_records(&mut self, now: DateTime<Utc>) -> Result<u64> {
        let mut expired = 0;
        for record in self.working.idempotency.values_mut().filter(|r| r.is_stale(now)) {
            record.state = IdempotencyState::Failed;
            record.error_code = Some("EXPIRED".to_string());
            record.error_message = Some("pending record expired".to_string());
            record.updated_at = now;
            expired += 1;
        }
        Ok(expired)
    }

    async fn get_or_create_account(&mut self, owner_id: UserId, kind: AccountKind) -> Result<Account> {
        let account = self.working.accounts.entry((owner_id, kind)).or_insert_with(|| Account {
            id: Uuid::new_v4(),
            owner_id,
            kind,
            created_at: Utc::now(),
        });
        Ok(account.clone())
    }

    async fn lock_balance(&mut self, account_id: Uuid, asset: &AssetCode) -> Result<Balance> {
        let balance = self
            .working
            .balances
            .entry((account_id, asset.clone()))
            .or_insert_with(|| Balance::empty(account_id, asset.clone()));
        Ok(balance.clone())
    }

    async fn save_balance(&mut self, balance: &Balance) -> Result<()> {
        self.working
            .balances
            .insert((balance.account_id, balance.asset_code.clone()), balance.clone());
        Ok(())
    }

    async fn append_ledger_entry(&mut self, entry: NewLedgerEntry) -> Result<LedgerEntry> {
        self.working.next_entry_id += 1;
        let stored = LedgerEntry {
            id: self.working.next_entry_id,
            account_id: entry.account_id,
            asset_code: entry.asset_code,
            delta_available: entry.delta_available,
            delta_frozen: entry.delta_frozen,
            business_type: entry.business_type,
            idempotency_key: entry.idempotency_key,
            available_after: entry.available_after,
            frozen_after: entry.frozen_after,
            memo: entry.memo,
            created_at: Utc::now(),
        };
        self.working.ledger.push(stored.clone());
        Ok(stored)
    }

    async fn ledger_totals(&mut self, account_id: Uuid, asset: &AssetCode) -> Result<LedgerTotals> {
        Ok(self
            .working
            .ledger
            .iter()
            .filter(|e| e.account_id == account_id && &e.asset_code == asset)
            .fold(LedgerTotals::default(), |acc, e| LedgerTotals {
                available: acc.available + e.delta_available,
                frozen: acc.frozen + e.delta_frozen,
                entries: acc.entries + 1,
            }))
    }

    async fn lock_draw_streak(&mut self, user_id: UserId, campaign_code: &str) -> Result<DrawStreak> {
        let streak = self
            .working
            .streaks
            .entry((user_id, campaign_code.to_string()))
            .or_insert_with(|| DrawStreak {
                user_id,
                campaign_code: campaign_code.to_string(),
                streak: 0,
                total_draws: 0,
                updated_at: Utc::now(),
            });
        Ok(streak.clone())
    }

    async fn save_draw_streak(&mut self, streak: &DrawStreak) -> Result<()> {
        self.working
            .streaks
            .insert((streak.user_id, streak.campaign_code.clone()), streak.clone());
        Ok(())
    }

    async fn insert_draw_record(&mut self, record: &DrawRecord) -> Result<()> {
        self.working.draws.push(record.clone());
        Ok(())
    }

    async fn lock_prize_stock(
        &mut self,
        campaign_code: &str,
        prize_code: &str,
        initial: Option<i64>,
    ) -> Result<PrizeStock> {
        let stock = self
            .working
            .prize_stock
            .entry((campaign_code.to_string(), prize_code.to_string()))
            .or_insert_with(|| PrizeStock {
                campaign_code: campaign_code.to_string(),
                prize_code: prize_code.to_string(),
                remaining: initial,
                updated_at: Utc::now(),
            });
        Ok(stock.clone())
    }

    async fn save_prize_stock(&mut self, stock: &PrizeStock) -> Result<()> {
        self.working.prize_stock.insert(
            (stock.campaign_code.clone(), stock.prize_code.clone()),
            stock.clone(),
        );
        Ok(())
    }

    async fn insert_item(&mut self, item: &InventoryItem) -> Result<()> {
        self.working.items.insert(item.id, item.clone());
        Ok(())
    }

    async fn lock_item(&mut self, item_id: Uuid) -> Result<Option<InventoryItem>> {
        Ok(self.working.items.get(&item_id).cloned())
    }

    async fn save_item(&mut self, item: &InventoryItem) -> Result<()> {
        self.working.items.insert(item.id, item.clone());
        Ok(())
    }

    async fn insert_listing(&mut self, listing: &Listing) -> Result<()> {
        self.working.listings.insert(listing.id, listing.clone());
        Ok(())
    }

    async fn lock_listing(&mut self, listing_id: Uuid, mode: LockMode) -> Result<Option<Listing>> {
        let deadline = tokio::time::Instant::now() + self.lock_timeout;
        while self.listing_held(listing_id) {
            if mode == LockMode::NoWait || tokio::time::Instant::now() >= deadline {
                return Err(SettlementError::LockAcquisitionTimeout(format!("listing {listing_id}")));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(self.working.listings.get(&listing_id).cloned())
    }

    async fn save_listing(&mut self, listing: &Listing) -> Result<()> {
        self.working.listings.insert(listing.id, listing.clone());
        Ok(())
    }

    async fn insert_order(&mut self, order: &MarketOrder) -> Result<()> {
        self.working.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryUnitOfWork { mut guard, working, .. } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commit_publishes_and_drop_discards() {
        let store = MemoryStore::new();
        let asset = AssetCode::points();

        let mut uow = store.begin().await.unwrap();
        let account = uow.get_or_create_account(7, AccountKind::Wallet).await.unwrap();
        let mut balance = uow.lock_balance(account.id, &asset).await.unwrap();
        balance.available = 50;
        uow.save_balance(&balance).await.unwrap();
        uow.commit().await.unwrap();

        let mut uow = store.begin().await.unwrap();
        let mut balance = uow.lock_balance(account.id, &asset).await.unwrap();
        balance.available = 0;
        uow.save_balance(&balance).await.unwrap();
        drop(uow);

        let stored = store.find_balance(account.id, &asset).await.unwrap().unwrap();
        assert_eq!(stored.available, 50);
    }

    #[tokio::test]
    async fn test_listing_hold_respects_lock_mode() {
        let store = MemoryStore::with_lock_timeout(Duration::from_millis(40));
        let listing_id = Uuid::new_v4();
        let hold = store.hold_listing(listing_id);

        let mut uow = store.begin().await.unwrap();
        let err = uow.lock_listing(listing_id, LockMode::NoWait).await.err().unwrap();
        assert!(matches!(err, SettlementError::LockAcquisitionTimeout(_)));
        let err = uow.lock_listing(listing_id, LockMode::Wait).await.err().unwrap();
        assert!(matches!(err, SettlementError::LockAcquisitionTimeout(_)));

        drop(hold);
        assert!(uow.lock_listing(listing_id, LockMode::NoWait).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_begin_times_out_while_unit_open() {
        let store = MemoryStore::with_lock_timeout(Duration::from_millis(20));
        let _held = store.begin().await.unwrap();

        let err = store.begin().await.err().unwrap();
        assert!(matches!(err, SettlementError::LockAcquisitionTimeout(_)));
    }
}
