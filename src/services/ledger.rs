//! Ledger Service
//!
//! # Interview Q&A
//!
//! Q: 잔액 정합성(가치 보존)은 어떻게 보장하는가?
//! A: 잔액은 delta 적용으로만 바뀌고, 모든 delta는 원장 항목과 함께 커밋
//!
//!    ```text
//!    lock_balance (FOR UPDATE) → 새 값 계산 → 음수 검사 → save_balance
//!                                                       → append_ledger_entry
//!    ```
//!    - available/frozen 모두 0 미만 불가
//!    - Σ(delta_available + delta_frozen) == available + frozen
//!    - `verify_conservation`이 원장을 재생해 위 식을 검사
//!
//! Q: 판매 등록 금액은 왜 frozen으로 옮기는가?
//! A: 판매자 자금이 "사용 가능"과 "에스크로"에 이중으로 잡히지 않게
//!    - freeze(30): available -30, frozen +30, 합계 불변
//!    - 체결 시 frozen에서 소진, 취소 시 unfreeze

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::idempotency::{Admission, IdempotencyGate, RequestFingerprint, Ticket};
use crate::db::{
    Account, AccountKind, Balance, BusinessType, LedgerEntry, LedgerTotals, NewLedgerEntry, SettlementStore,
    UnitOfWork,
};
use crate::error::{Result, SettlementError};
use crate::types::{AssetCode, Page, PageRequest, TimeRange, UserId};

/// Owner id of the platform account that collects market fees.
pub const PLATFORM_OWNER_ID: UserId = 0;

/// Signed change to one balance row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceChange {
    pub available: i64,
    pub frozen: i64,
}

impl BalanceChange {
    pub fn credit(amount: i64) -> Self {
        Self { available: amount, frozen: 0 }
    }

    pub fn debit(amount: i64) -> Self {
        Self { available: -amount, frozen: 0 }
    }

    /// available → frozen
    pub fn freeze(amount: i64) -> Self {
        Self { available: -amount, frozen: amount }
    }

    /// frozen → available
    pub fn unfreeze(amount: i64) -> Self {
        Self { available: amount, frozen: -amount }
    }

    /// Spends reserved funds (e.g. delivering a sold listing).
    pub fn consume_frozen(amount: i64) -> Self {
        Self { available: 0, frozen: -amount }
    }

    pub fn net(&self) -> i64 {
        self.available + self.frozen
    }
}

/// Side-effect-free balance view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub asset_code: AssetCode,
    pub available: i64,
    pub frozen: i64,
    pub total: i64,
}

impl From<&Balance> for BalanceSnapshot {
    fn from(balance: &Balance) -> Self {
        Self {
            asset_code: balance.asset_code.clone(),
            available: balance.available,
            frozen: balance.frozen,
            total: balance.total(),
        }
    }
}

impl BalanceSnapshot {
    pub fn zero(asset_code: AssetCode) -> Self {
        Self {
            asset_code,
            available: 0,
            frozen: 0,
            total: 0,
        }
    }
}

/// Applies `change` to the (account, asset) balance inside `uow` and appends
/// the matching ledger entry. Both land or neither does.
pub async fn apply_change(
    uow: &mut dyn UnitOfWork,
    account_id: Uuid,
    asset: &AssetCode,
    change: BalanceChange,
    business_type: BusinessType,
    idempotency_key: Option<&str>,
    memo: Option<String>,
) -> Result<Balance> {
    let mut balance = uow.lock_balance(account_id, asset).await?;

    let overflow = || SettlementError::LedgerIntegrityViolation(format!("{asset} balance overflow on {account_id}"));
    let available = balance.available.checked_add(change.available).ok_or_else(overflow)?;
    let frozen = balance.frozen.checked_add(change.frozen).ok_or_else(overflow)?;

    if available < 0 {
        return Err(SettlementError::InsufficientBalance {
            asset_code: asset.to_string(),
            required: -change.available,
            available: balance.available,
        });
    }
    if frozen < 0 {
        tracing::error!(%account_id, %asset, frozen = balance.frozen, delta = change.frozen, "Frozen balance would go negative");
        return Err(SettlementError::LedgerIntegrityViolation(format!(
            "{asset} frozen balance of {account_id} would become {frozen}"
        )));
    }

    let net = change.net();
    if net > 0 {
        balance.total_earned = balance.total_earned.checked_add(net).ok_or_else(overflow)?;
    } else if net < 0 {
        balance.total_consumed = balance.total_consumed.checked_add(-net).ok_or_else(overflow)?;
    }
    balance.available = available;
    balance.frozen = frozen;
    balance.updated_at = chrono::Utc::now();
    uow.save_balance(&balance).await?;

    uow.append_ledger_entry(NewLedgerEntry {
        account_id,
        asset_code: asset.clone(),
        delta_available: change.available,
        delta_frozen: change.frozen,
        business_type,
        idempotency_key: idempotency_key.map(str::to_string),
        available_after: balance.available,
        frozen_after: balance.frozen,
        memo,
    })
    .await?;

    tracing::trace!(%account_id, %asset, ?change, %business_type, "Ledger delta applied");
    Ok(balance)
}

/// Locks several balances in account-id order so two units touching the
/// same pair of accounts never wait on each other in opposite order.
pub async fn lock_balances_in_order(uow: &mut dyn UnitOfWork, mut keys: Vec<(Uuid, AssetCode)>) -> Result<()> {
    keys.sort();
    keys.dedup();
    for (account_id, asset) in &keys {
        uow.lock_balance(*account_id, asset).await?;
    }
    Ok(())
}

fn positive(amount: i64, what: &str) -> Result<i64> {
    if amount <= 0 {
        return Err(SettlementError::Validation(format!("{what} must be positive, got {amount}")));
    }
    Ok(amount)
}

/// 원장 서비스
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn SettlementStore>,
    gate: IdempotencyGate,
}

impl Ledger {
    pub fn new(store: Arc<dyn SettlementStore>, gate: IdempotencyGate) -> Self {
        Self { store, gate }
    }

    /// Signed delta on the user's wallet, in its own atomic unit.
    pub async fn apply_delta(
        &self,
        user_id: UserId,
        asset: &AssetCode,
        delta: i64,
        business_type: BusinessType,
        idempotency_key: Option<&str>,
    ) -> Result<Balance> {
        if delta == 0 {
            return Err(SettlementError::Validation("delta must not be zero".to_string()));
        }
        self.apply_to_wallet(user_id, asset, BalanceChange::credit(delta), business_type, idempotency_key, None)
            .await
    }

    pub async fn freeze(&self, user_id: UserId, asset: &AssetCode, amount: i64) -> Result<Balance> {
        let amount = positive(amount, "freeze amount")?;
        self.apply_to_wallet(user_id, asset, BalanceChange::freeze(amount), BusinessType::ListingFreeze, None, None)
            .await
    }

    pub async fn unfreeze(&self, user_id: UserId, asset: &AssetCode, amount: i64) -> Result<Balance> {
        let amount = positive(amount, "unfreeze amount")?;
        self.apply_to_wallet(user_id, asset, BalanceChange::unfreeze(amount), BusinessType::ListingUnfreeze, None, None)
            .await
    }

    pub async fn get_or_create_account(&self, user_id: UserId) -> Result<Account> {
        let mut uow = self.store.begin().await?;
        let account = uow.get_or_create_account(user_id, AccountKind::Wallet).await?;
        uow.commit().await?;
        Ok(account)
    }

    pub async fn get_or_create_balance(&self, user_id: UserId, asset: &AssetCode) -> Result<Balance> {
        let mut uow = self.store.begin().await?;
        let account = uow.get_or_create_account(user_id, AccountKind::Wallet).await?;
        let balance = uow.lock_balance(account.id, asset).await?;
        uow.commit().await?;
        Ok(balance)
    }

    /// Zero when the user never held the asset; creates nothing.
    pub async fn get_balance(&self, user_id: UserId, asset: &AssetCode) -> Result<BalanceSnapshot> {
        self.snapshot(user_id, AccountKind::Wallet, asset).await
    }

    pub async fn platform_balance(&self, asset: &AssetCode) -> Result<BalanceSnapshot> {
        self.snapshot(PLATFORM_OWNER_ID, AccountKind::Platform, asset).await
    }

    /// Newest first.
    pub async fn transactions(
        &self,
        user_id: UserId,
        asset: &AssetCode,
        range: TimeRange,
        page: PageRequest,
    ) -> Result<Page<LedgerEntry>> {
        let Some(account) = self.store.find_account(user_id, AccountKind::Wallet).await? else {
            return Ok(Page::new(Vec::new(), page, 0));
        };
        let (entries, total) = self.store.list_ledger_entries(account.id, asset, range, page).await?;
        Ok(Page::new(entries, page, total))
    }

    /// Replays the ledger for one balance and compares it with the row.
    pub async fn verify_conservation(&self, user_id: UserId, asset: &AssetCode) -> Result<LedgerTotals> {
        let Some(account) = self.store.find_account(user_id, AccountKind::Wallet).await? else {
            return Ok(LedgerTotals::default());
        };
        self.verify_account(&account, asset).await
    }

    pub async fn verify_account(&self, account: &Account, asset: &AssetCode) -> Result<LedgerTotals> {
        let mut uow = self.store.begin().await?;
        let balance = uow.lock_balance(account.id, asset).await?;
        let totals = uow.ledger_totals(account.id, asset).await?;
        // read-only: an empty row created by the lock is discarded
        uow.rollback().await?;
        let (available, frozen) = (balance.available, balance.frozen);

        if totals.available != available || totals.frozen != frozen || available < 0 || frozen < 0 {
            tracing::error!(
                account_id = %account.id,
                %asset,
                ledger_available = totals.available,
                ledger_frozen = totals.frozen,
                available,
                frozen,
                "Ledger replay does not match balance"
            );
            return Err(SettlementError::LedgerIntegrityViolation(format!(
                "{asset} balance of account {} does not match its ledger",
                account.id
            )));
        }
        Ok(totals)
    }

    /// Operator credit/debit, deduplicated by `idempotency_key`.
    #[tracing::instrument(skip(self, reason))]
    pub async fn adjust(
        &self,
        idempotency_key: &str,
        user_id: UserId,
        asset: &AssetCode,
        delta: i64,
        reason: &str,
    ) -> Result<BalanceSnapshot> {
        if delta == 0 {
            return Err(SettlementError::Validation("adjustment must not be zero".to_string()));
        }
        if reason.trim().is_empty() {
            return Err(SettlementError::Validation("adjustment reason is required".to_string()));
        }

        let fingerprint = RequestFingerprint::new(
            "POST",
            "/ledger/adjust",
            json!({ "user_id": user_id, "asset": asset, "delta": delta, "reason": reason }),
        );
        let ticket = match self.gate.admit(idempotency_key, &fingerprint).await? {
            Admission::Acquired(ticket) => ticket,
            Admission::Completed(prior) => return Ok(serde_json::from_value(prior)?),
            Admission::InProgress => {
                return Err(SettlementError::IdempotencyInProgress(idempotency_key.to_string()))
            }
        };

        match self.settle_adjustment(&ticket, user_id, asset, delta, reason).await {
            Ok(snapshot) => {
                tracing::info!(delta, available = snapshot.available, "Balance adjusted");
                Ok(snapshot)
            }
            Err(e) => {
                self.gate.abandon(&ticket, &e).await;
                Err(e)
            }
        }
    }

    async fn settle_adjustment(
        &self,
        ticket: &Ticket,
        user_id: UserId,
        asset: &AssetCode,
        delta: i64,
        reason: &str,
    ) -> Result<BalanceSnapshot> {
        let mut uow = self.store.begin().await?;
        self.gate.hold(uow.as_mut(), ticket).await?;

        let account = uow.get_or_create_account(user_id, AccountKind::Wallet).await?;
        let balance = apply_change(
            uow.as_mut(),
            account.id,
            asset,
            BalanceChange::credit(delta),
            BusinessType::Adjustment,
            Some(&ticket.key),
            Some(reason.to_string()),
        )
        .await?;

        let snapshot = BalanceSnapshot::from(&balance);
        self.gate
            .complete_in(uow.as_mut(), ticket, &serde_json::to_value(&snapshot)?)
            .await?;
        uow.commit().await?;
        Ok(snapshot)
    }

    async fn apply_to_wallet(
        &self,
        user_id: UserId,
        asset: &AssetCode,
        change: BalanceChange,
        business_type: BusinessType,
        idempotency_key: Option<&str>,
        memo: Option<String>,
    ) -> Result<Balance> {
        let mut uow = self.store.begin().await?;
        let account = uow.get_or_create_account(user_id, AccountKind::Wallet).await?;
        let balance = apply_change(uow.as_mut(), account.id, asset, change, business_type, idempotency_key, memo).await?;
        uow.commit().await?;
        Ok(balance)
    }

    async fn snapshot(&self, owner_id: UserId, kind: AccountKind, asset: &AssetCode) -> Result<BalanceSnapshot> {
        let Some(account) = self.store.find_account(owner_id, kind).await? else {
            return Ok(BalanceSnapshot::zero(asset.clone()));
        };
        Ok(self
            .store
            .find_balance(account.id, asset)
            .await?
            .map(|b| BalanceSnapshot::from(&b))
            .unwrap_or_else(|| BalanceSnapshot::zero(asset.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use std::time::Duration;

    fn ledger() -> Ledger {
        let store: Arc<dyn SettlementStore> = Arc::new(MemoryStore::new());
        let gate = IdempotencyGate::new(store.clone(), Duration::from_secs(60));
        Ledger::new(store, gate)
    }

    fn points() -> AssetCode {
        AssetCode::points()
    }

    #[tokio::test]
    async fn test_freeze_moves_available_to_frozen() {
        let ledger = ledger();
        ledger.apply_delta(1, &points(), 100, BusinessType::Adjustment, None).await.unwrap();

        let balance = ledger.freeze(1, &points(), 30).await.unwrap();
        assert_eq!(balance.available, 70);
        assert_eq!(balance.frozen, 30);
        assert_eq!(balance.total(), 100);

        let balance = ledger.unfreeze(1, &points(), 30).await.unwrap();
        assert_eq!((balance.available, balance.frozen), (100, 0));
    }

    #[tokio::test]
    async fn test_overdraw_rejected_and_nothing_written() {
        let ledger = ledger();
        ledger.apply_delta(1, &points(), 10, BusinessType::Adjustment, None).await.unwrap();

        let err = ledger
            .apply_delta(1, &points(), -11, BusinessType::DrawCost, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::InsufficientBalance { required: 11, available: 10, .. }));

        let page = ledger
            .transactions(1, &points(), TimeRange::default(), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(ledger.get_balance(1, &points()).await.unwrap().available, 10);
    }

    #[tokio::test]
    async fn test_unfreeze_more_than_frozen_is_integrity_violation() {
        let ledger = ledger();
        ledger.apply_delta(1, &points(), 50, BusinessType::Adjustment, None).await.unwrap();
        ledger.freeze(1, &points(), 20).await.unwrap();

        let err = ledger.unfreeze(1, &points(), 21).await.unwrap_err();
        assert!(matches!(err, SettlementError::LedgerIntegrityViolation(_)));
    }

    #[tokio::test]
    async fn test_running_totals() {
        let ledger = ledger();
        ledger.apply_delta(1, &points(), 100, BusinessType::Adjustment, None).await.unwrap();
        ledger.apply_delta(1, &points(), -40, BusinessType::DrawCost, None).await.unwrap();
        let balance = ledger.freeze(1, &points(), 10).await.unwrap();

        assert_eq!(balance.total_earned, 100);
        assert_eq!(balance.total_consumed, 40);
        assert_eq!(balance.total(), 60);
    }

    #[tokio::test]
    async fn test_get_balance_has_no_side_effects() {
        let ledger = ledger();
        let snapshot = ledger.get_balance(9, &points()).await.unwrap();
        assert_eq!(snapshot, BalanceSnapshot::zero(points()));
        assert!(ledger.store.find_account(9, AccountKind::Wallet).await.unwrap().is_none());

        let created = ledger.get_or_create_balance(9, &points()).await.unwrap();
        assert_eq!(created.available, 0);
        assert!(ledger.store.find_account(9, AccountKind::Wallet).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_conservation_holds_after_mixed_deltas() {
        let ledger = ledger();
        ledger.apply_delta(1, &points(), 500, BusinessType::Adjustment, None).await.unwrap();
        ledger.apply_delta(1, &points(), -120, BusinessType::DrawCost, None).await.unwrap();
        ledger.freeze(1, &points(), 80).await.unwrap();
        ledger.unfreeze(1, &points(), 30).await.unwrap();

        let totals = ledger.verify_conservation(1, &points()).await.unwrap();
        assert_eq!(totals.available + totals.frozen, 380);
        assert_eq!(totals.entries, 4);
    }

    #[tokio::test]
    async fn test_transactions_newest_first_and_paged() {
        let ledger = ledger();
        for amount in 1..=5 {
            ledger.apply_delta(1, &points(), amount, BusinessType::Adjustment, None).await.unwrap();
        }

        let page = ledger
            .transactions(1, &points(), TimeRange::default(), PageRequest::new(0, 2))
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert!(page.has_next);
        assert_eq!(page.items.iter().map(|e| e.delta_available).collect::<Vec<_>>(), vec![5, 4]);
    }

    #[tokio::test]
    async fn test_adjust_is_deduplicated() {
        let ledger = ledger();
        let first = ledger.adjust("adj-1", 1, &points(), 250, "welcome bonus").await.unwrap();
        let replay = ledger.adjust("adj-1", 1, &points(), 250, "welcome bonus").await.unwrap();

        assert_eq!(first, replay);
        assert_eq!(ledger.get_balance(1, &points()).await.unwrap().available, 250);

        let err = ledger.adjust("adj-1", 1, &points(), 999, "welcome bonus").await.unwrap_err();
        assert!(matches!(err, SettlementError::IdempotencyKeyConflict(_)));
    }

    #[tokio::test]
    async fn test_failed_adjust_can_be_retried() {
        let ledger = ledger();
        let err = ledger.adjust("adj-2", 1, &points(), -10, "chargeback").await.unwrap_err();
        assert!(matches!(err, SettlementError::InsufficientBalance { .. }));

        ledger.apply_delta(1, &points(), 10, BusinessType::Adjustment, None).await.unwrap();
        let snapshot = ledger.adjust("adj-2", 1, &points(), -10, "chargeback").await.unwrap();
        assert_eq!(snapshot.available, 0);
    }
}
