//! Market Settlement
//!
//! # Interview Q&A
//!
//! Q: 한 판매 등록에 구매 요청이 동시에 몰리면 어떻게 초과 판매를 막는가?
//! A: 멱등성 키가 아니라 listing 행 자체가 상호 배제 지점
//!
//!    ```text
//!    buyer A ─┐                       ┌─ on_sale → locked → sold  (승자)
//!    buyer B ─┼─ SELECT ... FOR UPDATE┤
//!    buyer C ─┘                       └─ status != on_sale → ListingUnavailable
//!    ```
//!    - 낙관적 재시도 대신 잠금: 빠르고 결정적인 패자
//!    - `LISTING_LOCK_MODE=nowait`이면 잠금 대기 없이 즉시 LockAcquisitionTimeout
//!
//! Q: 결제 도중 실패하면 listing이 locked로 남지 않는가?
//! A: 상태 전이, 차감, 지급, 소유권 이전, sold 전이가 하나의 유닛
//!    - 실패 시 유닛 롤백 → listing은 on_sale 그대로
//!
//! Q: 수수료는 어디로 가는가?
//! A: 플랫폼 계정으로 입금 → 구매자 차감액 = 판매자 입금액 + 수수료 (가치 보존)

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::idempotency::{Admission, IdempotencyGate, RequestFingerprint, Ticket};
use super::inventory::lock_owned_item;
use super::ledger::{apply_change, lock_balances_in_order, BalanceChange, PLATFORM_OWNER_ID};
use crate::db::{
    AccountKind, BusinessType, ItemStatus, Listing, ListingOffer, ListingStatus, LockMode, MarketOrder,
    SettlementStore, UnitOfWork,
};
use crate::error::{Result, SettlementError};
use crate::types::{AssetCode, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewListing {
    pub seller_id: UserId,
    pub offer: ListingOffer,
    pub price_asset: AssetCode,
    pub price_amount: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseRequest {
    pub idempotency_key: String,
    pub listing_id: Uuid,
    pub buyer_id: UserId,
}

/// Settlement summary, also stored as the idempotency result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseReceipt {
    pub order_id: Uuid,
    pub listing_id: Uuid,
    pub status: ListingStatus,
    pub buyer_id: UserId,
    pub seller_id: UserId,
    pub offer: ListingOffer,
    pub price_asset: AssetCode,
    pub price_amount: i64,
    pub fee_amount: i64,
    pub settled_at: DateTime<Utc>,
}

/// 마켓 서비스
#[derive(Clone)]
pub struct MarketService {
    store: Arc<dyn SettlementStore>,
    gate: IdempotencyGate,
    fee_bps: u32,
    lock_mode: LockMode,
}

impl MarketService {
    pub fn new(store: Arc<dyn SettlementStore>, gate: IdempotencyGate, fee_bps: u32, lock_mode: LockMode) -> Self {
        Self {
            store,
            gate,
            fee_bps: fee_bps.min(10_000),
            lock_mode,
        }
    }

    /// Fee charged on `price`, rounded down.
    pub fn fee_for(&self, price: i64) -> i64 {
        (i128::from(price) * i128::from(self.fee_bps) / 10_000) as i64
    }

    /// Escrows the offer (item → `listed`, fungible amount → frozen) and
    /// opens the listing `on_sale`.
    #[tracing::instrument(skip(self, listing), fields(seller_id = listing.seller_id))]
    pub async fn create_listing(&self, listing: NewListing) -> Result<Listing> {
        if listing.price_amount <= 0 {
            return Err(SettlementError::Validation("price must be positive".to_string()));
        }

        let id = Uuid::new_v4();
        let mut uow = self.store.begin().await?;

        match &listing.offer {
            ListingOffer::Item { item_id } => {
                let mut item = lock_owned_item(uow.as_mut(), listing.seller_id, *item_id).await?;
                item.status = ItemStatus::Listed;
                item.updated_at = Utc::now();
                uow.save_item(&item).await?;
            }
            ListingOffer::Fungible { asset_code, amount } => {
                if *amount <= 0 {
                    return Err(SettlementError::Validation("offered amount must be positive".to_string()));
                }
                let account = uow.get_or_create_account(listing.seller_id, AccountKind::Wallet).await?;
                apply_change(
                    uow.as_mut(),
                    account.id,
                    asset_code,
                    BalanceChange::freeze(*amount),
                    BusinessType::ListingFreeze,
                    None,
                    Some(format!("listing {id}")),
                )
                .await?;
            }
        }

        let now = Utc::now();
        let created = Listing {
            id,
            seller_id: listing.seller_id,
            offer: listing.offer,
            price_asset: listing.price_asset,
            price_amount: listing.price_amount,
            status: ListingStatus::OnSale,
            buyer_id: None,
            created_at: now,
            updated_at: now,
        };
        uow.insert_listing(&created).await?;
        uow.commit().await?;

        tracing::info!(listing_id = %created.id, price = created.price_amount, "Listing created");
        Ok(created)
    }

    /// `on_sale → withdrawn`; releases the escrowed offer.
    #[tracing::instrument(skip(self))]
    pub async fn withdraw_listing(&self, seller_id: UserId, listing_id: Uuid) -> Result<Listing> {
        let mut uow = self.store.begin().await?;
        let mut listing = self.lock_listing(uow.as_mut(), listing_id).await?;
        if listing.seller_id != seller_id {
            return Err(SettlementError::NotFound(format!("listing {listing_id}")));
        }
        ensure_on_sale(&listing)?;

        listing.transition(ListingStatus::Withdrawn)?;
        match &listing.offer {
            ListingOffer::Item { item_id } => {
                let mut item = uow
                    .lock_item(*item_id)
                    .await?
                    .ok_or_else(|| escrow_missing(&listing))?;
                item.status = ItemStatus::Available;
                item.updated_at = Utc::now();
                uow.save_item(&item).await?;
            }
            ListingOffer::Fungible { asset_code, amount } => {
                let account = uow.get_or_create_account(seller_id, AccountKind::Wallet).await?;
                apply_change(
                    uow.as_mut(),
                    account.id,
                    asset_code,
                    BalanceChange::unfreeze(*amount),
                    BusinessType::ListingUnfreeze,
                    None,
                    Some(format!("listing {listing_id}")),
                )
                .await?;
            }
        }
        uow.save_listing(&listing).await?;
        uow.commit().await?;

        tracing::info!("Listing withdrawn");
        Ok(listing)
    }

    #[tracing::instrument(
        skip(self, request),
        fields(key = %request.idempotency_key, listing_id = %request.listing_id, buyer_id = request.buyer_id)
    )]
    pub async fn purchase(&self, request: PurchaseRequest) -> Result<PurchaseReceipt> {
        let fingerprint = RequestFingerprint::new(
            "POST",
            "/market/purchase",
            json!({ "listing_id": request.listing_id, "buyer_id": request.buyer_id }),
        );
        let ticket = match self.gate.admit(&request.idempotency_key, &fingerprint).await? {
            Admission::Acquired(ticket) => ticket,
            Admission::Completed(prior) => return Ok(serde_json::from_value(prior)?),
            Admission::InProgress => {
                return Err(SettlementError::IdempotencyInProgress(request.idempotency_key));
            }
        };

        match self.settle(&ticket, &request).await {
            Ok(receipt) => {
                tracing::info!(order_id = %receipt.order_id, fee = receipt.fee_amount, "Listing sold");
                Ok(receipt)
            }
            Err(e) => {
                match &e {
                    SettlementError::ListingUnavailable { .. } | SettlementError::LockAcquisitionTimeout(_) => {
                        tracing::debug!("Purchase lost the listing: {}", e)
                    }
                    _ => tracing::warn!(code = e.reason_code(), "Purchase rejected: {}", e),
                }
                self.gate.abandon(&ticket, &e).await;
                Err(e)
            }
        }
    }

    async fn settle(&self, ticket: &Ticket, request: &PurchaseRequest) -> Result<PurchaseReceipt> {
        let mut uow = self.store.begin().await?;
        self.gate.hold(uow.as_mut(), ticket).await?;

        let mut listing = self.lock_listing(uow.as_mut(), request.listing_id).await?;
        ensure_on_sale(&listing)?;
        if listing.seller_id == request.buyer_id {
            return Err(SettlementError::Validation("cannot buy your own listing".to_string()));
        }

        listing.transition(ListingStatus::Locked)?;
        uow.save_listing(&listing).await?;

        let price = listing.price_amount;
        let fee = self.fee_for(price);
        let buyer = uow.get_or_create_account(request.buyer_id, AccountKind::Wallet).await?;
        let seller = uow.get_or_create_account(listing.seller_id, AccountKind::Wallet).await?;
        let platform = uow.get_or_create_account(PLATFORM_OWNER_ID, AccountKind::Platform).await?;

        let mut touched = vec![
            (buyer.id, listing.price_asset.clone()),
            (seller.id, listing.price_asset.clone()),
            (platform.id, listing.price_asset.clone()),
        ];
        if let ListingOffer::Fungible { asset_code, .. } = &listing.offer {
            touched.push((seller.id, asset_code.clone()));
            touched.push((buyer.id, asset_code.clone()));
        }
        lock_balances_in_order(uow.as_mut(), touched).await?;

        let memo = Some(format!("listing {}", listing.id));
        let key = Some(ticket.key.as_str());

        // payment
        apply_change(
            uow.as_mut(),
            buyer.id,
            &listing.price_asset,
            BalanceChange::debit(price),
            BusinessType::MarketPurchase,
            key,
            memo.clone(),
        )
        .await?;
        if price > fee {
            apply_change(
                uow.as_mut(),
                seller.id,
                &listing.price_asset,
                BalanceChange::credit(price - fee),
                BusinessType::MarketSale,
                key,
                memo.clone(),
            )
            .await?;
        }
        if fee > 0 {
            apply_change(
                uow.as_mut(),
                platform.id,
                &listing.price_asset,
                BalanceChange::credit(fee),
                BusinessType::MarketFee,
                key,
                memo.clone(),
            )
            .await?;
        }

        // delivery
        match &listing.offer {
            ListingOffer::Item { item_id } => {
                let mut item = uow
                    .lock_item(*item_id)
                    .await?
                    .filter(|item| item.owner_id == listing.seller_id && item.status == ItemStatus::Listed)
                    .ok_or_else(|| escrow_missing(&listing))?;
                let now = Utc::now();
                item.owner_id = request.buyer_id;
                item.status = ItemStatus::Available;
                item.source = "market".to_string();
                item.acquired_at = now;
                item.updated_at = now;
                uow.save_item(&item).await?;
            }
            ListingOffer::Fungible { asset_code, amount } => {
                apply_change(
                    uow.as_mut(),
                    seller.id,
                    asset_code,
                    BalanceChange::consume_frozen(*amount),
                    BusinessType::MarketDelivery,
                    key,
                    memo.clone(),
                )
                .await?;
                apply_change(
                    uow.as_mut(),
                    buyer.id,
                    asset_code,
                    BalanceChange::credit(*amount),
                    BusinessType::MarketDelivery,
                    key,
                    memo,
                )
                .await?;
            }
        }

        listing.transition(ListingStatus::Sold)?;
        listing.buyer_id = Some(request.buyer_id);
        uow.save_listing(&listing).await?;

        let now = Utc::now();
        let order = MarketOrder {
            id: Uuid::new_v4(),
            listing_id: listing.id,
            buyer_id: request.buyer_id,
            seller_id: listing.seller_id,
            price_asset: listing.price_asset.clone(),
            price_amount: price,
            fee_amount: fee,
            idempotency_key: ticket.key.clone(),
            created_at: now,
        };
        uow.insert_order(&order).await?;

        let receipt = PurchaseReceipt {
            order_id: order.id,
            listing_id: listing.id,
            status: listing.status,
            buyer_id: order.buyer_id,
            seller_id: order.seller_id,
            offer: listing.offer.clone(),
            price_asset: order.price_asset.clone(),
            price_amount: price,
            fee_amount: fee,
            settled_at: now,
        };
        self.gate
            .complete_in(uow.as_mut(), ticket, &serde_json::to_value(&receipt)?)
            .await?;
        uow.commit().await?;
        Ok(receipt)
    }

    pub async fn get_listing(&self, listing_id: Uuid) -> Result<Listing> {
        self.store
            .find_listing(listing_id)
            .await?
            .ok_or_else(|| SettlementError::NotFound(format!("listing {listing_id}")))
    }

    pub async fn order_for_listing(&self, listing_id: Uuid) -> Result<Option<MarketOrder>> {
        self.store.find_order_for_listing(listing_id).await
    }

    async fn lock_listing(&self, uow: &mut dyn UnitOfWork, listing_id: Uuid) -> Result<Listing> {
        uow.lock_listing(listing_id, self.lock_mode)
            .await?
            .ok_or_else(|| SettlementError::NotFound(format!("listing {listing_id}")))
    }
}

fn ensure_on_sale(listing: &Listing) -> Result<()> {
    if listing.status != ListingStatus::OnSale {
        return Err(SettlementError::ListingUnavailable {
            listing_id: listing.id,
            status: listing.status.to_string(),
        });
    }
    Ok(())
}

fn escrow_missing(listing: &Listing) -> SettlementError {
    tracing::error!(listing_id = %listing.id, "Listed item is not held in escrow");
    SettlementError::LedgerIntegrityViolation(format!("listing {} lost its escrowed item", listing.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{IdempotencyState, MemoryStore};
    use crate::services::inventory::{grant_item, InventoryService};
    use crate::services::ledger::Ledger;
    use std::time::Duration;

    struct Fixture {
        memory: Arc<MemoryStore>,
        store: Arc<dyn SettlementStore>,
        gate: IdempotencyGate,
        ledger: Ledger,
        market: MarketService,
    }

    async fn fixture() -> Fixture {
        fixture_with(LockMode::Wait, Duration::from_secs(3)).await
    }

    async fn fixture_with(lock_mode: LockMode, lock_timeout: Duration) -> Fixture {
        let memory = Arc::new(MemoryStore::with_lock_timeout(lock_timeout));
        let store: Arc<dyn SettlementStore> = memory.clone();
        let gate = IdempotencyGate::new(store.clone(), Duration::from_secs(60));
        let ledger = Ledger::new(store.clone(), gate.clone());
        let market = MarketService::new(store.clone(), gate.clone(), 500, lock_mode);
        Fixture {
            memory,
            store,
            gate,
            ledger,
            market,
        }
    }

    fn points() -> AssetCode {
        AssetCode::points()
    }

    async fn fund(f: &Fixture, user: UserId, asset: &AssetCode, amount: i64) {
        f.ledger
            .apply_delta(user, asset, amount, BusinessType::Adjustment, None)
            .await
            .unwrap();
    }

    async fn item_listing(f: &Fixture, seller: UserId, price: i64) -> (Listing, Uuid) {
        let mut uow = f.store.begin().await.unwrap();
        let item = grant_item(uow.as_mut(), seller, "SWORD", "draw").await.unwrap();
        uow.commit().await.unwrap();

        let listing = f
            .market
            .create_listing(NewListing {
                seller_id: seller,
                offer: ListingOffer::Item { item_id: item.id },
                price_asset: points(),
                price_amount: price,
            })
            .await
            .unwrap();
        (listing, item.id)
    }

    fn purchase(key: &str, listing_id: Uuid, buyer_id: UserId) -> PurchaseRequest {
        PurchaseRequest {
            idempotency_key: key.to_string(),
            listing_id,
            buyer_id,
        }
    }

    #[tokio::test]
    async fn test_item_purchase_moves_value_and_item() {
        let f = fixture().await;
        fund(&f, 2, &points(), 1_000).await;
        let (listing, item_id) = item_listing(&f, 1, 1_000).await;

        let receipt = f.market.purchase(purchase("p-1", listing.id, 2)).await.unwrap();
        assert_eq!(receipt.status, ListingStatus::Sold);
        assert_eq!(receipt.fee_amount, 50);

        assert_eq!(f.ledger.get_balance(2, &points()).await.unwrap().available, 0);
        assert_eq!(f.ledger.get_balance(1, &points()).await.unwrap().available, 950);
        assert_eq!(f.ledger.platform_balance(&points()).await.unwrap().available, 50);

        let inventory = InventoryService::new(f.store.clone());
        let items = inventory.list_items(2).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, item_id);
        assert_eq!(items[0].status, ItemStatus::Available);

        let order = f.market.order_for_listing(listing.id).await.unwrap().unwrap();
        assert_eq!(order.id, receipt.order_id);
    }

    #[tokio::test]
    async fn test_second_buyer_sees_unavailable() {
        let f = fixture().await;
        fund(&f, 2, &points(), 500).await;
        fund(&f, 3, &points(), 500).await;
        let (listing, _) = item_listing(&f, 1, 100).await;

        f.market.purchase(purchase("p-1", listing.id, 2)).await.unwrap();
        let err = f.market.purchase(purchase("p-2", listing.id, 3)).await.unwrap_err();
        assert!(matches!(err, SettlementError::ListingUnavailable { .. }));
        assert_eq!(err.reason_code(), "LISTING_UNAVAILABLE");
        assert_eq!(f.ledger.get_balance(3, &points()).await.unwrap().available, 500);
    }

    #[tokio::test]
    async fn test_nowait_purchase_on_held_listing_is_retryable() {
        let f = fixture_with(LockMode::NoWait, Duration::from_secs(3)).await;
        fund(&f, 2, &points(), 500).await;
        let (listing, _) = item_listing(&f, 1, 100).await;

        let hold = f.memory.hold_listing(listing.id);
        let err = f.market.purchase(purchase("p-1", listing.id, 2)).await.unwrap_err();
        assert!(matches!(err, SettlementError::LockAcquisitionTimeout(_)));
        assert!(err.is_retryable());

        let record = f.gate.lookup("p-1").await.unwrap().unwrap();
        assert_eq!(record.state, IdempotencyState::Failed);
        assert_eq!(record.error_code.as_deref(), Some("LOCK_ACQUISITION_TIMEOUT"));
        assert_eq!(f.ledger.get_balance(2, &points()).await.unwrap().available, 500);
        assert_eq!(f.market.get_listing(listing.id).await.unwrap().status, ListingStatus::OnSale);

        // 같은 키로 재시도하면 처리됨
        drop(hold);
        let receipt = f.market.purchase(purchase("p-1", listing.id, 2)).await.unwrap();
        assert_eq!(receipt.status, ListingStatus::Sold);
    }

    #[tokio::test]
    async fn test_wait_purchase_times_out_then_proceeds_after_release() {
        let f = fixture_with(LockMode::Wait, Duration::from_millis(200)).await;
        fund(&f, 2, &points(), 500).await;
        let (listing, _) = item_listing(&f, 1, 100).await;

        let hold = f.memory.hold_listing(listing.id);
        let err = f.market.purchase(purchase("p-1", listing.id, 2)).await.unwrap_err();
        assert!(matches!(err, SettlementError::LockAcquisitionTimeout(_)));

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(hold);
        });
        let receipt = f.market.purchase(purchase("p-1", listing.id, 2)).await.unwrap();
        assert_eq!(receipt.status, ListingStatus::Sold);
        release.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_payment_leaves_listing_on_sale() {
        let f = fixture().await;
        fund(&f, 2, &points(), 10).await;
        let (listing, _) = item_listing(&f, 1, 100).await;

        let err = f.market.purchase(purchase("p-1", listing.id, 2)).await.unwrap_err();
        assert!(matches!(err, SettlementError::InsufficientBalance { .. }));

        let stored = f.market.get_listing(listing.id).await.unwrap();
        assert_eq!(stored.status, ListingStatus::OnSale);
        assert!(f.market.order_for_listing(listing.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purchase_replay_is_idempotent() {
        let f = fixture().await;
        fund(&f, 2, &points(), 500).await;
        let (listing, _) = item_listing(&f, 1, 100).await;

        let first = f.market.purchase(purchase("p-1", listing.id, 2)).await.unwrap();
        let replay = f.market.purchase(purchase("p-1", listing.id, 2)).await.unwrap();
        assert_eq!(first, replay);
        assert_eq!(f.ledger.get_balance(2, &points()).await.unwrap().available, 400);
    }

    #[tokio::test]
    async fn test_self_purchase_rejected() {
        let f = fixture().await;
        fund(&f, 1, &points(), 500).await;
        let (listing, _) = item_listing(&f, 1, 100).await;

        let err = f.market.purchase(purchase("p-1", listing.id, 1)).await.unwrap_err();
        assert!(matches!(err, SettlementError::Validation(_)));
    }

    #[tokio::test]
    async fn test_fungible_listing_freezes_and_delivers() {
        let f = fixture().await;
        let gold = AssetCode::new("gold").unwrap();
        fund(&f, 1, &gold, 100).await;
        fund(&f, 2, &points(), 300).await;

        let listing = f
            .market
            .create_listing(NewListing {
                seller_id: 1,
                offer: ListingOffer::Fungible { asset_code: gold.clone(), amount: 30 },
                price_asset: points(),
                price_amount: 300,
            })
            .await
            .unwrap();

        let seller_gold = f.ledger.get_balance(1, &gold).await.unwrap();
        assert_eq!((seller_gold.available, seller_gold.frozen), (70, 30));

        f.market.purchase(purchase("p-1", listing.id, 2)).await.unwrap();

        let seller_gold = f.ledger.get_balance(1, &gold).await.unwrap();
        assert_eq!((seller_gold.available, seller_gold.frozen), (70, 0));
        assert_eq!(f.ledger.get_balance(2, &gold).await.unwrap().available, 30);
        assert_eq!(f.ledger.get_balance(1, &points()).await.unwrap().available, 285);

        for user in [1, 2] {
            f.ledger.verify_conservation(user, &gold).await.unwrap();
            f.ledger.verify_conservation(user, &points()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_withdraw_releases_escrow() {
        let f = fixture().await;
        let (listing, item_id) = item_listing(&f, 1, 100).await;

        let err = f.market.withdraw_listing(2, listing.id).await.unwrap_err();
        assert!(matches!(err, SettlementError::NotFound(_)));

        let withdrawn = f.market.withdraw_listing(1, listing.id).await.unwrap();
        assert_eq!(withdrawn.status, ListingStatus::Withdrawn);

        let items = f.store.list_items(1).await.unwrap();
        assert_eq!(items[0].id, item_id);
        assert_eq!(items[0].status, ItemStatus::Available);

        let err = f.market.withdraw_listing(1, listing.id).await.unwrap_err();
        assert!(matches!(err, SettlementError::ListingUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_listed_item_cannot_be_listed_twice() {
        let f = fixture().await;
        let (_, item_id) = item_listing(&f, 1, 100).await;

        let err = f
            .market
            .create_listing(NewListing {
                seller_id: 1,
                offer: ListingOffer::Item { item_id },
                price_asset: points(),
                price_amount: 100,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::Validation(_)));
    }
}
