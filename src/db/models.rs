//! Database Models
//!
//! Rows of the settlement tables: accounts, balances, ledger entries,
//! idempotency records, draw records and streaks, prize stock, inventory
//! items, listings and market orders. Status columns are stored as text;
//! the enums here own the mapping.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SettlementError;
use crate::types::{AssetCode, UserId};

/// Implements `as_str` / `Display` / `FromStr` for a text-mapped status enum.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = SettlementError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(SettlementError::Database(format!(
                        "unknown {} value: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

// ============ Ledger ============

/// 계정 종류 - (owner, kind) 쌍마다 하나의 계정
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    /// 사용자 기본 지갑
    Wallet,
    /// 플랫폼 수수료 수취 계정
    Platform,
}

text_enum!(AccountKind { Wallet => "wallet", Platform => "platform" });

/// 계정 (삭제되지 않음)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub id: Uuid,
    pub owner_id: UserId,
    pub kind: AccountKind,
    pub created_at: DateTime<Utc>,
}

/// 잔액 - (account, asset) 단위, delta 적용으로만 변경
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub account_id: Uuid,
    pub asset_code: AssetCode,
    /// 사용 가능 금액
    pub available: i64,
    /// 동결 금액 (판매 등록 등)
    pub frozen: i64,
    pub total_earned: i64,
    pub total_consumed: i64,
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    pub fn empty(account_id: Uuid, asset_code: AssetCode) -> Self {
        Self {
            account_id,
            asset_code,
            available: 0,
            frozen: 0,
            total_earned: 0,
            total_consumed: 0,
            updated_at: Utc::now(),
        }
    }

    /// available + frozen
    pub fn total(&self) -> i64 {
        self.available + self.frozen
    }
}

/// Business reason attached to every ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessType {
    DrawCost,
    DrawReward,
    MarketPurchase,
    MarketSale,
    MarketFee,
    MarketDelivery,
    ListingFreeze,
    ListingUnfreeze,
    Adjustment,
}

text_enum!(BusinessType {
    DrawCost => "draw_cost",
    DrawReward => "draw_reward",
    MarketPurchase => "market_purchase",
    MarketSale => "market_sale",
    MarketFee => "market_fee",
    MarketDelivery => "market_delivery",
    ListingFreeze => "listing_freeze",
    ListingUnfreeze => "listing_unfreeze",
    Adjustment => "adjustment",
});

/// 원장 항목 (append-only, 수정/삭제 불가)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub account_id: Uuid,
    pub asset_code: AssetCode,
    pub delta_available: i64,
    pub delta_frozen: i64,
    pub business_type: BusinessType,
    pub idempotency_key: Option<String>,
    /// 적용 후 잔액 스냅샷
    pub available_after: i64,
    pub frozen_after: i64,
    pub memo: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Entry to append; id and timestamp are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub account_id: Uuid,
    pub asset_code: AssetCode,
    pub delta_available: i64,
    pub delta_frozen: i64,
    pub business_type: BusinessType,
    pub idempotency_key: Option<String>,
    pub available_after: i64,
    pub frozen_after: i64,
    pub memo: Option<String>,
}

/// Sums of every delta ever applied to one balance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerTotals {
    pub available: i64,
    pub frozen: i64,
    pub entries: i64,
}

// ============ Idempotency ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyState {
    Pending,
    Completed,
    Failed,
}

text_enum!(IdempotencyState {
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
});

impl IdempotencyState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, IdempotencyState::Pending)
    }
}

/// 멱등성 레코드 - 키당 하나
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub state: IdempotencyState,
    /// method/path/params digest
    pub fingerprint: String,
    pub result: Option<serde_json::Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    /// 현재 처리 권한을 가진 워커
    pub owner: Uuid,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// pending 상태가 이 시각을 넘기면 회수 가능
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.state == IdempotencyState::Pending && self.expires_at <= now
    }
}

// ============ Draws ============

/// Reward tiers, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    High,
    Mid,
    Low,
    Fallback,
}

text_enum!(Tier {
    High => "high",
    Mid => "mid",
    Low => "low",
    Fallback => "fallback",
});

impl Tier {
    /// Best to worst.
    pub const ALL: [Tier; 4] = [Tier::High, Tier::Mid, Tier::Low, Tier::Fallback];

    pub fn rank(&self) -> usize {
        match self {
            Tier::High => 0,
            Tier::Mid => 1,
            Tier::Low => 2,
            Tier::Fallback => 3,
        }
    }
}

/// 사용자별/캠페인별 연속 미당첨 카운터 (draw insert와 같은 트랜잭션에서 갱신)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawStreak {
    pub user_id: UserId,
    pub campaign_code: String,
    pub streak: i32,
    pub total_draws: i64,
    pub updated_at: DateTime<Utc>,
}

/// 추첨 기록 (불변)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawRecord {
    pub id: Uuid,
    pub user_id: UserId,
    pub campaign_code: String,
    pub idempotency_key: String,
    pub cost_asset: AssetCode,
    pub cost_amount: i64,
    pub tier: Tier,
    pub prize_code: String,
    /// 이 추첨 시점의 streak 값
    pub streak_before: i32,
    pub hard_pity_triggered: bool,
    /// 재고 부족으로 하향된 경우 원래 선택된 tier
    pub degraded_from: Option<Tier>,
    pub created_at: DateTime<Utc>,
}

/// Remaining stock of one prize; `None` means unlimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrizeStock {
    pub campaign_code: String,
    pub prize_code: String,
    pub remaining: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

// ============ Inventory ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Available,
    Listed,
    Used,
}

text_enum!(ItemStatus {
    Available => "available",
    Listed => "listed",
    Used => "used",
});

/// 비대체 자산 (인벤토리 아이템)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InventoryItem {
    pub id: Uuid,
    pub owner_id: UserId,
    pub item_code: String,
    pub status: ItemStatus,
    /// 획득 경로 (draw, market, transfer)
    pub source: String,
    pub acquired_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============ Market ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    OnSale,
    Locked,
    Sold,
    Withdrawn,
}

text_enum!(ListingStatus {
    OnSale => "on_sale",
    Locked => "locked",
    Sold => "sold",
    Withdrawn => "withdrawn",
});

impl ListingStatus {
    /// `on_sale → locked → sold`, `on_sale → withdrawn`, `locked → on_sale`.
    pub fn can_transition_to(&self, next: ListingStatus) -> bool {
        use ListingStatus::*;
        matches!(
            (self, next),
            (OnSale, Locked) | (Locked, Sold) | (OnSale, Withdrawn) | (Locked, OnSale)
        )
    }
}

/// What a listing sells.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ListingOffer {
    Item { item_id: Uuid },
    Fungible { asset_code: AssetCode, amount: i64 },
}

/// 판매 등록
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Listing {
    pub id: Uuid,
    pub seller_id: UserId,
    pub offer: ListingOffer,
    pub price_asset: AssetCode,
    pub price_amount: i64,
    pub status: ListingStatus,
    pub buyer_id: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Listing {
    pub fn transition(&mut self, next: ListingStatus) -> Result<(), SettlementError> {
        if !self.status.can_transition_to(next) {
            return Err(SettlementError::LedgerIntegrityViolation(format!(
                "listing {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// 체결 주문 (불변)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketOrder {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub buyer_id: UserId,
    pub seller_id: UserId,
    pub price_asset: AssetCode,
    pub price_amount: i64,
    pub fee_amount: i64,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_state_machine() {
        use ListingStatus::*;
        assert!(OnSale.can_transition_to(Locked));
        assert!(Locked.can_transition_to(Sold));
        assert!(Locked.can_transition_to(OnSale));
        assert!(OnSale.can_transition_to(Withdrawn));
        assert!(!OnSale.can_transition_to(Sold));
        assert!(!Sold.can_transition_to(OnSale));
        assert!(!Withdrawn.can_transition_to(OnSale));
    }

    #[test]
    fn test_text_enum_roundtrip_and_unknown() {
        assert_eq!("on_sale".parse::<ListingStatus>().unwrap(), ListingStatus::OnSale);
        assert_eq!(Tier::Fallback.as_str(), "fallback");
        assert!("bogus".parse::<IdempotencyState>().is_err());
    }

    #[test]
    fn test_tiers_ordered_best_first() {
        assert!(Tier::High < Tier::Mid);
        assert_eq!(Tier::ALL.iter().map(Tier::rank).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }
}
