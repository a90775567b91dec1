//! Services Module
//!
//! 정산 비즈니스 로직을 담당하는 서비스 레이어
//!
//! # Services
//! - `IdempotencyGate`: 요청 중복 제거 (처리 권한 중재)
//! - `Ledger`: 잔액/원장 (available, frozen, 가치 보존)
//! - `PityCalculator`: 천장 계산 (순수 함수)
//! - `DrawService`: 추첨 파이프라인 (차감 → 계산 → 지급 → 기록)
//! - `MarketService`: 판매 등록/구매 (행 잠금으로 초과 판매 방지)
//! - `InventoryService`: 아이템 사용/양도
//! - `StaticCatalog`: 캠페인 설정 (YAML)
//! - `StaleRecordSweeper`: 만료된 pending 레코드 회수

pub mod catalog;
pub mod draw;
pub mod idempotency;
pub mod inventory;
pub mod ledger;
pub mod market;
pub mod pity;
pub mod sweeper;

pub use catalog::{CampaignCatalog, CampaignConfig, DrawCost, PrizeConfig, Reward, StaticCatalog};
pub use draw::{DrawAward, DrawOutcome, DrawRequest, DrawService, DrawStage};
pub use idempotency::{Admission, IdempotencyGate, RequestFingerprint, Ticket};
pub use inventory::InventoryService;
pub use ledger::{BalanceChange, BalanceSnapshot, Ledger, PLATFORM_OWNER_ID};
pub use market::{MarketService, NewListing, PurchaseReceipt, PurchaseRequest};
pub use pity::{PityCalculator, PityConfig, PityOutcome, SoftPityCurve, SoftPityPolicy, TierWeights};
pub use sweeper::StaleRecordSweeper;
