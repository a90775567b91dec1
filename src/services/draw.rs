//! Draw Orchestration Pipeline
//!
//! # Interview Q&A
//!
//! Q: 추첨 한 번은 어떤 단계를 거치는가?
//! A: 게이트 승인 후 하나의 원자 단위 안에서 전부 처리
//!
//!    ```text
//!    admitted ─▶ cost_debited ─▶ tier_computed ─▶ reward_credited ─▶ recorded ─▶ completed
//!       │             │                │                 │               │
//!     admit()   streak 잠금 +      PityCalculator    재고 차감/하향,   draw record,
//!               비용 차감          (순수 함수)       지급             streak 갱신,
//!                                                                  complete_in + commit
//!    ```
//!    - 어느 단계든 실패하면 유닛 전체 롤백 + 게이트 fail
//!    - 같은 키로 재시도하면 처음부터 다시 처리
//!
//! Q: 천장 카운터(streak)의 lost update는 어떻게 막는가?
//! A: streak 행을 비용 차감과 같은 유닛에서 잠그고 읽은 뒤,
//!    draw record insert와 같은 유닛에서 갱신
//!    - 같은 사용자의 동시 추첨은 streak 행 잠금에서 직렬화됨
//!
//! Q: 상품 재고가 떨어지면?
//! A: 같은 등급의 다른 상품 → 하위 등급 순으로 하향
//!    - fallback 등급에는 무제한 상품이 반드시 존재 (카탈로그 검증)
//!    - 하향된 추첨은 `degraded_from`에 원래 등급을 남김

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::catalog::{CampaignCatalog, CampaignConfig, PrizeConfig, Reward};
use super::idempotency::{Admission, IdempotencyGate, RequestFingerprint, Ticket};
use super::inventory::grant_item;
use super::ledger::{apply_change, lock_balances_in_order, BalanceChange, BalanceSnapshot};
use super::pity::PityCalculator;
use crate::db::{AccountKind, BusinessType, DrawRecord, SettlementStore, Tier, UnitOfWork};
use crate::error::{Result, SettlementError};
use crate::types::{AssetCode, Page, PageRequest, UserId};

/// Pipeline stages, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawStage {
    Admitted,
    CostDebited,
    TierComputed,
    RewardCredited,
    Recorded,
    Completed,
}

impl fmt::Display for DrawStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DrawStage::Admitted => "admitted",
            DrawStage::CostDebited => "cost_debited",
            DrawStage::TierComputed => "tier_computed",
            DrawStage::RewardCredited => "reward_credited",
            DrawStage::Recorded => "recorded",
            DrawStage::Completed => "completed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawRequest {
    pub idempotency_key: String,
    pub user_id: UserId,
    pub campaign_code: String,
    /// Pulls in this request (1 = single draw).
    pub count: u32,
}

impl DrawRequest {
    pub fn single(idempotency_key: &str, user_id: UserId, campaign_code: &str) -> Self {
        Self::multi(idempotency_key, user_id, campaign_code, 1)
    }

    pub fn multi(idempotency_key: &str, user_id: UserId, campaign_code: &str, count: u32) -> Self {
        Self {
            idempotency_key: idempotency_key.to_string(),
            user_id,
            campaign_code: campaign_code.to_string(),
            count,
        }
    }
}

/// One settled pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawAward {
    pub draw_id: Uuid,
    pub tier: Tier,
    pub prize_code: String,
    pub reward: Reward,
    /// Set when the reward is an inventory item.
    pub item_id: Option<Uuid>,
    pub hard_pity_triggered: bool,
    pub multiplier_bps: u32,
    pub degraded_from: Option<Tier>,
    pub streak_before: u32,
}

/// Settlement summary, also stored as the idempotency result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawOutcome {
    pub campaign_code: String,
    pub awards: Vec<DrawAward>,
    pub cost_asset: AssetCode,
    pub cost_charged: i64,
    /// Cost-asset balance after settlement.
    pub new_balance: BalanceSnapshot,
    pub streak_after: u32,
}

impl DrawOutcome {
    pub fn hard_pity_triggered(&self) -> bool {
        self.awards.iter().any(|a| a.hard_pity_triggered)
    }
}

/// 추첨 서비스
#[derive(Clone)]
pub struct DrawService {
    store: Arc<dyn SettlementStore>,
    gate: IdempotencyGate,
    catalog: Arc<dyn CampaignCatalog>,
    rng: Arc<Mutex<StdRng>>,
}

impl DrawService {
    pub fn new(store: Arc<dyn SettlementStore>, gate: IdempotencyGate, catalog: Arc<dyn CampaignCatalog>) -> Self {
        Self::with_rng(store, gate, catalog, StdRng::from_entropy())
    }

    pub fn with_rng(
        store: Arc<dyn SettlementStore>,
        gate: IdempotencyGate,
        catalog: Arc<dyn CampaignCatalog>,
        rng: StdRng,
    ) -> Self {
        Self {
            store,
            gate,
            catalog,
            rng: Arc::new(Mutex::new(rng)),
        }
    }

    #[tracing::instrument(
        skip(self, request),
        fields(key = %request.idempotency_key, user_id = request.user_id, campaign = %request.campaign_code, count = request.count)
    )]
    pub async fn draw(&self, request: DrawRequest) -> Result<DrawOutcome> {
        let fingerprint = RequestFingerprint::new(
            "POST",
            "/draw",
            json!({
                "user_id": request.user_id,
                "campaign_code": request.campaign_code,
                "count": request.count,
            }),
        );

        let campaign = match self.load_campaign(&request).await {
            Ok(campaign) => campaign,
            Err(e) => {
                // 이미 정산된 키는 카탈로그가 바뀌어도 저장된 결과를 돌려줌
                if let Some(prior) = self.gate.completed_result(&request.idempotency_key, &fingerprint).await? {
                    tracing::debug!("Replaying settled draw for a campaign no longer drawable");
                    return Ok(serde_json::from_value(prior)?);
                }
                return Err(e);
            }
        };

        let ticket = match self.gate.admit(&request.idempotency_key, &fingerprint).await? {
            Admission::Acquired(ticket) => ticket,
            Admission::Completed(prior) => {
                tracing::debug!("Replaying settled draw");
                return Ok(serde_json::from_value(prior)?);
            }
            Admission::InProgress => {
                return Err(SettlementError::IdempotencyInProgress(request.idempotency_key));
            }
        };
        tracing::debug!(stage = %DrawStage::Admitted, attempt = ticket.attempt);

        match self.settle(&ticket, &campaign, &request).await {
            Ok(outcome) => {
                tracing::info!(
                    stage = %DrawStage::Completed,
                    charged = outcome.cost_charged,
                    streak_after = outcome.streak_after,
                    hard_pity = outcome.hard_pity_triggered(),
                    "Draw settled"
                );
                Ok(outcome)
            }
            Err(e) => {
                tracing::warn!(code = e.reason_code(), "Draw rejected: {}", e);
                self.gate.abandon(&ticket, &e).await;
                Err(e)
            }
        }
    }

    async fn load_campaign(&self, request: &DrawRequest) -> Result<Arc<CampaignConfig>> {
        let campaign = self.catalog.load(&request.campaign_code).await?;
        if request.count == 0 || request.count > campaign.max_draws_per_request {
            return Err(SettlementError::Validation(format!(
                "count must be between 1 and {}",
                campaign.max_draws_per_request
            )));
        }
        Ok(campaign)
    }

    async fn settle(&self, ticket: &Ticket, campaign: &CampaignConfig, request: &DrawRequest) -> Result<DrawOutcome> {
        if !campaign.is_open(Utc::now()) {
            return Err(SettlementError::CampaignInactive(campaign.code.clone()));
        }
        let total_cost = campaign.total_cost(request.count)?;
        let cost_asset = &campaign.cost.asset_code;

        let mut uow = self.store.begin().await?;
        self.gate.hold(uow.as_mut(), ticket).await?;

        let account = uow.get_or_create_account(request.user_id, AccountKind::Wallet).await?;
        let mut streak = uow.lock_draw_streak(request.user_id, &campaign.code).await?;
        lock_draw_rows(uow.as_mut(), account.id, campaign).await?;

        apply_change(
            uow.as_mut(),
            account.id,
            cost_asset,
            BalanceChange::debit(total_cost),
            BusinessType::DrawCost,
            Some(&ticket.key),
            Some(format!("{} x{}", campaign.code, request.count)),
        )
        .await?;
        tracing::debug!(stage = %DrawStage::CostDebited, total_cost);

        let calculator = PityCalculator::from_config(&campaign.pity);
        let top_tier = campaign.tier_weights.best_tier();
        let count = i64::from(request.count);
        let mut awards = Vec::with_capacity(request.count as usize);

        for pull in 0..count {
            let streak_before = u32::try_from(streak.streak).unwrap_or(0);
            let pity = {
                let mut rng = self.rng.lock();
                calculator.calculate(streak_before, &campaign.tier_weights, &mut *rng)
            };
            tracing::debug!(stage = %DrawStage::TierComputed, pull, streak_before, tier = %pity.tier, hard_pity = pity.hard_pity_triggered);

            let (prize, settled_tier) = self.pick_prize(uow.as_mut(), campaign, pity.tier).await?;
            let degraded_from = (settled_tier != pity.tier).then_some(pity.tier);
            if let Some(from) = degraded_from {
                tracing::info!(from = %from, to = %settled_tier, prize = %prize.code, "Draw degraded by prize stock");
            }

            let item_id = match &prize.reward {
                Reward::Asset { asset_code, amount } => {
                    apply_change(
                        uow.as_mut(),
                        account.id,
                        asset_code,
                        BalanceChange::credit(*amount),
                        BusinessType::DrawReward,
                        Some(&ticket.key),
                        Some(prize.code.clone()),
                    )
                    .await?;
                    None
                }
                Reward::Item { item_code } => {
                    let item = grant_item(uow.as_mut(), request.user_id, item_code, "draw").await?;
                    Some(item.id)
                }
            };
            tracing::debug!(stage = %DrawStage::RewardCredited, pull, prize = %prize.code);

            // 비용을 pull 단위로 나눠 기록 (합계는 total_cost와 일치)
            let share = total_cost / count + i64::from(pull < total_cost % count);
            let record = DrawRecord {
                id: Uuid::new_v4(),
                user_id: request.user_id,
                campaign_code: campaign.code.clone(),
                idempotency_key: ticket.key.clone(),
                cost_asset: cost_asset.clone(),
                cost_amount: share,
                tier: settled_tier,
                prize_code: prize.code.clone(),
                streak_before: streak.streak,
                hard_pity_triggered: pity.hard_pity_triggered,
                degraded_from,
                created_at: Utc::now(),
            };
            uow.insert_draw_record(&record).await?;

            streak.streak = if settled_tier == top_tier { 0 } else { streak.streak.saturating_add(1) };
            streak.total_draws += 1;
            tracing::debug!(stage = %DrawStage::Recorded, pull, streak_after = streak.streak);

            awards.push(DrawAward {
                draw_id: record.id,
                tier: settled_tier,
                prize_code: prize.code.clone(),
                reward: prize.reward.clone(),
                item_id,
                hard_pity_triggered: pity.hard_pity_triggered,
                multiplier_bps: pity.multiplier_bps,
                degraded_from,
                streak_before,
            });
        }

        streak.updated_at = Utc::now();
        uow.save_draw_streak(&streak).await?;

        let balance = uow.lock_balance(account.id, cost_asset).await?;
        let outcome = DrawOutcome {
            campaign_code: campaign.code.clone(),
            awards,
            cost_asset: cost_asset.clone(),
            cost_charged: total_cost,
            new_balance: BalanceSnapshot::from(&balance),
            streak_after: u32::try_from(streak.streak).unwrap_or(0),
        };

        self.gate
            .complete_in(uow.as_mut(), ticket, &serde_json::to_value(&outcome)?)
            .await?;
        uow.commit().await?;
        Ok(outcome)
    }

    /// Picks a prize from `rolled`, falling back to other prizes of the same
    /// tier and then to lower tiers when stock runs out. Decrements stock.
    async fn pick_prize<'c>(
        &self,
        uow: &mut dyn UnitOfWork,
        campaign: &'c CampaignConfig,
        rolled: Tier,
    ) -> Result<(&'c PrizeConfig, Tier)> {
        for tier in Tier::ALL.into_iter().filter(|t| t.rank() >= rolled.rank()) {
            let mut candidates: Vec<&PrizeConfig> = campaign.prizes_in(tier).filter(|p| p.weight > 0).collect();

            while !candidates.is_empty() {
                let index = {
                    let mut rng = self.rng.lock();
                    weighted_index(&candidates, &mut *rng)
                };
                let prize = candidates.swap_remove(index);
                if prize.stock.is_none() {
                    return Ok((prize, tier));
                }

                let mut stock = uow.lock_prize_stock(&campaign.code, &prize.code, prize.stock).await?;
                match stock.remaining {
                    None => return Ok((prize, tier)),
                    Some(remaining) if remaining > 0 => {
                        stock.remaining = Some(remaining - 1);
                        stock.updated_at = Utc::now();
                        uow.save_prize_stock(&stock).await?;
                        return Ok((prize, tier));
                    }
                    Some(_) => tracing::debug!(prize = %prize.code, "Prize out of stock"),
                }
            }
        }

        tracing::error!(campaign = %campaign.code, "No prize left to settle a draw");
        Err(SettlementError::LedgerIntegrityViolation(format!(
            "campaign {} has no prize in stock",
            campaign.code
        )))
    }

    pub async fn draw_history(
        &self,
        user_id: UserId,
        campaign_code: Option<&str>,
        page: PageRequest,
    ) -> Result<Page<DrawRecord>> {
        let (records, total) = self.store.list_draw_records(user_id, campaign_code, page).await?;
        Ok(Page::new(records, page, total))
    }

    /// Current bad-luck streak; 0 before the first draw.
    pub async fn current_streak(&self, user_id: UserId, campaign_code: &str) -> Result<u32> {
        Ok(self
            .store
            .find_draw_streak(user_id, campaign_code)
            .await?
            .map_or(0, |s| u32::try_from(s.streak).unwrap_or(0)))
    }
}

/// Locks every balance and stock row the pulls may touch, in key order, so a
/// draw and a purchase by the same user take shared rows in the same order.
async fn lock_draw_rows(uow: &mut dyn UnitOfWork, account_id: Uuid, campaign: &CampaignConfig) -> Result<()> {
    let (balances, stocked) = draw_lock_keys(account_id, campaign);
    lock_balances_in_order(uow, balances).await?;
    for prize in stocked {
        uow.lock_prize_stock(&campaign.code, &prize.code, prize.stock).await?;
    }
    Ok(())
}

/// Balance keys and stocked prizes of one draw, each sorted and deduplicated.
fn draw_lock_keys(account_id: Uuid, campaign: &CampaignConfig) -> (Vec<(Uuid, AssetCode)>, Vec<&PrizeConfig>) {
    let mut balances = vec![(account_id, campaign.cost.asset_code.clone())];
    balances.extend(campaign.prizes.iter().filter_map(|prize| match &prize.reward {
        Reward::Asset { asset_code, .. } => Some((account_id, asset_code.clone())),
        Reward::Item { .. } => None,
    }));
    balances.sort();
    balances.dedup();

    let mut stocked: Vec<&PrizeConfig> = campaign.prizes.iter().filter(|p| p.stock.is_some()).collect();
    stocked.sort_by(|a, b| a.code.cmp(&b.code));
    stocked.dedup_by(|a, b| a.code == b.code);
    (balances, stocked)
}

fn weighted_index<R: Rng>(candidates: &[&PrizeConfig], rng: &mut R) -> usize {
    let total: u64 = candidates.iter().map(|p| u64::from(p.weight)).sum();
    if total == 0 {
        return 0;
    }
    let mut roll = rng.gen_range(0..total);
    for (index, prize) in candidates.iter().enumerate() {
        let weight = u64::from(prize.weight);
        if roll < weight {
            return index;
        }
        roll -= weight;
    }
    candidates.len() - 1
}
