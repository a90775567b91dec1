//! Campaign Catalog
//!
//! Campaign configuration - tier weights, pity thresholds and curve, draw
//! cost, prize pools - is data. The draw pipeline fetches one snapshot per
//! request through [`CampaignCatalog`]; [`StaticCatalog`] serves snapshots
//! parsed from a YAML file and can be reloaded while running.
//!
//! ```yaml
//! campaigns:
//!   - code: spring
//!     name: Spring Festival
//!     cost: { asset_code: POINTS, amount: 100 }
//!     tier_weights: { high: 10, mid: 90, low: 300, fallback: 600 }
//!     pity:
//!       hard_threshold: 80
//!       soft: { kind: linear, start: 60, step_bps: 5000, max_multiplier_bps: 100000 }
//!     prizes:
//!       - { code: dragon, name: Dragon Skin, tier: high, stock: 5,
//!           reward: { kind: item, item_code: DRAGON_SKIN } }
//!       - { code: thanks, name: Thanks, tier: fallback,
//!           reward: { kind: asset, asset_code: POINTS, amount: 10 } }
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::pity::{PityConfig, TierWeights};
use crate::db::Tier;
use crate::error::{Result, SettlementError};
use crate::types::AssetCode;

fn default_true() -> bool {
    true
}

fn default_max_draws() -> u32 {
    10
}

fn default_prize_weight() -> u32 {
    1
}

/// 추첨 1회 비용
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawCost {
    pub asset_code: AssetCode,
    pub amount: i64,
}

/// 상품 지급 방식
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reward {
    /// 원장을 통한 대체 자산 지급
    Asset { asset_code: AssetCode, amount: i64 },
    /// 인벤토리 아이템 지급
    Item { item_code: String },
}

/// 상품 설정
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrizeConfig {
    pub code: String,
    pub name: String,
    pub tier: Tier,
    /// 같은 tier 안에서의 상대 가중치
    #[serde(default = "default_prize_weight")]
    pub weight: u32,
    /// 초기 재고 (없으면 무제한)
    #[serde(default)]
    pub stock: Option<i64>,
    pub reward: Reward,
}

/// 캠페인 설정
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignConfig {
    pub code: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    pub cost: DrawCost,
    #[serde(default = "default_max_draws")]
    pub max_draws_per_request: u32,
    /// 연속 추첨(count > 1) 할인
    #[serde(default)]
    pub multi_draw_discount_bps: u32,
    pub tier_weights: TierWeights,
    pub pity: PityConfig,
    pub prizes: Vec<PrizeConfig>,
}

impl CampaignConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(SettlementError::Config(format!("campaign {}: {}", self.code, msg)));

        if self.code.trim().is_empty() {
            return Err(SettlementError::Config("campaign code must not be empty".to_string()));
        }
        if self.cost.amount <= 0 {
            return invalid("cost must be positive".to_string());
        }
        if self.max_draws_per_request == 0 {
            return invalid("max_draws_per_request must be at least 1".to_string());
        }
        if self.multi_draw_discount_bps > 10_000 {
            return invalid("multi_draw_discount_bps must be at most 10000".to_string());
        }
        if self.tier_weights.total() == 0 {
            return invalid("tier weights must not all be zero".to_string());
        }
        if self.pity.hard_threshold == 0 {
            return invalid("pity.hard_threshold must be at least 1".to_string());
        }
        if let Err(msg) = self.pity.soft.validate() {
            return invalid(msg);
        }
        if let (Some(start), Some(end)) = (self.starts_at, self.ends_at) {
            if end <= start {
                return invalid("ends_at must be after starts_at".to_string());
            }
        }

        let mut codes = HashSet::new();
        for prize in &self.prizes {
            if !codes.insert(prize.code.as_str()) {
                return invalid(format!("duplicate prize code {}", prize.code));
            }
            if prize.stock.map_or(false, |s| s < 0) {
                return invalid(format!("prize {} has negative stock", prize.code));
            }
            match &prize.reward {
                Reward::Asset { amount, .. } if *amount <= 0 => {
                    return invalid(format!("prize {} must grant a positive amount", prize.code));
                }
                Reward::Item { item_code } if item_code.trim().is_empty() => {
                    return invalid(format!("prize {} has an empty item code", prize.code));
                }
                _ => {}
            }
        }

        for tier in Tier::ALL {
            if self.tier_weights.weight(tier) > 0 && self.prizes_in(tier).all(|p| p.weight == 0) {
                return invalid(format!("tier {tier} has weight but no drawable prize"));
            }
        }

        // 재고 소진 시 하향 체인의 끝
        if !self.prizes_in(Tier::Fallback).any(|p| p.weight > 0 && p.stock.is_none()) {
            return invalid("fallback tier needs at least one unlimited prize".to_string());
        }

        Ok(())
    }

    /// 활성 상태이고 기간 안인지
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.active
            && self.starts_at.map_or(true, |start| now >= start)
            && self.ends_at.map_or(true, |end| now < end)
    }

    pub fn prizes_in(&self, tier: Tier) -> impl Iterator<Item = &PrizeConfig> {
        self.prizes.iter().filter(move |p| p.tier == tier)
    }

    pub fn prize(&self, code: &str) -> Option<&PrizeConfig> {
        self.prizes.iter().find(|p| p.code == code)
    }

    /// `count × cost` less the multi-draw discount.
    pub fn total_cost(&self, count: u32) -> Result<i64> {
        let gross = self
            .cost
            .amount
            .checked_mul(i64::from(count))
            .ok_or_else(|| SettlementError::Validation("draw cost overflows".to_string()))?;
        if count <= 1 || self.multi_draw_discount_bps == 0 {
            return Ok(gross);
        }
        let discount = (i128::from(gross) * i128::from(self.multi_draw_discount_bps) / 10_000) as i64;
        Ok(gross - discount)
    }
}

/// YAML 카탈로그 파일 구조
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogFile {
    pub campaigns: Vec<CampaignConfig>,
}

/// Source of campaign configuration, consulted once per request.
#[async_trait]
pub trait CampaignCatalog: Send + Sync {
    async fn load(&self, campaign_code: &str) -> Result<Arc<CampaignConfig>>;
}

/// 메모리에 올려둔 카탈로그 (파일에서 로드 / 교체 가능)
#[derive(Default)]
pub struct StaticCatalog {
    campaigns: RwLock<HashMap<String, Arc<CampaignConfig>>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_campaigns(campaigns: Vec<CampaignConfig>) -> Result<Self> {
        let catalog = Self::new();
        catalog.replace_all(campaigns)?;
        Ok(catalog)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let file: CatalogFile =
            serde_yaml::from_str(yaml).map_err(|e| SettlementError::Config(e.to_string()))?;
        Self::from_campaigns(file.campaigns)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let catalog = Self::new();
        catalog.reload_from_file(path)?;
        Ok(catalog)
    }

    /// 파일을 다시 읽어 전체 교체. 검증 실패 시 기존 카탈로그 유지
    pub fn reload_from_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SettlementError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let file: CatalogFile =
            serde_yaml::from_str(&raw).map_err(|e| SettlementError::Config(e.to_string()))?;
        let count = file.campaigns.len();
        self.replace_all(file.campaigns)?;
        tracing::info!(path = %path.display(), campaigns = count, "Campaign catalog loaded");
        Ok(count)
    }

    pub fn replace_all(&self, campaigns: Vec<CampaignConfig>) -> Result<()> {
        let mut next = HashMap::with_capacity(campaigns.len());
        for campaign in campaigns {
            campaign.validate()?;
            if next.contains_key(&campaign.code) {
                return Err(SettlementError::Config(format!("duplicate campaign {}", campaign.code)));
            }
            next.insert(campaign.code.clone(), Arc::new(campaign));
        }
        *self.campaigns.write() = next;
        Ok(())
    }

    pub fn upsert(&self, campaign: CampaignConfig) -> Result<()> {
        campaign.validate()?;
        self.campaigns.write().insert(campaign.code.clone(), Arc::new(campaign));
        Ok(())
    }
}

#[async_trait]
impl CampaignCatalog for StaticCatalog {
    async fn load(&self, campaign_code: &str) -> Result<Arc<CampaignConfig>> {
        self.campaigns
            .read()
            .get(campaign_code)
            .cloned()
            .ok_or_else(|| SettlementError::NotFound(format!("campaign {campaign_code}")))
    }
}
