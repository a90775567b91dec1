//! Pity / Guarantee Calculator
//!
//! Pure mapping `(streak, tier weights) -> (tier, multiplier, hard pity)`.
//! No I/O, no shared state: the randomness is an injected RNG, so the result
//! is fully determined by the inputs and the RNG state.
//!
//! ```text
//!  streak:  0 ........ soft.start ............ hard_threshold
//!           │ base weights │ best tier × multiplier(streak) │ forced best tier
//! ```
//!
//! The soft curve is a [`SoftPityPolicy`]; [`SoftPityCurve`] is the
//! configuration-driven implementation loaded from the campaign catalog.

use rand::Rng;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};

use crate::db::Tier;

/// Multiplier of 1.0 in basis points.
pub const BASE_MULTIPLIER_BPS: u32 = 10_000;

/// Relative tier weights; a tier with weight 0 is never drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TierWeights {
    #[serde(default)]
    pub high: u32,
    #[serde(default)]
    pub mid: u32,
    #[serde(default)]
    pub low: u32,
    #[serde(default)]
    pub fallback: u32,
}

impl TierWeights {
    pub fn weight(&self, tier: Tier) -> u32 {
        match tier {
            Tier::High => self.high,
            Tier::Mid => self.mid,
            Tier::Low => self.low,
            Tier::Fallback => self.fallback,
        }
    }

    pub fn total(&self) -> u64 {
        Tier::ALL.iter().map(|t| u64::from(self.weight(*t))).sum()
    }

    /// Best tier with a non-zero weight, `High` when nothing is configured.
    pub fn best_tier(&self) -> Tier {
        Tier::ALL
            .into_iter()
            .find(|t| self.weight(*t) > 0)
            .unwrap_or(Tier::High)
    }
}

/// Soft pity policy: how much the best tier's weight is boosted at a streak.
///
/// Implementations must be monotonic (non-decreasing in `streak`) and never
/// return less than [`BASE_MULTIPLIER_BPS`].
pub trait SoftPityPolicy: Send + Sync {
    fn multiplier_bps(&self, streak: u32) -> u32;
}

/// One step of a table curve: from `from_streak` on, use `multiplier_bps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftPityPoint {
    pub from_streak: u32,
    pub multiplier_bps: u32,
}

/// 설정 기반 soft pity 곡선
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SoftPityCurve {
    /// 보정 없음
    #[default]
    None,
    /// `start`부터 streak 1회당 `step_bps`씩 증가, `max_multiplier_bps`에서 멈춤
    Linear {
        start: u32,
        step_bps: u32,
        max_multiplier_bps: u32,
    },
    /// 계단식 테이블 (from_streak 오름차순)
    Table { points: Vec<SoftPityPoint> },
}

impl SoftPityCurve {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            SoftPityCurve::None => Ok(()),
            SoftPityCurve::Linear { max_multiplier_bps, .. } => {
                if *max_multiplier_bps < BASE_MULTIPLIER_BPS {
                    return Err(format!(
                        "linear soft pity max_multiplier_bps must be at least {BASE_MULTIPLIER_BPS}"
                    ));
                }
                Ok(())
            }
            SoftPityCurve::Table { points } => {
                let mut previous: Option<&SoftPityPoint> = None;
                for point in points {
                    if point.multiplier_bps < BASE_MULTIPLIER_BPS {
                        return Err(format!(
                            "soft pity multiplier at streak {} is below {BASE_MULTIPLIER_BPS}",
                            point.from_streak
                        ));
                    }
                    if let Some(prev) = previous {
                        if point.from_streak <= prev.from_streak || point.multiplier_bps < prev.multiplier_bps {
                            return Err("soft pity table must be strictly ordered and non-decreasing".to_string());
                        }
                    }
                    previous = Some(point);
                }
                Ok(())
            }
        }
    }
}

impl SoftPityPolicy for SoftPityCurve {
    fn multiplier_bps(&self, streak: u32) -> u32 {
        match self {
            SoftPityCurve::None => BASE_MULTIPLIER_BPS,
            SoftPityCurve::Linear {
                start,
                step_bps,
                max_multiplier_bps,
            } => {
                if streak < *start {
                    return BASE_MULTIPLIER_BPS;
                }
                let steps = u64::from(streak - start + 1);
                let boosted = u64::from(BASE_MULTIPLIER_BPS) + steps * u64::from(*step_bps);
                boosted.min(u64::from(*max_multiplier_bps)) as u32
            }
            SoftPityCurve::Table { points } => points
                .iter()
                .take_while(|p| p.from_streak <= streak)
                .last()
                .map_or(BASE_MULTIPLIER_BPS, |p| p.multiplier_bps),
        }
    }
}

/// 천장 설정
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PityConfig {
    /// streak이 이 값 이상이면 최상위 등급 확정
    pub hard_threshold: u32,
    #[serde(default)]
    pub soft: SoftPityCurve,
}

/// Result of one calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PityOutcome {
    pub tier: Tier,
    /// Boost applied to the best tier's weight, in basis points.
    pub multiplier_bps: u32,
    pub hard_pity_triggered: bool,
}

impl PityOutcome {
    pub fn multiplier(&self) -> f64 {
        f64::from(self.multiplier_bps) / f64::from(BASE_MULTIPLIER_BPS)
    }
}

/// 천장 계산기
pub struct PityCalculator<'a> {
    hard_threshold: u32,
    soft: &'a dyn SoftPityPolicy,
}

impl<'a> PityCalculator<'a> {
    pub fn new(hard_threshold: u32, soft: &'a dyn SoftPityPolicy) -> Self {
        Self { hard_threshold, soft }
    }

    pub fn from_config(config: &'a PityConfig) -> Self {
        Self::new(config.hard_threshold, &config.soft)
    }

    pub fn calculate<R: RngCore>(&self, streak: u32, weights: &TierWeights, rng: &mut R) -> PityOutcome {
        let multiplier_bps = self.soft.multiplier_bps(streak).max(BASE_MULTIPLIER_BPS);
        let best = weights.best_tier();

        // 하드 천장: 랜덤 추첨을 완전히 대체
        if streak >= self.hard_threshold {
            return PityOutcome {
                tier: best,
                multiplier_bps,
                hard_pity_triggered: true,
            };
        }

        let effective = |tier: Tier| -> u64 {
            let base = u64::from(weights.weight(tier));
            if tier == best {
                base * u64::from(multiplier_bps) / u64::from(BASE_MULTIPLIER_BPS)
            } else {
                base
            }
        };

        let total: u64 = Tier::ALL.iter().map(|t| effective(*t)).sum();
        if total == 0 {
            return PityOutcome {
                tier: Tier::Fallback,
                multiplier_bps,
                hard_pity_triggered: false,
            };
        }

        let mut roll = rng.gen_range(0..total);
        let mut selected = Tier::Fallback;
        for tier in Tier::ALL {
            let weight = effective(tier);
            if roll < weight {
                selected = tier;
                break;
            }
            roll -= weight;
        }

        PityOutcome {
            tier: selected,
            multiplier_bps,
            hard_pity_triggered: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn weights() -> TierWeights {
        TierWeights {
            high: 10,
            mid: 90,
            low: 300,
            fallback: 600,
        }
    }

    #[test]
    fn test_hard_pity_always_top_tier() {
        let config = PityConfig {
            hard_threshold: 10,
            soft: SoftPityCurve::None,
        };
        let calc = PityCalculator::from_config(&config);

        for seed in 0..500 {
            let mut rng = StdRng::seed_from_u64(seed);
            let outcome = calc.calculate(10, &weights(), &mut rng);
            assert_eq!(outcome.tier, Tier::High);
            assert!(outcome.hard_pity_triggered);

            let outcome = calc.calculate(25, &weights(), &mut rng);
            assert!(outcome.hard_pity_triggered);
        }
    }

    #[test]
    fn test_below_threshold_is_random_draw() {
        let config = PityConfig {
            hard_threshold: 10,
            soft: SoftPityCurve::Linear {
                start: 5,
                step_bps: 10_000,
                max_multiplier_bps: 100_000,
            },
        };
        let calc = PityCalculator::from_config(&config);
        let mut rng = StdRng::seed_from_u64(7);

        let outcome = calc.calculate(9, &weights(), &mut rng);
        assert!(!outcome.hard_pity_triggered);
        // streak 9 → 5 steps → 6.0x
        assert_eq!(outcome.multiplier_bps, 60_000);
        assert!((outcome.multiplier() - 6.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_best_configured_tier_forced_when_high_missing() {
        let config = PityConfig {
            hard_threshold: 3,
            soft: SoftPityCurve::None,
        };
        let calc = PityCalculator::from_config(&config);
        let weights = TierWeights {
            high: 0,
            mid: 5,
            low: 0,
            fallback: 95,
        };
        let mut rng = StdRng::seed_from_u64(1);
        let outcome = calc.calculate(3, &weights, &mut rng);
        assert_eq!(outcome.tier, Tier::Mid);
        assert!(outcome.hard_pity_triggered);
    }

    #[test]
    fn test_zero_weight_tiers_never_drawn() {
        let config = PityConfig {
            hard_threshold: 1_000,
            soft: SoftPityCurve::None,
        };
        let calc = PityCalculator::from_config(&config);
        let weights = TierWeights {
            high: 0,
            mid: 0,
            low: 0,
            fallback: 1,
        };
        let mut rng = StdRng::seed_from_u64(99);
        for streak in 0..200 {
            assert_eq!(calc.calculate(streak, &weights, &mut rng).tier, Tier::Fallback);
        }

        let empty = TierWeights::default();
        assert_eq!(calc.calculate(0, &empty, &mut rng).tier, Tier::Fallback);
    }

    #[test]
    fn test_same_seed_same_outcome() {
        let config = PityConfig {
            hard_threshold: 90,
            soft: SoftPityCurve::None,
        };
        let calc = PityCalculator::from_config(&config);
        let a: Vec<_> = {
            let mut rng = StdRng::seed_from_u64(42);
            (0..50).map(|s| calc.calculate(s, &weights(), &mut rng)).collect()
        };
        let b: Vec<_> = {
            let mut rng = StdRng::seed_from_u64(42);
            (0..50).map(|s| calc.calculate(s, &weights(), &mut rng)).collect()
        };
        assert_eq!(a, b);
    }

    #[test]
    fn test_soft_pity_raises_top_tier_rate() {
        let flat = PityConfig {
            hard_threshold: 1_000,
            soft: SoftPityCurve::None,
        };
        let boosted = PityConfig {
            hard_threshold: 1_000,
            soft: SoftPityCurve::Table {
                points: vec![SoftPityPoint {
                    from_streak: 0,
                    multiplier_bps: 200_000,
                }],
            },
        };

        let count_high = |config: &PityConfig| {
            let calc = PityCalculator::from_config(config);
            let mut rng = StdRng::seed_from_u64(2024);
            (0..5_000)
                .filter(|_| calc.calculate(0, &weights(), &mut rng).tier == Tier::High)
                .count()
        };

        // 1% → 20x 보정 시 약 17%
        assert!(count_high(&boosted) > count_high(&flat) * 5);
    }

    #[test]
    fn test_curves_monotonic() {
        let linear = SoftPityCurve::Linear {
            start: 3,
            step_bps: 2_500,
            max_multiplier_bps: 20_000,
        };
        let table = SoftPityCurve::Table {
            points: vec![
                SoftPityPoint { from_streak: 2, multiplier_bps: 12_000 },
                SoftPityPoint { from_streak: 6, multiplier_bps: 30_000 },
            ],
        };
        for curve in [linear, table] {
            curve.validate().unwrap();
            let values: Vec<u32> = (0..20).map(|s| curve.multiplier_bps(s)).collect();
            assert!(values.windows(2).all(|w| w[0] <= w[1]), "{values:?}");
            assert_eq!(values[0], BASE_MULTIPLIER_BPS);
        }
    }

    #[test]
    fn test_invalid_curves_rejected() {
        let decreasing = SoftPityCurve::Table {
            points: vec![
                SoftPityPoint { from_streak: 2, multiplier_bps: 30_000 },
                SoftPityPoint { from_streak: 6, multiplier_bps: 12_000 },
            ],
        };
        assert!(decreasing.validate().is_err());

        let below_base = SoftPityCurve::Linear {
            start: 0,
            step_bps: 0,
            max_multiplier_bps: 5_000,
        };
        assert!(below_base.validate().is_err());
    }
}
