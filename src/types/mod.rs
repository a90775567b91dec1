//! Common Types Module
//!
//! 애플리케이션 전반에서 사용되는 공통 타입 정의

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SettlementError;

/// 사용자 식별자 (외부 인증 시스템이 발급)
pub type UserId = i64;

/// 자산 코드 (예: `POINTS`, `GOLD_SHARD`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AssetCode(String);

impl AssetCode {
    const MAX_LEN: usize = 32;

    pub fn new(code: &str) -> Result<Self, SettlementError> {
        let code = code.trim().to_uppercase();
        let valid = !code.is_empty()
            && code.len() <= Self::MAX_LEN
            && code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
        if valid {
            Ok(Self(code))
        } else {
            Err(SettlementError::Validation(format!("invalid asset code: {code:?}")))
        }
    }

    /// The default spendable currency.
    pub fn points() -> Self {
        Self("POINTS".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AssetCode {
    type Error = SettlementError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<AssetCode> for String {
    fn from(code: AssetCode) -> Self {
        code.0
    }
}

/// 페이지네이션 요청
///
/// 역직렬화도 `new`를 거치므로 limit 상한이 항상 적용됨
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(from = "RawPageRequest")]
pub struct PageRequest {
    /// 페이지 (0부터 시작)
    pub page: u32,
    /// 페이지 크기 (기본 20, 최대 100)
    pub limit: u32,
}

impl PageRequest {
    pub const DEFAULT_LIMIT: u32 = 20;
    pub const MAX_LIMIT: u32 = 100;

    pub fn new(page: u32, limit: u32) -> Self {
        let limit = if limit == 0 { Self::DEFAULT_LIMIT } else { limit.min(Self::MAX_LIMIT) };
        Self { page, limit }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page) * u64::from(self.limit)
    }
}

#[derive(Deserialize)]
struct RawPageRequest {
    #[serde(default)]
    page: u32,
    #[serde(default)]
    limit: u32,
}

impl From<RawPageRequest> for PageRequest {
    fn from(raw: RawPageRequest) -> Self {
        Self::new(raw.page, raw.limit)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(0, Self::DEFAULT_LIMIT)
    }
}

/// 페이지 단위 조회 결과
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub has_next: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, request: PageRequest, total: u64) -> Self {
        let has_next = request.offset() + u64::from(request.limit) < total;
        Self {
            items,
            page: request.page,
            limit: request.limit,
            total,
            has_next,
        }
    }
}

/// Half-open time window `[from, to)`; an open bound means unbounded.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TimeRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| at >= from) && self.to.map_or(true, |to| at < to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_asset_code_normalized() {
        let code = AssetCode::new(" gold_shard ").unwrap();
        assert_eq!(code.as_str(), "GOLD_SHARD");
    }

    #[test]
    fn test_asset_code_invalid() {
        assert!(AssetCode::new("").is_err());
        assert!(AssetCode::new("points!").is_err());
        assert!(AssetCode::new(&"A".repeat(33)).is_err());
    }

    #[test]
    fn test_page_limit_capped() {
        let req = PageRequest::new(2, 500);
        assert_eq!(req.limit, PageRequest::MAX_LIMIT);
        assert_eq!(req.offset(), 200);

        let page = Page::new(vec![1, 2, 3], PageRequest::new(0, 3), 4);
        assert!(page.has_next);
        let page = Page::new(vec![4], PageRequest::new(1, 3), 4);
        assert!(!page.has_next);
    }

    #[test]
    fn test_page_request_deserialize_normalized() {
        let req: PageRequest = serde_json::from_str(r#"{"page": 1, "limit": 500}"#).unwrap();
        assert_eq!(req.limit, PageRequest::MAX_LIMIT);

        let req: PageRequest = serde_json::from_str(r#"{"page": 0, "limit": 0}"#).unwrap();
        assert_eq!(req.limit, PageRequest::DEFAULT_LIMIT);
        assert!(!Page::new(Vec::<u8>::new(), req, 0).has_next);

        let req: PageRequest = serde_json::from_str("{}").unwrap();
        assert_eq!((req.page, req.limit), (0, PageRequest::DEFAULT_LIMIT));
    }

    #[test]
    fn test_time_range_half_open() {
        let now = Utc::now();
        let range = TimeRange {
            from: Some(now - Duration::hours(1)),
            to: Some(now),
        };
        assert!(range.contains(now - Duration::minutes(1)));
        assert!(!range.contains(now));
        assert!(TimeRange::default().contains(now));
    }
}
