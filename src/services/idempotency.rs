//! Idempotency Gate
//!
//! # Interview Q&A
//!
//! Q: 같은 요청이 동시에 두 번 들어오면 어떻게 한 번만 처리하는가?
//! A: 멱등성 키로 레코드를 INSERT 하는 쪽이 승자
//!
//!    ```text
//!    admit(key) ─ INSERT ... ON CONFLICT DO NOTHING
//!        ├─ 삽입 성공  → Acquired (처리 권한 획득)
//!        └─ 이미 존재  → 기존 레코드 확인
//!              ├─ fingerprint 불일치 → IdempotencyKeyConflict
//!              ├─ completed          → 저장된 결과 반환 (재실행 없음)
//!              ├─ pending (TTL 이내) → InProgress (같은 키로 재시도)
//!              └─ failed / TTL 초과  → 재획득 (새 owner, attempts + 1)
//!    ```
//!
//! Q: 처리 중 워커가 죽으면 키가 영원히 막히지 않는가?
//! A: pending 레코드에는 expires_at이 있음
//!    - 만료된 pending은 다음 admit이 재획득하거나 sweeper가 failed로 전환
//!    - 재획득 후 원래 워커가 complete를 시도하면 owner 불일치 → StaleTicket
//!
//! Q: 완료 표시가 정산과 따로 커밋되면 어떤 문제가 있는가?
//! A: 정산 커밋 후 완료 표시 전에 죽으면 재시도가 다시 처리함 (이중 차감)
//!    - 그래서 `hold` + `complete_in`으로 정산과 같은 원자 단위에서 완료 표시

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha3::{Digest, Sha3_256};
use uuid::Uuid;

use crate::db::{IdempotencyRecord, IdempotencyState, SettlementStore, UnitOfWork};
use crate::error::{Result, SettlementError};

const MAX_KEY_LEN: usize = 128;

/// What a request is: the same key must always carry the same fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestFingerprint {
    pub method: String,
    pub path: String,
    pub params: serde_json::Value,
}

impl RequestFingerprint {
    pub fn new(method: &str, path: &str, params: serde_json::Value) -> Self {
        Self {
            method: method.to_uppercase(),
            path: path.to_string(),
            params,
        }
    }

    /// SHA3-256 over method, path and the params JSON (object keys sorted).
    pub fn digest(&self) -> String {
        let mut hasher = Sha3_256::new();
        hasher.update(self.method.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.path.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.params.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Proof that the holder owns processing of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub key: String,
    pub owner: Uuid,
    /// false when a failed or stale record was re-acquired
    pub is_new: bool,
    pub attempt: i32,
}

/// Result of [`IdempotencyGate::admit`].
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Acquired(Ticket),
    /// Already settled; carries the stored result.
    Completed(serde_json::Value),
    /// Another worker holds the key. Retry later with the same key.
    InProgress,
}

impl Admission {
    pub fn should_process(&self) -> bool {
        matches!(self, Admission::Acquired(_))
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Admission::Acquired(ticket) if ticket.is_new)
    }

    pub fn prior_result(&self) -> Option<&serde_json::Value> {
        match self {
            Admission::Completed(result) => Some(result),
            _ => None,
        }
    }
}

/// 멱등성 게이트
#[derive(Clone)]
pub struct IdempotencyGate {
    store: Arc<dyn SettlementStore>,
    ttl: chrono::Duration,
}

impl IdempotencyGate {
    pub fn new(store: Arc<dyn SettlementStore>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(300));
        Self { store, ttl }
    }

    #[tracing::instrument(skip(self, fingerprint))]
    pub async fn admit(&self, key: &str, fingerprint: &RequestFingerprint) -> Result<Admission> {
        validate_key(key)?;
        let digest = fingerprint.digest();
        let now = Utc::now();

        let mut uow = self.store.begin().await?;
        let fresh = IdempotencyRecord {
            key: key.to_string(),
            state: IdempotencyState::Pending,
            fingerprint: digest.clone(),
            result: None,
            error_code: None,
            error_message: None,
            owner: Uuid::new_v4(),
            attempts: 1,
            created_at: now,
            updated_at: now,
            expires_at: now + self.ttl,
        };

        if uow.insert_idempotency_record(&fresh).await? {
            uow.commit().await?;
            tracing::debug!("Idempotency key acquired");
            return Ok(Admission::Acquired(Ticket {
                key: fresh.key,
                owner: fresh.owner,
                is_new: true,
                attempt: 1,
            }));
        }

        let mut existing = uow
            .lock_idempotency_record(key)
            .await?
            .ok_or_else(|| SettlementError::Database(format!("idempotency record {key} vanished")))?;

        if existing.fingerprint != digest {
            uow.rollback().await?;
            tracing::warn!("Idempotency key reused for a different request");
            return Err(SettlementError::IdempotencyKeyConflict(key.to_string()));
        }

        match existing.state {
            IdempotencyState::Completed => {
                uow.rollback().await?;
                Ok(Admission::Completed(existing.result.unwrap_or(serde_json::Value::Null)))
            }
            IdempotencyState::Pending if !existing.is_stale(now) => {
                uow.rollback().await?;
                Ok(Admission::InProgress)
            }
            IdempotencyState::Pending | IdempotencyState::Failed => {
                let previous = existing.state;
                existing.state = IdempotencyState::Pending;
                existing.owner = Uuid::new_v4();
                existing.attempts += 1;
                existing.result = None;
                existing.error_code = None;
                existing.error_message = None;
                existing.updated_at = now;
                existing.expires_at = now + self.ttl;
                uow.save_idempotency_record(&existing).await?;
                uow.commit().await?;

                tracing::info!(previous = %previous, attempt = existing.attempts, "Idempotency key re-acquired");
                Ok(Admission::Acquired(Ticket {
                    key: existing.key,
                    owner: existing.owner,
                    is_new: false,
                    attempt: existing.attempts,
                }))
            }
        }
    }

    /// Locks the record inside a settlement unit and checks the ticket still
    /// owns a pending record. Call before any settlement write.
    pub async fn hold(&self, uow: &mut dyn UnitOfWork, ticket: &Ticket) -> Result<()> {
        let record = self.lock_owned(uow, ticket).await?;
        if record.state != IdempotencyState::Pending {
            return Err(SettlementError::StaleTicket(ticket.key.clone()));
        }
        Ok(())
    }

    /// Marks the record completed inside the caller's unit; it becomes
    /// visible when that unit commits.
    pub async fn complete_in(
        &self,
        uow: &mut dyn UnitOfWork,
        ticket: &Ticket,
        result: &serde_json::Value,
    ) -> Result<IdempotencyRecord> {
        let mut record = self.lock_owned(uow, ticket).await?;
        if record.state.is_terminal() {
            return Ok(record);
        }
        record.state = IdempotencyState::Completed;
        record.result = Some(result.clone());
        record.updated_at = Utc::now();
        uow.save_idempotency_record(&record).await?;
        Ok(record)
    }

    pub async fn complete(&self, ticket: &Ticket, result: &serde_json::Value) -> Result<IdempotencyRecord> {
        let mut uow = self.store.begin().await?;
        let record = self.complete_in(uow.as_mut(), ticket, result).await?;
        uow.commit().await?;
        Ok(record)
    }

    /// `pending → failed`. A retry with the same key may then re-process.
    pub async fn fail(&self, ticket: &Ticket, error: &SettlementError) -> Result<IdempotencyRecord> {
        let mut uow = self.store.begin().await?;
        let mut record = self.lock_owned(uow.as_mut(), ticket).await?;
        if record.state.is_terminal() {
            uow.rollback().await?;
            return Ok(record);
        }
        record.state = IdempotencyState::Failed;
        record.error_code = Some(error.reason_code().to_string());
        record.error_message = Some(error.to_string());
        record.updated_at = Utc::now();
        uow.save_idempotency_record(&record).await?;
        uow.commit().await?;
        Ok(record)
    }

    /// Best-effort `fail` after a settlement error; the original error wins.
    pub async fn abandon(&self, ticket: &Ticket, error: &SettlementError) {
        match self.fail(ticket, error).await {
            Ok(_) => tracing::debug!(key = %ticket.key, code = error.reason_code(), "Idempotency key failed"),
            Err(SettlementError::StaleTicket(_)) => {
                tracing::warn!(key = %ticket.key, "Idempotency key was re-acquired by another worker")
            }
            Err(e) => tracing::error!(key = %ticket.key, "Failed to mark idempotency key failed: {}", e),
        }
    }

    /// Expires every pending record whose TTL has elapsed.
    pub async fn reclaim_stale(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut uow = self.store.begin().await?;
        let expired = uow.expire_idempotency_records(now).await?;
        uow.commit().await?;
        if expired > 0 {
            tracing::info!(expired, "Reclaimed stale idempotency records");
        }
        Ok(expired)
    }

    pub async fn lookup(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        self.store.find_idempotency_record(key).await
    }

    /// Stored result of `key` if it completed for the same request. Never
    /// creates a record, so callers can consult it for requests they reject
    /// before admission.
    pub async fn completed_result(
        &self,
        key: &str,
        fingerprint: &RequestFingerprint,
    ) -> Result<Option<serde_json::Value>> {
        let Some(record) = self.lookup(key).await? else {
            return Ok(None);
        };
        if record.state != IdempotencyState::Completed || record.fingerprint != fingerprint.digest() {
            return Ok(None);
        }
        Ok(record.result)
    }

    async fn lock_owned(&self, uow: &mut dyn UnitOfWork, ticket: &Ticket) -> Result<IdempotencyRecord> {
        let record = uow
            .lock_idempotency_record(&ticket.key)
            .await?
            .ok_or_else(|| SettlementError::NotFound(format!("idempotency record {}", ticket.key)))?;
        if record.owner != ticket.owner {
            return Err(SettlementError::StaleTicket(ticket.key.clone()));
        }
        Ok(record)
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(SettlementError::Validation("idempotency key must not be empty".to_string()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(SettlementError::Validation(format!(
            "idempotency key must be at most {MAX_KEY_LEN} bytes"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use serde_json::json;

    fn gate_with_ttl(ttl: Duration) -> IdempotencyGate {
        IdempotencyGate::new(Arc::new(MemoryStore::new()), ttl)
    }

    fn fingerprint(amount: i64) -> RequestFingerprint {
        RequestFingerprint::new("post", "/draw", json!({ "user": 1, "amount": amount }))
    }

    fn ticket(admission: Admission) -> Ticket {
        match admission {
            Admission::Acquired(ticket) => ticket,
            other => panic!("expected Acquired, got {other:?}"),
        }
    }

    #[test]
    fn test_digest_ignores_key_order() {
        let a = RequestFingerprint::new("POST", "/draw", json!({ "a": 1, "b": 2 }));
        let b = RequestFingerprint::new("post", "/draw", json!({ "b": 2, "a": 1 }));
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), fingerprint(1).digest());
        assert_eq!(a.digest().len(), 64);
    }

    #[tokio::test]
    async fn test_first_admission_processes() {
        let gate = gate_with_ttl(Duration::from_secs(60));
        let admission = gate.admit("k1", &fingerprint(1)).await.unwrap();
        assert!(admission.should_process());
        assert!(admission.is_new());
        assert!(admission.prior_result().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_while_pending_is_in_progress() {
        let gate = gate_with_ttl(Duration::from_secs(60));
        gate.admit("k1", &fingerprint(1)).await.unwrap();

        let second = gate.admit("k1", &fingerprint(1)).await.unwrap();
        assert_eq!(second, Admission::InProgress);
        assert!(!second.should_process());
    }

    #[tokio::test]
    async fn test_completed_returns_prior_result() {
        let gate = gate_with_ttl(Duration::from_secs(60));
        let t = ticket(gate.admit("k1", &fingerprint(1)).await.unwrap());
        gate.complete(&t, &json!({ "tier": "high" })).await.unwrap();

        let replay = gate.admit("k1", &fingerprint(1)).await.unwrap();
        assert_eq!(replay.prior_result(), Some(&json!({ "tier": "high" })));
    }

    #[tokio::test]
    async fn test_completed_result_only_for_matching_completed_record() {
        let gate = gate_with_ttl(Duration::from_secs(60));
        assert!(gate.completed_result("k1", &fingerprint(1)).await.unwrap().is_none());

        let t = ticket(gate.admit("k1", &fingerprint(1)).await.unwrap());
        assert!(gate.completed_result("k1", &fingerprint(1)).await.unwrap().is_none());

        gate.complete(&t, &json!({ "tier": "mid" })).await.unwrap();
        assert_eq!(
            gate.completed_result("k1", &fingerprint(1)).await.unwrap(),
            Some(json!({ "tier": "mid" }))
        );
        assert!(gate.completed_result("k1", &fingerprint(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch_conflicts() {
        let gate = gate_with_ttl(Duration::from_secs(60));
        let t = ticket(gate.admit("k1", &fingerprint(1)).await.unwrap());
        gate.complete(&t, &json!(null)).await.unwrap();

        let err = gate.admit("k1", &fingerprint(2)).await.unwrap_err();
        assert!(matches!(err, SettlementError::IdempotencyKeyConflict(_)));

        // the stored record is untouched
        let record = gate.lookup("k1").await.unwrap().unwrap();
        assert_eq!(record.state, IdempotencyState::Completed);
    }

    #[tokio::test]
    async fn test_complete_and_fail_are_idempotent() {
        let gate = gate_with_ttl(Duration::from_secs(60));
        let t = ticket(gate.admit("k1", &fingerprint(1)).await.unwrap());

        let first = gate.complete(&t, &json!({ "n": 1 })).await.unwrap();
        let second = gate.complete(&t, &json!({ "n": 2 })).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(second.result, Some(json!({ "n": 1 })));

        let after_fail = gate
            .fail(&t, &SettlementError::Validation("late".to_string()))
            .await
            .unwrap();
        assert_eq!(after_fail.state, IdempotencyState::Completed);
    }

    #[tokio::test]
    async fn test_failed_key_is_reacquired() {
        let gate = gate_with_ttl(Duration::from_secs(60));
        let t = ticket(gate.admit("k1", &fingerprint(1)).await.unwrap());
        let failed = gate
            .fail(
                &t,
                &SettlementError::InsufficientBalance {
                    asset_code: "POINTS".to_string(),
                    required: 10,
                    available: 0,
                },
            )
            .await
            .unwrap();
        assert_eq!(failed.error_code.as_deref(), Some("INSUFFICIENT_BALANCE"));

        let retry = ticket(gate.admit("k1", &fingerprint(1)).await.unwrap());
        assert!(!retry.is_new);
        assert_eq!(retry.attempt, 2);
        assert_ne!(retry.owner, t.owner);

        // the first ticket lost ownership
        let err = gate.complete(&t, &json!(null)).await.unwrap_err();
        assert!(matches!(err, SettlementError::StaleTicket(_)));
    }

    #[tokio::test]
    async fn test_stale_pending_is_reclaimed() {
        let gate = gate_with_ttl(Duration::from_millis(0));
        let t = ticket(gate.admit("k1", &fingerprint(1)).await.unwrap());

        let expired = gate.reclaim_stale(Utc::now()).await.unwrap();
        assert_eq!(expired, 1);

        let record = gate.lookup("k1").await.unwrap().unwrap();
        assert_eq!(record.state, IdempotencyState::Failed);
        assert_eq!(record.error_code.as_deref(), Some("EXPIRED"));

        let err = gate.hold_standalone(&t).await.unwrap_err();
        assert!(matches!(err, SettlementError::StaleTicket(_)));
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let gate = gate_with_ttl(Duration::from_secs(60));
        let err = gate.admit("  ", &fingerprint(1)).await.unwrap_err();
        assert!(matches!(err, SettlementError::Validation(_)));
    }

    impl IdempotencyGate {
        async fn hold_standalone(&self, ticket: &Ticket) -> Result<()> {
            let mut uow = self.store.begin().await?;
            self.hold(uow.as_mut(), ticket).await
        }
    }
}
