//! In-memory implementation of the store ports.
//!
//! Each voucher lives behind its own `tokio::sync::Mutex`, which is the
//! serialized critical section for reservations on that voucher. Vouchers
//! never contend with each other. Lock order is entry mutex first, then the
//! attempt log or case list.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::domain::{
    AttemptSummary, CodeMatch, FraudCase, FraudCaseId, RedemptionRecord, UserId, Voucher,
    VoucherId, VoucherState,
};

use super::{
    CommitMutation, CommitReceipt, FraudCaseSink, FraudHistory, HistoryKey, RedemptionError,
    Result, VoucherRepository,
};

#[derive(Debug)]
struct VoucherEntry {
    voucher: Voucher,
    redemptions: Vec<RedemptionRecord>,
    deleted: bool,
}

impl VoucherEntry {
    fn user_redemptions(&self, user_id: &UserId) -> u32 {
        self.redemptions
            .iter()
            .filter(|r| r.user_id == *user_id)
            .count() as u32
    }
}

/// Store for tests and single-process embedding
#[derive(Debug, Default)]
pub struct InMemoryRedemptionStore {
    vouchers: RwLock<HashMap<VoucherId, Arc<Mutex<VoucherEntry>>>>,
    codes: RwLock<HashMap<String, VoucherId>>,
    attempts: RwLock<Vec<AttemptSummary>>,
    cases: RwLock<Vec<FraudCase>>,
}

impl InMemoryRedemptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, voucher_id: &VoucherId) -> Result<Arc<Mutex<VoucherEntry>>> {
        self.vouchers
            .read()
            .await
            .get(voucher_id)
            .cloned()
            .ok_or(RedemptionError::VoucherNotFound(*voucher_id))
    }

    /// All fraud cases, in creation order
    pub async fn cases(&self) -> Vec<FraudCase> {
        self.cases.read().await.clone()
    }

    /// The full attempt log, in insertion order
    pub async fn attempts(&self) -> Vec<AttemptSummary> {
        self.attempts.read().await.clone()
    }
}

fn matches_key(attempt: &AttemptSummary, key: &HistoryKey) -> bool {
    match key {
        HistoryKey::User(user_id) => attempt.user_id == *user_id,
        HistoryKey::Voucher(voucher_id) => attempt.voucher_id == *voucher_id,
        HistoryKey::Device(fp) => attempt.device_fingerprint.as_deref() == Some(fp.as_str()),
    }
}

#[async_trait]
impl VoucherRepository for InMemoryRedemptionStore {
    async fn find_by_code(&self, code: &str) -> Result<Option<CodeMatch>> {
        let voucher_id = match self.codes.read().await.get(code) {
            Some(id) => *id,
            None => return Ok(None),
        };

        let entry = match self.entry(&voucher_id).await {
            Ok(entry) => entry,
            Err(RedemptionError::VoucherNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let entry = entry.lock().await;
        if entry.deleted {
            return Ok(None);
        }

        Ok(entry.voucher.find_code(code).cloned().map(|code| CodeMatch {
            voucher: entry.voucher.clone(),
            code,
        }))
    }

    async fn get(&self, voucher_id: &VoucherId) -> Result<Option<Voucher>> {
        let Some(entry) = self.vouchers.read().await.get(voucher_id).cloned() else {
            return Ok(None);
        };
        let entry = entry.lock().await;
        Ok((!entry.deleted).then(|| entry.voucher.clone()))
    }

    async fn insert(&self, voucher: &Voucher) -> Result<()> {
        let mut codes = self.codes.write().await;
        for c in &voucher.codes {
            if codes.contains_key(&c.code) {
                return Err(RedemptionError::DuplicateCode(c.code.clone()));
            }
        }

        let mut vouchers = self.vouchers.write().await;
        if vouchers.contains_key(&voucher.id) {
            return Err(RedemptionError::Conflict(voucher.id));
        }
        for c in &voucher.codes {
            codes.insert(c.code.clone(), voucher.id);
        }
        vouchers.insert(
            voucher.id,
            Arc::new(Mutex::new(VoucherEntry {
                voucher: voucher.clone(),
                redemptions: Vec::new(),
                deleted: false,
            })),
        );

        debug!(voucher_id = %voucher.id, codes = voucher.codes.len(), "voucher inserted");
        Ok(())
    }

    async fn user_redemption_count(
        &self,
        voucher_id: &VoucherId,
        user_id: &UserId,
    ) -> Result<u32> {
        let entry = self.entry(voucher_id).await?;
        let entry = entry.lock().await;
        Ok(entry.user_redemptions(user_id))
    }

    async fn atomic_reserve_and_commit(
        &self,
        voucher_id: &VoucherId,
        user_id: &UserId,
        mutation: &dyn CommitMutation,
    ) -> Result<CommitReceipt> {
        let entry = self.entry(voucher_id).await?;
        let mut entry = entry.lock().await;
        if entry.deleted {
            return Err(RedemptionError::VoucherNotFound(*voucher_id));
        }

        let prior = entry.user_redemptions(user_id);
        let plan = mutation.plan(&entry.voucher, prior)?;

        if let Some(max) = entry.voucher.max_redemptions {
            if plan.next_redemptions > max {
                return Err(RedemptionError::Conflict(*voucher_id));
            }
        }

        entry.voucher.state = plan.next_state;
        entry.voucher.current_redemptions = plan.next_redemptions;
        entry.voucher.updated_at = plan.record.redeemed_at;
        let record_id = plan.record.id;
        entry.redemptions.push(plan.record);

        self.attempts.write().await.push(plan.attempt);

        let review_case_id = match plan.review_case {
            Some(case) => {
                let id = case.id;
                self.cases.write().await.push(case);
                Some(id)
            }
            None => None,
        };

        Ok(CommitReceipt {
            voucher: entry.voucher.clone(),
            record_id,
            review_case_id,
        })
    }

    async fn compare_and_set_state(
        &self,
        voucher_id: &VoucherId,
        expected: VoucherState,
        next: VoucherState,
        at: DateTime<Utc>,
    ) -> Result<Voucher> {
        let entry = self.entry(voucher_id).await?;
        let mut entry = entry.lock().await;
        if entry.deleted {
            return Err(RedemptionError::VoucherNotFound(*voucher_id));
        }
        if entry.voucher.state != expected {
            return Err(RedemptionError::Conflict(*voucher_id));
        }

        entry.voucher.state = next;
        entry.voucher.updated_at = at;
        Ok(entry.voucher.clone())
    }

    async fn list_expirable(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Voucher>> {
        let entries: Vec<_> = self.vouchers.read().await.values().cloned().collect();

        let mut expirable = Vec::new();
        for entry in entries {
            let entry = entry.lock().await;
            if !entry.deleted && !entry.voucher.state.is_terminal() && entry.voucher.is_past_expiry(now)
            {
                expirable.push(entry.voucher.clone());
            }
        }

        expirable.sort_by_key(|v| (v.expires_at, v.id));
        expirable.truncate(limit);
        Ok(expirable)
    }

    async fn delete(&self, voucher_id: &VoucherId) -> Result<()> {
        let entry = self.entry(voucher_id).await?;
        let codes: Vec<String> = {
            let mut entry = entry.lock().await;
            if entry.deleted {
                return Err(RedemptionError::VoucherNotFound(*voucher_id));
            }
            if entry.voucher.current_redemptions > 0 {
                return Err(RedemptionError::VoucherInUse(*voucher_id));
            }
            entry.deleted = true;
            entry.voucher.codes.iter().map(|c| c.code.clone()).collect()
        };

        let mut code_map = self.codes.write().await;
        for code in codes {
            code_map.remove(&code);
        }
        drop(code_map);
        self.vouchers.write().await.remove(voucher_id);

        debug!(voucher_id = %voucher_id, "voucher deleted");
        Ok(())
    }

    async fn redemptions_for(&self, voucher_id: &VoucherId) -> Result<Vec<RedemptionRecord>> {
        let entry = self.entry(voucher_id).await?;
        let entry = entry.lock().await;
        Ok(entry.redemptions.clone())
    }
}

#[async_trait]
impl FraudHistory for InMemoryRedemptionStore {
    async fn recent_attempts(
        &self,
        key: &HistoryKey,
        since: DateTime<Utc>,
    ) -> Result<Vec<AttemptSummary>> {
        let mut found: Vec<AttemptSummary> = self
            .attempts
            .read()
            .await
            .iter()
            .filter(|a| a.attempted_at >= since && matches_key(a, key))
            .cloned()
            .collect();
        found.sort_by_key(|a| a.attempted_at);
        Ok(found)
    }

    async fn record_attempt(&self, attempt: &AttemptSummary) -> Result<()> {
        self.attempts.write().await.push(attempt.clone());
        Ok(())
    }
}

#[async_trait]
impl FraudCaseSink for InMemoryRedemptionStore {
    async fn create(&self, case: &FraudCase) -> Result<FraudCaseId> {
        self.cases.write().await.push(case.clone());
        Ok(case.id)
    }
}
