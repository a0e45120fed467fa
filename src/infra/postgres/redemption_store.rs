//! PostgreSQL redemption store
//!
//! Implements the voucher repository, the fraud attempt log and the fraud
//! case sink on one connection pool.
//!
//! # Atomicity
//!
//! A redemption commits in a single transaction:
//! ```sql
//! BEGIN;
//! SELECT ... FROM vouchers WHERE id = $1 FOR UPDATE;
//! SELECT COUNT(*) FROM redemption_records WHERE voucher_id = $1 AND user_id = $2;
//! -- plan the writes against the locked row
//! UPDATE vouchers SET state = $2, current_redemptions = $3
//!     WHERE id = $1 AND current_redemptions = $old
//!       AND (max_redemptions IS NULL OR $3 <= max_redemptions);
//! INSERT INTO redemption_records ...;
//! INSERT INTO redemption_attempts ...;
//! INSERT INTO fraud_cases ...;   -- review case, if any
//! COMMIT;
//! ```
//!
//! The row lock linearizes reservations per voucher; the guarded update is
//! a second line of defence backed by the `vouchers_quota_bound` check
//! constraint. Dropping the transaction (error, timeout, cancellation)
//! rolls everything back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::types::Json;
use sqlx::Postgres;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use std::collections::HashMap;

use crate::domain::{
    AttemptOutcome, AttemptSummary, BusinessId, CategoryId, CodeMatch, FraudCase, FraudCaseId,
    FraudFlag, GeoPoint, RedemptionId, RedemptionRecord, UserId, Voucher, VoucherCode, VoucherId,
    VoucherState,
};
use crate::infra::{
    CommitMutation, CommitReceipt, FraudCaseSink, FraudHistory, HistoryKey, RedemptionError,
    Result, VoucherRepository,
};

const UNIQUE_VIOLATION: &str = "23505";

/// Database row for vouchers
#[derive(sqlx::FromRow)]
struct VoucherRow {
    id: Uuid,
    business_id: Uuid,
    category_id: Uuid,
    state: String,
    discount_type: String,
    discount_value: i64,
    currency: String,
    valid_from: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    max_redemptions: Option<i32>,
    max_redemptions_per_user: i32,
    current_redemptions: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl VoucherRow {
    fn into_voucher(self, codes: Vec<VoucherCode>) -> Result<Voucher> {
        Ok(Voucher {
            id: VoucherId::from_uuid(self.id),
            business_id: BusinessId::from_uuid(self.business_id),
            category_id: CategoryId::from_uuid(self.category_id),
            state: self.state.parse().map_err(RedemptionError::Internal)?,
            discount_type: self.discount_type.parse().map_err(RedemptionError::Internal)?,
            discount_value: self.discount_value.max(0) as u64,
            currency: self.currency,
            valid_from: self.valid_from,
            expires_at: self.expires_at,
            max_redemptions: self.max_redemptions.map(|m| m.max(0) as u32),
            max_redemptions_per_user: self.max_redemptions_per_user.max(0) as u32,
            current_redemptions: self.current_redemptions.max(0) as u32,
            codes,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Database row for voucher codes
#[derive(sqlx::FromRow)]
struct CodeRow {
    code: String,
    voucher_id: Uuid,
    code_type: String,
    is_active: bool,
}

impl CodeRow {
    fn into_code(self) -> Result<VoucherCode> {
        Ok(VoucherCode {
            code: self.code,
            code_type: self.code_type.parse().map_err(RedemptionError::Internal)?,
            is_active: self.is_active,
        })
    }
}

/// Database row for redemption records
#[derive(sqlx::FromRow)]
struct RecordRow {
    id: Uuid,
    voucher_id: Uuid,
    user_id: Uuid,
    code: String,
    redeemed_at: DateTime<Utc>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    risk_score: i16,
    flags: Json<Vec<FraudFlag>>,
}

impl From<RecordRow> for RedemptionRecord {
    fn from(row: RecordRow) -> Self {
        Self {
            id: RedemptionId::from_uuid(row.id),
            voucher_id: VoucherId::from_uuid(row.voucher_id),
            user_id: UserId::from_uuid(row.user_id),
            code: row.code,
            redeemed_at: row.redeemed_at,
            location: point(row.latitude, row.longitude),
            risk_score: row.risk_score.clamp(0, 100) as u8,
            flags: row.flags.0,
        }
    }
}

/// Database row for the attempt log
#[derive(sqlx::FromRow)]
struct AttemptRow {
    voucher_id: Uuid,
    user_id: Uuid,
    attempted_at: DateTime<Utc>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    device_fingerprint: Option<String>,
    outcome: Json<AttemptOutcome>,
}

impl From<AttemptRow> for AttemptSummary {
    fn from(row: AttemptRow) -> Self {
        Self {
            voucher_id: VoucherId::from_uuid(row.voucher_id),
            user_id: UserId::from_uuid(row.user_id),
            attempted_at: row.attempted_at,
            location: point(row.latitude, row.longitude),
            device_fingerprint: row.device_fingerprint,
            outcome: row.outcome.0,
        }
    }
}

fn point(latitude: Option<f64>, longitude: Option<f64>) -> Option<GeoPoint> {
    match (latitude, longitude) {
        (Some(lat), Some(lon)) => Some(GeoPoint::new(lat, lon)),
        _ => None,
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

async fn fetch_codes<'e, E>(executor: E, voucher_ids: &[Uuid]) -> Result<Vec<CodeRow>>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let rows: Vec<CodeRow> = sqlx::query_as(
        r#"
        SELECT code, voucher_id, code_type, is_active
        FROM voucher_codes
        WHERE voucher_id = ANY($1)
        ORDER BY code
        "#,
    )
    .bind(voucher_ids)
    .fetch_all(executor)
    .await?;

    Ok(rows)
}

async fn codes_for<'e, E>(executor: E, voucher_id: Uuid) -> Result<Vec<VoucherCode>>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    fetch_codes(executor, &[voucher_id])
        .await?
        .into_iter()
        .map(CodeRow::into_code)
        .collect()
}

async fn insert_attempt(conn: &mut PgConnection, attempt: &AttemptSummary) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO redemption_attempts (
            voucher_id, user_id, attempted_at, latitude, longitude, device_fingerprint, outcome
        ) VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(attempt.voucher_id.0)
    .bind(attempt.user_id.0)
    .bind(attempt.attempted_at)
    .bind(attempt.location.map(|p| p.latitude))
    .bind(attempt.location.map(|p| p.longitude))
    .bind(attempt.device_fingerprint.as_deref())
    .bind(Json(&attempt.outcome))
    .execute(conn)
    .await?;

    Ok(())
}

async fn insert_case(conn: &mut PgConnection, case: &FraudCase) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO fraud_cases (
            id, voucher_id, customer_id, provider_id, code,
            flags, risk_score, decision, status, context, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(case.id.0)
    .bind(case.voucher_id.0)
    .bind(case.customer_id.0)
    .bind(case.provider_id.0)
    .bind(&case.code)
    .bind(Json(&case.flags))
    .bind(i16::from(case.risk_score))
    .bind(case.decision.as_str())
    .bind(case.status.as_str())
    .bind(Json(&case.context))
    .bind(case.created_at)
    .execute(conn)
    .await?;

    Ok(())
}

/// PostgreSQL-backed redemption store
#[derive(Clone)]
pub struct PgRedemptionStore {
    pool: PgPool,
}

impl PgRedemptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Fraud cases for a voucher, newest first
    pub async fn cases_for(&self, voucher_id: &VoucherId) -> Result<Vec<FraudCaseId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM fraud_cases
            WHERE voucher_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(voucher_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(FraudCaseId::from_uuid).collect())
    }
}

#[async_trait]
impl VoucherRepository for PgRedemptionStore {
    async fn find_by_code(&self, code: &str) -> Result<Option<CodeMatch>> {
        let row: Option<VoucherRow> = sqlx::query_as(
            r#"
            SELECT v.id, v.business_id, v.category_id, v.state, v.discount_type,
                   v.discount_value, v.currency, v.valid_from, v.expires_at,
                   v.max_redemptions, v.max_redemptions_per_user, v.current_redemptions,
                   v.created_at, v.updated_at
            FROM voucher_codes c
            JOIN vouchers v ON v.id = c.voucher_id
            WHERE c.code = $1
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let codes = codes_for(&self.pool, row.id).await?;
        let voucher = row.into_voucher(codes)?;
        Ok(voucher.find_code(code).cloned().map(|code| CodeMatch { voucher, code }))
    }

    async fn get(&self, voucher_id: &VoucherId) -> Result<Option<Voucher>> {
        let row: Option<VoucherRow> = sqlx::query_as(
            r#"
            SELECT id, business_id, category_id, state, discount_type,
                   discount_value, currency, valid_from, expires_at,
                   max_redemptions, max_redemptions_per_user, current_redemptions,
                   created_at, updated_at
            FROM vouchers
            WHERE id = $1
            "#,
        )
        .bind(voucher_id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let codes = codes_for(&self.pool, row.id).await?;
                Ok(Some(row.into_voucher(codes)?))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, voucher), fields(voucher_id = %voucher.id))]
    async fn insert(&self, voucher: &Voucher) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO vouchers (
                id, business_id, category_id, state, discount_type, discount_value, currency,
                valid_from, expires_at, max_redemptions, max_redemptions_per_user,
                current_redemptions, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(voucher.id.0)
        .bind(voucher.business_id.0)
        .bind(voucher.category_id.0)
        .bind(voucher.state.as_str())
        .bind(voucher.discount_type.as_str())
        .bind(i64::try_from(voucher.discount_value).unwrap_or(i64::MAX))
        .bind(&voucher.currency)
        .bind(voucher.valid_from)
        .bind(voucher.expires_at)
        .bind(voucher.max_redemptions.map(|m| m.min(i32::MAX as u32) as i32))
        .bind(voucher.max_redemptions_per_user.min(i32::MAX as u32) as i32)
        .bind(voucher.current_redemptions.min(i32::MAX as u32) as i32)
        .bind(voucher.created_at)
        .bind(voucher.updated_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Err(e) if is_unique_violation(&e) => return Err(RedemptionError::Conflict(voucher.id)),
            other => {
                other?;
            }
        }

        for code in &voucher.codes {
            let result = sqlx::query(
                r#"
                INSERT INTO voucher_codes (code, voucher_id, code_type, is_active)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(&code.code)
            .bind(voucher.id.0)
            .bind(code.code_type.as_str())
            .bind(code.is_active)
            .execute(&mut *tx)
            .await;

            match result {
                Err(e) if is_unique_violation(&e) => {
                    return Err(RedemptionError::DuplicateCode(code.code.clone()))
                }
                other => {
                    other?;
                }
            }
        }

        tx.commit().await?;
        debug!(codes = voucher.codes.len(), "voucher inserted");
        Ok(())
    }

    async fn user_redemption_count(
        &self,
        voucher_id: &VoucherId,
        user_id: &UserId,
    ) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM redemption_records
            WHERE voucher_id = $1 AND user_id = $2
            "#,
        )
        .bind(voucher_id.0)
        .bind(user_id.0)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u32)
    }

    #[instrument(skip(self, mutation), fields(voucher_id = %voucher_id, user_id = %user_id))]
    async fn atomic_reserve_and_commit(
        &self,
        voucher_id: &VoucherId,
        user_id: &UserId,
        mutation: &dyn CommitMutation,
    ) -> Result<CommitReceipt> {
        let mut tx = self.pool.begin().await?;

        // Lock the row so reservations are linearizable per voucher.
        let row: Option<VoucherRow> = sqlx::query_as(
            r#"
            SELECT id, business_id, category_id, state, discount_type,
                   discount_value, currency, valid_from, expires_at,
                   max_redemptions, max_redemptions_per_user, current_redemptions,
                   created_at, updated_at
            FROM vouchers
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(voucher_id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let row = row.ok_or(RedemptionError::VoucherNotFound(*voucher_id))?;
        let codes = codes_for(&mut *tx, row.id).await?;
        let mut voucher = row.into_voucher(codes)?;

        let prior: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM redemption_records
            WHERE voucher_id = $1 AND user_id = $2
            "#,
        )
        .bind(voucher_id.0)
        .bind(user_id.0)
        .fetch_one(&mut *tx)
        .await?;

        let plan = mutation.plan(&voucher, prior.max(0) as u32)?;

        let updated = sqlx::query(
            r#"
            UPDATE vouchers
            SET state = $2, current_redemptions = $3, updated_at = $4
            WHERE id = $1
              AND current_redemptions = $5
              AND (max_redemptions IS NULL OR $3 <= max_redemptions)
            "#,
        )
        .bind(voucher_id.0)
        .bind(plan.next_state.as_str())
        .bind(plan.next_redemptions as i32)
        .bind(plan.record.redeemed_at)
        .bind(voucher.current_redemptions as i32)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            warn!("guarded voucher update matched no row");
            return Err(RedemptionError::Conflict(*voucher_id));
        }

        sqlx::query(
            r#"
            INSERT INTO redemption_records (
                id, voucher_id, user_id, code, redeemed_at, latitude, longitude, risk_score, flags
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(plan.record.id.0)
        .bind(plan.record.voucher_id.0)
        .bind(plan.record.user_id.0)
        .bind(&plan.record.code)
        .bind(plan.record.redeemed_at)
        .bind(plan.record.location.map(|p| p.latitude))
        .bind(plan.record.location.map(|p| p.longitude))
        .bind(i16::from(plan.record.risk_score))
        .bind(Json(&plan.record.flags))
        .execute(&mut *tx)
        .await?;

        insert_attempt(&mut *tx, &plan.attempt).await?;

        let review_case_id = match &plan.review_case {
            Some(case) => {
                insert_case(&mut *tx, case).await?;
                Some(case.id)
            }
            None => None,
        };

        tx.commit().await?;

        voucher.state = plan.next_state;
        voucher.current_redemptions = plan.next_redemptions;
        voucher.updated_at = plan.record.redeemed_at;

        debug!(
            state = %voucher.state,
            current_redemptions = voucher.current_redemptions,
            "redemption committed"
        );

        Ok(CommitReceipt {
            voucher,
            record_id: plan.record.id,
            review_case_id,
        })
    }

    #[instrument(skip(self), fields(voucher_id = %voucher_id))]
    async fn compare_and_set_state(
        &self,
        voucher_id: &VoucherId,
        expected: VoucherState,
        next: VoucherState,
        at: DateTime<Utc>,
    ) -> Result<Voucher> {
        let row: Option<VoucherRow> = sqlx::query_as(
            r#"
            UPDATE vouchers
            SET state = $3, updated_at = $4
            WHERE id = $1 AND state = $2
            RETURNING id, business_id, category_id, state, discount_type,
                      discount_value, currency, valid_from, expires_at,
                      max_redemptions, max_redemptions_per_user, current_redemptions,
                      created_at, updated_at
            "#,
        )
        .bind(voucher_id.0)
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let codes = codes_for(&self.pool, row.id).await?;
                row.into_voucher(codes)
            }
            None => {
                let exists: Option<Uuid> =
                    sqlx::query_scalar("SELECT id FROM vouchers WHERE id = $1")
                        .bind(voucher_id.0)
                        .fetch_optional(&self.pool)
                        .await?;
                match exists {
                    Some(_) => Err(RedemptionError::Conflict(*voucher_id)),
                    None => Err(RedemptionError::VoucherNotFound(*voucher_id)),
                }
            }
        }
    }

    async fn list_expirable(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Voucher>> {
        let rows: Vec<VoucherRow> = sqlx::query_as(
            r#"
            SELECT id, business_id, category_id, state, discount_type,
                   discount_value, currency, valid_from, expires_at,
                   max_redemptions, max_redemptions_per_user, current_redemptions,
                   created_at, updated_at
            FROM vouchers
            WHERE state IN ('new', 'published', 'claimed')
              AND expires_at < $1
            ORDER BY expires_at, id
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let mut codes: HashMap<Uuid, Vec<VoucherCode>> = HashMap::new();
        for row in fetch_codes(&self.pool, &ids).await? {
            let voucher_id = row.voucher_id;
            codes.entry(voucher_id).or_default().push(row.into_code()?);
        }

        rows.into_iter()
            .map(|row| {
                let mine = codes.remove(&row.id).unwrap_or_default();
                row.into_voucher(mine)
            })
            .collect()
    }

    #[instrument(skip(self), fields(voucher_id = %voucher_id))]
    async fn delete(&self, voucher_id: &VoucherId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let current: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT current_redemptions FROM vouchers
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(voucher_id.0)
        .fetch_optional(&mut *tx)
        .await?;

        match current {
            None => return Err(RedemptionError::VoucherNotFound(*voucher_id)),
            Some(n) if n > 0 => return Err(RedemptionError::VoucherInUse(*voucher_id)),
            Some(_) => {}
        }

        sqlx::query("DELETE FROM vouchers WHERE id = $1")
            .bind(voucher_id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!("voucher deleted");
        Ok(())
    }

    async fn redemptions_for(&self, voucher_id: &VoucherId) -> Result<Vec<RedemptionRecord>> {
        let rows: Vec<RecordRow> = sqlx::query_as(
            r#"
            SELECT id, voucher_id, user_id, code, redeemed_at, latitude, longitude,
                   risk_score, flags
            FROM redemption_records
            WHERE voucher_id = $1
            ORDER BY redeemed_at, id
            "#,
        )
        .bind(voucher_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(RedemptionRecord::from).collect())
    }
}

#[async_trait]
impl FraudHistory for PgRedemptionStore {
    async fn recent_attempts(
        &self,
        key: &HistoryKey,
        since: DateTime<Utc>,
    ) -> Result<Vec<AttemptSummary>> {
        const COLUMNS: &str = "voucher_id, user_id, attempted_at, latitude, longitude, \
                               device_fingerprint, outcome";

        let rows: Vec<AttemptRow> = match key {
            HistoryKey::User(user_id) => {
                sqlx::query_as(&format!(
                    "SELECT {COLUMNS} FROM redemption_attempts \
                     WHERE user_id = $1 AND attempted_at >= $2 ORDER BY attempted_at, id"
                ))
                .bind(user_id.0)
                .bind(since)
                .fetch_all(&self.pool)
                .await?
            }
            HistoryKey::Voucher(voucher_id) => {
                sqlx::query_as(&format!(
                    "SELECT {COLUMNS} FROM redemption_attempts \
                     WHERE voucher_id = $1 AND attempted_at >= $2 ORDER BY attempted_at, id"
                ))
                .bind(voucher_id.0)
                .bind(since)
                .fetch_all(&self.pool)
                .await?
            }
            HistoryKey::Device(fingerprint) => {
                sqlx::query_as(&format!(
                    "SELECT {COLUMNS} FROM redemption_attempts \
                     WHERE device_fingerprint = $1 AND attempted_at >= $2 ORDER BY attempted_at, id"
                ))
                .bind(fingerprint)
                .bind(since)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.into_iter().map(AttemptSummary::from).collect())
    }

    async fn record_attempt(&self, attempt: &AttemptSummary) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_attempt(&mut *conn, attempt).await
    }
}

#[async_trait]
impl FraudCaseSink for PgRedemptionStore {
    #[instrument(skip(self, case), fields(case_id = %case.id, voucher_id = %case.voucher_id))]
    async fn create(&self, case: &FraudCase) -> Result<FraudCaseId> {
        let mut conn = self.pool.acquire().await?;
        insert_case(&mut *conn, case).await?;
        Ok(case.id)
    }
}
