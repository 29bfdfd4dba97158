//! Step-up one-time codes for sensitive actions.
//!
//! Codes are six digits, stored only as an HMAC-SHA256 keyed by the service
//! secret, expire after the configured TTL and lock after a fixed number of
//! verification attempts whether or not they have expired.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::Rng;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::{fmt, sync::Arc};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    db::{self, DbPool},
    entities::otp_code::{self, Entity as OtpCodeEntity},
    errors::ServiceError,
    services::collaborators::{Notifier, OtpDelivery},
};

type HmacSha256 = Hmac<Sha256>;

const CODE_DIGITS: u32 = 6;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OtpPurpose {
    PasswordReset,
    PaymentEmailVerification,
}

/// Plaintext code on its way to the user. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct OneTimeCode(String);

impl OneTimeCode {
    pub fn new(code: String) -> Self {
        Self(code)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for OneTimeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OneTimeCode(******)")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OtpIssued {
    pub id: Uuid,
    pub expires_at: DateTime<Utc>,
}

pub struct OtpStepUpAuthority {
    db_pool: Arc<DbPool>,
    notifier: Arc<dyn Notifier>,
    secret: String,
    ttl: Duration,
    max_attempts: i32,
}

impl OtpStepUpAuthority {
    pub fn new(
        db_pool: Arc<DbPool>,
        notifier: Arc<dyn Notifier>,
        secret: String,
        ttl: Duration,
        max_attempts: i32,
    ) -> Self {
        Self {
            db_pool,
            notifier,
            secret,
            ttl,
            max_attempts,
        }
    }

    /// Issues a fresh code and supersedes any earlier unused code for the
    /// same user and purpose. Delivery failures are logged only.
    #[instrument(skip(self, destination), fields(user_id = %user_id, purpose = %purpose))]
    pub async fn request(
        &self,
        user_id: Uuid,
        purpose: OtpPurpose,
        destination: &str,
    ) -> Result<OtpIssued, ServiceError> {
        if destination.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "destination is required".to_string(),
            ));
        }

        let code = generate_code();
        let code_hash = self.hash(user_id, purpose, code.expose())?;
        let now = Utc::now();
        let expires_at = now + self.ttl;
        let id = Uuid::new_v4();

        let txn = db::begin(&self.db_pool).await?;
        let result = async {
            OtpCodeEntity::update_many()
                .col_expr(otp_code::Column::ConsumedAt, Expr::value(now))
                .filter(otp_code::Column::UserId.eq(user_id))
                .filter(otp_code::Column::Purpose.eq(purpose.as_ref()))
                .filter(otp_code::Column::ConsumedAt.is_null())
                .exec(&txn)
                .await?;

            otp_code::ActiveModel {
                id: Set(id),
                user_id: Set(user_id),
                purpose: Set(purpose.to_string()),
                destination: Set(destination.to_string()),
                code_hash: Set(code_hash),
                attempts: Set(0),
                expires_at: Set(expires_at),
                consumed_at: Set(None),
                created_at: Set(now),
            }
            .insert(&txn)
            .await?;
            Ok::<_, ServiceError>(())
        }
        .await;
        db::finish(txn, result).await?;

        let delivery = OtpDelivery {
            user_id,
            purpose: purpose.to_string(),
            destination: destination.to_string(),
            code,
        };
        if let Err(e) = self.notifier.send_otp(&delivery).await {
            warn!(error = %e, "one-time code delivery failed");
        }

        info!(otp_id = %id, "one-time code issued");
        Ok(OtpIssued { id, expires_at })
    }

    /// Checks `code` against the newest unused code and consumes it on success.
    #[instrument(skip(self, code), fields(user_id = %user_id, purpose = %purpose))]
    pub async fn verify(
        &self,
        user_id: Uuid,
        purpose: OtpPurpose,
        code: &str,
    ) -> Result<(), ServiceError> {
        let db = &*self.db_pool;

        let record = OtpCodeEntity::find()
            .filter(otp_code::Column::UserId.eq(user_id))
            .filter(otp_code::Column::Purpose.eq(purpose.as_ref()))
            .filter(otp_code::Column::ConsumedAt.is_null())
            .order_by_desc(otp_code::Column::CreatedAt)
            .one(db)
            .await?
            .ok_or(ServiceError::OtpInvalid)?;

        if record.attempts >= self.max_attempts {
            return Err(ServiceError::OtpAttemptsExceeded);
        }
        if Utc::now() >= record.expires_at {
            return Err(ServiceError::OtpExpired);
        }

        // counted before comparing, so concurrent guesses draw on one budget
        let counted = OtpCodeEntity::update_many()
            .col_expr(
                otp_code::Column::Attempts,
                Expr::col(otp_code::Column::Attempts).add(1),
            )
            .filter(otp_code::Column::Id.eq(record.id))
            .filter(otp_code::Column::Attempts.lt(self.max_attempts))
            .filter(otp_code::Column::ConsumedAt.is_null())
            .exec(db)
            .await?;
        if counted.rows_affected == 0 {
            return Err(ServiceError::OtpAttemptsExceeded);
        }

        if !self.matches(user_id, purpose, code, &record.code_hash)? {
            warn!(otp_id = %record.id, attempt = record.attempts + 1, "one-time code mismatch");
            return Err(ServiceError::OtpInvalid);
        }

        let consumed = OtpCodeEntity::update_many()
            .col_expr(otp_code::Column::ConsumedAt, Expr::value(Utc::now()))
            .filter(otp_code::Column::Id.eq(record.id))
            .filter(otp_code::Column::ConsumedAt.is_null())
            .exec(db)
            .await?;
        if consumed.rows_affected == 0 {
            return Err(ServiceError::OtpInvalid);
        }

        info!(otp_id = %record.id, "one-time code verified");
        Ok(())
    }

    fn mac(&self, user_id: Uuid, purpose: OtpPurpose, code: &str) -> Result<HmacSha256, ServiceError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| ServiceError::InternalError(format!("otp key rejected: {}", e)))?;
        mac.update(format!("{}:{}:{}", user_id, purpose, code).as_bytes());
        Ok(mac)
    }

    fn hash(&self, user_id: Uuid, purpose: OtpPurpose, code: &str) -> Result<String, ServiceError> {
        Ok(hex::encode(
            self.mac(user_id, purpose, code)?.finalize().into_bytes(),
        ))
    }

    fn matches(
        &self,
        user_id: Uuid,
        purpose: OtpPurpose,
        code: &str,
        stored_hash: &str,
    ) -> Result<bool, ServiceError> {
        let Ok(expected) = hex::decode(stored_hash) else {
            return Ok(false);
        };
        Ok(self
            .mac(user_id, purpose, code.trim())?
            .verify_slice(&expected)
            .is_ok())
    }
}

fn generate_code() -> OneTimeCode {
    let upper = 10u32.pow(CODE_DIGITS);
    let n = rand::thread_rng().gen_range(0..upper);
    OneTimeCode::new(format!("{:0width$}", n, width = CODE_DIGITS as usize))
}
