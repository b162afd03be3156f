//! Durable token store backed by the `pending_registrations` table.

use serde_json::Value;
use sqlx::{PgExecutor, PgPool, Postgres, Row, Transaction, postgres::PgRow, types::Json};
use std::time::Duration;
use tracing::{Instrument, debug};

use super::{
    MAX_TOKEN_ATTEMPTS, MAX_TOKEN_TTL, Payload, PendingRegistration, ReissueOutcome, TokenError,
    generate_token, hash_token, is_unique_violation, token_key,
};

#[derive(Debug, Clone)]
pub struct PgTokenStore {
    pool: PgPool,
    ttl: Duration,
}

impl PgTokenStore {
    #[must_use]
    pub fn new(pool: PgPool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// TTLs past `MAX_TOKEN_TTL` are refused before they reach interval arithmetic.
    fn ttl_seconds(&self) -> Result<i64, TokenError> {
        if self.ttl > MAX_TOKEN_TTL {
            return Err(TokenError::TtlOutOfRange);
        }
        i64::try_from(self.ttl.as_secs()).map_err(|_| TokenError::TtlOutOfRange)
    }

    /// # Errors
    /// `Storage` on database failures, `Collision` if every generated token
    /// clashed with a stored one.
    pub async fn issue(&self, email: &str, payload: Payload) -> Result<String, TokenError> {
        // The upsert on email drops any earlier token for the same address.
        let query = r"
            INSERT INTO pending_registrations
                (token_hash, email, payload, issued_at, expires_at)
            VALUES ($1, $2, $3, NOW(), NOW() + ($4 * INTERVAL '1 second'))
            ON CONFLICT (email) DO UPDATE
            SET token_hash = EXCLUDED.token_hash,
                payload = EXCLUDED.payload,
                issued_at = EXCLUDED.issued_at,
                expires_at = EXCLUDED.expires_at
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let payload = Json(payload);
        let ttl_seconds = self.ttl_seconds()?;

        for _ in 0..MAX_TOKEN_ATTEMPTS {
            let token = generate_token()?;
            let token_hash = hash_token(&token);
            let result = sqlx::query(query)
                .bind(&token_hash[..])
                .bind(email)
                .bind(&payload)
                .bind(ttl_seconds)
                .execute(&self.pool)
                .instrument(span.clone())
                .await;

            match result {
                Ok(_) => return Ok(token),
                Err(err) if is_unique_violation(&err) => {}
                Err(err) => return Err(err.into()),
            }
        }

        Err(TokenError::Collision)
    }

    /// # Errors
    /// `NotFound`/`Expired` when the token cannot be used, `Storage` on
    /// database failures, `Payload` if the stored row is malformed.
    pub async fn consume(&self, token: &str) -> Result<PendingRegistration, TokenError> {
        consume_with(&self.pool, token).await
    }

    /// Consume as part of the caller's transaction. The row is only gone once
    /// `tx` commits; a rollback leaves the link usable.
    ///
    /// # Errors
    /// Same as [`PgTokenStore::consume`].
    pub async fn consume_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        token: &str,
    ) -> Result<PendingRegistration, TokenError> {
        consume_with(&mut **tx, token).await
    }

    /// # Errors
    /// `Storage` on database failures.
    pub async fn reissue(
        &self,
        email: &str,
        cooldown: Duration,
    ) -> Result<ReissueOutcome, TokenError> {
        let ttl_seconds = self.ttl_seconds()?;
        let mut tx = self.pool.begin().await?;

        let query = r"
            SELECT expires_at >= NOW() AS live,
                   issued_at > NOW() - ($2 * INTERVAL '1 second') AS cooling_down
            FROM pending_registrations
            WHERE email = $1
            FOR UPDATE
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let cooldown_seconds = i64::try_from(cooldown.min(MAX_TOKEN_TTL).as_secs()).unwrap_or_default();
        let row = sqlx::query(query)
            .bind(email)
            .bind(cooldown_seconds)
            .fetch_optional(&mut *tx)
            .instrument(span)
            .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(ReissueOutcome::NoPending);
        };

        let live: bool = row.try_get("live")?;
        if !live {
            let query = "DELETE FROM pending_registrations WHERE email = $1";
            let span = tracing::info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "DELETE",
                db.statement = query
            );
            sqlx::query(query)
                .bind(email)
                .execute(&mut *tx)
                .instrument(span)
                .await?;
            tx.commit().await?;
            return Ok(ReissueOutcome::NoPending);
        }

        let cooling_down: bool = row.try_get("cooling_down")?;
        if cooling_down {
            tx.commit().await?;
            return Ok(ReissueOutcome::Cooldown);
        }

        // The payload stays, only the token and its window move.
        let token = generate_token()?;
        let token_hash = hash_token(&token);

        let query = r"
            UPDATE pending_registrations
            SET token_hash = $2,
                issued_at = NOW(),
                expires_at = NOW() + ($3 * INTERVAL '1 second')
            WHERE email = $1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(email)
            .bind(&token_hash[..])
            .bind(ttl_seconds)
            .execute(&mut *tx)
            .instrument(span)
            .await;

        match result {
            Ok(_) => {
                tx.commit().await?;
                Ok(ReissueOutcome::Reissued(token))
            }
            Err(err) if is_unique_violation(&err) => {
                let _ = tx.rollback().await;
                Err(TokenError::Collision)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn sweep_expired(&self) -> Result<usize, TokenError> {
        let query = "DELETE FROM pending_registrations WHERE expires_at < NOW()";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .execute(&self.pool)
            .instrument(span)
            .await?;

        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }

    /// # Errors
    /// Returns an error if the count fails.
    pub async fn len(&self) -> Result<usize, TokenError> {
        let query = "SELECT COUNT(*) AS total FROM pending_registrations";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .fetch_one(&self.pool)
            .instrument(span)
            .await?;
        let total: i64 = row.try_get("total")?;

        Ok(usize::try_from(total).unwrap_or_default())
    }
}

async fn consume_with<'e, E>(executor: E, token: &str) -> Result<PendingRegistration, TokenError>
where
    E: PgExecutor<'e>,
{
    let token_hash = token_key(token).ok_or(TokenError::NotFound)?;

    // One statement: concurrent callers race on the row lock and only one
    // of them gets it back.
    let query = r"
        DELETE FROM pending_registrations
        WHERE token_hash = $1
        RETURNING email, payload, expires_at >= NOW() AS live
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(&token_hash[..])
        .fetch_optional(executor)
        .instrument(span)
        .await?
        .ok_or(TokenError::NotFound)?;

    let email: String = row.try_get("email")?;
    let live: bool = row.try_get("live")?;
    if !live {
        debug!(email = %email, "discarding expired verification token");
        return Err(TokenError::Expired);
    }

    Ok(PendingRegistration {
        email,
        payload: payload_from_row(&row)?,
    })
}

fn payload_from_row(row: &PgRow) -> Result<Payload, TokenError> {
    let Json(value): Json<Value> = row.try_get("payload")?;
    payload_from_value(value)
}

fn payload_from_value(value: Value) -> Result<Payload, TokenError> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(TokenError::Payload),
    }
}
