//! Email outbox worker and delivery abstractions.
//!
//! Registration and contact flows enqueue rows in `email_outbox` with status
//! `pending` (template name + JSON payload). A background task polls that table,
//! locks a batch via `FOR UPDATE SKIP LOCKED`, renders each row and hands it to
//! an [`EmailSender`] on the blocking pool. The row is then marked `sent`,
//! rescheduled with exponential backoff and jitter, or marked `failed` once
//! `max_attempts` is reached.
//!
//! Enqueueing is a plain insert, so it can join the caller's transaction
//! (contacts) or stand alone (verification links). A relay outage never
//! fails the request that produced the email.
//!
//! Without SMTP credentials the server uses [`LogEmailSender`], which only logs.

mod smtp;
pub mod templates;

pub use smtp::{SmtpConfig, SmtpEmailSender};

use anyhow::{Context, Result};
use rand::Rng;
use serde_json::Value;
use sqlx::{PgExecutor, PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmailMessage {
    pub to_email: String,
    pub subject: String,
    pub text: String,
    pub html: String,
    pub reply_to: Option<String>,
}

impl EmailMessage {
    /// Render an outbox row into a deliverable message.
    ///
    /// # Errors
    /// Returns an error if the template is unknown or the payload incomplete.
    pub fn from_outbox(to_email: String, template: &str, payload_json: &str) -> Result<Self> {
        let rendered = templates::render(template, payload_json)?;
        Ok(Self {
            to_email,
            subject: rendered.subject,
            text: rendered.text,
            html: rendered.html,
            reply_to: rendered.reply_to,
        })
    }
}

/// Email delivery abstraction used by the outbox worker.
///
/// Implementations may block; the worker calls them on the blocking pool.
pub trait EmailSender: Send + Sync {
    /// Deliver a message or return an error to schedule a retry.
    fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Local dev sender that logs the message instead of sending real email.
#[derive(Clone, Debug)]
pub struct LogEmailSender;

impl EmailSender for LogEmailSender {
    fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            to_email = %message.to_email,
            subject = %message.subject,
            reply_to = ?message.reply_to,
            body = %message.text,
            "email outbox send stub"
        );
        Ok(())
    }
}

/// Queue an email for the outbox worker.
///
/// # Errors
/// Returns an error if the payload cannot be serialized or the insert fails.
pub async fn enqueue<'e, E>(
    executor: E,
    to_email: &str,
    template: &str,
    payload: &Value,
) -> Result<()>
where
    E: PgExecutor<'e>,
{
    let payload_text = serde_json::to_string(payload).context("failed to serialize email payload")?;

    let query = r"
        INSERT INTO email_outbox (to_email, template, payload_json)
        VALUES ($1, $2, $3::jsonb)
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(to_email)
        .bind(template)
        .bind(payload_text)
        .execute(executor)
        .instrument(span)
        .await
        .context("failed to insert email outbox row")?;

    Ok(())
}

#[derive(Clone, Copy, Debug)]
pub struct EmailWorkerConfig {
    poll_interval: Duration,
    batch_size: usize,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl EmailWorkerConfig {
    /// Default worker config: 5s poll interval, 10 messages per batch,
    /// 5 max attempts, and 5s->5m exponential backoff with jitter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            max_attempts: 5,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
        }
    }

    #[must_use]
    pub fn with_poll_interval_seconds(mut self, seconds: u64) -> Self {
        self.poll_interval = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_backoff_base_seconds(mut self, seconds: u64) -> Self {
        self.backoff_base = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_backoff_max_seconds(mut self, seconds: u64) -> Self {
        self.backoff_max = Duration::from_secs(seconds);
        self
    }

    /// Clamp zero values so the worker can neither spin nor stall.
    #[must_use]
    pub fn normalize(self) -> Self {
        let poll_interval = if self.poll_interval.is_zero() {
            Duration::from_secs(1)
        } else {
            self.poll_interval
        };
        let backoff_base = if self.backoff_base.is_zero() {
            Duration::from_secs(1)
        } else {
            self.backoff_base
        };
        Self {
            poll_interval,
            batch_size: self.batch_size.max(1),
            max_attempts: self.max_attempts.max(1),
            backoff_base,
            backoff_max: self.backoff_max.max(backoff_base),
        }
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn backoff_base(&self) -> Duration {
        self.backoff_base
    }

    #[must_use]
    pub fn backoff_max(&self) -> Duration {
        self.backoff_max
    }
}

impl Default for EmailWorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a background task that polls and processes the email outbox.
pub fn spawn_outbox_worker(
    pool: PgPool,
    sender: Arc<dyn EmailSender>,
    config: EmailWorkerConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let config = config.normalize();
        let poll_interval = config.poll_interval();

        loop {
            if let Err(err) = process_outbox_batch(&pool, &sender, &config).await {
                error!("email outbox batch failed: {err:#}");
            }

            sleep(poll_interval).await;
        }
    })
}

async fn process_outbox_batch(
    pool: &PgPool,
    sender: &Arc<dyn EmailSender>,
    config: &EmailWorkerConfig,
) -> Result<usize> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to start email outbox transaction")?;

    // Locked batch: several replicas can poll without double-sending.
    let query = r"
        SELECT id, to_email, template, payload_json::text AS payload_json, attempts
        FROM email_outbox
        WHERE status = 'pending'
          AND next_attempt_at <= NOW()
        ORDER BY next_attempt_at ASC, created_at ASC
        LIMIT $1
        FOR UPDATE SKIP LOCKED
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(i64::try_from(config.batch_size()).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .instrument(span)
        .await
        .context("failed to load email outbox batch")?;

    if rows.is_empty() {
        tx.commit()
            .await
            .context("failed to commit empty outbox batch")?;
        return Ok(0);
    }

    let row_count = rows.len();
    for row in rows {
        let id: Uuid = row.try_get("id")?;
        let attempts: i32 = row.try_get("attempts")?;
        let attempts = u32::try_from(attempts).unwrap_or(0);
        let to_email: String = row.try_get("to_email")?;
        let template: String = row.try_get("template")?;
        let payload_json: String = row.try_get("payload_json")?;

        let send_result = match EmailMessage::from_outbox(to_email, &template, &payload_json) {
            Ok(message) => deliver(Arc::clone(sender), message).await,
            Err(err) => Err(err),
        };
        if let Err(err) = &send_result {
            warn!(%id, template = %template, "email delivery failed: {err:#}");
        }
        update_outbox_status(&mut tx, id, attempts, send_result, config).await?;
    }

    tx.commit()
        .await
        .context("failed to commit email outbox batch")?;

    Ok(row_count)
}

async fn deliver(sender: Arc<dyn EmailSender>, message: EmailMessage) -> Result<()> {
    tokio::task::spawn_blocking(move || sender.send(&message))
        .await
        .context("email sender task panicked")?
}

async fn update_outbox_status(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: Uuid,
    attempts: u32,
    send_result: Result<()>,
    config: &EmailWorkerConfig,
) -> Result<()> {
    let next_attempt = attempts.saturating_add(1);
    let next_attempts_i32 = i32::try_from(next_attempt).unwrap_or(i32::MAX);

    let Err(err) = send_result else {
        let query = r"
            UPDATE email_outbox
            SET status = 'sent',
                attempts = $2,
                last_error = NULL,
                sent_at = NOW(),
                next_attempt_at = NOW()
            WHERE id = $1
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(id)
            .bind(next_attempts_i32)
            .execute(&mut **tx)
            .instrument(span)
            .await
            .context("failed to update outbox status to sent")?;
        return Ok(());
    };

    if next_attempt >= config.max_attempts() {
        let query = r"
            UPDATE email_outbox
            SET status = 'failed',
                attempts = $2,
                last_error = $3,
                next_attempt_at = NOW()
            WHERE id = $1
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(id)
            .bind(next_attempts_i32)
            .bind(format!("{err:#}"))
            .execute(&mut **tx)
            .instrument(span)
            .await
            .context("failed to update outbox status to failed")?;
        return Ok(());
    }

    let delay = backoff_delay(next_attempt, config.backoff_base(), config.backoff_max());
    let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    let query = r"
        UPDATE email_outbox
        SET status = 'pending',
            attempts = $2,
            last_error = $3,
            next_attempt_at = NOW() + ($4 * INTERVAL '1 millisecond')
        WHERE id = $1
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(id)
        .bind(next_attempts_i32)
        .bind(format!("{err:#}"))
        .bind(delay_ms)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to update outbox retry schedule")?;

    Ok(())
}

/// Exponential delay for the given attempt (1-based), capped and jittered.
fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let factor = 1u32 << shift;
    let delay = base.checked_mul(factor).unwrap_or(max).min(max);
    jitter_delay(delay)
}

/// Pick a delay in `[delay/2, delay]`.
fn jitter_delay(delay: Duration) -> Duration {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if delay_ms < 2 {
        return delay;
    }
    let half = delay_ms / 2;
    let jitter = rand::thread_rng().gen_range(0..=delay_ms - half);
    Duration::from_millis(half + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<EmailMessage>>,
    }

    impl EmailSender for RecordingSender {
        fn send(&self, message: &EmailMessage) -> Result<()> {
            self.sent
                .lock()
                .map_err(|_| anyhow::anyhow!("poisoned"))?
                .push(message.clone());
            Ok(())
        }
    }

    struct FailingSender;

    impl EmailSender for FailingSender {
        fn send(&self, _message: &EmailMessage) -> Result<()> {
            Err(anyhow::anyhow!("relay unavailable"))
        }
    }

    #[test]
    fn worker_config_defaults() {
        let config = EmailWorkerConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.batch_size(), 10);
        assert_eq!(config.max_attempts(), 5);
        assert_eq!(config.backoff_base(), Duration::from_secs(5));
        assert_eq!(config.backoff_max(), Duration::from_secs(300));
    }

    #[test]
    fn worker_config_normalize_clamps_zero_values() {
        let config = EmailWorkerConfig::new()
            .with_poll_interval_seconds(0)
            .with_batch_size(0)
            .with_max_attempts(0)
            .with_backoff_base_seconds(0)
            .with_backoff_max_seconds(0)
            .normalize();
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.batch_size(), 1);
        assert_eq!(config.max_attempts(), 1);
        assert_eq!(config.backoff_base(), Duration::from_secs(1));
        assert_eq!(config.backoff_max(), Duration::from_secs(1));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(300);
        for _ in 0..20 {
            let first = backoff_delay(1, base, max);
            assert!(first >= Duration::from_millis(2500) && first <= base);

            let third = backoff_delay(3, base, max);
            assert!(third >= Duration::from_secs(10) && third <= Duration::from_secs(20));

            let capped = backoff_delay(30, base, max);
            assert!(capped >= Duration::from_secs(150) && capped <= max);
        }
    }

    #[test]
    fn jitter_keeps_tiny_delays() {
        assert_eq!(jitter_delay(Duration::ZERO), Duration::ZERO);
        assert_eq!(jitter_delay(Duration::from_millis(1)), Duration::from_millis(1));
    }

    #[test]
    fn from_outbox_renders_template() -> Result<()> {
        let payload = json!({"nombre": "Bob"}).to_string();
        let message = EmailMessage::from_outbox(
            "bob@example.com".to_string(),
            templates::CONTACT_CONFIRMATION,
            &payload,
        )?;
        assert_eq!(message.to_email, "bob@example.com");
        assert_eq!(message.subject, "Mensaje recibido - Gracias Bob");
        Ok(())
    }

    #[test]
    fn log_sender_accepts_everything() -> Result<()> {
        let message = EmailMessage::from_outbox(
            "bob@example.com".to_string(),
            templates::CONTACT_CONFIRMATION,
            &json!({"nombre": "Bob"}).to_string(),
        )?;
        LogEmailSender.send(&message)
    }

    #[tokio::test]
    async fn deliver_runs_sender_on_blocking_pool() -> Result<()> {
        let recorder = Arc::new(RecordingSender::default());
        let message = EmailMessage {
            to_email: "alice@example.com".to_string(),
            subject: "Hola".to_string(),
            text: "texto".to_string(),
            html: "<p>html</p>".to_string(),
            reply_to: None,
        };

        deliver(recorder.clone(), message.clone()).await?;
        let sent = recorder
            .sent
            .lock()
            .map_err(|_| anyhow::anyhow!("poisoned"))?
            .clone();
        assert_eq!(sent, vec![message.clone()]);

        let err = deliver(Arc::new(FailingSender), message).await;
        assert!(err.is_err());
        Ok(())
    }
}
