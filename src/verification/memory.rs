//! Process-local token store.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{
    MAX_TOKEN_ATTEMPTS, Payload, PendingRegistration, ReissueOutcome, TokenError, TokenKey,
    generate_token, hash_token, token_key,
};

#[derive(Debug)]
struct Entry {
    email: String,
    payload: Payload,
    issued_at: Instant,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Default)]
struct Entries {
    by_key: HashMap<TokenKey, Entry>,
    // Live token per email, used to supersede and reissue.
    by_email: HashMap<String, TokenKey>,
}

impl Entries {
    fn remove(&mut self, key: &TokenKey) -> Option<Entry> {
        let entry = self.by_key.remove(key)?;
        if self.by_email.get(&entry.email) == Some(key) {
            self.by_email.remove(&entry.email);
        }
        Some(entry)
    }

    /// Insert under a fresh token, replacing whatever the email pointed to.
    /// The previous token is only dropped once the new one is ready.
    fn insert_fresh(
        &mut self,
        email: &str,
        payload: Payload,
        ttl: Duration,
    ) -> Result<String, TokenError> {
        let (token, key) = self.unused_token()?;

        let now = Instant::now();
        let expires_at = now.checked_add(ttl).ok_or(TokenError::TtlOutOfRange)?;

        if let Some(previous) = self.by_email.get(email).copied() {
            self.remove(&previous);
        }

        self.by_key.insert(
            key,
            Entry {
                email: email.to_string(),
                payload,
                issued_at: now,
                expires_at,
            },
        );
        self.by_email.insert(email.to_string(), key);
        Ok(token)
    }

    fn unused_token(&self) -> Result<(String, TokenKey), TokenError> {
        for _ in 0..MAX_TOKEN_ATTEMPTS {
            let token = generate_token()?;
            let key = hash_token(&token);
            if !self.by_key.contains_key(&key) {
                return Ok((token, key));
            }
        }

        Err(TokenError::Collision)
    }
}

/// Token store kept in memory; all operations go through one lock so a
/// lookup and its delete can never interleave with another caller.
#[derive(Debug)]
pub struct MemoryTokenStore {
    ttl: Duration,
    entries: Mutex<Entries>,
}

impl MemoryTokenStore {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(Entries::default()),
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// # Errors
    /// Returns an error if the OS random source fails or the TTL cannot be
    /// added to the current time.
    pub async fn issue(&self, email: &str, payload: Payload) -> Result<String, TokenError> {
        let mut entries = self.entries.lock().await;
        entries.insert_fresh(email, payload, self.ttl)
    }

    /// # Errors
    /// `NotFound` for unknown tokens, `Expired` for tokens past their expiry.
    pub async fn consume(&self, token: &str) -> Result<PendingRegistration, TokenError> {
        let key = token_key(token).ok_or(TokenError::NotFound)?;

        let mut entries = self.entries.lock().await;
        let entry = entries.remove(&key).ok_or(TokenError::NotFound)?;
        drop(entries);

        if entry.is_expired(Instant::now()) {
            debug!(email = %entry.email, "discarding expired verification token");
            return Err(TokenError::Expired);
        }

        Ok(PendingRegistration {
            email: entry.email,
            payload: entry.payload,
        })
    }

    /// # Errors
    /// Returns an error if the OS random source fails.
    pub async fn reissue(
        &self,
        email: &str,
        cooldown: Duration,
    ) -> Result<ReissueOutcome, TokenError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        let Some(key) = entries.by_email.get(email).copied() else {
            return Ok(ReissueOutcome::NoPending);
        };
        let Some(entry) = entries.by_key.get(&key) else {
            entries.by_email.remove(email);
            return Ok(ReissueOutcome::NoPending);
        };

        if entry.is_expired(now) {
            entries.remove(&key);
            return Ok(ReissueOutcome::NoPending);
        }

        if now.duration_since(entry.issued_at) < cooldown {
            return Ok(ReissueOutcome::Cooldown);
        }

        let payload = entry.payload.clone();
        let token = entries.insert_fresh(email, payload, self.ttl)?;
        Ok(ReissueOutcome::Reissued(token))
    }

    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.by_key.len();
        entries.by_key.retain(|_, entry| entry.expires_at >= now);
        let Entries { by_key, by_email } = &mut *entries;
        by_email.retain(|_, key| by_key.contains_key(key));
        before - by_key.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.by_key.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use serde_json::json;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(30 * 60);

    fn payload(name: &str) -> Payload {
        let mut payload = Payload::new();
        payload.insert("nombre".to_string(), json!(name));
        payload
    }

    #[tokio::test]
    async fn issue_then_consume_returns_payload() -> Result<()> {
        let store = MemoryTokenStore::new(TTL);
        let token = store.issue("alice@example.com", payload("Alice")).await?;

        let pending = store.consume(&token).await?;
        assert_eq!(pending.email, "alice@example.com");
        assert_eq!(pending.payload, payload("Alice"));

        assert!(matches!(
            store.consume(&token).await,
            Err(TokenError::NotFound)
        ));
        assert_eq!(store.len().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn unrepresentable_ttl_is_an_error() {
        let store = MemoryTokenStore::new(Duration::MAX);
        assert!(matches!(
            store.issue("alice@example.com", payload("Alice")).await,
            Err(TokenError::TtlOutOfRange)
        ));
        assert_eq!(store.len().await, 0);
    }

    #[test]
    fn failed_insert_keeps_previous_token() -> Result<()> {
        let mut entries = Entries::default();
        let first = entries.insert_fresh("alice@example.com", payload("Alice"), TTL)?;

        let second = entries.insert_fresh("alice@example.com", payload("Alice 2"), Duration::MAX);
        assert!(matches!(second, Err(TokenError::TtlOutOfRange)));

        let key = hash_token(&first);
        assert_eq!(entries.by_email.get("alice@example.com"), Some(&key));
        assert_eq!(
            entries.by_key.get(&key).map(|entry| entry.payload.clone()),
            Some(payload("Alice"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn consume_unknown_or_blank_token() {
        let store = MemoryTokenStore::new(TTL);
        assert!(matches!(
            store.consume("nope").await,
            Err(TokenError::NotFound)
        ));
        assert!(matches!(store.consume("  ").await, Err(TokenError::NotFound)));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_boundary() -> Result<()> {
        let store = MemoryTokenStore::new(TTL);

        let early = store.issue("early@example.com", payload("Early")).await?;
        let late = store.issue("late@example.com", payload("Late")).await?;

        tokio::time::advance(TTL - Duration::from_secs(1)).await;
        assert!(store.consume(&early).await.is_ok());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(matches!(
            store.consume(&late).await,
            Err(TokenError::Expired)
        ));
        // The expired entry is purged on lookup.
        assert!(matches!(
            store.consume(&late).await,
            Err(TokenError::NotFound)
        ));
        assert_eq!(store.len().await, 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_expired_entries() -> Result<()> {
        let store = MemoryTokenStore::new(TTL);
        store.issue("old@example.com", payload("Old")).await?;

        tokio::time::advance(Duration::from_secs(20 * 60)).await;
        let fresh = store.issue("fresh@example.com", payload("Fresh")).await?;

        assert_eq!(store.sweep_expired().await, 0);
        assert_eq!(store.len().await, 2);

        tokio::time::advance(Duration::from_secs(11 * 60)).await;
        assert_eq!(store.sweep_expired().await, 1);
        assert_eq!(store.len().await, 1);
        assert!(store.consume(&fresh).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn issuing_again_supersedes_previous_token() -> Result<()> {
        let store = MemoryTokenStore::new(TTL);
        let first = store.issue("alice@example.com", payload("Alice")).await?;
        let second = store.issue("alice@example.com", payload("Alicia")).await?;

        assert_ne!(first, second);
        assert_eq!(store.len().await, 1);
        assert!(matches!(
            store.consume(&first).await,
            Err(TokenError::NotFound)
        ));
        assert_eq!(store.consume(&second).await?.payload, payload("Alicia"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn reissue_respects_cooldown_and_keeps_payload() -> Result<()> {
        let store = MemoryTokenStore::new(TTL);
        let cooldown = Duration::from_secs(60);
        let first = store.issue("alice@example.com", payload("Alice")).await?;

        assert_eq!(
            store.reissue("alice@example.com", cooldown).await?,
            ReissueOutcome::Cooldown
        );

        tokio::time::advance(Duration::from_secs(61)).await;
        let ReissueOutcome::Reissued(second) = store.reissue("alice@example.com", cooldown).await?
        else {
            anyhow::bail!("expected a reissued token");
        };

        assert!(matches!(
            store.consume(&first).await,
            Err(TokenError::NotFound)
        ));
        assert_eq!(store.consume(&second).await?.payload, payload("Alice"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn reissue_without_live_token() -> Result<()> {
        let store = MemoryTokenStore::new(TTL);
        assert_eq!(
            store.reissue("ghost@example.com", Duration::ZERO).await?,
            ReissueOutcome::NoPending
        );

        store.issue("alice@example.com", payload("Alice")).await?;
        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        assert_eq!(
            store.reissue("alice@example.com", Duration::ZERO).await?,
            ReissueOutcome::NoPending
        );
        assert_eq!(store.len().await, 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_consume_has_exactly_one_winner() -> Result<()> {
        let store = Arc::new(MemoryTokenStore::new(TTL));
        let token = store.issue("race@example.com", payload("Race")).await?;

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            let token = token.clone();
            handles.push(tokio::spawn(async move { store.consume(&token).await }));
        }

        let mut winners = 0;
        let mut losers = 0;
        for handle in handles {
            match handle.await? {
                Ok(_) => winners += 1,
                Err(TokenError::NotFound) => losers += 1,
                Err(err) => anyhow::bail!("unexpected error: {err}"),
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(losers, 31);
        Ok(())
    }
}
