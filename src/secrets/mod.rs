//! Secret Manager: generates, rotates, and serves webhook signing
//! secrets. Secrets are stored encrypted at rest and only ever decrypted just
//! before use by the webhook handler's HMAC signer.

pub mod crypto;

use chrono::{Duration, Utc};
use rand::prelude::RngExt;
use sqlx::PgPool;

use crate::config::SecretsConfig;
use crate::db::errors::DbError;
use crate::db::handlers::Secrets as SecretsRepo;
use crate::db::models::secrets::{SecretCreateRequest, WebhookSecret};
use crate::errors::{Error, Result};
use crate::types::DestinationId;
use crypto::EncryptionKey;

/// Minimum length, in bytes, a secret (generated or bring-your-own) must meet.
const MIN_SECRET_LENGTH: usize = 32;

/// Length at or above which a secret is classified `strong` rather than `weak`.
const STRONG_SECRET_LENGTH: usize = 64;

/// A run of this many or more identical consecutive characters is rejected as
/// a trivial pattern, regardless of overall length.
const REPEATED_RUN_THRESHOLD: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretStrength {
    Weak,
    Strong,
}

#[derive(Debug, Clone)]
pub struct SecretValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub strength: SecretStrength,
}

/// A secret with its plaintext value available, for handing to the HMAC signer.
/// Never logged, never serialized.
pub struct DecryptedSecret {
    pub id: crate::types::SecretId,
    pub plaintext: String,
    pub is_primary: bool,
}

pub struct SecretManager {
    pool: PgPool,
    key: Option<EncryptionKey>,
    config: SecretsConfig,
}

impl SecretManager {
    pub fn new(pool: PgPool, config: SecretsConfig) -> Result<Self> {
        let key = config
            .encryption_key
            .as_deref()
            .map(EncryptionKey::from_hex)
            .transpose()
            .map_err(|e| Error::InvalidConfig { message: e.to_string() })?;

        if config.enabled && key.is_none() {
            return Err(Error::InvalidConfig {
                message: "secrets.enabled is true but no encryption_key is configured".into(),
            });
        }

        Ok(Self { pool, key, config })
    }

    fn key(&self) -> Result<&EncryptionKey> {
        self.key.as_ref().ok_or_else(|| Error::InvalidConfig {
            message: "secret manager has no encryption key configured".into(),
        })
    }

    /// Generate a fresh 256-bit random signing secret, encrypt it, and store it
    /// as the destination's new primary secret.
    pub async fn create_secret(&self, destination_id: DestinationId) -> Result<WebhookSecret> {
        let mut raw = [0u8; 32];
        rand::rng().fill(&mut raw);
        let plaintext = format!("whsec_{}", hex::encode(raw));
        self.store_secret(destination_id, &plaintext, true).await
    }

    /// Store a caller-supplied secret (bring-your-own-secret) as the destination's
    /// sole secret: every prior secret for the destination is deactivated first, so
    /// this never runs into the `max_active_secrets` cap `store_secret` enforces for
    /// ordinary rotation. When `rotation_managed` is `false` the installed secret gets
    /// no `expires_at`; the customer is responsible for rotating it themselves.
    pub async fn configure_byos(&self, destination_id: DestinationId, plaintext: &str, rotation_managed: bool) -> Result<WebhookSecret> {
        let validation = self.validate_secret(plaintext);
        if !validation.valid {
            return Err(Error::InvalidConfig {
                message: validation.errors.join("; "),
            });
        }

        let key = self.key()?;
        let ciphertext = key.encrypt_str(plaintext).map_err(Error::Other)?;

        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = SecretsRepo::new(&mut conn);
        repo.deactivate_all(destination_id).await?;

        let expires_at = rotation_managed.then(|| Utc::now() + Duration::days(self.config.default_overlap_period_days));

        let secret = repo
            .create(&SecretCreateRequest {
                destination_id,
                secret_ciphertext: ciphertext,
                algorithm: "hmac-sha256".to_string(),
                is_primary: true,
                expires_at,
            })
            .await?;

        Ok(secret)
    }

    /// Minimum length 32, `strong` at 64+, rejecting all-digit, all-letter, and
    /// long-repeated-run patterns regardless of length.
    pub fn validate_secret(&self, plaintext: &str) -> SecretValidation {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let len = plaintext.len();
        if len < MIN_SECRET_LENGTH {
            errors.push(format!("secret must be at least {MIN_SECRET_LENGTH} bytes, got {len}"));
        }

        if !plaintext.is_empty() && plaintext.chars().all(|c| c.is_ascii_digit()) {
            errors.push("secret must not consist entirely of digits".to_string());
        } else if !plaintext.is_empty() && plaintext.chars().all(|c| c.is_ascii_alphabetic()) {
            errors.push("secret must not consist entirely of letters".to_string());
        }

        if has_long_repeated_run(plaintext, REPEATED_RUN_THRESHOLD) {
            errors.push(format!("secret must not contain a run of {REPEATED_RUN_THRESHOLD} or more repeated characters"));
        }

        let strength = if len >= STRONG_SECRET_LENGTH { SecretStrength::Strong } else { SecretStrength::Weak };
        if strength == SecretStrength::Weak && errors.is_empty() {
            warnings.push(format!("secret is below the recommended {STRONG_SECRET_LENGTH}-byte strong threshold"));
        }

        SecretValidation {
            valid: errors.is_empty(),
            errors,
            warnings,
            strength,
        }
    }

    async fn store_secret(&self, destination_id: DestinationId, plaintext: &str, make_primary: bool) -> Result<WebhookSecret> {
        let key = self.key()?;
        let ciphertext = key.encrypt_str(plaintext).map_err(Error::Other)?;

        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = SecretsRepo::new(&mut conn);

        let active_count = repo.count_active(destination_id).await?;
        if active_count >= self.config.max_active_secrets as i64 {
            return Err(Error::InvalidConfig {
                message: format!(
                    "destination already has {active_count} active secrets (max {})",
                    self.config.max_active_secrets
                ),
            });
        }

        let secret = repo
            .create(&SecretCreateRequest {
                destination_id,
                secret_ciphertext: ciphertext,
                algorithm: "hmac-sha256".to_string(),
                is_primary: make_primary,
                expires_at: None,
            })
            .await?;

        Ok(secret)
    }

    /// Rotate with overlap: create a new primary secret, and give the
    /// outgoing primary an `expires_at` `default_overlap_period_days` out instead
    /// of deactivating it immediately, so in-flight deliveries signed with the old
    /// secret remain verifiable by the receiver during the transition.
    pub async fn rotate_secret(&self, destination_id: DestinationId, new_plaintext: Option<&str>) -> Result<WebhookSecret> {
        let key = self.key()?;
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = SecretsRepo::new(&mut conn);

        if let Some(current_primary) = repo.find_primary(destination_id).await? {
            let overlap_expiry = Utc::now() + Duration::days(self.config.default_overlap_period_days);
            sqlx::query("UPDATE delivery_webhook_secrets SET is_primary = false, expires_at = $2, rotated_at = now() WHERE id = $1")
                .bind(current_primary.id)
                .bind(overlap_expiry)
                .execute(&mut *conn)
                .await
                .map_err(DbError::from)?;
        }

        let plaintext = match new_plaintext {
            Some(p) => {
                let validation = self.validate_secret(p);
                if !validation.valid {
                    return Err(Error::InvalidConfig {
                        message: validation.errors.join("; "),
                    });
                }
                p.to_string()
            }
            None => {
                let mut raw = [0u8; 32];
                rand::rng().fill(&mut raw);
                format!("whsec_{}", hex::encode(raw))
            }
        };

        let ciphertext = key.encrypt_str(&plaintext).map_err(Error::Other)?;
        let mut repo = SecretsRepo::new(&mut conn);
        let secret = repo
            .create(&SecretCreateRequest {
                destination_id,
                secret_ciphertext: ciphertext,
                algorithm: "hmac-sha256".to_string(),
                is_primary: true,
                expires_at: None,
            })
            .await?;

        Ok(secret)
    }

    /// Decrypt every active secret for a destination, primary first, so the
    /// webhook signer can sign with the primary and a verifier-side rotation can
    /// still accept either.
    pub async fn get_active_secrets(&self, destination_id: DestinationId) -> Result<Vec<DecryptedSecret>> {
        let key = self.key()?;
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = SecretsRepo::new(&mut conn);
        let secrets = repo.find_active_by_destination(destination_id).await?;

        secrets
            .into_iter()
            .map(|s| {
                let plaintext = key.decrypt_str(&s.secret_ciphertext).map_err(Error::Other)?;
                Ok(DecryptedSecret {
                    id: s.id,
                    plaintext,
                    is_primary: s.is_primary,
                })
            })
            .collect()
    }

    /// Decrypt just the primary secret, for signing new outbound deliveries.
    pub async fn get_primary_secret(&self, destination_id: DestinationId) -> Result<Option<DecryptedSecret>> {
        let key = self.key()?;
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = SecretsRepo::new(&mut conn);

        let Some(secret) = repo.find_primary(destination_id).await? else {
            return Ok(None);
        };
        let plaintext = key.decrypt_str(&secret.secret_ciphertext).map_err(Error::Other)?;
        Ok(Some(DecryptedSecret {
            id: secret.id,
            plaintext,
            is_primary: true,
        }))
    }

    pub async fn record_usage(&self, secret_id: crate::types::SecretId) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = SecretsRepo::new(&mut conn);
        repo.record_usage(secret_id).await?;
        Ok(())
    }

    /// Deactivate every secret whose rotation overlap window has elapsed.
    pub async fn cleanup_expired_secrets(&self) -> Result<u64> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = SecretsRepo::new(&mut conn);
        let count = repo.cleanup_expired().await?;
        Ok(count)
    }
}

/// `true` iff `s` contains `threshold` or more consecutive occurrences of the
/// same character.
fn has_long_repeated_run(s: &str, threshold: usize) -> bool {
    let mut chars = s.chars();
    let Some(mut prev) = chars.next() else {
        return false;
    };
    let mut run = 1usize;
    for c in chars {
        if c == prev {
            run += 1;
            if run >= threshold {
                return true;
            }
        } else {
            run = 1;
            prev = c;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SecretManager {
        SecretManager {
            pool: sqlx::PgPool::connect_lazy("postgres://invalid/invalid").expect("lazy pool construction never fails"),
            key: None,
            config: SecretsConfig {
                enabled: false,
                encryption_key: None,
                max_active_secrets: 2,
                default_overlap_period_days: 7,
            },
        }
    }

    #[test]
    fn rejects_secrets_shorter_than_32_bytes() {
        let validation = manager().validate_secret("short");
        assert!(!validation.valid);
    }

    #[test]
    fn rejects_all_digit_secrets() {
        let validation = manager().validate_secret(&"1".repeat(40));
        assert!(!validation.valid);
    }

    #[test]
    fn rejects_all_letter_secrets() {
        let validation = manager().validate_secret(&"a".repeat(40));
        assert!(!validation.valid);
    }

    #[test]
    fn rejects_long_repeated_runs_even_when_mixed() {
        let secret = format!("{}{}", "x".repeat(10), "9".repeat(30));
        let validation = manager().validate_secret(&secret);
        assert!(!validation.valid);
    }

    #[test]
    fn accepts_and_classifies_weak_vs_strong() {
        let weak = manager().validate_secret("Tr0ub4dor&3-correct-horse-battery-x");
        assert!(weak.valid);
        assert_eq!(weak.strength, SecretStrength::Weak);

        let strong = manager().validate_secret("Tr0ub4dor-correct-horse-battery-staple-zebra-quartz-forest-mint99");
        assert!(strong.valid);
        assert_eq!(strong.strength, SecretStrength::Strong);
    }
}
