//! Signed change notifications from the replica side.
//!
//! The replica calls `POST /webhook` after a write. The body names the
//! changed entity type and when it changed, signed with a shared secret:
//!
//! ```text
//! signature = hex(HMAC-SHA256(secret, "{entityType}.{changedAt}"))
//! ```
//!
//! `changedAt` is an RFC 3339 timestamp and must lie within the configured
//! skew of the server clock, so a captured notification cannot be replayed
//! later.

use crate::error::{ServerError, ServerResult};
use chrono::{DateTime, Utc};
use edgesync_protocol::EntityType;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::time::Duration;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Webhook verification settings.
#[derive(Clone)]
pub struct WebhookConfig {
    /// Shared HMAC secret.
    pub secret: Zeroizing<Vec<u8>>,
    /// Largest accepted distance between `changedAt` and now.
    pub max_skew: Duration,
}

impl WebhookConfig {
    /// Creates a configuration with the default five minute skew.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: Zeroizing::new(secret.into()),
            max_skew: Duration::from_secs(5 * 60),
        }
    }

    /// Sets the accepted clock skew.
    pub fn with_max_skew(mut self, skew: Duration) -> Self {
        self.max_skew = skew;
        self
    }
}

impl fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("secret", &"[REDACTED]")
            .field("max_skew", &self.max_skew)
            .finish()
    }
}

/// Body of a webhook call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookNotification {
    /// Entity type that changed, by wire name.
    pub entity_type: String,
    /// When the change happened, RFC 3339.
    pub changed_at: String,
    /// Lowercase hex HMAC-SHA256.
    pub signature: String,
}

/// Verifies webhook signatures.
#[derive(Clone)]
pub struct WebhookVerifier {
    keyed: HmacSha256,
    max_skew: Duration,
}

impl WebhookVerifier {
    /// Creates a verifier.
    pub fn new(config: WebhookConfig) -> ServerResult<Self> {
        let keyed = HmacSha256::new_from_slice(&config.secret)
            .map_err(|e| ServerError::Internal(format!("webhook key: {e}")))?;
        Ok(Self {
            keyed,
            max_skew: config.max_skew,
        })
    }

    /// Signs a notification the way the replica does.
    pub fn sign(&self, entity_type: &str, changed_at: &str) -> String {
        hex::encode(self.mac(entity_type, changed_at).finalize().into_bytes())
    }

    /// Builds a signed notification for `entity_type` changed at `changed_at`.
    pub fn notification(
        &self,
        entity_type: EntityType,
        changed_at: DateTime<Utc>,
    ) -> WebhookNotification {
        let changed_at = changed_at.to_rfc3339();
        WebhookNotification {
            signature: self.sign(entity_type.as_str(), &changed_at),
            entity_type: entity_type.as_str().to_string(),
            changed_at,
        }
    }

    /// Checks a notification and returns the entity type it names.
    ///
    /// The signature is checked first and in constant time; nothing about the
    /// body is trusted before it passes.
    pub fn verify(
        &self,
        notification: &WebhookNotification,
        now: DateTime<Utc>,
    ) -> ServerResult<EntityType> {
        let signature = hex::decode(notification.signature.trim())
            .map_err(|_| ServerError::AuthenticationFailed("malformed signature".into()))?;
        self.mac(&notification.entity_type, &notification.changed_at)
            .verify_slice(&signature)
            .map_err(|_| ServerError::AuthenticationFailed("invalid signature".into()))?;

        let changed_at = DateTime::parse_from_rfc3339(&notification.changed_at)
            .map_err(|_| ServerError::AuthenticationFailed("malformed changedAt".into()))?
            .with_timezone(&Utc);
        let skew_ms = (now - changed_at).num_milliseconds().unsigned_abs();
        if u128::from(skew_ms) > self.max_skew.as_millis() {
            return Err(ServerError::AuthenticationFailed(format!(
                "changedAt {} is outside the accepted window",
                notification.changed_at
            )));
        }

        Ok(notification.entity_type.parse()?)
    }

    fn mac(&self, entity_type: &str, changed_at: &str) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(entity_type.as_bytes());
        mac.update(b".");
        mac.update(changed_at.as_bytes());
        mac
    }
}

impl fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("max_skew", &self.max_skew)
            .finish_non_exhaustive()
    }
}
