//! Sign-webhook command implementation.

use chrono::{DateTime, Utc};
use edgesync_protocol::EntityType;
use edgesync_server::{WebhookConfig, WebhookNotification, WebhookVerifier};

/// Prints a signed webhook body for `entity_type`.
pub fn run(
    entity_type: &str,
    changed_at: Option<&str>,
    secret: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let notification = notification(entity_type, changed_at, secret)?;
    println!("{}", serde_json::to_string_pretty(&notification)?);
    Ok(())
}

fn notification(
    entity_type: &str,
    changed_at: Option<&str>,
    secret: &str,
) -> Result<WebhookNotification, Box<dyn std::error::Error>> {
    let entity_type: EntityType = entity_type.parse()?;
    let changed_at = match changed_at {
        Some(raw) => DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc),
        None => Utc::now(),
    };
    let signer = WebhookVerifier::new(WebhookConfig::new(secret.as_bytes().to_vec()))?;
    Ok(signer.notification(entity_type, changed_at))
}
