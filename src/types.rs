//! Common identifier type aliases used across the delivery subsystem.

use uuid::Uuid;

pub type OrganizationId = Uuid;
pub type DestinationId = Uuid;
pub type QueueItemId = Uuid;
pub type DeliveryId = Uuid;
pub type SecretId = Uuid;
pub type DownloadLinkId = Uuid;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces.
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}
