use chrono::{DateTime, Utc};
use virtray_backend::{GuestListing, HypervisorConnection, SharedConnection};
use virtray_core::{EngineConfig, FetchError, GuestRecord, PowerState, Snapshot};

/// One enumeration of all guests, bounded by the fetch timeout. Pure query:
/// per-guest status strings are folded into the closed power-state enum
/// (unrecognized ones become `Unknown`); only a failed or hung enumeration
/// fails the fetch as a whole.
pub async fn fetch(
    connection: &SharedConnection,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Result<Snapshot, FetchError> {
    let listings = tokio::time::timeout(config.fetch_timeout, connection.list_guests())
        .await
        .map_err(|_| FetchError::TimedOut)?
        .map_err(FetchError::Backend)?;
    Ok(snapshot_from_listings(listings, now))
}

pub fn snapshot_from_listings(listings: Vec<GuestListing>, now: DateTime<Utc>) -> Snapshot {
    Snapshot::from_records(
        listings.into_iter().map(|listing| {
            GuestRecord::new(
                listing.id,
                listing.name,
                PowerState::from_raw_status(&listing.raw_status),
                now,
            )
        }),
        now,
    )
}
