use std::fmt;
use std::io;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    /// Background writer is gone; nothing further can be persisted.
    Closed(&'static str),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "storage I/O error: {e}"),
            StoreError::Closed(msg) => write!(f, "storage closed: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(e) => Some(e),
            StoreError::Closed(_) => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::Io(e)
    }
}

/// Persistence capability consumed by the engine and the loyalty ledger.
///
/// Every call is a bounded operation that either succeeds or reports an error;
/// implementations never retry on the caller's behalf.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn put_court(&self, court: Court) -> Result<(), StoreError>;

    async fn put_extra(&self, extra: Extra) -> Result<(), StoreError>;

    async fn load_court(&self, id: Ulid) -> Result<Option<Court>, StoreError>;

    /// Extras found for `ids`, in request order. Unknown ids are skipped.
    async fn load_extras(&self, ids: &[Ulid]) -> Result<Vec<Extra>, StoreError>;

    async fn persist_reservation(&self, reservation: &Reservation) -> Result<(), StoreError>;

    async fn load_reservation(&self, id: Ulid) -> Result<Option<Reservation>, StoreError>;

    /// Reservations whose status occupies a slot; used to rebuild the availability index.
    async fn active_reservations(&self) -> Result<Vec<Reservation>, StoreError>;

    async fn user_reservations(&self, user_id: Ulid) -> Result<Vec<Reservation>, StoreError>;

    async fn persist_loyalty(&self, record: &LoyaltyRecord) -> Result<(), StoreError>;

    async fn loyalty_accounts(&self) -> Result<Vec<LoyaltyRecord>, StoreError>;
}
