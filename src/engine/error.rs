use std::fmt;

use ulid::Ulid;

use crate::model::{ArticleId, Ms, PersonId, ResourceKey, RoomId};
use crate::registry::RegistryError;

/// Something a request referred to that does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Person(PersonId),
    Room(RoomId),
    Article(ArticleId),
    Reservation(Ulid),
    Attachment {
        reservation_id: Ulid,
        article_id: ArticleId,
    },
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Person(id) => write!(f, "person {id}"),
            Entity::Room(id) => write!(f, "room {id}"),
            Entity::Article(id) => write!(f, "article {id}"),
            Entity::Reservation(id) => write!(f, "reservation {id}"),
            Entity::Attachment {
                reservation_id,
                article_id,
            } => write!(f, "article {article_id} on reservation {reservation_id}"),
        }
    }
}

impl From<ResourceKey> for Entity {
    fn from(key: ResourceKey) -> Self {
        match key {
            ResourceKey::Room(id) => Entity::Room(id),
            ResourceKey::Article(id) => Entity::Article(id),
        }
    }
}

/// Numbers behind a capacity rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shortfall {
    pub resource: ResourceKey,
    /// Rooms have capacity 1.
    pub capacity: u32,
    /// Already held by other reservations over the window.
    pub committed: u32,
    pub requested: u32,
}

impl Shortfall {
    /// Units missing for the request to fit.
    pub fn missing(&self) -> u32 {
        (self.committed + self.requested).saturating_sub(self.capacity)
    }
}

impl fmt::Display for Shortfall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} of {} committed, {} requested, short by {}",
            self.resource,
            self.committed,
            self.capacity,
            self.requested,
            self.missing()
        )
    }
}

/// Why a resource cannot be booked regardless of capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unavailable {
    /// The registry marks the resource as not bookable.
    Disabled(ResourceKey),
    /// The registry could not be reached.
    Registry(RegistryError),
}

impl fmt::Display for Unavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unavailable::Disabled(key) => write!(f, "{key} is not available for reservations"),
            Unavailable::Registry(e) => write!(f, "service unavailable: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Entity),
    #[error("invalid request: {0}")]
    Validation(&'static str),
    #[error("reservation starts at {start}, before the earliest accepted start {cutoff}")]
    PastWindowRejected { start: Ms, cutoff: Ms },
    #[error("{0}")]
    ResourceUnavailable(Unavailable),
    #[error("capacity exceeded on {0}")]
    CapacityExceeded(Shortfall),
    #[error("reservation {0} was modified concurrently; retry")]
    ConcurrentConflict(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl From<RegistryError> for EngineError {
    fn from(e: RegistryError) -> Self {
        EngineError::ResourceUnavailable(Unavailable::Registry(e))
    }
}

/// Error kinds as exposed to callers and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Validation,
    PastWindowRejected,
    ResourceUnavailable,
    CapacityExceeded,
    ConcurrentConflict,
    LimitExceeded,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation_error",
            ErrorKind::PastWindowRejected => "past_window_rejected",
            ErrorKind::ResourceUnavailable => "resource_unavailable",
            ErrorKind::CapacityExceeded => "capacity_exceeded",
            ErrorKind::ConcurrentConflict => "concurrent_conflict",
            ErrorKind::LimitExceeded => "limit_exceeded",
            ErrorKind::Storage => "storage_error",
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::PastWindowRejected { .. } => ErrorKind::PastWindowRejected,
            EngineError::ResourceUnavailable(_) => ErrorKind::ResourceUnavailable,
            EngineError::CapacityExceeded(_) => ErrorKind::CapacityExceeded,
            EngineError::ConcurrentConflict(_) => ErrorKind::ConcurrentConflict,
            EngineError::LimitExceeded(_) => ErrorKind::LimitExceeded,
            EngineError::WalError(_) => ErrorKind::Storage,
        }
    }

    /// Only a concurrent writer is worth retrying; everything else is final for the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ConcurrentConflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shortfall_message_names_missing_units() {
        let err = EngineError::CapacityExceeded(Shortfall {
            resource: ResourceKey::Article(9),
            capacity: 3,
            committed: 3,
            requested: 1,
        });
        assert_eq!(
            err.to_string(),
            "capacity exceeded on article 9: 3 of 3 committed, 1 requested, short by 1"
        );
        assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
    }

    #[test]
    fn registry_failure_maps_to_unavailable() {
        let err: EngineError = RegistryError::unavailable("remote", "timed out").into();
        assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
        assert!(err.to_string().starts_with("service unavailable"));
    }

    #[test]
    fn only_conflicts_retry() {
        assert!(EngineError::ConcurrentConflict(Ulid::new()).is_retryable());
        assert!(!EngineError::Validation("x").is_retryable());
        assert!(!EngineError::NotFound(Entity::Room(1)).is_retryable());
    }
}
