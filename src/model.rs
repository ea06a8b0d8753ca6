use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub type PersonId = u64;
pub type RoomId = u64;
pub type ArticleId = u64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Like `new`, but returns `None` for empty or inverted windows.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// `[s1,e1)` and `[s2,e2)` overlap iff `s1 < e2 && s2 < e1`. Touching ends do not.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Identity of a bookable resource. Ordering doubles as the lock order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ResourceKey {
    Room(RoomId),
    Article(ArticleId),
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKey::Room(id) => write!(f, "room {id}"),
            ResourceKey::Article(id) => write!(f, "article {id}"),
        }
    }
}

/// What a reservation holds. A reservation is for a room or for an article, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Booking {
    /// Exclusive use of a room, optionally bundling article units (article id → quantity).
    Room {
        room_id: RoomId,
        attachments: BTreeMap<ArticleId, u32>,
    },
    /// Units taken directly from an article's pool.
    Article { article_id: ArticleId, units: u32 },
}

impl Booking {
    pub fn resource_key(&self) -> ResourceKey {
        match self {
            Booking::Room { room_id, .. } => ResourceKey::Room(*room_id),
            Booking::Article { article_id, .. } => ResourceKey::Article(*article_id),
        }
    }

    pub fn attachments(&self) -> Option<&BTreeMap<ArticleId, u32>> {
        match self {
            Booking::Room { attachments, .. } => Some(attachments),
            Booking::Article { .. } => None,
        }
    }
}

/// Derived from `now` against the window; never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Upcoming,
    Active,
    Past,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub person_id: PersonId,
    pub span: Span,
    pub booking: Booking,
}

impl Reservation {
    /// Every ledger row this reservation contributes, keyed by the resource it consumes.
    pub fn commitments(&self) -> Vec<(ResourceKey, Commitment)> {
        let row = |units, source| Commitment {
            reservation_id: self.id,
            span: self.span,
            units,
            source,
        };
        match &self.booking {
            Booking::Room {
                room_id,
                attachments,
            } => {
                let mut out = Vec::with_capacity(1 + attachments.len());
                out.push((ResourceKey::Room(*room_id), row(1, CommitmentSource::Room)));
                for (&article_id, &quantity) in attachments {
                    out.push((
                        ResourceKey::Article(article_id),
                        row(quantity, CommitmentSource::Attached),
                    ));
                }
                out
            }
            Booking::Article { article_id, units } => {
                vec![(
                    ResourceKey::Article(*article_id),
                    row(*units, CommitmentSource::Direct),
                )]
            }
        }
    }

    pub fn resource_keys(&self) -> Vec<ResourceKey> {
        self.commitments().into_iter().map(|(key, _)| key).collect()
    }

    pub fn phase(&self, now: Ms) -> Phase {
        if now < self.span.start {
            Phase::Upcoming
        } else if now < self.span.end {
            Phase::Active
        } else {
            Phase::Past
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitmentSource {
    Room,
    Direct,
    Attached,
}

/// One row of a resource ledger. A reservation owns at most one row per resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commitment {
    pub reservation_id: Ulid,
    pub span: Span,
    pub units: u32,
    pub source: CommitmentSource,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachMode {
    /// Increase the attached quantity, creating the attachment if absent.
    #[default]
    Add,
    /// Set the attached quantity to exactly the requested amount.
    Replace,
}

// ── Requests ─────────────────────────────────────────────────────

/// Unvalidated booking request. Room and article are both optional here so that
/// "both" and "neither" can be rejected with a proper error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub person_id: PersonId,
    pub start: Ms,
    pub end: Ms,
    #[serde(default)]
    pub room_id: Option<RoomId>,
    #[serde(default)]
    pub article_id: Option<ArticleId>,
    /// Units of a direct article booking; 1 when absent.
    #[serde(default)]
    pub units: Option<u32>,
}

/// Partial update. Setting `room_id` turns the reservation into a room booking,
/// setting `article_id` into an article booking; setting both is rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationChanges {
    #[serde(default)]
    pub person_id: Option<PersonId>,
    #[serde(default)]
    pub start: Option<Ms>,
    #[serde(default)]
    pub end: Option<Ms>,
    #[serde(default)]
    pub room_id: Option<RoomId>,
    #[serde(default)]
    pub article_id: Option<ArticleId>,
    #[serde(default)]
    pub units: Option<u32>,
}

/// Filter for listing reservations. `from`/`to` select reservations starting at or
/// after `from` and ending at or before `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationQuery {
    #[serde(default)]
    pub person_id: Option<PersonId>,
    #[serde(default)]
    pub room_id: Option<RoomId>,
    #[serde(default)]
    pub article_id: Option<ArticleId>,
    #[serde(default)]
    pub from: Option<Ms>,
    #[serde(default)]
    pub to: Option<Ms>,
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

impl Default for ReservationQuery {
    fn default() -> Self {
        Self {
            person_id: None,
            room_id: None,
            article_id: None,
            from: None,
            to: None,
            skip: 0,
            limit: default_limit(),
        }
    }
}

impl ReservationQuery {
    pub fn matches(&self, r: &Reservation) -> bool {
        if self.person_id.is_some_and(|p| p != r.person_id) {
            return false;
        }
        if let Some(room) = self.room_id
            && !matches!(r.booking, Booking::Room { room_id, .. } if room_id == room)
        {
            return false;
        }
        if let Some(article) = self.article_id
            && !matches!(r.booking, Booking::Article { article_id, .. } if article_id == article)
        {
            return false;
        }
        if self.from.is_some_and(|from| r.span.start < from) {
            return false;
        }
        if self.to.is_some_and(|to| r.span.end > to) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentInfo {
    pub reservation_id: Ulid,
    pub article_id: ArticleId,
    pub quantity: u32,
}

/// WAL record format. Flat, no nesting beyond the reservation itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationUpdated {
        reservation: Reservation,
    },
    ReservationDeleted {
        id: Ulid,
    },
    ArticleAttached {
        reservation_id: Ulid,
        article_id: ArticleId,
        quantity: u32,
    },
    ArticleDetached {
        reservation_id: Ulid,
        article_id: ArticleId,
    },
}

impl Event {
    pub fn reservation_id(&self) -> Ulid {
        match self {
            Event::ReservationCreated { reservation } | Event::ReservationUpdated { reservation } => {
                reservation.id
            }
            Event::ReservationDeleted { id } => *id,
            Event::ArticleAttached { reservation_id, .. }
            | Event::ArticleDetached { reservation_id, .. } => *reservation_id,
        }
    }
}
