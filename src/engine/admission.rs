//! Admission rules, split in two phases.
//!
//! The registry phase runs before any lock is taken and may await remote
//! lookups. It applies the ordered rules (active person, non-empty window,
//! past-window grace, exactly one target) and collects the registry facts the
//! capacity rules need. The ledger phase runs under the resource write locks
//! and only compares those facts against committed quantities.

use std::collections::BTreeMap;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::registry::Ports;

use super::error::{Entity, EngineError, Shortfall, Unavailable};
use super::LockSet;

/// Default grace before `now` within which a window may still start.
pub const DEFAULT_GRACE_MARGIN_MS: Ms = 30 * 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionConfig {
    /// Windows starting earlier than `now - grace_margin_ms` are rejected.
    pub grace_margin_ms: Ms,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            grace_margin_ms: DEFAULT_GRACE_MARGIN_MS,
        }
    }
}

/// A reservation as asked for, before any rule has run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Proposal {
    pub person_id: PersonId,
    pub start: Ms,
    pub end: Ms,
    pub room_id: Option<RoomId>,
    pub article_id: Option<ArticleId>,
    pub units: Option<u32>,
}

impl From<&ReservationRequest> for Proposal {
    fn from(req: &ReservationRequest) -> Self {
        Self {
            person_id: req.person_id,
            start: req.start,
            end: req.end,
            room_id: req.room_id,
            article_id: req.article_id,
            units: req.units,
        }
    }
}

impl Proposal {
    /// Overlay `changes` on an existing reservation. Attachments are not part of
    /// the proposal; the caller carries them over when the target stays a room.
    pub fn merge(current: &Reservation, changes: &ReservationChanges) -> Result<Self, EngineError> {
        if changes.room_id.is_some() && changes.article_id.is_some() {
            return Err(EngineError::Validation(
                "a reservation books either a room or an article, not both",
            ));
        }
        let mut proposal = Self {
            person_id: changes.person_id.unwrap_or(current.person_id),
            start: changes.start.unwrap_or(current.span.start),
            end: changes.end.unwrap_or(current.span.end),
            room_id: None,
            article_id: None,
            units: None,
        };

        match (&current.booking, changes.room_id, changes.article_id) {
            (_, Some(room_id), None) => proposal.room_id = Some(room_id),
            (Booking::Room { attachments, .. }, None, Some(_)) if !attachments.is_empty() => {
                return Err(EngineError::Validation(
                    "detach all articles before turning a room reservation into an article reservation",
                ));
            }
            (current_booking, None, Some(article_id)) => {
                proposal.article_id = Some(article_id);
                proposal.units = match current_booking {
                    Booking::Article { units, .. } => Some(changes.units.unwrap_or(*units)),
                    Booking::Room { .. } => changes.units,
                };
            }
            (Booking::Room { room_id, .. }, None, None) => proposal.room_id = Some(*room_id),
            (Booking::Article { article_id, units }, None, None) => {
                proposal.article_id = Some(*article_id);
                proposal.units = Some(changes.units.unwrap_or(*units));
            }
            (_, Some(_), Some(_)) => unreachable!("rejected above"),
        }
        // A unit count only makes sense for a direct article booking.
        if proposal.room_id.is_some() && changes.units.is_some() {
            return Err(EngineError::Validation("units apply only to article reservations"));
        }
        Ok(proposal)
    }
}

/// Capacity a resource must still have for the proposal to fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityCheck {
    pub key: ResourceKey,
    pub capacity: u32,
    pub requested: u32,
}

impl CapacityCheck {
    fn room(room_id: RoomId) -> Self {
        Self {
            key: ResourceKey::Room(room_id),
            capacity: 1,
            requested: 1,
        }
    }

    /// Fails with the shortfall when `committed + requested` exceeds capacity.
    pub fn against(&self, committed: u32) -> Result<(), EngineError> {
        if committed.saturating_add(self.requested) > self.capacity {
            return Err(EngineError::CapacityExceeded(Shortfall {
                resource: self.key,
                capacity: self.capacity,
                committed,
                requested: self.requested,
            }));
        }
        Ok(())
    }
}

/// Output of the registry phase: a well-formed window and target, plus the
/// capacity facts still to be checked against the ledgers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Screened {
    pub person_id: PersonId,
    pub span: Span,
    pub booking: Booking,
    pub checks: Vec<CapacityCheck>,
}

impl Screened {
    /// Ledger phase. `locks` must hold every key named by `checks`.
    pub fn settle(&self, locks: &LockSet, excluding: Option<Ulid>) -> Result<(), EngineError> {
        settle(&self.checks, &self.span, locks, excluding)
    }
}

pub fn settle(
    checks: &[CapacityCheck],
    span: &Span,
    locks: &LockSet,
    excluding: Option<Ulid>,
) -> Result<(), EngineError> {
    for check in checks {
        check.against(locks.committed(check.key, span, excluding))?;
    }
    Ok(())
}

pub struct Validator<'a> {
    ports: &'a Ports,
    config: &'a AdmissionConfig,
}

impl<'a> Validator<'a> {
    pub fn new(ports: &'a Ports, config: &'a AdmissionConfig) -> Self {
        Self { ports, config }
    }

    /// Registry phase: every rule except the capacity comparison, in order.
    pub async fn screen(&self, proposal: &Proposal) -> Result<Screened, EngineError> {
        let span = self
            .check_requester_and_window(proposal.person_id, proposal.start, proposal.end)
            .await?;

        let (booking, check) = match (proposal.room_id, proposal.article_id) {
            (Some(_), Some(_)) => {
                return Err(EngineError::Validation(
                    "a reservation books either a room or an article, not both",
                ));
            }
            (None, None) => {
                return Err(EngineError::Validation("a reservation needs a room or an article"));
            }
            (None, Some(article_id)) => {
                let units = check_units(proposal.units.unwrap_or(1))?;
                let check = self.article_check(article_id, units).await?;
                (Booking::Article { article_id, units }, check)
            }
            (Some(room_id), None) => {
                if proposal.units.is_some() {
                    return Err(EngineError::Validation("units apply only to article reservations"));
                }
                let check = self.room_check(room_id).await?;
                let booking = Booking::Room {
                    room_id,
                    attachments: BTreeMap::new(),
                };
                (booking, check)
            }
        };

        Ok(Screened {
            person_id: proposal.person_id,
            span,
            booking,
            checks: vec![check],
        })
    }

    /// Rule 1. An unknown or deactivated person is reported as not found.
    /// Rules 1 to 3: requester, window shape, grace margin.
    pub async fn check_requester_and_window(
        &self,
        person_id: PersonId,
        start: Ms,
        end: Ms,
    ) -> Result<Span, EngineError> {
        self.check_person(person_id).await?;
        let span = check_window(start, end)?;
        self.check_not_past(&span)?;
        Ok(span)
    }

    pub async fn check_person(&self, person_id: PersonId) -> Result<(), EngineError> {
        if self.ports.persons.exists_and_active(person_id).await? {
            Ok(())
        } else {
            Err(EngineError::NotFound(Entity::Person(person_id)))
        }
    }

    /// Rule 3, against the injected clock.
    pub fn check_not_past(&self, span: &Span) -> Result<(), EngineError> {
        let cutoff = self.ports.clock.now() - self.config.grace_margin_ms;
        if span.start < cutoff {
            return Err(EngineError::PastWindowRejected {
                start: span.start,
                cutoff,
            });
        }
        Ok(())
    }

    pub async fn room_check(&self, room_id: RoomId) -> Result<CapacityCheck, EngineError> {
        let room = self
            .ports
            .rooms
            .room(room_id)
            .await?
            .ok_or(EngineError::NotFound(Entity::Room(room_id)))?;
        if !room.available {
            return Err(EngineError::ResourceUnavailable(Unavailable::Disabled(
                ResourceKey::Room(room_id),
            )));
        }
        Ok(CapacityCheck::room(room_id))
    }

    pub async fn article_check(
        &self,
        article_id: ArticleId,
        requested: u32,
    ) -> Result<CapacityCheck, EngineError> {
        let article = self
            .ports
            .articles
            .article(article_id)
            .await?
            .ok_or(EngineError::NotFound(Entity::Article(article_id)))?;
        if !article.available {
            return Err(EngineError::ResourceUnavailable(Unavailable::Disabled(
                ResourceKey::Article(article_id),
            )));
        }
        Ok(CapacityCheck {
            key: ResourceKey::Article(article_id),
            capacity: article.total_quantity,
            requested,
        })
    }

    /// Checks for every article attached to a room reservation.
    pub async fn attachment_checks(
        &self,
        attachments: &BTreeMap<ArticleId, u32>,
    ) -> Result<Vec<CapacityCheck>, EngineError> {
        let mut checks = Vec::with_capacity(attachments.len());
        for (&article_id, &quantity) in attachments {
            checks.push(self.article_check(article_id, quantity).await?);
        }
        Ok(checks)
    }
}

/// Rule 2 plus the sanity bounds on timestamps and duration.
pub fn check_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = Span::try_new(start, end)
        .ok_or(EngineError::Validation("end must be after start"))?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("reservation window too long"));
    }
    Ok(span)
}

pub fn check_units(units: u32) -> Result<u32, EngineError> {
    if units == 0 {
        return Err(EngineError::Validation("quantity must be at least 1"));
    }
    if units > MAX_UNITS_PER_REQUEST {
        return Err(EngineError::LimitExceeded("quantity too large"));
    }
    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::{ArticleInfo, MemoryRegistry, RoomInfo};
    use std::sync::Arc;

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;
    const NOW: Ms = 1_800_000_000_000;

    fn ports() -> (Ports, Arc<MemoryRegistry>) {
        let registry = Arc::new(MemoryRegistry::new());
        registry.upsert_person(1, true);
        registry.upsert_person(2, false);
        registry.upsert_room(RoomInfo {
            id: 10,
            name: None,
            available: true,
        });
        registry.upsert_room(RoomInfo {
            id: 11,
            name: None,
            available: false,
        });
        registry.upsert_article(ArticleInfo {
            id: 20,
            name: None,
            total_quantity: 3,
            available: true,
        });
        let clock = Arc::new(ManualClock::new(NOW));
        (Ports::shared(registry.clone(), clock), registry)
    }

    fn room_proposal(start: Ms, end: Ms) -> Proposal {
        Proposal {
            person_id: 1,
            start,
            end,
            room_id: Some(10),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn person_rule_runs_first() {
        let (ports, _) = ports();
        let config = AdmissionConfig::default();
        let v = Validator::new(&ports, &config);
        // Inverted window and unknown room would also fail; person wins.
        let p = Proposal {
            person_id: 99,
            start: NOW + H,
            end: NOW,
            room_id: Some(404),
            ..Default::default()
        };
        assert_eq!(v.screen(&p).await, Err(EngineError::NotFound(Entity::Person(99))));

        let inactive = Proposal {
            person_id: 2,
            ..room_proposal(NOW + H, NOW + 2 * H)
        };
        assert_eq!(v.screen(&inactive).await, Err(EngineError::NotFound(Entity::Person(2))));
    }

    #[tokio::test]
    async fn empty_window_before_past_check() {
        let (ports, _) = ports();
        let config = AdmissionConfig::default();
        let v = Validator::new(&ports, &config);
        let p = room_proposal(NOW - 10 * H, NOW - 10 * H);
        assert!(matches!(v.screen(&p).await, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn grace_margin_boundary() {
        let (ports, _) = ports();
        let config = AdmissionConfig::default();
        let v = Validator::new(&ports, &config);

        let at_cutoff = room_proposal(NOW - 30 * M, NOW + H);
        assert!(v.screen(&at_cutoff).await.is_ok());

        let too_early = room_proposal(NOW - 31 * M, NOW + H);
        assert_eq!(
            v.screen(&too_early).await,
            Err(EngineError::PastWindowRejected {
                start: NOW - 31 * M,
                cutoff: NOW - 30 * M,
            })
        );
    }

    #[tokio::test]
    async fn exactly_one_target() {
        let (ports, _) = ports();
        let config = AdmissionConfig::default();
        let v = Validator::new(&ports, &config);
        let both = Proposal {
            article_id: Some(20),
            ..room_proposal(NOW + H, NOW + 2 * H)
        };
        assert!(matches!(v.screen(&both).await, Err(EngineError::Validation(_))));
        let neither = Proposal {
            room_id: None,
            ..room_proposal(NOW + H, NOW + 2 * H)
        };
        assert!(matches!(v.screen(&neither).await, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn registry_facts_for_targets() {
        let (ports, _) = ports();
        let config = AdmissionConfig::default();
        let v = Validator::new(&ports, &config);

        let room = v.screen(&room_proposal(NOW + H, NOW + 2 * H)).await.unwrap();
        assert_eq!(room.checks, vec![CapacityCheck::room(10)]);

        let disabled = Proposal {
            room_id: Some(11),
            ..room_proposal(NOW + H, NOW + 2 * H)
        };
        assert!(matches!(
            v.screen(&disabled).await,
            Err(EngineError::ResourceUnavailable(Unavailable::Disabled(ResourceKey::Room(11))))
        ));

        let article = Proposal {
            room_id: None,
            article_id: Some(20),
            units: Some(2),
            ..room_proposal(NOW + H, NOW + 2 * H)
        };
        let screened = v.screen(&article).await.unwrap();
        assert_eq!(
            screened.booking,
            Booking::Article {
                article_id: 20,
                units: 2
            }
        );
        assert_eq!(screened.checks[0].capacity, 3);

        let missing = Proposal {
            article_id: Some(21),
            ..article
        };
        assert_eq!(
            v.screen(&missing).await,
            Err(EngineError::NotFound(Entity::Article(21)))
        );
    }

    #[tokio::test]
    async fn zero_units_rejected() {
        let (ports, _) = ports();
        let config = AdmissionConfig::default();
        let v = Validator::new(&ports, &config);
        let p = Proposal {
            room_id: None,
            article_id: Some(20),
            units: Some(0),
            ..room_proposal(NOW + H, NOW + 2 * H)
        };
        assert!(matches!(v.screen(&p).await, Err(EngineError::Validation(_))));
    }

    #[test]
    fn capacity_check_reports_shortfall() {
        let check = CapacityCheck {
            key: ResourceKey::Article(20),
            capacity: 3,
            requested: 1,
        };
        assert!(check.against(2).is_ok());
        let Err(EngineError::CapacityExceeded(s)) = check.against(3) else {
            panic!("expected capacity error");
        };
        assert_eq!(s.missing(), 1);
    }

    #[test]
    fn merge_keeps_unchanged_fields() {
        let current = Reservation {
            id: Ulid::new(),
            person_id: 1,
            span: Span::new(NOW, NOW + H),
            booking: Booking::Article {
                article_id: 20,
                units: 2,
            },
        };
        let merged = Proposal::merge(
            &current,
            &ReservationChanges {
                end: Some(NOW + 2 * H),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(merged.start, NOW);
        assert_eq!(merged.end, NOW + 2 * H);
        assert_eq!(merged.article_id, Some(20));
        assert_eq!(merged.units, Some(2));
    }

    #[test]
    fn merge_rejects_room_to_article_with_attachments() {
        let current = Reservation {
            id: Ulid::new(),
            person_id: 1,
            span: Span::new(NOW, NOW + H),
            booking: Booking::Room {
                room_id: 10,
                attachments: [(20, 1)].into_iter().collect(),
            },
        };
        let changes = ReservationChanges {
            article_id: Some(20),
            ..Default::default()
        };
        assert!(matches!(
            Proposal::merge(&current, &changes),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn window_limits() {
        assert!(check_window(NOW, NOW + H).is_ok());
        assert_eq!(
            check_window(0, H),
            Err(EngineError::LimitExceeded("timestamp out of range"))
        );
        assert_eq!(
            check_window(NOW, NOW + MAX_SPAN_DURATION_MS + 1),
            Err(EngineError::LimitExceeded("reservation window too long"))
        );
    }
}
