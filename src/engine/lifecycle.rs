use std::time::Instant;

use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::admission::{settle, Proposal};
use super::error::Entity;
use super::{Engine, EngineError, LockSet};

impl Engine {
    /// Admit and persist a new reservation.
    pub async fn create_reservation(
        &self,
        request: ReservationRequest,
    ) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.create_inner(&request).await;
        observability::record_admission("create", started, &result);
        match &result {
            Ok(r) => info!(id = %r.id, person = r.person_id, resource = %r.booking.resource_key(), "reservation created"),
            Err(e) => debug!(person = request.person_id, "create rejected: {e}"),
        }
        result
    }

    async fn create_inner(&self, request: &ReservationRequest) -> Result<Reservation, EngineError> {
        let screened = self.validator().screen(&Proposal::from(request)).await?;
        let reservation = Reservation {
            id: Ulid::new(),
            person_id: screened.person_id,
            span: screened.span,
            booking: screened.booking.clone(),
        };

        let mut locks = self.lock(reservation.resource_keys()).await;
        screened.settle(&locks, None)?;
        check_ledger_room(&locks, &reservation)?;

        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&mut locks, &event).await?;
        Ok(reservation)
    }

    /// Apply `changes` to a reservation. Changing the window, the resource or the
    /// unit count re-runs admission with the reservation excluded from its own
    /// ledgers; changing only the requester re-checks the requester.
    pub async fn update_reservation(
        &self,
        id: Ulid,
        changes: ReservationChanges,
    ) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.update_inner(id, &changes).await;
        observability::record_admission("update", started, &result);
        match &result {
            Ok(r) => info!(id = %r.id, resource = %r.booking.resource_key(), "reservation updated"),
            Err(e) => debug!(%id, "update rejected: {e}"),
        }
        result
    }

    async fn update_inner(
        &self,
        id: Ulid,
        changes: &ReservationChanges,
    ) -> Result<Reservation, EngineError> {
        let current = self
            .snapshot(id)
            .ok_or(EngineError::NotFound(Entity::Reservation(id)))?;
        let validator = self.validator();
        let proposal = match Proposal::merge(&current, changes) {
            Ok(proposal) => proposal,
            Err(e) => {
                // Target-shape errors rank after the requester and window rules.
                validator
                    .check_requester_and_window(
                        changes.person_id.unwrap_or(current.person_id),
                        changes.start.unwrap_or(current.span.start),
                        changes.end.unwrap_or(current.span.end),
                    )
                    .await?;
                return Err(e);
            }
        };

        let target_unchanged = proposal.start == current.span.start
            && proposal.end == current.span.end
            && match &current.booking {
                Booking::Room { room_id, .. } => proposal.room_id == Some(*room_id),
                Booking::Article { article_id, units } => {
                    proposal.article_id == Some(*article_id) && proposal.units == Some(*units)
                }
            };

        let (candidate, checks) = if target_unchanged {
            if proposal.person_id == current.person_id {
                return Ok(current);
            }
            validator.check_person(proposal.person_id).await?;
            let candidate = Reservation {
                person_id: proposal.person_id,
                ..current.clone()
            };
            (candidate, Vec::new())
        } else {
            let mut screened = validator.screen(&proposal).await?;
            // A room keeps its attachments when moved or rescheduled.
            if let (
                Booking::Room {
                    attachments: carried,
                    ..
                },
                Booking::Room { attachments, .. },
            ) = (&current.booking, &mut screened.booking)
            {
                *attachments = carried.clone();
                if screened.span != current.span {
                    screened
                        .checks
                        .extend(validator.attachment_checks(carried).await?);
                }
            }
            let candidate = Reservation {
                id,
                person_id: screened.person_id,
                span: screened.span,
                booking: screened.booking,
            };
            (candidate, screened.checks)
        };

        let mut locks = self
            .lock(current.resource_keys().into_iter().chain(candidate.resource_keys()))
            .await;
        self.recheck(&current)?;
        settle(&checks, &candidate.span, &locks, Some(id))?;
        check_ledger_room(&locks, &candidate)?;

        let event = Event::ReservationUpdated {
            reservation: candidate.clone(),
        };
        self.persist_and_apply(&mut locks, &event).await?;
        Ok(candidate)
    }

    /// Remove a reservation and its attachments. Never capacity-checked.
    pub async fn delete_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.delete_inner(id).await;
        observability::record_admission("delete", started, &result);
        if result.is_ok() {
            info!(%id, "reservation deleted");
        }
        result
    }

    async fn delete_inner(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let current = self
            .snapshot(id)
            .ok_or(EngineError::NotFound(Entity::Reservation(id)))?;
        let mut locks = self.lock(current.resource_keys()).await;
        self.recheck(&current)?;
        self.persist_and_apply(&mut locks, &Event::ReservationDeleted { id })
            .await?;
        Ok(current)
    }
}

/// Refuse to grow a ledger past its row limit. Rows the reservation already owns don't count.
pub(super) fn check_ledger_room(locks: &LockSet, reservation: &Reservation) -> Result<(), EngineError> {
    for key in reservation.resource_keys() {
        if let Some(ledger) = locks.ledger(key)
            && ledger.get(reservation.id).is_none()
            && ledger.commitments.len() >= MAX_COMMITMENTS_PER_RESOURCE
        {
            return Err(EngineError::LimitExceeded("too many reservations on resource"));
        }
    }
    Ok(())
}
