use std::time::Instant;

use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::admission::check_units;
use super::error::Entity;
use super::{Engine, EngineError};

impl Engine {
    /// Attach article units to a room reservation, or change how many are attached.
    ///
    /// With [`AttachMode::Add`] the quantity is summed onto any existing
    /// attachment; with [`AttachMode::Replace`] it becomes the new quantity.
    /// Capacity is checked over the parent's window with the parent's own prior
    /// contribution excluded.
    pub async fn attach_article(
        &self,
        reservation_id: Ulid,
        article_id: ArticleId,
        quantity: u32,
        mode: AttachMode,
    ) -> Result<AttachmentInfo, EngineError> {
        let started = Instant::now();
        let result = self
            .attach_inner(reservation_id, article_id, quantity, mode)
            .await;
        observability::record_admission("attach", started, &result);
        match &result {
            Ok(a) => info!(%reservation_id, article_id, quantity = a.quantity, "article attached"),
            Err(e) => debug!(%reservation_id, article_id, "attach rejected: {e}"),
        }
        result
    }

    async fn attach_inner(
        &self,
        reservation_id: Ulid,
        article_id: ArticleId,
        quantity: u32,
        mode: AttachMode,
    ) -> Result<AttachmentInfo, EngineError> {
        check_units(quantity)?;
        let parent = self
            .snapshot(reservation_id)
            .ok_or(EngineError::NotFound(Entity::Reservation(reservation_id)))?;
        let Booking::Room { attachments, .. } = &parent.booking
        else {
            return Err(EngineError::Validation(
                "articles can only be attached to room reservations",
            ));
        };

        let existing = attachments.get(&article_id).copied();
        if existing.is_none() && attachments.len() >= MAX_ATTACHMENTS_PER_RESERVATION {
            return Err(EngineError::LimitExceeded("too many attachments on reservation"));
        }
        let new_quantity = match mode {
            AttachMode::Add => check_units(existing.unwrap_or(0).saturating_add(quantity))?,
            AttachMode::Replace => quantity,
        };
        let check = self.validator().article_check(article_id, new_quantity).await?;

        // Applying the event rewrites every row the parent holds.
        let mut locks = self
            .lock(parent.resource_keys().into_iter().chain([ResourceKey::Article(article_id)]))
            .await;
        self.recheck(&parent)?;
        check.against(locks.committed(check.key, &parent.span, Some(reservation_id)))?;
        if existing.is_none()
            && let Some(ledger) = locks.ledger(check.key)
            && ledger.commitments.len() >= MAX_COMMITMENTS_PER_RESOURCE
        {
            return Err(EngineError::LimitExceeded("too many reservations on resource"));
        }

        let event = Event::ArticleAttached {
            reservation_id,
            article_id,
            quantity: new_quantity,
        };
        self.persist_and_apply(&mut locks, &event).await?;
        Ok(AttachmentInfo {
            reservation_id,
            article_id,
            quantity: new_quantity,
        })
    }

    /// Remove an attachment. Detaching something that is not attached is an error.
    pub async fn detach_article(
        &self,
        reservation_id: Ulid,
        article_id: ArticleId,
    ) -> Result<AttachmentInfo, EngineError> {
        let started = Instant::now();
        let result = self.detach_inner(reservation_id, article_id).await;
        observability::record_admission("detach", started, &result);
        if result.is_ok() {
            info!(%reservation_id, article_id, "article detached");
        }
        result
    }

    async fn detach_inner(
        &self,
        reservation_id: Ulid,
        article_id: ArticleId,
    ) -> Result<AttachmentInfo, EngineError> {
        let parent = self
            .snapshot(reservation_id)
            .ok_or(EngineError::NotFound(Entity::Reservation(reservation_id)))?;
        let missing = EngineError::NotFound(Entity::Attachment {
            reservation_id,
            article_id,
        });
        let Booking::Room { attachments, .. } = &parent.booking
        else {
            return Err(missing);
        };
        let quantity = *attachments.get(&article_id).ok_or(missing)?;

        let mut locks = self
            .lock(parent.resource_keys().into_iter().chain([ResourceKey::Article(article_id)]))
            .await;
        self.recheck(&parent)?;
        let event = Event::ArticleDetached {
            reservation_id,
            article_id,
        };
        self.persist_and_apply(&mut locks, &event).await?;
        Ok(AttachmentInfo {
            reservation_id,
            article_id,
            quantity,
        })
    }

    /// Attachments of a reservation, by article id. Article reservations have none.
    pub fn attachments(&self, reservation_id: Ulid) -> Result<Vec<AttachmentInfo>, EngineError> {
        let reservation = self
            .snapshot(reservation_id)
            .ok_or(EngineError::NotFound(Entity::Reservation(reservation_id)))?;
        Ok(reservation
            .booking
            .attachments()
            .into_iter()
            .flatten()
            .map(|(&article_id, &quantity)| AttachmentInfo {
                reservation_id,
                article_id,
                quantity,
            })
            .collect())
    }
}
