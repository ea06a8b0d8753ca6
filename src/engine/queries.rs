use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::admission::check_window;
use super::error::Entity;
use super::{Engine, EngineError};

impl Engine {
    /// Committed quantity on a resource over a window, read under its lock.
    pub async fn committed(
        &self,
        key: ResourceKey,
        window: &Span,
        excluding: Option<Ulid>,
    ) -> u32 {
        match self.get_ledger(key) {
            Some(ledger) => ledger.read().await.committed(window, excluding),
            None => 0,
        }
    }

    /// Whether one more booking of `resource` would fit over `[start, end)`:
    /// a free room, or at least one spare article unit. Resources the registry
    /// marks unavailable are never available.
    pub async fn check_availability(
        &self,
        resource: ResourceKey,
        start: Ms,
        end: Ms,
    ) -> Result<bool, EngineError> {
        let window = check_window(start, end)?;
        let validator = self.validator();
        let check = match resource {
            ResourceKey::Room(room_id) => validator.room_check(room_id).await,
            ResourceKey::Article(article_id) => validator.article_check(article_id, 1).await,
        };
        let check = match check {
            Ok(check) => check,
            Err(EngineError::ResourceUnavailable(super::Unavailable::Disabled(_))) => {
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        let committed = self.committed(resource, &window, None).await;
        Ok(check.against(committed).is_ok())
    }

    /// Units of an article still free over the whole window.
    pub async fn available_units(
        &self,
        article_id: ArticleId,
        start: Ms,
        end: Ms,
    ) -> Result<u32, EngineError> {
        let window = check_window(start, end)?;
        let article = self
            .ports
            .articles
            .article(article_id)
            .await?
            .ok_or(EngineError::NotFound(Entity::Article(article_id)))?;
        if !article.available {
            return Ok(0);
        }
        let committed = self
            .committed(ResourceKey::Article(article_id), &window, None)
            .await;
        Ok(article.total_quantity.saturating_sub(committed))
    }

    /// The reservation holding a room over the window, if any.
    pub async fn conflicting_reservation(
        &self,
        room_id: RoomId,
        start: Ms,
        end: Ms,
    ) -> Result<Option<Ulid>, EngineError> {
        let window = check_window(start, end)?;
        Ok(match self.get_ledger(ResourceKey::Room(room_id)) {
            Some(ledger) => ledger.read().await.first_conflict(&window, None),
            None => None,
        })
    }

    pub fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.snapshot(id)
            .ok_or(EngineError::NotFound(Entity::Reservation(id)))
    }

    /// Upcoming, active or past, against the engine's clock.
    pub fn reservation_phase(&self, id: Ulid) -> Result<Phase, EngineError> {
        Ok(self.get_reservation(id)?.phase(self.ports.clock.now()))
    }

    /// Matching reservations ordered by start then id, paged by `skip`/`limit`.
    pub fn query_reservations(
        &self,
        query: &ReservationQuery,
    ) -> Result<Vec<Reservation>, EngineError> {
        if query.limit > MAX_QUERY_LIMIT {
            return Err(EngineError::LimitExceeded("query limit too large"));
        }
        let mut matched: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|e| query.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        matched.sort_by_key(|r| (r.span.start, r.id));
        Ok(matched
            .into_iter()
            .skip(query.skip)
            .take(query.limit)
            .collect())
    }

    /// Number of matching reservations, ignoring paging.
    pub fn count_reservations(&self, query: &ReservationQuery) -> usize {
        self.reservations
            .iter()
            .filter(|e| query.matches(e.value()))
            .count()
    }
}
