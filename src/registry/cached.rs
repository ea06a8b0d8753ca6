use std::hash::Hash;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::model::{ArticleId, PersonId, RoomId};

use super::{
    ArticleInfo, ArticleRegistry, PersonDirectory, RegistryError, RoomInfo, RoomRegistry,
};

/// Successful answers from `inner`, kept for `ttl`. Failures are never cached,
/// so an unreachable registry keeps rejecting until it answers again.
pub struct CachedRegistry<R> {
    inner: R,
    ttl: Duration,
    persons: DashMap<PersonId, (Instant, bool)>,
    rooms: DashMap<RoomId, (Instant, Option<RoomInfo>)>,
    articles: DashMap<ArticleId, (Instant, Option<ArticleInfo>)>,
}

impl<R> CachedRegistry<R> {
    pub fn new(inner: R, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            persons: DashMap::new(),
            rooms: DashMap::new(),
            articles: DashMap::new(),
        }
    }

    /// Drop every cached answer.
    pub fn invalidate(&self) {
        self.persons.clear();
        self.rooms.clear();
        self.articles.clear();
    }
}

fn fresh<K: Eq + Hash, V: Clone>(map: &DashMap<K, (Instant, V)>, key: &K, ttl: Duration) -> Option<V> {
    let entry = map.get(key)?;
    let (stored_at, value) = entry.value();
    (stored_at.elapsed() < ttl).then(|| value.clone())
}

#[async_trait]
impl<R: PersonDirectory> PersonDirectory for CachedRegistry<R> {
    async fn exists_and_active(&self, person_id: PersonId) -> Result<bool, RegistryError> {
        if let Some(hit) = fresh(&self.persons, &person_id, self.ttl) {
            return Ok(hit);
        }
        let answer = self.inner.exists_and_active(person_id).await?;
        self.persons.insert(person_id, (Instant::now(), answer));
        Ok(answer)
    }
}

#[async_trait]
impl<R: RoomRegistry> RoomRegistry for CachedRegistry<R> {
    async fn room(&self, room_id: RoomId) -> Result<Option<RoomInfo>, RegistryError> {
        if let Some(hit) = fresh(&self.rooms, &room_id, self.ttl) {
            return Ok(hit);
        }
        let answer = self.inner.room(room_id).await?;
        self.rooms.insert(room_id, (Instant::now(), answer.clone()));
        Ok(answer)
    }
}

#[async_trait]
impl<R: ArticleRegistry> ArticleRegistry for CachedRegistry<R> {
    async fn article(&self, article_id: ArticleId) -> Result<Option<ArticleInfo>, RegistryError> {
        if let Some(hit) = fresh(&self.articles, &article_id, self.ttl) {
            return Ok(hit);
        }
        let answer = self.inner.article(article_id).await?;
        self.articles
            .insert(article_id, (Instant::now(), answer.clone()));
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MemoryRegistry, RemoteRegistry};
    use std::sync::Arc;

    #[tokio::test]
    async fn serves_stale_answer_within_ttl() {
        let backing = Arc::new(MemoryRegistry::new());
        backing.upsert_room(RoomInfo {
            id: 1,
            name: None,
            available: true,
        });
        let cached = CachedRegistry::new(backing.clone(), Duration::from_secs(60));

        assert!(cached.room_available(1).await.unwrap());
        backing.set_room_available(1, false);
        // Still the cached answer.
        assert!(cached.room_available(1).await.unwrap());

        cached.invalidate();
        assert!(!cached.room_available(1).await.unwrap());
    }

    #[tokio::test]
    async fn zero_ttl_always_asks_inner() {
        let backing = Arc::new(MemoryRegistry::new());
        backing.upsert_person(4, true);
        let cached = CachedRegistry::new(backing.clone(), Duration::ZERO);

        assert!(cached.exists_and_active(4).await.unwrap());
        backing.upsert_person(4, false);
        assert!(!cached.exists_and_active(4).await.unwrap());
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let cached = CachedRegistry::new(
            RemoteRegistry::new(addr, Duration::from_millis(200)),
            Duration::from_secs(60),
        );
        assert!(cached.article(1).await.is_err());
        assert!(cached.articles.is_empty());
    }
}
