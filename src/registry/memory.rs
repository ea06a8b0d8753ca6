use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::model::{ArticleId, PersonId, RoomId};

use super::{
    ArticleInfo, ArticleRegistry, PersonDirectory, PersonInfo, RegistryError, RoomInfo,
    RoomRegistry,
};

/// Serializable snapshot of a registry, used to seed the in-process one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub persons: Vec<PersonInfo>,
    #[serde(default)]
    pub rooms: Vec<RoomInfo>,
    #[serde(default)]
    pub articles: Vec<ArticleInfo>,
}

/// In-process catalog of people, rooms and articles.
pub struct MemoryRegistry {
    persons: DashMap<PersonId, PersonInfo>,
    rooms: DashMap<RoomId, RoomInfo>,
    articles: DashMap<ArticleId, ArticleInfo>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self {
            persons: DashMap::new(),
            rooms: DashMap::new(),
            articles: DashMap::new(),
        }
    }

    // ── Persons ──────────────────────────────────────────────

    pub fn upsert_person(&self, id: PersonId, active: bool) {
        self.persons.insert(id, PersonInfo { id, active });
    }

    pub fn get_person(&self, id: PersonId) -> Option<PersonInfo> {
        self.persons.get(&id).map(|e| e.value().clone())
    }

    pub fn remove_person(&self, id: PersonId) -> Option<PersonInfo> {
        self.persons.remove(&id).map(|(_, p)| p)
    }

    // ── Rooms ────────────────────────────────────────────────

    pub fn upsert_room(&self, room: RoomInfo) {
        self.rooms.insert(room.id, room);
    }

    pub fn get_room(&self, id: RoomId) -> Option<RoomInfo> {
        self.rooms.get(&id).map(|e| e.value().clone())
    }

    /// Returns false if the room is unknown.
    pub fn set_room_available(&self, id: RoomId, available: bool) -> bool {
        match self.rooms.get_mut(&id) {
            Some(mut room) => {
                room.available = available;
                true
            }
            None => false,
        }
    }

    pub fn remove_room(&self, id: RoomId) -> Option<RoomInfo> {
        self.rooms.remove(&id).map(|(_, r)| r)
    }

    // ── Articles ─────────────────────────────────────────────

    pub fn upsert_article(&self, article: ArticleInfo) {
        self.articles.insert(article.id, article);
    }

    pub fn get_article(&self, id: ArticleId) -> Option<ArticleInfo> {
        self.articles.get(&id).map(|e| e.value().clone())
    }

    /// Returns false if the article is unknown.
    pub fn set_article_available(&self, id: ArticleId, available: bool) -> bool {
        match self.articles.get_mut(&id) {
            Some(mut article) => {
                article.available = available;
                true
            }
            None => false,
        }
    }

    pub fn remove_article(&self, id: ArticleId) -> Option<ArticleInfo> {
        self.articles.remove(&id).map(|(_, a)| a)
    }

    /// Upsert everything in `catalog`.
    pub fn load(&self, catalog: Catalog) {
        for person in catalog.persons {
            self.persons.insert(person.id, person);
        }
        for room in catalog.rooms {
            self.upsert_room(room);
        }
        for article in catalog.articles {
            self.upsert_article(article);
        }
    }

    pub fn from_catalog(catalog: Catalog) -> Self {
        let registry = Self::new();
        registry.load(catalog);
        registry
    }
}

#[async_trait]
impl PersonDirectory for MemoryRegistry {
    async fn exists_and_active(&self, person_id: PersonId) -> Result<bool, RegistryError> {
        Ok(self.get_person(person_id).is_some_and(|p| p.active))
    }
}

#[async_trait]
impl RoomRegistry for MemoryRegistry {
    async fn room(&self, room_id: RoomId) -> Result<Option<RoomInfo>, RegistryError> {
        Ok(self.get_room(room_id))
    }
}

#[async_trait]
impl ArticleRegistry for MemoryRegistry {
    async fn article(&self, article_id: ArticleId) -> Result<Option<ArticleInfo>, RegistryError> {
        Ok(self.get_article(article_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn catalog_seeds_registry() {
        let catalog: Catalog = serde_json::from_str(
            r#"{
                "persons": [{"id": 1, "active": true}],
                "rooms": [{"id": 2, "available": true}],
                "articles": [{"id": 3, "name": "Projector", "total_quantity": 4, "available": true}]
            }"#,
        )
        .unwrap();
        let reg = MemoryRegistry::from_catalog(catalog);
        assert!(reg.exists_and_active(1).await.unwrap());
        assert!(reg.room_available(2).await.unwrap());
        assert_eq!(reg.total_quantity(3).await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn person_must_be_active() {
        let reg = MemoryRegistry::new();
        reg.upsert_person(1, true);
        reg.upsert_person(2, false);
        assert!(reg.exists_and_active(1).await.unwrap());
        assert!(!reg.exists_and_active(2).await.unwrap());
        assert!(!reg.exists_and_active(3).await.unwrap());
    }

    #[tokio::test]
    async fn room_availability_toggles() {
        let reg = MemoryRegistry::new();
        reg.upsert_room(RoomInfo {
            id: 10,
            name: Some("Sala A".into()),
            available: true,
        });
        assert!(reg.room_exists(10).await.unwrap());
        assert!(reg.room_available(10).await.unwrap());

        assert!(reg.set_room_available(10, false));
        assert!(!reg.room_available(10).await.unwrap());
        assert!(!reg.set_room_available(11, false));
        assert!(!reg.room_exists(11).await.unwrap());
    }

    #[tokio::test]
    async fn article_quantity_lookup() {
        let reg = MemoryRegistry::new();
        reg.upsert_article(ArticleInfo {
            id: 5,
            name: None,
            total_quantity: 3,
            available: true,
        });
        assert_eq!(reg.total_quantity(5).await.unwrap(), Some(3));
        assert_eq!(reg.total_quantity(6).await.unwrap(), None);
        reg.remove_article(5);
        assert!(!reg.article_exists(5).await.unwrap());
    }
}
