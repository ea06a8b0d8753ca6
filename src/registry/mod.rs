//! Collaborator ports consulted during admission: who may book, and what exists to be booked.
//!
//! Three implementations ship with the crate: [`MemoryRegistry`] (in-process
//! catalog), [`RemoteRegistry`] (JSON lines over TCP), and [`CachedRegistry`]
//! (TTL cache in front of either). A registry that cannot answer returns
//! [`RegistryError::Unavailable`]; admission turns that into a rejection.

mod cached;
mod memory;
pub mod remote;

pub use cached::CachedRegistry;
pub use memory::{Catalog, MemoryRegistry};
pub use remote::RemoteRegistry;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::model::{ArticleId, PersonId, RoomId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("{service} registry unavailable: {reason}")]
    Unavailable {
        service: &'static str,
        reason: String,
    },
}

impl RegistryError {
    pub fn unavailable(service: &'static str, reason: impl Into<String>) -> Self {
        RegistryError::Unavailable {
            service,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonInfo {
    pub id: PersonId,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: RoomId,
    #[serde(default)]
    pub name: Option<String>,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleInfo {
    pub id: ArticleId,
    #[serde(default)]
    pub name: Option<String>,
    pub total_quantity: u32,
    pub available: bool,
}

#[async_trait]
pub trait PersonDirectory: Send + Sync {
    async fn exists_and_active(&self, person_id: PersonId) -> Result<bool, RegistryError>;
}

#[async_trait]
pub trait RoomRegistry: Send + Sync {
    async fn room(&self, room_id: RoomId) -> Result<Option<RoomInfo>, RegistryError>;

    async fn room_exists(&self, room_id: RoomId) -> Result<bool, RegistryError> {
        Ok(self.room(room_id).await?.is_some())
    }

    async fn room_available(&self, room_id: RoomId) -> Result<bool, RegistryError> {
        Ok(self.room(room_id).await?.is_some_and(|r| r.available))
    }
}

#[async_trait]
pub trait ArticleRegistry: Send + Sync {
    async fn article(&self, article_id: ArticleId) -> Result<Option<ArticleInfo>, RegistryError>;

    async fn article_exists(&self, article_id: ArticleId) -> Result<bool, RegistryError> {
        Ok(self.article(article_id).await?.is_some())
    }

    async fn article_available(&self, article_id: ArticleId) -> Result<bool, RegistryError> {
        Ok(self.article(article_id).await?.is_some_and(|a| a.available))
    }

    async fn total_quantity(&self, article_id: ArticleId) -> Result<Option<u32>, RegistryError> {
        Ok(self.article(article_id).await?.map(|a| a.total_quantity))
    }
}

#[async_trait]
impl<T: PersonDirectory + ?Sized> PersonDirectory for Arc<T> {
    async fn exists_and_active(&self, person_id: PersonId) -> Result<bool, RegistryError> {
        (**self).exists_and_active(person_id).await
    }
}

#[async_trait]
impl<T: RoomRegistry + ?Sized> RoomRegistry for Arc<T> {
    async fn room(&self, room_id: RoomId) -> Result<Option<RoomInfo>, RegistryError> {
        (**self).room(room_id).await
    }
}

#[async_trait]
impl<T: ArticleRegistry + ?Sized> ArticleRegistry for Arc<T> {
    async fn article(&self, article_id: ArticleId) -> Result<Option<ArticleInfo>, RegistryError> {
        (**self).article(article_id).await
    }
}

/// Everything the engine needs from the outside world.
#[derive(Clone)]
pub struct Ports {
    pub persons: Arc<dyn PersonDirectory>,
    pub rooms: Arc<dyn RoomRegistry>,
    pub articles: Arc<dyn ArticleRegistry>,
    pub clock: Arc<dyn Clock>,
}

impl Ports {
    /// Wire all three registry ports to one backing implementation.
    pub fn shared<R>(registry: Arc<R>, clock: Arc<dyn Clock>) -> Self
    where
        R: PersonDirectory + RoomRegistry + ArticleRegistry + 'static,
    {
        Self {
            persons: registry.clone(),
            rooms: registry.clone(),
            articles: registry,
            clock,
        }
    }
}
