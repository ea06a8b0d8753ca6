//! Registry client and server speaking newline-delimited JSON over TCP.
//!
//! One request line, one response line:
//!
//! ```text
//! → {"op":"room","id":3}
//! ← {"status":"room","room":{"id":3,"name":"Sala 3","available":true}}
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, warn};

use crate::limits::MAX_REQUEST_LINE_BYTES;
use crate::model::{ArticleId, PersonId, RoomId};

use super::{
    ArticleInfo, ArticleRegistry, MemoryRegistry, PersonDirectory, PersonInfo, RegistryError,
    RoomInfo, RoomRegistry,
};

const SERVICE: &str = "remote";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RegistryRequest {
    Person { id: PersonId },
    Room { id: RoomId },
    Article { id: ArticleId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RegistryResponse {
    Person { person: Option<PersonInfo> },
    Room { room: Option<RoomInfo> },
    Article { article: Option<ArticleInfo> },
    Error { message: String },
}

/// Registry reached over the network. Every failure mode (refused connection,
/// timeout, malformed reply) surfaces as [`RegistryError::Unavailable`].
#[derive(Debug, Clone)]
pub struct RemoteRegistry {
    addr: String,
    timeout: Duration,
}

impl RemoteRegistry {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    async fn call(&self, request: RegistryRequest) -> Result<RegistryResponse, RegistryError> {
        let exchange = async {
            let stream = TcpStream::connect(&self.addr)
                .await
                .map_err(|e| format!("connect {}: {e}", self.addr))?;
            let mut framed =
                Framed::new(stream, LinesCodec::new_with_max_length(MAX_REQUEST_LINE_BYTES));
            let line = serde_json::to_string(&request).map_err(|e| e.to_string())?;
            framed.send(line).await.map_err(|e| e.to_string())?;
            let reply = framed
                .next()
                .await
                .ok_or_else(|| "connection closed before reply".to_string())?
                .map_err(|e| e.to_string())?;
            serde_json::from_str::<RegistryResponse>(&reply)
                .map_err(|e| format!("malformed reply: {e}"))
        };

        let result = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(RegistryResponse::Error { message })) => Err(message),
            Ok(result) => result,
            Err(_) => Err(format!("no reply within {:?}", self.timeout)),
        };
        result.map_err(|reason| {
            warn!(addr = %self.addr, ?request, "registry call failed: {reason}");
            metrics::counter!(crate::observability::REGISTRY_FAILURES_TOTAL).increment(1);
            RegistryError::unavailable(SERVICE, reason)
        })
    }
}

fn unexpected(reply: RegistryResponse) -> RegistryError {
    RegistryError::unavailable(SERVICE, format!("unexpected reply: {reply:?}"))
}

#[async_trait]
impl PersonDirectory for RemoteRegistry {
    async fn exists_and_active(&self, person_id: PersonId) -> Result<bool, RegistryError> {
        match self.call(RegistryRequest::Person { id: person_id }).await? {
            RegistryResponse::Person { person } => Ok(person.is_some_and(|p| p.active)),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl RoomRegistry for RemoteRegistry {
    async fn room(&self, room_id: RoomId) -> Result<Option<RoomInfo>, RegistryError> {
        match self.call(RegistryRequest::Room { id: room_id }).await? {
            RegistryResponse::Room { room } => Ok(room),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl ArticleRegistry for RemoteRegistry {
    async fn article(&self, article_id: ArticleId) -> Result<Option<ArticleInfo>, RegistryError> {
        match self.call(RegistryRequest::Article { id: article_id }).await? {
            RegistryResponse::Article { article } => Ok(article),
            other => Err(unexpected(other)),
        }
    }
}

// ── Server side ──────────────────────────────────────────────────

fn answer(registry: &MemoryRegistry, request: RegistryRequest) -> RegistryResponse {
    match request {
        RegistryRequest::Person { id } => RegistryResponse::Person {
            person: registry.get_person(id),
        },
        RegistryRequest::Room { id } => RegistryResponse::Room {
            room: registry.get_room(id),
        },
        RegistryRequest::Article { id } => RegistryResponse::Article {
            article: registry.get_article(id),
        },
    }
}

async fn serve_connection(socket: TcpStream, registry: Arc<MemoryRegistry>) {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_REQUEST_LINE_BYTES));
    while let Some(line) = framed.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                debug!("registry connection closed: {e}");
                break;
            }
        };
        let response = match serde_json::from_str::<RegistryRequest>(&line) {
            Ok(request) => answer(&registry, request),
            Err(e) => RegistryResponse::Error {
                message: format!("bad request: {e}"),
            },
        };
        let Ok(out) = serde_json::to_string(&response) else {
            break;
        };
        if framed.send(out).await.is_err() {
            break;
        }
    }
}

/// Serve a [`MemoryRegistry`] to [`RemoteRegistry`] clients until the listener fails.
pub async fn serve(listener: TcpListener, registry: Arc<MemoryRegistry>) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("registry accept error: {e}");
                break;
            }
        };
        debug!("registry connection from {peer}");
        tokio::spawn(serve_connection(socket, registry.clone()));
    }
}
