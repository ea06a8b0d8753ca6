//! Newline-delimited JSON front-end.
//!
//! Each request line is an object tagged by `cmd`; each response line is
//! `{"ok":true,"data":...}` or `{"ok":false,"error":{"kind":...,"message":...}}`.
//!
//! ```text
//! → {"cmd":"create","person_id":1,"start":1800000000000,"end":1800003600000,"room_id":3}
//! ← {"ok":true,"data":{"id":"01J...","person_id":1,...}}
//! ```

use std::io;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::debug;
use ulid::Ulid;

use crate::engine::{with_retry, Engine, EngineError, RetryPolicy, Shortfall};
use crate::limits::MAX_REQUEST_LINE_BYTES;
use crate::model::*;
use crate::observability;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    Create {
        #[serde(flatten)]
        request: ReservationRequest,
    },
    Update {
        id: Ulid,
        #[serde(flatten)]
        changes: ReservationChanges,
    },
    Delete {
        id: Ulid,
    },
    Get {
        id: Ulid,
    },
    Query {
        #[serde(flatten)]
        query: ReservationQuery,
    },
    Count {
        #[serde(flatten)]
        query: ReservationQuery,
    },
    CheckAvailability {
        resource: ResourceKey,
        start: Ms,
        end: Ms,
    },
    AvailableUnits {
        article_id: ArticleId,
        start: Ms,
        end: Ms,
    },
    Attach {
        reservation_id: Ulid,
        article_id: ArticleId,
        quantity: u32,
        #[serde(default)]
        mode: AttachMode,
    },
    Detach {
        reservation_id: Ulid,
        article_id: ArticleId,
    },
    Attachments {
        reservation_id: Ulid,
    },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shortfall: Option<ShortfallBody>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortfallBody {
    pub resource: ResourceKey,
    pub capacity: u32,
    pub committed: u32,
    pub requested: u32,
    pub missing: u32,
}

impl From<&Shortfall> for ShortfallBody {
    fn from(s: &Shortfall) -> Self {
        Self {
            resource: s.resource,
            capacity: s.capacity,
            committed: s.committed,
            requested: s.requested,
            missing: s.missing(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                kind: kind.into(),
                message: message.into(),
                retryable: false,
                shortfall: None,
            }),
        }
    }
}

impl From<&EngineError> for Response {
    fn from(e: &EngineError) -> Self {
        let shortfall = match e {
            EngineError::CapacityExceeded(s) => Some(ShortfallBody::from(s)),
            _ => None,
        };
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                kind: e.kind().as_str().to_string(),
                message: e.to_string(),
                retryable: e.is_retryable(),
                shortfall,
            }),
        }
    }
}

fn to_data<T: Serialize>(value: T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::WalError(format!("encode response: {e}")))
}

/// Execute one request. Mutations retry on concurrent conflicts per `retry`.
pub async fn dispatch(
    engine: &Engine,
    retry: &RetryPolicy,
    request: Request,
) -> Result<Value, EngineError> {
    match request {
        Request::Create { request } => to_data(
            with_retry(retry, "create", move || {
                engine.create_reservation(request.clone())
            })
            .await?,
        ),
        Request::Update { id, changes } => to_data(
            with_retry(retry, "update", move || {
                engine.update_reservation(id, changes.clone())
            })
            .await?,
        ),
        Request::Delete { id } => to_data(
            with_retry(retry, "delete", move || engine.delete_reservation(id)).await?,
        ),
        Request::Get { id } => {
            let reservation = engine.get_reservation(id)?;
            let phase = reservation.phase(engine.ports().clock.now());
            Ok(serde_json::json!({ "reservation": to_data(reservation)?, "phase": to_data(phase)? }))
        }
        Request::Query { query } => to_data(engine.query_reservations(&query)?),
        Request::Count { query } => to_data(engine.count_reservations(&query)),
        Request::CheckAvailability {
            resource,
            start,
            end,
        } => to_data(engine.check_availability(resource, start, end).await?),
        Request::AvailableUnits {
            article_id,
            start,
            end,
        } => to_data(engine.available_units(article_id, start, end).await?),
        Request::Attach {
            reservation_id,
            article_id,
            quantity,
            mode,
        } => to_data(
            with_retry(retry, "attach", move || {
                engine.attach_article(reservation_id, article_id, quantity, mode)
            })
            .await?,
        ),
        Request::Detach {
            reservation_id,
            article_id,
        } => to_data(
            with_retry(retry, "detach", move || {
                engine.detach_article(reservation_id, article_id)
            })
            .await?,
        ),
        Request::Attachments { reservation_id } => to_data(engine.attachments(reservation_id)?),
        Request::Ping => Ok(Value::String("pong".into())),
    }
}

/// Parse, execute and encode one request line.
pub async fn handle_line(engine: &Engine, retry: &RetryPolicy, line: &str) -> Response {
    let request = match serde_json::from_str::<Request>(line) {
        Ok(request) => request,
        Err(e) => {
            metrics::counter!(observability::REQUESTS_TOTAL, "command" => "unknown", "status" => "bad_request")
                .increment(1);
            return Response::failure("bad_request", format!("malformed request: {e}"));
        }
    };

    let command = observability::command_label(&request);
    let started = Instant::now();
    let result = dispatch(engine, retry, request).await;
    metrics::counter!(observability::REQUESTS_TOTAL, "command" => command, "status" => observability::outcome_label(&result))
        .increment(1);
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "command" => command)
        .record(started.elapsed().as_secs_f64());

    match result {
        Ok(data) => Response::success(data),
        Err(e) => Response::from(&e),
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    retry: RetryPolicy,
) -> io::Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_REQUEST_LINE_BYTES));
    while let Some(line) = framed.next().await {
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                let reply = Response::failure("limit_exceeded", "request line too long");
                send(&mut framed, &reply).await?;
                return Ok(());
            }
            Err(LinesCodecError::Io(e)) => return Err(e),
        };
        if line.trim().is_empty() {
            continue;
        }
        let reply = handle_line(&engine, &retry, &line).await;
        send(&mut framed, &reply).await?;
    }
    debug!("client closed connection");
    Ok(())
}

async fn send(framed: &mut Framed<TcpStream, LinesCodec>, reply: &Response) -> io::Result<()> {
    let out = serde_json::to_string(reply).map_err(io::Error::other)?;
    framed.send(out).await.map_err(|e| match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::other(other),
    })
}
