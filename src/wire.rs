use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::engine::{EngineError, ReservationSystem};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;

/// Queued events per connection before forwarders start waiting.
const EVENT_BUFFER: usize = 1024;

/// One JSON object per line, tagged by `op`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Submit {
        queue: String,
        user: String,
        #[serde(default)]
        id: Option<ReservationId>,
        definition: ReservationDefinition,
    },
    Update {
        id: ReservationId,
        user: String,
        definition: ReservationDefinition,
    },
    Delete {
        id: ReservationId,
        user: String,
    },
    Get {
        id: ReservationId,
    },
    Allocation {
        queue: String,
        start: Ms,
        end: Ms,
    },
    Active {
        queue: String,
        at: Ms,
    },
    Plans,
    Listen {
        queue: String,
    },
    Unlisten {
        queue: String,
    },
}

/// Replies and pushed events, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Submitted {
        id: ReservationId,
    },
    Updated {
        id: ReservationId,
    },
    Deleted {
        id: ReservationId,
    },
    Reservation {
        reservation: ReservationAllocation,
    },
    Allocation {
        queue: String,
        start: Ms,
        end: Ms,
        peak: ResourceVector,
    },
    Active {
        queue: String,
        at: Ms,
        reservations: Vec<ReservationAllocation>,
    },
    Plans {
        plans: Vec<PlanInfo>,
    },
    Listening {
        queue: String,
    },
    Unlistened {
        queue: String,
    },
    Event {
        event: PlanEvent,
    },
    Error {
        code: String,
        message: String,
    },
}

impl From<EngineError> for Response {
    fn from(e: EngineError) -> Self {
        Response::Error {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

impl Response {
    fn invalid(message: impl Into<String>) -> Self {
        Response::Error {
            code: "invalid_request".into(),
            message: message.into(),
        }
    }

    fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }
}

fn codec_err(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "line too long")
        }
    }
}

/// Per-connection state: the queues this client listens on.
struct Session {
    system: Arc<ReservationSystem>,
    listeners: HashMap<String, JoinHandle<()>>,
    events: mpsc::Sender<PlanEvent>,
}

impl Session {
    async fn dispatch(&mut self, request: Request) -> Response {
        let system = self.system.clone();
        let result: Result<Response, EngineError> = match request {
            Request::Submit {
                queue,
                user,
                id,
                definition,
            } => match id {
                Some(id) => system.submit_with_id(id, &queue, &user, definition).await,
                None => system.submit(&queue, &user, definition).await,
            }
            .map(|id| Response::Submitted { id }),
            Request::Update {
                id,
                user,
                definition,
            } => system
                .update(id, &user, definition)
                .await
                .map(|()| Response::Updated { id }),
            Request::Delete { id, user } => system
                .delete(id, &user)
                .await
                .map(|()| Response::Deleted { id }),
            Request::Get { id } => system
                .get_reservation(id)
                .await
                .map(|reservation| Response::Reservation { reservation }),
            Request::Allocation { queue, start, end } => system
                .total_allocation_between(&queue, start, end)
                .await
                .map(|peak| Response::Allocation {
                    queue,
                    start,
                    end,
                    peak,
                }),
            Request::Active { queue, at } => system
                .reservations_active_at(&queue, at)
                .await
                .map(|reservations| Response::Active {
                    queue,
                    at,
                    reservations,
                }),
            Request::Plans => Ok(Response::Plans {
                plans: system.list_plans().await,
            }),
            Request::Listen { queue } => self.listen(queue),
            Request::Unlisten { queue } => Ok(self.unlisten(queue)),
        };
        result.unwrap_or_else(Response::from)
    }

    fn listen(&mut self, queue: String) -> Result<Response, EngineError> {
        if !self.system.registry().contains(&queue) {
            return Err(EngineError::QueueNotFound(queue));
        }
        if !self.listeners.contains_key(&queue) {
            let rx = self.system.notify.subscribe(&queue);
            let handle = tokio::spawn(forward_events(rx, self.events.clone()));
            self.listeners.insert(queue.clone(), handle);
        }
        Ok(Response::Listening { queue })
    }

    fn unlisten(&mut self, queue: String) -> Response {
        if let Some(handle) = self.listeners.remove(&queue) {
            handle.abort();
        }
        Response::Unlistened { queue }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for (_, handle) in self.listeners.drain() {
            handle.abort();
        }
    }
}

async fn forward_events(mut rx: broadcast::Receiver<PlanEvent>, tx: mpsc::Sender<PlanEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("listener lagged, {skipped} events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn encode(response: &Response) -> io::Result<String> {
    serde_json::to_string(response).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Serve one client until it disconnects. Requests are answered in order;
/// events for listened queues are interleaved between replies.
pub async fn process_connection(
    socket: TcpStream,
    system: Arc<ReservationSystem>,
) -> io::Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (events_tx, mut events_rx) = mpsc::channel(EVENT_BUFFER);
    let mut session = Session {
        system,
        listeners: HashMap::new(),
        events: events_tx,
    };

    loop {
        tokio::select! {
            line = framed.next() => {
                let line = match line {
                    None => break,
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        let reply = Response::invalid(format!("line exceeds {MAX_LINE_LEN} bytes"));
                        framed.send(encode(&reply)?).await.map_err(codec_err)?;
                        continue;
                    }
                    Some(Err(e)) => return Err(codec_err(e)),
                };
                if line.trim().is_empty() {
                    continue;
                }

                let started = Instant::now();
                let (op, reply) = match serde_json::from_str::<Request>(&line) {
                    Ok(request) => {
                        let op = crate::observability::request_label(&request);
                        (op, session.dispatch(request).await)
                    }
                    Err(e) => ("invalid", Response::invalid(e.to_string())),
                };
                let outcome = if reply.is_error() { "error" } else { "ok" };
                metrics::counter!(crate::observability::REQUESTS_TOTAL, "op" => op, "outcome" => outcome)
                    .increment(1);
                metrics::histogram!(crate::observability::REQUEST_DURATION_SECONDS, "op" => op)
                    .record(started.elapsed().as_secs_f64());
                debug!(op, outcome, "request handled");

                framed.send(encode(&reply)?).await.map_err(codec_err)?;
            }
            Some(event) = events_rx.recv() => {
                framed.send(encode(&Response::Event { event })?).await.map_err(codec_err)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_submit_request() {
        let line = r#"{"op":"submit","queue":"dedicated","user":"alice","definition":{
            "arrival":1000,"deadline":7201000,"interpreter":"ORDER_NO_GAP",
            "requests":[{"capability":{"memory":1024,"vcores":1},"parallelism":4,"gang":2,"duration":3600000}]}}"#;
        let request: Request = serde_json::from_str(line).unwrap();
        match request {
            Request::Submit {
                queue,
                user,
                id,
                definition,
            } => {
                assert_eq!(queue, "dedicated");
                assert_eq!(user, "alice");
                assert_eq!(id, None);
                assert_eq!(definition.interpreter, Interpreter::OrderNoGap);
                assert_eq!(definition.requests[0].gang, 2);
                assert!(!definition.requests[0].elastic);
                assert_eq!(definition.name, None);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn parse_unit_request() {
        let request: Request = serde_json::from_str(r#"{"op":"plans"}"#).unwrap();
        assert_eq!(request, Request::Plans);
        assert!(serde_json::from_str::<Request>(r#"{"op":"explode"}"#).is_err());
    }

    #[test]
    fn error_response_carries_code() {
        let id = ReservationId::new();
        let reply = Response::from(EngineError::NotFound(id));
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "not_found");
    }

    #[test]
    fn event_response_shape() {
        let id = ReservationId::new();
        let reply = Response::Event {
            event: PlanEvent::Expired {
                id,
                queue: "q".into(),
            },
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["event"]["event"], "expired");
        assert_eq!(json["event"]["queue"], "q");
    }
}
