//! TCP transport speaking the NodeFleet wire protocol.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use nodefleet_core::{ExecutionReply, FleetError, Result, Task, WireError};
use nodefleet_protocol::{Envelope, OrchestratorCodec, Request, Response, PROTOCOL_VERSION};

use crate::transport::NodeTransport;

/// An open connection and the number of the next request
struct Link {
    framed: Framed<TcpStream, OrchestratorCodec>,
    next_seq: u64,
}

impl Link {
    /// Send `request` and wait for the response carrying its number.
    ///
    /// Responses to earlier requests whose caller gave up are dropped.
    async fn call(&mut self, request: Request) -> Result<Response> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.framed.send(Envelope::new(seq, request)).await?;

        loop {
            match self.framed.next().await {
                Some(Ok(envelope)) if envelope.seq == seq => return Ok(envelope.body),
                Some(Ok(envelope)) if envelope.seq < seq => {
                    debug!(seq = envelope.seq, kind = envelope.body.kind(), "Dropping stale response");
                }
                Some(Ok(envelope)) => {
                    return Err(WireError::UnexpectedMessage(format!(
                        "response {} while waiting for {}",
                        envelope.seq, seq
                    ))
                    .into());
                }
                Some(Err(e)) => return Err(e),
                None => return Err(FleetError::ConnectionClosed),
            }
        }
    }
}

/// Transport to one worker process over TCP.
///
/// One request is in flight at a time; the connection lock is held from
/// sending a request until its response arrives.
pub struct TcpTransport {
    address: SocketAddr,
    orchestrator_name: String,
    link: Mutex<Option<Link>>,
}

impl TcpTransport {
    pub fn new(address: SocketAddr, orchestrator_name: impl Into<String>) -> Self {
        Self {
            address,
            orchestrator_name: orchestrator_name.into(),
            link: Mutex::new(None),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Run one exchange on the open link; a broken link is dropped
    async fn call(&self, link: &mut Option<Link>, request: Request) -> Result<Response> {
        let open = link.as_mut().ok_or(FleetError::ConnectionClosed)?;
        let outcome = open.call(request).await;
        if outcome.as_ref().is_err_and(FleetError::is_transport_fault) {
            *link = None;
        }
        outcome
    }
}

#[async_trait]
impl NodeTransport for TcpTransport {
    async fn connect(&self) -> Result<()> {
        debug!(address = %self.address, "Connecting to worker");

        let stream = TcpStream::connect(self.address).await.map_err(|e| {
            error!(address = %self.address, error = %e, "Connection to worker failed");
            FleetError::ConnectionFailed(format!("{}: {}", self.address, e))
        })?;
        stream.set_nodelay(true)?;

        let mut link = Some(Link {
            framed: Framed::new(stream, OrchestratorCodec::new()),
            next_seq: 1,
        });
        let hello = Request::Hello {
            orchestrator: self.orchestrator_name.clone(),
            version: PROTOCOL_VERSION,
        };

        match self.call(&mut link, hello).await? {
            Response::Welcome { worker } => {
                info!(address = %self.address, worker = %worker, "Connected to worker");
                *self.link.lock().await = link;
                Ok(())
            }
            Response::Refused { reason } => Err(FleetError::ConnectionFailed(format!(
                "{} refused connection: {}",
                self.address, reason
            ))),
            other => Err(WireError::UnexpectedMessage(format!(
                "{} in reply to hello",
                other.kind()
            ))
            .into()),
        }
    }

    async fn send(&self, task: &Task) -> Result<ExecutionReply> {
        let mut link = self.link.lock().await;

        match self.call(&mut link, Request::Run(task.clone())).await? {
            Response::Done(reply) => Ok(reply),
            Response::Error { code, message } => {
                warn!(address = %self.address, task_id = %task.id, ?code, %message, "Worker rejected task");
                Ok(ExecutionReply::failure(task.id, message, 0))
            }
            other => Err(WireError::UnexpectedMessage(format!(
                "{} in reply to run",
                other.kind()
            ))
            .into()),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(mut link) = self.link.lock().await.take() else {
            return Ok(());
        };

        let bye = Request::Bye {
            reason: "orchestrator shutdown".to_string(),
        };
        link.framed.send(Envelope::new(link.next_seq, bye)).await?;
        link.framed.close().await?;

        debug!(address = %self.address, "Disconnected from worker");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        // A connection in use is alive; a ping would have to queue behind the task
        let Ok(mut link) = self.link.try_lock() else {
            return Ok(());
        };

        match self.call(&mut link, Request::Ping).await? {
            Response::Pong { running_tasks } => {
                debug!(address = %self.address, running_tasks, "Worker alive");
                Ok(())
            }
            other => Err(WireError::UnexpectedMessage(format!(
                "{} in reply to ping",
                other.kind()
            ))
            .into()),
        }
    }

    fn peer(&self) -> String {
        self.address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodefleet_protocol::{ErrorCode, WorkerCodec};
    use tokio::net::TcpListener;

    #[derive(Clone, Copy)]
    enum Worker {
        Accepting,
        Refusing,
        /// Sends a leftover response before every real one
        Stale,
        /// Rejects every task
        Erroring,
    }

    /// Minimal worker that accepts one connection and answers every request
    async fn fake_worker(mode: Worker) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, WorkerCodec::new());
            while let Some(Ok(Envelope { seq, body })) = framed.next().await {
                let response = match (body, mode) {
                    (Request::Hello { .. }, Worker::Refusing) => Response::Refused {
                        reason: "full".to_string(),
                    },
                    (Request::Hello { .. }, _) => Response::Welcome {
                        worker: "fake".to_string(),
                    },
                    (Request::Ping, _) => Response::Pong { running_tasks: 0 },
                    (Request::Run(_), Worker::Erroring) => {
                        Response::error(ErrorCode::InvalidRequest, "not today")
                    }
                    (Request::Run(task), _) => {
                        Response::Done(ExecutionReply::success(task.id, b"done".to_vec(), 0))
                    }
                    (Request::Bye { .. }, _) => break,
                };
                if matches!(mode, Worker::Stale) {
                    let stale = Response::Done(ExecutionReply::failure(
                        Task::new_compute("old", "0").id,
                        "abandoned",
                        0,
                    ));
                    if framed.send(Envelope::new(seq - 1, stale)).await.is_err() {
                        break;
                    }
                }
                if framed.send(Envelope::new(seq, response)).await.is_err() {
                    break;
                }
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_connect_send_ping_disconnect() {
        let transport = TcpTransport::new(fake_worker(Worker::Accepting).await, "test");
        transport.connect().await.unwrap();

        let task = Task::new_compute("sum", "1+1");
        let reply = transport.send(&task).await.unwrap();
        assert_eq!(reply.task_id, task.id);
        assert_eq!(reply.data, b"done");

        transport.ping().await.unwrap();
        transport.disconnect().await.unwrap();

        let err = transport.send(&task).await.unwrap_err();
        assert!(matches!(err, FleetError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_refused_handshake() {
        let transport = TcpTransport::new(fake_worker(Worker::Refusing).await, "test");
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, FleetError::ConnectionFailed(msg) if msg.contains("full")));
    }

    #[tokio::test]
    async fn test_stale_responses_are_skipped() {
        let transport = TcpTransport::new(fake_worker(Worker::Stale).await, "test");
        transport.connect().await.unwrap();

        let task = Task::new_compute("sum", "1+1");
        let reply = transport.send(&task).await.unwrap();
        assert!(reply.success);
        assert_eq!(reply.task_id, task.id);

        transport.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_error_becomes_failed_reply() {
        let transport = TcpTransport::new(fake_worker(Worker::Erroring).await, "test");
        transport.connect().await.unwrap();

        let task = Task::new_compute("sum", "1+1");
        let reply = transport.send(&task).await.unwrap();
        assert!(!reply.success);
        assert_eq!(reply.task_id, task.id);
        assert_eq!(reply.error.as_deref(), Some("not today"));

        // the connection is still usable afterwards
        transport.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_task_keeps_connection() {
        let transport = TcpTransport::new(fake_worker(Worker::Accepting).await, "test");
        transport.connect().await.unwrap();

        let task = Task::new_data("blob", "echo", vec![0u8; nodefleet_protocol::MAX_PAYLOAD + 1]);
        let err = transport.send(&task).await.unwrap_err();
        assert!(matches!(err, FleetError::Serialization(_)));
        assert!(!err.is_transport_fault());

        transport.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = TcpTransport::new(addr, "test");
        assert!(matches!(transport.connect().await, Err(FleetError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_disconnect_without_connection() {
        let transport = TcpTransport::new("127.0.0.1:9".parse().unwrap(), "test");
        transport.disconnect().await.unwrap();
    }
}
