//! Worker network server.
//!
//! Accepts orchestrator connections, answers handshakes and heartbeats,
//! and runs assigned tasks through the [`TaskExecutor`].

use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, error, info};

use nodefleet_core::Result;
use nodefleet_protocol::{Envelope, ErrorCode, Request, Response, WorkerCodec, PROTOCOL_VERSION};

use crate::executor::TaskExecutor;

/// Worker server
pub struct WorkerServer {
    listener: TcpListener,
    name: Arc<str>,
    executor: TaskExecutor,
}

impl WorkerServer {
    /// Bind the listening socket
    pub async fn bind(address: SocketAddr, name: impl Into<String>) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let name: String = name.into();
        Ok(Self {
            listener,
            name: Arc::from(name),
            executor: TaskExecutor::new(),
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serve connections until the process exits
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve connections until `shutdown` completes
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(address = %self.local_addr()?, name = %self.name, "Worker listening");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer_addr) = accepted?;
                    info!(peer = %peer_addr, "New connection");

                    let session = Session {
                        peer: peer_addr,
                        name: Arc::clone(&self.name),
                        executor: self.executor.clone(),
                        greeted: false,
                    };
                    tokio::spawn(async move {
                        if let Err(e) = session.serve(stream).await {
                            error!(peer = %peer_addr, error = %e, "Connection error");
                        }
                    });
                }
                _ = &mut shutdown => {
                    info!(name = %self.name, "Worker shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// One orchestrator connection
struct Session {
    peer: SocketAddr,
    name: Arc<str>,
    executor: TaskExecutor,
    /// Set once `Hello` has been accepted
    greeted: bool,
}

impl Session {
    async fn serve(mut self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, WorkerCodec::new());

        while let Some(frame) = framed.next().await {
            let Envelope { seq, body } = match frame {
                Ok(envelope) => envelope,
                Err(e) => {
                    error!(peer = %self.peer, error = %e, "Protocol error");
                    let _ = framed
                        .send(Envelope::new(0, Response::error(ErrorCode::Protocol, e.to_string())))
                        .await;
                    break;
                }
            };

            debug!(peer = %self.peer, seq, kind = body.kind(), "Received request");

            let Some(response) = self.respond(body).await else {
                break;
            };
            let closing = matches!(response, Response::Refused { .. });
            framed.send(Envelope::new(seq, response)).await?;
            if closing {
                break;
            }
        }

        debug!(peer = %self.peer, "Connection closed");
        Ok(())
    }

    /// Answer one request; `None` ends the session
    async fn respond(&mut self, request: Request) -> Option<Response> {
        let response = match request {
            Request::Hello { orchestrator, version } => {
                info!(orchestrator = %orchestrator, version, "Hello received");

                if version != PROTOCOL_VERSION {
                    Response::Refused {
                        reason: format!(
                            "protocol version mismatch: expected {}, got {}",
                            PROTOCOL_VERSION, version
                        ),
                    }
                } else if self.greeted {
                    Response::error(ErrorCode::InvalidRequest, "hello already received")
                } else {
                    self.greeted = true;
                    Response::Welcome {
                        worker: self.name.to_string(),
                    }
                }
            }

            Request::Bye { reason } => {
                info!(peer = %self.peer, reason = %reason, "Orchestrator said goodbye");
                return None;
            }

            _ if !self.greeted => Response::error(ErrorCode::HelloRequired, "hello required"),

            Request::Ping => Response::Pong {
                running_tasks: self.executor.running_count(),
            },

            Request::Run(task) => Response::Done(self.executor.execute(&task).await),
        };
        Some(response)
    }
}
