//! Scripted transport for unit tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use nodefleet_core::{ExecutionReply, FleetError, Result, Task};

use crate::transport::NodeTransport;

/// What one `send` call does
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed(Vec<u8>),
    Fail(String),
    /// Reply with success after a delay
    Delay(Duration, Vec<u8>),
    /// Never reply
    Hang,
    /// Connection lost mid-send
    Disconnect,
}

pub struct ScriptedTransport {
    script: Mutex<VecDeque<Behavior>>,
    fallback: Behavior,
    connect_fails: bool,
    connect_delay: Duration,
    disconnect_fails: bool,
    ping_fails: bool,
    connects: AtomicUsize,
    sends: AtomicUsize,
    disconnects: AtomicUsize,
    connected: AtomicBool,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Behavior::Succeed(b"ok".to_vec()),
            connect_fails: false,
            connect_delay: Duration::ZERO,
            disconnect_fails: false,
            ping_fails: false,
            connects: AtomicUsize::new(0),
            sends: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
        }
    }

    /// Queue a behavior for the next unscripted send
    pub fn then(self, behavior: Behavior) -> Self {
        self.script.lock().unwrap().push_back(behavior);
        self
    }

    /// Behavior once the script is exhausted
    pub fn otherwise(mut self, behavior: Behavior) -> Self {
        self.fallback = behavior;
        self
    }

    pub fn failing_connect(mut self) -> Self {
        self.connect_fails = true;
        self
    }

    pub fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn failing_disconnect(mut self) -> Self {
        self.disconnect_fails = true;
        self
    }

    pub fn failing_ping(mut self) -> Self {
        self.ping_fails = true;
        self
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Whether a connection is currently open
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeTransport for ScriptedTransport {
    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if self.connect_fails {
            return Err(FleetError::ConnectionFailed("connection refused".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, task: &Task) -> Result<ExecutionReply> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match behavior {
            Behavior::Succeed(data) => Ok(ExecutionReply::success(task.id, data, 1)),
            Behavior::Fail(error) => Ok(ExecutionReply::failure(task.id, error, 1)),
            Behavior::Delay(delay, data) => {
                tokio::time::sleep(delay).await;
                Ok(ExecutionReply::success(task.id, data, delay.as_millis() as u64))
            }
            Behavior::Hang => std::future::pending().await,
            Behavior::Disconnect => Err(FleetError::ConnectionClosed),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        if self.disconnect_fails {
            return Err(FleetError::ConnectionFailed("disconnect refused".to_string()));
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        if self.ping_fails {
            return Err(FleetError::ConnectionClosed);
        }
        Ok(())
    }
}
