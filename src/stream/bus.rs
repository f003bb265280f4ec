use crate::error::StreamError;

use bytes::Bytes;
#[cfg(any(test, feature = "test-support"))]
use std::collections::VecDeque;
#[cfg(any(test, feature = "test-support"))]
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A message received on either channel, as its raw parts.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Data(Vec<Bytes>),
    Reply(Vec<Bytes>),
}

/// Subscribe-only data channel plus a request/reply control channel.
pub trait MessageBus {
    fn connect(&mut self) -> Result<(), StreamError>;

    /// Waits at most `timeout` for one message on either channel.
    fn poll(&mut self, timeout: Duration) -> Result<Option<Inbound>, StreamError>;

    fn send_request(&mut self, payload: Vec<u8>) -> Result<(), StreamError>;

    /// Discards the control socket and opens a fresh one.
    fn reset_control(&mut self) -> Result<(), StreamError>;

    fn close(&mut self);
}

// SCRIPTED BUS ----------------------------------------------------------------

#[cfg(any(test, feature = "test-support"))]
#[derive(Default)]
struct Script {
    inbound: VecDeque<Inbound>,
    sent: Vec<Vec<u8>>,
    connects: usize,
    control_resets: usize,
    closed: bool,
    fail_connects: usize,
}

/// In-memory bus fed from the outside. Clones share the same script, so a
/// handle kept by the caller can observe a bus owned by a worker thread.
#[cfg(any(test, feature = "test-support"))]
#[derive(Clone, Default)]
pub struct ScriptedBus {
    script: Arc<Mutex<Script>>,
}

#[cfg(any(test, feature = "test-support"))]
impl ScriptedBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push_data(&self, parts: Vec<Bytes>) {
        self.script().inbound.push_back(Inbound::Data(parts));
    }

    pub fn push_reply(&self) {
        self.script()
            .inbound
            .push_back(Inbound::Reply(vec![Bytes::from_static(b"ok")]));
    }

    /// The next `n` calls to `connect` fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.script().fail_connects = n;
    }

    pub fn sent_requests(&self) -> Vec<Vec<u8>> {
        self.script().sent.clone()
    }

    pub fn connects(&self) -> usize {
        self.script().connects
    }

    pub fn control_resets(&self) -> usize {
        self.script().control_resets
    }

    pub fn is_closed(&self) -> bool {
        self.script().closed
    }

    pub fn pending(&self) -> usize {
        self.script().inbound.len()
    }
}

#[cfg(any(test, feature = "test-support"))]
impl MessageBus for ScriptedBus {
    fn connect(&mut self) -> Result<(), StreamError> {
        let mut script = self.script();
        if script.fail_connects > 0 {
            script.fail_connects -= 1;
            return Err(StreamError::Transport("scripted connect failure".into()));
        }
        script.connects += 1;
        script.closed = false;
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<Inbound>, StreamError> {
        let next = self.script().inbound.pop_front();
        if next.is_none() {
            std::thread::sleep(timeout);
        }
        Ok(next)
    }

    fn send_request(&mut self, payload: Vec<u8>) -> Result<(), StreamError> {
        self.script().sent.push(payload);
        Ok(())
    }

    fn reset_control(&mut self) -> Result<(), StreamError> {
        self.script().control_resets += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.script().closed = true;
    }
}
