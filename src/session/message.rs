use chrono::NaiveDateTime;
use colored::Colorize;
use crossbeam_channel::Sender;
use std::sync::Arc;
#[cfg(any(test, feature = "test-support"))]
use std::sync::Mutex;

/// Timestamped operator-facing text.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionMessage {
    pub timestamp: NaiveDateTime,
    pub text: String,
}

impl SessionMessage {
    pub fn new<S: Into<String>>(timestamp: NaiveDateTime, text: S) -> Self {
        Self {
            timestamp,
            text: text.into(),
        }
    }

    pub fn formatted(&self) -> String {
        format!("[{}] {}", self.timestamp.format("%Y-%m-%dT%H:%M:%S"), self.text)
    }
}

/// Events flowing from the active stage to whoever drives the session.
#[derive(Debug, Clone, PartialEq)]
pub enum StageEvent {
    NewMessage(SessionMessage),
    SessionComplete { stage_name: String, trial_count: usize },
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, message: SessionMessage);
}

impl<T: NotificationSink + ?Sized> NotificationSink for Arc<T> {
    fn notify(&self, message: SessionMessage) {
        (**self).notify(message)
    }
}

/// Sends every message to all inner sinks.
impl NotificationSink for Vec<Box<dyn NotificationSink>> {
    fn notify(&self, message: SessionMessage) {
        for sink in self {
            sink.notify(message.clone());
        }
    }
}

// SINKS -----------------------------------------------------------------------

/// Forwards messages across threads as `StageEvent::NewMessage`.
pub struct ChannelSink {
    tx: Sender<StageEvent>,
}

impl ChannelSink {
    pub fn new(tx: Sender<StageEvent>) -> Self {
        Self { tx }
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, message: SessionMessage) {
        if self.tx.send(StageEvent::NewMessage(message)).is_err() {
            log::debug!("Session message dropped, receiver gone");
        }
    }
}

pub struct ConsoleSink;

impl NotificationSink for ConsoleSink {
    fn notify(&self, message: SessionMessage) {
        let stamp = format!("[{}]", message.timestamp.format("%H:%M:%S")).dimmed();
        let text = if message.text.starts_with("Command failed")
            || message.text.starts_with("Command not recognized")
        {
            message.text.red()
        } else if message.text.starts_with("Trial") {
            message.text.green()
        } else {
            message.text.white()
        };
        println!("{} {}", stamp, text);
    }
}

/// Keeps every message in memory.
#[cfg(any(test, feature = "test-support"))]
#[derive(Clone, Default)]
pub struct MemorySink {
    messages: Arc<Mutex<Vec<SessionMessage>>>,
}

#[cfg(any(test, feature = "test-support"))]
impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn texts(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|m| m.text.clone())
            .collect()
    }
}

#[cfg(any(test, feature = "test-support"))]
impl NotificationSink for MemorySink {
    fn notify(&self, message: SessionMessage) {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }
}
