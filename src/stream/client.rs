use super::bus::{Inbound, MessageBus};
use super::frame::{AssemblerStats, Frame, FrameAssembler};
use super::message::{parse_message, MessageBody};
use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::utils::clock::Clock;

use bytes::Bytes;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Open Ephys event type for TTL events.
const TTL_EVENT_TYPE: i32 = 3;

/// TTL marker placed in the acquisition record, e.g. at each stimulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlEvent {
    pub event_id: u32,
    pub event_channel: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub messages_received: u64,
    pub dropped_messages: u64,
    pub frames_emitted: u64,
    pub reconnects: u64,
    pub transport_errors: u64,
}

// CLIENT ----------------------------------------------------------------------

/// Data subscription plus the lazy-pirate heartbeat on the control channel.
///
/// Owns the bus exclusively. One call to [`StreamClient::poll_cycle`] services
/// the heartbeat, expires stale partial frames and waits at most the poll
/// timeout for a single message.
pub struct StreamClient<B: MessageBus> {
    config: StreamConfig,
    bus: B,
    clock: Arc<dyn Clock>,
    assembler: FrameAssembler,
    uuid: String,
    last_heartbeat: Option<Instant>,
    last_reply: Instant,
    awaiting_reply: bool,
    parameters: Map<String, Value>,
    last_message_num: Option<i64>,
    stats: ClientStats,
}

impl<B: MessageBus> StreamClient<B> {
    pub fn new(config: StreamConfig, bus: B, clock: Arc<dyn Clock>) -> Self {
        let assembler = FrameAssembler::new(
            config.expected_channel_count,
            Duration::from_millis(config.partial_frame_timeout_ms),
        );
        let last_reply = clock.now();
        Self {
            config,
            bus,
            clock,
            assembler,
            uuid: uuid::Uuid::new_v4().to_string(),
            last_heartbeat: None,
            last_reply,
            awaiting_reply: false,
            parameters: Map::new(),
            last_message_num: None,
            stats: ClientStats::default(),
        }
    }

    pub fn connect(&mut self) -> Result<(), StreamError> {
        self.bus.connect()?;
        self.last_heartbeat = None;
        self.last_reply = self.clock.now();
        self.awaiting_reply = false;
        log::info!(
            "Stream client {} connected ({} channels expected)",
            self.uuid,
            self.config.expected_channel_count
        );
        Ok(())
    }

    pub fn close(&mut self) {
        self.bus.close();
        log::info!(
            "Stream client closed: {} messages, {} frames, {} dropped, {} reconnects",
            self.stats.messages_received,
            self.stats.frames_emitted,
            self.stats.dropped_messages,
            self.stats.reconnects
        );
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.config.poll_timeout_ms)
    }

    pub fn poll_cycle(&mut self) -> Option<Frame> {
        self.service_heartbeat();
        self.assembler.expire(self.clock.now());

        match self.bus.poll(self.poll_timeout()) {
            Ok(Some(Inbound::Data(parts))) => match self.handle_data(&parts) {
                Ok(frame) => frame,
                Err(e) => {
                    self.stats.dropped_messages += 1;
                    log::warn!("Dropping stream message: {}", e);
                    None
                }
            },
            Ok(Some(Inbound::Reply(_))) => {
                self.awaiting_reply = false;
                self.last_reply = self.clock.now();
                log::debug!("Heartbeat reply received");
                None
            }
            Ok(None) => None,
            Err(e) => {
                self.stats.transport_errors += 1;
                if self.stats.transport_errors % 1000 == 1 {
                    log::warn!(
                        "{} (transport errors so far: {})",
                        e,
                        self.stats.transport_errors
                    );
                }
                std::thread::sleep(self.poll_timeout());
                None
            }
        }
    }

    /// Decodes one data-channel message and feeds it to the assembler.
    pub fn handle_data(&mut self, parts: &[Bytes]) -> Result<Option<Frame>, StreamError> {
        self.stats.messages_received += 1;
        let message = parse_message(parts, self.config.envelope_frame)?;

        if let Some(previous) = self.last_message_num {
            if message.message_num > previous + 1 {
                log::debug!(
                    "Message gap: {} missing before {}",
                    message.message_num - previous - 1,
                    message.message_num
                );
            }
        }
        self.last_message_num = Some(message.message_num);

        match message.body {
            MessageBody::Data(fragment) => {
                let now = self.clock.now();
                let receipt_time_ms = self.clock.wall_millis();
                let frame = self.assembler.insert(fragment, now, receipt_time_ms);
                if frame.is_some() {
                    self.stats.frames_emitted += 1;
                }
                Ok(frame)
            }
            MessageBody::Event | MessageBody::Spike => Ok(None),
            MessageBody::Param(params) => {
                log::info!("Stream parameters updated: {:?}", params.keys().collect::<Vec<_>>());
                self.parameters.extend(params);
                Ok(None)
            }
        }
    }

    fn service_heartbeat(&mut self) {
        let now = self.clock.now();
        let interval = Duration::from_millis(self.config.heartbeat_interval_ms);
        let due = self
            .last_heartbeat
            .map_or(true, |t| now.saturating_duration_since(t) > interval);
        if !due {
            return;
        }
        self.last_heartbeat = Some(now);

        if self.awaiting_reply {
            let silent = now.saturating_duration_since(self.last_reply);
            if silent > Duration::from_millis(self.config.reconnect_timeout_ms) {
                let stale = StreamError::StaleConnection(silent.as_millis() as u64);
                log::warn!("{}, recreating control socket", stale);
                if let Err(e) = self.bus.reset_control() {
                    log::warn!("Control socket reset failed: {}", e);
                }
                self.awaiting_reply = false;
                self.last_reply = now;
                self.stats.reconnects += 1;
                return;
            }
            log::debug!("Heartbeat unanswered for {} ms, retrying", silent.as_millis());
        }

        let heartbeat = json!({
            "application": self.config.application_name,
            "uuid": self.uuid,
            "type": "heartbeat",
        });
        if let Err(e) = self.bus.send_request(heartbeat.to_string().into_bytes()) {
            log::debug!("Heartbeat send failed: {}", e);
        }
        self.awaiting_reply = true;
    }

    /// Sends a TTL event on the control channel. Returns `false` without
    /// sending while a reply is still pending.
    pub fn send_event(&mut self, sample_num: i64, event: TtlEvent) -> Result<bool, StreamError> {
        if self.awaiting_reply {
            return Ok(false);
        }

        let request = json!({
            "application": self.config.application_name,
            "uuid": self.uuid,
            "type": "event",
            "event": {
                "type": TTL_EVENT_TYPE,
                "sample_num": sample_num,
                "event_id": event.event_id % 2 + 1,
                "event_channel": event.event_channel,
            },
        });
        self.bus.send_request(request.to_string().into_bytes())?;
        self.awaiting_reply = true;
        Ok(true)
    }

    pub fn awaiting_reply(&self) -> bool {
        self.awaiting_reply
    }

    pub fn reconnect_count(&self) -> u64 {
        self.stats.reconnects
    }

    pub fn stats(&self) -> ClientStats {
        self.stats
    }

    pub fn assembler_stats(&self) -> AssemblerStats {
        self.assembler.stats()
    }

    pub fn parameters(&self) -> &Map<String, Value> {
        &self.parameters
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}
