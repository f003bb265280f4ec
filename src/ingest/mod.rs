use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::processing::conditioner::SignalConditioner;
use crate::stream::{Frame, MessageBus, StreamClient, TtlEvent};
use crate::utils::clock::Clock;

use crossbeam_channel::{bounded, never, Receiver, Sender, TrySendError};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const CONNECT_RETRY: Duration = Duration::from_millis(250);

/// One frame reduced to the conditioned differential signal.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionedFrame {
    pub timestamp: i64,
    pub sample_id: i64,
    pub receipt_time_ms: i64,
    pub samples: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    FrameReady(ConditionedFrame),
    /// Last event the worker sends.
    Stopped,
}

#[derive(Debug, Default)]
pub struct IngestStats {
    frames_emitted: AtomicU64,
    frames_dropped: AtomicU64,
    frames_skipped: AtomicU64,
    markers_sent: AtomicU64,
}

impl IngestStats {
    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted.load(Ordering::Relaxed)
    }

    /// Frames discarded because the consumer fell behind.
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    /// Frames the conditioner could not use.
    pub fn frames_skipped(&self) -> u64 {
        self.frames_skipped.load(Ordering::Relaxed)
    }

    pub fn markers_sent(&self) -> u64 {
        self.markers_sent.load(Ordering::Relaxed)
    }
}

// HAND-OFF --------------------------------------------------------------------

/// Bounded queue that evicts the oldest entry when full.
///
/// The worker is the only sender, but it also holds a clone of the receiving
/// end so it can pop the oldest event itself. The channel therefore has two
/// receivers: the consumer and this eviction path. An evicted event never
/// reaches the consumer, and eviction only happens while the queue is full.
struct Handoff {
    tx: Sender<IngestEvent>,
    evict: Receiver<IngestEvent>,
    stats: Arc<IngestStats>,
}

impl Handoff {
    fn push(&self, event: IngestEvent) {
        let mut event = event;
        loop {
            match self.tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    if self.evict.try_recv().is_ok() {
                        self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    event = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

// LOOP ------------------------------------------------------------------------

pub struct IngestHandle {
    events: Receiver<IngestEvent>,
    cancel: Arc<AtomicBool>,
    stats: Arc<IngestStats>,
    worker: Option<JoinHandle<()>>,
}

impl IngestHandle {
    pub fn events(&self) -> &Receiver<IngestEvent> {
        &self.events
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Cancels the worker and waits for it to close its sockets.
    pub fn join(mut self) {
        self.cancel();
        self.wait();
    }

    fn wait(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Ingest worker panicked");
            }
        }
    }
}

impl Drop for IngestHandle {
    fn drop(&mut self) {
        self.cancel();
        self.wait();
    }
}

/// Runs a [`StreamClient`] on its own thread and hands conditioned frames to
/// the consumer.
pub struct IngestLoop<B: MessageBus> {
    client: StreamClient<B>,
    conditioner: SignalConditioner,
    handoff: Handoff,
    cancel: Arc<AtomicBool>,
    markers: Receiver<TtlEvent>,
    queued_markers: VecDeque<TtlEvent>,
    last_sample_id: i64,
}

impl<B: MessageBus + 'static> IngestLoop<B> {
    /// Starts the worker. The bus is built on the worker thread so that any
    /// runtime it owns lives there.
    pub fn spawn<F>(
        bus_factory: F,
        config: StreamConfig,
        clock: Arc<dyn Clock>,
        conditioner: SignalConditioner,
    ) -> io::Result<IngestHandle>
    where
        F: FnOnce() -> Result<B, StreamError> + Send + 'static,
    {
        Self::spawn_with_markers(bus_factory, config, clock, conditioner, never())
    }

    /// As [`IngestLoop::spawn`], also forwarding every TTL marker received on
    /// `markers` to the acquisition server, stamped with the latest sample id.
    pub fn spawn_with_markers<F>(
        bus_factory: F,
        config: StreamConfig,
        clock: Arc<dyn Clock>,
        conditioner: SignalConditioner,
        markers: Receiver<TtlEvent>,
    ) -> io::Result<IngestHandle>
    where
        F: FnOnce() -> Result<B, StreamError> + Send + 'static,
    {
        let (tx, events) = bounded(config.handoff_capacity.max(1));
        let evict = events.clone();
        let cancel = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(IngestStats::default());

        let handoff = Handoff {
            tx,
            evict,
            stats: stats.clone(),
        };
        let worker_cancel = cancel.clone();

        let worker = thread::Builder::new()
            .name("ingest".to_string())
            .spawn(move || {
                let bus = match bus_factory() {
                    Ok(bus) => bus,
                    Err(e) => {
                        log::error!("Could not create stream bus: {}", e);
                        handoff.push(IngestEvent::Stopped);
                        return;
                    }
                };
                let mut ingest = IngestLoop {
                    client: StreamClient::new(config, bus, clock),
                    conditioner,
                    handoff,
                    cancel: worker_cancel,
                    markers,
                    queued_markers: VecDeque::new(),
                    last_sample_id: 0,
                };
                ingest.run();
            })?;

        Ok(IngestHandle {
            events,
            cancel,
            stats,
            worker: Some(worker),
        })
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn connect(&mut self) -> bool {
        let mut attempts = 0u64;
        while !self.cancelled() {
            match self.client.connect() {
                Ok(()) => return true,
                Err(e) => {
                    attempts += 1;
                    if attempts == 1 || attempts % 20 == 0 {
                        log::warn!("Connect attempt {} failed: {}", attempts, e);
                    }
                    self.back_off();
                }
            }
        }
        false
    }

    /// Waits out the retry interval, checking for cancel once per poll timeout.
    fn back_off(&self) {
        let step = self.client.poll_timeout().max(Duration::from_millis(1));
        let deadline = Instant::now() + CONNECT_RETRY;
        while !self.cancelled() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return;
            }
            thread::sleep(step.min(left));
        }
    }

    fn run(&mut self) {
        if self.connect() {
            log::info!("Ingest loop running");
            while !self.cancelled() {
                self.send_markers();
                if let Some(frame) = self.client.poll_cycle() {
                    self.last_sample_id = frame.sample_id;
                    self.forward(frame);
                }
            }
        }
        if !self.queued_markers.is_empty() {
            log::warn!("{} TTL markers were never sent", self.queued_markers.len());
        }

        self.client.close();
        log::info!(
            "Ingest loop stopped: {} frames emitted, {} dropped, {} skipped",
            self.handoff.stats.frames_emitted(),
            self.handoff.stats.frames_dropped(),
            self.handoff.stats.frames_skipped()
        );
        self.handoff.push(IngestEvent::Stopped);
    }

    /// Sends queued markers while the control channel is free. REQ allows one
    /// outstanding request, so at most one goes out per reply.
    fn send_markers(&mut self) {
        self.queued_markers.extend(self.markers.try_iter());
        while let Some(&event) = self.queued_markers.front() {
            match self.client.send_event(self.last_sample_id, event) {
                Ok(true) => {
                    self.queued_markers.pop_front();
                    self.handoff.stats.markers_sent.fetch_add(1, Ordering::Relaxed);
                }
                Ok(false) => return,
                Err(e) => {
                    log::warn!("Dropping TTL marker {:?}: {}", event, e);
                    self.queued_markers.pop_front();
                }
            }
        }
    }

    fn forward(&mut self, frame: Frame) {
        let samples = match self.conditioner.condition_frame(&frame) {
            Some(Ok(samples)) => samples,
            Some(Err(e)) => {
                log::warn!("Skipping frame {}: {}", frame.sample_id, e);
                self.handoff.stats.frames_skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            None => {
                log::debug!("Frame {} lacks the conditioned channel pair", frame.sample_id);
                self.handoff.stats.frames_skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let ready = ConditionedFrame {
            timestamp: frame.timestamp,
            sample_id: frame.sample_id,
            receipt_time_ms: frame.receipt_time_ms,
            samples,
        };
        self.handoff.push(IngestEvent::FrameReady(ready));
        self.handoff.stats.frames_emitted.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConditionerConfig;
    use crate::processing::filters::FilterInstance;
    use crate::stream::{ChannelBlock, ChannelFragment, ScriptedBus};
    use crate::stream::message::encode_data_message;
    use crate::utils::clock::SystemClock;
    use std::time::Instant;

    struct Passthrough;

    impl FilterInstance for Passthrough {
        fn id(&self) -> &str {
            "passthrough"
        }

        fn process_chunk(&mut self, input: &[f64]) -> Vec<f64> {
            input.to_vec()
        }

        fn reset(&mut self) {}
    }

    fn conditioner() -> SignalConditioner {
        SignalConditioner::with_filter(ConditionerConfig::default(), Box::new(Passthrough))
    }

    fn push_frame(bus: &ScriptedBus, sample_id: i64, a: f32, b: f32) {
        for (channel, level) in [(0, a), (1, b)] {
            let fragment = ChannelFragment {
                timestamp: sample_id,
                sample_id,
                block: ChannelBlock {
                    channel_index: channel,
                    sample_count: 4,
                    sample_rate: 5000.0,
                    stream_name: "emg".to_string(),
                    samples: vec![level; 4],
                },
            };
            bus.push_data(encode_data_message(sample_id * 2 + channel as i64, &fragment, true));
        }
    }

    fn config(capacity: usize) -> StreamConfig {
        StreamConfig {
            poll_timeout_ms: 1,
            handoff_capacity: capacity,
            ..StreamConfig::default()
        }
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn frames_arrive_conditioned_and_in_order() {
        let bus = ScriptedBus::new();
        for id in 0..3 {
            push_frame(&bus, id, 1.0, 1.0 + id as f32);
        }

        let worker_bus = bus.clone();
        let handle = IngestLoop::spawn(
            move || Ok(worker_bus),
            config(8),
            Arc::new(SystemClock),
            conditioner(),
        )
        .unwrap();

        let mut received = Vec::new();
        while received.len() < 3 {
            match handle.events().recv_timeout(Duration::from_secs(5)).unwrap() {
                IngestEvent::FrameReady(frame) => received.push(frame),
                IngestEvent::Stopped => panic!("stopped early"),
            }
        }

        assert_eq!(
            received.iter().map(|f| f.sample_id).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(received[2].samples, vec![2.0; 4]);
        assert_eq!(handle.stats().frames_emitted(), 3);

        let events = handle.events().clone();
        handle.join();
        assert!(bus.is_closed());
        assert_eq!(events.try_iter().last(), Some(IngestEvent::Stopped));
    }

    #[test]
    fn full_handoff_keeps_the_newest_frames() {
        let bus = ScriptedBus::new();
        for id in 0..10 {
            push_frame(&bus, id, 0.0, id as f32);
        }

        let worker_bus = bus.clone();
        let handle = IngestLoop::spawn(
            move || Ok(worker_bus),
            config(3),
            Arc::new(SystemClock),
            conditioner(),
        )
        .unwrap();

        wait_for(|| handle.stats().frames_emitted() == 10);
        let events = handle.events().clone();
        handle.join();

        let ids: Vec<i64> = events
            .try_iter()
            .filter_map(|e| match e {
                IngestEvent::FrameReady(frame) => Some(frame.sample_id),
                IngestEvent::Stopped => None,
            })
            .collect();
        // Stopped evicted one more frame on its way in.
        assert_eq!(ids, vec![8, 9]);
    }

    #[test]
    fn frames_without_the_conditioned_pair_are_skipped() {
        let bus = ScriptedBus::new();
        push_frame(&bus, 5, 1.0, 2.0);

        let worker_bus = bus.clone();
        let conditioner = SignalConditioner::with_filter(
            ConditionerConfig {
                channel_b: 3,
                ..ConditionerConfig::default()
            },
            Box::new(Passthrough),
        );
        let handle =
            IngestLoop::spawn(move || Ok(worker_bus), config(4), Arc::new(SystemClock), conditioner)
                .unwrap();

        wait_for(|| handle.stats().frames_skipped() == 1);
        assert_eq!(handle.stats().frames_emitted(), 0);
        handle.join();
    }

    #[test]
    fn cancel_during_connect_retries_still_stops() {
        let bus = ScriptedBus::new();
        bus.fail_next_connects(usize::MAX);

        let worker_bus = bus.clone();
        let handle = IngestLoop::spawn(
            move || Ok(worker_bus),
            config(4),
            Arc::new(SystemClock),
            conditioner(),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(20));

        let events = handle.events().clone();
        let started = Instant::now();
        handle.join();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(bus.connects(), 0);
        assert_eq!(events.try_iter().last(), Some(IngestEvent::Stopped));
    }

    #[test]
    fn failed_bus_factory_reports_stopped() {
        let handle = IngestLoop::<ScriptedBus>::spawn(
            || Err(StreamError::Transport("no route".into())),
            config(4),
            Arc::new(SystemClock),
            conditioner(),
        )
        .unwrap();

        let event = handle.events().recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event, IngestEvent::Stopped);
        handle.join();
    }

    #[test]
    fn cancel_during_connect_backoff_is_prompt() {
        let bus = ScriptedBus::new();
        bus.fail_next_connects(usize::MAX);

        let worker_bus = bus.clone();
        let handle = IngestLoop::spawn(
            move || Ok(worker_bus),
            config(4),
            Arc::new(SystemClock),
            conditioner(),
        )
        .unwrap();
        // Lands inside the first retry interval.
        thread::sleep(Duration::from_millis(30));

        let started = Instant::now();
        handle.join();
        assert!(started.elapsed() < CONNECT_RETRY / 2, "{:?}", started.elapsed());
    }

    #[test]
    fn markers_wait_for_the_control_channel_and_carry_the_latest_sample() {
        let bus = ScriptedBus::new();
        push_frame(&bus, 7, 0.0, 1.0);

        let (markers, marker_rx) = crossbeam_channel::unbounded();
        let worker_bus = bus.clone();
        let handle = IngestLoop::spawn_with_markers(
            move || Ok(worker_bus),
            config(4),
            Arc::new(SystemClock),
            conditioner(),
            marker_rx,
        )
        .unwrap();

        wait_for(|| handle.stats().frames_emitted() == 1);
        // The first heartbeat is still unanswered.
        assert_eq!(bus.sent_requests().len(), 1);
        markers
            .send(TtlEvent {
                event_id: 1,
                event_channel: 1,
            })
            .unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(handle.stats().markers_sent(), 0);

        bus.push_reply();
        wait_for(|| handle.stats().markers_sent() == 1);
        handle.join();

        let sent = bus.sent_requests();
        assert_eq!(sent.len(), 2);
        let event: serde_json::Value = serde_json::from_slice(&sent[1]).unwrap();
        assert_eq!(event["type"], "event");
        assert_eq!(event["event"]["sample_num"], 7);
        assert_eq!(event["event"]["event_channel"], 1);
    }
}
