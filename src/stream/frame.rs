use std::time::{Duration, Instant};

/// One channel's samples for a time-slice. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelBlock {
    pub channel_index: usize,
    pub sample_count: usize,
    pub sample_rate: f64,
    pub stream_name: String,
    pub samples: Vec<f32>,
}

/// A decoded data message: a channel block plus the slice it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelFragment {
    pub timestamp: i64,
    pub sample_id: i64,
    pub block: ChannelBlock,
}

/// One aligned time-slice across every expected channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub timestamp: i64,
    pub sample_id: i64,
    pub receipt_time_ms: i64,
    /// Sorted by channel index.
    pub channel_blocks: Vec<ChannelBlock>,
}

impl Frame {
    pub fn channel(&self, index: usize) -> Option<&ChannelBlock> {
        self.channel_blocks
            .binary_search_by_key(&index, |b| b.channel_index)
            .ok()
            .map(|i| &self.channel_blocks[i])
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    pub frames_completed: u64,
    pub partial_frames_discarded: u64,
    pub fragments_dropped: u64,
}

struct PartialFrame {
    timestamp: i64,
    sample_id: i64,
    started: Instant,
    blocks: Vec<ChannelBlock>,
}

// ASSEMBLER -------------------------------------------------------------------

/// Collects channel fragments into complete frames.
///
/// Fragments are binary-inserted by channel index, so arrival order does not
/// matter. A fragment from a different slice, or a partial frame older than
/// the timeout, discards whatever was pending.
pub struct FrameAssembler {
    expected_channel_count: usize,
    partial_frame_timeout: Duration,
    current: Option<PartialFrame>,
    stats: AssemblerStats,
}

impl FrameAssembler {
    pub fn new(expected_channel_count: usize, partial_frame_timeout: Duration) -> Self {
        Self {
            expected_channel_count,
            partial_frame_timeout,
            current: None,
            stats: AssemblerStats::default(),
        }
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    pub fn pending_channels(&self) -> usize {
        self.current.as_ref().map_or(0, |p| p.blocks.len())
    }

    /// Inserts a fragment and returns the frame it completes, if any.
    pub fn insert(
        &mut self,
        fragment: ChannelFragment,
        now: Instant,
        receipt_time_ms: i64,
    ) -> Option<Frame> {
        let channel = fragment.block.channel_index;
        if channel >= self.expected_channel_count {
            log::debug!(
                "Dropping fragment for channel {} (expecting {} channels)",
                channel,
                self.expected_channel_count
            );
            self.stats.fragments_dropped += 1;
            return None;
        }

        if let Some(partial) = &self.current {
            if partial.sample_id != fragment.sample_id {
                log::warn!(
                    "Discarding partial frame at sample {} with {}/{} channels",
                    partial.sample_id,
                    partial.blocks.len(),
                    self.expected_channel_count
                );
                self.stats.partial_frames_discarded += 1;
                self.current = None;
            }
        }

        let partial = self.current.get_or_insert_with(|| PartialFrame {
            timestamp: fragment.timestamp,
            sample_id: fragment.sample_id,
            started: now,
            blocks: Vec::with_capacity(self.expected_channel_count),
        });

        match partial
            .blocks
            .binary_search_by_key(&channel, |b| b.channel_index)
        {
            Ok(_) => {
                log::debug!(
                    "Dropping duplicate fragment for channel {} at sample {}",
                    channel,
                    fragment.sample_id
                );
                self.stats.fragments_dropped += 1;
                return None;
            }
            Err(pos) => partial.blocks.insert(pos, fragment.block),
        }

        if partial.blocks.len() < self.expected_channel_count {
            return None;
        }

        let done = self.current.take()?;
        self.stats.frames_completed += 1;
        Some(Frame {
            timestamp: done.timestamp,
            sample_id: done.sample_id,
            receipt_time_ms,
            channel_blocks: done.blocks,
        })
    }

    /// Drops a partial frame that has waited longer than the timeout.
    pub fn expire(&mut self, now: Instant) -> bool {
        let stale = self.current.as_ref().map_or(false, |p| {
            now.saturating_duration_since(p.started) > self.partial_frame_timeout
        });
        if stale {
            if let Some(p) = self.current.take() {
                log::warn!(
                    "Partial frame at sample {} timed out with {}/{} channels",
                    p.sample_id,
                    p.blocks.len(),
                    self.expected_channel_count
                );
            }
            self.stats.partial_frames_discarded += 1;
        }
        stale
    }
}
