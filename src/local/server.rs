// Bench server standing in for the Open Ephys ZMQ interface plugin: publishes
// multi-channel EMG on the data endpoint and answers control requests.
use crate::config::{Config, StreamConfig};
use crate::stream::message::encode_data_message;
use crate::stream::{ChannelBlock, ChannelFragment};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::error::Error;
use std::f64::consts::PI;
use std::fs::File;
use std::path::Path;
use std::time::Duration;
use zeromq::{PubSocket, RepSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

const CHUNK_MS: u64 = 10;
const STREAM_NAME: &str = "example_data";

// -----------------------------------------------------------------------------
// SIGNAL SOURCES
// -----------------------------------------------------------------------------

/// Produces one chunk of samples per channel on each call.
pub trait SignalSource: Send {
    fn next_chunk(&mut self, samples_per_channel: usize) -> Vec<Vec<f32>>;
}

/// Channel 0 carries the common-mode noise; every other channel adds an EMG
/// envelope that alternates between rest and activity.
pub struct SyntheticEmg {
    rng: StdRng,
    channel_count: usize,
    fs: f64,
    t: f64,
}

const REST_UV: f64 = 4.0;
const ACTIVE_UV: f64 = 60.0;
const ACTIVITY_PERIOD_S: f64 = 7.0;
const MAINS_HZ: f64 = 60.0;

impl SyntheticEmg {
    pub fn new(channel_count: usize, fs: f64) -> Self {
        Self {
            rng: StdRng::from_entropy(),
            channel_count: channel_count.max(2),
            fs,
            t: 0.0,
        }
    }

    pub fn seeded(channel_count: usize, fs: f64, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            ..Self::new(channel_count, fs)
        }
    }

    fn envelope(&self) -> f64 {
        // Active for the second half of each period.
        let phase = (self.t / ACTIVITY_PERIOD_S).fract();
        if phase < 0.5 {
            REST_UV
        } else {
            ACTIVE_UV
        }
    }
}

impl SignalSource for SyntheticEmg {
    fn next_chunk(&mut self, samples_per_channel: usize) -> Vec<Vec<f32>> {
        let mut channels = vec![Vec::with_capacity(samples_per_channel); self.channel_count];
        let dt = 1.0 / self.fs;

        for _ in 0..samples_per_channel {
            let common = 200.0 * (2.0 * PI * MAINS_HZ * self.t).sin()
                + self.rng.gen_range(-5.0..5.0);
            channels[0].push(common as f32);

            let amplitude = self.envelope();
            for channel in channels.iter_mut().skip(1) {
                let emg = amplitude * self.rng.gen_range(-1.0..1.0);
                channel.push((common + emg) as f32);
            }
            self.t += dt;
        }
        channels
    }
}

/// Replays CSV columns (one per channel) in a loop.
pub struct CsvReplay {
    columns: Vec<Vec<f32>>,
    position: usize,
}

impl CsvReplay {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn Error>> {
        let mut rdr = csv::Reader::from_reader(File::open(path)?);
        let mut columns: Vec<Vec<f32>> = Vec::new();

        for result in rdr.records() {
            let record = result?;
            if columns.is_empty() {
                columns = vec![Vec::new(); record.len()];
            }
            for (index, value) in record.iter().enumerate().take(columns.len()) {
                columns[index].push(value.trim().parse()?);
            }
        }

        if columns.is_empty() || columns[0].is_empty() {
            return Err("signal file has no samples".into());
        }
        Ok(Self {
            columns,
            position: 0,
        })
    }

    pub fn channel_count(&self) -> usize {
        self.columns.len()
    }
}

impl SignalSource for CsvReplay {
    fn next_chunk(&mut self, samples_per_channel: usize) -> Vec<Vec<f32>> {
        let len = self.columns[0].len();
        let chunk = self
            .columns
            .iter()
            .map(|column| {
                (0..samples_per_channel)
                    .map(|i| column[(self.position + i) % len])
                    .collect()
            })
            .collect();
        self.position = (self.position + samples_per_channel) % len;
        chunk
    }
}

// -----------------------------------------------------------------------------
// RUN CODE
// -----------------------------------------------------------------------------

pub fn run(config: &Config, csv_path: Option<&str>) -> Result<(), Box<dyn Error>> {
    let fs = config.conditioner.fs;
    let source: Box<dyn SignalSource> = match csv_path {
        Some(path) => {
            let replay = CsvReplay::from_path(path)?;
            log::info!("Replaying {} channels from {}", replay.channel_count(), path);
            Box::new(replay)
        }
        None => {
            log::info!("Publishing synthetic EMG on {} channels", config.stream.expected_channel_count);
            Box::new(SyntheticEmg::new(config.stream.expected_channel_count, fs))
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;
    runtime.block_on(serve(config.stream.clone(), fs, source))
}

async fn serve(
    stream: StreamConfig,
    fs: f64,
    mut source: Box<dyn SignalSource>,
) -> Result<(), Box<dyn Error>> {
    let mut publisher = PubSocket::new();
    publisher.bind(&stream.data_endpoint).await?;
    let mut control = RepSocket::new();
    control.bind(&stream.control_endpoint).await?;
    println!(
        "Serving data on {} and control on {}",
        stream.data_endpoint, stream.control_endpoint
    );

    tokio::spawn(async move {
        loop {
            match control.recv().await {
                Ok(request) => {
                    if let Some(body) = request.get(0) {
                        log::debug!("Control request: {}", String::from_utf8_lossy(body));
                    }
                    if let Err(e) = control.send(ZmqMessage::from("ok")).await {
                        log::warn!("Control reply failed: {}", e);
                    }
                }
                Err(e) => {
                    log::warn!("Control receive failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    });

    let samples_per_chunk = ((fs * CHUNK_MS as f64) / 1000.0).round() as usize;
    let mut ticker = tokio::time::interval(Duration::from_millis(CHUNK_MS));
    let mut message_num: i64 = 0;
    let mut sample_id: i64 = 0;

    loop {
        ticker.tick().await;
        let chunk = source.next_chunk(samples_per_chunk);

        for (channel_index, samples) in chunk.into_iter().enumerate() {
            let fragment = ChannelFragment {
                timestamp: sample_id,
                sample_id,
                block: ChannelBlock {
                    channel_index,
                    sample_count: samples.len(),
                    sample_rate: fs,
                    stream_name: STREAM_NAME.to_string(),
                    samples,
                },
            };
            let parts = encode_data_message(message_num, &fragment, stream.envelope_frame);
            message_num += 1;

            if let Some(message) = to_message(parts) {
                if let Err(e) = publisher.send(message).await {
                    log::warn!("Publish failed: {}", e);
                }
            }
        }
        sample_id += samples_per_chunk as i64;
    }
}

fn to_message(parts: Vec<Bytes>) -> Option<ZmqMessage> {
    let mut parts = parts.into_iter();
    let mut message = ZmqMessage::from(parts.next()?);
    for part in parts {
        message.push_back(part);
    }
    Some(message)
}
