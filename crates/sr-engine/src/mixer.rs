//! Per-sink mixing and transmit
//!
//! One mixer thread per sink. Each cycle: gate on the sync barrier (when
//! enabled), drain at most one chunk per input lane, mix with
//! loudness-preserving headroom, hand the payload to the network sender,
//! and tee it into any registered PCM taps. Cycle pacing follows a
//! deadline accumulator scaled by the clock's rate adjustment.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use sr_core::{AudioFormat, MonoTime, Sample, CHUNK_FRAMES};
use sr_dsp::soft_clip;
use sr_net::{encode_payload, NetworkSender};

use crate::clock::SinkTimingReport;
use crate::config::SinkConfig;
use crate::coordinator::SinkSynchronizationCoordinator;
use crate::lane::SinkInputLane;
use crate::settings::MixerTuning;

/// Consecutive send failures before the sender is disabled
const MAX_SEND_FAILURES: u32 = 10;
/// Consecutive barrier timeouts before sync counts as degraded
const DEGRADED_SYNC_TIMEOUTS: u32 = 5;

const FULL_SCALE: Sample = 2_147_483_648.0;

pub enum MixerCommand {
    AddLane(SinkInputLane),
    RemoveLane { source_instance: u64 },
    AddTap(Sender<Vec<u8>>),
    SetTuning(MixerTuning),
    /// Shutdown ordering: release the socket before the thread stops
    StopSender,
    Stop,
}

#[derive(Debug, Default)]
pub struct SinkCounters {
    pub cycles: AtomicU64,
    pub underruns: AtomicU64,
    pub barrier_timeouts: AtomicU64,
    pub send_failures: AtomicU64,
    pub tap_drops: AtomicU64,
    /// Total frames emitted
    pub total_samples: AtomicU64,
    pub last_rtp: AtomicU64,
    pub buffer_fill: AtomicU64,
    pub healthy: AtomicBool,
    pub sync_degraded: AtomicBool,
}

impl SinkCounters {
    pub fn buffer_fill_value(&self) -> f64 {
        f64::from_bits(self.buffer_fill.load(Ordering::Relaxed))
    }
}

pub struct SinkAudioMixer {
    sink_id: String,
    format: AudioFormat,
    volume_normalization: bool,
    tuning: MixerTuning,
    sender: NetworkSender,
    coordinator: Option<SinkSynchronizationCoordinator>,
    lanes: Vec<SinkInputLane>,
    taps: Vec<Sender<Vec<u8>>>,
    counters: Arc<SinkCounters>,

    accumulator: Vec<Sample>,
    quantized: Vec<i32>,
    payload: Vec<u8>,

    rtp_cursor: u32,
    rate_adjustment: f64,
    consecutive_send_failures: u32,
    consecutive_timeouts: u32,
    sender_disabled: bool,
    prev_cycle_silent: bool,
}

impl SinkAudioMixer {
    pub fn new(
        config: &SinkConfig,
        sender: NetworkSender,
        coordinator: Option<SinkSynchronizationCoordinator>,
        tuning: MixerTuning,
    ) -> Self {
        let format = AudioFormat {
            sample_rate: config.sample_rate,
            channels: config.channels,
            bit_depth: config.bit_depth,
        };
        let samples = CHUNK_FRAMES * format.channels as usize;
        let counters = Arc::new(SinkCounters {
            healthy: AtomicBool::new(true),
            ..Default::default()
        });
        let initial_rtp = coordinator
            .as_ref()
            .map_or(0, |c| c.clock().current_playback_timestamp());
        Self {
            sink_id: config.id.clone(),
            format,
            volume_normalization: config.volume_normalization,
            tuning,
            sender,
            coordinator,
            lanes: Vec::new(),
            taps: Vec::new(),
            counters,
            accumulator: vec![0.0; samples],
            quantized: vec![0i32; samples],
            payload: Vec::with_capacity(samples * format.bytes_per_sample()),
            rtp_cursor: initial_rtp,
            rate_adjustment: 1.0,
            consecutive_send_failures: 0,
            consecutive_timeouts: 0,
            sender_disabled: false,
            prev_cycle_silent: true,
        }
    }

    pub fn sink_id(&self) -> &str {
        &self.sink_id
    }

    pub fn counters(&self) -> Arc<SinkCounters> {
        self.counters.clone()
    }

    pub fn chunk_duration_secs(&self) -> f64 {
        CHUNK_FRAMES as f64 / self.format.sample_rate as f64
    }

    /// Enable coordination after construction (used once at startup)
    pub fn enable_sync(&mut self, now: MonoTime) {
        if let Some(coordinator) = self.coordinator.as_mut() {
            coordinator.enable(self.rtp_cursor, now);
        }
    }

    pub fn handle_command(&mut self, command: MixerCommand) -> bool {
        match command {
            MixerCommand::AddLane(lane) => {
                self.lanes
                    .retain(|l| l.source_instance != lane.source_instance);
                self.lanes.push(lane);
            }
            MixerCommand::RemoveLane { source_instance } => {
                self.lanes.retain(|l| l.source_instance != source_instance);
            }
            MixerCommand::AddTap(tap) => self.taps.push(tap),
            MixerCommand::SetTuning(tuning) => self.tuning = tuning,
            MixerCommand::StopSender => {
                self.sender.stop();
                self.sender_disabled = true;
            }
            MixerCommand::Stop => return false,
        }
        true
    }

    /// One dispatch cycle: barrier, drain, mix, send, tee, report.
    /// Returns the rate adjustment for pacing the next cycle.
    pub fn run_cycle(&mut self, now: MonoTime) -> f64 {
        let (adjustment, timed_out) = self
            .coordinator
            .as_mut()
            .map_or((1.0, false), |c| c.begin_dispatch());
        self.rate_adjustment = adjustment;
        if timed_out {
            self.counters.barrier_timeouts.fetch_add(1, Ordering::Relaxed);
            self.consecutive_timeouts += 1;
            if self.consecutive_timeouts >= DEGRADED_SYNC_TIMEOUTS {
                self.counters.sync_degraded.store(true, Ordering::Relaxed);
            }
        } else {
            self.consecutive_timeouts = 0;
            self.counters.sync_degraded.store(false, Ordering::Relaxed);
        }

        // Drain one chunk per lane into the accumulator
        self.accumulator.fill(0.0);
        let grace = self.tuning.underrun_hold_timeout_ms as f64 / 1000.0;
        let min_ready = self.tuning.min_input_queue_chunks;
        let mut contributors = 0usize;
        let mut fill = 0.0f64;
        for lane in &mut self.lanes {
            fill += lane.buffered() as f64;
            if !lane.is_started() && lane.buffered() < min_ready {
                continue; // still prebuffering
            }
            match lane.pop() {
                Some(chunk) => {
                    lane.mark_delivered();
                    let samples = chunk.samples();
                    let n = samples.len().min(self.accumulator.len());
                    for i in 0..n {
                        self.accumulator[i] += samples[i] as Sample / FULL_SCALE;
                    }
                    contributors += 1;
                }
                None => {
                    if lane.mark_empty(now, grace) {
                        self.counters.underruns.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        // Loudness handling when several lanes land on the same chunk
        if contributors > 1 {
            if self.volume_normalization {
                let scale = 1.0 / contributors as Sample;
                for sample in &mut self.accumulator {
                    *sample *= scale;
                }
            } else {
                for sample in &mut self.accumulator {
                    *sample = soft_clip(*sample);
                }
            }
        }

        self.quantized.clear();
        for &sample in &self.accumulator {
            let v = (sample * FULL_SCALE).clamp(-FULL_SCALE, FULL_SCALE - 1.0);
            self.quantized.push(v as i32);
        }
        self.payload.clear();
        encode_payload(&self.quantized, self.format.bit_depth, &mut self.payload);

        let marker = self.prev_cycle_silent && contributors > 0;
        if !self.sender_disabled {
            match self.sender.send(&self.payload, self.rtp_cursor, marker) {
                Ok(()) => self.consecutive_send_failures = 0,
                Err(e) => {
                    self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                    self.consecutive_send_failures += 1;
                    if self.consecutive_send_failures >= MAX_SEND_FAILURES {
                        log::warn!("sink {}: sender disabled after {e}", self.sink_id);
                        self.sender.stop();
                        self.sender_disabled = true;
                        self.counters.healthy.store(false, Ordering::Relaxed);
                    }
                }
            }
        }

        for tap in &self.taps {
            match tap.try_send(self.payload.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    self.counters.tap_drops.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.prev_cycle_silent = contributors == 0;
        self.rtp_cursor = self.rtp_cursor.wrapping_add(CHUNK_FRAMES as u32);
        self.counters.cycles.fetch_add(1, Ordering::Relaxed);
        let total = self
            .counters
            .total_samples
            .fetch_add(CHUNK_FRAMES as u64, Ordering::Relaxed)
            + CHUNK_FRAMES as u64;
        self.counters
            .last_rtp
            .store(self.rtp_cursor as u64, Ordering::Relaxed);

        let buffer_fill = if self.lanes.is_empty() {
            0.0
        } else {
            fill / (self.lanes.len() * self.tuning.max_input_queue_chunks.max(1)) as f64
        };
        self.counters
            .buffer_fill
            .store(buffer_fill.to_bits(), Ordering::Relaxed);

        if let Some(coordinator) = self.coordinator.as_mut() {
            self.rate_adjustment = coordinator.complete_dispatch(
                SinkTimingReport {
                    samples_output: total,
                    last_rtp_timestamp: self.rtp_cursor,
                    underruns: self.counters.underruns.load(Ordering::Relaxed),
                    buffer_fill,
                },
                now,
            );
        }
        self.rate_adjustment
    }
}

/// Run a mixer until `Stop`, pacing cycles on a deadline accumulator
pub fn spawn_mixer_worker(
    mut mixer: SinkAudioMixer,
    commands: Receiver<MixerCommand>,
) -> thread::JoinHandle<()> {
    let name = format!("mixer-{}", mixer.sink_id());
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            log::debug!("mixer {} started", mixer.sink_id());
            mixer.enable_sync(MonoTime::now());
            let mut next_deadline = MonoTime::now();
            'run: loop {
                while let Ok(command) = commands.try_recv() {
                    if !mixer.handle_command(command) {
                        break 'run;
                    }
                }
                let now = MonoTime::now();
                let adjustment = match catch_unwind(AssertUnwindSafe(|| mixer.run_cycle(now))) {
                    Ok(adjustment) => adjustment,
                    Err(_) => {
                        mixer.counters.healthy.store(false, Ordering::Relaxed);
                        log::error!("mixer {} caught a cycle panic", mixer.sink_id());
                        1.0
                    }
                };
                next_deadline = next_deadline + mixer.chunk_duration_secs() / adjustment.max(0.5);
                let now = MonoTime::now();
                if next_deadline > now {
                    thread::sleep(Duration::from_secs_f64(next_deadline - now));
                } else if now - next_deadline > 0.25 {
                    // Way behind (stall or suspend): resynchronize pacing
                    next_deadline = now;
                }
            }
            if let Some(coordinator) = mixer.coordinator.as_mut() {
                coordinator.disable();
            }
            mixer.sender.stop();
            log::debug!("mixer {} stopped", mixer.sink_id());
        })
        .expect("spawn mixer worker")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SinkProtocol;
    use crate::lane::create_lane;
    use crossbeam_channel::bounded;
    use sr_core::{ChunkPool, ProcessedAudioChunk};
    use std::net::UdpSocket;

    fn sink_config(port: u16, normalize: bool) -> SinkConfig {
        SinkConfig {
            id: "test-sink".into(),
            output_ip: "127.0.0.1".into(),
            output_port: port,
            sample_rate: 48000,
            channels: 2,
            bit_depth: 16,
            channel_layout: None,
            protocol: SinkProtocol::Scream,
            enable_mp3: false,
            time_sync_enabled: false,
            time_sync_delay_ms: 0,
            speaker_layout: None,
            volume_normalization: normalize,
        }
    }

    fn mixer_to(port: u16, normalize: bool) -> SinkAudioMixer {
        let config = sink_config(port, normalize);
        let dest = format!("{}:{}", config.output_ip, config.output_port)
            .parse()
            .unwrap();
        let sender = NetworkSender::scream(
            dest,
            config.format().unwrap(),
            config.layout_mask(),
            CHUNK_FRAMES * 4,
        )
        .unwrap();
        SinkAudioMixer::new(&config, sender, None, MixerTuning::default())
    }

    fn chunk_of(pool: &ChunkPool, value: i32) -> ProcessedAudioChunk {
        let mut buf = pool.acquire();
        buf.fill(value);
        ProcessedAudioChunk::new(
            buf,
            "src".into(),
            0,
            MonoTime::from_secs(0.0),
            AudioFormat::default(),
            Some(pool.recycler()),
        )
    }

    fn lane_with_chunks(
        instance: u64,
        pool: &ChunkPool,
        values: &[i32],
    ) -> crate::lane::SinkInputLane {
        let (mut tx, rx) = create_lane(instance, 8, Arc::new(AtomicU64::new(0)));
        for &v in values {
            tx.push(chunk_of(pool, v));
        }
        rx
    }

    fn local_receiver() -> (UdpSocket, u16) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, port)
    }

    #[test]
    fn test_single_lane_payload_reaches_tap() {
        let (_rx_socket, port) = local_receiver();
        let mut mixer = mixer_to(port, false);
        let pool = ChunkPool::new(8, CHUNK_FRAMES * 2);
        let value = 0x0404_0000;
        mixer.handle_command(MixerCommand::AddLane(lane_with_chunks(
            1,
            &pool,
            &[value, value],
        )));
        let (tap_tx, tap_rx) = bounded(8);
        mixer.handle_command(MixerCommand::AddTap(tap_tx));

        mixer.run_cycle(MonoTime::from_secs(1.0));
        let payload = tap_rx.try_recv().unwrap();
        assert_eq!(payload.len(), CHUNK_FRAMES * 2 * 2);
        // 16-bit little-endian samples carry the chunk's high 16 bits
        let sample = i16::from_le_bytes([payload[0], payload[1]]);
        assert_eq!(sample, 0x0404);
    }

    #[test]
    fn test_two_lanes_sum() {
        let (_rx_socket, port) = local_receiver();
        let mut mixer = mixer_to(port, false);
        let pool = ChunkPool::new(8, CHUNK_FRAMES * 2);
        let a = 0x0100_0000;
        mixer.handle_command(MixerCommand::AddLane(lane_with_chunks(1, &pool, &[a, a])));
        mixer.handle_command(MixerCommand::AddLane(lane_with_chunks(2, &pool, &[a, a])));
        let (tap_tx, tap_rx) = bounded(8);
        mixer.handle_command(MixerCommand::AddTap(tap_tx));

        mixer.run_cycle(MonoTime::from_secs(1.0));
        let payload = tap_rx.try_recv().unwrap();
        let sample = i16::from_le_bytes([payload[0], payload[1]]);
        // Sum of two small equal contributions, soft clip negligible
        assert!((sample as i32 - 0x0200).abs() <= 1, "{sample:#x}");
    }

    #[test]
    fn test_volume_normalization_divides_by_lane_count() {
        let (_rx_socket, port) = local_receiver();
        let mut mixer = mixer_to(port, true);
        let pool = ChunkPool::new(8, CHUNK_FRAMES * 2);
        let a = 0x0200_0000;
        mixer.handle_command(MixerCommand::AddLane(lane_with_chunks(1, &pool, &[a])));
        mixer.handle_command(MixerCommand::AddLane(lane_with_chunks(2, &pool, &[a])));
        let (tap_tx, tap_rx) = bounded(8);
        mixer.handle_command(MixerCommand::AddTap(tap_tx));

        mixer.run_cycle(MonoTime::from_secs(1.0));
        let payload = tap_rx.try_recv().unwrap();
        let sample = i16::from_le_bytes([payload[0], payload[1]]);
        assert!((sample as i32 - 0x0200).abs() <= 1, "{sample:#x}");
    }

    #[test]
    fn test_underrun_after_grace_period() {
        let (_rx_socket, port) = local_receiver();
        let mut mixer = mixer_to(port, false);
        let pool = ChunkPool::new(8, CHUNK_FRAMES * 2);
        mixer.handle_command(MixerCommand::AddLane(lane_with_chunks(
            1,
            &pool,
            &[1, 1], // enough to clear the prebuffer threshold
        )));

        mixer.run_cycle(MonoTime::from_secs(1.0));
        mixer.run_cycle(MonoTime::from_secs(1.024));
        // Lane is now dry; grace is 50 ms
        mixer.run_cycle(MonoTime::from_secs(1.048));
        assert_eq!(mixer.counters.underruns.load(Ordering::Relaxed), 0);
        mixer.run_cycle(MonoTime::from_secs(1.12));
        assert_eq!(mixer.counters.underruns.load(Ordering::Relaxed), 1);
        // Still dry: no double charge
        mixer.run_cycle(MonoTime::from_secs(1.2));
        assert_eq!(mixer.counters.underruns.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_prebuffer_holds_until_min_chunks() {
        let (_rx_socket, port) = local_receiver();
        let mut mixer = mixer_to(port, false);
        let pool = ChunkPool::new(8, CHUNK_FRAMES * 2);
        // One chunk buffered, min is two: lane must not start yet
        mixer.handle_command(MixerCommand::AddLane(lane_with_chunks(1, &pool, &[7])));
        let (tap_tx, tap_rx) = bounded(8);
        mixer.handle_command(MixerCommand::AddTap(tap_tx));

        mixer.run_cycle(MonoTime::from_secs(1.0));
        let payload = tap_rx.try_recv().unwrap();
        assert!(payload.iter().all(|&b| b == 0), "prebuffer leaked audio");
    }

    #[test]
    fn test_sender_emits_datagrams() {
        let (rx_socket, port) = local_receiver();
        let mut mixer = mixer_to(port, false);
        let pool = ChunkPool::new(8, CHUNK_FRAMES * 2);
        mixer.handle_command(MixerCommand::AddLane(lane_with_chunks(1, &pool, &[5, 5])));

        mixer.run_cycle(MonoTime::from_secs(1.0));
        let mut buf = vec![0u8; 65536];
        let n = rx_socket.recv(&mut buf).unwrap();
        // Scream header + 16-bit stereo chunk
        assert_eq!(n, 5 + CHUNK_FRAMES * 2 * 2);
    }

    #[test]
    fn test_cycle_counters_advance() {
        let (_rx_socket, port) = local_receiver();
        let mut mixer = mixer_to(port, false);
        for n in 0..3 {
            mixer.run_cycle(MonoTime::from_secs(n as f64 * 0.024));
        }
        assert_eq!(mixer.counters.cycles.load(Ordering::Relaxed), 3);
        assert_eq!(
            mixer.counters.total_samples.load(Ordering::Relaxed),
            3 * CHUNK_FRAMES as u64
        );
    }
}
