//! Per-instance source processing
//!
//! One `SourceInputProcessor` per (source_tag, instance_id). It consumes
//! time-ordered packets from the timeshift manager, runs its
//! `AudioProcessor`, and fans fixed 1152-frame chunks out to every
//! connected sink lane. A worker thread per instance drains the packet
//! queue and a command channel; processing faults flip the instance's
//! health flag instead of escaping the thread.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;
use sr_core::{
    AudioFormat, ChunkPool, EngineResult, MonoTime, ProcessedAudioChunk, Sample, SpeakerLayout,
    TaggedAudioPacket, CHUNK_FRAMES,
};
use sr_dsp::{AudioProcessor, Equalizer, ProcessorTuning, EQ_BANDS};
use sr_timeshift::SubscriberQueue;

use crate::config::SourceConfig;
use crate::lane::LaneSender;
use crate::settings::SourceProcessorTuning;

/// Chunk buffers pooled per instance
const POOL_CHUNKS: usize = 32;

/// Recognized per-instance parameter updates; unset fields change nothing.
/// `delay_ms` and `timeshift_sec` are routed to the timeshift manager by
/// the audio manager and ignored here.
#[derive(Debug, Clone, Default)]
pub struct SourceParameterUpdate {
    pub volume: Option<Sample>,
    pub eq_values: Option<[Sample; EQ_BANDS]>,
    pub eq_normalization: Option<bool>,
    pub volume_normalization: Option<bool>,
    pub delay_ms: Option<u32>,
    pub timeshift_sec: Option<f64>,
    pub speaker_layouts_map: Option<HashMap<u16, SpeakerLayout>>,
}

pub enum SourceCommand {
    Update(SourceParameterUpdate),
    Connect {
        sink_id: String,
        lane: LaneSender,
        bit_depth: u16,
    },
    Disconnect {
        sink_id: String,
    },
    SetTuning(SourceProcessorTuning),
    Stop,
}

#[derive(Debug, Default)]
pub struct SourceCounters {
    pub chunks_emitted: AtomicU64,
    pub reconfigurations: AtomicU64,
    pub discontinuity_flushes: AtomicU64,
    pub lane_drops: Arc<AtomicU64>,
    pub healthy: AtomicBool,
}

pub struct SourceInputProcessor {
    instance_id: u64,
    source_tag: Arc<str>,
    processor: AudioProcessor,
    tuning: SourceProcessorTuning,
    eq: Equalizer,
    pool: ChunkPool,
    lanes: Vec<(String, LaneSender)>,
    counters: Arc<SourceCounters>,

    /// Bytes of the partially-filled input block
    staging: Vec<u8>,
    /// Processed samples awaiting chunk emission
    accum: Vec<i32>,
    /// Origin-clock RTP position of `accum`'s first frame
    origin_rtp: f64,
    /// Expected RTP timestamp of the next packet, for gap detection
    expected_rtp: Option<u32>,
    format_seen: bool,
}

impl SourceInputProcessor {
    pub fn new(
        instance_id: u64,
        config: &SourceConfig,
        tuning: SourceProcessorTuning,
        processor_tuning: ProcessorTuning,
    ) -> EngineResult<Self> {
        let output = AudioFormat::new(
            config.target_output_samplerate,
            config.target_output_channels,
            32,
        )?;
        let eq = Equalizer {
            gains: config.initial_eq,
            normalize: false,
        };
        let processor = AudioProcessor::new(
            AudioFormat::default(),
            output,
            processor_tuning,
            config.speaker_layouts_map.clone(),
            eq.clone(),
            config.initial_volume,
        )?;
        let counters = Arc::new(SourceCounters {
            healthy: AtomicBool::new(true),
            ..Default::default()
        });
        Ok(Self {
            instance_id,
            source_tag: config.tag.as_str().into(),
            processor,
            tuning,
            eq,
            pool: ChunkPool::new(POOL_CHUNKS, CHUNK_FRAMES * output.channels as usize),
            lanes: Vec::new(),
            counters,
            staging: Vec::with_capacity(CHUNK_FRAMES * 32),
            accum: Vec::with_capacity(CHUNK_FRAMES * output.channels as usize * 4),
            origin_rtp: 0.0,
            expected_rtp: None,
            format_seen: false,
        })
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn source_tag(&self) -> &str {
        &self.source_tag
    }

    pub fn counters(&self) -> Arc<SourceCounters> {
        self.counters.clone()
    }

    pub fn output_format(&self) -> AudioFormat {
        self.processor.output_format()
    }

    /// Consume one packet, emitting completed chunks into every lane.
    /// Returns the number of chunks emitted.
    pub fn ingest_packet(&mut self, packet: &TaggedAudioPacket, now: MonoTime) -> usize {
        // Format change: reconfigure in place and restart block staging
        if !self.format_seen || packet.format != self.processor.input_format() {
            if self.format_seen {
                self.counters.reconfigurations.fetch_add(1, Ordering::Relaxed);
                log::info!(
                    "{}: input format changed to {}Hz/{}ch/{}bit",
                    self.source_tag,
                    packet.format.sample_rate,
                    packet.format.channels,
                    packet.format.bit_depth
                );
            }
            if self.processor.reconfigure_input(packet.format).is_err() {
                self.counters.healthy.store(false, Ordering::Relaxed);
                return 0;
            }
            self.format_seen = true;
            self.staging.clear();
            self.expected_rtp = None;
        }

        // Discontinuity: gap between the previous packet's end and this
        // packet's start beyond the threshold flushes filter state
        if let (Some(expected), Some(rtp)) = (self.expected_rtp, packet.rtp_timestamp) {
            let gap_frames = rtp.wrapping_sub(expected) as i32;
            let gap_ms =
                gap_frames as f64 / packet.format.sample_rate as f64 * 1000.0;
            if gap_ms.abs() > self.tuning.discontinuity_threshold_ms {
                self.processor.flush();
                self.staging.clear();
                self.counters
                    .discontinuity_flushes
                    .fetch_add(1, Ordering::Relaxed);
                self.origin_rtp = rtp as f64;
                log::debug!("{}: {:.1}ms discontinuity, flushed", self.source_tag, gap_ms);
            }
        } else if let Some(rtp) = packet.rtp_timestamp {
            self.origin_rtp = rtp as f64;
        }
        if let Some(rtp) = packet.rtp_timestamp {
            let frames = packet.format.frames_in(packet.payload.len()) as u32;
            self.expected_rtp = Some(rtp.wrapping_add(frames));
        }

        self.processor.set_playback_rate(packet.playback_rate);

        // Stage payload bytes and process whole input blocks
        self.staging.extend_from_slice(&packet.payload);
        let block = CHUNK_FRAMES * packet.format.bytes_per_frame();
        while self.staging.len() >= block {
            let result = {
                let (head, _) = self.staging.split_at(block);
                self.processor.process(head, &mut self.accum)
            };
            if result.is_err() {
                self.counters.healthy.store(false, Ordering::Relaxed);
            }
            self.staging.drain(..block);
        }

        self.emit_chunks(now)
    }

    fn emit_chunks(&mut self, now: MonoTime) -> usize {
        let out = self.processor.output_format();
        let chunk_samples = CHUNK_FRAMES * out.channels as usize;
        let rtp_per_chunk = CHUNK_FRAMES as f64 * self.processor.input_format().sample_rate as f64
            / out.sample_rate as f64;
        let mut emitted = 0;
        while self.accum.len() >= chunk_samples {
            let rtp = self.origin_rtp as u32;
            for (_, lane) in self.lanes.iter_mut() {
                let mut buf = self.pool.acquire();
                buf.copy_from_slice(&self.accum[..chunk_samples]);
                lane.push(ProcessedAudioChunk::new(
                    buf,
                    self.source_tag.clone(),
                    rtp,
                    now,
                    out,
                    Some(self.pool.recycler()),
                ));
            }
            self.accum.drain(..chunk_samples);
            self.origin_rtp += rtp_per_chunk;
            emitted += 1;
            self.counters.chunks_emitted.fetch_add(1, Ordering::Relaxed);
        }
        emitted
    }

    pub fn apply_update(&mut self, update: SourceParameterUpdate) {
        if let Some(volume) = update.volume {
            self.processor.set_volume(volume);
        }
        if update.eq_values.is_some() || update.eq_normalization.is_some() {
            if let Some(gains) = update.eq_values {
                self.eq.gains = gains;
            }
            if let Some(normalize) = update.eq_normalization {
                self.eq.normalize = normalize;
            }
            self.processor.set_eq(self.eq.clone());
        }
        if let Some(enabled) = update.volume_normalization {
            self.processor.set_volume_normalization(enabled);
        }
        if let Some(layouts) = update.speaker_layouts_map {
            self.processor.set_speaker_layouts(layouts);
        }
    }

    fn handle_command(&mut self, command: SourceCommand) -> bool {
        match command {
            SourceCommand::Update(update) => self.apply_update(update),
            SourceCommand::Connect {
                sink_id,
                lane,
                bit_depth,
            } => {
                if self.lanes.is_empty() {
                    // First connection decides the wire quantization grid
                    if let Err(e) = self.processor.set_output_bit_depth(bit_depth) {
                        log::warn!("{}: cannot adopt bit depth: {e}", self.source_tag);
                    }
                }
                self.lanes.retain(|(id, _)| id != &sink_id);
                self.lanes.push((sink_id, lane));
            }
            SourceCommand::Disconnect { sink_id } => {
                self.lanes.retain(|(id, _)| id != &sink_id);
            }
            SourceCommand::SetTuning(tuning) => self.tuning = tuning,
            SourceCommand::Stop => return false,
        }
        true
    }

    pub fn connected_sinks(&self) -> usize {
        self.lanes.len()
    }
}

/// Run a source worker until `Stop` or queue abandonment
pub fn spawn_source_worker(
    mut processor: SourceInputProcessor,
    mut queue: SubscriberQueue,
    commands: Receiver<SourceCommand>,
) -> thread::JoinHandle<()> {
    let name = format!("source-{}", processor.instance_id());
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            log::debug!("source worker {} started", processor.instance_id());
            'run: loop {
                while let Ok(command) = commands.try_recv() {
                    if !processor.handle_command(command) {
                        break 'run;
                    }
                }
                let mut drained = false;
                while let Ok(packet) = queue.pop() {
                    drained = true;
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        processor.ingest_packet(&packet, MonoTime::now());
                    }));
                    if outcome.is_err() {
                        processor.counters.healthy.store(false, Ordering::Relaxed);
                        log::error!(
                            "source worker {} caught processing panic",
                            processor.instance_id()
                        );
                    }
                }
                if !drained {
                    thread::sleep(Duration::from_millis(
                        processor.tuning.command_loop_sleep_ms.max(1),
                    ));
                }
            }
            log::debug!("source worker {} stopped", processor.instance_id());
        })
        .expect("spawn source worker")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lane::create_lane;

    fn config() -> SourceConfig {
        SourceConfig {
            tag: "10.0.0.9".into(),
            initial_volume: 1.0,
            initial_delay_ms: 0,
            initial_timeshift_sec: 0.0,
            target_output_channels: 2,
            target_output_samplerate: 48000,
            initial_eq: [1.0; EQ_BANDS],
            speaker_layouts_map: HashMap::new(),
        }
    }

    fn processor() -> SourceInputProcessor {
        SourceInputProcessor::new(
            1,
            &config(),
            SourceProcessorTuning::default(),
            ProcessorTuning::default(),
        )
        .unwrap()
    }

    fn packet(rtp: u32, frames: usize) -> TaggedAudioPacket {
        TaggedAudioPacket {
            source_tag: "10.0.0.9".into(),
            arrival: MonoTime::from_secs(1.0),
            rtp_timestamp: Some(rtp),
            format: AudioFormat::default(),
            channel_layout: 0x3,
            playback_rate: 1.0,
            payload: vec![0u8; frames * 4],
        }
    }

    #[test]
    fn test_chunks_conform_to_sink_format() {
        let mut p = processor();
        let drops = p.counters().lane_drops.clone();
        let (tx, mut rx) = create_lane(1, 8, drops);
        p.handle_command(SourceCommand::Connect {
            sink_id: "sink".into(),
            lane: tx,
            bit_depth: 16,
        });

        // Four 288-frame packets fill exactly one input block
        for n in 0..8u32 {
            p.ingest_packet(&packet(n * 288, 288), MonoTime::from_secs(1.0));
        }
        let chunk = rx.pop().expect("one chunk after 1152 input frames");
        assert_eq!(chunk.format.sample_rate, 48000);
        assert_eq!(chunk.format.channels, 2);
        assert_eq!(chunk.format.bit_depth, 16);
        assert_eq!(chunk.samples().len(), CHUNK_FRAMES * 2);
    }

    #[test]
    fn test_format_change_counts_reconfiguration() {
        let mut p = processor();
        p.ingest_packet(&packet(0, 288), MonoTime::from_secs(1.0));
        assert_eq!(p.counters.reconfigurations.load(Ordering::Relaxed), 0);

        let mut changed = packet(288, 288);
        changed.format.sample_rate = 44100;
        changed.payload = vec![0u8; 288 * 4];
        p.ingest_packet(&changed, MonoTime::from_secs(1.1));
        assert_eq!(p.counters.reconfigurations.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_discontinuity_flushes_once() {
        let mut p = processor();
        p.ingest_packet(&packet(0, 288), MonoTime::from_secs(1.0));
        p.ingest_packet(&packet(288, 288), MonoTime::from_secs(1.01));
        assert_eq!(p.counters.discontinuity_flushes.load(Ordering::Relaxed), 0);

        // 48000-frame hole = one full second
        p.ingest_packet(&packet(48576, 288), MonoTime::from_secs(2.0));
        assert_eq!(p.counters.discontinuity_flushes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_fanout_reaches_every_lane() {
        let mut p = processor();
        let drops = p.counters().lane_drops.clone();
        let (tx_a, mut rx_a) = create_lane(1, 8, drops.clone());
        let (tx_b, mut rx_b) = create_lane(1, 8, drops);
        p.handle_command(SourceCommand::Connect {
            sink_id: "a".into(),
            lane: tx_a,
            bit_depth: 16,
        });
        p.handle_command(SourceCommand::Connect {
            sink_id: "b".into(),
            lane: tx_b,
            bit_depth: 16,
        });

        for n in 0..4u32 {
            p.ingest_packet(&packet(n * 288, 288), MonoTime::from_secs(1.0));
        }
        assert!(rx_a.pop().is_some());
        assert!(rx_b.pop().is_some());
    }

    #[test]
    fn test_disconnect_stops_fanout() {
        let mut p = processor();
        let drops = p.counters().lane_drops.clone();
        let (tx, mut rx) = create_lane(1, 8, drops);
        p.handle_command(SourceCommand::Connect {
            sink_id: "a".into(),
            lane: tx,
            bit_depth: 16,
        });
        p.handle_command(SourceCommand::Disconnect {
            sink_id: "a".into(),
        });
        for n in 0..4u32 {
            p.ingest_packet(&packet(n * 288, 288), MonoTime::from_secs(1.0));
        }
        assert!(rx.pop().is_none());
        assert_eq!(p.connected_sinks(), 0);
    }

    #[test]
    fn test_volume_update_applies_by_next_chunk() {
        let mut p = processor();
        let drops = p.counters().lane_drops.clone();
        let (tx, mut rx) = create_lane(1, 8, drops);
        p.handle_command(SourceCommand::Connect {
            sink_id: "a".into(),
            lane: tx,
            bit_depth: 16,
        });
        p.apply_update(SourceParameterUpdate {
            volume: Some(0.0),
            ..Default::default()
        });

        let mut loud = packet(0, 1152);
        loud.payload = (0..1152 * 2)
            .flat_map(|_| 2000i16.to_le_bytes())
            .collect();
        // Run enough chunks for the ramp to settle at zero
        for n in 0..20u32 {
            let mut pkt = loud.clone();
            pkt.rtp_timestamp = Some(n * 1152);
            p.ingest_packet(&pkt, MonoTime::from_secs(1.0));
        }
        let mut last = None;
        while let Some(chunk) = rx.pop() {
            last = Some(chunk.samples().iter().map(|s| s.abs()).max().unwrap_or(0));
        }
        let peak = last.expect("chunks emitted");
        assert!(peak <= 1 << 16, "peak {peak}");
    }
}
