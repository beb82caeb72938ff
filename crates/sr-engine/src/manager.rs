//! AudioManager: single lifecycle entry point
//!
//! Owns the topology (timeshift manager, clocks, sinks, sources,
//! connections) under one mutex so add/remove/connect/disconnect are
//! serialized and never observed half-applied. Components run on their own
//! threads; the manager only mutates the graph and marshals commands.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use sr_core::{
    AudioEngineStats, AudioFormat, EngineError, EngineResult, GlobalStats, MonoTime, SinkStats,
    SourceStats, TaggedAudioPacket,
};
use sr_timeshift::TimeshiftManager;

use crate::clock::{GlobalSynchronizationClock, SyncTuning};
use crate::config::{SinkConfig, SinkProtocol, SourceConfig};
use crate::coordinator::SinkSynchronizationCoordinator;
use crate::lane::create_lane;
use crate::mixer::{spawn_mixer_worker, MixerCommand, SinkAudioMixer, SinkCounters};
use crate::settings::AudioEngineSettings;
use crate::source::{
    spawn_source_worker, SourceCommand, SourceCounters, SourceInputProcessor,
    SourceParameterUpdate,
};
use sr_net::NetworkSender;

struct SinkHandle {
    config: SinkConfig,
    commands: Sender<MixerCommand>,
    counters: Arc<SinkCounters>,
    thread: Option<thread::JoinHandle<()>>,
}

struct SourceHandle {
    config: SourceConfig,
    commands: Sender<SourceCommand>,
    counters: Arc<SourceCounters>,
    thread: Option<thread::JoinHandle<()>>,
    connected: HashSet<String>,
    adopted_bit_depth: Option<u16>,
    output: AudioFormat,
}

struct EngineState {
    settings: AudioEngineSettings,
    timeshift_port: u16,
    timeshift: Arc<TimeshiftManager>,
    clocks: HashMap<u32, Arc<GlobalSynchronizationClock>>,
    sinks: HashMap<String, SinkHandle>,
    sources: HashMap<u64, SourceHandle>,
    next_instance_id: u64,
    started_at: MonoTime,
}

#[derive(Default)]
pub struct AudioManager {
    state: Mutex<Option<EngineState>>,
}

impl AudioManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring the engine up. Idempotent; returns false only when the
    /// timeshift layer could not start.
    pub fn initialize(&self, timeshift_port: u16, timeshift_seconds: f64) -> bool {
        let mut state = self.state.lock();
        if state.is_some() {
            return true;
        }
        let settings = AudioEngineSettings::default();
        let timeshift = Arc::new(TimeshiftManager::new(
            settings.timeshift_tuning.clone(),
            timeshift_seconds,
        ));
        timeshift.start();
        *state = Some(EngineState {
            settings,
            timeshift_port,
            timeshift,
            clocks: HashMap::new(),
            sinks: HashMap::new(),
            sources: HashMap::new(),
            next_instance_id: 1,
            started_at: MonoTime::now(),
        });
        log::info!("audio engine initialized (ingress port {timeshift_port})");
        true
    }

    /// Port the ingress collaborator was configured with, when running
    pub fn ingress_port(&self) -> Option<u16> {
        self.state.lock().as_ref().map(|s| s.timeshift_port)
    }

    /// Ingress entry: hand one tagged packet to the timeshift layer.
    /// Non-blocking; called by the socket collaborators.
    pub fn add_packet(&self, packet: TaggedAudioPacket) -> EngineResult<()> {
        let timeshift = {
            let state = self.state.lock();
            let state = state.as_ref().ok_or(EngineError::NotInitialized)?;
            state.timeshift.clone()
        };
        timeshift.add_packet(packet);
        Ok(())
    }

    pub fn add_sink(&self, config: SinkConfig) -> EngineResult<()> {
        let format = config.format()?;
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(EngineError::NotInitialized)?;
        if state.sinks.contains_key(&config.id) {
            return Err(EngineError::DuplicateSink(config.id));
        }

        let dest: SocketAddr = format!("{}:{}", config.output_ip, config.output_port)
            .parse()
            .map_err(|_| {
                EngineError::SenderInit(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("bad sink address {}:{}", config.output_ip, config.output_port),
                ))
            })?;
        let max_payload = sr_core::CHUNK_FRAMES * format.bytes_per_frame();
        let sender = match config.protocol {
            SinkProtocol::Scream => {
                NetworkSender::scream(dest, format, config.layout_mask(), max_payload)
            }
            SinkProtocol::Rtp => NetworkSender::rtp(dest, config.enable_mp3, max_payload),
        }
        .map_err(EngineError::SenderInit)?;

        let coordinator = if config.time_sync_enabled {
            let clock = state
                .clocks
                .entry(format.sample_rate)
                .or_insert_with(|| {
                    Arc::new(GlobalSynchronizationClock::new(
                        format.sample_rate,
                        SyncTuning::default(),
                    ))
                })
                .clone();
            Some(SinkSynchronizationCoordinator::new(
                clock,
                config.id.clone(),
                SyncTuning::default().barrier_timeout_ms,
            ))
        } else {
            None
        };

        let mixer = SinkAudioMixer::new(
            &config,
            sender,
            coordinator,
            state.settings.mixer_tuning.clone(),
        );
        let counters = mixer.counters();
        let (commands, command_rx) = unbounded();
        let thread = spawn_mixer_worker(mixer, command_rx);
        log::info!("sink {} added ({dest})", config.id);
        state.sinks.insert(
            config.id.clone(),
            SinkHandle {
                config,
                commands,
                counters,
                thread: Some(thread),
            },
        );
        Ok(())
    }

    pub fn remove_sink(&self, sink_id: &str) -> EngineResult<()> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(EngineError::NotInitialized)?;
        let mut sink = state
            .sinks
            .remove(sink_id)
            .ok_or_else(|| EngineError::UnknownSink(sink_id.to_string()))?;

        // Detach producers first so lanes drain to nothing, then stop the
        // sender and join the mixer.
        for source in state.sources.values_mut() {
            if source.connected.remove(sink_id) {
                let _ = source.commands.send(SourceCommand::Disconnect {
                    sink_id: sink_id.to_string(),
                });
            }
        }
        let _ = sink.commands.send(MixerCommand::StopSender);
        let _ = sink.commands.send(MixerCommand::Stop);
        if let Some(handle) = sink.thread.take() {
            let _ = handle.join();
        }
        log::info!("sink {sink_id} removed");
        Ok(())
    }

    pub fn configure_source(&self, config: SourceConfig) -> EngineResult<u64> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(EngineError::NotInitialized)?;
        let instance_id = state.next_instance_id;

        let processor = SourceInputProcessor::new(
            instance_id,
            &config,
            state.settings.source_processor_tuning.clone(),
            state.settings.processor_tuning.clone(),
        )?;
        let output = processor.output_format();
        let counters = processor.counters();
        let queue = state.timeshift.register_processor(
            instance_id,
            &config.tag,
            config.initial_delay_ms,
            config.initial_timeshift_sec,
        );
        let (commands, command_rx) = unbounded();
        let thread = spawn_source_worker(processor, queue, command_rx);

        state.next_instance_id += 1;
        log::info!("source instance {instance_id} configured for tag {}", config.tag);
        state.sources.insert(
            instance_id,
            SourceHandle {
                config,
                commands,
                counters,
                thread: Some(thread),
                connected: HashSet::new(),
                adopted_bit_depth: None,
                output,
            },
        );
        Ok(instance_id)
    }

    pub fn remove_source(&self, instance_id: u64) -> EngineResult<()> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(EngineError::NotInitialized)?;
        let mut source = state
            .sources
            .remove(&instance_id)
            .ok_or(EngineError::UnknownSourceInstance(instance_id))?;

        state.timeshift.unregister_processor(instance_id);
        for sink_id in source.connected.drain() {
            if let Some(sink) = state.sinks.get(&sink_id) {
                let _ = sink
                    .commands
                    .send(MixerCommand::RemoveLane {
                        source_instance: instance_id,
                    });
            }
        }
        let _ = source.commands.send(SourceCommand::Stop);
        if let Some(handle) = source.thread.take() {
            let _ = handle.join();
        }
        log::info!("source instance {instance_id} removed");
        Ok(())
    }

    pub fn connect_source_sink(&self, instance_id: u64, sink_id: &str) -> EngineResult<()> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(EngineError::NotInitialized)?;
        let max_chunks = state.settings.mixer_tuning.max_input_queue_chunks;

        let (sink_format, sink_layout) = {
            let sink = state
                .sinks
                .get(sink_id)
                .ok_or_else(|| EngineError::UnknownSink(sink_id.to_string()))?;
            (sink.config.format()?, sink.config.speaker_layout.clone())
        };
        let source = state
            .sources
            .get_mut(&instance_id)
            .ok_or(EngineError::UnknownSourceInstance(instance_id))?;

        if source.output.sample_rate != sink_format.sample_rate
            || source.output.channels != sink_format.channels
        {
            return Err(EngineError::FormatMismatch(instance_id, sink_id.to_string()));
        }
        match source.adopted_bit_depth {
            Some(depth) if depth != sink_format.bit_depth => {
                return Err(EngineError::FormatMismatch(instance_id, sink_id.to_string()));
            }
            _ => source.adopted_bit_depth = Some(sink_format.bit_depth),
        }

        let (lane_tx, lane_rx) = create_lane(
            instance_id,
            max_chunks,
            source.counters.lane_drops.clone(),
        );
        let _ = source.commands.send(SourceCommand::Connect {
            sink_id: sink_id.to_string(),
            lane: lane_tx,
            bit_depth: sink_format.bit_depth,
        });
        // A sink-level layout applies only when the source configures no
        // layout map of its own (the source map is more specific).
        if source.config.speaker_layouts_map.is_empty() {
            if let Some(layout) = sink_layout {
                let layouts = (1..=sr_core::MAX_CHANNELS as u16)
                    .map(|ch| (ch, layout.clone()))
                    .collect();
                let _ = source.commands.send(SourceCommand::Update(
                    SourceParameterUpdate {
                        speaker_layouts_map: Some(layouts),
                        ..Default::default()
                    },
                ));
            }
        }
        source.connected.insert(sink_id.to_string());
        if let Some(sink) = state.sinks.get(sink_id) {
            let _ = sink.commands.send(MixerCommand::AddLane(lane_rx));
        }
        log::debug!("connected source {instance_id} -> sink {sink_id}");
        Ok(())
    }

    pub fn disconnect_source_sink(&self, instance_id: u64, sink_id: &str) -> EngineResult<()> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(EngineError::NotInitialized)?;
        let source = state
            .sources
            .get_mut(&instance_id)
            .ok_or(EngineError::UnknownSourceInstance(instance_id))?;
        if !source.connected.remove(sink_id) {
            return Err(EngineError::NotConnected(instance_id, sink_id.to_string()));
        }
        let _ = source.commands.send(SourceCommand::Disconnect {
            sink_id: sink_id.to_string(),
        });
        if let Some(sink) = state.sinks.get(sink_id) {
            let _ = sink.commands.send(MixerCommand::RemoveLane {
                source_instance: instance_id,
            });
        }
        Ok(())
    }

    /// Apply a partial parameter update: playhead fields go to the
    /// timeshift layer, everything else to the instance's worker.
    pub fn update_source_parameters(
        &self,
        instance_id: u64,
        update: SourceParameterUpdate,
    ) -> EngineResult<()> {
        let guard = self.state.lock();
        let state = guard.as_ref().ok_or(EngineError::NotInitialized)?;
        let source = state
            .sources
            .get(&instance_id)
            .ok_or(EngineError::UnknownSourceInstance(instance_id))?;
        if update.delay_ms.is_some() || update.timeshift_sec.is_some() {
            state
                .timeshift
                .update_subscriber(instance_id, update.delay_ms, update.timeshift_sec);
        }
        let _ = source.commands.send(SourceCommand::Update(update));
        Ok(())
    }

    /// Subscribe to a sink's outgoing PCM payloads (the port interface for
    /// encoders and listeners). Bounded; overflow drops are counted on the
    /// sink.
    pub fn register_sink_tap(
        &self,
        sink_id: &str,
        capacity: usize,
    ) -> EngineResult<Receiver<Vec<u8>>> {
        let guard = self.state.lock();
        let state = guard.as_ref().ok_or(EngineError::NotInitialized)?;
        let sink = state
            .sinks
            .get(sink_id)
            .ok_or_else(|| EngineError::UnknownSink(sink_id.to_string()))?;
        let (tap_tx, tap_rx) = bounded(capacity.max(1));
        let _ = sink.commands.send(MixerCommand::AddTap(tap_tx));
        Ok(tap_rx)
    }

    pub fn get_audio_settings(&self) -> EngineResult<AudioEngineSettings> {
        let guard = self.state.lock();
        let state = guard.as_ref().ok_or(EngineError::NotInitialized)?;
        Ok(state.settings.clone())
    }

    /// Replace the tuning tree and push the relevant subsections to every
    /// live component.
    pub fn set_audio_settings(&self, settings: AudioEngineSettings) -> EngineResult<()> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(EngineError::NotInitialized)?;
        state.timeshift.set_tuning(settings.timeshift_tuning.clone());
        for sink in state.sinks.values() {
            let _ = sink
                .commands
                .send(MixerCommand::SetTuning(settings.mixer_tuning.clone()));
        }
        for source in state.sources.values() {
            let _ = source.commands.send(SourceCommand::SetTuning(
                settings.source_processor_tuning.clone(),
            ));
        }
        state.settings = settings;
        Ok(())
    }

    pub fn get_audio_engine_stats(&self) -> EngineResult<AudioEngineStats> {
        let guard = self.state.lock();
        let state = guard.as_ref().ok_or(EngineError::NotInitialized)?;

        let (ingested, dispatched, discarded) = state.timeshift.global_counters();
        let global = GlobalStats {
            packets_ingested: ingested,
            packets_dispatched: dispatched,
            packets_discarded: discarded,
            active_sources: state.sources.len(),
            active_sinks: state.sinks.len(),
            uptime_secs: MonoTime::now() - state.started_at,
        };

        let sources = state
            .sources
            .iter()
            .map(|(&id, handle)| SourceStats {
                instance_id: id,
                source_tag: handle.config.tag.clone(),
                chunks_emitted: handle.counters.chunks_emitted.load(Ordering::Relaxed),
                reconfigurations: handle.counters.reconfigurations.load(Ordering::Relaxed),
                discontinuity_flushes: handle
                    .counters
                    .discontinuity_flushes
                    .load(Ordering::Relaxed),
                lane_drops: handle.counters.lane_drops.load(Ordering::Relaxed),
                healthy: handle.counters.healthy.load(Ordering::Relaxed),
            })
            .collect();

        let sinks = state
            .sinks
            .iter()
            .map(|(id, handle)| SinkStats {
                sink_id: id.clone(),
                cycles: handle.counters.cycles.load(Ordering::Relaxed),
                underruns: handle.counters.underruns.load(Ordering::Relaxed),
                barrier_timeouts: handle.counters.barrier_timeouts.load(Ordering::Relaxed),
                send_failures: handle.counters.send_failures.load(Ordering::Relaxed),
                tap_drops: handle.counters.tap_drops.load(Ordering::Relaxed),
                total_samples_output: handle.counters.total_samples.load(Ordering::Relaxed),
                last_rtp_timestamp: handle.counters.last_rtp.load(Ordering::Relaxed) as u32,
                buffer_fill: handle.counters.buffer_fill_value(),
                healthy: handle.counters.healthy.load(Ordering::Relaxed),
                sync_degraded: handle.counters.sync_degraded.load(Ordering::Relaxed),
            })
            .collect();

        Ok(AudioEngineStats {
            global,
            streams: state.timeshift.stream_stats(),
            sources,
            sinks,
        })
    }

    /// Stop everything in reverse dependency order: senders, mixers,
    /// source processors, then the timeshift manager. No callback fires
    /// after return. Idempotent.
    pub fn shutdown(&self) {
        let Some(mut state) = self.state.lock().take() else {
            return;
        };
        for sink in state.sinks.values() {
            let _ = sink.commands.send(MixerCommand::StopSender);
        }
        for (id, sink) in state.sinks.iter_mut() {
            let _ = sink.commands.send(MixerCommand::Stop);
            if let Some(handle) = sink.thread.take() {
                let _ = handle.join();
            }
            log::debug!("sink {id} stopped");
        }
        for (id, source) in state.sources.iter_mut() {
            state.timeshift.unregister_processor(*id);
            let _ = source.commands.send(SourceCommand::Stop);
            if let Some(handle) = source.thread.take() {
                let _ = handle.join();
            }
            log::debug!("source {id} stopped");
        }
        state.timeshift.stop();
        log::info!("audio engine shut down");
    }
}

impl Drop for AudioManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
