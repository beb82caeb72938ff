//! TimeshiftManager: per-tag history rings and the dispatch loop
//!
//! Ingress threads push packets through a bounded MPSC channel; one
//! dispatch thread anchors stream clocks, keeps per-tag rings in RTP order,
//! and releases due packets into per-subscriber SPSC queues. Packets for
//! tags nobody subscribes to are retained for the ring window and expire
//! through cleanup.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use sr_core::{MonoTime, StreamStats, TaggedAudioPacket};

use crate::{PlaybackRateController, StreamAnchor, TimeshiftTuning};

/// Ingress channel depth
const INGEST_CAPACITY: usize = 4096;
/// Per-subscriber SPSC queue depth, in packets
const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;
/// Hard per-tag ring bound; beyond this the oldest packet is discarded
const RING_MAX_PACKETS: usize = 8192;

pub type SubscriberQueue = rtrb::Consumer<TaggedAudioPacket>;

struct Subscriber {
    source_tag: Arc<str>,
    delay_secs: f64,
    timeshift_secs: f64,
    queue: rtrb::Producer<TaggedAudioPacket>,
    /// Last RTP timestamp released to this subscriber
    last_rtp: Option<u32>,
}

struct StreamState {
    ring: VecDeque<TaggedAudioPacket>,
    anchor: Option<StreamAnchor>,
    rate: PlaybackRateController,
    /// Next synthesized RTP timestamp for packets that carry none
    synth_rtp: u32,
    last_arrival: Option<MonoTime>,
    inbound_rate: f64,
    anchor_resets: u64,
    late_drops: u64,
}

impl StreamState {
    fn new() -> Self {
        Self {
            ring: VecDeque::new(),
            anchor: None,
            rate: PlaybackRateController::new(),
            synth_rtp: 0,
            last_arrival: None,
            inbound_rate: 0.0,
            anchor_resets: 0,
            late_drops: 0,
        }
    }
}

struct DispatchState {
    streams: HashMap<Arc<str>, StreamState>,
    subscribers: HashMap<u64, Subscriber>,
    last_cleanup: MonoTime,
}

struct Shared {
    tuning: RwLock<TimeshiftTuning>,
    /// Ring retention window in seconds
    history_secs: f64,
    ingest_rx: Receiver<TaggedAudioPacket>,
    state: Mutex<DispatchState>,
    ingested: AtomicU64,
    dispatched: AtomicU64,
    discarded: AtomicU64,
}

pub struct TimeshiftManager {
    shared: Arc<Shared>,
    ingest_tx: Sender<TaggedAudioPacket>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TimeshiftManager {
    pub fn new(tuning: TimeshiftTuning, history_secs: f64) -> Self {
        let (ingest_tx, ingest_rx) = bounded(INGEST_CAPACITY);
        let shared = Arc::new(Shared {
            tuning: RwLock::new(tuning),
            history_secs: history_secs.max(0.5),
            ingest_rx,
            state: Mutex::new(DispatchState {
                streams: HashMap::new(),
                subscribers: HashMap::new(),
                last_cleanup: MonoTime::from_secs(0.0),
            }),
            ingested: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        });
        Self {
            shared,
            ingest_tx,
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    /// Spawn the dispatch thread. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = self.shared.clone();
        let running = self.running.clone();
        let handle = thread::Builder::new()
            .name("timeshift-dispatch".into())
            .spawn(move || {
                log::debug!("timeshift dispatch thread started");
                while running.load(Ordering::Acquire) {
                    let sleep_ms = shared.tuning.read().loop_max_sleep_ms;
                    // Block on ingress for at most one loop period; every
                    // other queue drain happens inside dispatch_once.
                    if let Ok(pkt) = shared
                        .ingest_rx
                        .recv_timeout(Duration::from_millis(sleep_ms.max(1)))
                    {
                        let mut state = shared.state.lock();
                        shared.ingest_packet(&mut state, pkt);
                    }
                    shared.dispatch_once(MonoTime::now());
                }
                log::debug!("timeshift dispatch thread stopped");
            })
            .ok();
        *self.thread.lock() = handle;
    }

    /// Stop and join the dispatch thread
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Non-blocking ingress; a saturated channel counts a discard.
    pub fn add_packet(&self, packet: TaggedAudioPacket) {
        match self.ingest_tx.try_send(packet) {
            Ok(()) => {
                self.shared.ingested.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.shared.discarded.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Register a subscriber for `(instance_id, source_tag)` and hand back
    /// its packet queue. Safe while dispatch is live.
    pub fn register_processor(
        &self,
        instance_id: u64,
        source_tag: &str,
        initial_delay_ms: u32,
        initial_timeshift_sec: f64,
    ) -> SubscriberQueue {
        let (producer, consumer) = rtrb::RingBuffer::new(SUBSCRIBER_QUEUE_CAPACITY);
        let subscriber = Subscriber {
            source_tag: source_tag.into(),
            delay_secs: initial_delay_ms as f64 / 1000.0,
            timeshift_secs: initial_timeshift_sec.max(0.0),
            queue: producer,
            last_rtp: None,
        };
        self.shared
            .state
            .lock()
            .subscribers
            .insert(instance_id, subscriber);
        log::debug!("registered processor {instance_id} for tag {source_tag}");
        consumer
    }

    /// Drop a subscriber; packets already queued simply drain nowhere.
    pub fn unregister_processor(&self, instance_id: u64) {
        self.shared.state.lock().subscribers.remove(&instance_id);
        log::debug!("unregistered processor {instance_id}");
    }

    /// Adjust a live subscriber's playhead offsets. Raising the timeshift
    /// rewinds into ring history: the cursor resets so retained packets
    /// are re-released.
    pub fn update_subscriber(
        &self,
        instance_id: u64,
        delay_ms: Option<u32>,
        timeshift_sec: Option<f64>,
    ) {
        let mut state = self.shared.state.lock();
        if let Some(sub) = state.subscribers.get_mut(&instance_id) {
            if let Some(delay) = delay_ms {
                sub.delay_secs = delay as f64 / 1000.0;
            }
            if let Some(shift) = timeshift_sec {
                sub.timeshift_secs = shift.max(0.0);
                sub.last_rtp = None;
            }
        }
    }

    pub fn set_tuning(&self, tuning: TimeshiftTuning) {
        *self.shared.tuning.write() = tuning;
    }

    /// Current playback rate for a tag (1.0 when unknown)
    pub fn playback_rate(&self, source_tag: &str) -> f64 {
        self.shared
            .state
            .lock()
            .streams
            .get(source_tag)
            .map_or(1.0, |s| s.rate.rate())
    }

    /// Drive one dispatch iteration at `now`. Exposed for deterministic
    /// tests; the dispatch thread calls it continuously.
    pub fn dispatch_once(&self, now: MonoTime) -> usize {
        self.shared.dispatch_once(now)
    }

    pub fn global_counters(&self) -> (u64, u64, u64) {
        (
            self.shared.ingested.load(Ordering::Relaxed),
            self.shared.dispatched.load(Ordering::Relaxed),
            self.shared.discarded.load(Ordering::Relaxed),
        )
    }

    pub fn stream_stats(&self) -> Vec<StreamStats> {
        let state = self.shared.state.lock();
        state
            .streams
            .iter()
            .map(|(tag, stream)| StreamStats {
                source_tag: tag.to_string(),
                ring_packets: stream.ring.len(),
                anchor_resets: stream.anchor_resets,
                late_drops: stream.late_drops,
                jitter_ms: stream.anchor.as_ref().map_or(0.0, |a| a.jitter * 1000.0),
                playback_rate: stream.rate.rate(),
                inbound_packet_rate: stream.inbound_rate,
            })
            .collect()
    }
}

impl Drop for TimeshiftManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn ingest_packet(&self, state: &mut DispatchState, mut packet: TaggedAudioPacket) {
        let tuning = self.tuning.read().clone();
        let stream = state
            .streams
            .entry(packet.source_tag.clone())
            .or_insert_with(StreamState::new);

        let arrival = packet.arrival;

        // Inter-arrival bookkeeping and session-gap reset
        if let Some(last) = stream.last_arrival {
            let gap = arrival - last;
            if gap > tuning.rtp_session_reset_threshold_seconds {
                if let Some(anchor) = stream.anchor.as_mut() {
                    let rtp = packet.rtp_timestamp.unwrap_or(stream.synth_rtp);
                    anchor.reanchor(arrival, rtp);
                    stream.anchor_resets += 1;
                    stream.rate.reset();
                    log::debug!(
                        "session gap {:.2}s on {}, re-anchored",
                        gap,
                        packet.source_tag
                    );
                }
            } else if gap > 1e-6 {
                let alpha = tuning.playback_ratio_inbound_rate_smoothing.clamp(0.0, 1.0);
                stream.inbound_rate = alpha / gap + (1.0 - alpha) * stream.inbound_rate;
            }
        }
        stream.last_arrival = Some(arrival);

        // Assign a timestamp for protocols that carry none, keeping the
        // synthesized clock in frame units like RTP would.
        let frames = packet.format.frames_in(packet.payload.len()) as u32;
        let rtp = match packet.rtp_timestamp {
            Some(ts) => ts,
            None => {
                let ts = stream.synth_rtp;
                packet.rtp_timestamp = Some(ts);
                ts
            }
        };
        stream.synth_rtp = rtp.wrapping_add(frames);

        // Anchor maintenance
        match stream.anchor.as_mut() {
            None => {
                stream.anchor = Some(StreamAnchor::new(arrival, rtp, packet.format.sample_rate));
            }
            Some(anchor) => {
                let (_, must_reanchor) = anchor.observe(
                    arrival,
                    rtp,
                    tuning.max_catchup_lag_ms / 1000.0,
                    tuning.rtp_continuity_slack_seconds,
                );
                if must_reanchor {
                    anchor.reanchor(arrival, rtp);
                    stream.anchor_resets += 1;
                    stream.rate.reset();
                    log::debug!("catch-up lag exceeded on {}, re-anchored", packet.source_tag);
                }
            }
        }

        // Pending-pressure re-anchor: too many packets mapped into the
        // future means the anchor has fallen behind the sender clock.
        if stream.ring.len() >= tuning.max_clock_pending_packets {
            if let Some(anchor) = stream.anchor.as_mut() {
                if anchor.rtp_to_mono(rtp) > arrival + 1.0 {
                    anchor.reanchor(arrival, rtp);
                    stream.anchor_resets += 1;
                    stream.rate.reset();
                }
            }
        }

        // Sorted insert; arrivals are almost always already in order
        let in_order = stream
            .ring
            .back()
            .and_then(|b| b.rtp_timestamp)
            .map_or(true, |back| rtp.wrapping_sub(back) as i32 >= 0);
        if in_order {
            stream.ring.push_back(packet);
        } else {
            let pos = stream
                .ring
                .iter()
                .rposition(|p| {
                    p.rtp_timestamp
                        .map_or(true, |ts| rtp.wrapping_sub(ts) as i32 >= 0)
                })
                .map_or(0, |idx| idx + 1);
            stream.ring.insert(pos, packet);
        }

        if stream.ring.len() > RING_MAX_PACKETS {
            stream.ring.pop_front();
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn dispatch_once(&self, now: MonoTime) -> usize {
        let tuning = self.tuning.read().clone();
        let mut state = self.state.lock();
        let state = &mut *state;

        // Drain everything queued since the last iteration
        while let Ok(pkt) = self.ingest_rx.try_recv() {
            self.ingest_packet(state, pkt);
        }

        let mut released = 0usize;
        let late_slack = tuning.late_packet_threshold_ms / 1000.0;

        for sub in state.subscribers.values_mut() {
            let Some(stream) = state.streams.get_mut(&*sub.source_tag) else {
                continue;
            };
            let Some(anchor) = stream.anchor.clone() else {
                continue;
            };
            let playhead = now - sub.delay_secs - sub.timeshift_secs;
            let rate = stream.rate.rate();

            for pkt in stream.ring.iter() {
                let rtp = pkt.rtp_timestamp.unwrap_or(0);
                if let Some(last) = sub.last_rtp {
                    if rtp.wrapping_sub(last) as i32 <= 0 {
                        continue;
                    }
                }
                let mapped = anchor.rtp_to_mono(rtp);
                if mapped > playhead {
                    break;
                }
                sub.last_rtp = Some(rtp);
                // Late = the packet arrived after its dispatch slot had
                // already passed by more than the threshold.
                if pkt.arrival > playhead + late_slack {
                    stream.late_drops += 1;
                    continue;
                }
                let mut out = pkt.clone();
                out.playback_rate = rate;
                if sub.queue.push(out).is_err() {
                    self.discarded.fetch_add(1, Ordering::Relaxed);
                } else {
                    released += 1;
                    self.dispatched.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        // Rate control: error from the shallowest subscriber buffer per tag
        for (tag, stream) in state.streams.iter_mut() {
            let Some(anchor) = stream.anchor.as_ref() else {
                continue;
            };
            let Some(newest) = stream.ring.back().and_then(|p| p.rtp_timestamp) else {
                continue;
            };
            let newest_mapped = anchor.rtp_to_mono(newest);
            let mut min_level: Option<f64> = None;
            for sub in state.subscribers.values() {
                if &*sub.source_tag != &**tag {
                    continue;
                }
                let playhead = now - sub.delay_secs - sub.timeshift_secs;
                let level = newest_mapped - playhead;
                min_level = Some(min_level.map_or(level, |m: f64| m.min(level)));
            }
            if let Some(level) = min_level {
                let error_ms = level * 1000.0 - tuning.target_buffer_level_ms;
                stream.rate.update(error_ms, now, &tuning);
            }
        }

        // Periodic history expiry
        if now - state.last_cleanup >= tuning.cleanup_interval_ms as f64 / 1000.0 {
            state.last_cleanup = now;
            let horizon = now - self.history_secs;
            for stream in state.streams.values_mut() {
                let Some(anchor) = stream.anchor.clone() else {
                    continue;
                };
                while let Some(front) = stream.ring.front() {
                    let rtp = front.rtp_timestamp.unwrap_or(0);
                    if anchor.rtp_to_mono(rtp) < horizon {
                        stream.ring.pop_front();
                    } else {
                        break;
                    }
                }
            }
        }

        released
    }
}
