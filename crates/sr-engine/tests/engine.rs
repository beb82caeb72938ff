//! End-to-end engine scenarios: packets in through the manager, payloads
//! out through sink taps, with all worker threads live.

use std::collections::HashMap;
use std::net::UdpSocket;
use std::thread;
use std::time::Duration;

use sr_core::{AudioFormat, MonoTime, TaggedAudioPacket};
use sr_dsp::EQ_BANDS;
use sr_engine::{AudioManager, SinkConfig, SinkProtocol, SourceConfig, SourceParameterUpdate};

const TAG: &str = "10.0.0.42";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn free_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn sink_config(id: &str, protocol: SinkProtocol) -> SinkConfig {
    SinkConfig {
        id: id.into(),
        output_ip: "127.0.0.1".into(),
        output_port: free_port(),
        sample_rate: 48000,
        channels: 2,
        bit_depth: 16,
        channel_layout: None,
        protocol,
        enable_mp3: false,
        time_sync_enabled: false,
        time_sync_delay_ms: 0,
        speaker_layout: None,
        volume_normalization: false,
    }
}

fn source_config() -> SourceConfig {
    SourceConfig {
        tag: TAG.into(),
        initial_volume: 1.0,
        initial_delay_ms: 0,
        initial_timeshift_sec: 0.0,
        target_output_channels: 2,
        target_output_samplerate: 48000,
        initial_eq: [1.0; EQ_BANDS],
        speaker_layouts_map: HashMap::new(),
    }
}

/// One packet of interleaved 16-bit stereo at 48 kHz, a 440 Hz tone
/// phase-continuous across packets
fn packet_16(rtp: u32, frames: usize, amplitude: i16) -> TaggedAudioPacket {
    let omega = 2.0 * std::f64::consts::PI * 440.0 / 48000.0;
    let mut payload = Vec::with_capacity(frames * 4);
    for n in 0..frames {
        let v = (f64::from(amplitude) * (omega * (rtp as usize + n) as f64).sin()) as i16;
        payload.extend_from_slice(&v.to_le_bytes());
        payload.extend_from_slice(&v.to_le_bytes());
    }
    TaggedAudioPacket {
        source_tag: TAG.into(),
        arrival: MonoTime::now(),
        rtp_timestamp: Some(rtp),
        format: AudioFormat {
            sample_rate: 48000,
            channels: 2,
            bit_depth: 16,
        },
        channel_layout: 0x3,
        playback_rate: 1.0,
        payload,
    }
}

/// One packet of interleaved 24-bit stereo at 44.1 kHz, a 440 Hz tone
fn packet_24_44k(rtp: u32, frames: usize, amplitude: i32) -> TaggedAudioPacket {
    let omega = 2.0 * std::f64::consts::PI * 440.0 / 44100.0;
    let mut payload = Vec::with_capacity(frames * 6);
    for n in 0..frames {
        let v = (f64::from(amplitude) * (omega * (rtp as usize + n) as f64).sin()) as i32;
        for _ in 0..2 {
            let b = v.to_le_bytes();
            payload.extend_from_slice(&b[..3]);
        }
    }
    TaggedAudioPacket {
        source_tag: TAG.into(),
        arrival: MonoTime::now(),
        rtp_timestamp: Some(rtp),
        format: AudioFormat {
            sample_rate: 44100,
            channels: 2,
            bit_depth: 24,
        },
        channel_layout: 0x3,
        playback_rate: 1.0,
        payload,
    }
}

fn peak_i16(payload: &[u8]) -> i32 {
    payload
        .chunks_exact(2)
        .map(|b| i32::from(i16::from_le_bytes([b[0], b[1]])).abs())
        .max()
        .unwrap_or(0)
}

#[test]
fn test_scream_passthrough_level_survives() {
    init_logging();
    let manager = AudioManager::new();
    assert!(manager.initialize(0, 10.0));
    manager.add_sink(sink_config("pass", SinkProtocol::Scream)).unwrap();
    let id = manager.configure_source(source_config()).unwrap();
    manager.connect_source_sink(id, "pass").unwrap();
    let tap = manager.register_sink_tap("pass", 256).unwrap();

    // Feed half a second of a small 440 Hz tone in 24 ms packets
    for n in 0..24u32 {
        manager.add_packet(packet_16(n * 1152, 1152, 800)).unwrap();
        thread::sleep(Duration::from_millis(24));
    }
    thread::sleep(Duration::from_millis(200));

    let mut peaks = Vec::new();
    while let Ok(payload) = tap.try_recv() {
        peaks.push(peak_i16(&payload));
    }
    assert!(!peaks.is_empty(), "no payloads reached the tap");
    let peak = *peaks.iter().max().unwrap();
    // Unity gain, flat EQ, auto layout: level survives within 0.5 dB
    assert!((760..=840).contains(&peak), "peak {peak}");

    let stats = manager.get_audio_engine_stats().unwrap();
    assert!(stats.sources[0].chunks_emitted > 0);
    assert!(stats.sources[0].healthy);
    manager.shutdown();
}

#[test]
fn test_format_conversion_44k24_to_48k16_rtp() {
    init_logging();
    let manager = AudioManager::new();
    assert!(manager.initialize(0, 10.0));
    manager.add_sink(sink_config("conv", SinkProtocol::Rtp)).unwrap();
    let id = manager.configure_source(source_config()).unwrap();
    manager.connect_source_sink(id, "conv").unwrap();
    let tap = manager.register_sink_tap("conv", 256).unwrap();

    // ~0.6 s of 24-bit 44.1k audio in 1058-frame (24 ms) packets
    let amplitude = 1_000_000; // ~0.12 full scale at 24-bit
    for n in 0..25u32 {
        manager
            .add_packet(packet_24_44k(n * 1058, 1058, amplitude))
            .unwrap();
        thread::sleep(Duration::from_millis(24));
    }
    thread::sleep(Duration::from_millis(200));

    let mut got_signal = false;
    while let Ok(payload) = tap.try_recv() {
        // RTP sink still taps raw PCM payloads at the sink format
        assert_eq!(payload.len(), 1152 * 2 * 2);
        if peak_i16(&payload) > 100 {
            got_signal = true;
        }
    }
    assert!(got_signal, "converted audio never reached the sink");

    let stats = manager.get_audio_engine_stats().unwrap();
    assert!(stats.sources[0].chunks_emitted > 0);
    // Initial format adoption is silent; no counted reconfiguration
    assert_eq!(stats.sources[0].reconfigurations, 0);
    manager.shutdown();
}

#[test]
fn test_hot_volume_reconfiguration_keeps_output_continuous() {
    init_logging();
    let manager = AudioManager::new();
    assert!(manager.initialize(0, 10.0));
    manager.add_sink(sink_config("hot", SinkProtocol::Scream)).unwrap();
    let id = manager.configure_source(source_config()).unwrap();
    manager.connect_source_sink(id, "hot").unwrap();
    let tap = manager.register_sink_tap("hot", 512).unwrap();

    // Feeder thread: steady small signal for ~1.2 s, with 50 successive
    // volume updates 0.02 apart applied over ~100 ms mid-stream
    thread::scope(|scope| {
        let feeder = scope.spawn(|| {
            for n in 0..50u32 {
                manager.add_packet(packet_16(n * 1152, 1152, 600)).unwrap();
                thread::sleep(Duration::from_millis(24));
            }
        });

        thread::sleep(Duration::from_millis(300));
        for step in 1..=50u32 {
            manager
                .update_source_parameters(
                    id,
                    SourceParameterUpdate {
                        volume: Some(step as f64 * 0.02),
                        ..Default::default()
                    },
                )
                .unwrap();
            thread::sleep(Duration::from_millis(2));
        }
        feeder.join().unwrap();
    });
    thread::sleep(Duration::from_millis(200));

    let mut payload_count = 0usize;
    let mut last_peak = 0;
    while let Ok(payload) = tap.try_recv() {
        payload_count += 1;
        let p = peak_i16(&payload);
        if p > 0 {
            last_peak = p;
        }
    }
    // Output never gapped: one payload per cycle for the whole run
    assert!(payload_count >= 40, "only {payload_count} payloads");
    // Final volume is 1.0: level back at the source amplitude
    assert!((560..=640).contains(&last_peak), "last peak {last_peak}");

    let stats = manager.get_audio_engine_stats().unwrap();
    // The stream ends after the feeder stops, which charges exactly one
    // dry-spell underrun; reconfiguration itself must not add any.
    assert!(stats.sinks[0].underruns <= 1, "gap during reconfiguration");
    manager.shutdown();
}

#[test]
fn test_sink_churn_leaves_longlived_sink_uninterrupted() {
    init_logging();
    let manager = AudioManager::new();
    assert!(manager.initialize(0, 10.0));
    manager.add_sink(sink_config("stable", SinkProtocol::Scream)).unwrap();
    let id = manager.configure_source(source_config()).unwrap();
    manager.connect_source_sink(id, "stable").unwrap();

    thread::scope(|scope| {
        let feeder = scope.spawn(|| {
            for n in 0..60u32 {
                manager.add_packet(packet_16(n * 1152, 1152, 500)).unwrap();
                thread::sleep(Duration::from_millis(24));
            }
        });

        for round in 0..50 {
            let name = format!("churn-{round}");
            manager.add_sink(sink_config(&name, SinkProtocol::Scream)).unwrap();
            manager.connect_source_sink(id, &name).unwrap();
            manager.disconnect_source_sink(id, &name).unwrap();
            manager.remove_sink(&name).unwrap();
        }
        feeder.join().unwrap();
    });
    thread::sleep(Duration::from_millis(100));

    let stats = manager.get_audio_engine_stats().unwrap();
    let stable = stats
        .sinks
        .iter()
        .find(|s| s.sink_id == "stable")
        .expect("long-lived sink present");
    assert!(stable.cycles > 40, "cycles {}", stable.cycles);
    // At most one underrun per churn event
    assert!(stable.underruns <= 50, "underruns {}", stable.underruns);
    assert!(stable.healthy);
    assert_eq!(stats.global.active_sinks, 1);
    manager.shutdown();
}

#[test]
fn test_two_synced_sinks_share_a_rate_group() {
    init_logging();
    let manager = AudioManager::new();
    assert!(manager.initialize(0, 10.0));
    let mut a = sink_config("sync-a", SinkProtocol::Scream);
    a.time_sync_enabled = true;
    let mut b = sink_config("sync-b", SinkProtocol::Scream);
    b.time_sync_enabled = true;
    manager.add_sink(a).unwrap();
    manager.add_sink(b).unwrap();
    let id = manager.configure_source(source_config()).unwrap();
    manager.connect_source_sink(id, "sync-a").unwrap();
    manager.connect_source_sink(id, "sync-b").unwrap();

    for n in 0..30u32 {
        manager.add_packet(packet_16(n * 1152, 1152, 400)).unwrap();
        thread::sleep(Duration::from_millis(24));
    }
    thread::sleep(Duration::from_millis(100));

    let stats = manager.get_audio_engine_stats().unwrap();
    let cycles: Vec<u64> = stats.sinks.iter().map(|s| s.cycles).collect();
    assert_eq!(cycles.len(), 2);
    // Barrier-coupled sinks emit the same number of chunks within a few
    // cycles of each other over the run.
    let diff = cycles[0].abs_diff(cycles[1]);
    assert!(diff <= 5, "cycle skew {diff}");
    for sink in &stats.sinks {
        assert!(!sink.sync_degraded, "{} degraded", sink.sink_id);
    }
    manager.shutdown();
}
