//! Tests against real audio devices.
//!
//! Note: These tests require audio hardware and are ignored by default.
//! Run with `cargo test -- --ignored` on a machine with a microphone and speakers.

use pagi_converse::{AudioClip, AudioConfig, AudioSink, AudioSource, MicrophoneSource, RodioSink};
use std::time::{Duration, Instant};

#[test]
#[ignore] // Requires an input device
fn test_microphone_delivers_chunks() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let config = AudioConfig::default();
    let expected = config.chunk_bytes();
    let mut mic = MicrophoneSource::open(config).expect("Failed to open microphone");

    let started = Instant::now();
    let mut chunks = 0;
    while started.elapsed() < Duration::from_secs(1) {
        if let Some(chunk) = mic.read(Duration::from_millis(500)).expect("read failed") {
            assert_eq!(chunk.len(), expected);
            chunks += 1;
        }
    }
    println!("🎤 {} chunks in 1s", chunks);
    assert!(chunks >= 5, "microphone delivered only {} chunks", chunks);
}

#[test]
#[ignore] // Requires an input device
fn test_list_input_devices() {
    let devices = MicrophoneSource::list_input_devices().expect("Failed to enumerate devices");
    for device in &devices {
        println!("🎧 {}", device);
    }
    assert!(!devices.is_empty());
}

#[test]
#[ignore] // Requires an output device
fn test_stop_cuts_playback_short() {
    let sink = std::sync::Arc::new(RodioSink::open().expect("Failed to open output"));

    // One second of 16 kHz mono silence as WAV.
    let samples = 16_000usize;
    let mut wav = Vec::with_capacity(44 + samples * 2);
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&((36 + samples * 2) as u32).to_le_bytes());
    wav.extend_from_slice(b"WAVEfmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes());
    wav.extend_from_slice(&16_000u32.to_le_bytes());
    wav.extend_from_slice(&32_000u32.to_le_bytes());
    wav.extend_from_slice(&2u16.to_le_bytes());
    wav.extend_from_slice(&16u16.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&((samples * 2) as u32).to_le_bytes());
    wav.resize(44 + samples * 2, 0);
    let clip = AudioClip::new("silence", wav);

    let stopper = {
        let sink = std::sync::Arc::clone(&sink);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            sink.stop();
        })
    };
    let started = Instant::now();
    sink.play(&clip).expect("playback failed");
    stopper.join().unwrap();

    assert!(started.elapsed() < Duration::from_millis(800));
    assert!(!sink.is_playing());
}
