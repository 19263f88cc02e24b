//! Audio capture and playback using CPAL and Rodio
//!
//! The engine only sees two narrow seams: an [`AudioSource`] it pulls PCM chunks from,
//! and an [`AudioSink`] that plays one synthesized [`AudioClip`] at a time and can be
//! stopped mid-clip (the interruption kill-switch). CPAL streams and the Rodio output
//! stream are not `Send` on every platform, so both live on dedicated threads here.

use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use rodio::{OutputStream, Sink, Source};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Synthesized speech for one chunk of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    /// The text this clip speaks.
    pub text: String,
    /// Encoded audio (WAV/MP3). Empty means "nothing to play".
    pub bytes: Vec<u8>,
}

impl AudioClip {
    pub fn new(text: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            text: text.into(),
            bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Pull interface for captured audio.
pub trait AudioSource: Send {
    /// Next chunk of raw PCM, or `Ok(None)` if nothing arrived within `timeout`.
    fn read(&mut self, timeout: Duration) -> VoiceResult<Option<Vec<u8>>>;
}

/// Playback device for synthesized clips.
pub trait AudioSink: Send + Sync {
    /// Play `clip`, blocking until it finished or [`AudioSink::stop`] was called.
    fn play(&self, clip: &AudioClip) -> VoiceResult<()>;

    /// Stop playback immediately and drop anything queued.
    fn stop(&self);

    /// Whether audio is currently queued or playing.
    fn is_playing(&self) -> bool;
}

/// Audio capture configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Number of channels (default: 1 for mono)
    pub channels: u16,

    /// Length of one chunk handed to the transcription client (default: 100ms)
    pub chunk_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            chunk_ms: 100,
        }
    }
}

impl AudioConfig {
    /// Bytes of 16-bit PCM in one chunk.
    pub fn chunk_bytes(&self) -> usize {
        self.samples_per_chunk() * 2
    }

    fn samples_per_chunk(&self) -> usize {
        (self.sample_rate as usize * self.channels as usize * self.chunk_ms as usize) / 1000
    }
}

/// Microphone capture via CPAL, delivering 16-bit little-endian PCM chunks.
pub struct MicrophoneSource {
    rx: Receiver<Vec<u8>>,
    stop: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl MicrophoneSource {
    /// Open the default input device and start capturing.
    pub fn open(config: AudioConfig) -> VoiceResult<Self> {
        info!(
            "🎤 Initializing audio capture ({}Hz, {} channels, {}ms chunks)",
            config.sample_rate, config.channels, config.chunk_ms
        );

        let (chunk_tx, rx) = mpsc::sync_channel(64);
        let (ready_tx, ready_rx) = mpsc::channel::<VoiceResult<()>>();
        let stop = Arc::new(AtomicBool::new(false));

        let stop_flag = Arc::clone(&stop);
        let worker = thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let stream = match build_input_stream(&config, chunk_tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // The stream must stay on this thread; keep it alive until asked to stop.
                while !stop_flag.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(50));
                }
                drop(stream);
                debug!("🎤 Capture thread exiting");
            })?;

        ready_rx
            .recv()
            .map_err(|e| VoiceError::AudioStream(e.to_string()))??;

        info!("✅ Audio capture started");
        Ok(Self {
            rx,
            stop,
            worker: Some(worker),
        })
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

impl AudioSource for MicrophoneSource {
    fn read(&mut self, timeout: Duration) -> VoiceResult<Option<Vec<u8>>> {
        match self.rx.recv_timeout(timeout) {
            Ok(chunk) => Ok(Some(chunk)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(VoiceError::AudioStream("capture stream ended".to_string()))
            }
        }
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn build_input_stream(config: &AudioConfig, chunk_tx: SyncSender<Vec<u8>>) -> VoiceResult<Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;
    info!(
        "📱 Using input device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );
    debug!("🔧 Default config: {:?}", device.default_input_config()?);

    let stream_config = StreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let chunk_samples = config.samples_per_chunk().max(1);
    let mut pcm = Vec::with_capacity(chunk_samples * 2);

    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            for &sample in data {
                let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                pcm.extend_from_slice(&value.to_le_bytes());

                if pcm.len() >= chunk_samples * 2 {
                    let chunk = std::mem::replace(&mut pcm, Vec::with_capacity(chunk_samples * 2));
                    // Never block the audio callback; a full channel means the consumer lags.
                    if let Err(e) = chunk_tx.try_send(chunk) {
                        warn!("Dropping audio chunk: {}", e);
                    }
                }
            }
        },
        move |err| {
            warn!("Audio stream error: {}", err);
        },
        None,
    )?;

    stream.play()?;
    Ok(stream)
}

/// Rodio playback. The output stream lives on its own thread for the lifetime of the sink.
pub struct RodioSink {
    sink: Arc<Sink>,
    _keepalive: mpsc::Sender<()>,
}

impl RodioSink {
    /// Open the default output device.
    pub fn open() -> VoiceResult<Self> {
        info!("🔊 Initializing audio playback");

        let (sink_tx, sink_rx) = mpsc::channel::<VoiceResult<Arc<Sink>>>();
        let (keepalive, parked) = mpsc::channel::<()>();

        thread::Builder::new()
            .name("rodio-output".to_string())
            .spawn(move || {
                let (stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = sink_tx.send(Err(VoiceError::Playback(e.to_string())));
                        return;
                    }
                };
                match Sink::try_new(&handle) {
                    Ok(sink) => {
                        let _ = sink_tx.send(Ok(Arc::new(sink)));
                    }
                    Err(e) => {
                        let _ = sink_tx.send(Err(VoiceError::Playback(e.to_string())));
                        return;
                    }
                }
                // Returns once the RodioSink (and its sender) is dropped.
                let _ = parked.recv();
                drop(stream);
            })?;

        let sink = sink_rx
            .recv()
            .map_err(|e| VoiceError::Playback(e.to_string()))??;

        info!("✅ Audio playback initialized");
        Ok(Self {
            sink,
            _keepalive: keepalive,
        })
    }
}

impl AudioSink for RodioSink {
    fn play(&self, clip: &AudioClip) -> VoiceResult<()> {
        if clip.is_empty() {
            return Ok(());
        }
        let source = rodio::Decoder::new(Cursor::new(clip.bytes.clone()))
            .map_err(|e| VoiceError::Playback(format!("Decode failed: {}", e)))?;
        self.sink.append(source.convert_samples::<f32>());
        self.sink.sleep_until_end();
        Ok(())
    }

    fn stop(&self) {
        self.sink.stop();
        info!("⏹️ Audio playback stopped");
    }

    fn is_playing(&self) -> bool {
        !self.sink.empty()
    }
}
