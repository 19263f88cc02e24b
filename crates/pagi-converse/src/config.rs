//! Assistant configuration loaded from file and environment.
//!
//! Precedence: env `PAGI_VOICE__<SECTION>__<KEY>` > file at `$PAGI_VOICE_CONFIG`
//! (default `config/voice.toml`) > built-in defaults.
//!
//! ```toml
//! [speaker]
//! max_workers = 3
//! cache_dir = "./data/voice-cache"
//!
//! [detector]
//! keywords = ["你好", "小惠"]
//!
//! [agent]
//! backend = "echo"
//! ```

use crate::audio::AudioConfig;
use crate::error::VoiceResult;
use crate::speaker::SpeakerConfig;
use crate::transcription::{ClientConfig, StreamMeta};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

/// Pluggable backend choice: registry slug plus backend-specific settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSelection {
    pub backend: String,
    pub settings: Value,
}

impl BackendSelection {
    pub fn named(backend: &str) -> Self {
        Self {
            backend: backend.to_string(),
            settings: Value::Null,
        }
    }
}

impl Default for BackendSelection {
    fn default() -> Self {
        Self::named("placeholder")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeakerSettings {
    pub max_workers: usize,
    pub min_chunk_chars: usize,
    pub begin_timeout_ms: u64,
    pub end_timeout_ms: u64,
    /// Voice cache directory; no cache when unset.
    pub cache_dir: Option<PathBuf>,
    /// Also cache chunks of ordered replies.
    pub cache_ordered: bool,
    /// Cached clips older than this are pruned.
    pub cache_max_age_days: u64,
    /// How often the cache is pruned while running; 0 prunes only at startup.
    pub cache_prune_interval_secs: u64,
    pub tts: BackendSelection,
}

impl Default for SpeakerSettings {
    fn default() -> Self {
        Self {
            max_workers: 3,
            min_chunk_chars: 4,
            begin_timeout_ms: 10_000,
            end_timeout_ms: 30_000,
            cache_dir: None,
            cache_ordered: false,
            cache_max_age_days: 7,
            cache_prune_interval_secs: 86_400,
            tts: BackendSelection::default(),
        }
    }
}

impl SpeakerSettings {
    pub fn cache_max_age(&self) -> Duration {
        Duration::from_secs(self.cache_max_age_days * 24 * 3600)
    }

    pub fn cache_prune_interval(&self) -> Option<Duration> {
        (self.cache_prune_interval_secs > 0)
            .then(|| Duration::from_secs(self.cache_prune_interval_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionSettings {
    pub backend: String,
    pub settings: Value,
    pub backoff_ms: u64,
    pub sample_rate: u32,
    pub chunk_ms: u32,
    pub event_buffer: usize,
    /// Extra handshake fields sent with every connection.
    pub meta: serde_json::Map<String, Value>,
}

impl Default for TranscriptionSettings {
    fn default() -> Self {
        Self {
            backend: "placeholder".to_string(),
            settings: Value::Null,
            backoff_ms: 5_000,
            sample_rate: 16_000,
            chunk_ms: 100,
            event_buffer: 1024,
            meta: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    pub keywords: Vec<String>,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            keywords: vec!["你好".to_string(), "小惠".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerSettings {
    /// Listening ticker period.
    pub interval_ms: u64,
    /// Quiet ticks (after some text) that end listening.
    pub silence_ticks: u32,
    /// Hard cap on listening ticks.
    pub max_listen_ticks: u32,
    /// How long recognizing waits for the final text.
    pub recognize_timeout_ms: u64,
    /// Text ignored right after a manual wake.
    pub interrupt_ms: u64,
}

impl Default for RecognizerSettings {
    fn default() -> Self {
        Self {
            interval_ms: 200,
            silence_ticks: 3,
            max_listen_ticks: 50,
            recognize_timeout_ms: 3_000,
            interrupt_ms: 1_000,
        }
    }
}

impl RecognizerSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn recognize_timeout(&self) -> Duration {
        Duration::from_millis(self.recognize_timeout_ms)
    }

    pub fn interrupt_window(&self) -> Duration {
        Duration::from_millis(self.interrupt_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerSettings {
    /// Silence is streamed for this long after a manual commit.
    pub commit_pause_ms: u64,
    /// Read timeout on the audio source.
    pub read_timeout_ms: u64,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            commit_pause_ms: 2_000,
            read_timeout_ms: 500,
        }
    }
}

impl ListenerSettings {
    pub fn commit_pause(&self) -> Duration {
        Duration::from_millis(self.commit_pause_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub backend: String,
    pub settings: Value,
    /// Spoken when nothing was recognized.
    pub pardon: String,
    /// Queries that end the reply without speaking.
    pub stop_words: Vec<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            backend: "echo".to_string(),
            settings: Value::Null,
            pardon: "没听清呢。".to_string(),
            stop_words: ["暂停。", "停止。", "闭嘴。", "停一下。"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Complete assistant configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    pub speaker: SpeakerSettings,
    pub transcription: TranscriptionSettings,
    pub detector: DetectorSettings,
    pub recognizer: RecognizerSettings,
    pub listener: ListenerSettings,
    pub agent: AgentSettings,
}

impl AssistantConfig {
    /// Load from `$PAGI_VOICE_CONFIG` (default `config/voice`) and the environment.
    pub fn load() -> VoiceResult<Self> {
        let config_path =
            std::env::var("PAGI_VOICE_CONFIG").unwrap_or_else(|_| "config/voice".to_string());
        Self::load_from(&config_path)
    }

    /// Load from the file at `path` (extension optional, missing file allowed) and the environment.
    pub fn load_from(path: &str) -> VoiceResult<Self> {
        let built = config::Config::builder()
            .set_default("transcription.backend", "placeholder")?
            .set_default("speaker.tts.backend", "placeholder")?
            .set_default("agent.backend", "echo")?
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("PAGI_VOICE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(built.try_deserialize()?)
    }

    pub fn speaker_config(&self) -> SpeakerConfig {
        let s = &self.speaker;
        SpeakerConfig {
            max_workers: s.max_workers.max(1),
            min_chunk_chars: s.min_chunk_chars,
            begin_timeout: Duration::from_millis(s.begin_timeout_ms),
            end_timeout: Duration::from_millis(s.end_timeout_ms),
            cache_ordered: s.cache_ordered,
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        let t = &self.transcription;
        ClientConfig {
            backoff: Duration::from_millis(t.backoff_ms),
            meta: StreamMeta {
                is_speaking: true,
                extra: t.meta.clone(),
            },
            event_buffer: t.event_buffer.max(1),
        }
    }

    pub fn audio_config(&self) -> AudioConfig {
        AudioConfig {
            sample_rate: self.transcription.sample_rate,
            chunk_ms: self.transcription.chunk_ms,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AssistantConfig::default();
        assert_eq!(config.speaker.max_workers, 3);
        assert_eq!(config.detector.keywords, vec!["你好", "小惠"]);
        assert_eq!(config.agent.pardon, "没听清呢。");
        assert_eq!(config.agent.stop_words.len(), 4);

        let speaker = config.speaker_config();
        assert_eq!(speaker.begin_timeout, Duration::from_secs(10));
        assert_eq!(config.client_config().backoff, Duration::from_secs(5));
        assert_eq!(config.audio_config().chunk_bytes(), 3200);
        assert_eq!(config.speaker.cache_max_age(), Duration::from_secs(7 * 86_400));
        assert_eq!(
            config.speaker.cache_prune_interval(),
            Some(Duration::from_secs(86_400))
        );
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = AssistantConfig::load_from("/nonexistent/pagi-voice").unwrap();
        assert_eq!(config, AssistantConfig::default());
    }

    #[test]
    fn test_file_overrides_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voice.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[speaker]
max_workers = 5

[speaker.tts]
backend = "openai"
settings = {{ voice = "nova" }}

[detector]
keywords = ["嘿 小惠"]

[transcription.meta]
lang = "zh"
"#
        )
        .unwrap();

        let config = AssistantConfig::load_from(path.to_str().unwrap()).unwrap();
        assert_eq!(config.speaker.max_workers, 5);
        assert_eq!(config.speaker.end_timeout_ms, 30_000);
        assert_eq!(config.speaker.tts.backend, "openai");
        assert_eq!(config.speaker.tts.settings["voice"], "nova");
        assert_eq!(config.detector.keywords, vec!["嘿 小惠"]);
        assert_eq!(config.client_config().meta.extra["lang"], "zh");
        assert_eq!(config.recognizer.silence_ticks, 3);
    }
}
