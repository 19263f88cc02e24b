//! Speech synthesis backends and the on-disk voice cache.
//!
//! [`TtsBackend`] is called from several synthesis workers at once, so implementations
//! must be `Send + Sync` and free of side effects beyond producing audio.

use crate::audio::AudioClip;
use crate::error::{VoiceError, VoiceResult};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Backend that turns text into audio. Implement for OpenAI/ElevenLabs/local TTS.
pub trait TtsBackend: Send + Sync {
    /// Synthesize `text`. An empty clip means "nothing to play".
    fn synthesize(&self, text: &str) -> VoiceResult<AudioClip>;
}

/// Placeholder TTS: returns empty audio so nothing plays.
#[derive(Debug, Default)]
pub struct PlaceholderTts;

impl TtsBackend for PlaceholderTts {
    fn synthesize(&self, text: &str) -> VoiceResult<AudioClip> {
        Ok(AudioClip::new(text, Vec::new()))
    }
}

/// Production TTS backend: OpenAI-compatible `/audio/speech` API (OpenAI, OpenRouter, etc.).
#[derive(Debug, Clone)]
pub struct OpenAiTts {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    /// Bearer API key.
    pub api_key: String,
    /// TTS model: tts-1 (fast) or tts-1-hd (higher quality).
    pub model: String,
    /// Voice name (alloy, echo, fable, onyx, nova, shimmer, ...).
    pub voice: String,
    /// HTTP client (blocking); synthesis already runs on blocking workers.
    client: reqwest::blocking::Client,
}

impl OpenAiTts {
    /// Build from environment: TTS_API_URL, TTS_API_KEY (or OPENAI_API_KEY), TTS_MODEL, TTS_VOICE.
    pub fn from_env() -> VoiceResult<Self> {
        let base_url = std::env::var("TTS_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("TTS_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| {
                VoiceError::Config("TTS requires TTS_API_KEY or OPENAI_API_KEY".to_string())
            })?;
        let model = std::env::var("TTS_MODEL").unwrap_or_else(|_| "tts-1".to_string());
        let voice = std::env::var("TTS_VOICE").unwrap_or_else(|_| "nova".to_string());
        Self::new(base_url, api_key, model, voice)
    }

    /// Create with explicit settings (e.g. for tests or non-env wiring).
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        voice: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            voice: voice.into(),
            client,
        })
    }
}

impl TtsBackend for OpenAiTts {
    fn synthesize(&self, text: &str) -> VoiceResult<AudioClip> {
        let input = text.trim();
        if input.is_empty() {
            return Ok(AudioClip::new(text, Vec::new()));
        }
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": input,
            "voice": self.voice,
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Synthesis(format!("TTS API error {}: {}", status, body)));
        }
        let bytes = res.bytes().map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        Ok(AudioClip::new(text, bytes.to_vec()))
    }
}

/// File cache of synthesized clips keyed by the SHA-256 of their text.
#[derive(Debug, Clone)]
pub struct VoiceCache {
    dir: PathBuf,
}

impl VoiceCache {
    /// Use (and create if needed) `dir` for cached clips.
    pub fn open(dir: impl AsRef<Path>) -> VoiceResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        info!("🗄️ Voice cache at {}", dir.display());
        Ok(Self { dir })
    }

    /// Cache key for `text`.
    pub fn key(text: &str) -> String {
        hex::encode(Sha256::digest(text.as_bytes()))
    }

    fn path(&self, text: &str) -> PathBuf {
        self.dir.join(format!("{}.audio", Self::key(text)))
    }

    pub fn get(&self, text: &str) -> Option<AudioClip> {
        let bytes = fs::read(self.path(text)).ok()?;
        debug!("🗄️ Voice cache hit: {}", text);
        Some(AudioClip::new(text, bytes))
    }

    /// Store `clip` under its text. Empty clips are not cached.
    pub fn put(&self, clip: &AudioClip) -> VoiceResult<()> {
        if clip.is_empty() {
            return Ok(());
        }
        fs::write(self.path(&clip.text), &clip.bytes)?;
        Ok(())
    }

    /// Delete cached clips older than `max_age`. Returns how many were removed.
    pub fn prune(&self, max_age: Duration) -> VoiceResult<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let modified = entry.metadata()?.modified()?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age > max_age {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("🗄️ Pruned {} cached clip(s)", removed);
        }
        Ok(removed)
    }

    /// Prune now, then every `every` (once only when `None`). Runs until aborted.
    pub fn spawn_janitor(&self, max_age: Duration, every: Option<Duration>) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = every.map(tokio::time::interval);
            loop {
                if let Some(interval) = interval.as_mut() {
                    interval.tick().await;
                }
                let pass = cache.clone();
                match tokio::task::spawn_blocking(move || pass.prune(max_age)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!("Voice cache prune failed: {}", e),
                    Err(e) => warn!("Voice cache prune crashed: {}", e),
                }
                if interval.is_none() {
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_tts_returns_empty() {
        let clip = PlaceholderTts.synthesize("hello").unwrap();
        assert!(clip.is_empty());
        assert_eq!(clip.text, "hello");
    }

    #[test]
    fn test_cache_round_trip_by_text() {
        let dir = tempfile::tempdir().unwrap();
        let cache = VoiceCache::open(dir.path()).unwrap();

        assert!(cache.get("你好").is_none());
        cache.put(&AudioClip::new("你好", vec![1, 2, 3])).unwrap();
        assert_eq!(cache.get("你好").unwrap().bytes, vec![1, 2, 3]);
        assert!(cache.get("再见").is_none());

        // Empty clips are never stored.
        cache.put(&AudioClip::new("空", Vec::new())).unwrap();
        assert!(cache.get("空").is_none());
    }

    #[test]
    fn test_cache_key_is_stable_hex() {
        let key = VoiceCache::key("hello");
        assert_eq!(key.len(), 64);
        assert_eq!(key, VoiceCache::key("hello"));
        assert_ne!(key, VoiceCache::key("hello!"));
    }

    #[test]
    fn test_prune_removes_old_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = VoiceCache::open(dir.path()).unwrap();
        cache.put(&AudioClip::new("a", vec![1])).unwrap();

        assert_eq!(cache.prune(Duration::from_secs(3600)).unwrap(), 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.prune(Duration::ZERO).unwrap(), 1);
        assert!(cache.get("a").is_none());
    }

    #[tokio::test]
    async fn test_janitor_prunes_at_start_and_on_interval() {
        let dir = tempfile::tempdir().unwrap();
        let cache = VoiceCache::open(dir.path()).unwrap();
        cache.put(&AudioClip::new("旧", vec![1])).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let janitor = cache.spawn_janitor(Duration::from_millis(10), Some(Duration::from_millis(100)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.get("旧").is_none());

        cache.put(&AudioClip::new("新", vec![2])).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(cache.get("新").is_none());
        janitor.abort();
    }

    #[tokio::test]
    async fn test_janitor_without_interval_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = VoiceCache::open(dir.path()).unwrap();
        let janitor = cache.spawn_janitor(Duration::from_secs(3600), None);
        tokio::time::timeout(Duration::from_secs(1), janitor)
            .await
            .unwrap()
            .unwrap();
    }
}
