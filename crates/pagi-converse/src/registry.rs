//! Slug → constructor registries for pluggable backends.
//!
//! Backends are registered explicitly at startup and looked up by the slug named in
//! configuration. Callers only ever see the capability trait object.

use crate::agent::{EchoAgent, ResponseAgent};
use crate::config::BackendSelection;
use crate::error::{VoiceError, VoiceResult};
use crate::synthesis::{OpenAiTts, PlaceholderTts, TtsBackend};
use crate::transcription::{
    LoopbackBackend, MixedBackend, PlaceholderTranscriber, TranscriptionBackend,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Builds a backend from its (backend-specific) settings.
pub type Factory<T> = Box<dyn Fn(&Value) -> VoiceResult<Arc<T>> + Send + Sync>;

/// Registry of constructors for one capability.
pub struct Registry<T: ?Sized> {
    kind: &'static str,
    factories: BTreeMap<String, Factory<T>>,
}

impl<T: ?Sized> Registry<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            factories: BTreeMap::new(),
        }
    }

    /// Register `factory` under `slug`. A slug can only be registered once.
    pub fn register<F>(&mut self, slug: impl Into<String>, factory: F) -> VoiceResult<()>
    where
        F: Fn(&Value) -> VoiceResult<Arc<T>> + Send + Sync + 'static,
    {
        let slug = slug.into();
        if self.factories.contains_key(&slug) {
            return Err(VoiceError::Config(format!(
                "{} backend '{}' registered twice",
                self.kind, slug
            )));
        }
        debug!("Registered {} backend '{}'", self.kind, slug);
        self.factories.insert(slug, Box::new(factory));
        Ok(())
    }

    /// Construct the backend registered under `slug`.
    pub fn create(&self, slug: &str, settings: &Value) -> VoiceResult<Arc<T>> {
        let factory = self
            .factories
            .get(slug)
            .ok_or_else(|| VoiceError::UnknownBackend {
                kind: self.kind,
                slug: slug.to_string(),
            })?;
        factory(settings)
    }

    pub fn contains(&self, slug: &str) -> bool {
        self.factories.contains_key(slug)
    }

    /// Registered slugs, sorted.
    pub fn slugs(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

/// Transcription slug that pairs two other registered engines.
pub const MIXED_SLUG: &str = "mixed";

/// Settings of the `mixed` transcription backend.
///
/// ```toml
/// [transcription]
/// backend = "mixed"
/// settings = { interim = { backend = "fast" }, final = { backend = "accurate" } }
/// ```
#[derive(Debug, Clone, Deserialize)]
struct MixedSettings {
    interim: BackendSelection,
    #[serde(rename = "final")]
    settled: BackendSelection,
    #[serde(default)]
    queue_capacity: Option<usize>,
}

/// All registries the assistant resolves its collaborators from.
pub struct Registries {
    pub transcription: Registry<dyn TranscriptionBackend>,
    pub tts: Registry<dyn TtsBackend>,
    pub agents: Registry<dyn ResponseAgent>,
}

impl Registries {
    /// Empty registries.
    pub fn new() -> Self {
        Self {
            transcription: Registry::new("transcription"),
            tts: Registry::new("tts"),
            agents: Registry::new("agent"),
        }
    }

    /// Construct a transcription backend. `mixed` is assembled from the two engines its
    /// settings name, each resolved from this registry.
    pub fn create_transcription(
        &self,
        slug: &str,
        settings: &Value,
    ) -> VoiceResult<Arc<dyn TranscriptionBackend>> {
        if slug != MIXED_SLUG {
            return self.transcription.create(slug, settings);
        }
        let mixed = MixedSettings::deserialize(settings)
            .map_err(|e| VoiceError::Config(format!("mixed transcription settings: {}", e)))?;
        if mixed.interim.backend == MIXED_SLUG || mixed.settled.backend == MIXED_SLUG {
            return Err(VoiceError::Config("mixed transcription cannot nest".to_string()));
        }
        let interim = self
            .transcription
            .create(&mixed.interim.backend, &mixed.interim.settings)?;
        let settled = self
            .transcription
            .create(&mixed.settled.backend, &mixed.settled.settings)?;
        debug!(
            "Mixed transcription: interim '{}', final '{}'",
            mixed.interim.backend, mixed.settled.backend
        );
        let mut backend = MixedBackend::new(interim, settled);
        if let Some(capacity) = mixed.queue_capacity {
            backend = backend.with_queue_capacity(capacity);
        }
        Ok(Arc::new(backend))
    }

    /// Registries holding the backends that ship with this crate.
    pub fn with_defaults() -> VoiceResult<Self> {
        let mut registries = Self::new();
        registries
            .transcription
            .register("placeholder", |_| Ok(Arc::new(PlaceholderTranscriber) as Arc<dyn TranscriptionBackend>))?;
        registries.transcription.register("loopback", |settings| {
            let name = settings
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("loopback");
            Ok(Arc::new(LoopbackBackend::new(name)) as Arc<dyn TranscriptionBackend>)
        })?;
        registries
            .tts
            .register("placeholder", |_| Ok(Arc::new(PlaceholderTts) as Arc<dyn TtsBackend>))?;
        registries.tts.register("openai", |settings| {
            let mut tts = OpenAiTts::from_env()?;
            if let Some(voice) = settings.get("voice").and_then(Value::as_str) {
                tts.voice = voice.to_string();
            }
            if let Some(model) = settings.get("model").and_then(Value::as_str) {
                tts.model = model.to_string();
            }
            Ok(Arc::new(tts) as Arc<dyn TtsBackend>)
        })?;
        registries
            .agents
            .register("echo", |_| Ok(Arc::new(EchoAgent) as Arc<dyn ResponseAgent>))?;
        Ok(registries)
    }
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}
