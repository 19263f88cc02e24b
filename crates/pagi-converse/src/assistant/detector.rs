//! Wake-phrase detection on the live transcript.

use super::{Actions, AssistantEvent, EventPayload};
use crate::text::strip_leading_punctuation;
use crate::transcription::TranscriptEvent;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::info;

/// Interim results kept for matching across result boundaries.
const WINDOW: usize = 2;

/// Text following the first keyword found in `text`, leading punctuation removed.
pub(crate) fn after_keyword(text: &str, keywords: &[String]) -> Option<String> {
    keywords.iter().find_map(|kw| {
        text.find(kw.as_str())
            .map(|idx| strip_leading_punctuation(&text[idx + kw.len()..]).to_string())
    })
}

/// Watches transcripts for a wake phrase and fires `Detected`.
pub struct Detector {
    keywords: Vec<String>,
    window: Mutex<VecDeque<String>>,
    actions: Actions,
}

impl Detector {
    pub fn new(keywords: Vec<String>, actions: Actions) -> Self {
        Self {
            keywords: keywords.into_iter().filter(|k| !k.is_empty()).collect(),
            window: Mutex::new(VecDeque::with_capacity(WINDOW)),
            actions,
        }
    }

    /// Forget buffered interim results.
    pub fn reset(&self) {
        self.window.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Check one transcript event. Returns whether a wake phrase was found.
    pub fn on_transcript(&self, event: &TranscriptEvent) -> bool {
        let text = event.text.trim();
        if text.is_empty() {
            return false;
        }

        let hit = if event.is_final {
            after_keyword(text, &self.keywords)
        } else {
            let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
            if window.len() == WINDOW {
                window.pop_front();
            }
            window.push_back(text.to_string());
            let joined: String = window.iter().map(String::as_str).collect();
            after_keyword(&joined, &self.keywords)
        };

        let Some(rest) = hit else {
            return false;
        };
        self.reset();
        info!("👂 Wake phrase detected (final: {})", event.is_final);
        self.actions
            .fire(AssistantEvent::Detected, EventPayload::detected(rest, event.is_final));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::actions_channel;

    fn keywords() -> Vec<String> {
        vec!["你好".to_string(), "小惠".to_string()]
    }

    #[test]
    fn test_after_keyword() {
        assert_eq!(after_keyword("嗯你好，今天几号", &keywords()).as_deref(), Some("今天几号"));
        assert_eq!(after_keyword("小惠", &keywords()).as_deref(), Some(""));
        assert_eq!(after_keyword("今天几号", &keywords()), None);
    }

    #[test]
    fn test_keyword_split_across_interim_results() {
        let (actions, mut rx) = actions_channel();
        let detector = Detector::new(keywords(), actions);

        assert!(!detector.on_transcript(&TranscriptEvent::partial("小")));
        assert!(detector.on_transcript(&TranscriptEvent::partial("惠你在吗")));

        let action = rx.try_recv().unwrap();
        assert_eq!(action.event, AssistantEvent::Detected);
        assert_eq!(action.payload.text.as_deref(), Some("你在吗"));
        assert!(!action.payload.end);
    }

    #[test]
    fn test_window_holds_two_results() {
        let (actions, mut rx) = actions_channel();
        let detector = Detector::new(keywords(), actions);

        detector.on_transcript(&TranscriptEvent::partial("小"));
        detector.on_transcript(&TranscriptEvent::partial("嗯"));
        assert!(!detector.on_transcript(&TranscriptEvent::partial("惠")));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_final_result_matches_directly() {
        let (actions, mut rx) = actions_channel();
        let detector = Detector::new(keywords(), actions);

        assert!(detector.on_transcript(&TranscriptEvent::settled("你好。放首歌")));
        let action = rx.try_recv().unwrap();
        assert_eq!(action.payload.text.as_deref(), Some("放首歌"));
        assert!(action.payload.end);
    }
}
