//! Text helpers for speech: sentence splitting and streamed-markdown cleanup.
//!
//! Synthesis works best on sentence-sized chunks. [`split_sentences`] cuts after
//! punctuation but refuses chunks shorter than a minimum length, and [`StreamText`]
//! applies the same rule incrementally to a token stream while stripping markdown
//! that should never be read aloud (code fences, images, links, emphasis markers).

use regex::Regex;

const SENTENCE_ENDINGS: &[char] = &['。', '！', '？', '!', '?', '\n'];
const PUNC_CN: &[char] = &['。', '？', '！', '；', '：', '、', '?', ';', '\n'];
const PUNC_EN: &[char] = &['.', '?', '!', ';', ':', '\n'];
const COMMAS: &[char] = &['，', ','];

/// Minimum chunk length used for streamed replies.
pub const STREAM_MIN_CHUNK: usize = 4;

/// Whether `text` contains a CJK unified ideograph.
pub fn contains_chinese(text: &str) -> bool {
    text.chars().any(|c| ('\u{4e00}'..='\u{9fff}').contains(&c))
}

fn is_break(c: char, chinese: bool, comma_split: bool) -> bool {
    let base = if chinese { PUNC_CN } else { PUNC_EN };
    base.contains(&c) || (comma_split && COMMAS.contains(&c))
}

/// Whether the last character is sentence or clause punctuation for the text's language.
pub fn ends_with_punctuation(text: &str) -> bool {
    match text.chars().last() {
        Some(c) => is_break(c, contains_chinese(text), true),
        None => false,
    }
}

/// `text` without leading punctuation and whitespace.
pub fn strip_leading_punctuation(text: &str) -> &str {
    text.trim_start_matches(|c: char| {
        c.is_whitespace() || PUNC_CN.contains(&c) || PUNC_EN.contains(&c) || COMMAS.contains(&c)
    })
}

/// Split `text` after punctuation into chunks of at least `min_len`.
///
/// Length is counted in characters for Chinese text and in UTF-8 bytes otherwise.
/// A segment that is too short keeps accumulating into the next one; whatever follows
/// the last accepted break is returned as the final item.
pub fn split_sentences(text: &str, min_len: usize, comma_split: bool) -> Vec<String> {
    let chinese = contains_chinese(text);
    let measure = |s: &str| if chinese { s.chars().count() } else { s.len() };

    let mut chunks = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if !is_break(c, chinese, comma_split) {
            continue;
        }
        let segment = &text[start..i];
        if measure(segment) < min_len {
            continue;
        }
        let end = i + c.len_utf8();
        if !segment.is_empty() {
            chunks.push(text[start..end].to_string());
        }
        start = end;
    }
    if start < text.len() {
        chunks.push(text[start..].to_string());
    }
    chunks
}

/// Split a complete reply on sentence-ending marks, dropping the marks and empty lines.
pub fn split_whole(text: &str) -> Vec<String> {
    let trimmed = text
        .trim()
        .trim_end_matches(|c: char| is_break(c, true, true) || is_break(c, false, true));
    trimmed
        .split(SENTENCE_ENDINGS)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Incremental cleaner/splitter for a streamed reply.
///
/// Complete markdown constructs are removed; text from the first unclosed opener
/// onward is held back until more tokens arrive (or [`StreamText::finish`]).
pub struct StreamText {
    full: Vec<Regex>,
    openers: &'static [&'static str],
    special: &'static [&'static str],
    cache: String,
    min_len: usize,
}

impl Default for StreamText {
    fn default() -> Self {
        Self::new(STREAM_MIN_CHUNK)
    }
}

impl StreamText {
    /// Rules for text that will be synthesized.
    pub fn new(min_len: usize) -> Self {
        let full = [
            r"(?s)```.+?```",
            r"!\[[^\]]*\]",
            r"\[[^\]]*\]",
            r"\([^)]*\)",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect();

        Self {
            full,
            openers: &["```", "![", "[", "("],
            special: &["***", "**", "~~"],
            cache: String::new(),
            min_len,
        }
    }

    /// Feed one token; returns the sentences that are now complete.
    pub fn push(&mut self, token: &str) -> Vec<String> {
        let text = std::mem::take(&mut self.cache) + token;
        let (ready, held) = self.clean(&text);
        self.cache = held;

        if ready.trim().is_empty() {
            return Vec::new();
        }
        let mut lines = split_sentences(&ready, self.min_len, true);
        if lines.last().is_some_and(|last| !ends_with_punctuation(last)) {
            if let Some(last) = lines.pop() {
                self.cache = last + &self.cache;
            }
        }
        lines
    }

    /// Flush what is left at the end of the stream. An unclosed code fence is dropped.
    pub fn finish(&mut self) -> Option<String> {
        let text = std::mem::take(&mut self.cache);
        let (mut ready, held) = self.clean(&text);
        if !held.starts_with("```") {
            ready.push_str(&held);
        }
        let ready = ready.trim();
        (!ready.is_empty()).then(|| ready.to_string())
    }

    /// Text currently held back.
    pub fn pending(&self) -> &str {
        &self.cache
    }

    fn clean(&self, text: &str) -> (String, String) {
        let mut stripped = text.to_string();
        for re in &self.full {
            stripped = re.replace_all(&stripped, "").into_owned();
        }
        for marker in self.special {
            stripped = stripped.replace(marker, "");
        }

        match self.openers.iter().filter_map(|o| stripped.find(o)).min() {
            Some(idx) => {
                let held = stripped.split_off(idx);
                (stripped, held)
            }
            None => (stripped, String::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_leading_punctuation() {
        assert_eq!(strip_leading_punctuation("，。 今天"), "今天");
        assert_eq!(strip_leading_punctuation("今天。"), "今天。");
    }

    #[test]
    fn test_short_chinese_segments_accumulate() {
        let chunks = split_sentences("你好。今天天气不错。再见。", 4, true);
        assert_eq!(chunks, vec!["你好。今天天气不错。", "再见。"]);
    }

    #[test]
    fn test_english_measures_bytes_and_keeps_remainder() {
        let chunks = split_sentences("Hi. How are you today? Fine", 8, true);
        assert_eq!(chunks, vec!["Hi. How are you today?", " Fine"]);
    }

    #[test]
    fn test_comma_split_flag() {
        let text = "one two three, four five six.";
        assert_eq!(split_sentences(text, 4, true).len(), 2);
        assert_eq!(split_sentences(text, 4, false), vec![text.to_string()]);
    }

    #[test]
    fn test_split_whole_drops_marks() {
        assert_eq!(
            split_whole("你好！今天天气不错。\n再见。"),
            vec!["你好", "今天天气不错", "再见"]
        );
        assert!(split_whole("。").is_empty());
    }

    #[test]
    fn test_stream_holds_unfinished_sentence() {
        let mut stream = StreamText::default();
        assert!(stream.push("今天天气").is_empty());
        assert_eq!(stream.pending(), "今天天气");
        assert_eq!(stream.push("不错。明天"), vec!["今天天气不错。"]);
        assert_eq!(stream.finish().as_deref(), Some("明天"));
        assert!(stream.finish().is_none());
    }

    #[test]
    fn test_stream_strips_links_across_tokens() {
        let mut stream = StreamText::default();
        assert!(stream.push("Hello [link](http://x").is_empty());
        assert_eq!(stream.push(") world."), vec!["Hello  world."]);
    }

    #[test]
    fn test_stream_drops_code_and_emphasis() {
        let mut stream = StreamText::default();
        assert!(stream.push("看**代码**```rust\nfn main").is_empty());
        assert_eq!(stream.push("() {}\n```完成了。"), vec!["看代码完成了。"]);
    }

    #[test]
    fn test_finish_drops_unclosed_fence() {
        let mut stream = StreamText::default();
        stream.push("好的```python\nprint(");
        assert_eq!(stream.finish().as_deref(), Some("好的"));
    }
}
