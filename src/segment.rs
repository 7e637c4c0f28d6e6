//! Source text segmenter.
//!
//! Splits source content into [`Segment`]s under a
//! [`SegmentationStrategy`], then normalizes span lengths so every segment
//! falls between `min_segment_length` and `max_segment_length` characters.
//!
//! # Algorithm
//!
//! 1. Split the text into raw spans (paragraphs, sentences, or word windows),
//!    keeping character offsets into the source.
//! 2. Accumulate consecutive spans shorter than `min_segment_length` into a
//!    buffer joined by single spaces. The buffer is flushed when a
//!    long-enough span arrives or at end-of-text, but only if it reached
//!    `min_segment_length` itself; shorter leftovers are dropped.
//! 3. Re-chunk anything longer than `max_segment_length` greedily at word
//!    boundaries. Words longer than the limit are hard-split.
//!
//! All lengths and offsets count characters, not bytes.
//!
//! # Example
//!
//! ```rust
//! use qda_autocode::models::{AutoCodingConfig, Source};
//! use qda_autocode::segment::segment_sources;
//!
//! let config = AutoCodingConfig { min_segment_length: 10, ..Default::default() };
//! let sources = vec![Source::new("s1", "Interview 1", "First answer.\n\nSecond answer.")];
//! let segments = segment_sources(&sources, &config);
//! assert_eq!(segments.len(), 2);
//! assert_eq!(segments[1].start_char, 15);
//! ```

use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;
use unicode_segmentation::UnicodeSegmentation;

use crate::models::{AutoCodingConfig, SegmentationStrategy, SentenceSplitter, Segment, Source};

/// A raw span of source text with character offsets.
#[derive(Debug, Clone, PartialEq)]
struct Span {
    text: String,
    start: usize,
    end: usize,
}

impl Span {
    fn new(text: &str, start: usize, end: usize) -> Self {
        Self {
            text: text.to_string(),
            start,
            end,
        }
    }
}

/// Maps byte offsets of a string to character offsets.
struct CharOffsets {
    byte_starts: Vec<usize>,
}

impl CharOffsets {
    fn new(text: &str) -> Self {
        Self {
            byte_starts: text.char_indices().map(|(i, _)| i).collect(),
        }
    }

    fn char_at(&self, byte: usize) -> usize {
        match self.byte_starts.binary_search(&byte) {
            Ok(i) | Err(i) => i,
        }
    }
}

fn paragraph_break() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n\s*\n").expect("paragraph pattern is valid"))
}

fn sentence_break() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.!?]+\s+").expect("sentence pattern is valid"))
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Segment every selected source.
///
/// Sources whose id is not listed in a non-empty `config.source_ids` are
/// skipped, as are sources with empty content.
pub fn segment_sources(sources: &[Source], config: &AutoCodingConfig) -> Vec<Segment> {
    let mut segments = Vec::new();

    for source in sources {
        if !config.source_ids.is_empty() && !config.source_ids.contains(&source.id) {
            continue;
        }
        if source.content.trim().is_empty() {
            continue;
        }
        let source_segments = segment_text(&source.content, &source.id, &source.name, config);
        debug!(
            source_id = %source.id,
            segments = source_segments.len(),
            "segmented source"
        );
        segments.extend(source_segments);
    }

    segments
}

/// Split one source's text into normalized segments.
pub fn segment_text(
    text: &str,
    source_id: &str,
    source_name: &str,
    config: &AutoCodingConfig,
) -> Vec<Segment> {
    if text.is_empty() {
        return Vec::new();
    }

    let raw = match config.segmentation_strategy {
        SegmentationStrategy::Paragraph | SegmentationStrategy::Semantic => {
            split_paragraphs(text)
        }
        SegmentationStrategy::Sentence => match config.sentence_splitter {
            SentenceSplitter::Unicode => split_sentences_unicode(text),
            SentenceSplitter::Regex => split_sentences_regex(text),
        },
        SegmentationStrategy::Window => {
            split_window(text, config.window_size, config.window_overlap)
        }
    };

    let normalized = normalize_spans(
        raw,
        config.min_segment_length,
        config.max_segment_length,
    );

    normalized
        .into_iter()
        .filter_map(|span| {
            let trimmed = span.text.trim();
            if trimmed.is_empty() {
                return None;
            }
            Some((trimmed.to_string(), span.start, span.end))
        })
        .enumerate()
        .map(|(index, (text, start, end))| {
            let mut segment = Segment::new(text, source_id, start, end);
            segment.source_name = source_name.to_string();
            segment.index = index;
            segment
        })
        .collect()
}

fn split_paragraphs(text: &str) -> Vec<Span> {
    let offsets = CharOffsets::new(text);
    let mut spans = Vec::new();
    let mut last_end = 0;

    for m in paragraph_break().find_iter(text) {
        if last_end < m.start() {
            spans.push(Span::new(
                &text[last_end..m.start()],
                offsets.char_at(last_end),
                offsets.char_at(m.start()),
            ));
        }
        last_end = m.end();
    }

    if last_end < text.len() {
        spans.push(Span::new(
            &text[last_end..],
            offsets.char_at(last_end),
            offsets.char_at(text.len()),
        ));
    }

    spans
}

fn split_sentences_unicode(text: &str) -> Vec<Span> {
    let offsets = CharOffsets::new(text);
    text.split_sentence_bound_indices()
        .filter(|(_, sentence)| !sentence.trim().is_empty())
        .map(|(start, sentence)| {
            Span::new(
                sentence,
                offsets.char_at(start),
                offsets.char_at(start + sentence.len()),
            )
        })
        .collect()
}

fn split_sentences_regex(text: &str) -> Vec<Span> {
    let offsets = CharOffsets::new(text);
    let mut spans = Vec::new();
    let mut last_end = 0;

    for m in sentence_break().find_iter(text) {
        if last_end < m.end() {
            spans.push(Span::new(
                &text[last_end..m.end()],
                offsets.char_at(last_end),
                offsets.char_at(m.end()),
            ));
        }
        last_end = m.end();
    }

    if last_end < text.len() {
        spans.push(Span::new(
            &text[last_end..],
            offsets.char_at(last_end),
            offsets.char_at(text.len()),
        ));
    }

    spans
}

/// Sliding window over whitespace-separated words.
///
/// Offsets are approximated as if the words were joined by single spaces.
fn split_window(text: &str, window_size: usize, overlap: usize) -> Vec<Span> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() || window_size == 0 {
        return Vec::new();
    }
    let step = window_size.saturating_sub(overlap).max(1);

    // joined[i] = char length of words[..i].join(" ")
    let mut joined = Vec::with_capacity(words.len() + 1);
    joined.push(0usize);
    for (i, word) in words.iter().enumerate() {
        let sep = if i > 0 { 1 } else { 0 };
        joined.push(joined[i] + sep + char_len(word));
    }

    let mut spans = Vec::new();
    let mut i = 0;
    while i < words.len() {
        let end_idx = (i + window_size).min(words.len());
        let window_text = words[i..end_idx].join(" ");
        let start_char = joined[i] + if i > 0 { 1 } else { 0 };
        let end_char = start_char + char_len(&window_text);
        spans.push(Span {
            text: window_text,
            start: start_char,
            end: end_char,
        });

        i += step;
    }

    spans
}

fn normalize_spans(spans: Vec<Span>, min_length: usize, max_length: usize) -> Vec<Span> {
    let mut normalized = Vec::new();
    let mut buffer = String::new();
    let mut buffer_len = 0usize;
    let mut buffer_start = 0usize;

    for span in spans {
        let text = span.text.trim();
        if text.is_empty() {
            continue;
        }
        let len = char_len(text);

        if len < min_length {
            if buffer.is_empty() {
                buffer_start = span.start;
            } else {
                buffer.push(' ');
                buffer_len += 1;
            }
            buffer.push_str(text);
            buffer_len += len;
            continue;
        }

        if !buffer.is_empty() {
            if buffer_len >= min_length {
                push_bounded(&mut normalized, &buffer, buffer_start, span.start, max_length);
            }
            buffer.clear();
            buffer_len = 0;
        }

        push_bounded(&mut normalized, text, span.start, span.end, max_length);
    }

    // The end offset of a trailing buffer is derived from its joined length,
    // not from the source positions of its fragments.
    if !buffer.is_empty() && buffer_len >= min_length {
        push_bounded(
            &mut normalized,
            &buffer,
            buffer_start,
            buffer_start + buffer_len,
            max_length,
        );
    }

    normalized
}

fn push_bounded(out: &mut Vec<Span>, text: &str, start: usize, end: usize, max_length: usize) {
    if char_len(text) <= max_length {
        out.push(Span::new(text, start, end.max(start)));
        return;
    }

    let mut pos = start;
    for chunk in split_long_text(text, max_length) {
        let chunk_end = pos + char_len(&chunk);
        out.push(Span {
            text: chunk,
            start: pos,
            end: chunk_end,
        });
        pos = chunk_end;
    }
}

/// Greedily pack words into chunks of at most `max_length` characters.
fn split_long_text(text: &str, max_length: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_len = 0usize;

    for word in text.split_whitespace() {
        let word_len = char_len(word);

        if word_len > max_length {
            if !current.is_empty() {
                chunks.push(current.join(" "));
                current.clear();
                current_len = 0;
            }
            let chars: Vec<char> = word.chars().collect();
            for piece in chars.chunks(max_length.max(1)) {
                chunks.push(piece.iter().collect());
            }
            continue;
        }

        let needed = if current.is_empty() {
            word_len
        } else {
            current_len + 1 + word_len
        };

        if needed > max_length && !current.is_empty() {
            chunks.push(current.join(" "));
            current.clear();
            current.push(word);
            current_len = word_len;
        } else {
            current.push(word);
            current_len = needed;
        }
    }

    if !current.is_empty() {
        chunks.push(current.join(" "));
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(min: usize, max: usize) -> AutoCodingConfig {
        AutoCodingConfig {
            min_segment_length: min,
            max_segment_length: max,
            ..Default::default()
        }
    }

    fn slice_chars(text: &str, start: usize, end: usize) -> String {
        text.chars().skip(start).take(end - start).collect()
    }

    #[test]
    fn test_paragraphs_keep_offsets() {
        let text = "The first paragraph talks about work and stress.\n\n  \nThe second one is about family life at home.";
        let segments = segment_text(text, "s1", "Interview", &config(10, 500));
        assert_eq!(segments.len(), 2);
        for seg in &segments {
            assert_eq!(slice_chars(text, seg.start_char, seg.end_char).trim(), seg.text);
            assert_eq!(seg.source_name, "Interview");
        }
        assert_eq!(segments[0].index, 0);
        assert_eq!(segments[1].index, 1);
    }

    #[test]
    fn test_offsets_count_characters() {
        let text = "Élève très motivé, déjà prêt à réussir.\n\nÇa dépend de l'école et des enseignants.";
        let segments = segment_text(text, "s1", "", &config(10, 500));
        assert_eq!(segments.len(), 2);
        assert_eq!(slice_chars(text, segments[1].start_char, segments[1].end_char), segments[1].text);
    }

    #[test]
    fn test_short_paragraphs_merge_into_one() {
        let text = [
            "Short note one.",
            "Short note two.",
            "Short note three.",
            "Short note four.",
            "Short note five.",
        ]
        .join("\n\n");
        let segments = segment_text(&text, "s1", "", &config(50, 500));
        assert_eq!(segments.len(), 1);
        assert!(segments[0].text.starts_with("Short note one."));
        assert!(segments[0].text.ends_with("Short note five."));
        assert_eq!(segments[0].start_char, 0);
        assert_eq!(segments[0].end_char, segments[0].len());
    }

    #[test]
    fn test_short_leftover_is_dropped() {
        let text = "Tiny.\n\nThis paragraph is comfortably longer than the minimum length.";
        let segments = segment_text(text, "s1", "", &config(20, 500));
        assert_eq!(segments.len(), 1);
        assert!(segments[0].text.starts_with("This paragraph"));
    }

    #[test]
    fn test_long_segment_is_rechunked() {
        let words: Vec<String> = (0..60).map(|i| format!("word{:02}", i % 100)).collect();
        let mut text = words.join(" ");
        text.truncate(300);
        assert_eq!(text.chars().count(), 300);

        let segments = segment_text(&text, "s1", "", &config(10, 100));
        assert!(segments.len() >= 3, "got {} chunks", segments.len());
        for seg in &segments {
            assert!(seg.len() <= 100, "chunk of {} chars", seg.len());
            assert!(seg.start_char <= seg.end_char);
        }
    }

    #[test]
    fn test_oversized_word_is_hard_split() {
        let text = "x".repeat(250);
        let segments = segment_text(&text, "s1", "", &config(10, 100));
        assert_eq!(segments.len(), 3);
        assert!(segments.iter().all(|s| s.len() <= 100));
    }

    #[test]
    fn test_sentence_strategies() {
        let text = "One sentence is here. Another sentence follows! And a third one?";
        for splitter in [SentenceSplitter::Unicode, SentenceSplitter::Regex] {
            let cfg = AutoCodingConfig {
                segmentation_strategy: SegmentationStrategy::Sentence,
                sentence_splitter: splitter,
                ..config(5, 500)
            };
            let segments = segment_text(text, "s1", "", &cfg);
            assert_eq!(segments.len(), 3, "{:?}", splitter);
            assert_eq!(segments[0].text, "One sentence is here.");
            assert_eq!(segments[2].text, "And a third one?");
        }
    }

    #[test]
    fn test_window_offsets() {
        let text = "w0 w1 w2 w3 w4 w5 w6 w7 w8 w9";
        let cfg = AutoCodingConfig {
            segmentation_strategy: SegmentationStrategy::Window,
            window_size: 4,
            window_overlap: 1,
            ..config(1, 500)
        };
        let segments = segment_text(text, "s1", "", &cfg);
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[0].text, "w0 w1 w2 w3");
        assert_eq!((segments[0].start_char, segments[0].end_char), (0, 11));
        assert_eq!(segments[1].text, "w3 w4 w5 w6");
        assert_eq!(segments[1].start_char, 9);
        assert_eq!(segments[3].text, "w9");
    }

    #[test]
    fn test_empty_content_yields_nothing() {
        let sources = vec![
            Source::new("empty", "Empty", ""),
            Source::new("blank", "Blank", "   \n\n  "),
        ];
        assert!(segment_sources(&sources, &config(1, 500)).is_empty());
    }

    #[test]
    fn test_source_filter() {
        let sources = vec![
            Source::new("a", "A", "A paragraph that is long enough to be kept."),
            Source::new("b", "B", "B paragraph that is long enough to be kept."),
        ];
        let cfg = AutoCodingConfig {
            source_ids: vec!["b".to_string()],
            ..config(10, 500)
        };
        let segments = segment_sources(&sources, &cfg);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].source_id, "b");
    }

    #[test]
    fn test_segment_ids_unique() {
        let text = (0..20)
            .map(|i| format!("Paragraph number {} with enough text to stand alone.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let segments = segment_text(&text, "s1", "", &config(10, 500));
        let mut ids: Vec<&str> = segments.iter().map(|s| s.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), segments.len());
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha paragraph with text.\n\nBeta paragraph with text.\n\nGamma";
        let a = segment_text(text, "s1", "", &config(5, 12));
        let b = segment_text(text, "s1", "", &config(5, 12));
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.text, y.text);
            assert_eq!((x.start_char, x.end_char), (y.start_char, y.end_char));
        }
    }
}
