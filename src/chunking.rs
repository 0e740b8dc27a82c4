//! Splitting paper text into the chunks that get embedded and compared.
//!
//! Every chunk keeps the byte span it came from so findings can point back
//! into the submitted text.

use serde::{Deserialize, Serialize};

/// Phrases that mark a sentence as a contribution claim.
const CLAIM_KEYWORDS: &[&str] = &[
    "we propose",
    "we present",
    "this paper",
    "our contribution",
    "we show",
    "we demonstrate",
    "we introduce",
    "in this work",
    "we report",
    "we observe",
    "we develop",
    "we design",
];

/// Number of longest sentences used as claims when no keyword matches.
const FALLBACK_CLAIMS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub window_words: usize,
    pub overlap_words: usize,
    pub min_sentence_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            window_words: 300,
            overlap_words: 50,
            min_sentence_chars: 30,
        }
    }
}

/// Half-open byte range into a source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn union(&self, other: &Span) -> Span {
        Span::new(self.start.min(other.start), self.end.max(other.end))
    }

    pub fn offset(&self, by: usize) -> Span {
        Span::new(self.start + by, self.end + by)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    pub ordinal: usize,
    pub text: String,
    pub span: Span,
}

/// Byte spans of whitespace-separated words.
pub fn word_spans(text: &str) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in text.char_indices() {
        match (c.is_whitespace(), start) {
            (true, Some(s)) => {
                spans.push(Span::new(s, i));
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(s) = start {
        spans.push(Span::new(s, text.len()));
    }
    spans
}

/// Overlapping windows of `window_words` words, advancing by
/// `window_words - overlap_words`. The last window always ends at the final word.
pub fn split_windows(text: &str, config: &ChunkingConfig) -> Vec<TextChunk> {
    let words = word_spans(text);
    if words.is_empty() {
        return Vec::new();
    }
    let window = config.window_words.max(1);
    let step = if config.overlap_words < window {
        window - config.overlap_words
    } else {
        window
    };

    let mut chunks = Vec::new();
    let mut first = 0;
    loop {
        let last = (first + window).min(words.len()) - 1;
        let span = Span::new(words[first].start, words[last].end);
        chunks.push(TextChunk {
            ordinal: chunks.len(),
            text: text[span.start..span.end].to_string(),
            span,
        });
        if last + 1 >= words.len() {
            break;
        }
        first += step;
    }
    chunks
}

/// Sentences ending in `.`, `?` or `!` followed by whitespace (or end of text),
/// keeping only those at least `min_chars` long after trimming.
pub fn split_sentences(text: &str, min_chars: usize) -> Vec<TextChunk> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let at_boundary = matches!(c, '.' | '?' | '!')
            && chars.peek().map_or(true, |(_, next)| next.is_whitespace());
        if at_boundary {
            let end = i + c.len_utf8();
            push_trimmed(text, Span::new(start, end), min_chars, &mut sentences);
            start = end;
        }
    }
    push_trimmed(text, Span::new(start, text.len()), min_chars, &mut sentences);
    sentences
}

fn push_trimmed(text: &str, raw: Span, min_chars: usize, out: &mut Vec<TextChunk>) {
    let slice = &text[raw.start..raw.end];
    let leading = slice.len() - slice.trim_start().len();
    let trimmed = slice.trim();
    if trimmed.chars().count() < min_chars {
        return;
    }
    let span = Span::new(raw.start + leading, raw.start + leading + trimmed.len());
    out.push(TextChunk {
        ordinal: out.len(),
        text: trimmed.to_string(),
        span,
    });
}

/// Contribution claims: sentences containing a claim phrase, or the longest
/// sentences (kept in document order) when none does.
pub fn extract_claims(text: &str, config: &ChunkingConfig) -> Vec<TextChunk> {
    let sentences = split_sentences(text, config.min_sentence_chars);

    let mut claims: Vec<TextChunk> = sentences
        .iter()
        .filter(|s| {
            let lower = s.text.to_lowercase();
            CLAIM_KEYWORDS.iter().any(|kw| lower.contains(kw))
        })
        .cloned()
        .collect();

    if claims.is_empty() {
        let mut by_length: Vec<&TextChunk> = sentences.iter().collect();
        by_length.sort_by(|a, b| b.text.len().cmp(&a.text.len()).then(a.span.cmp(&b.span)));
        claims = by_length.into_iter().take(FALLBACK_CLAIMS).cloned().collect();
        claims.sort_by_key(|c| c.span);
    }

    for (ordinal, claim) in claims.iter_mut().enumerate() {
        claim.ordinal = ordinal;
    }
    claims
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_windows_overlap_and_cover_tail() {
        let text = words(12);
        let config = ChunkingConfig {
            window_words: 5,
            overlap_words: 2,
            min_sentence_chars: 1,
        };
        let chunks = split_windows(&text, &config);
        let firsts: Vec<&str> = chunks
            .iter()
            .map(|c| c.text.split_whitespace().next().unwrap())
            .collect();
        assert_eq!(firsts, vec!["w0", "w3", "w6", "w9"]);
        assert!(chunks.last().unwrap().text.ends_with("w11"));
        for chunk in &chunks {
            assert_eq!(&text[chunk.span.start..chunk.span.end], chunk.text);
        }
    }

    #[test]
    fn test_single_window_for_short_text() {
        let chunks = split_windows("  a short abstract  ", &ChunkingConfig::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "a short abstract");
        assert_eq!(chunks[0].span, Span::new(2, 18));
    }

    #[test]
    fn test_empty_text_has_no_chunks() {
        assert!(split_windows("   ", &ChunkingConfig::default()).is_empty());
        assert!(split_sentences("", 1).is_empty());
    }

    #[test]
    fn test_sentence_spans() {
        let text = "First sentence is long enough. Short. Version 2.5 of the tool works well!";
        let sentences = split_sentences(text, 10);
        assert_eq!(sentences.len(), 2);
        assert_eq!(sentences[0].text, "First sentence is long enough.");
        assert_eq!(sentences[1].text, "Version 2.5 of the tool works well!");
        assert_eq!(&text[sentences[1].span.start..sentences[1].span.end], sentences[1].text);
    }

    #[test]
    fn test_claims_by_keyword() {
        let text = "Transformers dominate language modelling today. \
                    In this work we propose a sparse attention kernel for long inputs. \
                    Results are reported on three public benchmarks.";
        let claims = extract_claims(text, &ChunkingConfig::default());
        assert_eq!(claims.len(), 1);
        assert!(claims[0].text.starts_with("In this work"));
        assert_eq!(claims[0].ordinal, 0);
    }

    #[test]
    fn test_claims_fallback_to_longest_sentences() {
        let text = "Plain descriptive sentence number one here. \
                    A considerably longer descriptive sentence that has no claim phrase at all. \
                    Another plain sentence of medium size.";
        let config = ChunkingConfig::default();
        let claims = extract_claims(text, &config);
        assert_eq!(claims.len(), 3);
        assert!(claims.windows(2).all(|w| w[0].span < w[1].span));
    }

    #[test]
    fn test_span_helpers() {
        let a = Span::new(0, 10);
        let b = Span::new(5, 20);
        let c = Span::new(10, 12);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert_eq!(a.union(&b), Span::new(0, 20));
        assert_eq!(c.offset(3), Span::new(13, 15));
    }
}
