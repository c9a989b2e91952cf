use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

const MAX_SENTENCES: usize = 100;
const MAX_CHARS: usize = 16_384;
const MAX_NGRAM: usize = 10;
const THRESHOLD: u32 = 10;

/// A detected repetition: the window size, the repeated text, and how many
/// times it has now been seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopDetection {
    pub n: usize,
    pub pattern: String,
    pub count: u32,
}

struct State {
    sentences: VecDeque<String>,
    total_chars: usize,
    counts: HashMap<(usize, String), u32>,
    pending: String,
}

impl State {
    fn new() -> Self {
        Self {
            sentences: VecDeque::new(),
            total_chars: 0,
            counts: HashMap::new(),
            pending: String::new(),
        }
    }
}

/// Rejects assistant output that has degenerated into repetition. Feed text
/// incrementally via `add_text` (streaming) or in one shot (historical
/// auditing) — both report the same detection for the same total text.
pub struct LoopDetector {
    state: Mutex<State>,
}

impl LoopDetector {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::new()),
        }
    }

    /// Feed a chunk of text. Returns the first repetition detected while
    /// processing this chunk, if any. Partial trailing sentences are
    /// buffered until a later call completes them, so chunk boundaries never
    /// change the result versus feeding the concatenation in one call.
    pub fn add_text(&self, chunk: &str) -> Option<LoopDetection> {
        let mut state = self.state.lock().unwrap();
        state.pending.push_str(chunk);

        let sentences = extract_sentences(&mut state.pending);
        for sentence in sentences {
            if let Some(detection) = ingest_sentence(&mut state, sentence) {
                return Some(detection);
            }
        }
        None
    }

    /// Clear all state: buffered sentences, pending partial sentence, and
    /// n-gram counts.
    pub fn reset(&self) {
        *self.state.lock().unwrap() = State::new();
    }
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn ingest_sentence(state: &mut State, sentence: String) -> Option<LoopDetection> {
    if sentence.is_empty() {
        return None;
    }

    state.total_chars += sentence.len();
    state.sentences.push_back(sentence);
    while state.sentences.len() > MAX_SENTENCES || state.total_chars > MAX_CHARS {
        if let Some(evicted) = state.sentences.pop_front() {
            state.total_chars = state.total_chars.saturating_sub(evicted.len());
        } else {
            break;
        }
    }

    let len = state.sentences.len();
    let max_n = MAX_NGRAM.min(len);
    let mut detections: Vec<LoopDetection> = Vec::new();
    for n in 1..=max_n {
        let start = len - n;
        let pattern = state
            .sentences
            .iter()
            .skip(start)
            .take(n)
            .cloned()
            .collect::<Vec<_>>()
            .join(" ");
        let count = state.counts.entry((n, pattern.clone())).or_insert(0);
        *count += 1;
        // A lone repeated sentence (n=1) is too common a false positive —
        // interleaved with any other content it never forms a real loop.
        // Require at least a 2-sentence window before calling it one.
        if n >= 2 && *count > THRESHOLD {
            detections.push(LoopDetection {
                n,
                pattern,
                count: *count,
            });
        }
    }
    // Prefer the longest repeating window when more than one trips in the
    // same ingest.
    detections.into_iter().max_by_key(|d| d.n)
}

/// Split on sentence-terminal punctuation followed by whitespace, leaving an
/// incomplete trailing fragment in `pending`. Each returned sentence has its
/// inner whitespace collapsed to single spaces.
fn extract_sentences(pending: &mut String) -> Vec<String> {
    let mut out = Vec::new();

    loop {
        let chars: Vec<(usize, char)> = pending.char_indices().collect();
        let mut split_at = None;
        for w in 0..chars.len().saturating_sub(1) {
            let (_, c) = chars[w];
            let (j, next) = chars[w + 1];
            if matches!(c, '.' | '!' | '?') && next.is_whitespace() {
                split_at = Some(j);
                break;
            }
        }

        let Some(j) = split_at else { break };
        let sentence = pending[..j].trim().to_string();
        let rest = &pending[j..];
        let rest_trimmed = rest.trim_start();
        let consumed = rest.len() - rest_trimmed.len();
        let remainder = pending[j + consumed..].to_string();

        if !sentence.is_empty() {
            out.push(normalize_whitespace(&sentence));
        }
        *pending = remainder;
    }

    out
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_detection_on_varied_text() {
        let detector = LoopDetector::new();
        assert!(detector.add_text("The sky is blue. The grass is green. ").is_none());
        assert!(detector
            .add_text("A bird flew by. Then it landed on a branch. ")
            .is_none());
    }

    #[test]
    fn detects_repetition_after_eleven_copies() {
        let detector = LoopDetector::new();
        let sentence = "First step is done. Moving to next step. ";
        let mut last = None;
        for _ in 0..11 {
            if let Some(d) = detector.add_text(sentence) {
                last = Some(d);
                break;
            }
        }
        let detection = last.expect("expected a loop to be detected");
        assert!(detection.n >= 2);
        assert_eq!(detection.count, 11);
    }

    #[test]
    fn order_equivalent_streaming_matches_single_shot() {
        let full = "First step is done. Moving to next step. ".repeat(11);

        let streamed = LoopDetector::new();
        let mut streamed_result = None;
        for chunk in full.as_bytes().chunks(7) {
            let s = String::from_utf8_lossy(chunk).into_owned();
            if let Some(d) = streamed.add_text(&s) {
                streamed_result = Some(d);
                break;
            }
        }

        let one_shot = LoopDetector::new();
        let one_shot_result = one_shot.add_text(&full);

        assert_eq!(streamed_result, one_shot_result);
    }

    #[test]
    fn reset_clears_state() {
        let detector = LoopDetector::new();
        let sentence = "Repeat this exact line. ";
        for _ in 0..11 {
            detector.add_text(sentence);
        }
        detector.reset();
        // Immediately after reset, a single occurrence can't trip the threshold.
        assert!(detector.add_text(sentence).is_none());
    }

    #[test]
    fn partial_sentence_across_chunks_is_buffered() {
        let detector = LoopDetector::new();
        assert!(detector.add_text("This is an incomplete sente").is_none());
        assert!(detector.add_text("nce. Done now.").is_none());
    }
}
