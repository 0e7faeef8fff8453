//! `<think>…</think>` extraction for models that inline their reasoning.
//!
//! Only the first think block is extracted; later tags pass through inline.
//! Tags may be split across deltas, so a possible partial tag is carried to
//! the next call. The JSON-escaped form (`<think>`) needs no
//! special handling here: it arrives decoded once the chunk is parsed.

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThinkState {
    /// No think block seen yet; watching for the opening tag.
    Scanning,
    /// Inside the first think block; text routes to reasoning.
    Extracting,
    /// First block finished; everything passes through verbatim.
    Passthrough,
}

/// Splits streamed content into visible content and extracted reasoning.
#[derive(Debug)]
pub struct ThinkingProcessor {
    state: ThinkState,
    /// Tail of the previous delta that could be a split tag prefix.
    carry: String,
}

impl Default for ThinkingProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl ThinkingProcessor {
    pub fn new() -> Self {
        Self {
            state: ThinkState::Scanning,
            carry: String::new(),
        }
    }

    /// Process one content delta, returning `(content, reasoning)`.
    pub fn process_delta(&mut self, delta: &str) -> (String, String) {
        let mut input = std::mem::take(&mut self.carry);
        input.push_str(delta);

        let mut content = String::new();
        let mut reasoning = String::new();

        loop {
            match self.state {
                ThinkState::Passthrough => {
                    content.push_str(&input);
                    input.clear();
                    break;
                }
                ThinkState::Scanning => {
                    if let Some(pos) = input.find(OPEN_TAG) {
                        content.push_str(&input[..pos]);
                        input.drain(..pos + OPEN_TAG.len());
                        self.state = ThinkState::Extracting;
                    } else {
                        let keep = split_tag_tail(&input, OPEN_TAG);
                        content.push_str(&input[..input.len() - keep]);
                        self.carry = input[input.len() - keep..].to_string();
                        break;
                    }
                }
                ThinkState::Extracting => {
                    if let Some(pos) = input.find(CLOSE_TAG) {
                        reasoning.push_str(&input[..pos]);
                        input.drain(..pos + CLOSE_TAG.len());
                        self.state = ThinkState::Passthrough;
                    } else {
                        let keep = split_tag_tail(&input, CLOSE_TAG);
                        reasoning.push_str(&input[..input.len() - keep]);
                        self.carry = input[input.len() - keep..].to_string();
                        break;
                    }
                }
            }
        }

        (content, reasoning)
    }

    /// Flush the held-back tail at stream end. An unterminated think block
    /// flushes as reasoning.
    pub fn finish(&mut self) -> (String, String) {
        let tail = std::mem::take(&mut self.carry);
        match self.state {
            ThinkState::Extracting => (String::new(), tail),
            _ => (tail, String::new()),
        }
    }
}

/// Length of the longest suffix of `s` that is a proper prefix of `tag`.
fn split_tag_tail(s: &str, tag: &str) -> usize {
    let max = tag.len().saturating_sub(1).min(s.len());
    for keep in (1..=max).rev() {
        if !s.is_char_boundary(s.len() - keep) {
            continue;
        }
        if tag.starts_with(&s[s.len() - keep..]) {
            return keep;
        }
    }
    0
}
