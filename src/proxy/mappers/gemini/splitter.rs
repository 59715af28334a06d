use crate::proxy::config::MarkerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Thinking,
    Answering,
}

/// One contiguous run of candidate text between marker boundaries.
/// `terminal` is true when no more text follows in the same upstream chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub text: String,
    pub mode: StreamMode,
    pub terminal: bool,
}

/// Streaming tokenizer that partitions raw candidate text at unescaped
/// marker occurrences. Markers are consumed, never emitted; empty segments
/// are never yielded. After exhaustion, `mode()` returns the mode in effect
/// for subsequent text, so callers thread it through to the next chunk.
pub struct SegmentSplitter<'a> {
    remaining: &'a str,
    mode: StreamMode,
    markers: &'a MarkerConfig,
    done: bool,
}

impl<'a> SegmentSplitter<'a> {
    pub fn new(text: &'a str, mode: StreamMode, markers: &'a MarkerConfig) -> Self {
        Self {
            remaining: text,
            mode,
            markers,
            done: false,
        }
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }
}

/// Finds the earliest occurrence of `marker` that is not escaped, where a
/// marker is escaped if immediately preceded or followed by a backtick
/// (i.e. it sits inside or at the edge of an inline code span).
fn find_unescaped(haystack: &str, marker: &str) -> Option<usize> {
    if marker.is_empty() {
        return None;
    }
    let mut from = 0;
    while let Some(rel) = haystack[from..].find(marker) {
        let start = from + rel;
        let end = start + marker.len();
        let escaped = haystack[..start].ends_with('`') || haystack[end..].starts_with('`');
        if !escaped {
            return Some(start);
        }
        let step = haystack[start..]
            .chars()
            .next()
            .map(char::len_utf8)
            .unwrap_or(1);
        from = start + step;
    }
    None
}

impl Iterator for SegmentSplitter<'_> {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        while !self.done {
            let thought = find_unescaped(self.remaining, &self.markers.thought);
            let answer = find_unescaped(self.remaining, &self.markers.answer);
            // Earliest start offset wins; markers are distinct literals so
            // equal offsets cannot both match.
            let hit = match (thought, answer) {
                (Some(t), Some(a)) if t <= a => {
                    Some((t, self.markers.thought.len(), StreamMode::Thinking))
                }
                (Some(_), Some(a)) => Some((a, self.markers.answer.len(), StreamMode::Answering)),
                (Some(t), None) => Some((t, self.markers.thought.len(), StreamMode::Thinking)),
                (None, Some(a)) => Some((a, self.markers.answer.len(), StreamMode::Answering)),
                (None, None) => None,
            };

            match hit {
                Some((pos, marker_len, next_mode)) => {
                    let text = &self.remaining[..pos];
                    let segment_mode = self.mode;
                    self.mode = next_mode;
                    self.remaining = &self.remaining[pos + marker_len..];
                    if !text.is_empty() {
                        return Some(Segment {
                            text: text.to_string(),
                            mode: segment_mode,
                            terminal: false,
                        });
                    }
                }
                None => {
                    self.done = true;
                    if !self.remaining.is_empty() {
                        return Some(Segment {
                            text: self.remaining.to_string(),
                            mode: self.mode,
                            terminal: true,
                        });
                    }
                }
            }
        }
        None
    }
}
