use crate::record::CommandRecord;
use std::ops::Range;

/// Case-sensitive substring predicate over command text and captured output.
///
/// An empty needle matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    needle: String,
}

impl Filter {
    pub fn new(needle: impl Into<String>) -> Self {
        Self {
            needle: needle.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.needle.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.needle
    }

    pub fn push(&mut self, c: char) {
        self.needle.push(c);
    }

    pub fn pop(&mut self) -> Option<char> {
        self.needle.pop()
    }

    pub fn clear(&mut self) {
        self.needle.clear();
    }

    pub fn matches(&self, record: &CommandRecord) -> bool {
        if self.needle.is_empty() {
            return true;
        }
        record.command.contains(&self.needle)
            || contains_bytes(&record.output, self.needle.as_bytes())
    }

    /// Byte ranges of non-overlapping occurrences in `text`, for highlighting.
    pub fn match_ranges(&self, text: &str) -> Vec<Range<usize>> {
        if self.needle.is_empty() {
            return Vec::new();
        }
        text.match_indices(self.needle.as_str())
            .map(|(start, m)| start..start + m.len())
            .collect()
    }

    /// Split `text` into `(segment, matched)` pieces covering it entirely.
    pub fn segments<'a>(&self, text: &'a str) -> Vec<(&'a str, bool)> {
        let mut pieces = Vec::new();
        let mut last = 0;
        for range in self.match_ranges(text) {
            if range.start > last {
                pieces.push((&text[last..range.start], false));
            }
            pieces.push((&text[range.clone()], true));
            last = range.end;
        }
        if last < text.len() || pieces.is_empty() {
            pieces.push((&text[last..], false));
        }
        pieces
    }
}

pub fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|window| window == needle)
}
