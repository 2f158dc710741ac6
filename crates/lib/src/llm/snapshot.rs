//! Cumulative answer accumulator.

/// Placeholder shown on a completed card when the upstream produced no content.
pub const NO_RESULT: &str = "(no result)";

/// The full answer so far. `len` counts characters, not bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub content: String,
    pub len: usize,
}

impl Snapshot {
    pub fn new(content: impl Into<String>) -> Self {
        let content = content.into();
        let len = content.chars().count();
        Self { content, len }
    }

    /// Append an incremental fragment (`text_chunk`).
    pub fn append(&mut self, fragment: &str) {
        self.content.push_str(fragment);
        self.len += fragment.chars().count();
    }

    /// Replace with a full answer-so-far (`message`).
    pub fn replace(&mut self, full: &str) {
        self.content.clear();
        self.content.push_str(full);
        self.len = full.chars().count();
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Nothing but whitespace; a completed card must not show this.
    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn len_counts_chars() {
        let mut s = Snapshot::default();
        s.append("你好");
        s.append("ab");
        assert_eq!(s.len, 4);
        assert_eq!(s.content, "你好ab");
    }

    #[test]
    fn replace_resets_length() {
        let mut s = Snapshot::new("hello world");
        s.replace("hi");
        assert_eq!(s, Snapshot::new("hi"));
    }

    #[test]
    fn whitespace_is_blank() {
        assert!(Snapshot::new(" \n").is_blank());
        assert!(!Snapshot::new(" a ").is_blank());
    }
}
