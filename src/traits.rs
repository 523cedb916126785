// Splits the conversation model's streamed answer into the reply shown to the
// user and the trait line recorded in the profile. The model writes
// `reply --- trait`; nothing after the first separator is ever shown.

const SEPARATOR: &str = "---";

#[derive(Debug, Default)]
pub struct TraitSplitter {
    reply: String,
    trait_text: String,
    // Tail of the stream that might be the start of a separator
    pending: String,
    found_separator: bool,
}

impl TraitSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one streamed chunk, returning the part that can be shown now.
    pub fn push(&mut self, chunk: &str) -> String {
        if self.found_separator {
            self.trait_text.push_str(chunk);
            return String::new();
        }

        self.pending.push_str(chunk);
        if let Some(idx) = self.pending.find(SEPARATOR) {
            let visible = self.pending[..idx].to_string();
            self.trait_text.push_str(&self.pending[idx + SEPARATOR.len()..]);
            self.pending.clear();
            self.found_separator = true;
            self.reply.push_str(&visible);
            return visible;
        }

        // Hold back a trailing run of dashes, it may continue in the next chunk
        let keep = self.pending.len() - self.pending.trim_end_matches('-').len();
        let keep = keep.min(SEPARATOR.len() - 1);
        let split_at = self.pending.len() - keep;
        let visible = self.pending[..split_at].to_string();
        self.pending.drain(..split_at);
        self.reply.push_str(&visible);
        visible
    }

    /// Returns `(unshown_tail, reply, trait)`. The tail is text held back
    /// while waiting for a possible separator; callers should still show it.
    pub fn finish(mut self) -> (String, String, Option<String>) {
        let tail = std::mem::take(&mut self.pending);
        self.reply.push_str(&tail);
        let reply = self.reply.trim().to_string();
        (tail, reply, normalize_trait(&self.trait_text))
    }
}

/// Trims a raw trait; empty or `None` (any case) means no new trait.
pub fn normalize_trait(raw: &str) -> Option<String> {
    let t = raw.trim();
    if t.is_empty() || t.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(t.to_string())
    }
}
