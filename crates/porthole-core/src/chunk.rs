//! Paste splitting for remote shells.
//!
//! Large pastes pushed into a PTY in one write tend to overrun line
//! discipline buffers and garble the echo. Anything over the threshold is
//! normalized to CRLF line endings, cut into fixed-size fragments on UTF-8
//! character boundaries, and drained with a short pause between fragments.
//! Concatenating the fragments always reproduces the normalized input.

use std::time::Duration;

/// Knobs for the splitter. Defaults suit interactive shells over a WAN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    /// Payloads at or under this many bytes are sent as a single piece.
    pub threshold: usize,
    /// Upper bound on the byte length of each fragment.
    pub fragment: usize,
    /// Pause between consecutive fragments.
    pub delay: Duration,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            threshold: 1000,
            fragment: 500,
            delay: Duration::from_millis(50),
        }
    }
}

/// Rewrites bare `\n` to `\r\n`, leaving existing `\r\n` pairs alone.
pub fn normalize_newlines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev_cr = false;
    for ch in text.chars() {
        if ch == '\n' && !prev_cr {
            out.push('\r');
        }
        prev_cr = ch == '\r';
        out.push(ch);
    }
    out
}

/// Cuts `text` into pieces of at most `fragment` bytes without ever
/// splitting a multi-byte character.
pub fn split_fragments(text: &str, fragment: usize) -> Vec<String> {
    let fragment = fragment.max(1);
    let mut pieces = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        if rest.len() <= fragment {
            pieces.push(rest.to_string());
            break;
        }
        let mut cut = fragment;
        while cut > 0 && !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            // fragment smaller than the first character, take it whole
            cut = rest.chars().next().map(char::len_utf8).unwrap_or(rest.len());
        }
        let (piece, tail) = rest.split_at(cut);
        pieces.push(piece.to_string());
        rest = tail;
    }
    pieces
}

/// A prepared transfer: normalized text, pre-cut into fragments.
#[derive(Debug)]
pub struct ChunkedTransfer {
    fragments: Vec<String>,
    cursor: usize,
}

impl ChunkedTransfer {
    /// Normalizes `text` and decides whether it needs splitting. Empty
    /// input produces a transfer with nothing to send.
    pub fn prepare(text: &str, policy: &ChunkPolicy) -> Self {
        let normalized = normalize_newlines(text);
        let fragments = if normalized.is_empty() {
            Vec::new()
        } else if normalized.len() > policy.threshold {
            split_fragments(&normalized, policy.fragment)
        } else {
            vec![normalized]
        };
        Self { fragments, cursor: 0 }
    }

    pub fn next_fragment(&mut self) -> Option<String> {
        let piece = self.fragments.get(self.cursor).cloned()?;
        self.cursor += 1;
        Some(piece)
    }

    /// True while fragments remain after the one just taken. Callers use
    /// this to skip the pacing delay after the final fragment.
    pub fn has_remaining(&self) -> bool {
        self.cursor < self.fragments.len()
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tight_policy() -> ChunkPolicy {
        ChunkPolicy {
            threshold: 10,
            fragment: 4,
            delay: Duration::from_millis(0),
        }
    }

    #[test]
    fn bare_newlines_gain_carriage_returns() {
        assert_eq!(normalize_newlines("a\nb"), "a\r\nb");
        assert_eq!(normalize_newlines("a\nb\nc"), "a\r\nb\r\nc");
        assert_eq!(normalize_newlines("\n"), "\r\n");
    }

    #[test]
    fn existing_crlf_pairs_are_untouched() {
        assert_eq!(normalize_newlines("a\r\nb"), "a\r\nb");
        assert_eq!(normalize_newlines("a\r\n\nb"), "a\r\n\r\nb");
    }

    #[test]
    fn fragments_reassemble_to_the_original() {
        let text = "0123456789abcdefghij";
        let pieces = split_fragments(text, 7);
        assert!(pieces.iter().all(|p| p.len() <= 7));
        assert_eq!(pieces.concat(), text);
    }

    #[test]
    fn fragments_never_split_a_character() {
        // each kana is 3 bytes, so a 4-byte budget forces a 3-byte cut
        let text = "あいうえお";
        let pieces = split_fragments(text, 4);
        assert_eq!(pieces.len(), 5);
        for piece in &pieces {
            assert_eq!(piece.chars().count(), 1);
        }
        assert_eq!(pieces.concat(), text);
    }

    #[test]
    fn fragment_budget_below_one_character_still_advances() {
        let text = "あい";
        let pieces = split_fragments(text, 1);
        assert_eq!(pieces, vec!["あ".to_string(), "い".to_string()]);
    }

    #[test]
    fn short_payloads_pass_through_whole() {
        let mut transfer = ChunkedTransfer::prepare("echo hi", &tight_policy());
        assert_eq!(transfer.fragment_count(), 1);
        assert_eq!(transfer.next_fragment().as_deref(), Some("echo hi"));
        assert!(!transfer.has_remaining());
        assert!(transfer.next_fragment().is_none());
    }

    #[test]
    fn long_payloads_are_split_after_normalization() {
        let mut transfer = ChunkedTransfer::prepare("line one\nline two", &tight_policy());
        assert!(transfer.fragment_count() > 1);
        let mut rebuilt = String::new();
        while let Some(piece) = transfer.next_fragment() {
            assert!(piece.len() <= 4);
            rebuilt.push_str(&piece);
        }
        assert_eq!(rebuilt, "line one\r\nline two");
    }

    #[test]
    fn empty_input_produces_no_fragments() {
        let mut transfer = ChunkedTransfer::prepare("", &ChunkPolicy::default());
        assert_eq!(transfer.fragment_count(), 0);
        assert!(transfer.next_fragment().is_none());
        assert!(!transfer.has_remaining());
    }

    #[test]
    fn threshold_counts_normalized_bytes() {
        // 9 bytes raw, 10 after normalization: still within threshold
        let policy = tight_policy();
        let transfer = ChunkedTransfer::prepare("12345678\n", &policy);
        assert_eq!(transfer.fragment_count(), 1);
        // one more byte tips it over
        let transfer = ChunkedTransfer::prepare("123456789\n", &policy);
        assert!(transfer.fragment_count() > 1);
    }
}
