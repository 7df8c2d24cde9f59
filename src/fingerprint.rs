//! Prompt fingerprinting — turns prompt text into a sequence of
//! block-level signatures usable for longest-common-prefix matching.
//!
//! Deliberately approximate: blocks are whitespace-delimited words, not
//! model tokens. The block granularity is a tuning knob
//! (`WORDS_PER_BLOCK`), not a claim of tokenizer fidelity.

/// A single block's signature: a 64-bit hash of its normalized text.
pub type BlockSignature = u64;

/// Fixed seed so `fingerprint` is stable across processes and restarts.
const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325 ^ 0x6c617070_726f7879; // "llapproxy"-salted FNV seed
const FNV_PRIME: u64 = 0x100000001b3;

/// The ordered sequence of block signatures for a prompt, plus its total
/// whitespace-delimited word count.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Fingerprint {
    pub signatures: Vec<BlockSignature>,
    pub word_count: usize,
}

impl Fingerprint {
    /// Length, in whole blocks, of the common prefix this fingerprint
    /// shares with `other`.
    pub fn common_prefix_len(&self, other: &Fingerprint) -> usize {
        self.signatures
            .iter()
            .zip(other.signatures.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }
}

/// Normalize whitespace (any run collapses to a single ASCII space,
/// leading/trailing trimmed) and split into words.
fn normalize_words(text: &str) -> Vec<&str> {
    text.split_whitespace().collect()
}

fn hash_block(words: &[&str]) -> BlockSignature {
    // FNV-1a over the block's normalized text (words joined by single
    // spaces), matching the "whitespace collapsed, no case change"
    // normalization rule.
    let mut hash = FNV_OFFSET_BASIS;
    for (i, word) in words.iter().enumerate() {
        if i > 0 {
            hash ^= b' ' as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        for byte in word.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    hash
}

/// Compute the fingerprint of a prompt's text, given the configured
/// block size in words. Pure and deterministic: the same `(text,
/// words_per_block)` pair always yields the same result, in this
/// process or any other.
pub fn fingerprint(text: &str, words_per_block: usize) -> Fingerprint {
    assert!(words_per_block >= 1, "words_per_block must be >= 1");

    let words = normalize_words(text);
    let word_count = words.len();

    let signatures = words
        .chunks(words_per_block)
        .filter(|chunk| chunk.len() == words_per_block) // drop trailing partial block
        .map(hash_block)
        .collect();

    Fingerprint {
        signatures,
        word_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_across_calls() {
        let a = fingerprint("a b c d e f g h", 4);
        let b = fingerprint("a b c d e f g h", 4);
        assert_eq!(a, b);
    }

    #[test]
    fn prefix_monotonicity() {
        // A is a word-prefix of B.
        let a = fingerprint("a b c d e f g h", 4);
        let b = fingerprint("a b c d e f g h i j k l", 4);
        assert_eq!(a.signatures, &b.signatures[..a.signatures.len()]);
    }

    #[test]
    fn trailing_partial_block_ignored_for_signatures() {
        let fp = fingerprint("a b c d e f", 4);
        // 6 words / 4 per block = 1 full block, 2 trailing words dropped.
        assert_eq!(fp.signatures.len(), 1);
        assert_eq!(fp.word_count, 6);
    }

    #[test]
    fn whitespace_normalization_collapses_runs() {
        let a = fingerprint("a  b\tc\nd e f g h", 4);
        let b = fingerprint("a b c d e f g h", 4);
        assert_eq!(a, b);
    }

    #[test]
    fn empty_prompt_has_empty_fingerprint() {
        let fp = fingerprint("", 4);
        assert!(fp.signatures.is_empty());
        assert_eq!(fp.word_count, 0);
    }

    #[test]
    fn diverging_tail_keeps_shared_prefix_blocks() {
        let a = fingerprint("a b c d e f g h i j k l", 4);
        let b = fingerprint("a b c d e f g h X Y Z W", 4);
        // First two blocks shared, third diverges.
        assert_eq!(a.common_prefix_len(&b), 2);
    }

    #[test]
    fn common_prefix_len_zero_when_first_block_differs() {
        let a = fingerprint("a b c d", 4);
        let b = fingerprint("z y x w", 4);
        assert_eq!(a.common_prefix_len(&b), 0);
    }
}
