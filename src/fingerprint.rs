//! Stable, non-cryptographic hashing shared by the embedder, dedup and
//! generation checksums. Output must not change between releases: persisted
//! manifests and stored SimHashes depend on it.

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a 64-bit hash.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hasher = Fnv1a::new();
    hasher.write(bytes);
    hasher.finish()
}

/// Incremental FNV-1a, for hashing a sequence of fields without concatenating them.
#[derive(Debug, Clone, Copy)]
pub struct Fnv1a(u64);

impl Fnv1a {
    pub fn new() -> Self {
        Self(FNV_OFFSET)
    }

    pub fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.0 ^= byte as u64;
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write(&value.to_le_bytes());
    }

    pub fn finish(&self) -> u64 {
        self.0
    }
}

impl Default for Fnv1a {
    fn default() -> Self {
        Self::new()
    }
}

/// 64-bit SimHash over lowercase word tokens, skipping stop words.
///
/// Near-identical texts land within a few bits of each other; compare with
/// [`hamming_distance`]. Returns `None` when the text has no usable tokens.
pub fn simhash(text: &str) -> Option<u64> {
    let mut weights = [0i32; 64];
    let mut seen_any = false;

    for token in word_tokens(text) {
        if STOP_WORDS.contains(&token.as_str()) {
            continue;
        }
        seen_any = true;
        let hash = fnv1a(token.as_bytes());
        for (bit, weight) in weights.iter_mut().enumerate() {
            if (hash >> bit) & 1 == 1 {
                *weight += 1;
            } else {
                *weight -= 1;
            }
        }
    }

    if !seen_any {
        return None;
    }

    let fingerprint = weights
        .iter()
        .enumerate()
        .filter(|(_, w)| **w > 0)
        .fold(0u64, |acc, (bit, _)| acc | (1u64 << bit));
    Some(fingerprint)
}

pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// Lowercase alphanumeric word tokens.
pub fn word_tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "in", "of", "to", "is", "was", "for", "on", "with", "this",
    "that", "are", "were", "be", "been", "by", "from", "we", "our", "their", "which", "also",
];
