//! Byte-level BPE tokenizer.
//!
//! - Splits text with the GPT-2 pre-tokenization pattern.
//! - Maps every byte of a piece to a printable surface symbol so merges never see control characters.
//! - Merges adjacent symbols by rank and looks the results up in the vocabulary.
//! - Decodes ids back through the inverse byte table, replacing invalid UTF-8.

#[cfg(test)]
#[path = "../tests/unit/tokenizer_test.rs"]
mod tests;

use crate::error::{Error, Result};
use fancy_regex::Regex;
use log::debug;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Pre-tokenization pattern: contractions, letter runs, digit runs, punctuation runs, whitespace.
const SPLIT_PATTERN: &str = r"'s|'t|'re|'ve|'m|'ll|'d| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+(?!\S)|\s+";

/// Upper bound on merge rounds for a single piece.
const MAX_MERGE_ITERATIONS: usize = 1000;

/// Bijection between raw bytes and printable surface symbols.
#[derive(Debug, Clone)]
pub struct ByteSymbolTable {
    to_symbol: Vec<char>,
    to_byte: HashMap<char, u8>,
}

impl ByteSymbolTable {
    const PRINTABLE_ASCII: std::ops::RangeInclusive<u8> = 33..=126;
    const EXTENDED_ASCII_1: std::ops::RangeInclusive<u8> = 161..=172;
    const EXTENDED_ASCII_2: std::ops::RangeInclusive<u8> = 174..=255;
    const UNICODE_OFFSET: u32 = 256;

    pub fn new() -> Self {
        let mut to_symbol = vec!['\0'; 256];
        let mut shifted = 0u32;

        for b in 0..=255u8 {
            let printable = Self::PRINTABLE_ASCII.contains(&b)
                || Self::EXTENDED_ASCII_1.contains(&b)
                || Self::EXTENDED_ASCII_2.contains(&b);

            // Unprintable bytes map past Latin-1 in byte order.
            to_symbol[b as usize] = if printable {
                char::from(b)
            } else {
                let symbol = char::from_u32(Self::UNICODE_OFFSET + shifted).unwrap_or(char::REPLACEMENT_CHARACTER);
                shifted += 1;
                symbol
            };
        }

        let to_byte = to_symbol.iter().enumerate().map(|(b, &c)| (c, b as u8)).collect();
        Self { to_symbol, to_byte }
    }

    pub fn symbol(&self, byte: u8) -> char {
        self.to_symbol[byte as usize]
    }

    pub fn byte(&self, symbol: char) -> Option<u8> {
        self.to_byte.get(&symbol).copied()
    }

    /// Surface form of raw bytes.
    pub fn encode_bytes(&self, bytes: &[u8]) -> String {
        bytes.iter().map(|&b| self.symbol(b)).collect()
    }

    /// Raw bytes of a surface string. Characters outside the table keep their UTF-8 bytes.
    pub fn decode_symbols(&self, surface: &str, out: &mut Vec<u8>) {
        for ch in surface.chars() {
            match self.byte(ch) {
                Some(b) => out.push(b),
                None => out.extend_from_slice(ch.encode_utf8(&mut [0; 4]).as_bytes()),
            }
        }
    }
}

impl Default for ByteSymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

/// GPT-2 byte-pair-encoding tokenizer.
///
/// Merged forms of every piece seen by [`Tokenizer::encode`] are memoized for the lifetime of
/// the tokenizer. The cache is never evicted; its size is bounded by the distinct pieces encoded.
pub struct Tokenizer {
    encoder: HashMap<String, usize>,
    decoder: HashMap<usize, String>,
    bpe_ranks: HashMap<String, usize>,
    bytes: ByteSymbolTable,
    pattern: Regex,
    cache: HashMap<String, String>,
}

impl Tokenizer {
    /// Builds a tokenizer from a vocabulary and merge pairs ordered by priority.
    pub fn new(encoder: HashMap<String, usize>, merges: Vec<(String, String)>) -> Result<Self> {
        let pattern =
            Regex::new(SPLIT_PATTERN).map_err(|e| Error::Tokenizer(format!("invalid split pattern: {e}")))?;

        let decoder = encoder.iter().map(|(token, &id)| (id, token.clone())).collect();
        let bpe_ranks = merges
            .into_iter()
            .enumerate()
            .map(|(rank, (first, second))| (format!("{first} {second}"), rank))
            .collect();

        Ok(Self { encoder, decoder, bpe_ranks, bytes: ByteSymbolTable::new(), pattern, cache: HashMap::new() })
    }

    /// Loads `encoder.json` (surface string to id) and `vocab.bpe` (one merge pair per line).
    pub fn from_files(encoder_path: &Path, merges_path: &Path) -> Result<Self> {
        let encoder = Self::load_encoder(encoder_path)?;
        let merges = Self::load_merges(merges_path)?;
        debug!("Loaded {} vocabulary entries and {} merges", encoder.len(), merges.len());
        Self::new(encoder, merges)
    }

    fn load_encoder(path: &Path) -> Result<HashMap<String, usize>> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Tokenizer(format!("failed to read {}: {e}", path.display())))?;
        let json: Value = serde_json::from_str(&content)
            .map_err(|e| Error::Tokenizer(format!("failed to parse {}: {e}", path.display())))?;

        let entries = json
            .as_object()
            .ok_or_else(|| Error::Tokenizer(format!("{} is not a JSON object", path.display())))?;

        entries
            .iter()
            .map(|(token, id)| {
                id.as_u64()
                    .map(|id| (token.clone(), id as usize))
                    .ok_or_else(|| Error::Tokenizer(format!("token {token:?} has a non-integer id")))
            })
            .collect()
    }

    fn load_merges(path: &Path) -> Result<Vec<(String, String)>> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Tokenizer(format!("failed to read {}: {e}", path.display())))?;
        Ok(parse_merges(&content))
    }

    pub fn vocab_size(&self) -> usize {
        self.encoder.len()
    }

    pub fn cached_pieces(&self) -> usize {
        self.cache.len()
    }

    fn rank(&self, first: &str, second: &str) -> Option<usize> {
        self.bpe_ranks.get(&format!("{first} {second}")).copied()
    }

    /// Merges the symbols of `token` by rank; returns the merged symbols joined by spaces.
    pub fn bpe(&mut self, token: &str) -> String {
        if let Some(cached) = self.cache.get(token) {
            return cached.clone();
        }

        let mut word: Vec<String> = token.chars().map(String::from).collect();

        for _ in 0..MAX_MERGE_ITERATIONS {
            if word.len() < 2 {
                break;
            }

            let best = word
                .windows(2)
                .filter_map(|pair| self.rank(&pair[0], &pair[1]).map(|rank| (rank, pair)))
                .min_by_key(|(rank, _)| *rank)
                .map(|(_, pair)| (pair[0].clone(), pair[1].clone()));

            let Some((first, second)) = best else {
                break;
            };

            let mut merged = Vec::with_capacity(word.len());
            let mut i = 0;
            while i < word.len() {
                if i + 1 < word.len() && word[i] == first && word[i + 1] == second {
                    merged.push(format!("{first}{second}"));
                    i += 2;
                } else {
                    merged.push(std::mem::take(&mut word[i]));
                    i += 1;
                }
            }
            word = merged;
        }

        let result = word.join(" ");
        self.cache.insert(token.to_string(), result.clone());
        result
    }

    /// Splits `text` into pieces, merges each, and maps the sub-tokens to ids.
    pub fn encode(&mut self, text: &str) -> Result<Vec<usize>> {
        let pieces = self
            .pattern
            .find_iter(text)
            .map(|m| m.map(|m| m.as_str().to_string()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Tokenizer(format!("failed to split text: {e}")))?;

        let mut ids = Vec::new();
        for piece in pieces {
            let surface = self.bytes.encode_bytes(piece.as_bytes());
            let merged = self.bpe(&surface);

            for sub_token in merged.split(' ') {
                let id = self
                    .encoder
                    .get(sub_token)
                    .ok_or_else(|| Error::Tokenizer(format!("{sub_token:?} is not in the vocabulary")))?;
                ids.push(*id);
            }
        }
        Ok(ids)
    }

    /// Converts ids back to text. Unknown ids are skipped and invalid UTF-8 is replaced.
    pub fn decode(&self, ids: &[usize]) -> String {
        let mut bytes = Vec::new();
        for id in ids {
            match self.decoder.get(id) {
                Some(surface) => self.bytes.decode_symbols(surface, &mut bytes),
                None => debug!("Skipping unknown token id {id}"),
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Parses `first second` merge lines, skipping the `#version` header and blank lines.
pub fn parse_merges(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with("#version"))
        .filter_map(|line| line.split_once(' '))
        .map(|(first, second)| (first.to_string(), second.to_string()))
        .collect()
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("vocab_size", &self.encoder.len())
            .field("merges", &self.bpe_ranks.len())
            .field("cached_pieces", &self.cache.len())
            .finish_non_exhaustive()
    }
}
