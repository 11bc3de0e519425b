use super::*;
use std::io::Write;
use tempfile::NamedTempFile;

fn pair(first: &str, second: &str) -> (String, String) {
    (first.to_string(), second.to_string())
}

/// Vocabulary where the id of every single-byte token is the byte itself.
fn byte_vocabulary() -> HashMap<String, usize> {
    let table = ByteSymbolTable::new();
    (0..=255u8).map(|b| (table.symbol(b).to_string(), b as usize)).collect()
}

fn byte_tokenizer() -> Tokenizer {
    Tokenizer::new(byte_vocabulary(), Vec::new()).unwrap()
}

fn pieces(tokenizer: &Tokenizer, text: &str) -> Vec<String> {
    tokenizer.pattern.find_iter(text).map(|m| m.unwrap().as_str().to_string()).collect()
}

#[test]
fn test_byte_table_is_a_bijection() {
    let table = ByteSymbolTable::new();
    let symbols: std::collections::HashSet<char> = (0..=255u8).map(|b| table.symbol(b)).collect();

    assert_eq!(symbols.len(), 256);
    assert!((0..=255u8).all(|b| table.byte(table.symbol(b)) == Some(b)));
    assert_eq!(table.symbol(b'a'), 'a');
    assert_eq!(table.symbol(b'!'), '!');
    assert_eq!(table.symbol(b' '), '\u{120}');
    assert_eq!(table.symbol(b'\n'), '\u{10A}');
    assert_eq!(table.symbol(0), '\u{100}');
    assert_eq!(table.symbol(173), '\u{143}');
}

#[test]
fn test_bpe_merges_by_rank() {
    let merges = vec![pair("l", "o"), pair("lo", "w"), pair("low", "e"), pair("lowe", "r")];
    let mut tokenizer = Tokenizer::new(HashMap::new(), merges).unwrap();

    assert_eq!(tokenizer.bpe("lower"), "lower");
    assert_eq!(tokenizer.bpe("lowly"), "low l y");
    assert_eq!(tokenizer.bpe("x"), "x");
}

#[test]
fn test_bpe_prefers_lowest_rank() {
    let merges = vec![pair("b", "c"), pair("a", "b")];
    let mut tokenizer = Tokenizer::new(HashMap::new(), merges).unwrap();

    // "b c" outranks "a b", leaving nothing for "a b" to merge
    assert_eq!(tokenizer.bpe("abc"), "a bc");
}

#[test]
fn test_bpe_merges_non_overlapping_occurrences() {
    let mut tokenizer = Tokenizer::new(HashMap::new(), vec![pair("a", "a")]).unwrap();

    assert_eq!(tokenizer.bpe("aaa"), "aa a");
    assert_eq!(tokenizer.bpe("aaaaa"), "aa aa a");
}

#[test]
fn test_bpe_without_merges_splits_symbols() {
    let mut tokenizer = byte_tokenizer();
    assert_eq!(tokenizer.bpe("low"), "l o w");
}

#[test]
fn test_bpe_results_are_cached() {
    let mut tokenizer = Tokenizer::new(HashMap::new(), vec![pair("h", "i")]).unwrap();

    assert_eq!(tokenizer.bpe("hi"), "hi");
    assert_eq!(tokenizer.bpe("hi"), "hi");
    assert_eq!(tokenizer.cached_pieces(), 1);

    tokenizer.bpe("ih");
    assert_eq!(tokenizer.cached_pieces(), 2);
}

#[test]
fn test_split_pattern() {
    let tokenizer = byte_tokenizer();

    assert_eq!(pieces(&tokenizer, "Hello world  !\n"), vec!["Hello", " world", " ", " !", "\n"]);
    assert_eq!(pieces(&tokenizer, "it's 2024"), vec!["it", "'s", " 2024"]);
    assert_eq!(pieces(&tokenizer, "we'll see"), vec!["we", "'ll", " see"]);
}

#[test]
fn test_encode_maps_bytes_through_vocabulary() {
    let mut tokenizer = byte_tokenizer();
    let text = "Hi there, café!";

    let ids = tokenizer.encode(text).unwrap();

    let expected: Vec<usize> = text.bytes().map(usize::from).collect();
    assert_eq!(ids, expected);
}

#[test]
fn test_encode_uses_merged_tokens() {
    let mut encoder = byte_vocabulary();
    encoder.insert("he".to_string(), 256);
    encoder.insert("\u{120}the".to_string(), 257);
    encoder.insert("\u{120}t".to_string(), 258);
    encoder.insert("\u{120}th".to_string(), 259);
    let merges = vec![pair("\u{120}", "t"), pair("\u{120}t", "h"), pair("\u{120}th", "e"), pair("h", "e")];
    let mut tokenizer = Tokenizer::new(encoder, merges).unwrap();

    assert_eq!(tokenizer.encode("he the").unwrap(), vec![256, 257]);
    assert_eq!(tokenizer.decode(&[256, 257]), "he the");
}

#[test]
fn test_encode_fails_on_missing_vocabulary_entry() {
    let mut tokenizer = Tokenizer::new(HashMap::new(), Vec::new()).unwrap();
    assert!(matches!(tokenizer.encode("a"), Err(Error::Tokenizer(_))));
    assert_eq!(tokenizer.encode("").unwrap(), Vec::<usize>::new());
}

#[test]
fn test_round_trip() {
    let mut tokenizer = byte_tokenizer();

    for text in [
        "The quick brown fox jumps over the lazy dog.",
        "  leading and trailing  ",
        "tabs\tand\nnewlines\r\n",
        "naïve façade, 東京, 🚀🔥",
        "numbers 3.14159 and symbols #$%^&*()",
        "",
    ] {
        let ids = tokenizer.encode(text).unwrap();
        assert_eq!(tokenizer.decode(&ids), text);
    }
}

#[test]
fn test_decode_is_lossy_not_fatal() {
    let tokenizer = byte_tokenizer();

    assert_eq!(tokenizer.decode(&[0xff]), "\u{FFFD}");
    // first byte of a two-byte sequence without its continuation
    assert_eq!(tokenizer.decode(&[0xc3, b'a' as usize]), "\u{FFFD}a");
    assert_eq!(tokenizer.decode(&[b'o' as usize, 9999, b'k' as usize]), "ok");
}

#[test]
fn test_parse_merges_skips_header_and_blank_lines() {
    let merges = parse_merges("#version: 0.2\nĠ t\nĠ a\n\nh e\n");
    assert_eq!(merges, vec![pair("Ġ", "t"), pair("Ġ", "a"), pair("h", "e")]);
}

#[test]
fn test_from_files() {
    let mut encoder_file = NamedTempFile::new().unwrap();
    write!(encoder_file, r#"{{"l": 0, "o": 1, "w": 2, "lo": 3, "low": 4}}"#).unwrap();
    let mut merges_file = NamedTempFile::new().unwrap();
    writeln!(merges_file, "#version: 0.2\nl o\nlo w").unwrap();

    let mut tokenizer = Tokenizer::from_files(encoder_file.path(), merges_file.path()).unwrap();

    assert_eq!(tokenizer.vocab_size(), 5);
    assert_eq!(tokenizer.encode("lowl").unwrap(), vec![4, 0]);
    assert_eq!(tokenizer.decode(&[4, 0]), "lowl");
}

#[test]
fn test_from_files_reports_bad_encoder() {
    let mut encoder_file = NamedTempFile::new().unwrap();
    write!(encoder_file, "[1, 2, 3]").unwrap();
    let merges_file = NamedTempFile::new().unwrap();

    let err = Tokenizer::from_files(encoder_file.path(), merges_file.path()).unwrap_err();
    assert!(matches!(err, Error::Tokenizer(_)));
    assert!(err.to_string().contains("not a JSON object"));
}
