//! Environment blob decoding
//!
//! Callers pack the worker's extra environment as `key\0value\0key\0value\0...`
//! and wrap the result in base64 for transport. This module reverses that
//! framing. Decoding happens in the parent before any process is created, so
//! a malformed blob aborts the spawn without side effects.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{Result, SpawnError};

/// Decode a transport-encoded environment blob into an ordered sequence of
/// key/value pairs.
///
/// Keys may repeat; the order of the returned pairs is the caller's packing
/// order, and the last occurrence of a key wins once applied to the process
/// environment.
pub fn decode(blob: &str) -> Result<Vec<(String, String)>> {
    // MIME-style encoders break the output into lines; strip whitespace
    // before handing the blob to the engine.
    let compact: Vec<u8> = blob
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    let raw = STANDARD
        .decode(&compact)
        .map_err(|e| SpawnError::Codec(format!("invalid transport encoding: {}", e)))?;
    parse_pairs(&raw)
}

/// Pack key/value pairs into the transport encoding `decode` expects.
/// Convenience for the caller side of the wire format.
pub fn encode(pairs: &[(String, String)]) -> String {
    let mut raw = Vec::new();
    for (key, value) in pairs {
        raw.extend_from_slice(key.as_bytes());
        raw.push(0);
        raw.extend_from_slice(value.as_bytes());
        raw.push(0);
    }
    STANDARD.encode(&raw)
}

/// Apply decoded pairs to the current process environment, in order. Later
/// occurrences of a key overwrite earlier ones.
pub fn apply(pairs: &[(String, String)]) {
    for (key, value) in pairs {
        std::env::set_var(key, value);
    }
}

fn parse_pairs(raw: &[u8]) -> Result<Vec<(String, String)>> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }

    let mut tokens: Vec<&[u8]> = raw.split(|b| *b == 0).collect();
    // A well-formed blob terminates every pair with NUL, which leaves one
    // empty token after the final separator.
    if raw.ends_with(&[0]) {
        tokens.pop();
    }
    if tokens.len() % 2 != 0 {
        return Err(SpawnError::Codec(format!(
            "odd token count ({} tokens): blob is not a sequence of key/value pairs",
            tokens.len()
        )));
    }

    let mut pairs = Vec::with_capacity(tokens.len() / 2);
    for chunk in tokens.chunks_exact(2) {
        let key = token_to_string(chunk[0])?;
        let value = token_to_string(chunk[1])?;
        pairs.push((key, value));
    }
    Ok(pairs)
}

fn token_to_string(token: &[u8]) -> Result<String> {
    std::str::from_utf8(token)
        .map(|s| s.to_string())
        .map_err(|e| SpawnError::Codec(format!("token is not valid UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_raw(raw: &[u8]) -> String {
        STANDARD.encode(raw)
    }

    #[test]
    fn decodes_packed_pairs() {
        let blob = encode_raw(b"PATH\0/usr/bin:/opt/sw/bin\0FOO\0foo bar!\0");
        let pairs = decode(&blob).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("PATH".to_string(), "/usr/bin:/opt/sw/bin".to_string()),
                ("FOO".to_string(), "foo bar!".to_string()),
            ]
        );
    }

    #[test]
    fn tolerates_line_breaks_in_transport_encoding() {
        let mut blob = encode_raw(b"KEY\0value\0");
        blob.insert(4, '\n');
        blob.push('\n');
        let pairs = decode(&blob).unwrap();
        assert_eq!(pairs, vec![("KEY".to_string(), "value".to_string())]);
    }

    #[test]
    fn empty_blob_decodes_to_nothing() {
        assert!(decode("").unwrap().is_empty());
    }

    #[test]
    fn missing_trailing_separator_is_accepted() {
        let blob = encode_raw(b"KEY\0value");
        let pairs = decode(&blob).unwrap();
        assert_eq!(pairs, vec![("KEY".to_string(), "value".to_string())]);
    }

    #[test]
    fn odd_token_count_is_rejected() {
        let blob = encode_raw(b"KEY\0value\0dangling\0");
        let err = decode(&blob).unwrap_err();
        assert!(matches!(err, SpawnError::Codec(_)));
        assert!(err.to_string().contains("odd token count"));
    }

    #[test]
    fn invalid_transport_encoding_is_rejected() {
        let err = decode("!!! not base64 !!!").unwrap_err();
        assert!(matches!(err, SpawnError::Codec(_)));
    }

    #[test]
    fn non_utf8_token_is_rejected() {
        let blob = encode_raw(b"KEY\0\xff\xfe\0");
        let err = decode(&blob).unwrap_err();
        assert!(matches!(err, SpawnError::Codec(_)));
    }

    #[test]
    fn repeated_keys_preserve_packing_order() {
        let blob = encode_raw(b"K\0first\0K\0second\0");
        let pairs = decode(&blob).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("K".to_string(), "first".to_string()),
                ("K".to_string(), "second".to_string()),
            ]
        );
    }

    #[test]
    fn apply_lets_last_occurrence_win() {
        let pairs = vec![
            ("APPSPAWN_CODEC_TEST".to_string(), "first".to_string()),
            ("APPSPAWN_CODEC_TEST".to_string(), "second".to_string()),
        ];
        apply(&pairs);
        assert_eq!(std::env::var("APPSPAWN_CODEC_TEST").unwrap(), "second");
        std::env::remove_var("APPSPAWN_CODEC_TEST");
    }

    #[test]
    fn encode_round_trips_through_decode() {
        let pairs = vec![
            ("RAILS_ENV".to_string(), "production".to_string()),
            ("EMPTY".to_string(), String::new()),
        ];
        assert_eq!(decode(&encode(&pairs)).unwrap(), pairs);
    }
}
