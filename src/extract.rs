//! Turns the quoted base64 blob written by the serving container into a PNG file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::prelude::*;
use tracing::{info, warn};

pub const DEFAULT_OUTPUT_NAME: &str = "output";

const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Drops the leading and trailing delimiter, decodes the rest and writes
/// `<output_dir>/<name>.png`. The decoded bytes are not checked to be an image.
pub fn extract_png(input: &Path, output_dir: &Path, name: &str) -> Result<PathBuf> {
    let content = fs::read(input).with_context(|| format!("failed to read {}", input.display()))?;
    let bytes = decode_blob(&content);

    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    let output = output_dir.join(format!("{name}.png"));
    fs::write(&output, &bytes).with_context(|| format!("failed to write {}", output.display()))?;
    info!(path = %output.display(), bytes = bytes.len(), "extracted image");

    Ok(output)
}

fn decode_blob(content: &[u8]) -> Vec<u8> {
    let inner = strip_delimiters(content);
    match BASE64_STANDARD.decode(inner) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("result is not clean base64 ({e}), decoding leniently");
            decode_lenient(inner)
        }
    }
}

/// Delimiters are whole characters when the blob is text and single bytes otherwise.
fn strip_delimiters(content: &[u8]) -> &[u8] {
    if let Ok(text) = std::str::from_utf8(content) {
        let mut chars = text.chars();
        chars.next();
        chars.next_back();
        return chars.as_str().as_bytes();
    }
    match content {
        [_, inner @ .., _] => inner,
        _ => &[],
    }
}

/// Keeps alphabet bytes only, like a non-validating decoder would.
fn decode_lenient(inner: &[u8]) -> Vec<u8> {
    let mut cleaned: Vec<u8> = inner
        .iter()
        .copied()
        .filter(|b| b.is_ascii_alphanumeric() || *b == b'+' || *b == b'/')
        .collect();
    // a lone trailing sextet cannot encode a byte
    if cleaned.len() % 4 == 1 {
        cleaned.pop();
    }
    LENIENT.decode(cleaned).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob_file(dir: &Path, content: impl AsRef<[u8]>) -> PathBuf {
        let path = dir.join("output.bin");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn quoted_base64_round_trips_to_original_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let original: Vec<u8> = (0..=255u8).rev().chain([0x89, b'P', b'N', b'G']).collect();
        let input = blob_file(dir.path(), &format!("\"{}\"", BASE64_STANDARD.encode(&original)));

        let output = extract_png(&input, &dir.path().join("output"), "output-abc").unwrap();

        assert_eq!(output, dir.path().join("output").join("output-abc.png"));
        assert_eq!(fs::read(output).unwrap(), original);
    }

    #[test]
    fn strips_exactly_one_character_from_each_end() {
        assert_eq!(strip_delimiters(b"\"abcd\""), b"abcd");
        assert_eq!(strip_delimiters(b"xabcdx\n"), b"abcdx");
        assert_eq!(strip_delimiters("\u{201c}ab\u{201d}".as_bytes()), b"ab");
        assert_eq!(strip_delimiters(b"\xffab\xfe"), b"ab");
        assert_eq!(strip_delimiters(b"a"), b"");
        assert_eq!(strip_delimiters(b""), b"");
    }

    #[test]
    fn malformed_input_still_produces_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = blob_file(dir.path(), "\"aGVsbG8*gd29ybGQ=\n\"");

        let output = extract_png(&input, dir.path(), DEFAULT_OUTPUT_NAME).unwrap();

        assert_eq!(fs::read(output).unwrap(), b"hello world");
    }

    #[test]
    fn binary_input_is_decoded_instead_of_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let input = blob_file(dir.path(), b"\"aGVs\xffbG8=\x00\"");

        let output = extract_png(&input, dir.path(), DEFAULT_OUTPUT_NAME).unwrap();

        assert_eq!(fs::read(output).unwrap(), b"hello");
    }

    #[test]
    fn unreadable_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(extract_png(&dir.path().join("missing.bin"), dir.path(), "x").is_err());
    }
}
