//! Vocabulary string -> raw bytes.
//!
//! Two conventions are common across HuggingFace vocabularies:
//!
//! - **ByteLevel** (GPT-2): every byte 0..=255 maps to a distinct printable
//!   character so BPE can operate on strings. Qwen, Llama 3, DeepSeek.
//! - **ByteFallback** (SentencePiece): raw bytes appear as `<0xHH>` tokens and
//!   `▁` (U+2581) stands for a leading space. Llama 2, Mistral, Phi-3, Gemma.
//!
//! Decoded bytes may end in the middle of a multi-byte UTF-8 sequence.
//! Reassembly across tokens is the caller's job.

use std::collections::HashMap;
use std::path::Path;

use once_cell::sync::Lazy;
use serde_json::Value;

/// SentencePiece metaspace, rendered as a leading space.
pub const METASPACE: char = '\u{2581}';

/// How a vocabulary maps its strings to raw bytes. Fixed per model at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ByteDecoding {
    /// GPT-2 byte table.
    #[default]
    ByteLevel,
    /// `<0xHH>` byte tokens plus metaspace.
    ByteFallback,
}

/// Byte -> character table of the GPT-2 byte encoder.
static BYTE_ENCODER: Lazy<[char; 256]> = Lazy::new(|| {
    let mut table = ['\0'; 256];
    let mut mapped = [false; 256];

    for b in (33u8..=126).chain(161..=172).chain(174..=255) {
        table[b as usize] = char::from(b);
        mapped[b as usize] = true;
    }

    // Everything else is shifted to U+0100 onwards, in byte order.
    let mut next = 0x100u32;
    for b in 0..256usize {
        if !mapped[b] {
            table[b] = char::from_u32(next).unwrap_or(char::REPLACEMENT_CHARACTER);
            next += 1;
        }
    }
    table
});

static BYTE_DECODER: Lazy<HashMap<char, u8>> = Lazy::new(|| {
    BYTE_ENCODER
        .iter()
        .enumerate()
        .map(|(b, &c)| (c, b as u8))
        .collect()
});

/// The character the ByteLevel table assigns to `byte`.
pub fn byte_level_char(byte: u8) -> char {
    BYTE_ENCODER[byte as usize]
}

/// Convert a vocabulary string to the raw bytes it represents.
pub fn token_bytes(token: &str, decoding: ByteDecoding) -> Vec<u8> {
    match decoding {
        ByteDecoding::ByteLevel => byte_level_bytes(token),
        ByteDecoding::ByteFallback => byte_fallback_bytes(token),
    }
}

fn byte_level_bytes(token: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(token.len());
    for c in token.chars() {
        match BYTE_DECODER.get(&c) {
            Some(&b) => bytes.push(b),
            // Vocabularies may carry raw characters outside the table.
            None => {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    bytes
}

fn byte_fallback_bytes(token: &str) -> Vec<u8> {
    if let Some(byte) = parse_byte_token(token) {
        return vec![byte];
    }
    token.replace(METASPACE, " ").into_bytes()
}

/// Parse `<0xHH>`.
fn parse_byte_token(token: &str) -> Option<u8> {
    let hex = token.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

/// Inspect `<model_dir>/tokenizer.json` and pick the byte decoding scheme.
///
/// - `decoder.type == "ByteLevel"` -> [`ByteDecoding::ByteLevel`]
/// - `decoder.type == "Sequence"` with a `ByteFallback` step -> [`ByteDecoding::ByteFallback`]
/// - `decoder.type == "ByteFallback"` -> [`ByteDecoding::ByteFallback`]
/// - missing file, unreadable JSON or anything else -> [`ByteDecoding::ByteLevel`]
pub fn detect_byte_decoding(model_dir: &Path) -> ByteDecoding {
    let path = model_dir.join("tokenizer.json");
    let json = match std::fs::read_to_string(&path)
        .ok()
        .and_then(|data| serde_json::from_str::<Value>(&data).ok())
    {
        Some(json) => json,
        None => {
            tracing::debug!(path = %path.display(), "no readable tokenizer.json, assuming ByteLevel");
            return ByteDecoding::ByteLevel;
        }
    };

    let decoding = json
        .get("decoder")
        .map(decoding_for_decoder)
        .unwrap_or_default();
    tracing::debug!(path = %path.display(), ?decoding, "detected byte decoding");
    decoding
}

fn decoding_for_decoder(decoder: &Value) -> ByteDecoding {
    match decoder.get("type").and_then(Value::as_str) {
        Some("ByteFallback") => ByteDecoding::ByteFallback,
        Some("Sequence") => {
            let has_fallback = decoder
                .get("decoders")
                .and_then(Value::as_array)
                .map(|steps| {
                    steps
                        .iter()
                        .any(|step| step.get("type").and_then(Value::as_str) == Some("ByteFallback"))
                })
                .unwrap_or(false);
            if has_fallback {
                ByteDecoding::ByteFallback
            } else {
                ByteDecoding::ByteLevel
            }
        }
        _ => ByteDecoding::ByteLevel,
    }
}
