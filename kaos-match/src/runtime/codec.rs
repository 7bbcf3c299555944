//! Base64 and hex helpers exposed to handlers.
//!
//! Decoding with `padding = false` accepts unpadded input by padding it to a
//! multiple of four first, so padding becomes optional rather than forbidden.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;

use crate::error::{MatchError, Result};

pub fn base64_encode(input: &[u8], padding: bool) -> String {
    if padding {
        STANDARD.encode(input)
    } else {
        STANDARD_NO_PAD.encode(input)
    }
}

pub fn base64_decode(input: &str, padding: bool) -> Result<Vec<u8>> {
    let padded = pad_if_needed(input, padding);
    STANDARD
        .decode(padded.as_bytes())
        .map_err(|_| MatchError::Codec(format!("Failed to decode string: {}", input)))
}

pub fn base64_url_encode(input: &[u8], padding: bool) -> String {
    if padding {
        URL_SAFE.encode(input)
    } else {
        URL_SAFE_NO_PAD.encode(input)
    }
}

pub fn base64_url_decode(input: &str, padding: bool) -> Result<Vec<u8>> {
    let padded = pad_if_needed(input, padding);
    URL_SAFE
        .decode(padded.as_bytes())
        .map_err(|_| MatchError::Codec(format!("Failed to decode string: {}", input)))
}

pub fn base16_encode(input: &[u8]) -> String {
    hex::encode(input)
}

pub fn base16_decode(input: &str) -> Result<Vec<u8>> {
    hex::decode(input).map_err(|_| MatchError::Codec(format!("Failed to decode string: {}", input)))
}

fn pad_if_needed(input: &str, padding: bool) -> String {
    let mut out = input.to_string();
    if !padding {
        let rem = out.len() % 4;
        if rem != 0 {
            out.extend(std::iter::repeat('=').take(4 - rem));
        }
    }
    out
}
