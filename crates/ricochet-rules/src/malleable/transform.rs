//! Reversible decoding of beacon data transforms.
//!
//! A transform list describes how the beacon encoded its metadata, in
//! encoding order, ending with a sink function naming where the result was
//! placed (`header`, `parameter`, `print`, `uri-append`). Verification runs
//! the list backwards: each step must consume the structure it expects or the
//! decode fails.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use tracing::warn;

use crate::error::RuleError;

/// One profile function with its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transform {
    pub func: String,
    pub args: Vec<String>,
}

impl Transform {
    pub fn new(func: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            func: func.into(),
            args,
        }
    }
}

/// Run the non-sink steps of `transforms` backwards over `data`.
///
/// Returns `true` when every step consumed cleanly and the original buffer
/// was non-empty. Unknown steps are logged and skipped.
pub fn decode_chain(data: &[u8], transforms: &[Transform]) -> bool {
    let Some(steps) = transforms.len().checked_sub(1).map(|n| &transforms[..n]) else {
        return false;
    };

    let mut buf = data.to_vec();
    for step in steps.iter().rev() {
        match step.func.as_str() {
            "append" => {
                let [suffix] = step.args.as_slice() else {
                    return false;
                };
                if !buf.ends_with(suffix.as_bytes()) {
                    return false;
                }
                buf.truncate(buf.len() - suffix.len());
            }
            "prepend" => {
                let [prefix] = step.args.as_slice() else {
                    return false;
                };
                if !buf.starts_with(prefix.as_bytes()) {
                    return false;
                }
                buf.drain(..prefix.len());
            }
            "base64" => match STANDARD.decode(&buf) {
                Ok(decoded) => buf = decoded,
                Err(_) => return false,
            },
            "base64url" => match URL_SAFE_NO_PAD.decode(&buf) {
                Ok(decoded) => buf = decoded,
                Err(_) => return false,
            },
            "mask" => {
                // 4-byte XOR key, at least 1 byte of ciphertext
                if buf.len() < 5 {
                    return false;
                }
                let (key, data) = buf.split_at(4);
                buf = xor_decrypt(key, data);
            }
            "netbios" => match netbios_decode(&buf, b'a') {
                Ok(decoded) => buf = decoded,
                Err(_) => return false,
            },
            "netbiosu" => match netbios_decode(&buf, b'A') {
                Ok(decoded) => buf = decoded,
                Err(_) => return false,
            },
            other => warn!(step = %other, "unknown encoding, skipping"),
        }
    }

    !data.is_empty()
}

/// XOR with a repeating key.
pub fn xor_decrypt(key: &[u8], data: &[u8]) -> Vec<u8> {
    data.iter()
        .enumerate()
        .map(|(i, b)| b ^ key[i % key.len()])
        .collect()
}

/// Decode netbios encoding: two alphabet bytes per output byte.
///
/// `base` is `b'a'` for `netbios`, `b'A'` for `netbiosu`. Any byte outside
/// the 26-letter alphabet of the chosen case fails with `CaseMismatch`.
pub fn netbios_decode(data: &[u8], base: u8) -> Result<Vec<u8>, RuleError> {
    if data.is_empty() || data.len() % 2 != 0 {
        return Err(RuleError::OddOrZero);
    }
    if data.iter().any(|&b| b < base || b > base + 25) {
        return Err(RuleError::CaseMismatch);
    }
    Ok(data
        .chunks_exact(2)
        .map(|pair| ((pair[0] - base) << 4) | ((pair[1] - base) & 0xF))
        .collect())
}

/// Inverse of [`netbios_decode`], used by tests and profile tooling.
pub fn netbios_encode(data: &[u8], base: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 2);
    for &b in data {
        out.push(base + (b >> 4));
        out.push(base + (b & 0xF));
    }
    out
}

/// 8-bit byte-sum checksum used by the stager URL heuristic.
pub fn checksum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Wildcard match where `*` anchors at the start and/or end of the mask.
pub fn match_by_mask(s: &str, mask: &str) -> bool {
    if mask.is_empty() {
        return s.is_empty();
    }
    let start = mask.starts_with('*');
    let end = mask.ends_with('*') && mask.len() > 1;
    match (start, end) {
        (true, true) => s.contains(&mask[1..mask.len() - 1]),
        (true, false) => s.ends_with(&mask[1..]),
        (false, true) => s.starts_with(&mask[..mask.len() - 1]),
        (false, false) => s == mask,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(func: &str, args: &[&str]) -> Transform {
        Transform::new(func, args.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn netbios_round_trips() {
        for input in [&b"m"[..], b"metadata blob", &[0u8, 0x7f, 0x10]] {
            let encoded = netbios_encode(input, b'a');
            assert_eq!(netbios_decode(&encoded, b'a').unwrap(), input);
            let encoded = netbios_encode(input, b'A');
            assert_eq!(netbios_decode(&encoded, b'A').unwrap(), input);
        }
    }

    #[test]
    fn netbios_rejects_odd_and_empty() {
        assert!(matches!(
            netbios_decode(b"", b'a'),
            Err(RuleError::OddOrZero)
        ));
        assert!(matches!(
            netbios_decode(b"abc", b'a'),
            Err(RuleError::OddOrZero)
        ));
    }

    #[test]
    fn netbios_rejects_wrong_case() {
        assert!(matches!(
            netbios_decode(b"AB", b'a'),
            Err(RuleError::CaseMismatch)
        ));
        assert!(matches!(
            netbios_decode(b"ab", b'A'),
            Err(RuleError::CaseMismatch)
        ));
        assert!(matches!(
            netbios_decode(b"a1", b'a'),
            Err(RuleError::CaseMismatch)
        ));
    }

    #[test]
    fn decode_chain_reverses_encoding_order() {
        // encode: base64, then prepend "pre", then append "post"
        let encoded = format!(
            "pre{}post",
            base64::engine::general_purpose::STANDARD.encode(b"m")
        );
        let transforms = vec![
            t("base64", &[]),
            t("prepend", &["pre"]),
            t("append", &["post"]),
            t("header", &["Cookie"]),
        ];
        assert!(decode_chain(encoded.as_bytes(), &transforms));
        assert!(!decode_chain(b"prebQ==oops", &transforms));
    }

    #[test]
    fn decode_chain_mask() {
        let key = [1u8, 2, 3, 4];
        let plain = b"hello";
        let mut buf: Vec<u8> = key.to_vec();
        buf.extend(xor_decrypt(&key, plain));
        let transforms = vec![t("mask", &[]), t("print", &[])];
        assert!(decode_chain(&buf, &transforms));
        assert!(!decode_chain(&[1, 2, 3, 4], &transforms));
    }

    #[test]
    fn decode_chain_base64url() {
        let encoded = URL_SAFE_NO_PAD.encode(b"\xfb\xff data");
        let transforms = vec![t("base64url", &[]), t("uri-append", &[])];
        assert!(decode_chain(encoded.as_bytes(), &transforms));
    }

    #[test]
    fn empty_input_never_decodes() {
        let transforms = vec![t("print", &[])];
        assert!(!decode_chain(b"", &transforms));
    }

    #[test]
    fn unknown_step_is_a_no_op() {
        let transforms = vec![t("rot13", &[]), t("print", &[])];
        assert!(decode_chain(b"data", &transforms));
    }

    #[test]
    fn checksum8_wraps() {
        assert_eq!(checksum8(b""), 0);
        assert_eq!(checksum8(&[200, 100]), 44);
    }

    #[test]
    fn mask_matching() {
        assert!(match_by_mask("curl/8.0", "curl*"));
        assert!(match_by_mask("x-curl", "*curl"));
        assert!(match_by_mask("a curl b", "*curl*"));
        assert!(match_by_mask("exact", "exact"));
        assert!(!match_by_mask("curl", "lynx*"));
    }
}
