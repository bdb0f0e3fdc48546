//! Time-based one-time password generation (RFC 6238).
//!
//! Exposed as the `generate_totp` tool so agents can authenticate against
//! targets that enforce two-factor login. Secrets arrive base32-encoded
//! (the otpauth convention); HMAC-SHA1 is the RFC default.

use super::{ToolContext, ToolHandler, ToolOutcome, ToolRegistry};
use crate::errors::KernelError;
use async_trait::async_trait;
use ring::hmac;
use serde_json::json;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

const DEFAULT_DIGITS: u32 = 6;
const DEFAULT_PERIOD: u64 = 30;

pub fn register(registry: &mut ToolRegistry) -> Result<(), KernelError> {
    registry.register(
        "generate_totp",
        "Generate an RFC 6238 time-based one-time password from a base32 secret.",
        json!({
            "type": "object",
            "properties": {
                "secret": {"type": "string", "description": "Base32-encoded shared secret"},
                "digits": {"type": "integer", "description": "Code length, default 6"},
                "period": {"type": "integer", "description": "Time step in seconds, default 30"}
            },
            "required": ["secret"]
        }),
        Arc::new(TotpTool),
    )
}

struct TotpTool;

#[async_trait]
impl ToolHandler for TotpTool {
    async fn call(&self, args: serde_json::Value, _ctx: &ToolContext) -> ToolOutcome {
        let secret = args["secret"].as_str().unwrap_or_default();
        let digits = args["digits"].as_u64().unwrap_or(DEFAULT_DIGITS as u64) as u32;
        let period = args["period"].as_u64().unwrap_or(DEFAULT_PERIOD);
        if !(6..=8).contains(&digits) {
            return ToolOutcome::error("digits must be between 6 and 8");
        }
        if period == 0 {
            return ToolOutcome::error("period must be greater than zero");
        }
        let key = match base32_decode(secret) {
            Some(key) if !key.is_empty() => key,
            _ => return ToolOutcome::error("secret is not valid base32"),
        };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let code = totp(&key, now, period, digits);
        let remaining = period - (now % period);
        ToolOutcome::ok(json!({
            "code": code,
            "valid_for_secs": remaining
        }))
    }
}

/// HOTP (RFC 4226): HMAC-SHA1 over the big-endian counter, dynamic
/// truncation, modulo 10^digits.
pub fn hotp(key: &[u8], counter: u64, digits: u32) -> String {
    let tag_key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, key);
    let tag = hmac::sign(&tag_key, &counter.to_be_bytes());
    let bytes = tag.as_ref();

    let offset = (bytes[bytes.len() - 1] & 0x0f) as usize;
    let binary = ((bytes[offset] as u32 & 0x7f) << 24)
        | ((bytes[offset + 1] as u32) << 16)
        | ((bytes[offset + 2] as u32) << 8)
        | (bytes[offset + 3] as u32);
    let code = binary % 10u32.pow(digits);
    format!("{code:0width$}", width = digits as usize)
}

/// TOTP (RFC 6238): HOTP over the floored time-step counter.
pub fn totp(key: &[u8], unix_time: u64, period: u64, digits: u32) -> String {
    hotp(key, unix_time / period, digits)
}

/// Decode RFC 4648 base32 (case-insensitive, padding optional).
pub fn base32_decode(input: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut bits: u32 = 0;
    let mut bit_count: u32 = 0;
    let mut out = Vec::new();
    for c in input.chars() {
        if c == '=' || c == ' ' {
            continue;
        }
        let upper = c.to_ascii_uppercase() as u8;
        let value = ALPHABET.iter().position(|&a| a == upper)? as u32;
        bits = (bits << 5) | value;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push((bits >> bit_count) as u8);
            bits &= (1 << bit_count) - 1;
        }
    }
    Some(out)
}
