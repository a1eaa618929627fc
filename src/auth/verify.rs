//! Shared-secret verification for inbound webhooks.
//!
//! Monzo webhooks carry no signature, so the sender proves itself with a
//! shared secret: the `X-Webhook-Secret` header, or (when enabled) the
//! `secret_key` query parameter for webhook URLs registered before the
//! header was supported.

use std::collections::HashMap;

use crate::error::BotError;

pub const SECRET_HEADER: &str = "X-Webhook-Secret";
pub const SECRET_QUERY_PARAM: &str = "secret_key";

/// Accept if the header secret matches, or the query secret matches and
/// query-secret mode is enabled. Header names are matched case-insensitively.
pub fn verify_webhook_secret(
    headers: &HashMap<String, String>,
    query: &HashMap<String, String>,
    expected: &str,
    allow_query_secret: bool,
) -> Result<(), BotError> {
    if expected.is_empty() {
        tracing::warn!("[Webhook] WEBHOOK_SECRET not set, rejecting all webhooks");
        return Err(BotError::Authentication);
    }

    let header_ok = header(headers, SECRET_HEADER)
        .map(|provided| constant_time_eq(provided.as_bytes(), expected.as_bytes()))
        .unwrap_or(false);

    let query_ok = allow_query_secret
        && query
            .get(SECRET_QUERY_PARAM)
            .map(|provided| constant_time_eq(provided.as_bytes(), expected.as_bytes()))
            .unwrap_or(false);

    if header_ok || query_ok {
        Ok(())
    } else {
        Err(BotError::Authentication)
    }
}

fn header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
