use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;

use crate::api::BrokerError;

/// Validates the `Authorization: Bearer <token>` header against the
/// configured secret. Runs before any allowlist or runtime interaction.
pub fn verify_bearer(headers: &HeaderMap, expected: &str) -> Result<(), BrokerError> {
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(BrokerError::Authentication)?;

    if constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(BrokerError::Authentication)
    }
}

/// Comparison time must not depend on where the tokens diverge. Length is
/// folded into the accumulator so a length mismatch takes the same path.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= usize::from(x ^ y);
    }
    diff == 0
}
