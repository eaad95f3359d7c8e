use axum::http::{HeaderMap, header};
use base64::Engine as _;

/// Credentials carried in an `Authorization: Basic` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    /// Raw password bytes; not required to be UTF-8.
    pub password: Vec<u8>,
}

/// Parse HTTP Basic credentials from `headers`.
///
/// Returns `None` when the header is absent, uses another scheme, or is not
/// valid base64 `user:password`.
pub fn parse_basic_auth(headers: &HeaderMap) -> Option<BasicCredentials> {
    let value = headers.get(header::AUTHORIZATION)?.as_bytes();
    let (scheme, encoded) = value.split_at_checked(6)?;
    if !scheme.eq_ignore_ascii_case(b"basic ") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim_ascii())
        .ok()?;
    let colon = decoded.iter().position(|&b| b == b':')?;
    Some(BasicCredentials {
        username: String::from_utf8_lossy(&decoded[..colon]).into_owned(),
        password: decoded[colon + 1..].to_vec(),
    })
}
