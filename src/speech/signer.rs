//! # Connection URL Signing
//!
//! The recognizer authenticates the WebSocket upgrade through query parameters
//! instead of headers. The signature covers the host, the date and the request
//! line, so a URL is only valid for a short window around `date`.

use super::{Credential, Endpoint};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Format a timestamp as an RFC 1123 date (`Tue, 14 May 2024 08:30:00 GMT`).
pub fn rfc1123_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Build the signed connection URL for `endpoint` at `date`.
///
/// Pure: identical inputs always give the identical URL.
pub fn sign_url(credential: &Credential, endpoint: &Endpoint, date: &str) -> Result<String, InvalidLength> {
    let authorization = authorization(credential, &endpoint.host, &endpoint.path, date)?;

    Ok(format!(
        "{}?authorization={}&date={}&host={}",
        endpoint.base_url(),
        urlencoding::encode(&authorization),
        urlencoding::encode(date),
        urlencoding::encode(&endpoint.host),
    ))
}

/// The base64 `authorization` query value.
///
/// HMAC accepts keys of any length, so the error case is unreachable in practice.
pub fn authorization(credential: &Credential, host: &str, path: &str, date: &str) -> Result<String, InvalidLength> {
    let signature_origin = format!("host: {}\ndate: {}\nGET {} HTTP/1.1", host, date, path);

    let mut mac = HmacSha256::new_from_slice(credential.api_secret.as_bytes())?;
    mac.update(signature_origin.as_bytes());
    let signature = BASE64.encode(mac.finalize().into_bytes());

    let authorization_origin = format!(
        "api_key=\"{}\", algorithm=\"hmac-sha256\", headers=\"host date request-line\", signature=\"{}\"",
        credential.api_key, signature
    );

    Ok(BASE64.encode(authorization_origin.as_bytes()))
}
