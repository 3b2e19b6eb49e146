use axum::http::{header, HeaderMap};
use base64::{engine::general_purpose::STANDARD, Engine};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// `Authorization` header value for these credentials.
    pub fn header_value(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", STANDARD.encode(raw))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing authorization header")]
    Missing,
    #[error("authorization header is not valid basic auth")]
    Malformed,
    #[error("credentials rejected")]
    Rejected,
}

impl AuthError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            AuthError::Missing => "missing",
            AuthError::Malformed => "malformed",
            AuthError::Rejected => "rejected",
        }
    }
}

/// Basic-auth gate in front of both websocket endpoints. With no expected
/// credentials the gate is open.
pub fn authorize(headers: &HeaderMap, expected: Option<&Credentials>) -> Result<(), AuthError> {
    let Some(expected) = expected else {
        return Ok(());
    };

    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::Missing)?
        .to_str()
        .map_err(|_| AuthError::Malformed)?;
    let encoded = value
        .strip_prefix("Basic ")
        .ok_or(AuthError::Malformed)?
        .trim();
    let decoded = STANDARD
        .decode(encoded)
        .map_err(|_| AuthError::Malformed)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthError::Malformed)?;
    let (username, password) = decoded.split_once(':').ok_or(AuthError::Malformed)?;

    if username == expected.username && password == expected.password {
        Ok(())
    } else {
        Err(AuthError::Rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn open_gate_without_configured_credentials() {
        assert_eq!(authorize(&HeaderMap::new(), None), Ok(()));
    }

    #[test]
    fn accepts_matching_basic_credentials() {
        let creds = Credentials::new("aura", "s3cret:with:colons");
        assert_eq!(authorize(&headers(&creds.header_value()), Some(&creds)), Ok(()));
    }

    #[test]
    fn rejects_missing_malformed_and_wrong_credentials() {
        let creds = Credentials::new("aura", "pw");
        assert_eq!(
            authorize(&HeaderMap::new(), Some(&creds)),
            Err(AuthError::Missing)
        );
        assert_eq!(
            authorize(&headers("Bearer abc"), Some(&creds)),
            Err(AuthError::Malformed)
        );
        assert_eq!(
            authorize(&headers("Basic !!!"), Some(&creds)),
            Err(AuthError::Malformed)
        );
        let wrong = Credentials::new("aura", "nope").header_value();
        assert_eq!(
            authorize(&headers(&wrong), Some(&creds)),
            Err(AuthError::Rejected)
        );
    }
}
