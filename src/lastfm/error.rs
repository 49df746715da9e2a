use thiserror::Error;

/// Last.fm API error codes worth retrying: operation failed (8), service
/// offline (11), temporarily unavailable (16), rate limit exceeded (29).
const TRANSIENT_API_CODES: [i64; 4] = [8, 11, 16, 29];

#[derive(Debug, Error)]
pub enum LastfmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {status}")]
    HttpStatus { status: u16 },

    #[error("Last.fm error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("Unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid client configuration: {0}")]
    Config(String),
}

impl LastfmError {
    pub fn is_retryable(&self) -> bool {
        match self {
            LastfmError::Http(e) => !e.is_builder(),
            LastfmError::HttpStatus { status } => *status == 429 || *status >= 500,
            LastfmError::Api { code, .. } => TRANSIENT_API_CODES.contains(code),
            LastfmError::Decode(_) => false,
            LastfmError::Config(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(code: i64) -> LastfmError {
        LastfmError::Api {
            code,
            message: String::new(),
        }
    }

    #[test]
    fn test_rate_limit_and_server_errors_retryable() {
        assert!(LastfmError::HttpStatus { status: 429 }.is_retryable());
        assert!(LastfmError::HttpStatus { status: 500 }.is_retryable());
        assert!(LastfmError::HttpStatus { status: 503 }.is_retryable());
    }

    #[test]
    fn test_client_errors_not_retryable() {
        assert!(!LastfmError::HttpStatus { status: 400 }.is_retryable());
        assert!(!LastfmError::HttpStatus { status: 404 }.is_retryable());
    }

    #[test]
    fn test_transient_api_codes() {
        for code in [8, 11, 16, 29] {
            assert!(api(code).is_retryable(), "code {}", code);
        }
        // invalid API key, user not found
        assert!(!api(10).is_retryable());
        assert!(!api(6).is_retryable());
    }

    #[test]
    fn test_decode_and_config_not_retryable() {
        let decode = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(!LastfmError::Decode(decode).is_retryable());
        assert!(!LastfmError::Config("empty key".into()).is_retryable());
    }
}
