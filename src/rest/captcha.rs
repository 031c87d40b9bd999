//! Captcha challenge handling for the request pipeline.

use async_trait::async_trait;
use serde::Deserialize;

/// Challenge keys the server sends for failures that a fresh solve can
/// fix. Anything outside this set surfaces as an API error instead of
/// burning solver retries.
const RETRYABLE_KEYS: [&str; 9] = [
    "incorrect-captcha",
    "response-already-used",
    "captcha-required",
    "invalid-input-response",
    "invalid-response",
    "needs-update",
    "response-already-used-error",
    "rqkey-mismatch",
    "sitekey-secret-mismatch",
];

/// A captcha challenge extracted from a 4xx error body.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CaptchaChallenge {
    pub captcha_key: Vec<String>,
    #[serde(default)]
    pub captcha_sitekey: Option<String>,
    #[serde(default)]
    pub captcha_service: Option<String>,
    #[serde(default)]
    pub captcha_rqdata: Option<String>,
    #[serde(default)]
    pub captcha_rqtoken: Option<String>,
}

impl CaptchaChallenge {
    /// Pull a challenge out of an error body, if one is present.
    pub fn from_body(body: &serde_json::Value) -> Option<Self> {
        if body.get("captcha_key").is_none() {
            return None;
        }
        serde_json::from_value(body.clone()).ok()
    }

    /// Whether every reported key is one a new solve can clear.
    pub fn is_retryable(&self) -> bool {
        !self.captcha_key.is_empty()
            && self
                .captcha_key
                .iter()
                .all(|key| RETRYABLE_KEYS.contains(&key.as_str()))
    }
}

/// A solved challenge, attached to the retried request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaSolution {
    /// Goes out as `X-Captcha-Key`.
    pub key: String,
    /// Goes out as `X-Captcha-Rqtoken` when the challenge carried one.
    pub rqtoken: Option<String>,
}

/// Caller-supplied captcha solving service.
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    /// Solve a challenge; the returned key is attached to the retried
    /// request. Errors abort the retry loop and surface the original API
    /// error.
    async fn solve(
        &self,
        challenge: &CaptchaChallenge,
        user_agent: &str,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn challenge_parses_from_error_body() {
        let body = json!({
            "captcha_key": ["captcha-required"],
            "captcha_sitekey": "site-123",
            "captcha_service": "hcaptcha",
            "captcha_rqdata": "rq-data",
            "captcha_rqtoken": "rq-token",
        });
        let challenge = CaptchaChallenge::from_body(&body).expect("challenge present");
        assert_eq!(challenge.captcha_key, vec!["captcha-required"]);
        assert_eq!(challenge.captcha_sitekey.as_deref(), Some("site-123"));
        assert_eq!(challenge.captcha_rqtoken.as_deref(), Some("rq-token"));
        assert!(challenge.is_retryable());
    }

    #[test]
    fn bodies_without_challenges_yield_none() {
        let body = json!({"code": 50013, "message": "Missing Permissions"});
        assert_eq!(CaptchaChallenge::from_body(&body), None);
    }

    #[test]
    fn every_known_key_is_retryable() {
        for key in RETRYABLE_KEYS {
            let challenge = CaptchaChallenge {
                captcha_key: vec![key.to_owned()],
                captcha_sitekey: None,
                captcha_service: None,
                captcha_rqdata: None,
                captcha_rqtoken: None,
            };
            assert!(challenge.is_retryable(), "{key} should be retryable");
        }
    }

    #[test]
    fn unknown_keys_are_not_retryable() {
        let challenge = CaptchaChallenge {
            captcha_key: vec!["captcha-required".into(), "you-are-banned".into()],
            captcha_sitekey: None,
            captcha_service: None,
            captcha_rqdata: None,
            captcha_rqtoken: None,
        };
        assert!(!challenge.is_retryable());

        let empty = CaptchaChallenge {
            captcha_key: vec![],
            captcha_sitekey: None,
            captcha_service: None,
            captcha_rqdata: None,
            captcha_rqtoken: None,
        };
        assert!(!empty.is_retryable());
    }
}
