//! Time-based one-time passwords for the second-factor retry loop.
//!
//! Standard RFC 6238 TOTP: HMAC-SHA1 over a 30-second counter, six
//! digits, base32 secret.

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use sha1::Sha1;

/// TOTP step length in seconds.
const STEP_SECONDS: u64 = 30;

/// Output length in digits.
const DIGITS: u32 = 6;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TotpError {
    #[error("TOTP secret is not valid base32")]
    BadSecret,
}

/// Generate the code for `unix_seconds` from a base32 secret.
///
/// Secrets are accepted the way authenticator apps hand them out: mixed
/// case, optional spaces, optional trailing padding.
pub fn generate(secret_base32: &str, unix_seconds: u64) -> Result<String, TotpError> {
    let normalized: String = secret_base32
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let secret = BASE32_NOPAD
        .decode(normalized.as_bytes())
        .map_err(|_| TotpError::BadSecret)?;

    let counter = unix_seconds / STEP_SECONDS;

    let mut mac =
        Hmac::<Sha1>::new_from_slice(&secret).map_err(|_| TotpError::BadSecret)?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    // Dynamic truncation per RFC 4226 §5.3.
    let offset = (digest[19] & 0x0F) as usize;
    let binary = (u32::from(digest[offset]) & 0x7F) << 24
        | u32::from(digest[offset + 1]) << 16
        | u32::from(digest[offset + 2]) << 8
        | u32::from(digest[offset + 3]);
    let code = binary % 10u32.pow(DIGITS);

    Ok(format!("{code:06}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// RFC 6238 appendix B SHA-1 secret, base32-encoded
    /// ("12345678901234567890").
    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn matches_rfc6238_sha1_vectors() {
        // The RFC lists 8-digit codes; the 6-digit code is its suffix.
        let vectors = [
            (59u64, "287082"),
            (1_111_111_109, "081804"),
            (1_111_111_111, "050471"),
            (1_234_567_890, "005924"),
            (2_000_000_000, "279037"),
            (20_000_000_000, "353130"),
        ];
        for (time, expected) in vectors {
            assert_eq!(generate(RFC_SECRET, time).unwrap(), expected, "t={time}");
        }
    }

    #[test]
    fn codes_are_stable_within_a_step() {
        let a = generate(RFC_SECRET, 60).unwrap();
        let b = generate(RFC_SECRET, 89).unwrap();
        let c = generate(RFC_SECRET, 90).unwrap();
        assert_eq!(a, b);
        assert_ne!(b, c);
    }

    #[test]
    fn secrets_are_normalized() {
        let spaced = "gezd gnbv gy3t qojq gezd gnbv gy3t qojq";
        assert_eq!(generate(spaced, 59).unwrap(), "287082");

        let padded = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ====";
        assert_eq!(generate(padded, 59).unwrap(), "287082");
    }

    #[test]
    fn garbage_secret_is_rejected() {
        assert_eq!(generate("not!base32", 0), Err(TotpError::BadSecret));
    }
}
