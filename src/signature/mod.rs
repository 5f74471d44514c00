//! Signed webhook verification
//!
//! Carrier webhooks carry either an Ed25519 signature or an HMAC-SHA256
//! digest over `"{timestamp}.{raw_body}"`, plus the timestamp header. A
//! request is accepted only when both headers are present, the timestamp is
//! within the skew window, and the signature verifies. All byte comparisons
//! are constant-time. A dev override may skip verification, and the outcome
//! always says whether it did.

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted |now - timestamp|
pub const MAX_SKEW_SECS: i64 = 300;

/// Which algorithm signed the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    Ed25519,
    HmacSha256,
}

/// Verification verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Signature checked out. `skipped` is true only under the dev override.
    Valid { skipped: bool },
    Invalid { reason: String },
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verdict::Valid { .. })
    }
}

/// Configured verifier for one deployment
pub struct WebhookVerifier {
    ed25519_key: Option<VerifyingKey>,
    hmac_secret: Option<Vec<u8>>,
    skip: bool,
}

impl WebhookVerifier {
    pub fn new(
        public_key: Option<&str>,
        hmac_secret: Option<&str>,
        skip: bool,
    ) -> Result<Self> {
        let ed25519_key = public_key
            .map(parse_ed25519_public_key)
            .transpose()
            .context("TELNYX_PUBLIC_KEY")?;
        if skip {
            warn!("webhook signature verification is DISABLED (dev override)");
        }
        Ok(Self {
            ed25519_key,
            hmac_secret: hmac_secret.map(|s| s.as_bytes().to_vec()),
            skip,
        })
    }

    /// Verify one webhook request.
    ///
    /// `now_secs` is the current unix time; injected for determinism.
    pub fn verify(
        &self,
        raw_body: &[u8],
        signature: &str,
        timestamp: &str,
        scheme: SignatureScheme,
        now_secs: i64,
    ) -> Verdict {
        if self.skip {
            return Verdict::Valid { skipped: true };
        }

        let signature = signature.trim();
        let timestamp = timestamp.trim();
        if signature.is_empty() || timestamp.is_empty() {
            return Verdict::Invalid {
                reason: "missing signature or timestamp header".into(),
            };
        }

        let ts_secs = match normalize_timestamp(timestamp) {
            Ok(ts) => ts,
            Err(e) => {
                return Verdict::Invalid {
                    reason: format!("bad timestamp: {e}"),
                }
            }
        };
        let skew = (now_secs - ts_secs).abs();
        if skew > MAX_SKEW_SECS {
            return Verdict::Invalid {
                reason: format!("timestamp skew {skew}s exceeds {MAX_SKEW_SECS}s"),
            };
        }

        // Signed message is the timestamp header string, a dot, the body
        let mut message = Vec::with_capacity(timestamp.len() + 1 + raw_body.len());
        message.extend_from_slice(timestamp.as_bytes());
        message.push(b'.');
        message.extend_from_slice(raw_body);

        let outcome = match scheme {
            SignatureScheme::Ed25519 => self.verify_ed25519(&message, signature),
            SignatureScheme::HmacSha256 => self.verify_hmac(&message, signature),
        };
        match outcome {
            Ok(()) => Verdict::Valid { skipped: false },
            Err(e) => {
                debug!(error = %e, "webhook signature rejected");
                Verdict::Invalid {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn verify_ed25519(&self, message: &[u8], signature_b64: &str) -> Result<()> {
        let key = self
            .ed25519_key
            .as_ref()
            .ok_or_else(|| anyhow!("no ed25519 public key configured"))?;
        let sig_bytes = BASE64
            .decode(signature_b64)
            .context("signature is not base64")?;
        let sig_bytes: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| anyhow!("ed25519 signature must be 64 bytes"))?;
        let signature = Signature::from_bytes(&sig_bytes);
        key.verify(message, &signature)
            .map_err(|_| anyhow!("ed25519 verification failed"))
    }

    fn verify_hmac(&self, message: &[u8], signature: &str) -> Result<()> {
        let secret = self
            .hmac_secret
            .as_ref()
            .ok_or_else(|| anyhow!("no hmac secret configured"))?;
        let provided = decode_hex_or_base64(signature)?;

        let mut mac = HmacSha256::new_from_slice(secret).context("hmac init")?;
        mac.update(message);
        let expected = mac.finalize().into_bytes();

        if expected.ct_eq(provided.as_slice()).into() {
            Ok(())
        } else {
            bail!("hmac verification failed")
        }
    }
}

/// Seconds or milliseconds since epoch, as a string, normalized to seconds
fn normalize_timestamp(raw: &str) -> Result<i64> {
    let value: i64 = raw.parse().context("timestamp is not an integer")?;
    // Anything past the year 33658 in seconds is clearly milliseconds
    if value > 100_000_000_000 {
        Ok(value / 1000)
    } else {
        Ok(value)
    }
}

fn decode_hex_or_base64(s: &str) -> Result<Vec<u8>> {
    if let Ok(bytes) = hex::decode(s) {
        return Ok(bytes);
    }
    BASE64
        .decode(s)
        .context("signature is neither hex nor base64")
}

/// Accept the public key as PEM, raw DER (SPKI), base64, or hex
fn parse_ed25519_public_key(raw: &str) -> Result<VerifyingKey> {
    let raw = raw.trim();

    let der_or_raw: Vec<u8> = if raw.contains("BEGIN PUBLIC KEY") {
        let body: String = raw
            .lines()
            .filter(|l| !l.starts_with("-----"))
            .collect::<Vec<_>>()
            .join("");
        BASE64.decode(body.trim()).context("pem body is not base64")?
    } else if let Ok(bytes) = hex::decode(raw) {
        bytes
    } else {
        BASE64
            .decode(raw)
            .context("public key is neither pem, hex, nor base64")?
    };

    // Raw 32-byte key, or an SPKI envelope whose last 32 bytes are the key
    let key_bytes: [u8; 32] = if der_or_raw.len() == 32 {
        der_or_raw.as_slice().try_into().expect("length checked")
    } else if der_or_raw.len() > 32 {
        der_or_raw[der_or_raw.len() - 32..]
            .try_into()
            .expect("length checked")
    } else {
        bail!("ed25519 public key too short: {} bytes", der_or_raw.len());
    };

    VerifyingKey::from_bytes(&key_bytes).context("invalid ed25519 public key")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    const NOW: i64 = 1_700_000_000;

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    fn verifier_ed25519() -> WebhookVerifier {
        let vk = signing_key().verifying_key();
        let key_b64 = BASE64.encode(vk.as_bytes());
        WebhookVerifier::new(Some(&key_b64), None, false).unwrap()
    }

    fn sign(body: &[u8], ts: i64) -> String {
        let mut msg = format!("{ts}.").into_bytes();
        msg.extend_from_slice(body);
        BASE64.encode(signing_key().sign(&msg).to_bytes())
    }

    #[test]
    fn test_valid_ed25519_signature() {
        let v = verifier_ed25519();
        let body = br#"{"data":{"event_type":"call.initiated"}}"#;
        let sig = sign(body, NOW);
        let verdict = v.verify(body, &sig, &NOW.to_string(), SignatureScheme::Ed25519, NOW);
        assert_eq!(verdict, Verdict::Valid { skipped: false });
    }

    #[test]
    fn test_tampered_body_rejected() {
        let v = verifier_ed25519();
        let sig = sign(b"original", NOW);
        let verdict = v.verify(b"tampered", &sig, &NOW.to_string(), SignatureScheme::Ed25519, NOW);
        assert!(!verdict.is_valid());
    }

    #[test]
    fn test_skew_at_exactly_300_accepted_301_rejected() {
        let v = verifier_ed25519();
        let body = b"x";

        let ts = NOW - 300;
        let verdict = v.verify(body, &sign(body, ts), &ts.to_string(), SignatureScheme::Ed25519, NOW);
        assert!(verdict.is_valid());

        let ts = NOW - 301;
        let verdict = v.verify(body, &sign(body, ts), &ts.to_string(), SignatureScheme::Ed25519, NOW);
        assert!(!verdict.is_valid());
    }

    #[test]
    fn test_millisecond_timestamps_normalized() {
        let v = verifier_ed25519();
        let body = b"x";
        // Signed with the millisecond string, as some senders do
        let ts_ms = NOW * 1000;
        let mut msg = format!("{ts_ms}.").into_bytes();
        msg.extend_from_slice(body);
        let sig = BASE64.encode(signing_key().sign(&msg).to_bytes());
        let verdict = v.verify(body, &sig, &ts_ms.to_string(), SignatureScheme::Ed25519, NOW);
        assert!(verdict.is_valid());
    }

    #[test]
    fn test_missing_headers_rejected() {
        let v = verifier_ed25519();
        assert!(!v.verify(b"x", "", &NOW.to_string(), SignatureScheme::Ed25519, NOW).is_valid());
        assert!(!v.verify(b"x", "sig", "", SignatureScheme::Ed25519, NOW).is_valid());
    }

    #[test]
    fn test_non_integer_timestamp_rejected() {
        let v = verifier_ed25519();
        let verdict = v.verify(b"x", "c2ln", "yesterday", SignatureScheme::Ed25519, NOW);
        assert!(!verdict.is_valid());
    }

    #[test]
    fn test_hmac_roundtrip() {
        let v = WebhookVerifier::new(None, Some("shared-secret"), false).unwrap();
        let body = b"payload";
        let mut mac = HmacSha256::new_from_slice(b"shared-secret").unwrap();
        mac.update(format!("{NOW}.").as_bytes());
        mac.update(body);
        let sig_hex = hex::encode(mac.finalize().into_bytes());

        let verdict = v.verify(body, &sig_hex, &NOW.to_string(), SignatureScheme::HmacSha256, NOW);
        assert_eq!(verdict, Verdict::Valid { skipped: false });

        let verdict = v.verify(
            b"other",
            &sig_hex,
            &NOW.to_string(),
            SignatureScheme::HmacSha256,
            NOW,
        );
        assert!(!verdict.is_valid());
    }

    #[test]
    fn test_hmac_accepts_base64_signature() {
        let v = WebhookVerifier::new(None, Some("s3cret"), false).unwrap();
        let body = b"data";
        let mut mac = HmacSha256::new_from_slice(b"s3cret").unwrap();
        mac.update(format!("{NOW}.").as_bytes());
        mac.update(body);
        let sig_b64 = BASE64.encode(mac.finalize().into_bytes());
        let verdict = v.verify(body, &sig_b64, &NOW.to_string(), SignatureScheme::HmacSha256, NOW);
        assert!(verdict.is_valid());
    }

    #[test]
    fn test_skip_reports_skipped() {
        let v = WebhookVerifier::new(None, None, true).unwrap();
        let verdict = v.verify(b"x", "junk", "0", SignatureScheme::Ed25519, NOW);
        assert_eq!(verdict, Verdict::Valid { skipped: true });
    }

    #[test]
    fn test_key_parsing_formats_agree() {
        let vk = signing_key().verifying_key();
        let raw = vk.as_bytes();

        let from_hex = parse_ed25519_public_key(&hex::encode(raw)).unwrap();
        let from_b64 = parse_ed25519_public_key(&BASE64.encode(raw)).unwrap();
        let pem = format!(
            "-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----",
            BASE64.encode(spki_wrap(raw))
        );
        let from_pem = parse_ed25519_public_key(&pem).unwrap();

        assert_eq!(from_hex.as_bytes(), raw);
        assert_eq!(from_b64.as_bytes(), raw);
        assert_eq!(from_pem.as_bytes(), raw);
    }

    /// Minimal SPKI envelope for an Ed25519 key
    fn spki_wrap(key: &[u8; 32]) -> Vec<u8> {
        let mut der = vec![
            0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
        ];
        der.extend_from_slice(key);
        der
    }
}
