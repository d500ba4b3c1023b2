//! Webhook trigger authentication.
//!
//! Verifies inbound webhook requests against the trigger's declared
//! scheme: API key header comparison, HMAC-SHA256/SHA512 body signatures,
//! Basic credentials, or HS256 JWT bearer tokens. Secret material is
//! never part of the definition — only an opaque `secret_code` resolved
//! through the external [`SecretResolver`].

use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};

use batchflow_types::error::PipelineError;
use batchflow_types::trigger::{HmacAlgorithm, Trigger, WebhookAuthKind};

const DEFAULT_API_KEY_HEADER: &str = "x-api-key";
const DEFAULT_SIGNATURE_HEADER: &str = "x-signature";
const AUTHORIZATION_HEADER: &str = "authorization";

/// External secret store boundary.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// Resolve an opaque secret reference to its material.
    ///
    /// # Errors
    ///
    /// Unknown references and store failures.
    async fn resolve(&self, code: &str) -> Result<String, PipelineError>;
}

/// Fixed-map resolver for tests and single-process deployments.
#[derive(Default)]
pub struct StaticSecretResolver {
    secrets: HashMap<String, String>,
}

impl StaticSecretResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, code: impl Into<String>, secret: impl Into<String>) -> Self {
        self.secrets.insert(code.into(), secret.into());
        self
    }
}

#[async_trait]
impl SecretResolver for StaticSecretResolver {
    async fn resolve(&self, code: &str) -> Result<String, PipelineError> {
        self.secrets.get(code).cloned().ok_or_else(|| {
            PipelineError::configuration("UNKNOWN_SECRET", format!("no secret '{code}'"))
        })
    }
}

/// Verify an inbound webhook request against its trigger declaration.
///
/// # Errors
///
/// AUTHENTICATION errors on any mismatch; CONFIGURATION errors when the
/// trigger is not a webhook or lacks its secret reference.
pub async fn verify_webhook(
    trigger: &Trigger,
    headers: &HashMap<String, String>,
    body: &[u8],
    resolver: &dyn SecretResolver,
) -> Result<(), PipelineError> {
    let Trigger::Webhook {
        authentication,
        header,
        signature_header,
        algorithm,
        secret_code,
        ..
    } = trigger
    else {
        return Err(PipelineError::configuration(
            "NOT_A_WEBHOOK",
            "trigger is not a webhook trigger",
        ));
    };

    if *authentication == WebhookAuthKind::None {
        return Ok(());
    }

    let secret_code = secret_code.as_deref().ok_or_else(|| {
        PipelineError::configuration("MISSING_SECRET", "webhook trigger has no secret reference")
    })?;
    let secret = resolver.resolve(secret_code).await?;

    match authentication {
        WebhookAuthKind::None => Ok(()),
        WebhookAuthKind::ApiKey => {
            let header_name = header.as_deref().unwrap_or(DEFAULT_API_KEY_HEADER);
            let presented = require_header(headers, header_name)?;
            if constant_time_eq(presented.as_bytes(), secret.as_bytes()) {
                Ok(())
            } else {
                Err(auth_error("API_KEY_MISMATCH", "api key does not match"))
            }
        }
        WebhookAuthKind::Hmac => {
            let header_name = signature_header.as_deref().unwrap_or(DEFAULT_SIGNATURE_HEADER);
            let presented = require_header(headers, header_name)?;
            // Accept `sha256=<hex>` style prefixes alongside bare hex.
            let presented = presented
                .rsplit_once('=')
                .map_or(presented.as_str(), |(_, hex)| hex);
            let expected = compute_hmac_hex(*algorithm, secret.as_bytes(), body)?;
            if constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
                Ok(())
            } else {
                Err(auth_error("SIGNATURE_MISMATCH", "body signature does not match"))
            }
        }
        WebhookAuthKind::Basic => {
            let presented = require_header(headers, AUTHORIZATION_HEADER)?;
            let encoded = presented
                .strip_prefix("Basic ")
                .ok_or_else(|| auth_error("MALFORMED_BASIC", "expected Basic authorization"))?;
            let decoded = STANDARD
                .decode(encoded)
                .map_err(|_| auth_error("MALFORMED_BASIC", "invalid base64 credentials"))?;
            let decoded = String::from_utf8(decoded)
                .map_err(|_| auth_error("MALFORMED_BASIC", "credentials are not utf-8"))?;
            if constant_time_eq(decoded.as_bytes(), secret.as_bytes()) {
                Ok(())
            } else {
                Err(auth_error("BASIC_MISMATCH", "credentials do not match"))
            }
        }
        WebhookAuthKind::Jwt => {
            let header_name = header.as_deref().unwrap_or(AUTHORIZATION_HEADER);
            let presented = require_header(headers, header_name)?;
            let token = presented
                .strip_prefix("Bearer ")
                .unwrap_or(presented.as_str());
            verify_jwt_hs256(token, secret.as_bytes())
        }
    }
}

fn require_header<'a>(
    headers: &'a HashMap<String, String>,
    name: &str,
) -> Result<&'a String, PipelineError> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
        .ok_or_else(|| auth_error("MISSING_HEADER", format!("missing header '{name}'")))
}

fn auth_error(code: &str, message: impl Into<String>) -> PipelineError {
    PipelineError::authentication(code, message)
}

fn compute_hmac_hex(
    algorithm: HmacAlgorithm,
    secret: &[u8],
    body: &[u8],
) -> Result<String, PipelineError> {
    match algorithm {
        HmacAlgorithm::Sha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(secret)
                .map_err(|e| PipelineError::system("HMAC_KEY", e.to_string()))?;
            mac.update(body);
            Ok(hex_encode(&mac.finalize().into_bytes()))
        }
        HmacAlgorithm::Sha512 => {
            let mut mac = Hmac::<Sha512>::new_from_slice(secret)
                .map_err(|e| PipelineError::system("HMAC_KEY", e.to_string()))?;
            mac.update(body);
            Ok(hex_encode(&mac.finalize().into_bytes()))
        }
    }
}

fn verify_jwt_hs256(token: &str, secret: &[u8]) -> Result<(), PipelineError> {
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(auth_error("MALFORMED_JWT", "token must have three segments"));
    };

    let header_json: serde_json::Value = URL_SAFE_NO_PAD
        .decode(header)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .ok_or_else(|| auth_error("MALFORMED_JWT", "invalid token header"))?;
    if header_json.get("alg").and_then(|v| v.as_str()) != Some("HS256") {
        return Err(auth_error("UNSUPPORTED_ALG", "only HS256 tokens are accepted"));
    }

    let presented = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| auth_error("MALFORMED_JWT", "invalid token signature encoding"))?;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .map_err(|e| PipelineError::system("HMAC_KEY", e.to_string()))?;
    mac.update(format!("{header}.{payload}").as_bytes());
    let expected = mac.finalize().into_bytes();
    if !constant_time_eq(&presented, &expected) {
        return Err(auth_error("SIGNATURE_MISMATCH", "token signature does not match"));
    }

    let claims: serde_json::Value = URL_SAFE_NO_PAD
        .decode(payload)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .ok_or_else(|| auth_error("MALFORMED_JWT", "invalid token payload"))?;
    if let Some(exp) = claims.get("exp").and_then(serde_json::Value::as_i64) {
        if exp < chrono::Utc::now().timestamp() {
            return Err(auth_error("TOKEN_EXPIRED", "token is expired"));
        }
    }
    Ok(())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Length-independent early exit is fine; content comparison is not.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
