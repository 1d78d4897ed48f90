//! RFC 9421 HTTP Message Signature verification.
//!
//! Supports the two algorithms TAP agents sign with: ECDSA P-256 with SHA-256
//! and RSA-PSS with SHA-256. Public keys are SPKI PEM documents, either
//! registered with the agent or published in the agent's key directory.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use p256::pkcs8::DecodePublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use signature::Verifier;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{
    directory::DirectoryResolver,
    signature_input::{SignatureInput, dictionary_bytes, parse_signature, select_signature_input},
};
use crate::{
    clock::now_secs,
    error::{BotchaError, Result},
    reliability::{fail_open, fail_open_or_default},
    security::audit::{AuditEvent, AuditEventType, audit_log},
    store::KvStore,
};

/// Oldest acceptable `created` timestamp, and the nonce retention window.
pub const MAX_SIGNATURE_AGE: Duration = Duration::from_secs(480);

/// Tolerated clock drift for `created` timestamps in the future.
pub const CLOCK_SKEW: Duration = Duration::from_secs(60);

/// Signature algorithms accepted by the verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    /// ECDSA over P-256 with SHA-256 (`ecdsa-p256-sha256`, `ES256`).
    #[serde(rename = "ecdsa-p256-sha256", alias = "ES256", alias = "es256")]
    EcdsaP256Sha256,
    /// RSASSA-PSS with SHA-256 (`rsa-pss-sha256`, `PS256`).
    #[serde(rename = "rsa-pss-sha256", alias = "PS256", alias = "ps256")]
    RsaPssSha256,
}

impl SignatureAlgorithm {
    /// RFC 9421 algorithm name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EcdsaP256Sha256 => "ecdsa-p256-sha256",
            Self::RsaPssSha256 => "rsa-pss-sha256",
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = BotchaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ecdsa-p256-sha256" | "es256" => Ok(Self::EcdsaP256Sha256),
            "rsa-pss-sha256" | "ps256" => Ok(Self::RsaPssSha256),
            _ => Err(BotchaError::UnsupportedAlgorithm(s.to_owned())),
        }
    }
}

/// The parts of an inbound request a signature can cover.
#[derive(Debug, Clone, Copy)]
pub struct SignedRequest<'a> {
    /// HTTP method, e.g. `POST`.
    pub method: &'a str,
    /// Request path without query.
    pub path: &'a str,
    /// Query string without the leading `?`, if any.
    pub query: Option<&'a str>,
    /// Host and optional port. Falls back to the `host` header when absent.
    pub authority: Option<&'a str>,
    /// Header name/value pairs; names are matched case-insensitively.
    pub headers: &'a [(String, String)],
    /// Raw body bytes.
    pub body: &'a [u8],
}

impl SignedRequest<'_> {
    /// All values of header `name`, trimmed and joined with `, `.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<String> {
        let values: Vec<&str> = self
            .headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.trim())
            .collect();
        (!values.is_empty()).then(|| values.join(", "))
    }
}

/// A public key to check signatures against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationKey {
    /// Key identifier, if the key came from a directory.
    pub key_id: Option<String>,
    /// SPKI PEM public key.
    pub public_key: String,
    /// Algorithm the key is used with.
    pub algorithm: SignatureAlgorithm,
}

/// A signature that passed every check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifiedSignature {
    /// Signature label.
    pub label: String,
    /// `keyid` parameter.
    pub key_id: String,
    /// Algorithm used.
    pub algorithm: SignatureAlgorithm,
    /// Covered components.
    pub components: Vec<String>,
    /// `tag` parameter.
    pub tag: Option<String>,
    /// `created` parameter.
    pub created: Option<u64>,
}

/// `Content-Digest` value for `body`: `sha-256=:<base64>:`.
///
/// # Examples
///
/// ```
/// use botcha::tap::compute_content_digest;
///
/// assert_eq!(
///     compute_content_digest(b""),
///     "sha-256=:47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=:"
/// );
/// ```
#[must_use]
pub fn compute_content_digest(body: &[u8]) -> String {
    let hash = Sha256::digest(body);
    let hash_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, hash);
    format!("sha-256=:{hash_b64}:")
}

/// Builds the RFC 9421 signature base: one `"<component>": <value>` line per
/// covered component, in order, then the `"@signature-params"` line carrying
/// `raw_params` verbatim.
///
/// # Errors
///
/// Returns [`BotchaError::InvalidSignatureInput`] when a covered header is
/// absent or a derived component is not supported.
///
/// # Examples
///
/// ```
/// use botcha::tap::{SignedRequest, build_signature_base};
///
/// let headers = vec![("Host".to_owned(), "shop.example".to_owned())];
/// let request = SignedRequest {
///     method: "GET",
///     path: "/products",
///     query: None,
///     authority: None,
///     headers: &headers,
///     body: b"",
/// };
/// let components = ["@method".to_owned(), "@authority".to_owned(), "@path".to_owned()];
/// let base = build_signature_base(&request, &components, r#"("@method" "@authority" "@path")"#)
///     .unwrap();
///
/// assert_eq!(
///     base,
///     "\"@method\": GET\n\"@authority\": shop.example\n\"@path\": /products\n\
///      \"@signature-params\": (\"@method\" \"@authority\" \"@path\")"
/// );
/// ```
pub fn build_signature_base(
    request: &SignedRequest<'_>,
    components: &[String],
    raw_params: &str,
) -> Result<String> {
    let mut lines = Vec::with_capacity(components.len() + 1);

    for component in components {
        let value = match component.as_str() {
            "@method" => request.method.to_ascii_uppercase(),
            "@path" => request.path.to_owned(),
            "@query" => format!("?{}", request.query.unwrap_or_default()),
            "@authority" => request
                .authority
                .map(str::to_owned)
                .or_else(|| request.header("host"))
                .ok_or_else(|| missing_component(component))?
                .to_ascii_lowercase(),
            derived if derived.starts_with('@') => {
                return Err(BotchaError::InvalidSignatureInput(format!(
                    "unsupported derived component {derived}"
                )));
            }
            header => request.header(header).ok_or_else(|| missing_component(header))?,
        };
        lines.push(format!("\"{component}\": {value}"));
    }

    lines.push(format!("\"@signature-params\": {raw_params}"));
    Ok(lines.join("\n"))
}

fn missing_component(name: &str) -> BotchaError {
    BotchaError::InvalidSignatureInput(format!("covered component {name} is missing from request"))
}

/// Checks `signature` over `base` with a PEM public key.
///
/// Returns `Ok(false)` when the signature does not verify (including
/// malformed signature bytes).
///
/// # Errors
///
/// - [`BotchaError::UnsupportedAlgorithm`] for any algorithm but ECDSA P-256 / RSA-PSS
/// - [`BotchaError::CryptoError`] when the key cannot be parsed
pub fn verify_signature(
    base: &str,
    signature: &[u8],
    public_key_pem: &str,
    algorithm: &str,
) -> Result<bool> {
    let algorithm: SignatureAlgorithm = algorithm.parse()?;
    verify_with_algorithm(base.as_bytes(), signature, public_key_pem, algorithm)
}

fn verify_with_algorithm(
    message: &[u8],
    signature: &[u8],
    public_key_pem: &str,
    algorithm: SignatureAlgorithm,
) -> Result<bool> {
    match algorithm {
        SignatureAlgorithm::EcdsaP256Sha256 => {
            let key = ecdsa_key(public_key_pem)?;
            let sig = if signature.len() == 64 {
                p256::ecdsa::Signature::from_slice(signature)
            } else {
                p256::ecdsa::Signature::from_der(signature)
            };
            Ok(sig.is_ok_and(|sig| key.verify(message, &sig).is_ok()))
        }
        SignatureAlgorithm::RsaPssSha256 => {
            let key = rsa::pss::VerifyingKey::<Sha256>::new(rsa_key(public_key_pem)?);
            let Ok(sig) = rsa::pss::Signature::try_from(signature) else {
                return Ok(false);
            };
            Ok(key.verify(message, &sig).is_ok())
        }
    }
}

fn ecdsa_key(pem: &str) -> Result<p256::ecdsa::VerifyingKey> {
    let public_key = p256::PublicKey::from_public_key_pem(pem.trim())
        .map_err(|e| BotchaError::CryptoError(format!("invalid P-256 public key: {e}")))?;
    Ok(p256::ecdsa::VerifyingKey::from(&public_key))
}

fn rsa_key(pem: &str) -> Result<rsa::RsaPublicKey> {
    let pem = pem.trim();
    rsa::RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| rsa::RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| BotchaError::CryptoError(format!("invalid RSA public key: {e}")))
}

/// Confirms `pem` parses as a key for `algorithm`.
///
/// # Errors
///
/// Returns [`BotchaError::CryptoError`] if it does not.
pub fn validate_public_key(pem: &str, algorithm: SignatureAlgorithm) -> Result<()> {
    match algorithm {
        SignatureAlgorithm::EcdsaP256Sha256 => ecdsa_key(pem).map(drop),
        SignatureAlgorithm::RsaPssSha256 => rsa_key(pem).map(drop),
    }
}

/// Works out which algorithm a PEM key belongs to.
///
/// # Errors
///
/// Returns [`BotchaError::CryptoError`] if it is neither a P-256 nor an RSA key.
pub fn detect_algorithm(pem: &str) -> Result<SignatureAlgorithm> {
    if ecdsa_key(pem).is_ok() {
        Ok(SignatureAlgorithm::EcdsaP256Sha256)
    } else if rsa_key(pem).is_ok() {
        Ok(SignatureAlgorithm::RsaPssSha256)
    } else {
        Err(BotchaError::CryptoError("public key is neither P-256 nor RSA".into()))
    }
}

fn nonce_key(key_id: &str, nonce: &str) -> String {
    format!("tap:nonce:{key_id}:{nonce}")
}

/// Verifies signed requests and tracks nonces.
///
/// Checks run in this order: headers present, `Signature-Input` parses,
/// timestamps are fresh, `content-digest` matches the body, the signature
/// verifies, the nonce is unseen. Nonce bookkeeping fails open.
#[derive(Debug)]
pub struct TapVerifier<S> {
    store: Arc<S>,
}

impl<S> Clone for TapVerifier<S> {
    fn clone(&self) -> Self {
        Self { store: Arc::clone(&self.store) }
    }
}

impl<S: KvStore> TapVerifier<S> {
    /// Creates a verifier that records nonces in `store`.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Verifies `request` against a known key.
    ///
    /// # Errors
    ///
    /// Any of the signature variants of [`BotchaError`].
    #[instrument(skip(self, request, key), fields(method = request.method, path = request.path))]
    pub async fn verify_with_key(
        &self,
        request: &SignedRequest<'_>,
        key: &VerificationKey,
    ) -> Result<VerifiedSignature> {
        let outcome = match parse_headers(request) {
            Ok((input, signature)) => self.verify_parsed(request, &input, &signature, key).await,
            Err(e) => Err(e),
        };
        record_outcome(&outcome, key.key_id.as_deref());
        outcome
    }

    /// Verifies `request` against the key its `Signature-Agent` directory publishes.
    ///
    /// # Errors
    ///
    /// Any of the signature variants of [`BotchaError`], plus directory
    /// resolution failures ([`BotchaError::UntrustedProvider`],
    /// [`BotchaError::DirectoryUnavailable`], [`BotchaError::SignatureKeyNotFound`]).
    #[instrument(
        skip(self, request, resolver),
        fields(method = request.method, path = request.path)
    )]
    pub async fn verify_with_directory(
        &self,
        request: &SignedRequest<'_>,
        resolver: &DirectoryResolver<S>,
    ) -> Result<VerifiedSignature> {
        let outcome = self.resolve_and_verify(request, resolver).await;
        record_outcome(&outcome, None);
        outcome
    }

    async fn resolve_and_verify(
        &self,
        request: &SignedRequest<'_>,
        resolver: &DirectoryResolver<S>,
    ) -> Result<VerifiedSignature> {
        let (input, signature) = parse_headers(request)?;
        let agent = request.header("signature-agent").ok_or(BotchaError::SignatureMissingHeaders)?;
        let directory_url = agent.trim().trim_matches('"');

        let key = resolver.find_key(directory_url, &input.key_id).await?;
        self.verify_parsed(request, &input, &signature, &key).await
    }

    async fn verify_parsed(
        &self,
        request: &SignedRequest<'_>,
        input: &SignatureInput,
        signature: &[u8],
        key: &VerificationKey,
    ) -> Result<VerifiedSignature> {
        let algorithm = match &input.algorithm {
            Some(alg) => {
                let declared: SignatureAlgorithm = alg.parse()?;
                if declared != key.algorithm {
                    return Err(BotchaError::InvalidSignatureInput(format!(
                        "alg {declared} does not match key algorithm {}",
                        key.algorithm
                    )));
                }
                declared
            }
            None => key.algorithm,
        };

        check_freshness(input, now_secs())?;
        check_content_digest(request, input)?;

        let base = build_signature_base(request, &input.components, &input.raw_params)?;
        if !verify_with_algorithm(base.as_bytes(), signature, &key.public_key, algorithm)? {
            return Err(BotchaError::SignatureInvalid);
        }

        if let Some(nonce) = &input.nonce {
            self.consume_nonce(&input.key_id, nonce).await?;
        }

        debug!(key_id = %input.key_id, %algorithm, "signature verified");
        Ok(VerifiedSignature {
            label: input.label.clone(),
            key_id: input.key_id.clone(),
            algorithm,
            components: input.components.clone(),
            tag: input.tag.clone(),
            created: input.created,
        })
    }

    async fn consume_nonce(&self, key_id: &str, nonce: &str) -> Result<()> {
        let key = nonce_key(key_id, nonce);
        let seen = fail_open("tap.nonce_lookup", self.store.get(&key), None).await?;
        if seen.is_some() {
            return Err(BotchaError::SignatureReplayed);
        }
        fail_open_or_default(
            "tap.nonce_record",
            self.store.put(&key, "1".to_owned(), Some(MAX_SIGNATURE_AGE)),
        )
        .await
    }
}

fn parse_headers(request: &SignedRequest<'_>) -> Result<(SignatureInput, Vec<u8>)> {
    let (Some(signature), Some(signature_input)) =
        (request.header("signature"), request.header("signature-input"))
    else {
        return Err(BotchaError::SignatureMissingHeaders);
    };

    let input = select_signature_input(&signature_input, None)?;
    let bytes = parse_signature(&signature, &input.label)?;
    Ok((input, bytes))
}

fn check_freshness(input: &SignatureInput, now: u64) -> Result<()> {
    if input.expires.is_some_and(|expires| now > expires) {
        return Err(BotchaError::SignatureExpired);
    }
    if let Some(created) = input.created {
        if created > now + CLOCK_SKEW.as_secs() {
            return Err(BotchaError::InvalidSignatureInput("created is in the future".into()));
        }
        if now.saturating_sub(created) > MAX_SIGNATURE_AGE.as_secs() {
            return Err(BotchaError::SignatureExpired);
        }
    }
    Ok(())
}

fn check_content_digest(request: &SignedRequest<'_>, input: &SignatureInput) -> Result<()> {
    if !input.components.iter().any(|c| c == "content-digest") {
        return Ok(());
    }
    let header =
        request.header("content-digest").ok_or_else(|| missing_component("content-digest"))?;
    let claimed = dictionary_bytes(&header, "sha-256")?;
    if claimed.as_slice() != Sha256::digest(request.body).as_slice() {
        warn!("content-digest does not match body");
        return Err(BotchaError::SignatureInvalid);
    }
    Ok(())
}

fn record_outcome(outcome: &Result<VerifiedSignature>, key_id: Option<&str>) {
    match outcome {
        Ok(verified) => audit_log(
            &AuditEvent::new(AuditEventType::SignatureVerified, &verified.key_id, Uuid::new_v4())
                .with_key_id(&verified.key_id),
        ),
        Err(e) => {
            warn!(reason = e.kind(), "signature rejected");
            let mut event =
                AuditEvent::new(AuditEventType::SignatureRejected, "anonymous", Uuid::new_v4())
                    .with_error(e.to_string());
            if let Some(key_id) = key_id {
                event = event.with_key_id(key_id);
            }
            audit_log(&event);
        }
    }
}
