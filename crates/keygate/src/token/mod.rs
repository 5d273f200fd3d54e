//! Identity token verification
//!
//! Every non-exempt request carries a JWT issued by the identity provider in front of
//! the gate (Cloudflare Access by default). [`JwtVerifier`] checks it completely before
//! trusting the subject: signature against the provider's published keys, `exp`/`nbf`,
//! issuer and audience. No upstream validator is assumed.
//!
//! | Failure                                            | Code                 | Status |
//! |----------------------------------------------------|----------------------|--------|
//! | header absent or empty                             | `Unauthenticated`    | 401    |
//! | malformed, unknown key, bad signature, expired ... | `InvalidToken`       | 401    |
//! | valid token without a non-empty `email` claim      | `Forbidden`          | 403    |
//!
//! Raw tokens and claim sets are never logged.

mod keys;
pub use self::keys::{KeySet, KeySetError, VerificationKey};

use crate::error::GateResult;

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use hyper::HeaderMap;
use jsonwebtoken::Validation;
use jsonwebtoken::errors::ErrorKind;
use serde_json::{Map, Value};

/// The authenticated subject of one request.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    /// Returns `None` for an empty string.
    #[must_use]
    pub fn new(s: impl Into<String>) -> Option<Self> {
        let s = s.into();
        if s.is_empty() {
            return None;
        }
        Some(Self(s))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Identity").field(&self.0).finish()
    }
}

/// Token verifier.
pub trait TokenVerifier: Send + Sync + 'static {
    /// Verifies a raw token and extracts the identity.
    ///
    /// # Errors
    /// Returns `InvalidToken` for any token that does not verify, and `Forbidden` for a
    /// valid token lacking the identity claim.
    fn verify(&self, raw: &str) -> GateResult<Identity>;
}

impl<T: TokenVerifier + ?Sized> TokenVerifier for Arc<T> {
    fn verify(&self, raw: &str) -> GateResult<Identity> {
        T::verify(self, raw)
    }
}

/// Takes the raw token out of `header`.
///
/// A leading `Bearer ` (any case) is stripped so that `authorization` works as the
/// token header too.
///
/// # Errors
/// Returns `Unauthenticated` if the header is absent or empty, `InvalidToken` if its
/// value is not visible ASCII.
pub fn extract_token<'a>(headers: &'a HeaderMap, header: &str) -> GateResult<&'a str> {
    let Some(value) = headers.get(header) else {
        return Err(gate_error!(Unauthenticated, "missing header {header:?}"));
    };
    let value = value
        .to_str()
        .map_err(|e| gate_error!(e, InvalidToken, "header {header:?} is not visible ascii"))?
        .trim();
    let token = match value.get(..7) {
        Some(scheme) if scheme.eq_ignore_ascii_case("bearer ") => value[7..].trim_start(),
        _ => value,
    };
    if token.is_empty() {
        return Err(gate_error!(Unauthenticated, "empty header {header:?}"));
    }
    Ok(token)
}

/// Claims every accepted token must satisfy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSettings {
    /// Expected `iss`.
    pub issuer: String,
    /// Accepted `aud` values; the token must name at least one.
    pub audiences: Vec<String>,
    /// Clock skew tolerated on `exp` and `nbf`, in seconds.
    pub leeway_secs: u64,
    /// Claim holding the identity.
    pub identity_claim: String,
}

impl TokenSettings {
    #[must_use]
    pub fn new(issuer: impl Into<String>, audiences: Vec<String>) -> Self {
        Self {
            issuer: issuer.into(),
            audiences,
            leeway_secs: 60,
            identity_claim: "email".to_owned(),
        }
    }

    /// Settings for a Cloudflare Access application.
    ///
    /// `team_domain` is `<team>.cloudflareaccess.com`, with or without scheme;
    /// `audience` is the application's AUD tag.
    #[must_use]
    pub fn cloudflare_access(team_domain: &str, audience: &str) -> Self {
        Self::new(cloudflare_issuer(team_domain), vec![audience.to_owned()])
    }
}

/// The issuer of a Cloudflare Access team's tokens.
#[must_use]
pub fn cloudflare_issuer(team_domain: &str) -> String {
    let host = team_domain.trim_start_matches("https://").trim_end_matches('/');
    format!("https://{host}")
}

/// Where a Cloudflare Access team publishes its signing keys.
#[must_use]
pub fn cloudflare_certs_url(team_domain: &str) -> String {
    format!("{}/cdn-cgi/access/certs", cloudflare_issuer(team_domain))
}

/// JWT verifier with a replaceable key set.
///
/// The verifier performs no I/O. Whoever fetches the provider's keys installs them with
/// [`update_keys`](Self::update_keys); in-flight verifications keep the set they started with.
pub struct JwtVerifier {
    settings: TokenSettings,
    keys: ArcSwap<KeySet>,
}

impl JwtVerifier {
    #[must_use]
    pub fn new(settings: TokenSettings, keys: KeySet) -> Self {
        Self {
            settings,
            keys: ArcSwap::from_pointee(keys),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &TokenSettings {
        &self.settings
    }

    pub fn update_keys(&self, keys: KeySet) {
        self.keys.store(Arc::new(keys));
    }

    #[must_use]
    pub fn keys(&self) -> Arc<KeySet> {
        self.keys.load_full()
    }
}

fn describe(kind: &ErrorKind) -> &'static str {
    match kind {
        ErrorKind::InvalidSignature => "bad signature",
        ErrorKind::ExpiredSignature => "expired",
        ErrorKind::ImmatureSignature => "not yet valid",
        ErrorKind::InvalidIssuer => "wrong issuer",
        ErrorKind::InvalidAudience => "wrong audience",
        ErrorKind::InvalidAlgorithm => "algorithm mismatch",
        ErrorKind::MissingRequiredClaim(_) => "missing required claim",
        _ => "malformed",
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, raw: &str) -> GateResult<Identity> {
        let header = jsonwebtoken::decode_header(raw).map_err(|e| gate_error!(e, InvalidToken, "malformed token header"))?;

        let keys = self.keys.load();
        let Some(key) = keys.find(header.kid.as_deref()) else {
            return Err(gate_error!(InvalidToken, "no verification key for kid {:?}", header.kid));
        };
        if header.alg != key.algorithm() {
            return Err(gate_error!(
                InvalidToken,
                "token algorithm {:?} does not match key {:?}",
                header.alg,
                key.kid()
            ));
        }

        let mut validation = Validation::new(key.algorithm());
        validation.leeway = self.settings.leeway_secs;
        validation.validate_nbf = true;
        validation.set_issuer(&[&self.settings.issuer]);
        validation.set_audience(&self.settings.audiences);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);

        let data = jsonwebtoken::decode::<Map<String, Value>>(raw, key.decoding_key(), &validation).map_err(|e| {
            let reason = describe(e.kind());
            gate_error!(e, InvalidToken, "token rejected: {reason}")
        })?;

        let claim = self.settings.identity_claim.as_str();
        match data.claims.get(claim) {
            Some(Value::String(s)) => {
                Identity::new(s.as_str()).ok_or_else(|| gate_error!(Forbidden, "empty identity claim {claim:?}"))
            }
            _ => Err(gate_error!(Forbidden, "missing identity claim {claim:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::GateErrorCode;

    use std::time::{SystemTime, UNIX_EPOCH};

    use hyper::header::{AUTHORIZATION, HeaderValue};
    use jsonwebtoken::{Algorithm, EncodingKey, Header};
    use serde_json::json;

    const ISSUER: &str = "https://acme.cloudflareaccess.com";
    const AUD: &str = "aud-tag-123";

    fn now() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
    }

    fn claims(email: Option<&str>) -> Value {
        let mut c = json!({"iss": ISSUER, "aud": [AUD], "exp": now() + 600, "iat": now()});
        if let Some(email) = email {
            c["email"] = json!(email);
        }
        c
    }

    fn hs256(kid: &str, secret: &[u8], claims: &Value) -> String {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(kid.to_owned());
        jsonwebtoken::encode(&header, claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    fn hmac_verifier() -> JwtVerifier {
        JwtVerifier::new(
            TokenSettings::cloudflare_access("acme.cloudflareaccess.com", AUD),
            KeySet::hmac(Some("k1"), b"s3cret"),
        )
    }

    fn code(result: GateResult<Identity>) -> GateErrorCode {
        result.unwrap_err().code()
    }

    #[test]
    fn accepts_valid_token() {
        let v = hmac_verifier();
        let token = hs256("k1", b"s3cret", &claims(Some("u@x.com")));
        assert_eq!(v.verify(&token).unwrap().as_str(), "u@x.com");
    }

    #[test]
    fn verifies_eddsa_from_jwks() {
        let keys = KeySet::from_jwks(keys::tests::JWKS.as_bytes()).unwrap();
        let v = JwtVerifier::new(TokenSettings::new(ISSUER, vec![AUD.to_owned()]), keys);

        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some("ed-1".to_owned());
        let key = EncodingKey::from_ed_pem(keys::tests::ED25519_PRIVATE_PEM.as_bytes()).unwrap();
        let token = jsonwebtoken::encode(&header, &claims(Some("u@x.com")), &key).unwrap();
        assert_eq!(v.verify(&token).unwrap().as_str(), "u@x.com");

        // same signature presented under the RSA key id
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some("rsa-1".to_owned());
        let token = jsonwebtoken::encode(&header, &claims(Some("u@x.com")), &key).unwrap();
        assert_eq!(code(v.verify(&token)), GateErrorCode::InvalidToken);
    }

    #[test]
    fn rejects_hmac_token_against_rsa_key() {
        let keys = KeySet::from_jwks(keys::tests::JWKS.as_bytes()).unwrap();
        let v = JwtVerifier::new(TokenSettings::new(ISSUER, vec![AUD.to_owned()]), keys);
        let token = hs256("rsa-1", b"anything", &claims(Some("u@x.com")));
        assert_eq!(code(v.verify(&token)), GateErrorCode::InvalidToken);
    }

    #[test]
    fn rejects_bad_signature_and_unknown_kid() {
        let v = hmac_verifier();
        let token = hs256("k1", b"wrong", &claims(Some("u@x.com")));
        assert_eq!(code(v.verify(&token)), GateErrorCode::InvalidToken);

        let token = hs256("k2", b"s3cret", &claims(Some("u@x.com")));
        assert_eq!(code(v.verify(&token)), GateErrorCode::InvalidToken);
    }

    #[test]
    fn rejects_malformed() {
        let v = hmac_verifier();
        for raw in ["", "abc", "a.b.c", "eyJhbGciOiJIUzI1NiJ9.!!!.sig"] {
            assert_eq!(code(v.verify(raw)), GateErrorCode::InvalidToken, "{raw:?}");
        }
    }

    #[test]
    fn rejects_unsigned_payload() {
        // header.payload with an empty signature, as an edge proxy would have accepted it
        let v = hmac_verifier();
        let token = hs256("k1", b"s3cret", &claims(Some("u@x.com")));
        let unsigned = &token[..=token.rfind('.').unwrap()];
        assert_eq!(code(v.verify(unsigned)), GateErrorCode::InvalidToken);
    }

    #[test]
    fn rejects_expired_wrong_issuer_wrong_audience() {
        let v = hmac_verifier();

        let mut c = claims(Some("u@x.com"));
        c["exp"] = json!(now() - 3600);
        assert_eq!(code(v.verify(&hs256("k1", b"s3cret", &c))), GateErrorCode::InvalidToken);

        let mut c = claims(Some("u@x.com"));
        c["iss"] = json!("https://evil.cloudflareaccess.com");
        assert_eq!(code(v.verify(&hs256("k1", b"s3cret", &c))), GateErrorCode::InvalidToken);

        let mut c = claims(Some("u@x.com"));
        c["aud"] = json!(["other-app"]);
        assert_eq!(code(v.verify(&hs256("k1", b"s3cret", &c))), GateErrorCode::InvalidToken);

        let mut c = claims(Some("u@x.com"));
        c.as_object_mut().unwrap().remove("exp");
        assert_eq!(code(v.verify(&hs256("k1", b"s3cret", &c))), GateErrorCode::InvalidToken);
    }

    #[test]
    fn missing_or_empty_email_is_forbidden() {
        let v = hmac_verifier();
        assert_eq!(
            code(v.verify(&hs256("k1", b"s3cret", &claims(None)))),
            GateErrorCode::Forbidden
        );
        assert_eq!(
            code(v.verify(&hs256("k1", b"s3cret", &claims(Some(""))))),
            GateErrorCode::Forbidden
        );

        let mut c = claims(None);
        c["email"] = json!(42);
        assert_eq!(code(v.verify(&hs256("k1", b"s3cret", &c))), GateErrorCode::Forbidden);
    }

    #[test]
    fn key_rotation() {
        let v = hmac_verifier();
        let token = hs256("k2", b"rotated", &claims(Some("u@x.com")));
        assert!(v.verify(&token).is_err());

        v.update_keys(KeySet::hmac(Some("k2"), b"rotated"));
        assert!(v.verify(&token).is_ok());
    }

    #[test]
    fn extract_token_from_headers() {
        let mut headers = HeaderMap::new();
        let err = extract_token(&headers, "cf-access-jwt-assertion").unwrap_err();
        assert_eq!(err.code(), GateErrorCode::Unauthenticated);

        headers.insert("cf-access-jwt-assertion", HeaderValue::from_static("  "));
        let err = extract_token(&headers, "cf-access-jwt-assertion").unwrap_err();
        assert_eq!(err.code(), GateErrorCode::Unauthenticated);

        headers.insert("cf-access-jwt-assertion", HeaderValue::from_static("a.b.c"));
        assert_eq!(extract_token(&headers, "cf-access-jwt-assertion").unwrap(), "a.b.c");

        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer x.y.z"));
        assert_eq!(extract_token(&headers, "authorization").unwrap(), "x.y.z");

        headers.insert(AUTHORIZATION, HeaderValue::from_bytes(b"\xff").unwrap());
        let err = extract_token(&headers, "authorization").unwrap_err();
        assert_eq!(err.code(), GateErrorCode::InvalidToken);
    }

    #[test]
    fn cloudflare_urls() {
        assert_eq!(cloudflare_certs_url("acme.cloudflareaccess.com"), "https://acme.cloudflareaccess.com/cdn-cgi/access/certs");
        assert_eq!(
            TokenSettings::cloudflare_access("https://acme.cloudflareaccess.com/", AUD).issuer,
            ISSUER
        );
    }

    #[test]
    fn identity_rejects_empty() {
        assert!(Identity::new("").is_none());
        assert_eq!(Identity::new("a@b").unwrap().to_string(), "a@b");
    }
}
