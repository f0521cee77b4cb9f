//! Signed session tokens.
//!
//! A token is `base64url(header).base64url(payload).base64url(signature)`
//! with header `{"typ":"JWT","alg":"PS256"}` and a [`TokenClaims`] payload.
//!
//! Verification walks a fixed sequence of stages and stops at the first
//! failure:
//!
//! ```text
//! Parsed ──► SessionResolved ──► SignatureChecked ──► TemporalChecked ──► Accepted
//!   │              │                    │                   │
//!   └──────────────┴────── Rejected(AuthError) ─────────────┘
//! ```
//!
//! Before the signature is checked, the only payload field that can be read
//! is the session id (`jti`), which is needed to find the verification key.
//! Timestamps are only trusted after the signature checks out, so a forged
//! token is always reported as [`AuthError::InvalidSignature`] and never as
//! expired.

use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::Header;
use serde::{Deserialize, Serialize};
use touno_core_storage::SharedClock;
use uuid::Uuid;

use crate::{
    error::{AuthError, Result},
    keys::{PrivateKey, PublicKey},
    validation::{PINNED_ALGORITHM, validate_algorithm},
};

/// Default token lifetime.
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Claims carried by a session token.
///
/// All timestamps are milliseconds since the Unix epoch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Display name of the account.
    pub dat: String,
    /// External account id.
    pub sub: Uuid,
    /// Session id; doubles as the token id.
    pub jti: Uuid,
    /// The principal that authenticated (the sign-in username).
    pub iss: String,
    /// Not before.
    pub nbf: i64,
    /// Issued at.
    pub iat: i64,
    /// Expires at.
    pub exp: i64,
}

impl TokenClaims {
    /// Builds claims valid from `issued_at_ms` for `lifetime`.
    #[must_use]
    pub fn new(
        display_name: impl Into<String>,
        account: Uuid,
        session: Uuid,
        issuer: impl Into<String>,
        issued_at_ms: i64,
        lifetime: Duration,
    ) -> Self {
        let lifetime_ms = i64::try_from(lifetime.as_millis()).unwrap_or(i64::MAX);
        Self {
            dat: display_name.into(),
            sub: account,
            jti: session,
            iss: issuer.into(),
            nbf: issued_at_ms,
            iat: issued_at_ms,
            exp: issued_at_ms.saturating_add(lifetime_ms),
        }
    }

    /// The session this token belongs to.
    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.jti
    }

    /// Checks the validity window against `now_ms`.
    ///
    /// # Errors
    ///
    /// - [`AuthError::TokenExpired`] if `now_ms >= exp`
    /// - [`AuthError::TokenNotYetValid`] if `now_ms < nbf`
    /// - [`AuthError::MalformedToken`] if `nbf <= iat < exp` does not hold
    pub fn check_temporal(&self, now_ms: i64) -> Result<()> {
        if now_ms >= self.exp {
            return Err(AuthError::token_expired());
        }
        if now_ms < self.nbf {
            return Err(AuthError::token_not_yet_valid());
        }
        if !(self.nbf <= self.iat && self.iat < self.exp) {
            return Err(AuthError::malformed("claims violate nbf <= iat < exp"));
        }
        Ok(())
    }
}

/// Resolves a session id to the key its tokens must verify against.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    /// Returns the verification key for `session_id`.
    ///
    /// # Errors
    ///
    /// [`AuthError::Unauthorized`] if the session is unknown or revoked;
    /// storage failures propagate as [`AuthError::Storage`].
    async fn resolve(&self, session_id: Uuid) -> Result<PublicKey>;
}

/// Verification progress, reported in rejection logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStage {
    /// Structure decoded and algorithm pinned.
    Parsed,
    /// Verification key found for the session.
    SessionResolved,
    /// Signature matches.
    SignatureChecked,
    /// Validity window holds.
    TemporalChecked,
    /// All checks passed.
    Accepted,
}

#[derive(Deserialize)]
struct RawHeader {
    alg: String,
}

/// The one payload field readable before signature verification.
#[derive(Deserialize)]
struct UnverifiedClaims {
    jti: String,
}

/// A token split into its parts with header and session id decoded.
struct ParsedToken<'a> {
    signing_input: &'a str,
    signature: &'a str,
    payload: Vec<u8>,
    session_id: Uuid,
}

impl<'a> ParsedToken<'a> {
    fn parse(token: &'a str) -> Result<Self> {
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::malformed("expected three segments"));
        };
        if header.is_empty() || payload.is_empty() || signature.is_empty() {
            return Err(AuthError::malformed("empty segment"));
        }

        let header_bytes = URL_SAFE_NO_PAD
            .decode(header)
            .map_err(|e| AuthError::malformed(format!("header is not base64url: {e}")))?;
        let raw: RawHeader = serde_json::from_slice(&header_bytes)
            .map_err(|e| AuthError::malformed(format!("header is not valid JSON: {e}")))?;
        validate_algorithm(&raw.alg)?;

        let payload_bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| AuthError::malformed(format!("payload is not base64url: {e}")))?;
        let unverified: UnverifiedClaims = serde_json::from_slice(&payload_bytes)
            .map_err(|e| AuthError::malformed(format!("payload has no session id: {e}")))?;
        let session_id = Uuid::parse_str(&unverified.jti)
            .map_err(|e| AuthError::malformed(format!("session id is not a UUID: {e}")))?;

        let signing_input = &token[..header.len() + 1 + payload.len()];
        Ok(Self { signing_input, signature, payload: payload_bytes, session_id })
    }

    fn verify_signature(self, key: &PublicKey) -> Result<TokenClaims> {
        let valid = jsonwebtoken::crypto::verify(
            self.signature,
            self.signing_input.as_bytes(),
            key.decoding_key(),
            PINNED_ALGORITHM,
        )
        .unwrap_or(false);
        if !valid {
            return Err(AuthError::invalid_signature());
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| AuthError::malformed(format!("invalid claim set: {e}")))
    }
}

/// Signs and verifies session tokens with the pinned algorithm.
#[derive(Debug, Clone)]
pub struct TokenCodec {
    clock: SharedClock,
}

impl TokenCodec {
    /// Creates a codec that reads the current time from `clock`.
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self { clock }
    }

    /// Serializes and signs `claims`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::SigningFailed`] if encoding or signing fails.
    pub fn sign(&self, claims: &TokenClaims, key: &PrivateKey) -> Result<String> {
        let header = Header::new(PINNED_ALGORITHM);
        jsonwebtoken::encode(&header, claims, key.encoding_key())
            .map_err(|e| AuthError::signing_failed(e.to_string()))
    }

    /// Verifies `token`, resolving its key through `resolver`.
    ///
    /// # Errors
    ///
    /// The first failing stage's error: [`AuthError::MalformedToken`] or
    /// [`AuthError::UnsupportedAlgorithm`] while parsing, whatever the
    /// resolver returns, [`AuthError::InvalidSignature`], then
    /// [`AuthError::TokenExpired`] or [`AuthError::TokenNotYetValid`].
    #[tracing::instrument(skip_all)]
    pub async fn verify(&self, token: &str, resolver: &dyn KeyResolver) -> Result<TokenClaims> {
        let mut stage = None;
        let result = self.run_stages(token, resolver, &mut stage).await;
        if let Err(e) = &result {
            tracing::debug!(passed = ?stage, error = %e, "token rejected");
        }
        result
    }

    async fn run_stages(
        &self,
        token: &str,
        resolver: &dyn KeyResolver,
        stage: &mut Option<VerifyStage>,
    ) -> Result<TokenClaims> {
        let parsed = ParsedToken::parse(token)?;
        *stage = Some(VerifyStage::Parsed);

        let key = resolver.resolve(parsed.session_id).await?;
        *stage = Some(VerifyStage::SessionResolved);

        let claims = parsed.verify_signature(&key)?;
        *stage = Some(VerifyStage::SignatureChecked);

        claims.check_temporal(self.clock.now_millis())?;
        *stage = Some(VerifyStage::TemporalChecked);

        *stage = Some(VerifyStage::Accepted);
        Ok(claims)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use serde_json::json;
    use touno_core_storage::testutil::ManualClock;

    use super::*;
    use crate::testutil::{StaticResolver, craft_raw_token, test_keypair, test_keypair_alt};

    const HOUR: Duration = Duration::from_secs(3600);

    fn claims_at(now_ms: i64) -> TokenClaims {
        TokenClaims::new("Ann", Uuid::new_v4(), Uuid::new_v4(), "ann@example.com", now_ms, HOUR)
    }

    fn codec(clock: &ManualClock) -> TokenCodec {
        TokenCodec::new(clock.shared())
    }

    #[tokio::test]
    async fn test_sign_then_verify() {
        let clock = ManualClock::default();
        let codec = codec(&clock);
        let pair = test_keypair();
        let claims = claims_at(clock.shared().now_millis());

        let token = codec.sign(&claims, pair.private()).unwrap();
        assert_eq!(token.split('.').count(), 3);

        let verified = codec.verify(&token, &StaticResolver::new(pair.public())).await.unwrap();
        assert_eq!(verified, claims);
    }

    #[tokio::test]
    async fn test_header_declares_pinned_algorithm() {
        let clock = ManualClock::default();
        let token = codec(&clock).sign(&claims_at(0), test_keypair().private()).unwrap();
        let header = jsonwebtoken::decode_header(&token).unwrap();
        assert_eq!(header.alg, PINNED_ALGORITHM);
        assert_eq!(header.typ.as_deref(), Some("JWT"));
    }

    #[tokio::test]
    async fn test_claims_have_millisecond_window() {
        let claims = claims_at(1_000);
        assert_eq!(claims.nbf, 1_000);
        assert_eq!(claims.iat, 1_000);
        assert_eq!(claims.exp, 1_000 + 3_600_000);
    }

    #[tokio::test]
    async fn test_wrong_key_is_invalid_signature() {
        let clock = ManualClock::default();
        let codec = codec(&clock);
        let claims = claims_at(clock.shared().now_millis());
        let token = codec.sign(&claims, test_keypair().private()).unwrap();

        let result = codec.verify(&token, &StaticResolver::new(test_keypair_alt().public())).await;
        assert!(matches!(result, Err(AuthError::InvalidSignature)));
    }

    #[tokio::test]
    async fn test_expired_only_after_signature() {
        let clock = ManualClock::default();
        let codec = codec(&clock);
        let pair = test_keypair();
        let token = codec.sign(&claims_at(clock.shared().now_millis()), pair.private()).unwrap();

        clock.advance(HOUR);
        let result = codec.verify(&token, &StaticResolver::new(pair.public())).await;
        assert!(matches!(result, Err(AuthError::TokenExpired)), "exp is exclusive: {result:?}");

        let result = codec.verify(&token, &StaticResolver::new(test_keypair_alt().public())).await;
        assert!(matches!(result, Err(AuthError::InvalidSignature)));
    }

    #[tokio::test]
    async fn test_not_yet_valid() {
        let clock = ManualClock::default();
        let codec = codec(&clock);
        let pair = test_keypair();
        let future = clock.shared().now_millis() + 60_000;
        let token = codec.sign(&claims_at(future), pair.private()).unwrap();

        let result = codec.verify(&token, &StaticResolver::new(pair.public())).await;
        assert!(matches!(result, Err(AuthError::TokenNotYetValid)));
    }

    #[tokio::test]
    async fn test_inverted_window_is_malformed() {
        let clock = ManualClock::default();
        let codec = codec(&clock);
        let pair = test_keypair();
        let now = clock.shared().now_millis();
        let mut claims = claims_at(now - 1_000);
        claims.iat = claims.exp + 1;
        let token = codec.sign(&claims, pair.private()).unwrap();

        let result = codec.verify(&token, &StaticResolver::new(pair.public())).await;
        assert!(matches!(result, Err(AuthError::MalformedToken { .. })), "{result:?}");
    }

    #[tokio::test]
    async fn test_structural_violations_are_malformed() {
        let clock = ManualClock::default();
        let codec = codec(&clock);
        let resolver = StaticResolver::new(test_keypair().public());

        for token in ["", "a.b", "a.b.c.d", "..", "a..c", "!!!.e30.c"] {
            let result = codec.verify(token, &resolver).await;
            assert!(
                matches!(result, Err(AuthError::MalformedToken { .. })),
                "{token:?}: {result:?}"
            );
        }
        assert_eq!(resolver.calls(), 0, "no key lookup for malformed tokens");
    }

    #[tokio::test]
    async fn test_non_uuid_session_is_malformed() {
        let clock = ManualClock::default();
        let resolver = StaticResolver::new(test_keypair().public());
        let token = craft_raw_token(&json!({"alg": "PS256", "typ": "JWT"}), &json!({"jti": "abc"}));
        let token = format!("{token}c2ln");

        let result = codec(&clock).verify(&token, &resolver).await;
        assert!(matches!(result, Err(AuthError::MalformedToken { .. })));
        assert_eq!(resolver.calls(), 0);
    }

    #[tokio::test]
    async fn test_check_temporal_boundaries() {
        let claims = claims_at(1_000);
        assert!(claims.check_temporal(1_000).is_ok());
        assert!(claims.check_temporal(claims.exp - 1).is_ok());
        assert!(matches!(claims.check_temporal(claims.exp), Err(AuthError::TokenExpired)));
        assert!(matches!(claims.check_temporal(999), Err(AuthError::TokenNotYetValid)));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        /// A freshly built claim set is valid from `iat` up to, but not
        /// including, `exp`.
        #[test]
        fn fresh_claims_window_holds(
            issued_at in 0i64..4_102_444_800_000,
            lifetime_ms in 1u64..=31_536_000_000,
            offset in any::<prop::sample::Index>(),
        ) {
            let lifetime = Duration::from_millis(lifetime_ms);
            let claims =
                TokenClaims::new("d", Uuid::nil(), Uuid::nil(), "i", issued_at, lifetime);
            let inside = issued_at + i64::try_from(offset.index(lifetime_ms as usize)).unwrap();

            prop_assert!(claims.check_temporal(inside).is_ok());
            prop_assert!(matches!(claims.check_temporal(claims.exp), Err(AuthError::TokenExpired)));
            prop_assert!(matches!(
                claims.check_temporal(issued_at - 1),
                Err(AuthError::TokenNotYetValid)
            ));
        }
    }
}
