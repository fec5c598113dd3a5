use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::errors::AuthError;
use crate::ids::{PrincipalId, SessionId};

type HmacSha256 = Hmac<Sha256>;

/// Token format: `fbc1.<base64url(claims JSON)>.<base64url(hmac-sha256)>`.
const TOKEN_PREFIX: &str = "fbc1";

/// Default channel credential lifetime. Deliberately much shorter than a
/// dialogue session: a credential is consumed once at upgrade time.
pub const DEFAULT_CREDENTIAL_TTL: Duration = Duration::from_secs(300);

/// Claims carried inside a channel credential.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Claims {
    sid: String,
    pid: String,
    iat: i64,
    exp: i64,
    nonce: String,
}

/// What a verified credential proves: who the caller is and which session
/// the credential was scoped to. Times are unix seconds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelClaims {
    pub session_id: SessionId,
    pub principal_id: PrincipalId,
    pub issued_at: i64,
    pub expires_at: i64,
}

/// Mints and verifies channel credentials with a shared HMAC key.
///
/// Stateless: nothing is persisted, nothing can be revoked. A verified
/// credential proves identity and session scope at a point in time; session
/// ownership must still be checked against the directory before binding.
pub struct SessionAuthenticator {
    key: SecretString,
}

impl SessionAuthenticator {
    pub fn new(key: SecretString) -> Self {
        Self { key }
    }

    /// Mint a credential binding `principal_id` to `session_id` for `ttl`.
    pub fn mint(
        &self,
        session_id: &SessionId,
        principal_id: &PrincipalId,
        ttl: Duration,
    ) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sid: session_id.to_string(),
            pid: principal_id.to_string(),
            iat: now,
            exp: now + ttl.as_secs() as i64,
            nonce: format!("{:032x}", rand::random::<u128>()),
        };
        let body = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&claims)
                .map_err(|e| AuthError::Malformed(format!("claims encoding: {e}")))?,
        );
        let sig = URL_SAFE_NO_PAD.encode(self.sign(body.as_bytes())?);
        Ok(format!("{TOKEN_PREFIX}.{body}.{sig}"))
    }

    /// Validate `token` and check it is scoped to `claimed`.
    pub fn authenticate(
        &self,
        token: &str,
        claimed: &SessionId,
    ) -> Result<ChannelClaims, AuthError> {
        let parts: Vec<&str> = token.split('.').collect();
        let [prefix, body, sig] = parts.as_slice() else {
            return Err(AuthError::Malformed("expected three token parts".into()));
        };
        if *prefix != TOKEN_PREFIX {
            return Err(AuthError::Malformed(format!("unknown token prefix {prefix:?}")));
        }

        let sig_bytes = URL_SAFE_NO_PAD
            .decode(sig)
            .map_err(|_| AuthError::Malformed("signature is not base64url".into()))?;
        let mut mac = HmacSha256::new_from_slice(self.key.expose_secret().as_bytes())
            .map_err(|_| AuthError::Malformed("signing key rejected".into()))?;
        mac.update(body.as_bytes());
        mac.verify_slice(&sig_bytes)
            .map_err(|_| AuthError::Malformed("signature mismatch".into()))?;

        let claims_json = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| AuthError::Malformed("claims are not base64url".into()))?;
        let claims: Claims = serde_json::from_slice(&claims_json)
            .map_err(|e| AuthError::Malformed(format!("claims are not valid JSON: {e}")))?;

        if claims.exp <= Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }
        if claims.sid != claimed.as_str() {
            return Err(AuthError::SessionMismatch);
        }

        Ok(ChannelClaims {
            session_id: SessionId::from_raw(claims.sid),
            principal_id: PrincipalId::from_raw(claims.pid),
            issued_at: claims.iat,
            expires_at: claims.exp,
        })
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, AuthError> {
        let mut mac = HmacSha256::new_from_slice(self.key.expose_secret().as_bytes())
            .map_err(|_| AuthError::Malformed("signing key rejected".into()))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator() -> SessionAuthenticator {
        SessionAuthenticator::new(SecretString::from("test-signing-key"))
    }

    #[test]
    fn mint_then_authenticate() {
        let auth = authenticator();
        let sid = SessionId::new();
        let pid = PrincipalId::new();
        let token = auth.mint(&sid, &pid, DEFAULT_CREDENTIAL_TTL).unwrap();

        let claims = auth.authenticate(&token, &sid).unwrap();
        assert_eq!(claims.session_id, sid);
        assert_eq!(claims.principal_id, pid);
        assert!(claims.expires_at > claims.issued_at);
    }

    #[test]
    fn token_has_expected_shape() {
        let auth = authenticator();
        let token = auth
            .mint(&SessionId::new(), &PrincipalId::new(), DEFAULT_CREDENTIAL_TTL)
            .unwrap();
        assert!(token.starts_with("fbc1."), "got: {token}");
        assert_eq!(token.split('.').count(), 3);
    }

    #[test]
    fn expired_credential_rejected() {
        let auth = authenticator();
        let sid = SessionId::new();
        let token = auth
            .mint(&sid, &PrincipalId::new(), Duration::ZERO)
            .unwrap();
        let err = auth.authenticate(&token, &sid).unwrap_err();
        assert!(matches!(err, AuthError::Expired), "got: {err}");
    }

    #[test]
    fn wrong_session_rejected() {
        let auth = authenticator();
        let token = auth
            .mint(&SessionId::new(), &PrincipalId::new(), DEFAULT_CREDENTIAL_TTL)
            .unwrap();
        let err = auth.authenticate(&token, &SessionId::new()).unwrap_err();
        assert!(matches!(err, AuthError::SessionMismatch), "got: {err}");
    }

    #[test]
    fn tampered_signature_rejected() {
        let auth = authenticator();
        let sid = SessionId::new();
        let token = auth.mint(&sid, &PrincipalId::new(), DEFAULT_CREDENTIAL_TTL).unwrap();

        let mut tampered = token.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == 'A' { 'B' } else { 'A' });

        let err = auth.authenticate(&tampered, &sid).unwrap_err();
        assert!(matches!(err, AuthError::Malformed(_)), "got: {err}");
    }

    #[test]
    fn tampered_claims_rejected() {
        let auth = authenticator();
        let sid = SessionId::new();
        let token = auth.mint(&sid, &PrincipalId::new(), DEFAULT_CREDENTIAL_TTL).unwrap();

        let parts: Vec<&str> = token.split('.').collect();
        let other = Claims {
            sid: sid.to_string(),
            pid: PrincipalId::new().to_string(),
            iat: 0,
            exp: i64::MAX,
            nonce: "0".into(),
        };
        let forged_body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&other).unwrap());
        let forged = format!("{}.{}.{}", parts[0], forged_body, parts[2]);

        let err = auth.authenticate(&forged, &sid).unwrap_err();
        assert!(matches!(err, AuthError::Malformed(_)), "got: {err}");
    }

    #[test]
    fn garbage_tokens_rejected() {
        let auth = authenticator();
        let sid = SessionId::new();
        for bad in ["", "hello", "fbc1.only-two", "xyz9.a.b", "fbc1.%%%.%%%"] {
            let err = auth.authenticate(bad, &sid).unwrap_err();
            assert!(matches!(err, AuthError::Malformed(_)), "token {bad:?} gave {err}");
        }
    }

    #[test]
    fn different_key_rejected() {
        let minter = authenticator();
        let verifier = SessionAuthenticator::new(SecretString::from("another-key"));
        let sid = SessionId::new();
        let token = minter.mint(&sid, &PrincipalId::new(), DEFAULT_CREDENTIAL_TTL).unwrap();

        let err = verifier.authenticate(&token, &sid).unwrap_err();
        assert!(matches!(err, AuthError::Malformed(_)), "got: {err}");
    }

    #[test]
    fn nonce_makes_tokens_unique() {
        let auth = authenticator();
        let sid = SessionId::new();
        let pid = PrincipalId::new();
        let a = auth.mint(&sid, &pid, DEFAULT_CREDENTIAL_TTL).unwrap();
        let b = auth.mint(&sid, &pid, DEFAULT_CREDENTIAL_TTL).unwrap();
        assert_ne!(a, b);
    }
}
