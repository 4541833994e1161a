//! Transaction token verification for resource services.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{crypto, decode_header, get_current_timestamp};
use std::sync::Arc;
use tracing::debug;

use super::binding::{InboundRequest, RequestBinder};
use crate::error::VerificationError;
use crate::jwks::{JwksCache, JwksError};
use crate::token::{TxnTokenClaims, TXN_TOKEN_TYP};

/// Dedicated transport header.
pub const TXN_TOKEN_HEADER: &str = "txn-token";

/// Verifies tokens from one issuer for one audience.
pub struct TxnTokenVerifier {
    issuer: String,
    audience: String,
    keys: Arc<JwksCache>,
    leeway: u64,
    binder: Option<RequestBinder>,
}

impl TxnTokenVerifier {
    pub fn new(issuer: &str, audience: &str, keys: Arc<JwksCache>) -> Self {
        Self {
            issuer: issuer.to_string(),
            audience: audience.to_string(),
            keys,
            leeway: 0,
            binder: None,
        }
    }

    /// Clock skew allowance in seconds.
    pub fn with_leeway(mut self, leeway: u64) -> Self {
        self.leeway = leeway;
        self
    }

    pub fn with_binder(mut self, binder: RequestBinder) -> Self {
        self.binder = Some(binder);
        self
    }

    /// Check signature, `typ`, expiry, issuer and audience.
    pub async fn parse_and_verify(&self, token: &str) -> Result<TxnTokenClaims, VerificationError> {
        let header = decode_header(token)
            .map_err(|e| VerificationError::Malformed(format!("invalid header: {}", e)))?;
        if header.typ.as_deref() != Some(TXN_TOKEN_TYP) {
            return Err(VerificationError::Malformed(format!(
                "unexpected token type {:?}",
                header.typ
            )));
        }
        let kid = header.kid.as_deref().ok_or(VerificationError::MissingKeyId)?;

        let key = self.keys.get_key(kid).await.map_err(|e| match e {
            JwksError::KeyNotFound(kid) => VerificationError::KeyNotFound(kid),
            other => VerificationError::KeysUnavailable(other.to_string()),
        })?;
        if !key.permits(header.alg) {
            return Err(VerificationError::UnsupportedAlgorithm(format!("{:?}", header.alg)));
        }

        // jsonwebtoken's claim pass expects a string `sub`, so signature and
        // registered claims are checked here.
        let (message, signature) = token
            .rsplit_once('.')
            .ok_or_else(|| VerificationError::Malformed("token is not a JWS".to_string()))?;
        let (_, payload) = message
            .split_once('.')
            .ok_or_else(|| VerificationError::Malformed("token is not a JWS".to_string()))?;
        let valid = crypto::verify(signature, message.as_bytes(), &key.key, header.alg)
            .map_err(|e| VerificationError::Malformed(format!("invalid signature: {}", e)))?;
        if !valid {
            return Err(VerificationError::SignatureInvalid);
        }

        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| VerificationError::Malformed(format!("invalid payload: {}", e)))?;
        let claims: TxnTokenClaims = serde_json::from_slice(&payload)
            .map_err(|e| VerificationError::Malformed(format!("invalid claims: {}", e)))?;

        if claims.exp.saturating_add(self.leeway) < get_current_timestamp() {
            return Err(VerificationError::Expired);
        }
        if claims.iss != self.issuer {
            return Err(VerificationError::IssuerMismatch);
        }
        if claims.aud != self.audience {
            return Err(VerificationError::AudienceMismatch);
        }

        debug!(txn = %claims.txn, purpose = %claims.purp, "Transaction token verified");
        Ok(claims)
    }

    /// Verify the token carried by `request` and bind it to the request.
    ///
    /// A verifier without binding rules knows no routes and rejects every
    /// request with [`VerificationError::UnknownRoute`].
    pub async fn verify_request(
        &self,
        request: &InboundRequest,
    ) -> Result<TxnTokenClaims, VerificationError> {
        let token = extract_token(request).ok_or(VerificationError::MissingToken)?;
        let claims = self.parse_and_verify(token).await?;
        let binder = self.binder.as_ref().ok_or_else(|| VerificationError::UnknownRoute {
            method: request.method,
            path: request.path.clone(),
        })?;
        binder.bind(&claims, request)?;
        Ok(claims)
    }
}

/// Token from the `Txn-Token` header, else from `Authorization: Bearer`.
pub fn extract_token(request: &InboundRequest) -> Option<&str> {
    if let Some(token) = request.header(TXN_TOKEN_HEADER) {
        return Some(token.trim()).filter(|t| !t.is_empty());
    }
    let authorization = request.header("authorization")?;
    let (scheme, token) = authorization.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        Some(token.trim()).filter(|t| !t.is_empty())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwks::{Jwk, Jwks};
    use crate::rules::{AzdValue, HttpMethod};
    use crate::testing;
    use crate::token::SubjectIdentifier;
    use crate::verify::VerificationRules;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde_json::json;

    const ISSUER: &str = "https://txn.example.com";
    const AUDIENCE: &str = "stocks.example.com";

    fn trade_claims() -> TxnTokenClaims {
        TxnTokenClaims {
            iss: ISSUER.to_string(),
            aud: AUDIENCE.to_string(),
            exp: testing::now() + 60,
            iat: testing::now(),
            txn: "0d6c1e5a-9b3c-4a3a-9a53-0d2c1f0e6a11".to_string(),
            sub: SubjectIdentifier::Email {
                email: "alice@example.com".to_string(),
            },
            purp: "StocksTrade".to_string(),
            azd: serde_json::from_value(json!({"action": "Buy", "stockID": 42, "quantity": 5}))
                .unwrap(),
            rctx: Default::default(),
        }
    }

    fn verifier() -> TxnTokenVerifier {
        let keys = testing::key_manager().public_jwks().unwrap();
        TxnTokenVerifier::new(ISSUER, AUDIENCE, Arc::new(JwksCache::from_jwks(&keys).unwrap()))
    }

    fn binder() -> RequestBinder {
        let rules = VerificationRules::from_yaml(
            r#"
rules:
  - method: POST
    path: /api/order
    purpose: StocksTrade
    bindings:
      - { field: action, source: { body: orderType } }
      - { field: stockID, source: { body: stockID }, kind: integer }
      - { field: quantity, source: { body: quantity }, kind: integer }
"#,
        )
        .unwrap();
        RequestBinder::new(rules.rules, "x-user-name").unwrap()
    }

    #[tokio::test]
    async fn test_round_trip() {
        let token = testing::key_manager().sign(&trade_claims()).unwrap();
        let claims = verifier().parse_and_verify(&token).await.unwrap();
        assert_eq!(claims, trade_claims());
    }

    #[tokio::test]
    async fn test_bound_request_and_tampering() {
        let token = testing::key_manager().sign(&trade_claims()).unwrap();
        let verifier = verifier().with_binder(binder());

        let request = |quantity: i64| {
            InboundRequest::new(HttpMethod::Post, "/api/order")
                .with_header("Txn-Token", &token)
                .with_header("X-User-Name", "alice@example.com")
                .with_body(json!({"orderType": "Buy", "stockID": 42, "quantity": quantity}))
        };

        assert!(verifier.verify_request(&request(5)).await.is_ok());
        assert!(matches!(
            verifier.verify_request(&request(5000)).await,
            Err(VerificationError::FieldMismatch(field)) if field == "quantity"
        ));
    }

    #[tokio::test]
    async fn test_verifier_without_rules_knows_no_routes() {
        let token = testing::key_manager().sign(&trade_claims()).unwrap();
        let request = InboundRequest::new(HttpMethod::Delete, "/admin/wipe")
            .with_header("Txn-Token", &token)
            .with_header("X-User-Name", "alice@example.com");

        let err = verifier().verify_request(&request).await.unwrap_err();
        assert!(matches!(
            &err,
            VerificationError::UnknownRoute { method: HttpMethod::Delete, path }
                if path == "/admin/wipe"
        ));
        assert_eq!(err.status_code(), 403);

        let err = verifier()
            .with_binder(binder())
            .verify_request(&request)
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::UnknownRoute { .. }));
    }

    #[tokio::test]
    async fn test_expiry_leeway() {
        let mut claims = trade_claims();
        claims.exp = testing::now() - 30;
        let token = testing::key_manager().sign(&claims).unwrap();

        assert!(matches!(
            verifier().parse_and_verify(&token).await,
            Err(VerificationError::Expired)
        ));
        assert!(verifier().with_leeway(60).parse_and_verify(&token).await.is_ok());
    }

    #[tokio::test]
    async fn test_removed_key_is_not_found() {
        let token = testing::key_manager().sign(&trade_claims()).unwrap();
        let verifier = TxnTokenVerifier::new(
            ISSUER,
            AUDIENCE,
            Arc::new(JwksCache::from_jwks(&testing::idp_jwks()).unwrap()),
        );
        let err = verifier.parse_and_verify(&token).await.unwrap_err();
        assert!(matches!(err, VerificationError::KeyNotFound(kid) if kid == testing::SIGNING_KID));
    }

    #[tokio::test]
    async fn test_modified_payload_fails_signature() {
        let token = testing::key_manager().sign(&trade_claims()).unwrap();
        let parts: Vec<&str> = token.split('.').collect();

        let mut forged = trade_claims();
        forged.azd.insert("quantity".to_string(), AzdValue::from(5000i64));
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());
        let tampered = format!("{}.{}.{}", parts[0], payload, parts[2]);

        assert!(matches!(
            verifier().parse_and_verify(&tampered).await,
            Err(VerificationError::SignatureInvalid)
        ));
    }

    #[tokio::test]
    async fn test_issuer_audience_and_expiry() {
        let keys = testing::key_manager();

        let mut claims = trade_claims();
        claims.aud = "payments.example.com".to_string();
        assert!(matches!(
            verifier().parse_and_verify(&keys.sign(&claims).unwrap()).await,
            Err(VerificationError::AudienceMismatch)
        ));

        let mut claims = trade_claims();
        claims.iss = "https://rogue.example.com".to_string();
        assert!(matches!(
            verifier().parse_and_verify(&keys.sign(&claims).unwrap()).await,
            Err(VerificationError::IssuerMismatch)
        ));

        let mut claims = trade_claims();
        claims.exp = testing::now() - 120;
        assert!(matches!(
            verifier().parse_and_verify(&keys.sign(&claims).unwrap()).await,
            Err(VerificationError::Expired)
        ));
    }

    #[tokio::test]
    async fn test_header_requirements() {
        let key = EncodingKey::from_rsa_pem(testing::SIGNING_KEY_PEM.as_bytes()).unwrap();

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(testing::SIGNING_KID.to_string());
        let untyped = encode(&header, &trade_claims(), &key).unwrap();
        assert!(matches!(
            verifier().parse_and_verify(&untyped).await,
            Err(VerificationError::Malformed(_))
        ));

        let mut header = Header::new(Algorithm::RS256);
        header.typ = Some(TXN_TOKEN_TYP.to_string());
        let no_kid = encode(&header, &trade_claims(), &key).unwrap();
        assert!(matches!(
            verifier().parse_and_verify(&no_kid).await,
            Err(VerificationError::MissingKeyId)
        ));
    }

    #[tokio::test]
    async fn test_elliptic_curve_keys() {
        let jwks = Jwks {
            keys: vec![Jwk {
                kty: "EC".to_string(),
                kid: Some("ec-1".to_string()),
                alg: Some("ES256".to_string()),
                key_use: Some("sig".to_string()),
                n: None,
                e: None,
                crv: Some("P-256".to_string()),
                x: Some("CF8Ghx4NklFQsMPSdppQKg8wPvwzmYOJiJqRJiVL_r0".to_string()),
                y: Some("2yvEkDo4YjTRdPKujeoosusfRnMuhYk0_nxrnjRXC_0".to_string()),
            }],
        };
        let keys = Arc::new(JwksCache::from_jwks(&jwks).unwrap());
        let verifier = TxnTokenVerifier::new(ISSUER, AUDIENCE, keys);

        let mut header = Header::new(Algorithm::ES256);
        header.typ = Some(TXN_TOKEN_TYP.to_string());
        header.kid = Some("ec-1".to_string());
        let pem = include_bytes!("../../tests/fixtures/ec_p256_key.pem");
        let key = EncodingKey::from_ec_pem(pem).unwrap();
        let token = encode(&header, &trade_claims(), &key).unwrap();

        assert_eq!(verifier.parse_and_verify(&token).await.unwrap(), trade_claims());

        let rsa_token = testing::key_manager().sign(&trade_claims()).unwrap();
        assert!(matches!(
            verifier.parse_and_verify(&rsa_token).await,
            Err(VerificationError::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_token_transport() {
        let request = InboundRequest::new(HttpMethod::Get, "/api/stocks")
            .with_header("Authorization", "Bearer abc.def.ghi");
        assert_eq!(extract_token(&request), Some("abc.def.ghi"));

        let request = request.with_header("Txn-Token", "jkl.mno.pqr");
        assert_eq!(extract_token(&request), Some("jkl.mno.pqr"));

        let request = InboundRequest::new(HttpMethod::Get, "/api/stocks")
            .with_header("Authorization", "Basic dXNlcjpwYXNz");
        assert_eq!(extract_token(&request), None);
        assert!(matches!(
            verifier().verify_request(&request).await,
            Err(VerificationError::MissingToken)
        ));
    }
}
