//! Transaction token issuance.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use super::handler::TokenRequest;
use crate::access::AccessRequest;
use crate::error::TratError;
use crate::keys::KeyManager;
use crate::rules::{GenerationRuleMatcher, RuleStore};
use crate::subject::SubjectTokenHandler;
use crate::token::TxnTokenClaims;

/// Turns a validated [`TokenRequest`] into a signed transaction token.
///
/// Steps run strictly in order: caller check, subject verification, rule
/// match, access evaluation, signing. Nothing is signed unless every earlier
/// step succeeded, and issuance mutates no shared state.
pub struct TokenService {
    rules: Arc<RuleStore>,
    keys: Arc<KeyManager>,
}

/// Issued token result.
#[derive(Debug)]
pub struct IssuedToken {
    /// The signed JWT.
    pub token: String,
    /// Transaction id carried in `txn`.
    pub txn: String,
    pub purpose: String,
    /// Expires in seconds.
    pub expires_in: u64,
}

impl TokenService {
    pub fn new(rules: Arc<RuleStore>, keys: Arc<KeyManager>) -> Self {
        Self { rules, keys }
    }

    pub fn rules(&self) -> &Arc<RuleStore> {
        &self.rules
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    /// Issue a transaction token for `request` on behalf of `caller`.
    pub async fn generate_token(
        &self,
        caller: Option<&str>,
        request: &TokenRequest,
    ) -> Result<IssuedToken, TratError> {
        // One generation of the rules for the whole request.
        let snapshot = self
            .rules
            .snapshot()
            .map_err(|e| TratError::Misconfigured(e.to_string()))?;

        snapshot.authorize_caller(caller)?;

        let settings = snapshot
            .service_config()
            .token
            .as_ref()
            .ok_or_else(|| TratError::Misconfigured("token settings not configured".to_string()))?;

        if request.audience != settings.audience {
            return Err(TratError::InvalidRequest(format!(
                "audience '{}' is not served by this issuer",
                request.audience
            )));
        }

        let handler = snapshot.subject_handler(request.subject_token_type)?;
        let subject_claims = handler.verify_and_parse(&request.subject_token).await?;
        let subject = handler.extract_subject(&subject_claims)?;

        let matched = snapshot.construct_purpose_and_context(&request.details)?;

        snapshot
            .access_evaluator()
            .evaluate(&AccessRequest {
                subject_claims: &subject_claims,
                purpose: &matched.purpose,
                azd: &matched.azd,
                details: &request.details,
                context: &request.context,
                path_params: &matched.path_params,
                mapping_override: matched.access_mapping.as_ref(),
            })
            .await?;

        let lifetime = settings.lifetime().map_err(TratError::Misconfigured)?;
        let iat = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .map_err(|e| TratError::SigningFailure(format!("system clock: {}", e)))?;
        let expires_in = lifetime.as_secs().max(1);

        let claims = TxnTokenClaims {
            iss: settings.issuer.clone(),
            aud: settings.audience.clone(),
            exp: iat + expires_in,
            iat,
            txn: uuid::Uuid::new_v4().to_string(),
            sub: subject,
            purp: matched.purpose,
            azd: matched.azd,
            rctx: request.context.clone(),
        };

        let token = self.keys.sign(&claims)?;

        debug!(rule = %matched.rule_name, sub = %claims.sub.value(), "Transaction token signed");
        info!(
            txn = %claims.txn,
            purpose = %claims.purp,
            method = %request.details.method,
            endpoint = %request.details.endpoint,
            "Issued transaction token"
        );

        Ok(IssuedToken {
            token,
            txn: claims.txn,
            purpose: claims.purp,
            expires_in,
        })
    }
}
