//! The live generation rule set and its request matcher.
//!
//! Readers take an `Arc` snapshot under a short read lock and work on it
//! without holding the lock. Every mutation builds a complete new snapshot
//! (rules, route index, hash) and swaps it in under the write lock, so a
//! reader sees either the old generation or the new one, never a mix.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use super::config::ServiceConfig;
use super::template::{PathTemplate, TemplateIndex};
use super::types::{GenerationRule, GenerationRuleSet, HttpMethod};
use super::value::{AzdValue, ValueSource};
use crate::access::AccessEvaluator;
use crate::error::{RuleSetError, TratError};
use crate::exchange::{RequestDetails, TokenType};
use crate::subject::{SubjectHandler, SubjectTokenHandlers};

/// Matches requests to rules and derives purpose and authorization context.
pub trait GenerationRuleMatcher {
    fn match_rule(&self, method: HttpMethod, path: &str) -> Result<RuleMatch<'_>, TratError>;

    fn construct_purpose_and_context(
        &self,
        details: &RequestDetails,
    ) -> Result<PurposeAndContext, TratError>;
}

/// A rule with its field sources parsed.
#[derive(Debug)]
pub struct CompiledRule {
    rule: GenerationRule,
    fields: Vec<(String, bool, ValueSource)>,
}

impl CompiledRule {
    fn compile(rule: GenerationRule) -> Result<Self, RuleSetError> {
        let fields = rule
            .azd_mapping
            .iter()
            .map(|(name, field)| {
                ValueSource::parse(&field.value)
                    .map(|source| (name.clone(), field.required, source))
                    .map_err(|source| RuleSetError::Mapping {
                        rule: rule.name.clone(),
                        field: name.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rule, fields })
    }

    pub fn rule(&self) -> &GenerationRule {
        &self.rule
    }

    /// Evaluate every field against the input document.
    ///
    /// A required field that misses fails the whole derivation; an optional
    /// one is left out.
    pub fn authorization_context(
        &self,
        doc: &Value,
    ) -> Result<BTreeMap<String, AzdValue>, TratError> {
        let mut azd = BTreeMap::new();
        for (name, required, source) in &self.fields {
            match source.resolve(doc) {
                Ok(value) => {
                    azd.insert(name.clone(), value);
                }
                Err(e) if *required => {
                    return Err(TratError::AuthorizationContext {
                        field: name.clone(),
                        source: e,
                    })
                }
                Err(e) => debug!(field = %name, error = %e, "Optional azd field omitted"),
            }
        }
        Ok(azd)
    }
}

/// A matched rule and the placeholders its template captured.
pub struct RuleMatch<'a> {
    pub rule: &'a CompiledRule,
    pub path_params: BTreeMap<String, String>,
}

/// Output of the matcher for one request.
#[derive(Debug, Clone)]
pub struct PurposeAndContext {
    pub rule_name: String,
    pub purpose: String,
    pub azd: BTreeMap<String, AzdValue>,
    pub path_params: BTreeMap<String, String>,
    pub access_mapping: Option<Value>,
}

/// Runtime objects built from a [`ServiceConfig`].
pub struct ServiceComponents {
    pub subject_handlers: SubjectTokenHandlers,
    pub access_evaluator: AccessEvaluator,
}

impl ServiceComponents {
    pub fn empty() -> Self {
        Self {
            subject_handlers: SubjectTokenHandlers::default(),
            access_evaluator: AccessEvaluator::disabled(),
        }
    }

    /// Build handlers and evaluator. May perform network discovery.
    pub async fn build(
        config: &ServiceConfig,
        http_client: &reqwest::Client,
    ) -> Result<Self, RuleSetError> {
        config.validate().map_err(RuleSetError::Invalid)?;
        let subject_handlers = SubjectTokenHandlers::build(&config.subject_tokens, http_client)
            .await
            .map_err(RuleSetError::Components)?;
        let access_evaluator = AccessEvaluator::new(&config.access_evaluation, http_client.clone())
            .map_err(RuleSetError::Components)?;
        if config.authorized_callers.is_empty() {
            warn!("No authorized callers configured; any caller may request transaction tokens");
        }
        Ok(Self {
            subject_handlers,
            access_evaluator,
        })
    }
}

/// One immutable generation of the rule set.
pub struct RuleSnapshot {
    rule_set: GenerationRuleSet,
    index: TemplateIndex<CompiledRule>,
    components: Arc<ServiceComponents>,
    hash: String,
}

impl RuleSnapshot {
    fn build(
        rule_set: GenerationRuleSet,
        components: Arc<ServiceComponents>,
    ) -> Result<Self, RuleSetError> {
        rule_set.validate().map_err(RuleSetError::Invalid)?;

        let mut entries = Vec::with_capacity(rule_set.generation_rules.len());
        for rule in rule_set.generation_rules.values() {
            let template = PathTemplate::parse(&rule.path)?;
            entries.push((rule.method, template, CompiledRule::compile(rule.clone())?));
        }
        let index = TemplateIndex::build(entries)?;
        let hash = rule_set.content_hash()?;

        Ok(Self {
            rule_set,
            index,
            components,
            hash,
        })
    }

    fn empty() -> Result<Self, RuleSetError> {
        Self::build(
            GenerationRuleSet::default(),
            Arc::new(ServiceComponents::empty()),
        )
    }

    pub fn rule_set(&self) -> &GenerationRuleSet {
        &self.rule_set
    }

    pub fn service_config(&self) -> &ServiceConfig {
        &self.rule_set.service_config
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn rule_count(&self) -> usize {
        self.index.len()
    }

    pub fn subject_handler(&self, token_type: TokenType) -> Result<SubjectHandler<'_>, TratError> {
        self.components.subject_handlers.select(token_type)
    }

    pub fn access_evaluator(&self) -> &AccessEvaluator {
        &self.components.access_evaluator
    }

    /// Check the caller against the authorized-caller list.
    pub fn authorize_caller(&self, caller: Option<&str>) -> Result<(), TratError> {
        let allowed = &self.rule_set.service_config.authorized_callers;
        if allowed.is_empty() {
            return Ok(());
        }
        match caller {
            Some(id) if allowed.iter().any(|a| a == id) => Ok(()),
            Some(id) => Err(TratError::UnauthorizedCaller(id.to_string())),
            None => Err(TratError::UnauthorizedCaller("<anonymous>".to_string())),
        }
    }
}

impl GenerationRuleMatcher for RuleSnapshot {
    fn match_rule(&self, method: HttpMethod, path: &str) -> Result<RuleMatch<'_>, TratError> {
        self.index
            .find(method, path)
            .map(|(rule, path_params)| RuleMatch { rule, path_params })
            .ok_or_else(|| TratError::NoMatchingRule {
                method,
                path: path.to_string(),
            })
    }

    fn construct_purpose_and_context(
        &self,
        details: &RequestDetails,
    ) -> Result<PurposeAndContext, TratError> {
        let matched = self.match_rule(details.method, &details.endpoint)?;
        let doc = details.input_document(&matched.path_params);
        let azd = matched.rule.authorization_context(&doc)?;
        let rule = matched.rule.rule();

        debug!(rule = %rule.name, purpose = %rule.purpose, "Generation rule matched");

        Ok(PurposeAndContext {
            rule_name: rule.name.clone(),
            purpose: rule.purpose.clone(),
            azd,
            path_params: matched.path_params,
            access_mapping: rule.access_evaluation.clone(),
        })
    }
}

/// Holder of the current [`RuleSnapshot`].
pub struct RuleStore {
    current: RwLock<Arc<RuleSnapshot>>,
    http_client: reqwest::Client,
}

impl RuleStore {
    pub fn new(http_client: reqwest::Client) -> Result<Self, RuleSetError> {
        Ok(Self {
            current: RwLock::new(Arc::new(RuleSnapshot::empty()?)),
            http_client,
        })
    }

    /// The current generation. Hold it for the whole of one operation.
    pub fn snapshot(&self) -> Result<Arc<RuleSnapshot>, RuleSetError> {
        self.current
            .read()
            .map(|current| Arc::clone(&current))
            .map_err(|_| RuleSetError::Poisoned)
    }

    pub fn rules_hash(&self) -> Result<String, RuleSetError> {
        Ok(self.snapshot()?.hash().to_string())
    }

    /// Current rule set as JSON.
    pub fn rules_json(&self) -> Result<Value, RuleSetError> {
        Ok(serde_json::to_value(self.snapshot()?.rule_set())?)
    }

    /// Replace everything. Components are rebuilt only if the service
    /// config changed.
    pub async fn replace_all(&self, rule_set: GenerationRuleSet) -> Result<String, RuleSetError> {
        rule_set.validate().map_err(RuleSetError::Invalid)?;
        let components = self.components_for(&rule_set.service_config).await?;
        let next = RuleSnapshot::build(rule_set, components)?;

        let hash = self.install(next)?;
        info!(rules_hash = %hash, "Generation rule set replaced");
        Ok(hash)
    }

    /// Insert or replace one rule by name.
    pub fn upsert_rule(&self, rule: GenerationRule) -> Result<String, RuleSetError> {
        rule.validate().map_err(RuleSetError::Invalid)?;
        let name = rule.name.clone();
        let hash = self.mutate(|rule_set| {
            rule_set.generation_rules.insert(rule.name.clone(), rule);
            Ok(())
        })?;
        info!(rule = %name, rules_hash = %hash, "Generation rule upserted");
        Ok(hash)
    }

    /// Remove one rule by name.
    pub fn delete_rule(&self, name: &str) -> Result<String, RuleSetError> {
        let hash = self.mutate(|rule_set| {
            rule_set
                .generation_rules
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| RuleSetError::UnknownRule(name.to_string()))
        })?;
        info!(rule = %name, rules_hash = %hash, "Generation rule deleted");
        Ok(hash)
    }

    /// Replace the service-level configuration, keeping the rules.
    pub async fn update_service_config(
        &self,
        config: ServiceConfig,
    ) -> Result<String, RuleSetError> {
        let components = self.components_for(&config).await?;

        let mut current = self.current.write().map_err(|_| RuleSetError::Poisoned)?;
        let mut rule_set = current.rule_set.clone();
        rule_set.service_config = config;
        let next = RuleSnapshot::build(rule_set, components)?;
        let hash = next.hash.clone();
        *current = Arc::new(next);
        drop(current);

        info!(rules_hash = %hash, "Service configuration updated");
        Ok(hash)
    }

    /// Apply an edit to a copy of the current rules under the write lock.
    fn mutate<F>(&self, edit: F) -> Result<String, RuleSetError>
    where
        F: FnOnce(&mut GenerationRuleSet) -> Result<(), RuleSetError>,
    {
        let mut current = self.current.write().map_err(|_| RuleSetError::Poisoned)?;
        let mut rule_set = current.rule_set.clone();
        edit(&mut rule_set)?;
        let next = RuleSnapshot::build(rule_set, Arc::clone(&current.components))?;
        let hash = next.hash.clone();
        *current = Arc::new(next);
        Ok(hash)
    }

    fn install(&self, next: RuleSnapshot) -> Result<String, RuleSetError> {
        let hash = next.hash.clone();
        let mut current = self.current.write().map_err(|_| RuleSetError::Poisoned)?;
        *current = Arc::new(next);
        Ok(hash)
    }

    /// Reuse the current components when the config is unchanged; OIDC
    /// discovery is not repeated on every reconcile.
    async fn components_for(
        &self,
        config: &ServiceConfig,
    ) -> Result<Arc<ServiceComponents>, RuleSetError> {
        let current = self.snapshot()?;
        if serde_json::to_value(config)? == serde_json::to_value(current.service_config())? {
            return Ok(Arc::clone(&current.components));
        }
        Ok(Arc::new(
            ServiceComponents::build(config, &self.http_client).await?,
        ))
    }
}
