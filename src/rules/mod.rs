//! Generation rules: path templates, authorization-context extraction and
//! the live rule store.

pub mod config;
pub mod store;
pub mod template;
pub mod types;
pub mod value;

pub use config::{ServiceConfig, TokenSettings};
pub use store::{
    CompiledRule, GenerationRuleMatcher, PurposeAndContext, RuleMatch, RuleSnapshot, RuleStore,
    ServiceComponents,
};
pub use template::{PathTemplate, TemplateError, TemplateIndex, RESERVED_PLACEHOLDERS};
pub use types::{AzdField, GenerationRule, GenerationRuleSet, HttpMethod};
pub use value::{resolve_template, AzdValue, Expression, ExtractionError, ValueSource};
