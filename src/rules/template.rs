//! Path templates such as `/api/order/{#id}` and the per-method route index.

use regex::Regex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use super::types::HttpMethod;

/// Top-level keys of the extraction and access-evaluation input documents.
/// Path placeholders share that namespace and may not shadow them.
pub const RESERVED_PLACEHOLDERS: &[&str] = &[
    "body",
    "headers",
    "queryParameters",
    "subject_token",
    "purp",
    "azd",
    "request_details",
    "request_context",
];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("path template '{0}' must start with '/'")]
    NotAbsolute(String),

    #[error("path template '{0}' has unbalanced placeholder braces")]
    Unbalanced(String),

    #[error("path template '{template}' has invalid placeholder name '{name}'")]
    InvalidName { template: String, name: String },

    #[error("placeholder '{name}' in '{template}' is reserved")]
    Reserved { template: String, name: String },

    #[error("placeholder '{name}' appears more than once in '{template}'")]
    Duplicate { template: String, name: String },

    #[error("templates '{first}' and '{second}' overlap for {method}")]
    Ambiguous {
        method: HttpMethod,
        first: String,
        second: String,
    },

    #[error("path template '{template}' does not compile: {message}")]
    Pattern { template: String, message: String },
}

/// How much literal text a segment pins down. Ordered least to most specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SegmentKind {
    Placeholder,
    Mixed,
    Literal,
}

/// A compiled path template.
#[derive(Debug, Clone)]
pub struct PathTemplate {
    raw: String,
    pattern: Regex,
    params: Vec<String>,
    shape: String,
    specificity: Vec<SegmentKind>,
}

impl PathTemplate {
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        if !raw.starts_with('/') {
            return Err(TemplateError::NotAbsolute(raw.to_string()));
        }

        let mut pattern = String::from("^");
        let mut shape = String::new();
        let mut params: Vec<String> = Vec::new();
        let mut specificity = Vec::new();

        for segment in raw.split('/').skip(1) {
            pattern.push('/');
            shape.push('/');

            let mut rest = segment;
            let mut literal_chars = 0usize;
            let mut placeholders = 0usize;
            while !rest.is_empty() {
                match rest.find(['{', '}']) {
                    Some(start) if rest[start..].starts_with("{#") => {
                        let literal = &rest[..start];
                        pattern.push_str(&regex::escape(literal));
                        shape.push_str(literal);
                        literal_chars += literal.len();

                        let after = &rest[start + 2..];
                        let end = after
                            .find('}')
                            .ok_or_else(|| TemplateError::Unbalanced(raw.to_string()))?;
                        let name = &after[..end];
                        validate_name(raw, name, &params)?;

                        pattern.push_str(&format!("(?P<{}>[^/]+)", name));
                        shape.push_str("{}");
                        params.push(name.to_string());
                        placeholders += 1;
                        rest = &after[end + 1..];
                    }
                    Some(_) => return Err(TemplateError::Unbalanced(raw.to_string())),
                    None => {
                        pattern.push_str(&regex::escape(rest));
                        shape.push_str(rest);
                        literal_chars += rest.len();
                        rest = "";
                    }
                }
            }

            specificity.push(match (placeholders, literal_chars) {
                (0, _) => SegmentKind::Literal,
                (_, 0) => SegmentKind::Placeholder,
                _ => SegmentKind::Mixed,
            });
        }
        pattern.push('$');

        let pattern = Regex::new(&pattern).map_err(|e| TemplateError::Pattern {
            template: raw.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            raw: raw.to_string(),
            pattern,
            params,
            shape,
            specificity,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Match a concrete path, returning the captured placeholders.
    pub fn matches(&self, path: &str) -> Option<BTreeMap<String, String>> {
        let captures = self.pattern.captures(path)?;
        Some(
            self.params
                .iter()
                .filter_map(|name| {
                    captures
                        .name(name)
                        .map(|m| (name.clone(), m.as_str().to_string()))
                })
                .collect(),
        )
    }

    /// True when both templates match exactly the same paths.
    pub fn is_equivalent(&self, other: &PathTemplate) -> bool {
        self.shape == other.shape
    }

    /// Most specific first; ties resolved by template text.
    fn precedence(&self, other: &PathTemplate) -> Ordering {
        other
            .specificity
            .cmp(&self.specificity)
            .then_with(|| self.raw.cmp(&other.raw))
    }
}

fn validate_name(template: &str, name: &str, seen: &[String]) -> Result<(), TemplateError> {
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(TemplateError::InvalidName {
            template: template.to_string(),
            name: name.to_string(),
        });
    }
    if RESERVED_PLACEHOLDERS.contains(&name) {
        return Err(TemplateError::Reserved {
            template: template.to_string(),
            name: name.to_string(),
        });
    }
    if seen.iter().any(|s| s == name) {
        return Err(TemplateError::Duplicate {
            template: template.to_string(),
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Routes grouped by method, each group sorted by precedence.
#[derive(Debug)]
pub struct TemplateIndex<T> {
    routes: HashMap<HttpMethod, Vec<(PathTemplate, T)>>,
}

impl<T> Default for TemplateIndex<T> {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }
}

impl<T> TemplateIndex<T> {
    /// Build the index, rejecting equivalent templates under one method.
    pub fn build<I>(entries: I) -> Result<Self, TemplateError>
    where
        I: IntoIterator<Item = (HttpMethod, PathTemplate, T)>,
    {
        let mut routes: HashMap<HttpMethod, Vec<(PathTemplate, T)>> = HashMap::new();
        for (method, template, value) in entries {
            let group = routes.entry(method).or_default();
            if let Some((existing, _)) = group.iter().find(|(t, _)| t.is_equivalent(&template)) {
                return Err(TemplateError::Ambiguous {
                    method,
                    first: existing.raw.clone(),
                    second: template.raw,
                });
            }
            group.push((template, value));
        }
        for group in routes.values_mut() {
            group.sort_by(|(a, _), (b, _)| a.precedence(b));
        }
        Ok(Self { routes })
    }

    /// The most specific route matching `(method, path)`.
    pub fn find(&self, method: HttpMethod, path: &str) -> Option<(&T, BTreeMap<String, String>)> {
        self.routes.get(&method)?.iter().find_map(|(template, value)| {
            template.matches(path).map(|params| (value, params))
        })
    }

    pub fn len(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
