//! Pattern matching and template substitution
//!
//! [`test`] matches a scan against a pattern of a given [`PatternType`] and
//! returns the captured groups. [`substitute`] expands `${...}` tokens in
//! action templates:
//!
//! | Token | Expands to |
//! |-------|------------|
//! | `${scan}` | the (prefixed) scan being processed |
//! | `${directive}` | the extracted directive name, or empty |
//! | `${n}` | capture group `n` (0 is the whole match) |
//! | `${field:key}` | current value of field `key` |
//!
//! Tokens that cannot be resolved are left in the output verbatim so a
//! mistyped field key is visible in the form instead of silently blanked.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a rule's pattern is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PatternType {
    #[default]
    Regex,
    /// Whole-value equality
    String,
    StartsWith,
    Contains,
    EndsWith,
}

/// Pattern errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("Invalid regex '{pattern}': {message}")]
    InvalidRegex { pattern: String, message: String },

    #[error("Pattern cannot be empty")]
    Empty,
}

/// Successful match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    /// Full match array: index 0 is the whole match, then each capture
    /// group in order. Groups that did not participate are empty.
    pub groups: Vec<String>,
    pub full_match: String,
}

/// A pattern compiled once and matched many times
#[derive(Debug, Clone)]
pub enum Matcher {
    Regex(Regex),
    Literal {
        pattern_type: PatternType,
        pattern: String,
    },
}

impl Matcher {
    /// Compile `pattern` under `pattern_type`
    pub fn compile(pattern_type: PatternType, pattern: &str) -> Result<Self, PatternError> {
        match pattern_type {
            PatternType::Regex => Regex::new(pattern)
                .map(Matcher::Regex)
                .map_err(|e| PatternError::InvalidRegex {
                    pattern: pattern.to_string(),
                    message: e.to_string(),
                }),
            _ if pattern.is_empty() => Err(PatternError::Empty),
            _ => Ok(Matcher::Literal {
                pattern_type,
                pattern: pattern.to_string(),
            }),
        }
    }

    /// Number of entries a match's `groups` will hold (whole match included)
    pub fn group_count(&self) -> usize {
        match self {
            Matcher::Regex(re) => re.captures_len(),
            Matcher::Literal { .. } => 1,
        }
    }

    pub fn matches(&self, value: &str) -> Option<MatchResult> {
        if value.is_empty() {
            return None;
        }

        match self {
            Matcher::Regex(re) => {
                let caps = re.captures(value)?;
                let groups: Vec<String> = caps
                    .iter()
                    .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                    .collect();
                let full_match = groups.first().cloned().unwrap_or_default();
                Some(MatchResult { groups, full_match })
            }
            Matcher::Literal {
                pattern_type,
                pattern,
            } => {
                let hit = match pattern_type {
                    PatternType::String => value == pattern,
                    PatternType::StartsWith => value.starts_with(pattern.as_str()),
                    PatternType::Contains => value.contains(pattern.as_str()),
                    PatternType::EndsWith => value.ends_with(pattern.as_str()),
                    PatternType::Regex => false,
                };
                hit.then(|| MatchResult {
                    groups: vec![value.to_string()],
                    full_match: value.to_string(),
                })
            }
        }
    }
}

/// Match `value` against `pattern`.
///
/// An empty value never matches. A regex that fails to compile is logged
/// and treated as no match.
pub fn test(pattern_type: PatternType, pattern: &str, value: &str) -> Option<MatchResult> {
    if value.is_empty() {
        return None;
    }

    match Matcher::compile(pattern_type, pattern) {
        Ok(matcher) => matcher.matches(value),
        Err(e) => {
            tracing::warn!("Pattern rejected, treating as no match: {}", e);
            None
        }
    }
}

/// Values available to `${...}` tokens
#[derive(Debug, Clone, Copy)]
pub struct SubstitutionContext<'a> {
    pub scan: &'a str,
    pub directive: Option<&'a str>,
    pub groups: &'a [String],
    pub fields: &'a HashMap<String, String>,
}

/// Expand every `${...}` token in `template`
pub fn substitute(template: &str, ctx: &SubstitutionContext<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let Some(end) = after.find('}') else {
            // Unterminated token: keep the remainder as typed
            out.push_str(&rest[start..]);
            return out;
        };

        let token = &after[..end];
        match resolve_token(token, ctx) {
            Some(value) => out.push_str(&value),
            None => {
                out.push_str("${");
                out.push_str(token);
                out.push('}');
            }
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

fn resolve_token(token: &str, ctx: &SubstitutionContext<'_>) -> Option<String> {
    if token == "scan" {
        return Some(ctx.scan.to_string());
    }
    if token == "directive" {
        return Some(ctx.directive.unwrap_or_default().to_string());
    }
    if let Some(key) = token.strip_prefix("field:") {
        return ctx.fields.get(key).cloned();
    }
    if !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()) {
        let index: usize = token.parse().ok()?;
        return ctx.groups.get(index).cloned();
    }
    None
}
