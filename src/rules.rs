//! Rule engine
//!
//! Rules are kept in priority order: the first enabled rule whose pattern
//! matches a scan wins. A matching rule may classify the scan with a
//! [`Directive`] and then runs its actions, in order, against a working copy
//! of the field snapshot. Each action sees the values written by the actions
//! before it, so `${field:key}` can chain.
//!
//! In [`MatchMode::CollectAll`] (or for a rule with `continue_on_match`)
//! evaluation carries on to later rules with the updated field values.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::pattern::{substitute, Matcher, PatternError, PatternType, SubstitutionContext};
use crate::storage::{keys, Persistence, PersistenceExt};

/// Classification carried by a scan's leading symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Directive {
    Return,
    Deployment,
}

impl Directive {
    /// Fixed symbol table: `/` is a return, `*` a deployment
    pub fn from_symbol(symbol: char) -> Option<Self> {
        match symbol {
            '/' => Some(Directive::Return),
            '*' => Some(Directive::Deployment),
            _ => None,
        }
    }

    pub fn symbol(&self) -> char {
        match self {
            Directive::Return => '/',
            Directive::Deployment => '*',
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Directive::Return => "Return",
            Directive::Deployment => "Deployment",
        }
    }
}

impl std::fmt::Display for Directive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an action does to its field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionType {
    SetField,
    ClearField,
    AppendField,
}

/// One field mutation performed by a matching rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub field: String,
    /// Template; see [`crate::pattern::substitute`]
    #[serde(default)]
    pub value: String,
}

impl Action {
    pub fn set(field: &str, value: &str) -> Self {
        Self {
            action_type: ActionType::SetField,
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    pub fn clear(field: &str) -> Self {
        Self {
            action_type: ActionType::ClearField,
            field: field.to_string(),
            value: String::new(),
        }
    }

    pub fn append(field: &str, value: &str) -> Self {
        Self {
            action_type: ActionType::AppendField,
            field: field.to_string(),
            value: value.to_string(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// A pattern plus the field mutations to run when it matches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub pattern_type: PatternType,
    pub pattern: String,
    /// Capture group whose leading symbol selects the directive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directive_group_index: Option<usize>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub continue_on_match: bool,
}

impl Rule {
    pub fn new(id: &str, name: &str, pattern_type: PatternType, pattern: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            enabled: true,
            pattern_type,
            pattern: pattern.to_string(),
            directive_group_index: None,
            actions: Vec::new(),
            continue_on_match: false,
        }
    }

    pub fn with_directive_group(mut self, index: usize) -> Self {
        self.directive_group_index = Some(index);
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn continuing(mut self) -> Self {
        self.continue_on_match = true;
        self
    }

    /// Compile the pattern and check the directive group exists
    pub fn validate(&self) -> Result<Matcher, RuleError> {
        let matcher =
            Matcher::compile(self.pattern_type, &self.pattern).map_err(|source| {
                RuleError::Pattern {
                    rule: self.name.clone(),
                    source,
                }
            })?;

        if let Some(index) = self.directive_group_index {
            let groups = matcher.group_count();
            if index >= groups {
                return Err(RuleError::DirectiveGroupOutOfRange {
                    rule: self.name.clone(),
                    index,
                    groups,
                });
            }
        }

        Ok(matcher)
    }
}

/// Rule errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("Rule '{rule}' has an invalid pattern: {source}")]
    Pattern {
        rule: String,
        #[source]
        source: PatternError,
    },

    #[error("Rule '{rule}' uses directive group {index} but its pattern yields {groups} group(s)")]
    DirectiveGroupOutOfRange {
        rule: String,
        index: usize,
        groups: usize,
    },

    #[error("Duplicate rule id '{0}'")]
    DuplicateId(String),

    #[error("Rule '{0}' not found")]
    NotFound(String),
}

/// Whether evaluation stops at the first matching rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    FirstMatch,
    CollectAll,
}

/// One rule that matched during a `process` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleMatch {
    pub rule_id: String,
    pub rule_name: String,
    pub directive: Option<Directive>,
    pub groups: Vec<String>,
}

/// Result of running a scan through the rule list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub matched: bool,
    /// First matching rule
    pub rule: Option<RuleMatch>,
    /// First directive found among the matching rules
    pub directive: Option<Directive>,
    /// Complete field map after all actions ran
    pub fields: HashMap<String, String>,
    /// Keys whose final value differs from the snapshot, in first-touched order
    pub changed: Vec<String>,
    /// Every matching rule, in evaluation order
    pub matches: Vec<RuleMatch>,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: Rule,
    /// `None` when the stored pattern no longer compiles; never matches
    matcher: Option<Matcher>,
}

impl CompiledRule {
    fn compile(rule: Rule) -> Self {
        let matcher = match rule.validate() {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::warn!("Rule '{}' disabled at load: {}", rule.name, e);
                None
            }
        };
        Self { rule, matcher }
    }

    /// Compile a rule being installed; invalid rules are rejected
    fn validated(rule: Rule) -> Result<Self, RuleError> {
        let matcher = rule.validate().map_err(|e| {
            tracing::warn!("Rejected rule '{}': {}", rule.name, e);
            e
        })?;
        Ok(Self {
            rule,
            matcher: Some(matcher),
        })
    }
}

/// Ordered rule list and the matching algorithm
pub struct RuleEngine {
    rules: RwLock<Arc<Vec<CompiledRule>>>,
    mode: RwLock<MatchMode>,
    persistence: Option<Arc<dyn Persistence>>,
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine")
            .field("rules", &self.rules.read().len())
            .field("mode", &*self.mode.read())
            .finish()
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new(MatchMode::default())
    }
}

impl RuleEngine {
    /// Empty, non-persistent engine
    pub fn new(mode: MatchMode) -> Self {
        Self {
            rules: RwLock::new(Arc::new(Vec::new())),
            mode: RwLock::new(mode),
            persistence: None,
        }
    }

    /// Engine backed by `persistence`, loading any stored rules
    pub fn load(persistence: Arc<dyn Persistence>, mode: MatchMode) -> Self {
        let stored: Vec<Rule> = persistence.load(keys::RULES, Vec::new());
        tracing::info!("Loaded {} rule(s)", stored.len());
        let compiled = stored.into_iter().map(CompiledRule::compile).collect();
        Self {
            rules: RwLock::new(Arc::new(compiled)),
            mode: RwLock::new(mode),
            persistence: Some(persistence),
        }
    }

    pub fn mode(&self) -> MatchMode {
        *self.mode.read()
    }

    pub fn set_mode(&self, mode: MatchMode) {
        *self.mode.write() = mode;
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.rules.read().iter().map(|c| c.rule.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }

    /// Replace the whole rule list. Nothing changes if any rule is invalid.
    pub fn set_rules(&self, rules: Vec<Rule>) -> Result<(), RuleError> {
        let compiled = compile_all(rules)?;
        self.swap(compiled);
        Ok(())
    }

    /// Append a rule at the lowest priority
    pub fn add_rule(&self, rule: Rule) -> Result<(), RuleError> {
        let incoming = CompiledRule::validated(rule)?;
        self.edit(|rules| {
            if rules.iter().any(|c| c.rule.id == incoming.rule.id) {
                return Err(RuleError::DuplicateId(incoming.rule.id));
            }
            rules.push(incoming);
            Ok(())
        })
    }

    /// Replace the rule with `id`, keeping its position
    pub fn update_rule(&self, id: &str, rule: Rule) -> Result<(), RuleError> {
        let incoming = CompiledRule::validated(rule)?;
        self.edit(|rules| {
            let index = position(rules, id)?;
            let clash = rules
                .iter()
                .enumerate()
                .any(|(i, c)| i != index && c.rule.id == incoming.rule.id);
            if clash {
                return Err(RuleError::DuplicateId(incoming.rule.id));
            }
            rules[index] = incoming;
            Ok(())
        })
    }

    pub fn remove_rule(&self, id: &str) -> Result<Rule, RuleError> {
        let mut removed = None;
        self.edit(|rules| {
            let index = position(rules, id)?;
            removed = Some(rules.remove(index).rule);
            Ok(())
        })?;
        removed.ok_or_else(|| RuleError::NotFound(id.to_string()))
    }

    /// Move a rule to `new_index` (clamped), changing its priority
    pub fn move_rule(&self, id: &str, new_index: usize) -> Result<(), RuleError> {
        self.edit(|rules| {
            let index = position(rules, id)?;
            let rule = rules.remove(index);
            let target = new_index.min(rules.len());
            rules.insert(target, rule);
            Ok(())
        })
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), RuleError> {
        self.edit(|rules| {
            let index = position(rules, id)?;
            rules[index].rule.enabled = enabled;
            Ok(())
        })
    }

    /// Preview one rule against a scan without touching any fields
    pub fn test_rule(rule: &Rule, scan: &str) -> Result<Option<RuleMatch>, RuleError> {
        let matcher = rule.validate()?;
        Ok(matcher.matches(scan).map(|m| {
            let directive = extract_directive(rule, &m.groups);
            RuleMatch {
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                directive,
                groups: m.groups,
            }
        }))
    }

    /// Run `scan` through the rule list against `snapshot`
    pub fn process(&self, scan: &str, snapshot: &HashMap<String, String>) -> ProcessOutcome {
        let rules = self.rules.read().clone();
        let mode = self.mode();

        let mut fields = snapshot.clone();
        let mut touched: Vec<String> = Vec::new();
        let mut matches: Vec<RuleMatch> = Vec::new();

        for compiled in rules.iter() {
            let rule = &compiled.rule;
            if !rule.enabled {
                continue;
            }
            let Some(matcher) = &compiled.matcher else {
                continue;
            };
            let Some(result) = matcher.matches(scan) else {
                continue;
            };

            let directive = extract_directive(rule, &result.groups);
            tracing::debug!(
                "Scan '{}' matched rule '{}' (directive: {:?})",
                scan,
                rule.name,
                directive
            );

            for action in &rule.actions {
                apply_action(
                    rule,
                    action,
                    scan,
                    directive,
                    &result.groups,
                    &mut fields,
                    &mut touched,
                );
            }

            matches.push(RuleMatch {
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                directive,
                groups: result.groups,
            });

            if mode == MatchMode::FirstMatch && !rule.continue_on_match {
                break;
            }
        }

        let changed: Vec<String> = touched
            .into_iter()
            .filter(|key| fields.get(key) != snapshot.get(key))
            .collect();

        ProcessOutcome {
            matched: !matches.is_empty(),
            rule: matches.first().cloned(),
            directive: matches.iter().find_map(|m| m.directive),
            fields,
            changed,
            matches,
        }
    }

    fn edit<F>(&self, f: F) -> Result<(), RuleError>
    where
        F: FnOnce(&mut Vec<CompiledRule>) -> Result<(), RuleError>,
    {
        let mut rules = self.rules.read().as_ref().clone();
        f(&mut rules)?;
        self.swap(rules);
        Ok(())
    }

    fn swap(&self, compiled: Vec<CompiledRule>) {
        *self.rules.write() = Arc::new(compiled);
        self.persist();
    }

    fn persist(&self) {
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.save(keys::RULES, &self.rules()) {
                tracing::error!("Failed to persist rules: {}", e);
            }
        }
    }
}

fn position(rules: &[CompiledRule], id: &str) -> Result<usize, RuleError> {
    rules
        .iter()
        .position(|c| c.rule.id == id)
        .ok_or_else(|| RuleError::NotFound(id.to_string()))
}

fn compile_all(rules: Vec<Rule>) -> Result<Vec<CompiledRule>, RuleError> {
    let mut seen = HashSet::new();
    let mut compiled = Vec::with_capacity(rules.len());
    for rule in rules {
        if !seen.insert(rule.id.clone()) {
            tracing::warn!("Rejected rule list: duplicate id '{}'", rule.id);
            return Err(RuleError::DuplicateId(rule.id));
        }
        compiled.push(CompiledRule::validated(rule)?);
    }
    Ok(compiled)
}

fn extract_directive(rule: &Rule, groups: &[String]) -> Option<Directive> {
    let index = rule.directive_group_index?;
    groups
        .get(index)
        .and_then(|group| group.chars().next())
        .and_then(Directive::from_symbol)
}

fn apply_action(
    rule: &Rule,
    action: &Action,
    scan: &str,
    directive: Option<Directive>,
    groups: &[String],
    fields: &mut HashMap<String, String>,
    touched: &mut Vec<String>,
) {
    let Some(current) = fields.get(&action.field) else {
        tracing::warn!(
            "Rule '{}' targets unknown field '{}', action skipped",
            rule.name,
            action.field
        );
        return;
    };

    let next = {
        let ctx = SubstitutionContext {
            scan,
            directive: directive.map(|d| d.as_str()),
            groups,
            fields,
        };
        match action.action_type {
            ActionType::SetField => substitute(&action.value, &ctx),
            ActionType::ClearField => String::new(),
            ActionType::AppendField => {
                format!("{}{}", current, substitute(&action.value, &ctx))
            }
        }
    };

    if !touched.contains(&action.field) {
        touched.push(action.field.clone());
    }
    fields.insert(action.field.clone(), next);
}
