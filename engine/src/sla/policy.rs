//! SLA rule table
//!
//! Rules are keyed by `(priority, category)`. A lookup for a category without
//! its own rule falls back to the priority-level default, which always
//! exists: configured rules are merged over the built-in table.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::state::Priority;

/// Error type for SLA policy loading
#[derive(Debug, thiserror::Error)]
pub enum SlaPolicyError {
    #[error("Failed to parse SLA rules: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid SLA rule for {priority}/{category}: {reason}")]
    InvalidRule {
        priority: Priority,
        category: String,
        reason: String,
    },
}

/// Response and resolution targets for one `(priority, category)` key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaRule {
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub response_time_minutes: u32,
    pub resolution_time_minutes: u32,
}

impl SlaRule {
    pub fn new(priority: Priority, response_time_minutes: u32, resolution_time_minutes: u32) -> Self {
        Self {
            priority,
            category: None,
            response_time_minutes,
            resolution_time_minutes,
        }
    }

    pub fn for_category(mut self, category: &str) -> Self {
        self.category = Some(category.to_string());
        self
    }

    pub fn response_time(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.response_time_minutes))
    }

    pub fn resolution_time(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.resolution_time_minutes))
    }

    fn validate(&self) -> Result<(), SlaPolicyError> {
        let invalid = |reason: &str| SlaPolicyError::InvalidRule {
            priority: self.priority,
            category: self.category.clone().unwrap_or_else(|| "*".to_string()),
            reason: reason.to_string(),
        };
        if self.response_time_minutes == 0 {
            return Err(invalid("response time must be positive"));
        }
        if self.resolution_time_minutes < self.response_time_minutes {
            return Err(invalid("resolution time shorter than response time"));
        }
        Ok(())
    }
}

/// `[[rules]]` tables as they appear in a rules file
#[derive(Debug, Default, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<SlaRule>,
}

type RuleKey = (Priority, Option<String>);

fn normalize(category: Option<&str>) -> Option<String> {
    category
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty())
}

/// Read-only rule table, loaded once at startup
#[derive(Debug, Clone)]
pub struct SlaPolicy {
    rules: HashMap<RuleKey, SlaRule>,
}

impl SlaPolicy {
    /// Built-in priority-level defaults
    pub fn defaults() -> Self {
        let rules = [
            SlaRule::new(Priority::Critical, 15, 120),
            SlaRule::new(Priority::High, 60, 480),
            SlaRule::new(Priority::Medium, 240, 1440),
            SlaRule::new(Priority::Low, 480, 2880),
        ];
        Self {
            rules: rules
                .into_iter()
                .map(|rule| ((rule.priority, None), rule))
                .collect(),
        }
    }

    /// Merge `rules` over the defaults
    pub fn from_rules(rules: Vec<SlaRule>) -> Result<Self, SlaPolicyError> {
        let mut policy = Self::defaults();
        for mut rule in rules {
            rule.validate()?;
            rule.category = normalize(rule.category.as_deref());
            policy.rules.insert((rule.priority, rule.category.clone()), rule);
        }
        Ok(policy)
    }

    /// Parse `[[rules]]` tables and merge them over the defaults
    pub fn from_toml_str(content: &str) -> Result<Self, SlaPolicyError> {
        let file: RulesFile = toml::from_str(content)?;
        Self::from_rules(file.rules)
    }

    /// Rule for `(priority, category)`, falling back to `(priority, None)`
    pub fn resolve(&self, priority: Priority, category: Option<&str>) -> &SlaRule {
        let specific = normalize(category).and_then(|c| self.rules.get(&(priority, Some(c))));
        match specific {
            Some(rule) => rule,
            // Every priority has a default, see `defaults`
            None => &self.rules[&(priority, None)],
        }
    }

    /// All rules, ordered by priority then category
    pub fn rules(&self) -> Vec<&SlaRule> {
        let mut rules: Vec<&SlaRule> = self.rules.values().collect();
        rules.sort_by(|a, b| (a.priority, &a.category).cmp(&(b.priority, &b.category)));
        rules
    }
}

impl Default for SlaPolicy {
    fn default() -> Self {
        Self::defaults()
    }
}
