use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_POLICY_YAML: &str = include_str!("../../../resources/default-policy.yaml");

pub const WARN_NO_VERSION: &str = "no version specified";
pub const WARN_NO_RULES: &str = "policy has no rules defined";

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy is empty")]
    Empty,
    #[error("invalid policy yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("{list}[{index}]: {message}")]
    Rule {
        list: &'static str,
        index: usize,
        message: String,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub pattern: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub slb: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForceRelease {
    Never,
    #[default]
    Approval,
    Auto,
}

impl FromStr for ForceRelease {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "never" => Ok(ForceRelease::Never),
            "approval" => Ok(ForceRelease::Approval),
            "auto" => Ok(ForceRelease::Auto),
            other => Err(format!("force_release must be never|approval|auto, got '{other}'")),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Automation {
    #[serde(default)]
    pub auto_commit: bool,
    #[serde(default)]
    pub auto_push: bool,
    #[serde(default)]
    pub force_release: ForceRelease,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default)]
    pub allowed: Vec<PolicyRule>,
    #[serde(default)]
    pub blocked: Vec<PolicyRule>,
    #[serde(default)]
    pub approval_required: Vec<PolicyRule>,
    #[serde(default)]
    pub automation: Automation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Allow,
    Block,
    Approve,
}

impl fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PolicyAction::Allow => "allow",
            PolicyAction::Block => "block",
            PolicyAction::Approve => "approve",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PolicyDecision {
    pub action: PolicyAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<PolicyRule>,
    pub reason: String,
    pub slb: bool,
}

impl PolicyDecision {
    fn default_allow() -> Self {
        Self {
            action: PolicyAction::Allow,
            rule: None,
            reason: "no rule matched".into(),
            slb: false,
        }
    }

    fn from_rule(action: PolicyAction, rule: &PolicyRule) -> Self {
        Self {
            action,
            rule: Some(rule.clone()),
            reason: rule.reason.clone(),
            slb: action == PolicyAction::Approve && rule.slb,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct PolicyStats {
    pub version: Option<u32>,
    pub allowed: usize,
    pub blocked: usize,
    pub approval_required: usize,
    pub slb_rules: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl SafetyPolicy {
    pub fn from_yaml(content: &str) -> Result<Self, PolicyError> {
        if content.trim().is_empty() {
            return Err(PolicyError::Empty);
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn builtin() -> Self {
        Self::from_yaml(DEFAULT_POLICY_YAML).unwrap_or_default()
    }

    pub fn to_yaml(&self) -> Result<String, PolicyError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn rule_count(&self) -> usize {
        self.allowed.len() + self.blocked.len() + self.approval_required.len()
    }

    pub fn stats(&self) -> PolicyStats {
        PolicyStats {
            version: self.version,
            allowed: self.allowed.len(),
            blocked: self.blocked.len(),
            approval_required: self.approval_required.len(),
            slb_rules: self.approval_required.iter().filter(|rule| rule.slb).count(),
        }
    }

    pub fn compile(&self) -> Result<CompiledPolicy, PolicyError> {
        Ok(CompiledPolicy {
            allowed: compile_list("allowed", &self.allowed)?,
            blocked: compile_list("blocked", &self.blocked)?,
            approval_required: compile_list("approval_required", &self.approval_required)?,
            policy: self.clone(),
        })
    }

    fn lists(&self) -> [(&'static str, &[PolicyRule]); 3] {
        [
            ("allowed", self.allowed.as_slice()),
            ("blocked", self.blocked.as_slice()),
            ("approval_required", self.approval_required.as_slice()),
        ]
    }
}

fn compile_rule(list: &'static str, index: usize, rule: &PolicyRule) -> Result<Regex, PolicyError> {
    if rule.pattern.trim().is_empty() {
        return Err(PolicyError::Rule {
            list,
            index,
            message: "pattern is empty".into(),
        });
    }
    Regex::new(&rule.pattern).map_err(|err| PolicyError::Rule {
        list,
        index,
        message: format!("invalid regex: {err}"),
    })
}

fn compile_list(
    list: &'static str,
    rules: &[PolicyRule],
) -> Result<Vec<(Regex, PolicyRule)>, PolicyError> {
    rules
        .iter()
        .enumerate()
        .map(|(index, rule)| Ok((compile_rule(list, index, rule)?, rule.clone())))
        .collect()
}

/// A policy whose patterns have been compiled; evaluation never fails.
#[derive(Clone, Debug)]
pub struct CompiledPolicy {
    policy: SafetyPolicy,
    allowed: Vec<(Regex, PolicyRule)>,
    blocked: Vec<(Regex, PolicyRule)>,
    approval_required: Vec<(Regex, PolicyRule)>,
}

impl CompiledPolicy {
    pub fn policy(&self) -> &SafetyPolicy {
        &self.policy
    }

    pub fn check(&self, command: &str) -> PolicyDecision {
        let command = command.trim();
        if let Some((_, rule)) = self.allowed.iter().find(|(re, _)| re.is_match(command)) {
            return PolicyDecision::from_rule(PolicyAction::Allow, rule);
        }
        if let Some((_, rule)) = self.blocked.iter().find(|(re, _)| re.is_match(command)) {
            return PolicyDecision::from_rule(PolicyAction::Block, rule);
        }
        if let Some((_, rule)) = self
            .approval_required
            .iter()
            .find(|(re, _)| re.is_match(command))
        {
            return PolicyDecision::from_rule(PolicyAction::Approve, rule);
        }
        PolicyDecision::default_allow()
    }

    /// SLB flag of the first approval rule matching `action`.
    pub fn slb_required(&self, action: &str) -> bool {
        self.approval_required
            .iter()
            .find(|(re, _)| re.is_match(action.trim()))
            .map(|(_, rule)| rule.slb)
            .unwrap_or(false)
    }
}

/// Parses and checks policy YAML without applying it.
pub fn validate(content: &str) -> ValidationReport {
    let mut report = ValidationReport::default();
    let policy = match SafetyPolicy::from_yaml(content) {
        Ok(policy) => policy,
        Err(err) => {
            report.errors.push(err.to_string());
            return report;
        }
    };

    for (list, rules) in policy.lists() {
        for (index, rule) in rules.iter().enumerate() {
            if let Err(err) = compile_rule(list, index, rule) {
                report.errors.push(err.to_string());
            }
        }
    }

    if policy.version.unwrap_or(0) == 0 {
        report.warnings.push(WARN_NO_VERSION.to_string());
    }
    if policy.rule_count() == 0 {
        report.warnings.push(WARN_NO_RULES.to_string());
    }
    report.valid = report.errors.is_empty();
    report
}
