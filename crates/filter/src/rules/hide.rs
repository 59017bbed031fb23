//! Hide rules and their evaluation order

use crate::error::{FilterError, Result};
use protocol::{DeviceDescriptor, HideRuleRequest, HideRuleType, MATCH_ALL};
use std::fmt;

/// Stored DWORD meaning "match any value"
pub const STORED_MATCH_ALL: u32 = u32::MAX;

/// One rule field: a literal value or a wildcard
///
/// The wildcard is a separate variant, so no literal value can behave as
/// a wildcard by accident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mask {
    Any,
    Value(u32),
}

impl Mask {
    /// Map a request field; values wider than 32 bits are rejected
    pub fn from_request(field: &str, value: u64) -> Result<Self> {
        if value == MATCH_ALL {
            return Ok(Mask::Any);
        }
        u32::try_from(value).map(Mask::Value).map_err(|_| {
            FilterError::InvalidParameter(format!("{} value {:#x} exceeds 32 bits", field, value))
        })
    }

    /// Map a stored DWORD, where all-ones is the wildcard
    pub fn from_stored(value: u32) -> Self {
        if value == STORED_MATCH_ALL {
            Mask::Any
        } else {
            Mask::Value(value)
        }
    }

    pub fn matches(self, value: u32) -> bool {
        match self {
            Mask::Any => true,
            Mask::Value(v) => v == value,
        }
    }

    /// Class masks match when any bit is shared
    pub fn intersects(self, bits: u32) -> bool {
        match self {
            Mask::Any => true,
            Mask::Value(m) => m & bits != 0,
        }
    }
}

impl fmt::Display for Mask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mask::Any => write!(f, "*"),
            Mask::Value(v) => write!(f, "{:#x}", v),
        }
    }
}

/// Rule family: basic rules look at VID/PID/BCD, extended rules also at
/// the device's class bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleFamily {
    Basic,
    Extended,
}

impl From<HideRuleType> for RuleFamily {
    fn from(rule_type: HideRuleType) -> Self {
        match rule_type {
            HideRuleType::Default => RuleFamily::Basic,
            HideRuleType::DeterminativeTypes => RuleFamily::Extended,
        }
    }
}

impl RuleFamily {
    pub fn from_tag(tag: u32) -> Result<Self> {
        HideRuleType::try_from(tag)
            .map(RuleFamily::from)
            .map_err(|tag| FilterError::InvalidParameter(format!("unknown hide rule type {}", tag)))
    }
}

/// Whether a rule is dropped by `ClearRules` or reloaded from storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleLifetime {
    Dynamic,
    Persistent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HideRule {
    pub hide: bool,
    pub class: Mask,
    pub vid: Mask,
    pub pid: Mask,
    pub bcd: Mask,
    /// A matching forced rule ends evaluation
    pub force_decision: bool,
}

impl HideRule {
    /// Validate a client request into a rule and its family
    pub fn from_request(request: &HideRuleRequest) -> Result<(RuleFamily, Self)> {
        let family = RuleFamily::from_tag(request.rule_type)?;
        let rule = HideRule {
            hide: request.hide,
            class: Mask::from_request("class", request.class)?,
            vid: Mask::from_request("vid", request.vid)?,
            pid: Mask::from_request("pid", request.pid)?,
            bcd: Mask::from_request("bcd", request.bcd)?,
            force_decision: request.force_decision.unwrap_or(!request.hide),
        };
        Ok((family, rule))
    }

    pub fn matches(&self, desc: &DeviceDescriptor) -> bool {
        self.vid.matches(u32::from(desc.vendor_id))
            && self.pid.matches(u32::from(desc.product_id))
            && self.bcd.matches(u32::from(desc.bcd_device))
    }

    pub fn matches_classes(&self, classes: u32, desc: &DeviceDescriptor) -> bool {
        self.class.intersects(classes) && self.matches(desc)
    }
}

impl fmt::Display for HideRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hide={} class={} vid={} pid={} bcd={} force={}",
            self.hide, self.class, self.vid, self.pid, self.bcd, self.force_decision
        )
    }
}

/// Ordered rule collection rejecting duplicates
#[derive(Debug, Default, Clone)]
pub struct RuleSet {
    rules: Vec<HideRule>,
}

impl RuleSet {
    pub fn add(&mut self, rule: HideRule) -> Result<()> {
        if self.rules.contains(&rule) {
            return Err(FilterError::AlreadyExists(format!("hide rule [{}]", rule)));
        }
        self.rules.push(rule);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.rules.clear();
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HideRule> {
        self.rules.iter()
    }
}

/// The four hide-rule sets, one per family and lifetime
#[derive(Debug, Default)]
pub struct HideRuleSets {
    dynamic_basic: RuleSet,
    persistent_basic: RuleSet,
    dynamic_extended: RuleSet,
    persistent_extended: RuleSet,
}

impl HideRuleSets {
    pub fn set_mut(&mut self, family: RuleFamily, lifetime: RuleLifetime) -> &mut RuleSet {
        match (family, lifetime) {
            (RuleFamily::Basic, RuleLifetime::Dynamic) => &mut self.dynamic_basic,
            (RuleFamily::Basic, RuleLifetime::Persistent) => &mut self.persistent_basic,
            (RuleFamily::Extended, RuleLifetime::Dynamic) => &mut self.dynamic_extended,
            (RuleFamily::Extended, RuleLifetime::Persistent) => &mut self.persistent_extended,
        }
    }

    pub fn clear_dynamic(&mut self) {
        self.dynamic_basic.clear();
        self.dynamic_extended.clear();
    }

    pub fn clear_persistent(&mut self) {
        self.persistent_basic.clear();
        self.persistent_extended.clear();
    }

    pub fn len(&self) -> usize {
        self.dynamic_basic.len()
            + self.persistent_basic.len()
            + self.dynamic_extended.len()
            + self.persistent_extended.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evaluate the hide decision for a device
    ///
    /// Basic rules are visited first (dynamic, then persistent). Extended
    /// rules are only visited if no basic rule matched.
    pub fn should_hide(&self, desc: &DeviceDescriptor, classes: u32) -> bool {
        let basic = [&self.dynamic_basic, &self.persistent_basic];
        if let Some(hide) = Self::visit(&basic, |rule| rule.matches(desc)) {
            return hide;
        }

        let extended = [&self.dynamic_extended, &self.persistent_extended];
        Self::visit(&extended, |rule| rule.matches_classes(classes, desc)).unwrap_or(false)
    }

    /// Last match wins until a matching rule forces its decision
    fn visit(sets: &[&RuleSet], matches: impl Fn(&HideRule) -> bool) -> Option<bool> {
        let mut decision = None;
        for rule in sets.iter().flat_map(|set| set.iter()) {
            if matches(rule) {
                tracing::trace!("hide rule matched: {}", rule);
                decision = Some(rule.hide);
                if rule.force_decision {
                    break;
                }
            }
        }
        decision
    }
}
