//! Living condition sets
//!
//! A [`ConditionSet`] names one "happy" condition (usually `Ready`) and the
//! dependent conditions it is derived from. A [`ConditionManager`] applies
//! transitions to a status' condition list and keeps the happy condition in
//! step with its dependents:
//!
//! - Unknown until every dependent has been set
//! - True once every dependent is True
//! - False as soon as any dependent is False, carrying the reason and message
//!   of the first failing dependent in declaration order

use crate::crd::{Condition, ConditionStatus};

/// The `Ready` condition type
pub const CONDITION_READY: &str = "Ready";

/// Immutable definition of a happy condition and its dependents
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConditionSet {
    happy: &'static str,
    dependents: &'static [&'static str],
}

impl ConditionSet {
    /// A living condition set: `Ready` plus the given dependents
    pub const fn living(dependents: &'static [&'static str]) -> Self {
        Self {
            happy: CONDITION_READY,
            dependents,
        }
    }

    /// Name of the aggregate condition
    pub fn happy(&self) -> &'static str {
        self.happy
    }

    /// Dependent condition types in evaluation order
    pub fn dependents(&self) -> &'static [&'static str] {
        self.dependents
    }

    /// Manage a condition list using this set
    pub fn manage<'a>(&self, conditions: &'a mut Vec<Condition>) -> ConditionManager<'a> {
        ConditionManager {
            set: *self,
            conditions,
        }
    }
}

/// Applies condition transitions for one status object
pub struct ConditionManager<'a> {
    set: ConditionSet,
    conditions: &'a mut Vec<Condition>,
}

impl ConditionManager<'_> {
    /// Look up a condition by type
    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Whether the happy condition is True
    pub fn is_happy(&self) -> bool {
        self.get(self.set.happy)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// Set the happy condition and any missing dependents to Unknown.
    ///
    /// Existing conditions are left untouched. When the happy condition is
    /// already True, missing dependents are initialized True so a restart
    /// does not flap a ready binding.
    pub fn initialize_conditions(&mut self) {
        let happy_status = match self.get(self.set.happy) {
            Some(c) => c.status,
            None => {
                self.set_condition(Condition::new(
                    self.set.happy,
                    ConditionStatus::Unknown,
                    "",
                    "",
                ));
                ConditionStatus::Unknown
            }
        };

        let initial = if happy_status == ConditionStatus::True {
            ConditionStatus::True
        } else {
            ConditionStatus::Unknown
        };
        for dependent in self.set.dependents {
            if self.get(dependent).is_none() {
                self.set_condition(Condition::new(*dependent, initial, "", ""));
            }
        }
    }

    /// Mark a condition True and re-derive the happy condition
    pub fn mark_true(&mut self, type_: &str) {
        self.set_condition(Condition::new(type_, ConditionStatus::True, "", ""));
        if type_ != self.set.happy {
            self.recompute_happy();
        }
    }

    /// Mark a condition False and re-derive the happy condition
    pub fn mark_false(&mut self, type_: &str, reason: &str, message: &str) {
        self.set_condition(Condition::new(
            type_,
            ConditionStatus::False,
            reason,
            message,
        ));
        if type_ != self.set.happy {
            self.recompute_happy();
        }
    }

    /// Mark a condition Unknown and re-derive the happy condition
    pub fn mark_unknown(&mut self, type_: &str, reason: &str, message: &str) {
        self.set_condition(Condition::new(
            type_,
            ConditionStatus::Unknown,
            reason,
            message,
        ));
        if type_ != self.set.happy {
            self.recompute_happy();
        }
    }

    fn recompute_happy(&mut self) {
        let mut first_unknown: Option<(String, String)> = None;
        let mut all_set = true;

        for dependent in self.set.dependents {
            match self.get(dependent) {
                Some(c) if c.status == ConditionStatus::False => {
                    let (reason, message) = (c.reason.clone(), c.message.clone());
                    self.set_condition(Condition::new(
                        self.set.happy,
                        ConditionStatus::False,
                        reason,
                        message,
                    ));
                    return;
                }
                Some(c) if c.status == ConditionStatus::Unknown => {
                    if first_unknown.is_none() {
                        first_unknown = Some((c.reason.clone(), c.message.clone()));
                    }
                }
                Some(_) => {}
                None => all_set = false,
            }
        }

        let condition = match first_unknown {
            Some((reason, message)) => Condition::new(
                self.set.happy,
                ConditionStatus::Unknown,
                reason,
                message,
            ),
            None if !all_set => {
                Condition::new(self.set.happy, ConditionStatus::Unknown, "", "")
            }
            None => Condition::new(self.set.happy, ConditionStatus::True, "", ""),
        };
        self.set_condition(condition);
    }

    /// Insert or replace a condition, keeping the transition time when the
    /// state did not change.
    fn set_condition(&mut self, condition: Condition) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_)
        {
            Some(existing) if existing.same_state(&condition) => {}
            Some(existing) => *existing = condition,
            None => {
                self.conditions.push(condition);
                self.conditions.sort_by(|a, b| a.type_.cmp(&b.type_));
            }
        }
    }
}
