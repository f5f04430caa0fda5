//! Custom Resource Definitions for the Daytona binding
//!
//! This module contains the DaytonaBinding CRD and its supporting types.

mod binding;
mod types;

pub use binding::{
    unknown_spec_fields, DaytonaBinding, DaytonaBindingSpec, DaytonaBindingStatus,
    CONDITION_PARAMETERS_VALID, CONDITION_SUBJECT_RESOLVED,
};
pub use types::{
    Condition, ConditionStatus, LabelSelector, LabelSelectorOperator, LabelSelectorRequirement,
    SecretRef, SubjectReference,
};
