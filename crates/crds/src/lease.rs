//! Lease CRD
//!
//! A time-bounded exclusive binding of one client to one exporter. The lease
//! spec carries the request (selector, duration, optional explicit window);
//! the status carries the binding decided by the scheduler.

use chrono::{DateTime, Duration, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conditions::Condition;
use crate::references::LocalObjectReference;
use crate::selector::LabelSelector;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "jumpstarter.dev",
    version = "v1alpha1",
    kind = "Lease",
    namespaced,
    status = "LeaseStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct LeaseSpec {
    /// The client requesting the lease
    pub client_ref: LocalObjectReference,

    /// Selector for the exporter to be used
    #[serde(default)]
    pub selector: LabelSelector,

    /// Requested duration in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,

    /// Explicit begin of the requested window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub begin_time: Option<DateTime<Utc>>,

    /// Explicit end of the requested window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Set by the client to release the lease early
    #[serde(default)]
    pub release: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaseStatus {
    /// When the binding became effective
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub begin_time: Option<DateTime<Utc>>,

    /// When the binding expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// The exporter assigned to this lease; retained after the lease ends
    /// for record purposes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exporter_ref: Option<LocalObjectReference>,

    /// Terminal flag; once true it is never cleared
    #[serde(default)]
    pub ended: bool,

    /// Priority of the access-policy rule that admitted this lease
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    /// Whether the admitted rule marked this lease preemptible
    #[serde(default)]
    pub spot_access: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Lease condition types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseConditionType {
    Pending,
    Unsatisfiable,
    Ready,
    Ended,
}

impl LeaseConditionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Unsatisfiable => "Unsatisfiable",
            Self::Ready => "Ready",
            Self::Ended => "Ended",
        }
    }
}

impl Lease {
    /// Whether the lease has reached its terminal ended state.
    pub fn is_ended(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.ended)
    }

    /// Whether the lease currently holds an exporter.
    pub fn is_active_on(&self, exporter_name: &str) -> bool {
        self.status.as_ref().is_some_and(|s| {
            !s.ended && s.exporter_ref.as_ref().is_some_and(|r| r.name == exporter_name)
        })
    }
}

/// Violations of the lease time-field law.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeFieldError {
    #[error("beginTime and endTime without duration are underdetermined together with neither")]
    Underdetermined,

    #[error("endTime must not precede beginTime")]
    NegativeWindow,

    #[error("duration must be positive")]
    NonPositiveDuration,

    #[error("inconsistent time fields: endTime != beginTime + duration")]
    Inconsistent,
}

/// Reconcile the `(beginTime, endTime, duration)` triple.
///
/// Any two of the three determine the missing one; when all three are given
/// they must agree exactly. A lone `beginTime` or `endTime` cannot be
/// completed and is rejected. A bare `duration` (or nothing at all) is left
/// untouched: the window is fixed at binding time.
pub fn reconcile_time_fields(
    begin_time: &mut Option<DateTime<Utc>>,
    end_time: &mut Option<DateTime<Utc>>,
    duration_seconds: &mut Option<i64>,
) -> Result<(), TimeFieldError> {
    if let Some(seconds) = *duration_seconds {
        if seconds <= 0 {
            return Err(TimeFieldError::NonPositiveDuration);
        }
    }

    match (*begin_time, *end_time, *duration_seconds) {
        (Some(begin), Some(end), Some(seconds)) => {
            if end - begin != Duration::seconds(seconds) {
                return Err(TimeFieldError::Inconsistent);
            }
            Ok(())
        }
        (Some(begin), Some(end), None) => {
            if end <= begin {
                return Err(TimeFieldError::NegativeWindow);
            }
            *duration_seconds = Some((end - begin).num_seconds());
            Ok(())
        }
        (Some(begin), None, Some(seconds)) => {
            *end_time = Some(begin + Duration::seconds(seconds));
            Ok(())
        }
        (None, Some(end), Some(seconds)) => {
            *begin_time = Some(end - Duration::seconds(seconds));
            Ok(())
        }
        (None, None, _) => Ok(()),
        (Some(_), None, None) | (None, Some(_), None) => Err(TimeFieldError::Underdetermined),
    }
}
