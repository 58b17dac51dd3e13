//! Condition management helpers following Kubernetes API conventions

use chrono::Utc;

use crate::crd::Condition;

/// Standard condition types following Kubernetes conventions
pub const CONDITION_TYPE_READY: &str = "Ready";
pub const CONDITION_TYPE_PROGRESSING: &str = "Progressing";
pub const CONDITION_TYPE_DEGRADED: &str = "Degraded";

/// Standard condition statuses
pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";

/// Reasons used by the DocumentDB controller
pub const REASON_REPLICATION_MISCONFIGURED: &str = "ReplicationMisconfigured";
pub const REASON_NO_ISSUES: &str = "NoIssues";
pub const REASON_ENGINE_READY: &str = "EngineClusterReady";
pub const REASON_ENGINE_PENDING: &str = "EngineClusterPending";
pub const REASON_PROMOTION_PENDING: &str = "PromotionTokenPending";
pub const REASON_NOT_A_MEMBER: &str = "NotAMember";

/// Update or add a condition to the conditions list
///
/// The transition time only moves when the status changes.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) {
    let now = Utc::now().to_rfc3339();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status {
            existing.last_transition_time = now;
        }
        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        existing.observed_generation = observed_generation;
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: now,
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation,
        });
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check if a condition is true
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

/// Remove a condition by type
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

fn status_of(value: bool) -> &'static str {
    if value {
        CONDITION_STATUS_TRUE
    } else {
        CONDITION_STATUS_FALSE
    }
}

/// Record a configuration problem that retrying will not fix
pub fn mark_misconfigured(conditions: &mut Vec<Condition>, message: &str, generation: Option<i64>) {
    set_condition(
        conditions,
        CONDITION_TYPE_DEGRADED,
        CONDITION_STATUS_TRUE,
        REASON_REPLICATION_MISCONFIGURED,
        message,
        generation,
    );
    set_condition(
        conditions,
        CONDITION_TYPE_READY,
        CONDITION_STATUS_FALSE,
        REASON_REPLICATION_MISCONFIGURED,
        message,
        generation,
    );
    remove_condition(conditions, CONDITION_TYPE_PROGRESSING);
}

/// Record the outcome of a pass that got past configuration checks
pub fn mark_converging(
    conditions: &mut Vec<Condition>,
    ready: bool,
    reason: &str,
    message: &str,
    generation: Option<i64>,
) {
    set_condition(
        conditions,
        CONDITION_TYPE_DEGRADED,
        CONDITION_STATUS_FALSE,
        REASON_NO_ISSUES,
        "No degradation detected",
        generation,
    );
    set_condition(
        conditions,
        CONDITION_TYPE_READY,
        status_of(ready),
        reason,
        message,
        generation,
    );
    if ready {
        remove_condition(conditions, CONDITION_TYPE_PROGRESSING);
    } else {
        set_condition(
            conditions,
            CONDITION_TYPE_PROGRESSING,
            CONDITION_STATUS_TRUE,
            reason,
            message,
            generation,
        );
    }
}
