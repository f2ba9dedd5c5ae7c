use chrono::Utc;

use crate::crd::{Condition, ConditionStatus, ConditionType};

pub fn new_condition(
    type_: ConditionType,
    status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
    generation: Option<i64>,
) -> Condition {
    Condition {
        type_,
        status,
        reason: Some(reason.to_string()),
        message: Some(message.into()),
        observed_generation: generation,
        last_transition_time: None,
    }
}

pub fn find(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_true(conditions: &[Condition], type_: ConditionType) -> bool {
    find(conditions, type_)
        .map(|c| c.status == ConditionStatus::True)
        .unwrap_or(false)
}

/// True only when the condition was computed for `generation`.
pub fn is_true_at_generation(
    conditions: &[Condition],
    type_: ConditionType,
    generation: Option<i64>,
) -> bool {
    find(conditions, type_)
        .map(|c| c.status == ConditionStatus::True && c.observed_generation == generation)
        .unwrap_or(false)
}

/// Upsert by type. The transition time only moves when the status flips.
pub fn set_condition(conditions: &mut Vec<Condition>, mut incoming: Condition) {
    match conditions.iter().position(|c| c.type_ == incoming.type_) {
        Some(idx) => {
            let existing = &conditions[idx];
            incoming.last_transition_time = if existing.status == incoming.status {
                existing
                    .last_transition_time
                    .clone()
                    .or_else(|| Some(Utc::now().to_rfc3339()))
            } else {
                Some(Utc::now().to_rfc3339())
            };
            conditions[idx] = incoming;
        }
        None => {
            incoming.last_transition_time = Some(Utc::now().to_rfc3339());
            conditions.push(incoming);
        }
    }
    conditions.sort_by_key(|c| cond_rank(&c.type_));
}

pub fn remove_condition(conditions: &mut Vec<Condition>, type_: ConditionType) {
    conditions.retain(|c| c.type_ != type_);
}

fn cond_rank(t: &ConditionType) -> u8 {
    match t {
        ConditionType::Available => 0,
        ConditionType::Progressing => 1,
        ConditionType::Succeeded => 2,
        ConditionType::Paused => 3,
        ConditionType::Archived => 4,
        ConditionType::Other(_) => 250,
    }
}
