use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, trace};

/// Compare two status objects for material differences, ignoring condition
/// transition times which would otherwise cause endless reconcile loops.
pub fn should_patch_status<S: Serialize>(current: Option<&S>, desired: &S) -> bool {
    match current {
        None => {
            debug!("should_patch_status: no current status, patching");
            true
        }
        Some(cur) => {
            let cur_norm = normalize_status(cur);
            let des_norm = normalize_status(desired);
            let differs = cur_norm != des_norm;
            if differs {
                debug!(
                    "should_patch_status: status differs, patching\ncurrent={}\ndesired={}",
                    cur_norm, des_norm
                );
            } else {
                trace!("should_patch_status: status identical, skipping patch");
            }
            differs
        }
    }
}

fn normalize_status<S: Serialize>(s: &S) -> Value {
    let mut v = serde_json::to_value(s).unwrap_or_else(|_| json!({}));
    if let Some(Value::Array(conds)) = v.get_mut("conditions") {
        for c in conds.iter_mut() {
            if let Some(obj) = c.as_object_mut() {
                obj.remove("lastTransitionTime");
            }
        }
    }
    v
}
