//! Readiness probes evaluated against live member objects.
//!
//! Probes are pure functions of object state. A [`ProbeList`] combines probes
//! with logical AND and collects every failure message, so a blocked phase
//! can report all of them at once.

use std::collections::BTreeMap;

use kube::core::{DynamicObject, ParseExpressionError, Selector, SelectorExt};
use serde_json::Value;

use crate::crd::{ObjectSetProbe, Probe, ProbeKindSpec};
use crate::document::{gvk_of, lookup_path};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProbeResult {
    pub success: bool,
    pub messages: Vec<String>,
}

impl ProbeResult {
    pub fn pass() -> Self {
        Self {
            success: true,
            messages: Vec::new(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            messages: vec![message.into()],
        }
    }
}

pub trait Prober: Send + Sync {
    fn probe(&self, obj: &DynamicObject) -> ProbeResult;
}

fn generation_of(obj: &DynamicObject) -> Option<i64> {
    obj.metadata.generation
}

/// Succeeds when `.status.conditions` holds an entry of the given type with
/// the given status, observed at the object's current generation.
#[derive(Clone, Debug)]
pub struct ConditionProbe {
    pub type_: String,
    pub status: String,
}

impl Prober for ConditionProbe {
    fn probe(&self, obj: &DynamicObject) -> ProbeResult {
        let entry = obj
            .data
            .pointer("/status/conditions")
            .and_then(Value::as_array)
            .and_then(|conds| {
                conds.iter().find(|c| {
                    c.get("type").and_then(Value::as_str) == Some(self.type_.as_str())
                })
            });
        let Some(entry) = entry else {
            return ProbeResult::fail(format!("missing condition {:?}", self.type_));
        };
        if let Some(observed) = entry.get("observedGeneration").and_then(Value::as_i64) {
            if Some(observed) != generation_of(obj) {
                return ProbeResult::fail(format!(
                    "condition {:?} is outdated (observed generation {observed})",
                    self.type_
                ));
            }
        }
        if entry.get("status").and_then(Value::as_str) == Some(self.status.as_str()) {
            ProbeResult::pass()
        } else {
            ProbeResult::fail(format!(
                "condition {:?} == {:?} not satisfied",
                self.type_, self.status
            ))
        }
    }
}

/// Succeeds when both field paths resolve to deeply-equal values.
#[derive(Clone, Debug)]
pub struct FieldsEqualProbe {
    pub field_a: String,
    pub field_b: String,
}

impl Prober for FieldsEqualProbe {
    fn probe(&self, obj: &DynamicObject) -> ProbeResult {
        if let Some(observed) = obj
            .data
            .pointer("/status/observedGeneration")
            .and_then(Value::as_i64)
        {
            if Some(observed) != generation_of(obj) {
                return ProbeResult::fail(format!(
                    "status is outdated (observed generation {observed})"
                ));
            }
        }
        let Some(a) = lookup_path(&obj.data, &self.field_a) else {
            return ProbeResult::fail(format!("{:?} not found", self.field_a));
        };
        let Some(b) = lookup_path(&obj.data, &self.field_b) else {
            return ProbeResult::fail(format!("{:?} not found", self.field_b));
        };
        if a == b {
            ProbeResult::pass()
        } else {
            ProbeResult::fail(format!(
                "{:?} == {:?} not satisfied",
                self.field_a, self.field_b
            ))
        }
    }
}

/// Restricts an inner prober to objects matching a kind and/or labels; all
/// other objects pass vacuously.
pub struct SelectorProbe {
    pub kind: Option<ProbeKindSpec>,
    pub labels: Option<Selector>,
    pub inner: Box<dyn Prober>,
}

impl SelectorProbe {
    fn applies_to(&self, obj: &DynamicObject) -> bool {
        let kind_ok = match (&self.kind, gvk_of(obj)) {
            (None, _) => true,
            (Some(want), Some(gvk)) => want.group == gvk.group && want.kind == gvk.kind,
            (Some(_), None) => false,
        };
        let empty = BTreeMap::new();
        let labels_ok = self
            .labels
            .as_ref()
            .map(|sel| sel.matches(obj.metadata.labels.as_ref().unwrap_or(&empty)))
            .unwrap_or(true);
        kind_ok && labels_ok
    }
}

impl Prober for SelectorProbe {
    fn probe(&self, obj: &DynamicObject) -> ProbeResult {
        if self.applies_to(obj) {
            self.inner.probe(obj)
        } else {
            ProbeResult::pass()
        }
    }
}

#[derive(Default)]
pub struct ProbeList(pub Vec<Box<dyn Prober>>);

impl Prober for ProbeList {
    fn probe(&self, obj: &DynamicObject) -> ProbeResult {
        let mut result = ProbeResult::pass();
        for prober in &self.0 {
            let r = prober.probe(obj);
            if !r.success {
                result.success = false;
                result.messages.extend(r.messages);
            }
        }
        result
    }
}

fn parse_probe(probe: &Probe) -> ProbeList {
    let mut probers: Vec<Box<dyn Prober>> = Vec::new();
    if let Some(cond) = &probe.condition {
        probers.push(Box::new(ConditionProbe {
            type_: cond.type_.clone(),
            status: cond.status.clone(),
        }));
    }
    if let Some(fields) = &probe.fields_equal {
        probers.push(Box::new(FieldsEqualProbe {
            field_a: fields.field_a.clone(),
            field_b: fields.field_b.clone(),
        }));
    }
    ProbeList(probers)
}

/// Build the prober for a template's availability probes.
pub fn parse_probes(specs: &[ObjectSetProbe]) -> Result<ProbeList, ParseExpressionError> {
    let probers = specs
        .iter()
        .map(|spec| {
            let inner = ProbeList(
                spec.probes
                    .iter()
                    .map(|p| Box::new(parse_probe(p)) as Box<dyn Prober>)
                    .collect(),
            );
            let labels = spec
                .selector
                .label_selector
                .clone()
                .map(Selector::try_from)
                .transpose()?;
            Ok(Box::new(SelectorProbe {
                kind: spec.selector.kind.clone(),
                labels,
                inner: Box::new(inner),
            }) as Box<dyn Prober>)
        })
        .collect::<Result<Vec<_>, ParseExpressionError>>()?;
    Ok(ProbeList(probers))
}
