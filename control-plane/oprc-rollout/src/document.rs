//! Narrow typed views over opaque resource documents.
//!
//! Member objects are carried as [`DynamicObject`]s; everything the engine
//! needs to know about them (identity, ownership, field lookups and the
//! "live satisfies desired" comparison) lives here.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::{DynamicObject, GroupVersionKind, ObjectMeta};
use serde_json::{Map, Value};

use crate::crd::PausedObject;

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("object is missing {0}")]
    MissingField(&'static str),
    #[error("object is not a valid resource document: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Parse a member object spec into a [`DynamicObject`]; apiVersion, kind and
/// metadata.name are mandatory.
pub fn parse_object(raw: &Value) -> Result<DynamicObject, DocumentError> {
    if !raw.is_object() {
        return Err(DocumentError::MissingField("a top-level mapping"));
    }
    let obj: DynamicObject = serde_json::from_value(raw.clone())?;
    if obj.types.as_ref().map(|t| t.kind.is_empty()).unwrap_or(true) {
        return Err(DocumentError::MissingField("apiVersion/kind"));
    }
    if obj.metadata.name.as_deref().unwrap_or("").is_empty() {
        return Err(DocumentError::MissingField("metadata.name"));
    }
    Ok(obj)
}

pub fn gvk_of(obj: &DynamicObject) -> Option<GroupVersionKind> {
    obj.types.as_ref().map(|t| {
        let (group, version) = split_api_version(&t.api_version);
        GroupVersionKind::gvk(&group, &version, &t.kind)
    })
}

/// Human readable identity used in probe and log messages.
pub fn describe(obj: &DynamicObject) -> String {
    let kind = obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("?");
    let name = obj.metadata.name.as_deref().unwrap_or("?");
    match obj.metadata.namespace.as_deref() {
        Some(ns) => format!("{kind} {ns}/{name}"),
        None => format!("{kind} {name}"),
    }
}

pub fn paused_ref_of(obj: &DynamicObject) -> Option<PausedObject> {
    let gvk = gvk_of(obj)?;
    Some(PausedObject {
        group: gvk.group,
        kind: gvk.kind,
        name: obj.metadata.name.clone()?,
    })
}

pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

pub fn is_controlled_by(meta: &ObjectMeta, uid: &str) -> bool {
    controller_of(meta).map(|r| r.uid == uid).unwrap_or(false)
}

/// Owner references with `owner` installed as the only controller.
pub fn with_controller(
    existing: Option<&Vec<OwnerReference>>,
    owner: &OwnerReference,
) -> Vec<OwnerReference> {
    let mut refs: Vec<OwnerReference> = existing
        .map(|list| {
            list.iter()
                .filter(|r| r.uid != owner.uid && r.controller != Some(true))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    refs.push(owner.clone());
    refs
}

/// Resolve a dotted path such as `.status.conditions[0].type`.
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = root;
    for segment in path.trim_start_matches('.').split('.') {
        if segment.is_empty() {
            continue;
        }
        let (field, indexes) = match segment.find('[') {
            Some(pos) => (&segment[..pos], &segment[pos..]),
            None => (segment, ""),
        };
        if !field.is_empty() {
            cur = cur.get(field)?;
        }
        for idx in indexes.split('[').filter(|s| !s.is_empty()) {
            let idx: usize = idx.trim_end_matches(']').parse().ok()?;
            cur = cur.get(idx)?;
        }
    }
    Some(cur)
}

/// Structural check that every field mentioned in `desired` has the same
/// value in `live`. Fields only present in `live` are ignored.
pub fn is_satisfied_by(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Object(d), Value::Object(l)) => d.iter().all(|(k, dv)| {
            match l.get(k) {
                Some(lv) => is_satisfied_by(dv, lv),
                None => dv.is_null(),
            }
        }),
        (Value::Array(d), Value::Array(l)) => {
            d.len() == l.len()
                && d.iter().zip(l.iter()).all(|(dv, lv)| is_satisfied_by(dv, lv))
        }
        _ => desired == live,
    }
}

/// The part of a desired object this engine manages: user content plus
/// metadata labels and annotations. Server-populated metadata and status are
/// left out so they never count as drift.
pub fn managed_fields(obj: &DynamicObject) -> Result<Value, DocumentError> {
    let mut value = serde_json::to_value(obj)?;
    let Some(map) = value.as_object_mut() else {
        return Err(DocumentError::MissingField("a top-level mapping"));
    };
    map.remove("status");
    let mut meta = Map::new();
    if let Some(labels) = obj.metadata.labels.as_ref() {
        meta.insert("labels".into(), serde_json::to_value(labels)?);
    }
    if let Some(annotations) = obj.metadata.annotations.as_ref() {
        meta.insert("annotations".into(), serde_json::to_value(annotations)?);
    }
    map.insert("metadata".into(), Value::Object(meta));
    Ok(value)
}
