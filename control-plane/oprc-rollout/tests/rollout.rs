// Deployment rollouts driven step by step against the in-memory store.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
use kube::{Resource, ResourceExt};
use oprc_rollout::controller::hash::compute_hash;
use oprc_rollout::crd::{
    ConditionStatus, ConditionType, LifecycleState, OWNER_LABEL, ObjectDeployment, ObjectSet,
    ObjectSetTemplate, PausedObject, REVISION_ANNOTATION, TEMPLATE_HASH_ANNOTATION,
};
use oprc_rollout::controller::ReconcileErr;
use oprc_rollout::store::memory::WriteOp;
use oprc_rollout::store::{ClusterStore, ObjectKey, StoreError, list_as};
use serde_json::json;

mod common;
use common::*;

fn two_phase_template(size: i64) -> ObjectSetTemplate {
    template(
        "demo",
        vec![
            phase("a", vec![widget("x", size)]),
            phase("b", vec![config_map("y")]),
        ],
        vec![ready_probe("example.io", "Widget")],
    )
}

fn annotation(set: &ObjectSet, key: &str) -> Option<String> {
    set.annotations().get(key).cloned()
}

fn status_of(
    dep: &ObjectDeployment,
    type_: ConditionType,
) -> Option<ConditionStatus> {
    condition(&deployment_conditions(dep), type_).map(|c| c.status)
}

/// Reconcile the deployment and its revisions until nothing is left to hand
/// over, with every widget reporting ready.
async fn settle(h: &Harness, rounds: usize) {
    for _ in 0..rounds {
        h.reconcile_deployment("demo").await.expect("deployment");
        let sets: Vec<ObjectSet> =
            list_as(&h.store, Some(NS), None).await.expect("list");
        for set in sets {
            h.reconcile_set(&set.name_any()).await.expect("revision");
        }
        if h.member(&widget_key("x")).await.is_some() {
            h.set_ready(&widget_key("x"), "True").await;
        }
    }
}

#[test_log::test(tokio::test)]
async fn first_rollout_creates_revision_and_gates_phases() {
    let h = Harness::new();
    let tpl = two_phase_template(1);
    h.create(&deployment("demo", tpl.clone())).await;

    h.reconcile_deployment("demo").await.expect("deployment");

    let hash = compute_hash(&tpl, None).expect("hash");
    let name = format!("demo-{hash}");
    let sets: Vec<ObjectSet> =
        list_as(&h.store, Some(NS), None).await.expect("list");
    assert_eq!(sets.len(), 1);
    let set = &sets[0];
    assert_eq!(set.name_any(), name);
    assert_eq!(annotation(set, REVISION_ANNOTATION).as_deref(), Some("1"));
    assert_eq!(annotation(set, TEMPLATE_HASH_ANNOTATION), Some(hash.clone()));
    assert_eq!(set.labels().get("app").map(String::as_str), Some("demo"));

    h.reconcile_set(&name).await.expect("revision");
    assert!(h.member(&widget_key("x")).await.is_some());
    assert!(h.member(&cm_key("y")).await.is_none());

    h.reconcile_set(&name).await.expect("revision");
    assert!(h.member(&cm_key("y")).await.is_none());

    h.set_ready(&widget_key("x"), "True").await;
    h.reconcile_set(&name).await.expect("revision");
    assert!(h.member(&cm_key("y")).await.is_some());

    h.reconcile_deployment("demo").await.expect("deployment");
    let dep: ObjectDeployment = h.must_fetch("demo").await;
    assert_eq!(status_of(&dep, ConditionType::Available), Some(ConditionStatus::True));
    assert_eq!(
        status_of(&dep, ConditionType::Progressing),
        Some(ConditionStatus::False)
    );
    let status = dep.status.expect("status");
    assert_eq!(status.template_hash, Some(hash));
    assert_eq!(status.collision_count, None);
}

#[test_log::test(tokio::test)]
async fn name_collision_bumps_salt() {
    let h = Harness::new();
    let tpl = two_phase_template(1);
    let hash = compute_hash(&tpl, None).expect("hash");

    // an unrelated revision squatting on the computed name
    let mut squatter = object_set(&format!("demo-{hash}"), vec![], vec![]);
    squatter.metadata.labels = Some(app_labels("other"));
    h.create(&squatter).await;
    h.create(&deployment("demo", tpl.clone())).await;

    h.reconcile_deployment("demo").await.expect("deployment");
    let dep: ObjectDeployment = h.must_fetch("demo").await;
    assert_eq!(dep.status.as_ref().and_then(|s| s.collision_count), Some(1));

    h.reconcile_deployment("demo").await.expect("deployment");
    let salted = compute_hash(&tpl, Some(1)).expect("hash");
    assert_ne!(salted, hash);
    let created: ObjectSet = h.must_fetch(&format!("demo-{salted}")).await;
    assert_eq!(annotation(&created, REVISION_ANNOTATION).as_deref(), Some("1"));

    let dep: ObjectDeployment = h.must_fetch("demo").await;
    let status = dep.status.expect("status");
    assert_eq!(status.collision_count, Some(1));
    assert_eq!(status.template_hash, Some(salted));
}

#[test_log::test(tokio::test)]
async fn existing_owned_revision_is_adopted_as_current() {
    let h = Harness::new();
    let tpl = two_phase_template(1);
    h.create(&deployment("demo", tpl.clone())).await;
    h.reconcile_deployment("demo").await.expect("deployment");
    let hash = compute_hash(&tpl, None).expect("hash");
    let name = format!("demo-{hash}");
    let before: ObjectSet = h.must_fetch(&name).await;

    // a stale view: the revision lost its labels so the list misses it
    h.store
        .patch(
            &set_key(&name),
            &json!({"metadata": {"labels": {"app": null}}}),
        )
        .await
        .expect("unlabel");
    h.store.clear_journal().await;
    h.reconcile_deployment("demo").await.expect("deployment");

    let dep: ObjectDeployment = h.must_fetch("demo").await;
    assert_eq!(dep.status.and_then(|s| s.collision_count), None);

    let after: ObjectSet = h.must_fetch(&name).await;
    assert_eq!(after.uid(), before.uid());
    assert_eq!(annotation(&after, REVISION_ANNOTATION).as_deref(), Some("1"));
    let sets: Vec<ObjectSet> = list_as(&h.store, Some(NS), None).await.expect("list");
    assert_eq!(sets.len(), 1);
    let created_sets = h
        .store
        .journal()
        .await
        .into_iter()
        .filter(|r| r.op == WriteOp::Create && r.key.kind == "ObjectSet")
        .count();
    assert_eq!(created_sets, 0);
}

#[test_log::test(tokio::test)]
async fn outdated_revision_keeps_deployment_available_during_rollout() {
    let h = Harness::new();
    h.create(&deployment("demo", two_phase_template(1))).await;
    settle(&h, 3).await;
    let v1 = format!("demo-{}", compute_hash(&two_phase_template(1), None).expect("hash"));

    let dep: ObjectDeployment = h.must_fetch("demo").await;
    assert_eq!(status_of(&dep, ConditionType::Available), Some(ConditionStatus::True));

    h.store
        .patch(
            &ObjectKey::of::<ObjectDeployment>(Some(NS), "demo"),
            &json!({"spec": {"template": two_phase_template(2)}}),
        )
        .await
        .expect("update template");

    // old revision is asked to release the shared members first
    h.reconcile_deployment("demo").await.expect("deployment");
    let old: ObjectSet = h.must_fetch(&v1).await;
    let mut paused = old.spec.paused_for.clone();
    paused.sort();
    assert_eq!(
        paused,
        vec![
            PausedObject {
                group: String::new(),
                kind: "ConfigMap".into(),
                name: "y".into(),
            },
            PausedObject {
                group: "example.io".into(),
                kind: "Widget".into(),
                name: "x".into(),
            },
        ]
    );
    let dep: ObjectDeployment = h.must_fetch("demo").await;
    assert_eq!(
        reason(&deployment_conditions(&dep), ConditionType::Progressing).as_deref(),
        Some("HandingOver")
    );
    let sets: Vec<ObjectSet> =
        list_as(&h.store, Some(NS), None).await.expect("list");
    assert_eq!(sets.len(), 1);

    h.reconcile_set(&v1).await.expect("old revision");
    h.reconcile_deployment("demo").await.expect("deployment");

    let v2 = format!("demo-{}", compute_hash(&two_phase_template(2), None).expect("hash"));
    let new: ObjectSet = h.must_fetch(&v2).await;
    assert_eq!(annotation(&new, REVISION_ANNOTATION).as_deref(), Some("2"));

    let dep: ObjectDeployment = h.must_fetch("demo").await;
    assert_eq!(status_of(&dep, ConditionType::Available), Some(ConditionStatus::True));
    assert_eq!(
        status_of(&dep, ConditionType::Progressing),
        Some(ConditionStatus::True)
    );

    // new revision takes over the members, then the old one is archived
    h.reconcile_set(&v2).await.expect("new revision");
    let x = h.member(&widget_key("x")).await.expect("x");
    assert_eq!(controllers_of(&x), vec![v2.clone()]);
    assert_eq!(x["spec"]["size"], 2);

    h.reconcile_set(&v2).await.expect("new revision");
    h.reconcile_deployment("demo").await.expect("deployment");
    let dep: ObjectDeployment = h.must_fetch("demo").await;
    assert_eq!(
        status_of(&dep, ConditionType::Progressing),
        Some(ConditionStatus::False)
    );
    let old: ObjectSet = h.must_fetch(&v1).await;
    assert_eq!(old.spec.lifecycle_state, LifecycleState::Archived);

    h.reconcile_set(&v1).await.expect("archive old");
    assert!(h.member(&widget_key("x")).await.is_some());
    assert!(h.member(&cm_key("y")).await.is_some());
    let old: ObjectSet = h.must_fetch(&v1).await;
    assert_eq!(
        condition(&set_conditions(&old), ConditionType::Archived).map(|c| c.status),
        Some(ConditionStatus::True)
    );
}

#[test_log::test(tokio::test)]
async fn retention_deletes_oldest_and_archives_the_rest() {
    let h = Harness::new();
    let tpl = template("demo", vec![phase("a", vec![config_map("cfg")])], vec![]);
    let mut dep = deployment("demo", tpl);
    dep.spec.revision_history_limit = Some(2);
    let dep = h.create(&dep).await;
    let owner = dep
        .controller_owner_ref(&())
        .expect("deployment has a uid");

    for ordinal in 1..=4 {
        let name = format!("demo-old-{ordinal}");
        let mut set = object_set(&name, vec![], vec![]);
        set.metadata.labels = Some(app_labels("demo"));
        set.metadata.annotations = Some(BTreeMap::from([
            (REVISION_ANNOTATION.to_string(), ordinal.to_string()),
            (TEMPLATE_HASH_ANNOTATION.to_string(), format!("old{ordinal}")),
        ]));
        set.metadata.owner_references = Some(vec![owner.clone()]);
        h.create(&set).await;
        h.reconcile_set(&name).await.expect("old revision");
    }

    h.reconcile_deployment("demo").await.expect("deployment");
    let current = format!("demo-{}", compute_hash(&dep.spec.template, None).expect("hash"));
    let created: ObjectSet = h.must_fetch(&current).await;
    assert_eq!(annotation(&created, REVISION_ANNOTATION).as_deref(), Some("5"));

    h.reconcile_set(&current).await.expect("current revision");
    h.store.clear_journal().await;
    h.reconcile_deployment("demo").await.expect("deployment");

    let deleted: Vec<String> = h
        .deleted_keys()
        .await
        .into_iter()
        .map(|k| k.name)
        .collect();
    assert_eq!(deleted, vec!["demo-old-1", "demo-old-2"]);

    // deletion waits on the revisions' own teardown finalizer
    for name in ["demo-old-1", "demo-old-2"] {
        let set: ObjectSet = h.must_fetch(name).await;
        assert!(set.metadata.deletion_timestamp.is_some());
        h.reconcile_set(name).await.expect("teardown");
        assert!(h.fetch::<ObjectSet>(name).await.is_none());
    }
    for name in ["demo-old-3", "demo-old-4"] {
        let set: ObjectSet = h.must_fetch(name).await;
        assert_eq!(set.spec.lifecycle_state, LifecycleState::Archived);
    }
    let current: ObjectSet = h.must_fetch(&current).await;
    assert_eq!(current.spec.lifecycle_state, LifecycleState::Active);
}

#[test_log::test(tokio::test)]
async fn concurrent_adoption_leaves_a_single_controller() {
    let h = Harness::new();
    h.create(&object_set("left", vec![phase("a", vec![config_map("shared")])], vec![]))
        .await;
    h.create(&object_set("right", vec![phase("a", vec![config_map("shared")])], vec![]))
        .await;

    for _ in 0..5 {
        let (l, r) = tokio::join!(h.reconcile_set("left"), h.reconcile_set("right"));
        for res in [l, r] {
            if let Err(e) = res {
                assert!(
                    matches!(
                        e,
                        ReconcileErr::Store(ref s) if s.is_conflict()
                            || matches!(s, StoreError::AlreadyExists(_))
                    ),
                    "unexpected error {e}"
                );
            }
        }
        let shared = h.member(&cm_key("shared")).await.expect("shared");
        let controllers = controllers_of(&shared);
        assert_eq!(controllers.len(), 1, "{controllers:?}");
    }
}

#[test_log::test(tokio::test)]
async fn paused_handoff_stops_ownership_flapping() {
    let h = Harness::new();
    h.create(&object_set("old", vec![phase("a", vec![config_map("shared")])], vec![]))
        .await;
    h.reconcile_set("old").await.expect("old");

    h.store
        .patch(
            &set_key("old"),
            &json!({"spec": {"pausedFor": [{"kind": "ConfigMap", "name": "shared"}]}}),
        )
        .await
        .expect("pause");
    h.create(&object_set("new", vec![phase("a", vec![config_map("shared")])], vec![]))
        .await;

    let mut writes_after = Vec::new();
    for _ in 0..4 {
        let (o, n) = tokio::join!(h.reconcile_set("old"), h.reconcile_set("new"));
        o.expect("old");
        n.expect("new");
        let writes = h
            .store
            .journal()
            .await
            .into_iter()
            .filter(|r| r.key == cm_key("shared"))
            .count();
        writes_after.push(writes);
    }

    let shared = h.member(&cm_key("shared")).await.expect("shared");
    assert_eq!(controllers_of(&shared), vec!["new".to_string()]);
    assert_eq!(
        shared["metadata"]["labels"][OWNER_LABEL],
        "new"
    );
    // once handed over, nobody writes the member again
    assert_eq!(writes_after[1], writes_after[3]);
}

#[test_log::test(tokio::test)]
async fn unparseable_selector_is_an_invalid_object() {
    let h = Harness::new();
    let mut dep = deployment("demo", two_phase_template(1));
    dep.spec.selector.match_expressions = Some(vec![LabelSelectorRequirement {
        key: "app".into(),
        operator: "Near".into(),
        values: Some(vec!["demo".into()]),
    }]);
    h.create(&dep).await;

    let err = h.reconcile_deployment("demo").await.expect_err("bad selector");
    assert!(matches!(err, ReconcileErr::InvalidObject(_)), "{err}");
    let sets: Vec<ObjectSet> = list_as(&h.store, Some(NS), None).await.expect("list");
    assert!(sets.is_empty());
}
