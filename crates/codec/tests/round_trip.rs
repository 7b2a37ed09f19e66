use magnitude_codec::{canonicalize, decode, encode_record, identity_of};
use magnitude_core::{ResourceIdentity, ResourceRecord};
use serde_json::json;

fn live_deployment() -> ResourceRecord {
    ResourceRecord::from_document(json!({
        "status": { "replicas": 2, "conditions": [ { "type": "Available", "status": "True" } ] },
        "spec": {
            "replicas": 2,
            "selector": { "matchLabels": { "app": "web" } },
            "template": { "metadata": { "labels": { "app": "web" } }, "spec": { "containers": [ { "name": "web", "image": "web:1" } ] } }
        },
        "metadata": {
            "uid": "11111111-1111-4111-8111-111111111111",
            "resourceVersion": "42",
            "generation": 3,
            "managedFields": [ { "manager": "kubectl" } ],
            "annotations": {
                "kubectl.kubernetes.io/last-applied-configuration": "{}",
                "team": "shop"
            },
            "namespace": "shop",
            "name": "web"
        },
        "kind": "Deployment",
        "apiVersion": "apps/v1"
    }))
    .unwrap()
}

#[test]
fn record_with_status_survives_encode_then_decode() {
    let rec = live_deployment();
    let text = encode_record(&rec, true).unwrap();
    let back = decode(&text).unwrap();
    assert_eq!(canonicalize(&back), canonicalize(&rec.to_document()));
    assert_eq!(identity_of(&back).unwrap(), ResourceIdentity::new("apps", "Deployment", Some("shop"), "web"));
}

#[test]
fn editable_text_drops_server_state_but_keeps_user_fields() {
    let rec = live_deployment();
    let text = encode_record(&rec, false).unwrap();
    let back = decode(&text).unwrap();
    let meta = &back["metadata"];
    for gone in ["resourceVersion", "uid", "generation", "managedFields"] {
        assert!(meta.get(gone).is_none(), "{} should be stripped", gone);
    }
    assert!(back.get("status").is_none());
    assert_eq!(meta["annotations"], json!({ "team": "shop" }));
    assert_eq!(back["spec"]["template"]["spec"]["containers"][0]["image"], "web:1");
    // Canonical text starts with the identity header regardless of input order.
    assert!(text.starts_with("apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n  namespace: shop\n"));
}
