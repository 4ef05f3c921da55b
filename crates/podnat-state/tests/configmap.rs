//! Integration tests for the ConfigMap state store

use podnat_state::{ConfigMapState, StateStore};

/// Round trip against a real cluster
#[tokio::test]
#[ignore] // Requires cluster access and RBAC for configmaps
async fn test_configmap_round_trip() {
    let client = kube::Client::try_default().await.expect("cluster client");
    let store = ConfigMapState::new(client, "testnode");

    let value = serde_json::json!({"1.2.3.4:25": []});
    store.put(&value).await.expect("put state");

    let bytes = store.get().await.expect("get state");
    let back: serde_json::Value = serde_json::from_slice(&bytes).expect("decode state");
    assert_eq!(back, value);

    // a second put overwrites in place
    let updated = serde_json::json!({"1.2.3.4:25": [], "5.6.7.8:80": []});
    store.put(&updated).await.expect("update state");
    let bytes = store.get().await.expect("get updated state");
    let back: serde_json::Value = serde_json::from_slice(&bytes).expect("decode updated state");
    assert_eq!(back, updated);
}
