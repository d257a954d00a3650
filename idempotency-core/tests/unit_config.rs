use idempotency_core::{BackendConfig, Store};

#[test]
fn memory_is_the_default_backend() {
    assert!(matches!(BackendConfig::default(), BackendConfig::Memory { max_records: None }));
}

#[tokio::test]
async fn memory_backend_builds_without_io() {
    let store = BackendConfig::Memory { max_records: Some(10) }.build().await.unwrap();
    store.health_check().await.unwrap();
}

#[test]
fn deserializes_from_tagged_json() {
    let json = r#"{"backend":"redis","url":"redis://localhost:6379"}"#;
    let config: BackendConfig = serde_json::from_str(json).unwrap();
    match config {
        BackendConfig::Redis { url, key_namespace } => {
            assert_eq!(url, "redis://localhost:6379");
            assert_eq!(key_namespace, "idempotency:");
        }
        _ => panic!("expected Redis variant"),
    }
}
