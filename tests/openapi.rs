use utoipa::OpenApi;
use watchtower_agent::api::ApiDoc;

#[test]
fn openapi_document_covers_the_surface() {
    let spec = ApiDoc::openapi().to_pretty_json().unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&spec).unwrap();

    assert_eq!(parsed["info"]["title"], "Watchtower Agent API");

    let paths = parsed["paths"].as_object().unwrap();
    for path in [
        "/api/watchtower/status",
        "/api/watchtower/stats",
        "/api/watchtower/containers",
        "/api/watchtower/containers/{id}",
        "/api/watchtower/containers/{id}/update",
        "/api/watchtower/updates",
        "/api/watchtower/check-updates",
        "/api/watchtower/config",
        "/api/watchtower/images",
    ] {
        assert!(paths.contains_key(path), "missing path {path}");
    }

    let schemas = parsed["components"]["schemas"].as_object().unwrap();
    for schema in ["ContainerRecord", "UpdateRecord", "AgentConfig", "ErrorBody"] {
        assert!(schemas.contains_key(schema), "missing schema {schema}");
    }
}
