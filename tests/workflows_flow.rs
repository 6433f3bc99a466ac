//! Integration tests for the multi-step flows behind the CLI subcommands.

use trellix_epo::auth::TokenProvider;
use trellix_epo::client::{EpoClient, RetryPolicy};
use trellix_epo::error::EpoError;
use trellix_epo::resource::DeviceId;
use trellix_epo::workflows::*;
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn mock_client(server: &MockServer) -> EpoClient {
    EpoClient::new(
        TokenProvider::with_token("mock-token"),
        &format!("{}/epo/v2/", server.uri()),
    )
    .unwrap()
    .with_retry_policy(RetryPolicy::without_delays())
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

async fn mount_tag(server: &MockServer, name: &str, id: u64) {
    Mock::given(method("GET"))
        .and(path("/epo/v2/tags"))
        .and(query_param("filter", format!(r#"{{"EQ":{{"name":"{name}"}}}}"#).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [{"type": "tags", "id": id, "attributes": {"name": name}}]
        })))
        .mount(server)
        .await;
}

async fn mount_device(server: &MockServer, name: &str, ids: &[u64]) {
    let data: Vec<_> = ids
        .iter()
        .map(|id| serde_json::json!({"type": "devices", "id": id, "attributes": {"name": name}}))
        .collect();
    Mock::given(method("GET"))
        .and(path("/epo/v2/devices"))
        .and(query_param("filter", format!(r#"{{"EQ":{{"name":"{name}"}}}}"#).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": data})))
        .mount(server)
        .await;
}

// ── Batch tagging ──────────────────────────────────────────────────────

#[tokio::test]
async fn batch_apply_only_sends_devices_needing_the_tag() {
    let server = MockServer::start().await;
    let client = mock_client(&server);
    mount_tag(&server, "Quarantine", 7).await;

    Mock::given(method("GET"))
        .and(path("/epo/v2/devices"))
        .and(query_param("fields", "id,name,tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [
                {"type": "devices", "id": 1, "attributes": {"name": "web-01", "tags": "Server, Quarantine"}},
                {"type": "devices", "id": 2, "attributes": {"name": "web-02", "tags": "Server"}},
                {"type": "devices", "id": 3, "attributes": {"name": "db-01", "tags": ""}}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/epo/v2/tags/7/relationships/devices"))
        .and(body_json(serde_json::json!({"data": [{"type": "devices", "id": 2}]})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let summary = tag_devices_in_batch(
        &client,
        "Quarantine",
        &names(&["web-01", "web-02", "ghost"]),
        TagAction::Apply,
    )
    .await
    .unwrap();

    assert_eq!(summary.changed, 1);
    assert_eq!(summary.already_satisfied, 1);
    assert_eq!(summary.not_found, names(&["ghost"]));
    assert!(summary.is_success());
}

#[tokio::test]
async fn batch_with_nothing_to_change_sends_no_mutation() {
    let server = MockServer::start().await;
    let client = mock_client(&server);
    mount_tag(&server, "Quarantine", 7).await;

    Mock::given(method("GET"))
        .and(path("/epo/v2/devices"))
        .and(query_param("fields", "id,name,tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [{"type": "devices", "id": 2, "attributes": {"name": "web-02", "tags": "Server"}}]
        })))
        .mount(&server)
        .await;
    Mock::given(path("/epo/v2/tags/7/relationships/devices"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&server)
        .await;

    let summary = tag_devices_in_batch(&client, "Quarantine", &names(&["web-02"]), TagAction::Clear)
        .await
        .unwrap();
    assert_eq!(summary.changed, 0);
    assert_eq!(summary.already_satisfied, 1);
}

#[tokio::test]
async fn unknown_tag_stops_before_any_mutation() {
    let server = MockServer::start().await;
    let client = mock_client(&server);

    Mock::given(method("GET"))
        .and(path("/epo/v2/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
        .mount(&server)
        .await;
    Mock::given(path("/epo/v2/devices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
        .expect(0)
        .mount(&server)
        .await;

    let err = tag_devices_in_batch(&client, "Missing", &names(&["web-01"]), TagAction::Apply)
        .await
        .unwrap_err();
    assert!(matches!(err, EpoError::UnknownTag(ref tag) if tag == "Missing"), "got {err:?}");
}

// ── Per-device tagging ─────────────────────────────────────────────────

#[tokio::test]
async fn per_device_clear_resolves_each_name() {
    let server = MockServer::start().await;
    let client = mock_client(&server);
    mount_tag(&server, "Quarantine", 7).await;
    mount_device(&server, "web-01", &[1]).await;
    mount_device(&server, "web-02", &[2]).await;
    mount_device(&server, "twin", &[3, 4]).await;
    mount_device(&server, "ghost", &[]).await;

    Mock::given(method("DELETE"))
        .and(path("/epo/v2/tags/7/relationships/devices"))
        .and(body_json(serde_json::json!({"data": [{"type": "devices", "id": 1}]})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/epo/v2/tags/7/relationships/devices"))
        .and(body_json(serde_json::json!({"data": [{"type": "devices", "id": 2}]})))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let summary = tag_each_device(
        &client,
        "Quarantine",
        &names(&["web-01", "web-02", "twin", "ghost"]),
        TagAction::Clear,
    )
    .await
    .unwrap();

    assert_eq!(summary.changed, 1);
    assert_eq!(summary.already_satisfied, 1);
    assert_eq!(summary.ambiguous, names(&["twin"]));
    assert_eq!(summary.not_found, names(&["ghost"]));
    assert!(summary.is_success());
}

#[tokio::test]
async fn per_device_rejection_is_recorded() {
    let server = MockServer::start().await;
    let client = mock_client(&server);
    mount_tag(&server, "Quarantine", 7).await;
    mount_device(&server, "web-01", &[1]).await;

    Mock::given(method("POST"))
        .and(path("/epo/v2/tags/7/relationships/devices"))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&server)
        .await;

    let summary = tag_each_device(&client, "Quarantine", &names(&["web-01"]), TagAction::Apply)
        .await
        .unwrap();
    assert_eq!(summary.rejected, names(&["web-01"]));
    assert!(!summary.is_success());
}

// ── Reports ────────────────────────────────────────────────────────────

#[tokio::test]
async fn device_properties_skips_unresolvable_names() {
    let server = MockServer::start().await;
    let client = mock_client(&server);
    mount_device(&server, "web-01", &[1]).await;
    mount_device(&server, "ghost", &[]).await;

    Mock::given(method("GET"))
        .and(path("/epo/v2/devices/1"))
        .and(query_param("fields", "computerName"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": {"type": "devices", "id": 1, "attributes": {"computerName": "web-01"}}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let selection = parse_selection("computerName").unwrap();
    let rows = device_properties(&client, &names(&["ghost", "web-01"]), &selection)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["computerName"], "web-01");
}

#[tokio::test]
async fn device_inventory_collects_products_per_device() {
    let server = MockServer::start().await;
    let client = mock_client(&server);
    mount_device(&server, "web-01", &[1]).await;
    mount_device(&server, "web-02", &[2]).await;

    Mock::given(method("GET"))
        .and(path("/epo/v2/devices/1/installedProducts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [{
                "type": "installedProducts",
                "id": "EPOAGENT3000",
                "attributes": {"productFamilyName": "Trellix Agent", "productVersion": "5.8.0"}
            }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/epo/v2/devices/2/installedProducts"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let inventory = device_inventory(&client, &names(&["web-01", "web-02"]))
        .await
        .unwrap();
    assert_eq!(inventory.len(), 2);
    assert_eq!(inventory[0].id, DeviceId(1));
    assert_eq!(inventory[0].products[0].product_family_name, "Trellix Agent");
    assert_eq!(inventory[1].name, "web-02");
    assert!(inventory[1].products.is_empty());
}
