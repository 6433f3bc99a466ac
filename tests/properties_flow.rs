//! Integration tests for device properties and installed products.

use trellix_epo::auth::TokenProvider;
use trellix_epo::client::{EpoClient, RetryPolicy};
use trellix_epo::properties::*;
use trellix_epo::resource::{DeviceId, Lookup};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn mock_client(server: &MockServer) -> EpoClient {
    EpoClient::new(
        TokenProvider::with_token("mock-token"),
        &format!("{}/epo/v2/", server.uri()),
    )
    .unwrap()
    .with_retry_policy(RetryPolicy::without_delays())
}

#[tokio::test]
async fn collect_properties_requests_selected_fields() {
    let server = MockServer::start().await;
    let client = mock_client(&server);
    let selection = FieldSelection::new(&["osType", "computerName"]).unwrap();

    Mock::given(method("GET"))
        .and(path("/epo/v2/devices/42"))
        .and(query_param("fields", selection.fields().join(",").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": {
                "type": "devices",
                "id": 42,
                "attributes": {"computerName": "web-01", "osType": "Linux"}
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let props = match collect_properties(&client, DeviceId(42), &selection).await.unwrap() {
        Lookup::Found(props) => props,
        Lookup::NotFound => panic!("expected properties"),
    };
    assert_eq!(props["computerName"], "web-01");
    assert_eq!(props["osType"], "Linux");
}

#[tokio::test]
async fn collect_properties_for_unknown_device_is_not_found() {
    let server = MockServer::start().await;
    let client = mock_client(&server);

    Mock::given(method("GET"))
        .and(path("/epo/v2/devices/9"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let result = collect_properties(&client, DeviceId(9), &FieldSelection::all())
        .await
        .unwrap();
    assert_eq!(result, Lookup::NotFound);
}

#[tokio::test]
async fn collect_all_properties_walks_every_page() {
    let server = MockServer::start().await;
    let client = mock_client(&server);
    let selection = FieldSelection::new(&["computerName"]).unwrap();

    Mock::given(method("GET"))
        .and(path("/epo/v2/devices"))
        .and(query_param("fields", "computerName"))
        .and(query_param("page[offset]", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [{"type": "devices", "id": 1, "attributes": {"computerName": "a"}}],
            "links": {"next": "/epo/v2/devices?fields=computerName&page[offset]=1000&page[limit]=1000"}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/epo/v2/devices"))
        .and(query_param("page[offset]", "1000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [{"type": "devices", "id": 2, "attributes": {"computerName": "b"}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let rows = collect_all_properties(&client, &selection).await.unwrap();
    let names: Vec<&str> = rows
        .iter()
        .filter_map(|row| row["computerName"].as_str())
        .collect();
    assert_eq!(names, vec!["a", "b"]);
}

#[tokio::test]
async fn installed_products_are_read_with_extra_attributes() {
    let server = MockServer::start().await;
    let client = mock_client(&server);

    Mock::given(method("GET"))
        .and(path("/epo/v2/devices/42/installedProducts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [
                {
                    "type": "installedProducts",
                    "id": "ENDP_AM_1070",
                    "attributes": {
                        "productFamilyName": "Endpoint Security Threat Prevention",
                        "productVersion": "10.7.0.6421",
                        "hotfixes": ""
                    }
                },
                {
                    "type": "installedProducts",
                    "id": "EPOAGENT3000",
                    "attributes": {
                        "productFamilyName": "Trellix Agent",
                        "productVersion": "5.8.0.161"
                    }
                }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let products = installed_products(&client, DeviceId(42)).await.unwrap();
    assert_eq!(products.len(), 2);
    assert_eq!(products[0].product_family_name, "Endpoint Security Threat Prevention");
    assert_eq!(products[0].product_version, "10.7.0.6421");
    assert!(products[0].extra.contains_key("hotfixes"));
    assert_eq!(products[1].product_family_name, "Trellix Agent");
}

#[tokio::test]
async fn installed_products_of_unknown_device_are_empty() {
    let server = MockServer::start().await;
    let client = mock_client(&server);

    Mock::given(method("GET"))
        .and(path("/epo/v2/devices/9/installedProducts"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let products = installed_products(&client, DeviceId(9)).await.unwrap();
    assert!(products.is_empty());
}
