//! Consul 后端测试
//!
//! 默认测试使用 wiremock 模拟 Consul HTTP API。
//! 需要真实 Consul 的测试会被忽略，使用 `cargo test --test consul_backend_test -- --ignored` 运行：
//! ```bash
//! docker run -d --name consul-test -p 8500:8500 hashicorp/consul:1.17 agent -dev -client=0.0.0.0
//! ```

use std::time::Duration;

use discovery_client::{
    ChangeIndex, ClientConfig, ConsulBackend, ConsulConfig, Instance, RegistrationBackend,
    RegistrationConfig, RegistryTransport, ServiceName, TransportError,
};
use http::StatusCode;
use serde_json::{Value, json};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn backend_for(server: &MockServer) -> ConsulBackend {
    let consul = ConsulConfig {
        address: server.uri(),
        token: Some("acl-token".to_string()),
        ..ConsulConfig::default()
    };
    ConsulBackend::new(&consul, &RegistrationConfig::default()).unwrap()
}

fn orders() -> ServiceName {
    ServiceName::new("orders").unwrap()
}

fn health_body() -> Value {
    json!([
        {
            "Node": {"Node": "node-1", "Address": "10.0.0.1"},
            "Service": {
                "ID": "orders-1", "Service": "orders", "Address": "10.0.1.1", "Port": 8080,
                "Tags": ["v1"], "Meta": {"zone": "a"}
            },
            "Checks": [{"Status": "passing"}, {"Status": "passing"}]
        },
        {
            "Node": {"Node": "node-2", "Address": "10.0.0.2"},
            "Service": {"ID": "orders-2", "Service": "orders", "Address": "", "Port": 8081},
            "Checks": [{"Status": "passing"}, {"Status": "critical"}]
        }
    ])
}

#[tokio::test]
async fn test_fetch_parses_health_entries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/orders"))
        .and(header("X-Consul-Token", "acl-token"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Consul-Index", "42")
                .set_body_json(health_body()),
        )
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    let snapshot = backend
        .fetch(&orders(), None, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(snapshot.change_index, ChangeIndex(42));
    assert_eq!(snapshot.instances.len(), 2);

    let first = &snapshot.instances[0];
    assert_eq!(first.instance_id, "orders-1");
    assert_eq!(first.host, "10.0.1.1");
    assert!(first.healthy);
    assert_eq!(first.tags, vec!["v1".to_string()]);
    assert_eq!(first.metadata.get("zone").map(String::as_str), Some("a"));

    let second = &snapshot.instances[1];
    assert_eq!(second.host, "10.0.0.2");
    assert!(!second.healthy);
}

#[tokio::test]
async fn test_blocking_query_carries_index_and_wait() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/orders"))
        .and(query_param("index", "42"))
        .and(query_param("wait", "3s"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Consul-Index", "42")
                .set_body_json(health_body()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    let snapshot = backend
        .fetch(&orders(), Some(ChangeIndex(42)), Duration::from_secs(3))
        .await
        .unwrap();

    // 超时且无变化：索引不变
    assert_eq!(snapshot.change_index, ChangeIndex(42));
}

#[tokio::test]
async fn test_service_name_is_path_encoded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/orders"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Consul-Index", "42")
                .set_body_json(health_body()),
        )
        .expect(0)
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    let name = ServiceName::new("orders?x=1").unwrap();
    let err = backend
        .fetch(&name, None, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Backend { status, .. } if status == StatusCode::NOT_FOUND));

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].url.path(), "/v1/health/service/orders%3Fx=1");
    assert_eq!(requests[0].url.query(), None);
}

#[tokio::test]
async fn test_missing_index_header_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(health_body()))
        .mount(&server)
        .await;

    let err = backend_for(&server)
        .fetch(&orders(), None, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Malformed(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_invalid_body_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/orders"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Consul-Index", "7")
                .set_body_string("{not json"),
        )
        .mount(&server)
        .await;

    let err = backend_for(&server)
        .fetch(&orders(), None, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Malformed(_)));
}

#[tokio::test]
async fn test_server_error_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/orders"))
        .respond_with(ResponseTemplate::new(503).set_body_string("No cluster leader"))
        .mount(&server)
        .await;

    let err = backend_for(&server)
        .fetch(&orders(), None, Duration::from_secs(1))
        .await
        .unwrap_err();
    match &err {
        TransportError::Backend { status, message } => {
            assert_eq!(*status, StatusCode::SERVICE_UNAVAILABLE);
            assert_eq!(message, "No cluster leader");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_unreachable_backend_is_network_failure() {
    let consul = ConsulConfig {
        // 保留端口，不会有服务监听
        address: "http://127.0.0.1:9".to_string(),
        request_timeout_secs: 1,
        ..ConsulConfig::default()
    };
    let backend = ConsulBackend::new(&consul, &RegistrationConfig::default()).unwrap();
    let err = backend
        .fetch(&orders(), None, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Network(_)));
}

#[tokio::test]
async fn test_list_services() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/catalog/services"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "payments": [],
            "consul": [],
            "orders": ["v1"]
        })))
        .mount(&server)
        .await;

    let names: Vec<String> = backend_for(&server)
        .list_services()
        .await
        .unwrap()
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(names, vec!["consul", "orders", "payments"]);
}

#[tokio::test]
async fn test_register_heartbeat_deregister_paths() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/check/pass/service:orders-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/deregister/orders-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    let instance = Instance::new(orders(), "orders-1", "0.0.0.0", 8080).with_tag("v1");
    backend.register(&instance).await.unwrap();
    backend.heartbeat("orders-1").await.unwrap();
    backend.deregister("orders-1").await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let body: Value = requests[0].body_json().unwrap();
    assert_eq!(body["ID"], "orders-1");
    assert_eq!(body["Name"], "orders");
    assert_eq!(body["Address"], "127.0.0.1");
    assert_eq!(body["Check"]["CheckID"], "service:orders-1");
}

#[tokio::test]
async fn test_register_rejection_is_not_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .respond_with(ResponseTemplate::new(400).set_body_string("Invalid check"))
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    let instance = Instance::new(orders(), "orders-1", "10.0.0.1", 8080);
    let err = backend.register(&instance).await.unwrap_err();
    assert!(!err.is_retryable());
}

/// 测试：真实 Consul 上的注册、发现和注销
#[tokio::test]
#[ignore]
async fn test_live_consul_roundtrip() {
    let config = ClientConfig::default().with_env_overrides().unwrap();
    let backend = ConsulBackend::from_config(&config).unwrap();
    let name = ServiceName::new("discovery-client-test").unwrap();
    let instance = Instance::new(name.clone(), Instance::generate_id(&name), "127.0.0.1", 18080);

    backend.register(&instance).await.expect("Failed to register service");
    backend.heartbeat(&instance.instance_id).await.expect("Failed to send heartbeat");

    let snapshot = backend
        .fetch(&name, None, Duration::from_secs(1))
        .await
        .expect("Failed to fetch service");
    assert!(
        snapshot
            .instances
            .iter()
            .any(|i| i.instance_id == instance.instance_id && i.healthy),
        "Service instance not found after registration"
    );

    backend
        .deregister(&instance.instance_id)
        .await
        .expect("Failed to deregister service");
}
