//! Consul 注册中心后端

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client as HttpClient, Method, RequestBuilder, Response, Url};
use serde::Deserialize;

use crate::config::{ClientConfig, ConsulConfig, RegistrationConfig};
use crate::discovery::backend::{RegistrationBackend, RegistryTransport};
use crate::discovery::instance::{Instance, ServiceName};
use crate::discovery::snapshot::{ChangeIndex, Snapshot};
use crate::error::TransportError;

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";

/// Consul 后端
///
/// 服务查询走 `/v1/health/service/<name>` 阻塞查询，
/// 自注册使用 TTL 检查，心跳即 `/v1/agent/check/pass/service:<id>`
pub struct ConsulBackend {
    http_client: HttpClient,
    base_url: Url,
    token: Option<String>,
    datacenter: Option<String>,
    passing_only: bool,
    request_timeout: Duration,
    check_ttl: Duration,
    deregister_after: Duration,
}

impl ConsulBackend {
    pub fn new(
        consul: &ConsulConfig,
        registration: &RegistrationConfig,
    ) -> Result<Self, TransportError> {
        let http_client = HttpClient::builder()
            .build()
            .map_err(|e| TransportError::network(format!("failed to build http client: {}", e)))?;
        let base_url = Url::parse(&consul.address)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| {
                TransportError::malformed(format!("invalid consul address: {}", consul.address))
            })?;

        Ok(Self {
            http_client,
            base_url,
            token: consul.token.clone(),
            datacenter: consul.datacenter.clone(),
            passing_only: consul.passing_only,
            request_timeout: Duration::from_secs(consul.request_timeout_secs),
            check_ttl: Duration::from_secs(registration.ttl_secs),
            deregister_after: Duration::from_secs(registration.deregister_critical_after_secs),
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, TransportError> {
        Self::new(&config.consul, &config.registration)
    }

    /// TTL 检查 ID，格式为 "service:<instance_id>"
    pub fn check_id(instance_id: &str) -> String {
        format!("service:{}", instance_id)
    }

    /// 拼接接口地址，每一段都单独做百分号编码
    ///
    /// 服务名和实例 ID 中的 `/`、`?`、`#` 不会改变请求的路径或查询串。
    fn endpoint(&self, segments: &[&str]) -> Result<Url, TransportError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::malformed(format!("invalid consul address: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder, TransportError> {
        let mut builder = self.http_client.request(method, self.endpoint(segments)?);
        if let Some(token) = &self.token {
            builder = builder.header(TOKEN_HEADER, token);
        }
        if let Some(dc) = &self.datacenter {
            builder = builder.query(&[("dc", dc.as_str())]);
        }
        Ok(builder)
    }

    async fn ensure_success(resp: Response) -> Result<Response, TransportError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(TransportError::backend(status, message))
    }

    async fn put(
        &self,
        segments: &[&str],
        body: Option<serde_json::Value>,
    ) -> Result<(), TransportError> {
        let mut builder = self
            .request(Method::PUT, segments)?
            .timeout(self.request_timeout);
        if let Some(body) = body {
            builder = builder.json(&body);
        }
        let resp = builder.send().await?;
        Self::ensure_success(resp).await?;
        Ok(())
    }

    /// 0.0.0.0 / :: 无法被其他节点访问，转换为回环地址
    fn advertised_host(host: &str) -> String {
        match host.parse::<IpAddr>() {
            Ok(ip) if ip.is_unspecified() && ip.is_ipv4() => "127.0.0.1".to_string(),
            Ok(ip) if ip.is_unspecified() => "::1".to_string(),
            _ => host.to_string(),
        }
    }

    fn registration_payload(&self, instance: &Instance) -> serde_json::Value {
        serde_json::json!({
            "ID": instance.instance_id,
            "Name": instance.service_name.as_str(),
            "Tags": instance.tags,
            "Meta": instance.metadata,
            "Address": Self::advertised_host(&instance.host),
            "Port": instance.port,
            "Check": {
                "CheckID": Self::check_id(&instance.instance_id),
                "TTL": format!("{}s", self.check_ttl.as_secs().max(1)),
                "DeregisterCriticalServiceAfter": format!("{}s", self.deregister_after.as_secs().max(1)),
            }
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    node: NodeEntry,
    service: ServiceEntry,
    #[serde(default)]
    checks: Vec<CheckEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeEntry {
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceEntry {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    address: String,
    port: u16,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    meta: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CheckEntry {
    status: String,
}

impl HealthEntry {
    fn into_instance(self, service: &ServiceName) -> Instance {
        let healthy = self.checks.iter().all(|c| c.status == "passing");
        // 服务地址为空时 Consul 约定使用节点地址
        let host = if self.service.address.is_empty() {
            self.node.address
        } else {
            self.service.address
        };

        Instance {
            service_name: service.clone(),
            instance_id: self.service.id,
            host,
            port: self.service.port,
            healthy,
            metadata: self.service.meta.unwrap_or_default(),
            tags: self.service.tags.unwrap_or_default(),
            last_heartbeat: Utc::now(),
        }
    }
}

fn parse_index(resp: &Response) -> Result<ChangeIndex, TransportError> {
    let raw = resp
        .headers()
        .get(INDEX_HEADER)
        .ok_or_else(|| TransportError::malformed(format!("missing {} header", INDEX_HEADER)))?;
    raw.to_str()
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(ChangeIndex)
        .ok_or_else(|| TransportError::malformed(format!("invalid {} header: {:?}", INDEX_HEADER, raw)))
}

#[async_trait]
impl RegistryTransport for ConsulBackend {
    async fn fetch(
        &self,
        service: &ServiceName,
        last_index: Option<ChangeIndex>,
        wait: Duration,
    ) -> Result<Snapshot, TransportError> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(index) = last_index {
            query.push(("index", index.to_string()));
            query.push(("wait", format!("{}s", wait.as_secs().max(1))));
        }
        if self.passing_only {
            query.push(("passing", "true".to_string()));
        }

        // Consul 会在 wait 上再加最多 wait/16 的随机时长
        let http_timeout = wait + wait / 16 + self.request_timeout;
        let resp = self
            .request(Method::GET, &["v1", "health", "service", service.as_str()])?
            .query(&query)
            .timeout(http_timeout)
            .send()
            .await?;
        let resp = Self::ensure_success(resp).await?;

        let index = parse_index(&resp)?;
        let body = resp.bytes().await?;
        let entries: Vec<HealthEntry> = serde_json::from_slice(&body)
            .map_err(|e| TransportError::malformed(format!("invalid health response: {}", e)))?;

        let instances = entries
            .into_iter()
            .map(|entry| entry.into_instance(service))
            .collect();

        Ok(Snapshot::new(service.clone(), instances, index))
    }

    async fn list_services(&self) -> Result<Vec<ServiceName>, TransportError> {
        let resp = self
            .request(Method::GET, &["v1", "catalog", "services"])?
            .timeout(self.request_timeout)
            .send()
            .await?;
        let resp = Self::ensure_success(resp).await?;
        let body = resp.bytes().await?;
        let services: HashMap<String, serde_json::Value> = serde_json::from_slice(&body)
            .map_err(|e| TransportError::malformed(format!("invalid catalog response: {}", e)))?;

        let mut names: Vec<ServiceName> = services
            .into_keys()
            .filter_map(|name| ServiceName::new(name).ok())
            .collect();
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl RegistrationBackend for ConsulBackend {
    async fn register(&self, instance: &Instance) -> Result<(), TransportError> {
        let payload = self.registration_payload(instance);
        self.put(&["v1", "agent", "service", "register"], Some(payload))
            .await
    }

    async fn deregister(&self, instance_id: &str) -> Result<(), TransportError> {
        self.put(&["v1", "agent", "service", "deregister", instance_id], None)
            .await
    }

    async fn heartbeat(&self, instance_id: &str) -> Result<(), TransportError> {
        let check_id = Self::check_id(instance_id);
        self.put(&["v1", "agent", "check", "pass", &check_id], None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertised_host() {
        assert_eq!(ConsulBackend::advertised_host("0.0.0.0"), "127.0.0.1");
        assert_eq!(ConsulBackend::advertised_host("::"), "::1");
        assert_eq!(ConsulBackend::advertised_host("10.0.0.7"), "10.0.0.7");
        assert_eq!(ConsulBackend::advertised_host("orders.internal"), "orders.internal");
    }

    #[test]
    fn test_endpoint_encodes_each_segment() {
        let consul = ConsulConfig {
            address: "http://consul.local:8500/".to_string(),
            ..ConsulConfig::default()
        };
        let backend = ConsulBackend::new(&consul, &RegistrationConfig::default()).unwrap();

        let url = backend
            .endpoint(&["v1", "health", "service", "team/orders?x=1#a"])
            .unwrap();
        assert_eq!(url.path(), "/v1/health/service/team%2Forders%3Fx=1%23a");
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);

        let url = backend
            .endpoint(&["v1", "agent", "check", "pass", "service:orders-1"])
            .unwrap();
        assert_eq!(url.as_str(), "http://consul.local:8500/v1/agent/check/pass/service:orders-1");
    }

    #[test]
    fn test_rejects_invalid_address() {
        let consul = ConsulConfig {
            address: "consul:8500".to_string(),
            ..ConsulConfig::default()
        };
        assert!(ConsulBackend::new(&consul, &RegistrationConfig::default()).is_err());
    }

    #[test]
    fn test_health_entry_falls_back_to_node_address() {
        let raw = r#"[{
            "Node": {"Node": "node-1", "Address": "10.0.0.9"},
            "Service": {"ID": "orders-1", "Service": "orders", "Address": "", "Port": 8080, "Tags": null, "Meta": null},
            "Checks": [{"Status": "passing"}, {"Status": "warning"}]
        }]"#;
        let entries: Vec<HealthEntry> = serde_json::from_str(raw).unwrap();
        let name = ServiceName::new("orders").unwrap();
        let instance = entries.into_iter().next().unwrap().into_instance(&name);

        assert_eq!(instance.host, "10.0.0.9");
        assert!(!instance.healthy);
        assert!(instance.tags.is_empty());
    }

    #[test]
    fn test_registration_payload() {
        let backend = ConsulBackend::new(&ConsulConfig::default(), &RegistrationConfig::default()).unwrap();
        let instance = Instance::new(ServiceName::new("orders").unwrap(), "orders-1", "0.0.0.0", 8080)
            .with_tag("v1")
            .with_metadata("zone", "a");
        let payload = backend.registration_payload(&instance);

        assert_eq!(payload["ID"], "orders-1");
        assert_eq!(payload["Name"], "orders");
        assert_eq!(payload["Address"], "127.0.0.1");
        assert_eq!(payload["Meta"]["zone"], "a");
        assert_eq!(payload["Check"]["CheckID"], "service:orders-1");
        assert_eq!(payload["Check"]["TTL"], "30s");
        assert_eq!(payload["Check"]["DeregisterCriticalServiceAfter"], "90s");
    }
}
