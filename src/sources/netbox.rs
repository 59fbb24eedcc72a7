use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::collection::{FieldMaps, Fields, InventoryAdapter};
use crate::common::{AuditError, Result};
use crate::config::SourceConfig;
use crate::normalize::HostnameNormalizer;
use crate::sources::{check_status, response_json, Source};

pub const NAME: &str = "netbox";

const PAGE_SIZE: usize = 500;

/// NetBox instance. Token-authenticated DCIM API.
pub struct NetboxSource {
    client: reqwest::Client,
    base_url: String,
    connected: AtomicBool,
}

impl NetboxSource {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let token = config
            .credentials
            .token()
            .ok_or_else(|| AuditError::api("netbox: token credentials required"))?;

        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Token {token}"))
            .map_err(|err| AuditError::api(format!("netbox: bad token: {err}")))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            connected: AtomicBool::new(false),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl Source for NetboxSource {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn login(&self) -> Result<()> {
        let resp = self.client.get(self.url("/api/status/")).send().await?;
        let body = response_json(resp).await?;
        info!(
            version = body["netbox-version"].as_str().unwrap_or("unknown"),
            "netbox session verified"
        );
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Device records in NetBox DCIM. Read-write: this is the side reconciliation
/// mutates. Creating a device needs NetBox object ids for the site, device
/// type, and role, which are looked up by name on first use and cached for
/// the life of the adapter.
pub struct NetboxDevices {
    source: Arc<NetboxSource>,
    maps: FieldMaps,
    hostname: HostnameNormalizer,
    role_slug: String,
    site_ids: tokio::sync::RwLock<HashMap<String, i64>>,
    type_ids: tokio::sync::RwLock<HashMap<String, i64>>,
    role_id: tokio::sync::RwLock<Option<i64>>,
}

impl NetboxDevices {
    pub fn new(
        source: Arc<NetboxSource>,
        maps: FieldMaps,
        hostname: HostnameNormalizer,
        config: &SourceConfig,
    ) -> Self {
        let role_slug = config
            .options
            .get("device_role")
            .cloned()
            .unwrap_or_else(|| "network".to_string());
        Self {
            source,
            maps,
            hostname,
            role_slug,
            site_ids: tokio::sync::RwLock::new(HashMap::new()),
            type_ids: tokio::sync::RwLock::new(HashMap::new()),
            role_id: tokio::sync::RwLock::new(None),
        }
    }

    async fn site_id(&self, slug: &str) -> Result<i64> {
        if let Some(id) = self.site_ids.read().await.get(slug) {
            return Ok(*id);
        }
        let id = self
            .lookup_id("/api/dcim/sites/", &[("slug", slug)])
            .await?;
        self.site_ids.write().await.insert(slug.to_string(), id);
        Ok(id)
    }

    async fn device_type_id(&self, model: &str) -> Result<i64> {
        if let Some(id) = self.type_ids.read().await.get(model) {
            return Ok(*id);
        }
        let id = self
            .lookup_id("/api/dcim/device-types/", &[("model", model)])
            .await?;
        self.type_ids.write().await.insert(model.to_string(), id);
        Ok(id)
    }

    async fn device_role_id(&self) -> Result<i64> {
        if let Some(id) = *self.role_id.read().await {
            return Ok(id);
        }
        let id = self
            .lookup_id("/api/dcim/device-roles/", &[("slug", &self.role_slug)])
            .await?;
        *self.role_id.write().await = Some(id);
        Ok(id)
    }

    async fn lookup_id(&self, path: &str, query: &[(&str, &str)]) -> Result<i64> {
        let resp = self
            .source
            .client
            .get(self.source.url(path))
            .query(query)
            .send()
            .await?;
        let body = response_json(resp).await?;
        body["results"]
            .as_array()
            .and_then(|results| results.first())
            .and_then(|first| first["id"].as_i64())
            .ok_or_else(|| {
                AuditError::api(format!("netbox: no match on {path} for {query:?}"))
            })
    }

    fn record_id(rec: &Value) -> Result<i64> {
        rec["id"]
            .as_i64()
            .ok_or_else(|| AuditError::api("netbox: record has no id"))
    }

    /// Changed fields → PATCH payload. Fields NetBox cannot patch directly on
    /// a device are skipped with a warning rather than failing the item.
    async fn patch_payload(&self, changes: &Fields) -> Result<Map<String, Value>> {
        let mut payload = Map::new();
        for (field, value) in changes {
            match field.as_str() {
                "hostname" => {
                    payload.insert("name".to_string(), json!(value));
                }
                "sn" => {
                    payload.insert("serial".to_string(), json!(value));
                }
                "status" => {
                    payload.insert(
                        "status".to_string(),
                        json!(self.maps.imap("status", value)),
                    );
                }
                "site" => {
                    payload.insert("site".to_string(), json!(self.site_id(value).await?));
                }
                "model" => {
                    payload.insert(
                        "device_type".to_string(),
                        json!(self.device_type_id(value).await?),
                    );
                }
                other => {
                    // primary IPs, platforms and manufacturers hang off other
                    // NetBox objects and are not patched through the device
                    warn!(field = other, "netbox: field not updatable on devices, skipping");
                }
            }
        }
        Ok(payload)
    }
}

#[async_trait]
impl InventoryAdapter for NetboxDevices {
    fn collection_name(&self) -> &'static str {
        "devices"
    }

    fn source_name(&self) -> &'static str {
        NAME
    }

    fn fields(&self) -> &'static [&'static str] {
        &[
            "sn", "hostname", "ipaddr", "site", "vendor", "model", "os_name", "status",
        ]
    }

    fn key_fields(&self) -> &'static [&'static str] {
        &["sn"]
    }

    fn maps(&self) -> &FieldMaps {
        &self.maps
    }

    /// `filters` is a raw DCIM query-string fragment, e.g. `site=dc1`.
    async fn fetch(&self, filters: Option<&str>) -> Result<Vec<Value>> {
        let mut records = Vec::new();
        let mut offset = 0usize;

        loop {
            let mut url = format!(
                "{}?limit={PAGE_SIZE}&offset={offset}",
                self.source.url("/api/dcim/devices/")
            );
            if let Some(filters) = filters {
                url.push('&');
                url.push_str(filters);
            }

            debug!(offset, "fetching netbox device page");
            let resp = self.source.client.get(&url).send().await?;
            let body = response_json(resp).await?;

            let results = body["results"]
                .as_array()
                .ok_or_else(|| AuditError::api("netbox: device response missing results"))?;
            records.extend(results.iter().cloned());

            if body["next"].is_null() || results.is_empty() {
                break;
            }
            offset += results.len();
        }

        Ok(records)
    }

    fn item_filter(&self, fields: &Fields) -> Option<String> {
        fields.get("sn").map(|sn| format!("serial={sn}"))
    }

    fn itemize(&self, rec: &Value) -> Result<Fields> {
        let mut fields = Fields::new();
        fields.insert("sn".into(), text(rec, &["serial"]));
        fields.insert(
            "hostname".into(),
            self.hostname
                .normalize(rec["name"].as_str().unwrap_or_default()),
        );
        fields.insert(
            "ipaddr".into(),
            text(rec, &["primary_ip4", "address"])
                .split('/')
                .next()
                .unwrap_or_default()
                .to_string(),
        );
        fields.insert("site".into(), text(rec, &["site", "slug"]));
        fields.insert(
            "vendor".into(),
            text(rec, &["device_type", "manufacturer", "name"]).to_lowercase(),
        );
        fields.insert("model".into(), text(rec, &["device_type", "model"]));
        fields.insert("os_name".into(), text(rec, &["platform", "slug"]));
        fields.insert(
            "status".into(),
            self.maps.map("status", &text(rec, &["status", "value"])),
        );
        Ok(fields)
    }

    async fn create(&self, fields: &Fields) -> Result<Value> {
        let get = |name: &str| fields.get(name).map(String::as_str).unwrap_or_default();

        let site_id = self.site_id(get("site")).await?;
        let type_id = self.device_type_id(get("model")).await?;
        let role_id = self.device_role_id().await?;

        let payload = json!({
            "name": get("hostname"),
            "serial": get("sn"),
            "site": site_id,
            "device_type": type_id,
            "role": role_id,
            "status": self.maps.imap("status", get("status")),
        });

        let resp = self
            .source
            .client
            .post(self.source.url("/api/dcim/devices/"))
            .json(&payload)
            .send()
            .await?;
        response_json(resp).await
    }

    async fn update(&self, rec: Value, changes: &Fields) -> Result<Value> {
        let id = Self::record_id(&rec)?;
        let payload = self.patch_payload(changes).await?;
        if payload.is_empty() {
            debug!(id, "netbox: no patchable fields in change set");
            return Ok(json!({ "id": id, "unchanged": true }));
        }

        let resp = self
            .source
            .client
            .patch(self.source.url(&format!("/api/dcim/devices/{id}/")))
            .json(&Value::Object(payload))
            .send()
            .await?;
        response_json(resp).await
    }

    async fn delete(&self, rec: Value) -> Result<Value> {
        let id = Self::record_id(&rec)?;
        let resp = self
            .source
            .client
            .delete(self.source.url(&format!("/api/dcim/devices/{id}/")))
            .send()
            .await?;
        check_status(resp).await?;
        Ok(json!({ "id": id, "deleted": true }))
    }
}

fn text(rec: &Value, path: &[&str]) -> String {
    let mut cursor = rec;
    for step in path {
        cursor = &cursor[*step];
    }
    cursor.as_str().unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn adapter() -> NetboxDevices {
        let config = SourceConfig {
            url: "https://nb.example.com".to_string(),
            credentials: crate::config::Credentials::Token {
                token: "t0ken".to_string(),
            },
            options: Default::default(),
        };
        let source = Arc::new(NetboxSource::new(&config).unwrap());

        let mut tables = HashMap::new();
        let mut status = BTreeMap::new();
        status.insert("offline".to_string(), "decommissioned".to_string());
        tables.insert("status".to_string(), status);

        NetboxDevices::new(
            source,
            FieldMaps::new(tables),
            HostnameNormalizer::new(&["corp.example.com".to_string()]).unwrap(),
            &config,
        )
    }

    fn device_record() -> Value {
        json!({
            "id": 42,
            "name": "CORE-SW1.corp.example.com",
            "serial": "FDO1234",
            "primary_ip4": { "address": "10.0.0.1/24" },
            "site": { "slug": "dc1" },
            "device_type": {
                "model": "C9300-48P",
                "manufacturer": { "name": "Cisco" }
            },
            "platform": { "slug": "ios-xe" },
            "status": { "value": "offline" }
        })
    }

    #[test]
    fn itemize_flattens_nested_fields() {
        let fields = adapter().itemize(&device_record()).unwrap();

        assert_eq!(fields["sn"], "FDO1234");
        assert_eq!(fields["hostname"], "core-sw1");
        assert_eq!(fields["ipaddr"], "10.0.0.1");
        assert_eq!(fields["site"], "dc1");
        assert_eq!(fields["vendor"], "cisco");
        assert_eq!(fields["model"], "C9300-48P");
        assert_eq!(fields["os_name"], "ios-xe");
        // provider status mapped to the canonical vocabulary
        assert_eq!(fields["status"], "decommissioned");
    }

    #[test]
    fn itemize_tolerates_absent_optionals() {
        let fields = adapter()
            .itemize(&json!({"id": 7, "name": "x", "serial": "SN1"}))
            .unwrap();
        assert_eq!(fields["ipaddr"], "");
        assert_eq!(fields["site"], "");
    }

    #[tokio::test]
    async fn patch_payload_translates_field_names_and_values() {
        let adapter = adapter();

        let mut changes = Fields::new();
        changes.insert("hostname".into(), "core-sw9".into());
        changes.insert("sn".into(), "FDO9999".into());
        changes.insert("status".into(), "decommissioned".into());
        changes.insert("ipaddr".into(), "10.0.0.9".into());

        let payload = adapter.patch_payload(&changes).await.unwrap();
        assert_eq!(payload["name"], json!("core-sw9"));
        assert_eq!(payload["serial"], json!("FDO9999"));
        // canonical status inverted back to the provider value
        assert_eq!(payload["status"], json!("offline"));
        // primary IP is not patchable through the device record
        assert!(!payload.contains_key("ipaddr"));
    }

    #[test]
    fn item_filter_selects_by_serial() {
        let mut fields = Fields::new();
        fields.insert("sn".into(), "FDO1234".into());
        assert_eq!(
            adapter().item_filter(&fields),
            Some("serial=FDO1234".to_string())
        );
    }
}
