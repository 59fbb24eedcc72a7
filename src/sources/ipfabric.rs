use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::collection::{Fields, InventoryAdapter};
use crate::common::{AuditError, Result};
use crate::config::SourceConfig;
use crate::normalize::HostnameNormalizer;
use crate::sources::{response_json, Source};

pub const NAME: &str = "ipfabric";

/// Raw table columns requested from the inventory endpoint.
const COLUMNS: &[&str] = &[
    "sn", "hostname", "loginIp", "siteName", "vendor", "model", "family",
];

/// IP Fabric instance. Token-authenticated; the token rides every request as
/// an `X-API-Token` header, so login only verifies reachability.
pub struct IpFabricSource {
    client: reqwest::Client,
    base_url: String,
    snapshot: String,
    connected: AtomicBool,
}

impl IpFabricSource {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let token = config
            .credentials
            .token()
            .ok_or_else(|| AuditError::api("ipfabric: token credentials required"))?;

        let mut headers = HeaderMap::new();
        let mut token_value = HeaderValue::from_str(token)
            .map_err(|err| AuditError::api(format!("ipfabric: bad token: {err}")))?;
        token_value.set_sensitive(true);
        headers.insert("X-API-Token", token_value);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        let snapshot = config
            .options
            .get("snapshot")
            .cloned()
            .unwrap_or_else(|| "$last".to_string());

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            snapshot,
            connected: AtomicBool::new(false),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl Source for IpFabricSource {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn login(&self) -> Result<()> {
        let resp = self
            .client
            .get(self.url("/api/v1/os/version"))
            .send()
            .await?;
        let body = response_json(resp).await?;
        info!(
            version = body["version"].as_str().unwrap_or("unknown"),
            "ipfabric session verified"
        );
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        // token sessions hold no server-side state
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Device inventory as IP Fabric reports it. Read-only: this side is the
/// system of truth, so the mutation defaults stay unimplemented.
pub struct IpFabricDevices {
    source: Arc<IpFabricSource>,
    hostname: HostnameNormalizer,
}

impl IpFabricDevices {
    pub fn new(source: Arc<IpFabricSource>, hostname: HostnameNormalizer) -> Self {
        Self { source, hostname }
    }
}

#[async_trait]
impl InventoryAdapter for IpFabricDevices {
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

    /// `filters` is an IP Fabric table-filter JSON expression, e.g.
    /// `{"siteName": ["eq", "dc1"]}`.
    async fn fetch(&self, filters: Option<&str>) -> Result<Vec<Value>> {
        let filters: Value = match filters {
            Some(expr) => serde_json::from_str(expr)
                .map_err(|err| AuditError::api(format!("ipfabric: bad filter {expr:?}: {err}")))?,
            None => json!({}),
        };

        let body = json!({
            "columns": COLUMNS,
            "filters": filters,
            "snapshot": self.source.snapshot,
        });

        debug!(snapshot = %self.source.snapshot, "fetching ipfabric device table");
        let resp = self
            .source
            .client
            .post(self.source.url("/api/v1/tables/inventory/devices"))
            .json(&body)
            .send()
            .await?;
        let body = response_json(resp).await?;

        let data = body["data"]
            .as_array()
            .ok_or_else(|| AuditError::api("ipfabric: device table response missing data"))?;
        Ok(data.clone())
    }

    fn item_filter(&self, fields: &Fields) -> Option<String> {
        fields
            .get("sn")
            .map(|sn| json!({ "sn": ["eq", sn] }).to_string())
    }

    fn itemize(&self, rec: &Value) -> Result<Fields> {
        let sn = rec["sn"]
            .as_str()
            .filter(|sn| !sn.is_empty())
            .ok_or_else(|| AuditError::MissingField("sn".into()))?;

        let mut fields = Fields::new();
        fields.insert("sn".into(), sn.to_string());
        fields.insert(
            "hostname".into(),
            self.hostname
                .normalize(rec["hostname"].as_str().unwrap_or_default()),
        );
        fields.insert("ipaddr".into(), text(rec, "loginIp"));
        fields.insert("site".into(), text(rec, "siteName").to_lowercase());
        fields.insert("vendor".into(), text(rec, "vendor").to_lowercase());
        fields.insert("model".into(), text(rec, "model"));
        fields.insert("os_name".into(), text(rec, "family").to_lowercase());
        // the assurance platform only reports devices it can reach
        fields.insert("status".into(), "active".into());
        Ok(fields)
    }
}

fn text(rec: &Value, key: &str) -> String {
    rec[key].as_str().unwrap_or_default().to_string()
}
