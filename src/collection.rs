use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::Value;
use tracing::info;

use crate::common::{AuditError, Result};
use crate::gather::Gather;
use crate::sources::Source;

/// Normalized record derived from one raw provider record: field name → value.
/// Ordered so keyed output and reports are deterministic.
pub type Fields = BTreeMap<String, String>;

/// Values of the active key fields, in key-field order. Unique within one
/// keyed collection.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(Vec<String>);

impl Key {
    pub fn new(values: Vec<String>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

impl From<Vec<String>> for Key {
    fn from(values: Vec<String>) -> Self {
        Self(values)
    }
}

impl From<&[&str]> for Key {
    fn from(values: &[&str]) -> Self {
        Self(values.iter().map(|v| v.to_string()).collect())
    }
}

/// Invoked once per attempted item during a bulk mutation, with the provider
/// response or the per-item error.
pub type ItemCallback<'a> = &'a mut (dyn FnMut(&Key, &Fields, &Result<Value>) + Send);

/// Bidirectional field-value vocabulary translation with identity fallback.
///
/// The configured table maps provider values to canonical values; the inverse
/// direction is derived from it. Lookups are cached per `(field, value)` pair;
/// the table itself never changes after construction.
pub struct FieldMaps {
    forward: HashMap<String, BTreeMap<String, String>>,
    inverse: HashMap<String, BTreeMap<String, String>>,
    cache: Mutex<HashMap<(String, String), String>>,
    icache: Mutex<HashMap<(String, String), String>>,
}

impl FieldMaps {
    pub fn new(tables: HashMap<String, BTreeMap<String, String>>) -> Self {
        let inverse = tables
            .iter()
            .map(|(field, table)| {
                let inv = table.iter().map(|(k, v)| (v.clone(), k.clone())).collect();
                (field.clone(), inv)
            })
            .collect();
        Self {
            forward: tables,
            inverse,
            cache: Mutex::new(HashMap::new()),
            icache: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Provider value → canonical value, or the original when unmapped.
    pub fn map(&self, field: &str, value: &str) -> String {
        Self::lookup(&self.cache, &self.forward, field, value)
    }

    /// Canonical value → provider value, or the original when unmapped.
    pub fn imap(&self, field: &str, value: &str) -> String {
        Self::lookup(&self.icache, &self.inverse, field, value)
    }

    fn lookup(
        cache: &Mutex<HashMap<(String, String), String>>,
        tables: &HashMap<String, BTreeMap<String, String>>,
        field: &str,
        value: &str,
    ) -> String {
        let cache_key = (field.to_string(), value.to_string());
        let mut cached = cache.lock().expect("field map cache poisoned");
        if let Some(hit) = cached.get(&cache_key) {
            return hit.clone();
        }
        let mapped = tables
            .get(field)
            .and_then(|table| table.get(value))
            .cloned()
            .unwrap_or_else(|| value.to_string());
        cached.insert(cache_key, mapped.clone());
        mapped
    }
}

impl Default for FieldMaps {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

static NO_MAPS: Lazy<FieldMaps> = Lazy::new(FieldMaps::default);

/// Provider-specific half of a collection: how to fetch raw records from one
/// source, translate them into normalized field-sets, and issue per-item
/// mutations. The generic bookkeeping lives in [`KeyedCollection`].
#[async_trait]
pub trait InventoryAdapter: Send + Sync {
    /// Collection name, e.g. `devices`.
    fn collection_name(&self) -> &'static str;

    /// Source name, e.g. `netbox`.
    fn source_name(&self) -> &'static str;

    /// Full normalized field vocabulary this adapter produces.
    fn fields(&self) -> &'static [&'static str];

    /// Default key-field order.
    fn key_fields(&self) -> &'static [&'static str];

    /// Fetch raw records. `filters` is a provider-specific query expression.
    async fn fetch(&self, filters: Option<&str>) -> Result<Vec<Value>>;

    /// Translate one raw record into its normalized field-set. Must be
    /// deterministic; failure here is a data-integrity fault.
    fn itemize(&self, rec: &Value) -> Result<Fields>;

    /// Provider fetch filter selecting exactly the record behind `fields`,
    /// used by bulk fetch-by-reference. `None` means the item cannot be
    /// fetched individually and is skipped.
    fn item_filter(&self, _fields: &Fields) -> Option<String> {
        None
    }

    fn maps(&self) -> &FieldMaps {
        &NO_MAPS
    }

    async fn create(&self, _fields: &Fields) -> Result<Value> {
        Err(unsupported(self, "create"))
    }

    async fn update(&self, _rec: Value, _changes: &Fields) -> Result<Value> {
        Err(unsupported(self, "update"))
    }

    async fn delete(&self, _rec: Value) -> Result<Value> {
        Err(unsupported(self, "delete"))
    }
}

fn unsupported<A: InventoryAdapter + ?Sized>(adapter: &A, op: &str) -> AuditError {
    AuditError::api(format!(
        "{}/{}: {op} not supported by this source",
        adapter.source_name(),
        adapter.collection_name()
    ))
}

/// Raw provider records plus their keyed, normalized view.
///
/// Populated by [`fetch`](KeyedCollection::fetch) (network) and
/// [`make_keys`](KeyedCollection::make_keys) (pure); may be re-keyed any number
/// of times with different filters without re-fetching.
pub struct KeyedCollection {
    adapter: Arc<dyn InventoryAdapter>,
    source: Arc<dyn Source>,

    /// Normalized fields this collection works with. Seeded from the adapter,
    /// replaceable by the caller before diffing.
    pub fields: Vec<String>,

    /// Active key-field order. Seeded from the adapter; a `make_keys` call
    /// that supplies key fields makes them the new default.
    pub key_fields: Vec<String>,

    /// Raw records as returned by the source, in fetch order.
    pub source_records: Vec<Value>,

    /// Key → normalized field-set.
    pub items: BTreeMap<Key, Fields>,

    /// Key → raw record, for recovering provider identifiers when mutating.
    pub source_record_keys: BTreeMap<Key, Value>,
}

impl std::fmt::Debug for KeyedCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedCollection")
            .field("source", &self.adapter.source_name())
            .field("collection", &self.adapter.collection_name())
            .field("fields", &self.fields)
            .field("key_fields", &self.key_fields)
            .field("source_records", &self.source_records.len())
            .field("items", &self.items.len())
            .field("source_record_keys", &self.source_record_keys.len())
            .finish()
    }
}

impl KeyedCollection {
    pub fn new(adapter: Arc<dyn InventoryAdapter>, source: Arc<dyn Source>) -> Self {
        let fields = adapter.fields().iter().map(|f| f.to_string()).collect();
        let key_fields = adapter.key_fields().iter().map(|f| f.to_string()).collect();
        Self {
            adapter,
            source,
            fields,
            key_fields,
            source_records: Vec::new(),
            items: BTreeMap::new(),
            source_record_keys: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.adapter.collection_name()
    }

    pub fn source_name(&self) -> &'static str {
        self.adapter.source_name()
    }

    pub fn source(&self) -> &Arc<dyn Source> {
        &self.source
    }

    pub fn record_count(&self) -> usize {
        self.source_records.len()
    }

    pub fn map_field_value(&self, field: &str, value: &str) -> String {
        self.adapter.maps().map(field, value)
    }

    pub fn imap_field_value(&self, field: &str, value: &str) -> String {
        self.adapter.maps().imap(field, value)
    }

    /// Fetch raw records from the source, appending to `source_records`.
    pub async fn fetch(&mut self, filters: Option<&str>) -> Result<()> {
        let records = self.adapter.fetch(filters).await?;
        self.source_records.extend(records);
        Ok(())
    }

    /// Bulk fetch by reference items: one bounded fetch per item's derived
    /// filter. Used to pull a selection of records from this source matching
    /// items keyed out of another. Items the adapter cannot filter on are
    /// skipped.
    pub async fn fetch_items(
        &mut self,
        items: &BTreeMap<Key, Fields>,
        limit: Option<usize>,
    ) -> Result<()> {
        let mut pool = Gather::new(limit);
        for (key, fields) in items {
            let Some(filter) = self.adapter.item_filter(fields) else {
                continue;
            };
            let adapter = Arc::clone(&self.adapter);
            pool.spawn(key.clone(), async move {
                adapter.fetch(Some(&filter)).await
            });
        }

        while let Some((key, result)) = pool.next().await {
            match result {
                Ok(records) => self.source_records.extend(records),
                Err(err) => {
                    info!(key = %key, "fetch_items aborting, cancelling outstanding fetches");
                    pool.shutdown().await;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Rebuild `items` and `source_record_keys` from `source_records`.
    ///
    /// Records whose field-set fails `filter` are excluded. `translate` maps
    /// each derived key before insertion. When two records produce the same
    /// key the later record wins; that overwrite is the defined behavior, not
    /// an accident. Supplying `key_fields` replaces the collection default for
    /// this and subsequent calls. An empty `source_records` is a logged no-op.
    pub fn make_keys(
        &mut self,
        key_fields: Option<&[String]>,
        filter: Option<&dyn Fn(&Fields) -> bool>,
        translate: Option<&dyn Fn(Key) -> Key>,
    ) -> Result<()> {
        if self.source_records.is_empty() {
            info!(
                collection = self.adapter.collection_name(),
                source = self.adapter.source_name(),
                "inventory empty, nothing to key"
            );
            return Ok(());
        }

        if let Some(kf) = key_fields {
            self.key_fields = kf.to_vec();
        }

        self.items.clear();
        self.source_record_keys.clear();

        for rec in &self.source_records {
            let item = match self.adapter.itemize(rec) {
                Ok(item) => item,
                Err(err) => {
                    return Err(AuditError::Itemize {
                        collection: self.adapter.collection_name().to_string(),
                        record: rec.to_string(),
                        source: Box::new(err),
                    })
                }
            };

            if let Some(filter) = filter {
                if !filter(&item) {
                    continue;
                }
            }

            let mut values = Vec::with_capacity(self.key_fields.len());
            for field in &self.key_fields {
                match item.get(field) {
                    Some(value) => values.push(value.clone()),
                    None => {
                        return Err(AuditError::Itemize {
                            collection: self.adapter.collection_name().to_string(),
                            record: rec.to_string(),
                            source: Box::new(AuditError::MissingField(field.clone())),
                        })
                    }
                }
            }

            let mut key = Key::new(values);
            if let Some(translate) = translate {
                key = translate(key);
            }

            self.items.insert(key.clone(), item);
            self.source_record_keys.insert(key, rec.clone());
        }

        Ok(())
    }

    /// Create every item in `items` against the source, bounded-concurrently.
    /// `callback` fires once per item with the provider response or the item's
    /// error; a failed item never aborts the rest of the batch.
    pub async fn add_items(
        &self,
        items: &BTreeMap<Key, Fields>,
        limit: Option<usize>,
        callback: ItemCallback<'_>,
    ) -> Result<()> {
        let mut pool = Gather::new(limit);
        for (key, fields) in items {
            let adapter = Arc::clone(&self.adapter);
            let fields = fields.clone();
            pool.spawn(key.clone(), async move { adapter.create(&fields).await });
        }
        self.drain(pool, items, callback).await
    }

    /// Apply per-key field changes to existing records. Every key must have
    /// been seen by `make_keys` on this collection; the raw record supplies
    /// the provider identifier for the update call.
    pub async fn update_items(
        &self,
        changes: &BTreeMap<Key, Fields>,
        limit: Option<usize>,
        callback: ItemCallback<'_>,
    ) -> Result<()> {
        let mut resolved = Vec::with_capacity(changes.len());
        for (key, fields) in changes {
            resolved.push((key.clone(), self.record_for(key)?, fields.clone()));
        }

        let mut pool = Gather::new(limit);
        for (key, rec, fields) in resolved {
            let adapter = Arc::clone(&self.adapter);
            pool.spawn(key, async move { adapter.update(rec, &fields).await });
        }
        self.drain(pool, changes, callback).await
    }

    /// Delete the records behind `items` from the source.
    pub async fn delete_items(
        &self,
        items: &BTreeMap<Key, Fields>,
        limit: Option<usize>,
        callback: ItemCallback<'_>,
    ) -> Result<()> {
        let mut resolved = Vec::with_capacity(items.len());
        for key in items.keys() {
            resolved.push((key.clone(), self.record_for(key)?));
        }

        let mut pool = Gather::new(limit);
        for (key, rec) in resolved {
            let adapter = Arc::clone(&self.adapter);
            pool.spawn(key, async move { adapter.delete(rec).await });
        }
        self.drain(pool, items, callback).await
    }

    fn record_for(&self, key: &Key) -> Result<Value> {
        self.source_record_keys.get(key).cloned().ok_or_else(|| {
            AuditError::api(format!(
                "{}/{}: no source record for key {key}",
                self.adapter.source_name(),
                self.adapter.collection_name()
            ))
        })
    }

    async fn drain(
        &self,
        mut pool: Gather<Key, Result<Value>>,
        items: &BTreeMap<Key, Fields>,
        callback: ItemCallback<'_>,
    ) -> Result<()> {
        while let Some((key, result)) = pool.next().await {
            let fields = items.get(&key).cloned().unwrap_or_default();
            callback(&key, &fields, &result);
        }
        Ok(())
    }
}
