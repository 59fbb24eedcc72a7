use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::collection::{FieldMaps, KeyedCollection};
use crate::common::{AuditError, Result};
use crate::config::Config;
use crate::diff::FieldNormalizer;
use crate::filters::DiffFilter;
use crate::normalize::HostnameNormalizer;
use crate::reconcile::{DefaultReconcile, ReconcilePolicy};
use crate::sources::ipfabric::{IpFabricDevices, IpFabricSource};
use crate::sources::netbox::{NetboxDevices, NetboxSource};

/// (policy name, origin source, target source, collection)
pub type PolicyKey = (String, String, String, String);

type CollectionFactory = fn(&Config) -> Result<KeyedCollection>;
type FilterFactory = fn(&Config) -> Result<DiffFilter>;
type ReconcilerFactory = fn() -> Box<dyn ReconcilePolicy>;

/// Process-wide registry of everything selectable by name: collection
/// constructors per (source, collection) pair, and filter/reconciler
/// policies per (name, origin, target, collection).
///
/// Populated explicitly at startup by [`Registry::with_builtin`]; lookups of
/// unknown names fail deterministically before any network I/O happens.
#[derive(Default)]
pub struct Registry {
    source_names: HashSet<String>,
    collections: HashMap<(String, String), CollectionFactory>,
    filters: HashMap<PolicyKey, FilterFactory>,
    reconcilers: HashMap<PolicyKey, ReconcilerFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry with every built-in provider and policy installed.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();

        registry.register_collection("ipfabric", "devices", ipfabric_devices);
        registry.register_collection("netbox", "devices", netbox_devices);

        registry.register_filter(
            ("default", "ipfabric", "netbox", "devices"),
            default_devices_filter,
        );
        registry.register_reconciler(("default", "ipfabric", "netbox", "devices"), || {
            Box::new(DefaultReconcile)
        });

        registry
    }

    pub fn register_collection(
        &mut self,
        source: &str,
        collection: &str,
        factory: CollectionFactory,
    ) {
        self.source_names.insert(source.to_string());
        self.collections
            .insert((source.to_string(), collection.to_string()), factory);
    }

    pub fn register_filter(
        &mut self,
        key: (&str, &str, &str, &str),
        factory: FilterFactory,
    ) {
        self.filters.insert(owned_key(key), factory);
    }

    pub fn register_reconciler(
        &mut self,
        key: (&str, &str, &str, &str),
        factory: ReconcilerFactory,
    ) {
        self.reconcilers.insert(owned_key(key), factory);
    }

    pub fn get_collection(
        &self,
        config: &Config,
        source: &str,
        collection: &str,
    ) -> Result<KeyedCollection> {
        if !self.source_names.contains(source) {
            return Err(AuditError::not_found("source", source));
        }
        let factory = self
            .collections
            .get(&(source.to_string(), collection.to_string()))
            .ok_or_else(|| {
                AuditError::not_found("collection", format!("{source}/{collection}"))
            })?;
        factory(config)
    }

    /// Filter policy for the pairing. Only the name `default` falls back to
    /// the accept-all filter when nothing is registered; any other unknown
    /// name is an error.
    pub fn get_filter(
        &self,
        config: &Config,
        name: &str,
        origin: &str,
        target: &str,
        collection: &str,
    ) -> Result<DiffFilter> {
        match self.filters.get(&owned_key((name, origin, target, collection))) {
            Some(factory) => factory(config),
            None if name == "default" => Ok(DiffFilter::default()),
            None => Err(AuditError::not_found(
                "filter",
                format!("{name} for {origin}->{target}/{collection}"),
            )),
        }
    }

    /// Reconcile policy for the pairing, with the same `default` fallback
    /// rule as [`Registry::get_filter`].
    pub fn get_reconciler(
        &self,
        name: &str,
        origin: &str,
        target: &str,
        collection: &str,
    ) -> Result<Box<dyn ReconcilePolicy>> {
        match self
            .reconcilers
            .get(&owned_key((name, origin, target, collection)))
        {
            Some(factory) => Ok(factory()),
            None if name == "default" => Ok(Box::new(DefaultReconcile)),
            None => Err(AuditError::not_found(
                "reconciler",
                format!("{name} for {origin}->{target}/{collection}"),
            )),
        }
    }
}

fn owned_key(key: (&str, &str, &str, &str)) -> PolicyKey {
    (
        key.0.to_string(),
        key.1.to_string(),
        key.2.to_string(),
        key.3.to_string(),
    )
}

fn ipfabric_devices(config: &Config) -> Result<KeyedCollection> {
    let source_config = config.source("ipfabric")?;
    let source = Arc::new(IpFabricSource::new(source_config)?);
    let hostname = HostnameNormalizer::new(&config.domain_names)?;
    let adapter = Arc::new(IpFabricDevices::new(Arc::clone(&source), hostname));
    Ok(KeyedCollection::new(adapter, source))
}

fn netbox_devices(config: &Config) -> Result<KeyedCollection> {
    let source_config = config.source("netbox")?;
    let source = Arc::new(NetboxSource::new(source_config)?);
    let maps = FieldMaps::new(config.maps("devices", "netbox"));
    let hostname = HostnameNormalizer::new(&config.domain_names)?;
    let adapter = Arc::new(NetboxDevices::new(
        Arc::clone(&source),
        maps,
        hostname,
        source_config,
    ));
    Ok(KeyedCollection::new(adapter, source))
}

/// Built-in devices policy: drop items without a serial (they cannot be
/// matched across sources) and compare hostnames case-insensitively.
fn default_devices_filter(_config: &Config) -> Result<DiffFilter> {
    let has_serial = |item: &crate::collection::Fields| {
        item.get("sn").map(|sn| !sn.is_empty()).unwrap_or(false)
    };

    let mut fields_cmp = crate::diff::FieldCmp::new();
    let fold: FieldNormalizer = Arc::new(|value: &str| value.to_lowercase());
    fields_cmp.insert("hostname".to_string(), fold);

    Ok(DiffFilter {
        origin_key: Some(Arc::new(has_serial)),
        target_key: Some(Arc::new(has_serial)),
        fields_cmp,
        ..Default::default()
    })
}
