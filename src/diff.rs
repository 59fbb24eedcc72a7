use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::collection::{Fields, Key, KeyedCollection};

/// Normalization applied to both sides of a field comparison (case-folding,
/// domain stripping, ...). Fields without an entry compare by identity.
pub type FieldNormalizer = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Field name → normalizer. The comparison policy of a diff.
pub type FieldCmp = HashMap<String, FieldNormalizer>;

/// Three-way partition of two keyed collections.
///
/// `missing` are origin keys absent from target, with origin field-sets;
/// `extras` are target keys absent from origin, with target field-sets;
/// `changes` are shared keys whose compared fields differ, holding only the
/// changed fields with origin's values. Both collections are carried so a
/// reconciler can recover provider record identifiers from the target side.
pub struct DiffResults {
    pub origin: KeyedCollection,
    pub target: KeyedCollection,
    pub count: usize,
    pub missing: BTreeMap<Key, Fields>,
    pub extras: BTreeMap<Key, Fields>,
    pub changes: BTreeMap<Key, Fields>,
}

impl DiffResults {
    /// `true` when the two collections already agree.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Compare two fetched-and-keyed collections.
///
/// `fields` selects which fields participate; unset, origin's resolved field
/// list is used. Comparison is field-scoped: a key only lands in `changes`
/// when a compared field differs after normalization, and only those fields
/// are carried, with origin's value winning.
pub fn diff(
    origin: KeyedCollection,
    target: KeyedCollection,
    fields: Option<&[String]>,
    fields_cmp: &FieldCmp,
) -> DiffResults {
    let missing: BTreeMap<Key, Fields> = origin
        .items
        .iter()
        .filter(|(key, _)| !target.items.contains_key(key))
        .map(|(key, item)| (key.clone(), item.clone()))
        .collect();

    let extras: BTreeMap<Key, Fields> = target
        .items
        .iter()
        .filter(|(key, _)| !origin.items.contains_key(key))
        .map(|(key, item)| (key.clone(), item.clone()))
        .collect();

    let compare_fields: Vec<String> = match fields {
        Some(fields) => fields.to_vec(),
        None => origin.fields.clone(),
    };

    let mut changes: BTreeMap<Key, Fields> = BTreeMap::new();

    for (key, origin_item) in &origin.items {
        let Some(target_item) = target.items.get(key) else {
            continue;
        };

        let mut item_changes = Fields::new();
        for field in &compare_fields {
            let origin_value = origin_item.get(field).map(String::as_str).unwrap_or("");
            let target_value = target_item.get(field).map(String::as_str).unwrap_or("");

            let differs = match fields_cmp.get(field) {
                Some(normalize) => normalize(origin_value) != normalize(target_value),
                None => origin_value != target_value,
            };
            if differs {
                item_changes.insert(field.clone(), origin_value.to_string());
            }
        }

        if !item_changes.is_empty() {
            changes.insert(key.clone(), item_changes);
        }
    }

    let count = missing.len() + extras.len() + changes.len();

    DiffResults {
        origin,
        target,
        count,
        missing,
        extras,
        changes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::InventoryAdapter;
    use crate::common::Result;
    use crate::sources::Source;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Arc;

    struct StaticAdapter {
        source: &'static str,
        fields: &'static [&'static str],
    }

    #[async_trait]
    impl InventoryAdapter for StaticAdapter {
        fn collection_name(&self) -> &'static str {
            "devices"
        }
        fn source_name(&self) -> &'static str {
            self.source
        }
        fn fields(&self) -> &'static [&'static str] {
            self.fields
        }
        fn key_fields(&self) -> &'static [&'static str] {
            &["name"]
        }
        async fn fetch(&self, _filters: Option<&str>) -> Result<Vec<Value>> {
            Ok(vec![])
        }
        fn itemize(&self, rec: &Value) -> Result<Fields> {
            let map = rec.as_object().expect("test records are objects");
            Ok(map
                .iter()
                .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                .collect())
        }
    }

    struct NullSource;

    #[async_trait]
    impl Source for NullSource {
        fn name(&self) -> &'static str {
            "null"
        }
        async fn login(&self) -> Result<()> {
            Ok(())
        }
        async fn logout(&self) -> Result<()> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
    }

    fn keyed(source: &'static str, records: Vec<Value>) -> KeyedCollection {
        keyed_with_fields(source, &["name", "ip"], records)
    }

    fn keyed_with_fields(
        source: &'static str,
        fields: &'static [&'static str],
        records: Vec<Value>,
    ) -> KeyedCollection {
        let mut col = KeyedCollection::new(
            Arc::new(StaticAdapter { source, fields }),
            Arc::new(NullSource),
        );
        col.source_records = records;
        col.make_keys(None, None, None).expect("keying test records");
        col
    }

    #[test]
    fn disjoint_collections_are_all_missing_and_extras() {
        let origin = keyed("o", vec![json!({"name": "a", "ip": "1.1.1.1"})]);
        let target = keyed("t", vec![json!({"name": "z", "ip": "9.9.9.9"})]);
        let origin_items = origin.items.clone();
        let target_items = target.items.clone();

        let res = diff(origin, target, None, &FieldCmp::new());

        assert_eq!(res.missing, origin_items);
        assert_eq!(res.extras, target_items);
        assert!(res.changes.is_empty());
        assert_eq!(res.count, 2);
    }

    #[test]
    fn identical_collections_diff_to_zero() {
        let records = vec![
            json!({"name": "a", "ip": "1.1.1.1"}),
            json!({"name": "b", "ip": "2.2.2.2"}),
        ];
        let res = diff(
            keyed("o", records.clone()),
            keyed("t", records),
            None,
            &FieldCmp::new(),
        );
        assert_eq!(res.count, 0);
        assert!(res.is_empty());
    }

    #[test]
    fn changes_are_field_scoped_and_origin_wins() {
        let origin = keyed(
            "o",
            vec![
                json!({"name": "a", "ip": "1.1.1.1"}),
                json!({"name": "b", "ip": "2.2.2.2"}),
            ],
        );
        let target = keyed(
            "t",
            vec![
                json!({"name": "b", "ip": "9.9.9.9"}),
                json!({"name": "c", "ip": "3.3.3.3"}),
            ],
        );

        let res = diff(origin, target, None, &FieldCmp::new());

        let a = Key::from(["a"].as_slice());
        let b = Key::from(["b"].as_slice());
        let c = Key::from(["c"].as_slice());

        assert_eq!(res.missing.len(), 1);
        assert_eq!(res.missing[&a]["ip"], "1.1.1.1");
        assert_eq!(res.extras.len(), 1);
        assert_eq!(res.extras[&c]["ip"], "3.3.3.3");
        assert_eq!(res.changes.len(), 1);
        // only the changed field, carrying origin's value
        assert_eq!(res.changes[&b].len(), 1);
        assert_eq!(res.changes[&b]["ip"], "2.2.2.2");
        assert_eq!(res.count, 3);
    }

    #[test]
    fn uncompared_fields_never_produce_changes() {
        let origin = keyed("o", vec![json!({"name": "a", "ip": "1.1.1.1"})]);
        let target = keyed("t", vec![json!({"name": "a", "ip": "8.8.8.8"})]);

        let only_name = vec!["name".to_string()];
        let res = diff(origin, target, Some(&only_name), &FieldCmp::new());
        assert_eq!(res.count, 0);
    }

    #[test]
    fn normalizers_apply_to_both_sides() {
        let origin = keyed("o", vec![json!({"name": "a", "ip": "CORE-A"})]);
        let target = keyed("t", vec![json!({"name": "a", "ip": "core-a"})]);

        let mut cmp = FieldCmp::new();
        cmp.insert("ip".to_string(), Arc::new(|v: &str| v.to_lowercase()));

        let res = diff(origin, target, None, &cmp);
        assert_eq!(res.count, 0);
    }

    #[test]
    fn missing_field_on_one_side_compares_as_empty() {
        let origin = keyed_with_fields(
            "o",
            &["name", "ip", "site"],
            vec![json!({"name": "a", "ip": "1.1.1.1", "site": "dc1"})],
        );
        let target = keyed_with_fields(
            "t",
            &["name", "ip"],
            vec![json!({"name": "a", "ip": "1.1.1.1"})],
        );

        let res = diff(origin, target, None, &FieldCmp::new());
        let a = Key::from(["a"].as_slice());
        assert_eq!(res.changes[&a]["site"], "dc1");
        assert_eq!(res.count, 1);
    }
}
