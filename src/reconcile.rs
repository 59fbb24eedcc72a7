use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::collection::{Fields, Key};
use crate::common::Result;
use crate::diff::DiffResults;

/// Which diff buckets a sync run is allowed to apply.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Actions {
    pub add: bool,
    pub del: bool,
    pub upd: bool,
}

impl Actions {
    pub fn all() -> Self {
        Self {
            add: true,
            del: true,
            upd: true,
        }
    }

    pub fn is_none(&self) -> bool {
        !(self.add || self.del || self.upd)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOp {
    Add,
    Delete,
    Update,
}

impl std::fmt::Display for ApplyOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplyOp::Add => write!(f, "add"),
            ApplyOp::Delete => write!(f, "delete"),
            ApplyOp::Update => write!(f, "update"),
        }
    }
}

#[derive(Debug)]
pub struct ApplyFailure {
    pub op: ApplyOp,
    pub key: Key,
    pub error: String,
}

/// Aggregate outcome of a reconcile run. Item failures land here instead of
/// aborting the run.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub attempted: usize,
    pub applied: usize,
    pub failures: Vec<ApplyFailure>,
}

impl ApplyReport {
    pub fn record(&mut self, op: ApplyOp, key: &Key, result: &Result<Value>) {
        self.attempted += 1;
        match result {
            Ok(_) => {
                self.applied += 1;
                info!(%op, key = %key, "applied");
            }
            Err(err) => {
                warn!(%op, key = %key, error = %err, "apply failed");
                self.failures.push(ApplyFailure {
                    op,
                    key: key.clone(),
                    error: err.to_string(),
                });
            }
        }
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// How one origin/target/collection pairing applies a diff to the target.
///
/// The default methods drive the target collection's bulk operations, which is
/// correct whenever the target adapter can create, update, and delete directly
/// from normalized field-sets. Registered policies override a phase when a
/// pairing needs more (extra lookups, follow-up writes, guard conditions).
#[async_trait]
pub trait ReconcilePolicy: Send + Sync {
    async fn add_items(
        &self,
        diff: &DiffResults,
        limit: Option<usize>,
        report: &mut ApplyReport,
    ) -> Result<()> {
        let mut on_item = |key: &Key, _fields: &Fields, result: &Result<Value>| {
            report.record(ApplyOp::Add, key, result);
        };
        diff.target.add_items(&diff.missing, limit, &mut on_item).await
    }

    async fn delete_items(
        &self,
        diff: &DiffResults,
        limit: Option<usize>,
        report: &mut ApplyReport,
    ) -> Result<()> {
        let mut on_item = |key: &Key, _fields: &Fields, result: &Result<Value>| {
            report.record(ApplyOp::Delete, key, result);
        };
        diff.target.delete_items(&diff.extras, limit, &mut on_item).await
    }

    async fn update_items(
        &self,
        diff: &DiffResults,
        limit: Option<usize>,
        report: &mut ApplyReport,
    ) -> Result<()> {
        let mut on_item = |key: &Key, _fields: &Fields, result: &Result<Value>| {
            report.record(ApplyOp::Update, key, result);
        };
        diff.target.update_items(&diff.changes, limit, &mut on_item).await
    }
}

/// The stock policy: every phase is the trait default.
pub struct DefaultReconcile;

impl ReconcilePolicy for DefaultReconcile {}

/// Drives the selected phases of a diff against the target, in add → delete →
/// update order. A phase whose bucket is empty, or whose action flag is off,
/// is skipped. Items within a phase run concurrently under the limit; phases
/// themselves run back to back.
pub struct Reconciler {
    policy: Box<dyn ReconcilePolicy>,
    limit: Option<usize>,
}

impl Reconciler {
    pub fn new(policy: Box<dyn ReconcilePolicy>, limit: Option<usize>) -> Self {
        Self { policy, limit }
    }

    pub async fn run(&self, diff: &DiffResults, actions: Actions) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();

        if actions.add && !diff.missing.is_empty() {
            info!(count = diff.missing.len(), "reconcile: adding missing items");
            self.policy.add_items(diff, self.limit, &mut report).await?;
        }

        if actions.del && !diff.extras.is_empty() {
            info!(count = diff.extras.len(), "reconcile: deleting extra items");
            self.policy
                .delete_items(diff, self.limit, &mut report)
                .await?;
        }

        if actions.upd && !diff.changes.is_empty() {
            info!(count = diff.changes.len(), "reconcile: updating changed items");
            self.policy
                .update_items(diff, self.limit, &mut report)
                .await?;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{InventoryAdapter, KeyedCollection};
    use crate::common::AuditError;
    use crate::diff::{diff, FieldCmp};
    use crate::sources::Source;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

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

    #[derive(Default)]
    struct CountingAdapter {
        creates: AtomicUsize,
        deletes: AtomicUsize,
        updates: AtomicUsize,
        fail_adds: bool,
    }

    #[async_trait]
    impl InventoryAdapter for CountingAdapter {
        fn collection_name(&self) -> &'static str {
            "devices"
        }
        fn source_name(&self) -> &'static str {
            "counting"
        }
        fn fields(&self) -> &'static [&'static str] {
            &["name", "ip"]
        }
        fn key_fields(&self) -> &'static [&'static str] {
            &["name"]
        }
        async fn fetch(&self, _filters: Option<&str>) -> Result<Vec<Value>> {
            Ok(vec![])
        }
        fn itemize(&self, rec: &Value) -> Result<Fields> {
            Ok(rec
                .as_object()
                .expect("test records are objects")
                .iter()
                .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                .collect())
        }
        async fn create(&self, fields: &Fields) -> Result<Value> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            if self.fail_adds && fields["name"] == "a2" {
                return Err(AuditError::api("name already taken"));
            }
            Ok(json!({"ok": true}))
        }
        async fn update(&self, _rec: Value, _changes: &Fields) -> Result<Value> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"ok": true}))
        }
        async fn delete(&self, _rec: Value) -> Result<Value> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"ok": true}))
        }
    }

    fn keyed(adapter: Arc<CountingAdapter>, records: Vec<Value>) -> KeyedCollection {
        let mut col = KeyedCollection::new(adapter, Arc::new(NullSource));
        col.source_records = records;
        col.make_keys(None, None, None).expect("keying test records");
        col
    }

    fn scenario(fail_adds: bool) -> (Arc<CountingAdapter>, DiffResults) {
        let origin_adapter = Arc::new(CountingAdapter::default());
        let target_adapter = Arc::new(CountingAdapter {
            fail_adds,
            ..Default::default()
        });

        let origin = keyed(
            origin_adapter,
            vec![
                json!({"name": "a1", "ip": "1.1.1.1"}),
                json!({"name": "a2", "ip": "1.1.1.2"}),
                json!({"name": "b", "ip": "2.2.2.2"}),
            ],
        );
        let target = keyed(
            Arc::clone(&target_adapter),
            vec![
                json!({"name": "b", "ip": "9.9.9.9"}),
                json!({"name": "c", "ip": "3.3.3.3"}),
            ],
        );

        let res = diff(origin, target, None, &FieldCmp::new());
        (target_adapter, res)
    }

    #[tokio::test]
    async fn runs_all_phases_in_order() {
        let (adapter, diff_res) = scenario(false);
        let reconciler = Reconciler::new(Box::new(DefaultReconcile), None);

        let report = reconciler.run(&diff_res, Actions::all()).await.unwrap();

        assert_eq!(adapter.creates.load(Ordering::SeqCst), 2);
        assert_eq!(adapter.deletes.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.updates.load(Ordering::SeqCst), 1);
        assert_eq!(report.attempted, 4);
        assert_eq!(report.applied, 4);
        assert_eq!(report.failed(), 0);
    }

    #[tokio::test]
    async fn unselected_phases_are_skipped() {
        let (adapter, diff_res) = scenario(false);
        let reconciler = Reconciler::new(Box::new(DefaultReconcile), None);

        let actions = Actions {
            add: true,
            ..Default::default()
        };
        let report = reconciler.run(&diff_res, actions).await.unwrap();

        assert_eq!(adapter.creates.load(Ordering::SeqCst), 2);
        assert_eq!(adapter.deletes.load(Ordering::SeqCst), 0);
        assert_eq!(adapter.updates.load(Ordering::SeqCst), 0);
        assert_eq!(report.attempted, 2);
    }

    #[tokio::test]
    async fn item_failure_is_reported_not_thrown() {
        let (adapter, diff_res) = scenario(true);
        let reconciler = Reconciler::new(Box::new(DefaultReconcile), None);

        let report = reconciler.run(&diff_res, Actions::all()).await.unwrap();

        // both adds attempted even though one failed, later phases still ran
        assert_eq!(adapter.creates.load(Ordering::SeqCst), 2);
        assert_eq!(adapter.deletes.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.updates.load(Ordering::SeqCst), 1);
        assert_eq!(report.applied, 3);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.failures[0].op, ApplyOp::Add);
        assert_eq!(report.failures[0].error, "API error: name already taken");
    }

    #[tokio::test]
    async fn empty_diff_applies_nothing() {
        let origin = keyed(
            Arc::new(CountingAdapter::default()),
            vec![json!({"name": "b", "ip": "2.2.2.2"})],
        );
        let adapter = Arc::new(CountingAdapter::default());
        let target = keyed(Arc::clone(&adapter), vec![json!({"name": "b", "ip": "2.2.2.2"})]);

        let diff_res = diff(origin, target, None, &FieldCmp::new());
        let reconciler = Reconciler::new(Box::new(DefaultReconcile), None);
        let report = reconciler.run(&diff_res, Actions::all()).await.unwrap();

        assert_eq!(report.attempted, 0);
        assert_eq!(adapter.creates.load(Ordering::SeqCst), 0);
    }
}
