use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::collection::KeyedCollection;
use crate::common::Result;
use crate::diff::{diff, DiffResults};
use crate::filters::DiffFilter;
use crate::reconcile::{Actions, ApplyReport, ReconcilePolicy, Reconciler};
use crate::report::{self, ReportSection};
use crate::sources::with_sessions;

/// Binds an origin and target collection pair under one filter policy and
/// produces their diff. Field and key-field overrides from the policy are
/// resolved here, once, at construction.
pub struct Auditor {
    origin: KeyedCollection,
    target: KeyedCollection,
    filter: DiffFilter,
    fields: Vec<String>,
    key_fields: Vec<String>,
}

impl Auditor {
    pub fn new(origin: KeyedCollection, target: KeyedCollection, filter: DiffFilter) -> Self {
        let fields = filter
            .fields
            .clone()
            .unwrap_or_else(|| origin.fields.clone());
        let key_fields = filter
            .key_fields
            .clone()
            .unwrap_or_else(|| origin.key_fields.clone());
        Self {
            origin,
            target,
            filter,
            fields,
            key_fields,
        }
    }

    /// Fetch both sides, key them under the shared key-field list, and diff.
    /// The two fetches run concurrently; the collections share nothing.
    pub async fn audit(self) -> Result<DiffResults> {
        let Auditor {
            mut origin,
            mut target,
            filter,
            fields,
            key_fields,
        } = self;

        tokio::try_join!(
            fetch_side(&mut origin, filter.origin_fetch.as_deref()),
            fetch_side(&mut target, filter.target_fetch.as_deref()),
        )?;

        origin.make_keys(Some(&key_fields), filter.origin_key_filter(), None)?;
        target.make_keys(Some(&key_fields), filter.target_key_filter(), None)?;

        info!(
            origin_items = origin.items.len(),
            target_items = target.items.len(),
            "keyed both collections"
        );

        origin.fields = fields.clone();
        target.fields = fields.clone();

        Ok(diff(origin, target, Some(&fields), &filter.fields_cmp))
    }
}

async fn fetch_side(collection: &mut KeyedCollection, filters: Option<&str>) -> Result<()> {
    let ident = format!("{}/{}", collection.source_name(), collection.name());
    info!(collection = %ident, "fetching collection");
    collection.fetch(filters).await?;
    info!(
        collection = %ident,
        records = collection.record_count(),
        "fetched collection"
    );
    Ok(())
}

/// Options for one `diff_sync` run.
pub struct SyncOptions {
    pub actions: Actions,
    pub dry_run: bool,
    pub limit: Option<usize>,
    pub diff_report: Vec<ReportSection>,
}

/// The whole pipeline: log in to both sources, audit, report the diff, then
/// reconcile the selected buckets unless this is a dry run or there is
/// nothing to do. Both sources are logged out on every exit path.
pub async fn diff_sync(
    origin: KeyedCollection,
    target: KeyedCollection,
    filter: DiffFilter,
    policy: Box<dyn ReconcilePolicy>,
    options: SyncOptions,
) -> Result<(DiffResults, Option<ApplyReport>)> {
    let origin_source = Arc::clone(origin.source());
    let target_source = Arc::clone(target.source());
    let started = Utc::now();

    let out = with_sessions(origin_source, target_source, async move {
        let diff_res = Auditor::new(origin, target, filter).audit().await?;

        report::diff_report(&diff_res, &options.diff_report);

        if diff_res.is_empty() || options.dry_run || options.actions.is_none() {
            return Ok((diff_res, None));
        }

        let reconciler = Reconciler::new(policy, options.limit);
        let apply = reconciler.run(&diff_res, options.actions).await?;
        report::apply_report(&apply);

        Ok((diff_res, Some(apply)))
    })
    .await?;

    info!(
        elapsed_ms = (Utc::now() - started).num_milliseconds(),
        diffs = out.0.count,
        "pipeline finished"
    );
    Ok(out)
}
