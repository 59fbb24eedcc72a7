use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::common::{AuditError, Result};

pub mod ipfabric;
pub mod netbox;

/// Decode a JSON body after surfacing non-2xx responses as API errors with
/// whatever the provider put in the body.
pub(crate) async fn response_json(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(AuditError::api(format!("HTTP {status}: {body}")));
    }
    Ok(resp.json().await?)
}

pub(crate) async fn check_status(resp: reqwest::Response) -> Result<()> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(AuditError::api(format!("HTTP {status}: {body}")));
    }
    Ok(())
}

/// A remote system of record. Implementations own the HTTP client and session
/// state for one configured instance.
///
/// `login` must be called before any collection bound to the source fetches or
/// mutates records, and `logout` must run regardless of how the pipeline ends;
/// [`with_sessions`] provides that pairing for an origin/target pair.
#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &'static str;

    async fn login(&self) -> Result<()>;

    async fn logout(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// Run `work` with both sources logged in, logging out every source that was
/// logged in no matter how `work` (or the second login) ends.
pub async fn with_sessions<T, F>(
    origin: Arc<dyn Source>,
    target: Arc<dyn Source>,
    work: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    origin.login().await?;

    if let Err(err) = target.login().await {
        logout_quietly(origin.as_ref()).await;
        return Err(err);
    }

    let out = work.await;

    logout_quietly(origin.as_ref()).await;
    logout_quietly(target.as_ref()).await;

    out
}

async fn logout_quietly(source: &dyn Source) {
    if let Err(err) = source.logout().await {
        warn!(source = source.name(), error = %err, "logout failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::AuditError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FlakySource {
        fail_login: bool,
        connected: AtomicBool,
        logouts: AtomicUsize,
    }

    #[async_trait]
    impl Source for FlakySource {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn login(&self) -> Result<()> {
            if self.fail_login {
                return Err(AuditError::api("login refused"));
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn logout(&self) -> Result<()> {
            self.connected.store(false, Ordering::SeqCst);
            self.logouts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn sessions_released_on_failure() {
        let origin = Arc::new(FlakySource::default());
        let target = Arc::new(FlakySource::default());

        let result: Result<()> = with_sessions(
            origin.clone(),
            target.clone(),
            async { Err(AuditError::api("pipeline blew up")) },
        )
        .await;

        assert!(result.is_err());
        assert!(!origin.is_connected());
        assert!(!target.is_connected());
        assert_eq!(origin.logouts.load(Ordering::SeqCst), 1);
        assert_eq!(target.logouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn origin_released_when_target_login_fails() {
        let origin = Arc::new(FlakySource::default());
        let target = Arc::new(FlakySource {
            fail_login: true,
            ..Default::default()
        });

        let result: Result<()> = with_sessions(
            origin.clone(),
            target.clone(),
            async { Ok(()) },
        )
        .await;

        assert!(result.is_err());
        assert!(!origin.is_connected());
        assert_eq!(origin.logouts.load(Ordering::SeqCst), 1);
        assert_eq!(target.logouts.load(Ordering::SeqCst), 0);
    }
}
