//! Write-once result storage shared by all workers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::FleetError;
use crate::job::DeploymentResult;

/// Maps host identity to that host's result. Each host is written at most once.
///
/// Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct ResultStore {
    results: Arc<Mutex<HashMap<String, DeploymentResult>>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `result`. A second result for the same host is rejected and the first one kept.
    pub async fn insert(&self, result: DeploymentResult) -> Result<(), FleetError> {
        let mut results = self.results.lock().await;
        if results.contains_key(&result.host.address) {
            return Err(FleetError::DuplicateResult(result.host.address));
        }
        results.insert(result.host.address.clone(), result);
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.results.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.results.lock().await.is_empty()
    }

    pub async fn get(&self, address: &str) -> Option<DeploymentResult> {
        self.results.lock().await.get(address).cloned()
    }

    /// Snapshot of every recorded result, in no particular order.
    pub async fn results(&self) -> Vec<DeploymentResult> {
        self.results.lock().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::Mode;
    use crate::host::Host;
    use crate::job::{execute, Job, Outcome};

    async fn result_for(address: &str) -> DeploymentResult {
        let action = crate::action::TemplateAction::new("true").unwrap();
        execute(
            &action,
            Job::new(Host::new(address), Mode::Live, Duration::from_secs(5)),
        )
        .await
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = ResultStore::new();
        assert!(store.is_empty().await);
        store.insert(result_for("a").await).await.unwrap();
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get("a").await.unwrap().outcome, Outcome::Succeeded);
        assert!(store.get("b").await.is_none());
    }

    #[tokio::test]
    async fn test_second_write_is_rejected() {
        let store = ResultStore::new();
        store.insert(result_for("a").await).await.unwrap();
        let err = store.insert(result_for("a").await).await.unwrap_err();
        assert!(matches!(err, FleetError::DuplicateResult(ref host) if host == "a"));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_do_not_overwrite() {
        let store = ResultStore::new();
        let mut tasks = vec![];
        for i in 0..32 {
            let store = store.clone();
            let result = result_for(&format!("host{}", i)).await;
            tasks.push(tokio::spawn(async move { store.insert(result).await }));
        }
        for task in futures::future::join_all(tasks).await {
            task.unwrap().unwrap();
        }
        assert_eq!(store.results().await.len(), 32);
    }
}
