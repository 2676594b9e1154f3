//! Cached view of which local models are actually served.
//!
//! Filtering fails open: until discovery succeeds, or when filtering would leave nothing,
//! the configured list is used unchanged. Discovery runs in the background, at most one
//! at a time.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::engine::{BackendId, BackendKind, TextGenerator};

#[derive(Debug, Default)]
struct Discovered {
    models: Option<BTreeSet<String>>,
    fetched_at: Option<Instant>,
}

pub struct BackendCatalog {
    generator: Arc<dyn TextGenerator>,
    default_kind: BackendKind,
    ttl: Duration,
    state: RwLock<Discovered>,
    refreshing: AtomicBool,
}

fn normalize(model: &str) -> &str {
    model.strip_suffix(":latest").unwrap_or(model)
}

impl BackendCatalog {
    pub fn new(generator: Arc<dyn TextGenerator>, default_kind: BackendKind, ttl: Duration) -> Self {
        Self {
            generator,
            default_kind,
            ttl,
            state: RwLock::new(Discovered::default()),
            refreshing: AtomicBool::new(false),
        }
    }

    /// Last successful discovery, if any.
    pub fn known(&self) -> Option<Vec<String>> {
        self.state
            .read()
            .models
            .as_ref()
            .map(|m| m.iter().cloned().collect())
    }

    fn is_stale(&self) -> bool {
        self.state
            .read()
            .fetched_at
            .map_or(true, |at| at.elapsed() >= self.ttl)
    }

    /// Query the generator now. Errors keep the previous snapshot.
    pub async fn refresh(&self) {
        match self.generator.list_backends().await {
            Ok(models) => {
                tracing::debug!(count = models.len(), "discovered local models");
                let mut state = self.state.write();
                state.models = Some(models.into_iter().collect());
                state.fetched_at = Some(Instant::now());
            }
            Err(e) => {
                tracing::debug!(error = %e, "model discovery unavailable");
                // Back off for a full TTL before asking again.
                self.state.write().fetched_at = Some(Instant::now());
            }
        }
    }

    /// Start a background refresh when the snapshot is missing or stale. Never waits:
    /// callers filter against whatever is cached right now.
    pub fn ensure_fresh(self: &Arc<Self>) {
        if !self.is_stale() || self.refreshing.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.refresh().await;
            this.refreshing.store(false, Ordering::Release);
        });
    }

    /// Keep candidates the host is known to serve. Remote kinds always pass.
    pub fn filter(&self, candidates: &[String]) -> Vec<String> {
        let state = self.state.read();
        let Some(models) = state.models.as_ref() else {
            return candidates.to_vec();
        };
        let served: BTreeSet<&str> = models.iter().map(|m| normalize(m)).collect();

        let kept: Vec<String> = candidates
            .iter()
            .filter(|raw| match BackendId::parse(raw, self.default_kind) {
                Ok(id) if id.kind == BackendKind::Ollama => served.contains(normalize(&id.model)),
                Ok(_) => true,
                Err(_) => false,
            })
            .cloned()
            .collect();

        if kept.is_empty() {
            tracing::debug!("no configured candidate is served locally, using the full list");
            candidates.to_vec()
        } else {
            kept
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct Tags(Result<Vec<&'static str>, ()>);

    /// Answers discovery only after a long delay.
    struct SlowTags {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TextGenerator for SlowTags {
        async fn generate(&self, _: &str, _: &str, _: Duration) -> Result<String, BackendError> {
            Err(BackendError::Empty)
        }

        async fn list_backends(&self) -> Result<Vec<String>, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec!["codellama:7b".to_string()])
        }
    }

    #[async_trait]
    impl TextGenerator for Tags {
        async fn generate(&self, _: &str, _: &str, _: Duration) -> Result<String, BackendError> {
            Err(BackendError::Empty)
        }

        async fn list_backends(&self) -> Result<Vec<String>, BackendError> {
            match &self.0 {
                Ok(list) => Ok(list.iter().map(|s| s.to_string()).collect()),
                Err(()) => Err(BackendError::Discovery("connection refused".into())),
            }
        }
    }

    fn catalog(tags: Tags) -> Arc<BackendCatalog> {
        Arc::new(BackendCatalog::new(
            Arc::new(tags),
            BackendKind::Ollama,
            Duration::from_secs(60),
        ))
    }

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn filters_to_served_models_ignoring_latest_suffix() {
        let catalog = catalog(Tags(Ok(vec!["codellama:7b", "llama3-code:latest"])));
        catalog.refresh().await;

        let kept = catalog.filter(&list(&[
            "llama3-code",
            "deepseek-coder-v2:latest",
            "codellama:7b",
            "openai/gpt-4o-mini",
        ]));
        assert_eq!(kept, list(&["llama3-code", "codellama:7b", "openai/gpt-4o-mini"]));
    }

    #[tokio::test]
    async fn empty_result_falls_back_to_configured_list() {
        let catalog = catalog(Tags(Ok(vec!["mistral:7b"])));
        catalog.refresh().await;
        let configured = list(&["codellama:7b"]);
        assert_eq!(catalog.filter(&configured), configured);
    }

    #[tokio::test]
    async fn discovery_errors_fail_open() {
        let catalog = catalog(Tags(Err(())));
        catalog.refresh().await;
        assert_eq!(catalog.known(), None);
        let configured = list(&["a", "b"]);
        assert_eq!(catalog.filter(&configured), configured);
    }

    #[tokio::test(start_paused = true)]
    async fn cold_cache_does_not_wait_for_discovery() {
        let generator = Arc::new(SlowTags {
            calls: AtomicUsize::new(0),
        });
        let catalog = Arc::new(BackendCatalog::new(
            generator.clone(),
            BackendKind::Ollama,
            Duration::from_secs(60),
        ));
        let configured = list(&["codellama:7b", "llama3-code:latest"]);

        let started = tokio::time::Instant::now();
        catalog.ensure_fresh();
        catalog.ensure_fresh();
        assert_eq!(catalog.filter(&configured), configured);
        assert_eq!(started.elapsed(), Duration::ZERO);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(catalog.known(), Some(list(&["codellama:7b"])));
        assert_eq!(catalog.filter(&configured), list(&["codellama:7b"]));
    }
}
