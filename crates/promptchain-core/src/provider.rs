//! Provider capability traits and type-erased wrappers.
//!
//! The engine is provider-agnostic: it consumes two independent capability
//! surfaces, synchronous completion and the asynchronous batch lifecycle.
//! A given provider may implement one or both.
//!
//! The capability traits use native async fn in traits (RPITIT), so they are
//! not object-safe. Dynamic provider selection goes through the same
//! three-step pattern used throughout the codebase's lineage:
//! an object-safe `*Dyn` trait with boxed futures, a blanket impl for all
//! concrete implementations, and a `Box*` wrapper delegating to the trait
//! object.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use promptchain_types::provider::{
    BatchHandle, BatchItemOutcome, BatchPollReport, BatchRequest, CompletionRequest,
    CompletionResponse, ProviderError,
};

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// Synchronous chat completion.
pub trait CompletionProvider: Send + Sync {
    /// Human-readable provider name (e.g. "openai", "ollama").
    fn name(&self) -> &str;

    /// Send one prompt and receive the full raw response.
    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> impl Future<Output = Result<CompletionResponse, ProviderError>> + Send;
}

/// Asynchronous batch lifecycle: submit, poll, fetch.
pub trait BatchProvider: Send + Sync {
    /// Submit a batch of requests; returns the provider handle and the
    /// item-id to request-id mapping.
    fn submit(
        &self,
        requests: Vec<BatchRequest>,
    ) -> impl Future<Output = Result<BatchHandle, ProviderError>> + Send;

    /// Observe the current state of a submitted batch.
    fn poll(
        &self,
        submission_id: &str,
    ) -> impl Future<Output = Result<BatchPollReport, ProviderError>> + Send;

    /// Download per-item results of a completed batch, keyed by item id.
    fn fetch(
        &self,
        submission_id: &str,
    ) -> impl Future<Output = Result<Vec<BatchItemOutcome>, ProviderError>> + Send;
}

// ---------------------------------------------------------------------------
// Object-safe variants
// ---------------------------------------------------------------------------

/// Object-safe [`CompletionProvider`] with boxed futures.
pub trait CompletionProviderDyn: Send + Sync {
    fn name(&self) -> &str;

    fn complete_boxed<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, ProviderError>> + Send + 'a>>;
}

impl<T: CompletionProvider> CompletionProviderDyn for T {
    fn name(&self) -> &str {
        CompletionProvider::name(self)
    }

    fn complete_boxed<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, ProviderError>> + Send + 'a>> {
        Box::pin(self.complete(request))
    }
}

/// Object-safe [`BatchProvider`] with boxed futures.
pub trait BatchProviderDyn: Send + Sync {
    fn submit_boxed(
        &self,
        requests: Vec<BatchRequest>,
    ) -> Pin<Box<dyn Future<Output = Result<BatchHandle, ProviderError>> + Send + '_>>;

    fn poll_boxed<'a>(
        &'a self,
        submission_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<BatchPollReport, ProviderError>> + Send + 'a>>;

    fn fetch_boxed<'a>(
        &'a self,
        submission_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<BatchItemOutcome>, ProviderError>> + Send + 'a>>;
}

impl<T: BatchProvider> BatchProviderDyn for T {
    fn submit_boxed(
        &self,
        requests: Vec<BatchRequest>,
    ) -> Pin<Box<dyn Future<Output = Result<BatchHandle, ProviderError>> + Send + '_>> {
        Box::pin(self.submit(requests))
    }

    fn poll_boxed<'a>(
        &'a self,
        submission_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<BatchPollReport, ProviderError>> + Send + 'a>> {
        Box::pin(self.poll(submission_id))
    }

    fn fetch_boxed<'a>(
        &'a self,
        submission_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<BatchItemOutcome>, ProviderError>> + Send + 'a>>
    {
        Box::pin(self.fetch(submission_id))
    }
}

// ---------------------------------------------------------------------------
// Box wrappers
// ---------------------------------------------------------------------------

/// Type-erased completion provider for runtime selection.
pub struct BoxCompletionProvider {
    inner: Box<dyn CompletionProviderDyn>,
}

impl BoxCompletionProvider {
    pub fn new<T: CompletionProvider + 'static>(provider: T) -> Self {
        Self {
            inner: Box::new(provider),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        self.inner.complete_boxed(request).await
    }
}

/// Type-erased batch provider for runtime selection.
pub struct BoxBatchProvider {
    inner: Box<dyn BatchProviderDyn>,
}

impl BoxBatchProvider {
    pub fn new<T: BatchProvider + 'static>(provider: T) -> Self {
        Self {
            inner: Box::new(provider),
        }
    }

    pub async fn submit(&self, requests: Vec<BatchRequest>) -> Result<BatchHandle, ProviderError> {
        self.inner.submit_boxed(requests).await
    }

    pub async fn poll(&self, submission_id: &str) -> Result<BatchPollReport, ProviderError> {
        self.inner.poll_boxed(submission_id).await
    }

    pub async fn fetch(
        &self,
        submission_id: &str,
    ) -> Result<Vec<BatchItemOutcome>, ProviderError> {
        self.inner.fetch_boxed(submission_id).await
    }
}

// ---------------------------------------------------------------------------
// Handle + source seam
// ---------------------------------------------------------------------------

/// A provider as the engine sees it: sync completion always, batch when the
/// provider supports it.
pub struct ProviderHandle {
    pub completion: BoxCompletionProvider,
    pub batch: Option<BoxBatchProvider>,
}

impl ProviderHandle {
    /// A sync-only provider.
    pub fn completion_only<T: CompletionProvider + 'static>(provider: T) -> Self {
        Self {
            completion: BoxCompletionProvider::new(provider),
            batch: None,
        }
    }

    /// A provider implementing both capabilities.
    pub fn with_batch<T>(provider: T) -> Self
    where
        T: CompletionProvider + BatchProvider + Clone + 'static,
    {
        Self {
            completion: BoxCompletionProvider::new(provider.clone()),
            batch: Some(BoxBatchProvider::new(provider)),
        }
    }

    pub fn supports_batch(&self) -> bool {
        self.batch.is_some()
    }
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("completion", &self.completion.name())
            .field("supports_batch", &self.supports_batch())
            .finish()
    }
}

/// The runner's seam for resolving providers by name. Implemented by the
/// factory in `promptchain-infra`; tests supply fakes.
pub trait ProviderSource: Send + Sync {
    /// Resolve a provider by name. Unknown names are an
    /// [`ProviderError::InvalidRequest`].
    fn get(&self, name: &str) -> Result<Arc<ProviderHandle>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptchain_types::provider::BatchJobStatus;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[derive(Clone)]
    struct Echo;

    impl CompletionProvider for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn complete(
            &self,
            request: &CompletionRequest,
        ) -> Result<CompletionResponse, ProviderError> {
            Ok(CompletionResponse {
                text: format!("echo: {}", request.prompt),
                metadata: json!({"model": request.model}),
            })
        }
    }

    impl BatchProvider for Echo {
        async fn submit(
            &self,
            requests: Vec<BatchRequest>,
        ) -> Result<BatchHandle, ProviderError> {
            let mapping: BTreeMap<String, String> = requests
                .iter()
                .map(|r| (r.item_id.clone(), format!("req_{}", r.item_id)))
                .collect();
            Ok(BatchHandle {
                submission_id: "batch_echo".to_string(),
                mapping,
            })
        }

        async fn poll(&self, _submission_id: &str) -> Result<BatchPollReport, ProviderError> {
            Ok(BatchPollReport {
                status: BatchJobStatus::Completed,
                counts: BTreeMap::new(),
            })
        }

        async fn fetch(
            &self,
            _submission_id: &str,
        ) -> Result<Vec<BatchItemOutcome>, ProviderError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn boxed_completion_delegates() {
        let boxed = BoxCompletionProvider::new(Echo);
        assert_eq!(boxed.name(), "echo");
        let response = boxed
            .complete(&CompletionRequest {
                model: "m".into(),
                prompt: "hi".into(),
                temperature: None,
                reasoning: None,
            })
            .await
            .unwrap();
        assert_eq!(response.text, "echo: hi");
    }

    #[tokio::test]
    async fn handle_capability_flags() {
        let sync_only = ProviderHandle::completion_only(Echo);
        assert!(!sync_only.supports_batch());

        let full = ProviderHandle::with_batch(Echo);
        assert!(full.supports_batch());
        let handle = full
            .batch
            .as_ref()
            .unwrap()
            .submit(vec![BatchRequest {
                item_id: "item_a".into(),
                model: "m".into(),
                prompt: "p".into(),
                temperature: None,
                reasoning: None,
            }])
            .await
            .unwrap();
        assert_eq!(handle.submission_id, "batch_echo");
        assert_eq!(handle.mapping["item_a"], "req_item_a");
    }
}
