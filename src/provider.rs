use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::types::{InferenceRequest, InferenceResponse};

/// The LLM client contract consumed by the orchestration core. Concrete HTTP
/// clients for specific providers are out of scope here — callers supply an
/// implementation (Anthropic, OpenAI, a local model, a test double).
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// A single request/response round trip.
    async fn complete_with_request(
        &self,
        request: InferenceRequest,
    ) -> Result<InferenceResponse, ProviderError>;

    /// Streaming variant: `on_chunk` is invoked once per text chunk as it
    /// arrives. The default implementation falls back to a single
    /// non-streaming call and delivers the whole response as one chunk —
    /// providers that can genuinely stream should override this.
    async fn stream_with_request(
        &self,
        request: InferenceRequest,
        cancel: CancellationToken,
        on_chunk: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<InferenceResponse, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Request("cancelled before dispatch".into()));
        }
        let response = tokio::select! {
            result = self.complete_with_request(request) => result?,
            _ = cancel.cancelled() => {
                return Err(ProviderError::Request("cancelled".into()));
            }
        };
        if !response.content.is_empty() {
            on_chunk(&response.content);
        }
        Ok(response)
    }
}
