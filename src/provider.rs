pub mod openai;
pub mod prompt;

use crate::config::ProviderConfig;
use crate::types::{ChangeSet, ReviewConfig, Summary};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Raw text chunks of one provider's review output
pub type TokenStream = BoxStream<'static, anyhow::Result<String>>;

/// A review backend driven through its own token stream
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;

    /// Whether credentials and configuration needed to run are present
    fn is_ready(&self, config: &ReviewConfig) -> bool;

    /// Start a streaming review. `summary` is the shared change summary, if one
    /// was produced, so the provider can skip generating its own.
    async fn stream_review(
        &self,
        change_set: &ChangeSet,
        config: &ReviewConfig,
        summary: Option<&Summary>,
    ) -> anyhow::Result<TokenStream>;

    /// One-shot change summary; providers without support return `None`
    async fn generate_summary(
        &self,
        _change_set: &ChangeSet,
        _config: &ReviewConfig,
    ) -> anyhow::Result<Option<Summary>> {
        Ok(None)
    }
}

/// Build one provider per configured backend
pub fn create_providers(configs: &[ProviderConfig]) -> Vec<Arc<dyn Provider>> {
    configs
        .iter()
        .map(|config| Arc::new(openai::OpenAIProvider::new(config.clone())) as Arc<dyn Provider>)
        .collect()
}
