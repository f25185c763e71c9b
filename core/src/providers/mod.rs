//! Concrete speech synthesis backends
pub mod cloud;
pub mod native;

pub use cloud::{CloudConfig, CloudTtsProvider};
pub use native::{NativeConfig, NativeTtsProvider};

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

use crate::provider::{AudioOutput, SynthesisOptions, TtsProvider};
use crate::Result;

type SynthFn = dyn Fn(String, SynthesisOptions, CancellationToken) -> Pin<Box<dyn Future<Output = Result<AudioOutput>> + Send>>
    + Send
    + Sync;

/// Provider backed by an async closure.
pub struct FnProvider {
    synth: Box<SynthFn>,
}

impl FnProvider {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(String, SynthesisOptions, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<AudioOutput>> + Send + 'static,
    {
        Self {
            synth: Box::new(move |text, options, cancel| Box::pin(f(text, options, cancel))),
        }
    }
}

#[async_trait]
impl TtsProvider for FnProvider {
    async fn synthesize(
        &self,
        text: &str,
        options: &SynthesisOptions,
        cancel: CancellationToken,
    ) -> Result<AudioOutput> {
        (self.synth)(text.to_string(), options.clone(), cancel).await
    }
}

/// Shorthand for `Arc::new(FnProvider::new(f))`.
pub fn provider_fn<F, Fut>(f: F) -> std::sync::Arc<dyn TtsProvider>
where
    F: Fn(String, SynthesisOptions, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AudioOutput>> + Send + 'static,
{
    std::sync::Arc::new(FnProvider::new(f))
}
