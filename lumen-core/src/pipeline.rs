use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::GenerateError;
use crate::params::GenerationParams;
use crate::postprocess::RawImage;

/// The diffusion collaborator: turns validated parameters into a raw image.
pub trait TextToImage: Send {
    fn run(&mut self, params: &GenerationParams) -> anyhow::Result<RawImage>;
}

/// Builds a [`TextToImage`] collaborator. Injectable so tests can substitute
/// a fake for the real model stack.
#[async_trait]
pub trait PipelineLoader: Send + Sync {
    async fn load(&self) -> anyhow::Result<Box<dyn TextToImage>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Unloaded,
    Loading,
    Loaded,
}

/// Process-wide handle to the diffusion pipeline.
///
/// The model slot sits behind an async mutex, so loads, generations, and
/// unloads are strictly serialized; the collaborator is never entered
/// concurrently. State flags are atomics readable without the lock, so
/// health checks do not queue behind a running generation.
pub struct PipelineHandle {
    loader: Box<dyn PipelineLoader>,
    model: Mutex<Option<Box<dyn TextToImage>>>,
    loading: AtomicBool,
    loaded: AtomicBool,
    last_error: StdMutex<Option<String>>,
}

impl PipelineHandle {
    pub fn new(loader: Box<dyn PipelineLoader>) -> Self {
        Self {
            loader,
            model: Mutex::new(None),
            loading: AtomicBool::new(false),
            loaded: AtomicBool::new(false),
            last_error: StdMutex::new(None),
        }
    }

    pub fn state(&self) -> PipelineState {
        if self.loading.load(Ordering::SeqCst) {
            PipelineState::Loading
        } else if self.loaded.load(Ordering::SeqCst) {
            PipelineState::Loaded
        } else {
            PipelineState::Unloaded
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    /// Error recorded by the most recent failed load, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().map(|e| (*e).clone()).unwrap_or(None)
    }

    /// Idempotent: a call while already loading or loaded is a no-op.
    pub async fn load(&self) -> Result<(), GenerateError> {
        let mut slot = self.model.lock().await;
        self.load_slot(&mut slot).await
    }

    async fn load_slot(
        &self,
        slot: &mut Option<Box<dyn TextToImage>>,
    ) -> Result<(), GenerateError> {
        if slot.is_some() {
            return Ok(());
        }
        self.loading.store(true, Ordering::SeqCst);
        info!("loading pipeline");
        let result = self.loader.load().await;
        self.loading.store(false, Ordering::SeqCst);
        match result {
            Ok(model) => {
                *slot = Some(model);
                self.loaded.store(true, Ordering::SeqCst);
                if let Ok(mut e) = self.last_error.lock() {
                    *e = None;
                }
                info!("pipeline loaded");
                Ok(())
            }
            Err(e) => {
                self.loaded.store(false, Ordering::SeqCst);
                let message = format!("{e:#}");
                if let Ok(mut last) = self.last_error.lock() {
                    *last = Some(message.clone());
                }
                warn!("pipeline load failed: {message}");
                Err(GenerateError::ModelUnavailable(message))
            }
        }
    }

    /// Runs one generation, loading the pipeline first when unloaded.
    pub async fn infer(&self, params: &GenerationParams) -> Result<RawImage, GenerateError> {
        let mut slot = self.model.lock().await;
        self.load_slot(&mut slot).await?;
        let model = slot.as_mut().ok_or_else(|| {
            GenerateError::ModelUnavailable("pipeline is not loaded".to_string())
        })?;
        model
            .run(params)
            .map_err(|e| GenerateError::GenerationFailed(format!("{e:#}")))
    }

    /// Releases the model and its device buffers. No-op when unloaded.
    pub async fn unload(&self) {
        let mut slot = self.model.lock().await;
        if let Some(model) = slot.take() {
            // Dropping the boxed model releases its device memory before the
            // lock is given up.
            drop(model);
            info!("pipeline unloaded");
        }
        self.loaded.store(false, Ordering::SeqCst);
    }

    /// Unload followed by load under a single lock acquisition, so a reload
    /// cannot interleave with another load or a generation.
    pub async fn reload(&self) -> Result<(), GenerateError> {
        let mut slot = self.model.lock().await;
        if slot.take().is_some() {
            self.loaded.store(false, Ordering::SeqCst);
            info!("pipeline unloaded for reload");
        }
        self.load_slot(&mut slot).await
    }
}
