use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lumen_core::{
    GenerateError, GenerationParams, GenerationRequest, PipelineHandle, PipelineLoader,
    PipelineState, RawImage, TextToImage,
};

struct FakeModel;

impl TextToImage for FakeModel {
    fn run(&mut self, params: &GenerationParams) -> anyhow::Result<RawImage> {
        let len = params.width * params.height * 3;
        Ok(RawImage {
            width: params.width,
            height: params.height,
            channels: 3,
            data: (0..len).map(|i| (i % 256) as f32).collect(),
        })
    }
}

struct ErroringModel;

impl TextToImage for ErroringModel {
    fn run(&mut self, _params: &GenerationParams) -> anyhow::Result<RawImage> {
        anyhow::bail!("CUDA out of memory")
    }
}

struct CountingLoader {
    loads: Arc<AtomicUsize>,
    build: fn() -> anyhow::Result<Box<dyn TextToImage>>,
}

#[async_trait]
impl PipelineLoader for CountingLoader {
    async fn load(&self) -> anyhow::Result<Box<dyn TextToImage>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        (self.build)()
    }
}

fn handle(build: fn() -> anyhow::Result<Box<dyn TextToImage>>) -> (PipelineHandle, Arc<AtomicUsize>) {
    let loads = Arc::new(AtomicUsize::new(0));
    let loader = CountingLoader {
        loads: Arc::clone(&loads),
        build,
    };
    (PipelineHandle::new(Box::new(loader)), loads)
}

fn params() -> GenerationParams {
    GenerationParams::from_request(&GenerationRequest {
        width: Some(64),
        height: Some(64),
        num_inference_steps: Some(1),
        ..Default::default()
    })
}

#[tokio::test]
async fn load_is_idempotent() {
    let (handle, loads) = handle(|| Ok(Box::new(FakeModel)));
    assert_eq!(handle.state(), PipelineState::Unloaded);
    handle.load().await.unwrap();
    handle.load().await.unwrap();
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert_eq!(handle.state(), PipelineState::Loaded);
}

#[tokio::test]
async fn infer_loads_on_demand() {
    let (handle, loads) = handle(|| Ok(Box::new(FakeModel)));
    let image = handle.infer(&params()).await.unwrap();
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert_eq!((image.width, image.height), (64, 64));
    assert!(handle.is_loaded());
}

#[tokio::test]
async fn unload_then_infer_reloads() {
    let (handle, loads) = handle(|| Ok(Box::new(FakeModel)));
    handle.load().await.unwrap();
    handle.unload().await;
    assert_eq!(handle.state(), PipelineState::Unloaded);
    handle.infer(&params()).await.unwrap();
    assert_eq!(loads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unload_when_unloaded_is_a_noop() {
    let (handle, loads) = handle(|| Ok(Box::new(FakeModel)));
    handle.unload().await;
    assert_eq!(handle.state(), PipelineState::Unloaded);
    assert_eq!(loads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_load_reports_model_unavailable() {
    let (handle, loads) = handle(|| anyhow::bail!("weights missing"));
    let err = handle.load().await.unwrap_err();
    assert!(matches!(err, GenerateError::ModelUnavailable(_)));
    assert_eq!(handle.state(), PipelineState::Unloaded);
    assert!(handle.last_error().unwrap().contains("weights missing"));

    // A failed load does not wedge the handle; the next attempt retries.
    let _ = handle.load().await;
    assert_eq!(loads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn successful_load_clears_last_error() {
    let (handle, _loads) = handle(|| Ok(Box::new(FakeModel)));
    handle.load().await.unwrap();
    assert_eq!(handle.last_error(), None);
}

#[tokio::test]
async fn collaborator_error_maps_to_generation_failed() {
    let (handle, _loads) = handle(|| Ok(Box::new(ErroringModel)));
    let err = handle.infer(&params()).await.unwrap_err();
    match err {
        GenerateError::GenerationFailed(message) => {
            assert!(message.contains("CUDA out of memory"))
        }
        other => panic!("expected GenerationFailed, got {other:?}"),
    }
    // The pipeline stays loaded; only the generation failed.
    assert!(handle.is_loaded());
}

#[tokio::test]
async fn reload_performs_a_fresh_load() {
    let (handle, loads) = handle(|| Ok(Box::new(FakeModel)));
    handle.load().await.unwrap();
    handle.reload().await.unwrap();
    assert_eq!(loads.load(Ordering::SeqCst), 2);
    assert!(handle.is_loaded());
}

#[tokio::test]
async fn reload_from_unloaded_just_loads() {
    let (handle, loads) = handle(|| Ok(Box::new(FakeModel)));
    handle.reload().await.unwrap();
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert!(handle.is_loaded());
}
