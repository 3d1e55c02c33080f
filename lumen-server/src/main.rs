use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use lumen_core::{device_label, DeviceMap, PipelineHandle, SdLoader};
use lumen_server::{create_app, AppState};
use tokio::net::TcpListener;
use tracing::{info, warn};

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Lumen image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Model to serve
    #[arg(
        long,
        env = "LUMEN_MODEL",
        default_value = "runwayml/stable-diffusion-v1-5"
    )]
    model: String,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, env = "LUMEN_PORT", default_value_t = 5001)]
    port: u16,

    /// Load the model at startup instead of on the first request
    #[arg(long, env = "LUMEN_PRELOAD")]
    preload: bool,

    /// Attention slicing chunk size, trades speed for peak memory
    #[arg(long)]
    sliced_attention: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let device_map = if args.cpu {
        DeviceMap::ForceCpu
    } else {
        DeviceMap::default()
    };
    let loader = SdLoader::new(&args.model, device_map, args.sliced_attention)?;
    let pipeline = Arc::new(PipelineHandle::new(Box::new(loader)));
    let state = AppState {
        pipeline: Arc::clone(&pipeline),
        model_id: args.model.clone(),
        device: device_label(device_map),
        cuda_available: lumen_core::cuda_available(),
    };
    info!(
        device = state.device,
        model = %args.model,
        cuda_available = state.cuda_available,
        "starting image generation server"
    );

    if args.preload {
        info!("pre-loading model");
        if let Err(e) = pipeline.load().await {
            warn!("model preload failed: {e}");
        }
    }

    // --- Build axum router with shared state ---
    let app = create_app(state);

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
