use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use clap::{Parser, ValueEnum};
use plume_core::{predict, AdapterError, DeviceMap, InvocationRequest, Loader, ModelLike, SdxlLoader};
use std::{path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Plume asynchronous inference container")]
struct Args {
    /// Container command; the hosting platform launches images as `<image> serve`
    #[arg(hide = true)]
    command: Option<String>,

    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Directory holding the unpacked model artifact
    #[arg(long, env = "SM_MODEL_DIR", default_value = "/opt/ml/model")]
    model_dir: PathBuf,

    /// Directory generated images are written to
    #[arg(long, env = "SM_OUTPUT_DATA_DIR", default_value = "/opt/ml/output")]
    output_dir: PathBuf,

    /// What `/invocations` answers with
    #[arg(long, value_enum, default_value_t = ResponseMode::Image)]
    response: ResponseMode,

    /// Host address to bind the server to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8080)]
    port: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ResponseMode {
    /// The PNG as a JSON string of base64, which is what lands in the output bucket
    Image,
    /// The `{"output_path": ...}` prediction payload
    Path,
}

// Application state containing the preloaded model.
#[derive(Clone)]
struct AppState {
    model: Arc<dyn ModelLike>,
    output_dir: PathBuf,
    response: ResponseMode,
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/invocations", post(invocations))
        .with_state(Arc::new(state))
}

async fn ping() -> StatusCode {
    StatusCode::OK
}

/// The body is parsed by hand: async invocations do not always carry a JSON content type.
async fn invocations(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: InvocationRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!("rejecting malformed request body: {e}");
            return (StatusCode::BAD_REQUEST, format!("Error: {e}")).into_response();
        }
    };

    let worker = Arc::clone(&state);
    match tokio::task::spawn_blocking(move || invoke(&worker, request)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            let status = match e.downcast_ref::<AdapterError>() {
                Some(adapter) if adapter.is_client_error() => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error!("Error generating image: {e:#}");
            (status, format!("Error: {e:#}")).into_response()
        }
        Err(e) => {
            error!("generation task failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {e}")).into_response()
        }
    }
}

fn invoke(state: &AppState, request: InvocationRequest) -> Result<Response> {
    let prediction = predict(state.model.as_ref(), request, &state.output_dir)?;
    match state.response {
        ResponseMode::Path => Ok(Json(prediction).into_response()),
        ResponseMode::Image => {
            let bytes = std::fs::read(&prediction.output_path)
                .with_context(|| format!("failed to read back {}", prediction.output_path))?;
            Ok(Json(BASE64_STANDARD.encode(bytes)).into_response())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .init();

    let args = Args::parse();

    let model = SdxlLoader::load(&args.model_dir, DeviceMap::from_cpu_flag(args.cpu)).await?;

    let app = router(AppState {
        model: Arc::new(model),
        output_dir: args.output_dir,
        response: args.response,
    });

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("Started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
