use std::io::{Cursor, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use anyhow::{anyhow, Result};
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use base64::{prelude::BASE64_STANDARD, Engine};
use image::DynamicImage;
use relief_core::{
    models, DepthEstimator, GenerationOutput, GenerationRequest, Generator, Loader, SchedulerKind,
    CONTROLNET_DEPTH_MODEL_LIST, DEFAULT_CONTROLNET_SCALE, DEFAULT_GUIDANCE_SCALE,
    DEFAULT_NUM_IMAGES, DEFAULT_STEPS, MAX_SEED, STABLE_MODEL_LIST,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tempfile::NamedTempFile;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

/// Requests waiting for the generator beyond this many make senders wait.
const JOB_QUEUE: usize = 32;

/// What the worker thread needs from a generator.
pub trait Backend {
    fn generate(&mut self, request: &GenerationRequest) -> Result<GenerationOutput>;

    fn estimate_depth(&mut self, image_path: &Path) -> Result<DynamicImage>;

    /// Drops cached weights after a job panicked.
    fn reset(&mut self);
}

impl<L: Loader, D: DepthEstimator> Backend for Generator<L, D> {
    fn generate(&mut self, request: &GenerationRequest) -> Result<GenerationOutput> {
        Generator::generate(self, request)
    }

    fn estimate_depth(&mut self, image_path: &Path) -> Result<DynamicImage> {
        Generator::estimate_depth(self, image_path)
    }

    fn reset(&mut self) {
        self.unload_model();
    }
}

type Job = Box<dyn FnOnce(&mut dyn Backend) + Send>;

/// Handle to the generator worker thread.
///
/// The generator is built on and never leaves that thread; jobs run one at a
/// time in submission order.
#[derive(Clone)]
pub struct AppState {
    jobs: mpsc::Sender<Job>,
}

impl AppState {
    /// Starts the worker, building the generator with `build` on the worker thread.
    ///
    /// Returns once the generator is built, or with the error that prevented it.
    pub async fn spawn<G, B>(build: B) -> Result<Self>
    where
        G: Backend + 'static,
        B: FnOnce() -> Result<G> + Send + 'static,
    {
        let (jobs, mut queue) = mpsc::channel::<Job>(JOB_QUEUE);
        let (ready_tx, ready_rx) = oneshot::channel();
        std::thread::Builder::new()
            .name("generator".to_string())
            .spawn(move || {
                let mut backend = match build() {
                    Ok(backend) => {
                        let _ = ready_tx.send(Ok(()));
                        backend
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                while let Some(job) = queue.blocking_recv() {
                    let backend_ref: &mut dyn Backend = &mut backend;
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| job(backend_ref)));
                    if outcome.is_err() {
                        error!("Generator job panicked, dropping cached pipeline");
                        backend.reset();
                    }
                }
                info!("Generator worker stopped");
            })?;
        ready_rx
            .await
            .map_err(|_| anyhow!("generator worker exited during startup"))??;
        Ok(Self { jobs })
    }

    /// Runs `f` on the worker thread and waits for its result.
    pub async fn with_generator<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn Backend) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        let job: Job = Box::new(move |backend: &mut dyn Backend| {
            let _ = reply.send(f(backend));
        });
        self.jobs
            .send(job)
            .await
            .map_err(|_| anyhow!("generator worker is not running"))?;
        response
            .await
            .map_err(|_| anyhow!("generation panicked, the pipeline will be reloaded"))?
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(anyhow::Error),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::BadRequest(message) => message.clone(),
            ApiError::Internal(e) => format!("{e:#}"),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(e) = &self {
            error!("Error handling request: {e:?}");
        }
        (self.status(), Json(json!({ "error": self.message() }))).into_response()
    }
}

/// Encodes an image as a base64 PNG.
pub fn image_to_base64_png(img: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

/// Writes uploaded image bytes to a temporary file the generator can open by path.
///
/// The file is deleted when the returned handle is dropped.
pub fn persist_upload(bytes: &[u8]) -> Result<NamedTempFile, ApiError> {
    let format = image::guess_format(bytes)
        .map_err(|e| ApiError::bad_request(format!("unsupported image: {e}")))?;
    let extension = format.extensions_str().first().copied().unwrap_or("img");
    let mut file = tempfile::Builder::new()
        .prefix("relief-upload-")
        .suffix(&format!(".{extension}"))
        .tempfile()
        .map_err(anyhow::Error::from)?;
    file.write_all(bytes).map_err(anyhow::Error::from)?;
    file.flush().map_err(anyhow::Error::from)?;
    Ok(file)
}

fn decode_base64(data: &str) -> Result<Vec<u8>, ApiError> {
    // Accept data URLs as produced by browsers.
    let data = data.rsplit_once("base64,").map_or(data, |(_, payload)| payload);
    BASE64_STANDARD
        .decode(data.trim())
        .map_err(|e| ApiError::bad_request(format!("invalid base64 image: {e}")))
}

/// Range checks matching the form controls.
pub fn validate(request: &GenerationRequest) -> Result<(), ApiError> {
    if request.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("prompt must not be empty"));
    }
    if !(0.1..=15.0).contains(&request.guidance_scale) {
        return Err(ApiError::bad_request("guidance_scale must be within 0.1..=15"));
    }
    if !(1..=100).contains(&request.steps) {
        return Err(ApiError::bad_request("steps must be within 1..=100"));
    }
    if !(1..=10).contains(&request.num_images) {
        return Err(ApiError::bad_request("num_images must be within 1..=10"));
    }
    if request.seed > MAX_SEED {
        return Err(ApiError::bad_request(format!("seed must be at most {MAX_SEED}")));
    }
    Ok(())
}

/// Runs a validated request against an uploaded image.
pub async fn run_generation(
    state: &AppState,
    upload: NamedTempFile,
    mut request: GenerationRequest,
) -> Result<(u64, Vec<String>), ApiError> {
    validate(&request)?;
    request.image_path = upload.path().to_path_buf();
    let output = state
        .with_generator(move |backend| {
            let output = backend.generate(&request);
            drop(upload);
            output
        })
        .await?;
    let images = output
        .images
        .iter()
        .map(image_to_base64_png)
        .collect::<Result<Vec<_>>>()?;
    Ok((output.seed, images))
}

#[derive(Deserialize, Debug)]
pub struct DepthControlNetRequest {
    /// Base64 input photo (a data URL prefix is accepted).
    pub image: String,
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    pub stable_model_id: Option<String>,
    pub depth_model_id: Option<String>,
    pub num_images: Option<usize>,
    pub guidance_scale: Option<f64>,
    pub steps: Option<usize>,
    pub scheduler: Option<SchedulerKind>,
    pub seed: Option<u64>,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub controlnet_scale: Option<f64>,
}

impl DepthControlNetRequest {
    fn into_generation_request(self) -> GenerationRequest {
        let mut request = GenerationRequest::new("", self.prompt);
        request.negative_prompt = self.negative_prompt;
        if let Some(id) = self.stable_model_id {
            request.stable_model_id = id;
        }
        if let Some(id) = self.depth_model_id {
            request.depth_model_id = id;
        }
        request.num_images = self.num_images.unwrap_or(DEFAULT_NUM_IMAGES);
        request.guidance_scale = self.guidance_scale.unwrap_or(DEFAULT_GUIDANCE_SCALE);
        request.steps = self.steps.unwrap_or(DEFAULT_STEPS);
        request.scheduler = self.scheduler.unwrap_or_default();
        request.seed = self.seed.unwrap_or(0);
        request.width = self.width;
        request.height = self.height;
        request.controlnet_scale = self.controlnet_scale;
        request
    }
}

#[derive(Serialize, Debug)]
pub struct GenerationResponse {
    pub seed: u64,
    pub images: Vec<String>,
}

pub async fn generate(
    State(state): State<AppState>,
    Json(mut req): Json<DepthControlNetRequest>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let bytes = decode_base64(&std::mem::take(&mut req.image))?;
    let upload = persist_upload(&bytes)?;
    let (seed, images) = run_generation(&state, upload, req.into_generation_request()).await?;
    Ok(Json(GenerationResponse { seed, images }))
}

#[derive(Deserialize, Debug)]
pub struct DepthRequest {
    pub image: String,
}

#[derive(Serialize, Debug)]
pub struct DepthResponse {
    pub image: String,
}

pub async fn depth(
    State(state): State<AppState>,
    Json(req): Json<DepthRequest>,
) -> Result<Json<DepthResponse>, ApiError> {
    let bytes = decode_base64(&req.image)?;
    let upload = persist_upload(&bytes)?;
    let depth = state
        .with_generator(move |backend| backend.estimate_depth(upload.path()))
        .await?;
    Ok(Json(DepthResponse {
        image: image_to_base64_png(&depth)?,
    }))
}

pub async fn options() -> Json<Value> {
    let schedulers: Vec<String> = SchedulerKind::ALL.iter().map(|s| s.to_string()).collect();
    Json(json!({
        "stable_models": STABLE_MODEL_LIST,
        "depth_models": CONTROLNET_DEPTH_MODEL_LIST,
        "schedulers": schedulers,
        "defaults": {
            "stable_model_id": models::default_stable_model(),
            "depth_model_id": models::default_depth_model(),
            "scheduler": SchedulerKind::default().to_string(),
            "guidance_scale": DEFAULT_GUIDANCE_SCALE,
            "steps": DEFAULT_STEPS,
            "num_images": DEFAULT_NUM_IMAGES,
            "controlnet_scale": DEFAULT_CONTROLNET_SCALE,
            "seed": 0,
        },
    }))
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
