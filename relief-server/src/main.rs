use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use clap::Parser;
use relief_core::{models, DeviceMap, Generator, PipelineOptions, SchedulerKind};
use tokio::{self, net::TcpListener};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod api;
mod form;

use api::AppState;

/// Uploaded photos can be large; axum defaults to 2MB.
const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Depth-conditioned Stable Diffusion server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Accelerator ordinal to place models on
    #[arg(long, default_value_t = 0)]
    device: usize,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Attention slice size, 0 for automatic slicing (disabled by default)
    #[arg(long)]
    sliced_attention_size: Option<usize>,

    /// Load the default pipeline and depth model before accepting requests
    #[arg(long)]
    preload: bool,
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(form::index))
        .route("/generate", post(form::generate))
        .route("/v1/images/depth-controlnet", post(api::generate))
        .route("/v1/images/depth", post(api::depth))
        .route("/v1/options", get(api::options))
        .route("/health", get(api::health))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let device_map = DeviceMap::from_flags(args.cpu, args.device);
    let options = PipelineOptions {
        sliced_attention_size: args.sliced_attention_size,
        ..Default::default()
    };
    let preload = args.preload;
    let state = AppState::spawn(move || {
        let mut generator = Generator::new(device_map, options);
        if preload {
            info!("Preloading default models");
            generator.depth_estimator_mut().preload()?;
            generator.load_model(
                models::default_stable_model(),
                models::default_depth_model(),
                SchedulerKind::default(),
            )?;
        }
        Ok(generator)
    })
    .await?;

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    info!("Started server on {}", listener.local_addr()?);
    axum::serve(listener, router(state).into_make_service()).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
        response::Response,
    };
    use base64::{prelude::BASE64_STANDARD, Engine};
    use image::{DynamicImage, GrayImage, Rgb, RgbImage};
    use relief_core::{DepthEstimator, Loader, ModelIds, ModelLike, PipelineInput};
    use serde_json::{json, Value};
    use std::io::Cursor;
    use tower::ServiceExt;

    const BOUNDARY: &str = "relief-test-boundary";

    /// Paints every output with a colour derived from the seed.
    struct FlatLoader;

    struct FlatPipeline {
        scheduler: SchedulerKind,
    }

    impl Loader for FlatLoader {
        type Model = FlatPipeline;

        fn load(&self, _ids: &ModelIds, _device_map: DeviceMap) -> Result<FlatPipeline> {
            Ok(FlatPipeline {
                scheduler: SchedulerKind::default(),
            })
        }
    }

    impl ModelLike for FlatPipeline {
        fn set_scheduler(&mut self, scheduler: SchedulerKind) -> Result<()> {
            self.scheduler = scheduler;
            Ok(())
        }

        fn scheduler(&self) -> SchedulerKind {
            self.scheduler
        }

        fn run(&mut self, input: &PipelineInput<'_>) -> Result<Vec<DynamicImage>> {
            let colour = Rgb([(input.seed % 256) as u8, 0, 0]);
            let image = RgbImage::from_pixel(input.width as u32, input.height as u32, colour);
            Ok(vec![DynamicImage::ImageRgb8(image); input.num_images])
        }
    }

    struct LumaDepth;

    impl DepthEstimator for LumaDepth {
        fn estimate(&mut self, image: &DynamicImage) -> Result<GrayImage> {
            Ok(image.to_luma8())
        }
    }

    async fn app() -> Router {
        let state = AppState::spawn(|| {
            Ok(Generator::with_parts(FlatLoader, LumaDepth, DeviceMap::ForceCpu))
        })
        .await
        .unwrap();
        router(state)
    }

    fn photo_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 8) as u8, (y * 8) as u8, 40])
        });
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn json_request(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn multipart_request(fields: &[(&str, &str)], image: Option<&[u8]>) -> Request<Body> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        if let Some(image) = image {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"photo.png\"\r\nContent-Type: image/png\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(image);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        Request::post("/generate")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn body_json(response: Response) -> Value {
        serde_json::from_str(&body_text(response).await).unwrap()
    }

    fn decode_png(encoded: &Value) -> DynamicImage {
        let bytes = BASE64_STANDARD.decode(encoded.as_str().unwrap()).unwrap();
        image::load_from_memory(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let response = app()
            .await
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn options_list_models_and_schedulers() {
        let response = app()
            .await
            .oneshot(Request::get("/v1/options").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["schedulers"], json!(["DDIM", "EulerA", "UniPC"]));
        assert_eq!(body["stable_models"][0], models::default_stable_model());
        assert_eq!(body["defaults"]["steps"], 50);
    }

    #[tokio::test]
    async fn json_generation_returns_seed_and_images() {
        let image = BASE64_STANDARD.encode(photo_png(33, 24));
        let request = json_request(
            "/v1/images/depth-controlnet",
            json!({ "image": image, "prompt": "a marble bust", "num_images": 2, "seed": 5 }),
        );
        let response = app().await.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["seed"], 5);
        let images = body["images"].as_array().unwrap();
        assert_eq!(images.len(), 2);
        let first = decode_png(&images[0]);
        assert_eq!((first.width(), first.height()), (32, 24));
        assert_eq!(first.to_rgb8().get_pixel(0, 0), &Rgb([5, 0, 0]));
    }

    #[tokio::test]
    async fn json_generation_rejects_bad_input() {
        let bad_image = json_request(
            "/v1/images/depth-controlnet",
            json!({ "image": "***", "prompt": "a cat" }),
        );
        let response = app().await.oneshot(bad_image).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("base64"));

        let image = BASE64_STANDARD.encode(photo_png(16, 16));
        let too_many = json_request(
            "/v1/images/depth-controlnet",
            json!({ "image": image, "prompt": "a cat", "num_images": 11 }),
        );
        let response = app().await.oneshot(too_many).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn depth_endpoint_returns_three_channel_map() {
        let image = BASE64_STANDARD.encode(photo_png(20, 12));
        let response = app()
            .await
            .oneshot(json_request("/v1/images/depth", json!({ "image": image })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let depth = decode_png(&body_json(response).await["image"]).to_rgb8();
        assert_eq!(depth.dimensions(), (20, 12));
        let pixel = depth.get_pixel(5, 3).0;
        assert_eq!((pixel[0], pixel[1]), (pixel[1], pixel[2]));
    }

    #[tokio::test]
    async fn index_serves_the_form() {
        let response = app()
            .await
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let page = body_text(response).await;
        assert!(page.contains(r#"enctype="multipart/form-data""#));
        assert!(page.contains(r#"name="scheduler""#));
    }

    #[tokio::test]
    async fn form_submission_renders_gallery() {
        let photo = photo_png(24, 16);
        let request = multipart_request(
            &[("prompt", "a lighthouse"), ("num_images", "3"), ("seed", "7")],
            Some(&photo),
        );
        let response = app().await.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let page = body_text(response).await;
        assert!(page.contains("Seed: 7"));
        assert_eq!(page.matches("data:image/png;base64,").count(), 3);
        assert!(page.contains("a lighthouse"));
    }

    #[tokio::test]
    async fn rejected_form_keeps_submitted_values() {
        let photo = photo_png(16, 16);
        let request = multipart_request(
            &[("prompt", "a red barn"), ("steps", "many"), ("scheduler", "UniPC")],
            Some(&photo),
        );
        let response = app().await.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let page = body_text(response).await;
        assert!(page.contains("a red barn"));
        assert!(page.contains(r#"<option value="UniPC" selected>"#));
        assert!(page.contains("steps: not a number"));
    }

    #[tokio::test]
    async fn form_without_image_is_rejected() {
        let request = multipart_request(&[("prompt", "a tower")], None);
        let response = app().await.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.contains("an input image is required"));
    }
}
