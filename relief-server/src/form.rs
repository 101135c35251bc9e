use std::collections::HashMap;
use std::fmt::Write;

use axum::{
    extract::{Multipart, State},
    response::{Html, IntoResponse, Response},
};
use relief_core::{
    GenerationRequest, SchedulerKind, CONTROLNET_DEPTH_MODEL_LIST, MAX_SEED, STABLE_MODEL_LIST,
};
use tracing::info;

use crate::api::{persist_upload, run_generation, validate, ApiError, AppState};

pub async fn index() -> Html<String> {
    Html(render_page(&GenerationRequest::new("", ""), None))
}

pub async fn generate(State(state): State<AppState>, multipart: Multipart) -> Response {
    let (fields, image) = match read_multipart(multipart).await {
        Ok(parts) => parts,
        Err(e) => return error_page(&GenerationRequest::new("", ""), e),
    };
    let (request, field_error) = request_from_fields(&fields);
    if let Some(e) = field_error.or_else(|| validate(&request).err()) {
        return error_page(&request, e);
    }
    let result = match image {
        Some(bytes) if !bytes.is_empty() => match persist_upload(&bytes) {
            Ok(upload) => run_generation(&state, upload, request.clone()).await,
            Err(e) => Err(e),
        },
        _ => Err(ApiError::bad_request("an input image is required")),
    };
    match result {
        Ok((seed, images)) => {
            info!(seed, count = images.len(), "Rendering gallery");
            Html(render_page(&request, Some(&render_gallery(seed, &images)))).into_response()
        }
        Err(e) => error_page(&request, e),
    }
}

async fn read_multipart(
    mut multipart: Multipart,
) -> Result<(HashMap<String, String>, Option<Vec<u8>>), ApiError> {
    let mut fields = HashMap::new();
    let mut image = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("malformed form: {e}")))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        if name == "image" {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::bad_request(format!("failed to read image: {e}")))?;
            image = Some(bytes.to_vec());
        } else {
            let value = field
                .text()
                .await
                .map_err(|e| ApiError::bad_request(format!("failed to read {name}: {e}")))?;
            fields.insert(name, value);
        }
    }
    Ok((fields, image))
}

fn number<T: std::str::FromStr>(
    fields: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ApiError> {
    match fields.get(name).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(value) => value
            .parse()
            .map_err(|_| ApiError::bad_request(format!("{name}: not a number: {value:?}"))),
        None => Ok(default),
    }
}

/// Builds a request from whatever fields parse, keeping defaults for the rest.
///
/// Also returns the first field that failed to parse, if any.
fn request_from_fields(
    fields: &HashMap<String, String>,
) -> (GenerationRequest, Option<ApiError>) {
    let prompt = fields.get("prompt").cloned().unwrap_or_default();
    let mut request = GenerationRequest::new("", prompt);
    let mut first_error = None;
    let mut keep = |result: Result<(), ApiError>| {
        if let Err(e) = result {
            first_error.get_or_insert(e);
        }
    };

    if let Some(negative) = fields.get("negative_prompt") {
        request.negative_prompt = negative.clone();
    }
    if let Some(id) = fields.get("stable_model_id").filter(|id| !id.is_empty()) {
        request.stable_model_id = id.clone();
    }
    if let Some(id) = fields.get("depth_model_id").filter(|id| !id.is_empty()) {
        request.depth_model_id = id.clone();
    }
    if let Some(name) = fields.get("scheduler").filter(|name| !name.is_empty()) {
        keep(
            name.parse::<SchedulerKind>()
                .map(|scheduler| request.scheduler = scheduler)
                .map_err(|e| ApiError::bad_request(e.to_string())),
        );
    }
    keep(
        number(fields, "guidance_scale", request.guidance_scale)
            .map(|v| request.guidance_scale = v),
    );
    keep(number(fields, "steps", request.steps).map(|v| request.steps = v));
    keep(number(fields, "num_images", request.num_images).map(|v| request.num_images = v));
    keep(number(fields, "seed", request.seed).map(|v| request.seed = v));
    (request, first_error)
}

/// Maps submitted form fields onto a request. The image path is filled in later.
pub fn parse_form(fields: &HashMap<String, String>) -> Result<GenerationRequest, ApiError> {
    let (request, field_error) = request_from_fields(fields);
    if let Some(e) = field_error {
        return Err(e);
    }
    validate(&request)?;
    Ok(request)
}

fn error_page(request: &GenerationRequest, e: ApiError) -> Response {
    let status = e.status();
    if let ApiError::Internal(err) = &e {
        tracing::error!("Generation failed: {err:?}");
    }
    let message = format!(r#"<p class="error">{}</p>"#, escape_html(&e.message()));
    (status, Html(render_page(request, Some(&message)))).into_response()
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn select(name: &str, options: &[&str], selected: &str) -> String {
    let mut html = format!(r#"<select name="{name}" id="{name}">"#);
    for option in options {
        let attr = if *option == selected { " selected" } else { "" };
        let option = escape_html(option);
        let _ = write!(html, r#"<option value="{option}"{attr}>{option}</option>"#);
    }
    html.push_str("</select>");
    html
}

fn slider(name: &str, min: &str, max: &str, step: &str, value: &str) -> String {
    format!(
        r#"<input type="range" name="{name}" id="{name}" min="{min}" max="{max}" step="{step}" value="{value}" oninput="this.nextElementSibling.value = this.value"><output>{value}</output>"#
    )
}

/// Two-column gallery of base64 PNGs.
pub fn render_gallery(seed: u64, images: &[String]) -> String {
    let mut html = format!(r#"<p class="seed">Seed: {seed}</p><div class="gallery">"#);
    for (i, image) in images.iter().enumerate() {
        let _ = write!(
            html,
            r#"<img src="data:image/png;base64,{image}" alt="output {}">"#,
            i + 1
        );
    }
    html.push_str("</div>");
    html
}

pub fn render_page(request: &GenerationRequest, result: Option<&str>) -> String {
    let schedulers: Vec<String> = SchedulerKind::ALL.iter().map(|s| s.to_string()).collect();
    let schedulers: Vec<&str> = schedulers.iter().map(String::as_str).collect();
    let scheduler = request.scheduler.to_string();

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Depth ControlNet</title>
<style>
body {{ font-family: sans-serif; max-width: 960px; margin: 2em auto; }}
label {{ display: block; margin-top: 0.8em; font-weight: bold; }}
textarea, select {{ width: 100%; }}
.gallery {{ display: grid; grid-template-columns: repeat(2, 1fr); gap: 8px; }}
.gallery img {{ width: 100%; }}
.error {{ color: #b00; }}
</style>
</head>
<body>
<h1>Depth ControlNet</h1>
<form method="post" action="/generate" enctype="multipart/form-data">
<label for="image">Input image</label>
<input type="file" name="image" id="image" accept="image/*" required>
<label for="prompt">Prompt</label>
<textarea name="prompt" id="prompt" rows="2">{prompt}</textarea>
<label for="negative_prompt">Negative prompt</label>
<textarea name="negative_prompt" id="negative_prompt" rows="2">{negative}</textarea>
<label for="stable_model_id">Stable model</label>
{stable}
<label for="depth_model_id">ControlNet depth model</label>
{depth}
<label for="guidance_scale">Guidance scale</label>
{guidance}
<label for="steps">Steps</label>
{steps}
<label for="num_images">Number of images</label>
{num_images}
<label for="scheduler">Scheduler</label>
{scheduler}
<label for="seed">Seed (0 for random)</label>
<input type="number" name="seed" id="seed" min="0" max="{max_seed}" step="1" value="{seed}">
<p><button type="submit">Generate</button></p>
</form>
{result}
</body>
</html>
"#,
        prompt = escape_html(&request.prompt),
        negative = escape_html(&request.negative_prompt),
        stable = select("stable_model_id", STABLE_MODEL_LIST, &request.stable_model_id),
        depth = select("depth_model_id", CONTROLNET_DEPTH_MODEL_LIST, &request.depth_model_id),
        guidance = slider("guidance_scale", "0.1", "15", "0.1", &request.guidance_scale.to_string()),
        steps = slider("steps", "1", "100", "1", &request.steps.to_string()),
        num_images = slider("num_images", "1", "10", "1", &request.num_images.to_string()),
        scheduler = select("scheduler", &schedulers, &scheduler),
        max_seed = MAX_SEED,
        seed = request.seed,
        result = result.unwrap_or(""),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn form_fields_parse_into_request() {
        let request = parse_form(&fields(&[
            ("prompt", "a castle"),
            ("negative_prompt", "blurry"),
            ("stable_model_id", STABLE_MODEL_LIST[2]),
            ("depth_model_id", CONTROLNET_DEPTH_MODEL_LIST[1]),
            ("guidance_scale", "3.5"),
            ("steps", "20"),
            ("num_images", "4"),
            ("scheduler", "EulerA"),
            ("seed", "77"),
        ]))
        .unwrap();
        assert_eq!(request.prompt, "a castle");
        assert_eq!(request.negative_prompt, "blurry");
        assert_eq!(request.stable_model_id, STABLE_MODEL_LIST[2]);
        assert_eq!(request.depth_model_id, CONTROLNET_DEPTH_MODEL_LIST[1]);
        assert_eq!(request.guidance_scale, 3.5);
        assert_eq!(request.steps, 20);
        assert_eq!(request.num_images, 4);
        assert_eq!(request.scheduler, SchedulerKind::EulerAncestral);
        assert_eq!(request.seed, 77);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let request = parse_form(&fields(&[("prompt", "a lake"), ("seed", "")])).unwrap();
        assert_eq!(request, GenerationRequest::new("", "a lake"));
    }

    #[test]
    fn bad_values_are_bad_requests() {
        for pairs in [
            &[("prompt", "x"), ("steps", "many")][..],
            &[("prompt", "x"), ("steps", "0")][..],
            &[("prompt", "x"), ("guidance_scale", "20")][..],
            &[("prompt", "x"), ("num_images", "11")][..],
            &[("prompt", "x"), ("scheduler", "PNDM")][..],
            &[("prompt", "")][..],
        ] {
            let err = parse_form(&fields(pairs)).unwrap_err();
            assert_eq!(err.status(), StatusCode::BAD_REQUEST, "{pairs:?}");
        }
    }

    #[test]
    fn bad_field_keeps_the_rest_of_the_submission() {
        let (request, error) = request_from_fields(&fields(&[
            ("prompt", "a red barn"),
            ("negative_prompt", "fog"),
            ("steps", "many"),
            ("seed", "31"),
            ("scheduler", "UniPC"),
        ]));
        assert_eq!(error.map(|e| e.status()), Some(StatusCode::BAD_REQUEST));
        assert_eq!(request.prompt, "a red barn");
        assert_eq!(request.negative_prompt, "fog");
        assert_eq!(request.steps, relief_core::DEFAULT_STEPS);
        assert_eq!(request.seed, 31);
        assert_eq!(request.scheduler, SchedulerKind::UniPc);
    }

    #[test]
    fn page_keeps_selection_and_escapes_prompt() {
        let mut request = GenerationRequest::new("", "<b>tall</b> & \"thin\"");
        request.scheduler = SchedulerKind::UniPc;
        let page = render_page(&request, None);
        assert!(page.contains("&lt;b&gt;tall&lt;/b&gt; &amp; &quot;thin&quot;"));
        assert!(page.contains(r#"<option value="UniPC" selected>"#));
        assert!(page.contains(r#"max="1000000""#));
        assert!(!page.contains("<b>tall</b>"));
    }

    #[test]
    fn gallery_has_one_image_per_output() {
        let images = vec!["AAA".to_string(), "BBB".to_string(), "CCC".to_string()];
        let html = render_gallery(9, &images);
        assert_eq!(html.matches("<img ").count(), 3);
        assert!(html.contains("Seed: 9"));
        assert!(html.contains("data:image/png;base64,BBB"));
    }
}
