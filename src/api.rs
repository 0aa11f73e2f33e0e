use bytes::{BufMut, BytesMut};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capabilities::{HttpError, HttpRequest, HttpResponse, ValidatedUrl};
use crate::session::{ImageBlob, UserProfile};
use crate::vitals::PatientVitals;
use crate::{
    AnalysisData, AnalysisSource, ImageId, Severity, ANALYZE_TIMEOUT, AUTH_TIMEOUT,
    MAX_IMAGE_BYTES, PROBE_TIMEOUT,
};

pub const DEFAULT_API_URL: &str = "http://localhost:8000/api";

// Trailing slashes follow the backend's routing table exactly; the scan
// endpoints are registered without them.
pub const HEALTH_PATH: &str = "/health/";
pub const UPLOAD_SCAN_PATH: &str = "/upload-scan";
pub const ANALYZE_VITALS_PATH: &str = "/analyze-vitals";
pub const LOGIN_PATH: &str = "/auth/login/";
pub const SIGNUP_PATH: &str = "/auth/signup/";
pub const REFRESH_PATH: &str = "/auth/token/refresh/";
pub const PROFILE_PATH: &str = "/auth/profile/";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    #[error("image rejected: {reason}")]
    InvalidImage { reason: String },

    #[error("unsupported image format, only PNG and JPEG are accepted")]
    UnsupportedImageFormat,

    #[error("image too large: {size} bytes exceeds maximum of {max} bytes")]
    ImageTooLarge { size: usize, max: usize },

    #[error("malformed analysis payload: {message}")]
    MalformedResponse { message: String },

    #[error(transparent)]
    Http(#[from] HttpError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SniffedImage {
    pub mime: &'static str,
    pub extension: &'static str,
}

/// Checks magic bytes and size before anything leaves the device. The
/// backend validates again; this keeps obviously wrong files off the wire.
pub fn sniff_image(bytes: &[u8]) -> Result<SniffedImage, ApiError> {
    if bytes.is_empty() {
        return Err(ApiError::InvalidImage {
            reason: "image is empty".to_string(),
        });
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(ApiError::ImageTooLarge {
            size: bytes.len(),
            max: MAX_IMAGE_BYTES,
        });
    }

    let format = image::guess_format(bytes).map_err(|_| ApiError::UnsupportedImageFormat)?;
    match format {
        image::ImageFormat::Png => Ok(SniffedImage {
            mime: "image/png",
            extension: "png",
        }),
        image::ImageFormat::Jpeg => Ok(SniffedImage {
            mime: "image/jpeg",
            extension: "jpg",
        }),
        _ => Err(ApiError::UnsupportedImageFormat),
    }
}

pub fn image_blob(bytes: Vec<u8>) -> Result<ImageBlob, ApiError> {
    let sniffed = sniff_image(&bytes)?;
    Ok(ImageBlob {
        bytes,
        mime: sniffed.mime.to_string(),
    })
}

fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" => "jpg",
        _ => "png",
    }
}

pub struct MultipartForm {
    boundary: String,
    body: BytesMut,
}

impl MultipartForm {
    pub fn new() -> Self {
        let mut seed = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut seed);
        Self {
            boundary: format!("----cdss-{}", hex::encode(seed)),
            body: BytesMut::new(),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn text(&mut self, name: &str, value: &str) {
        self.body
            .put_slice(format!("--{}\r\n", self.boundary).as_bytes());
        self.body.put_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
        );
        self.body.put_slice(value.as_bytes());
        self.body.put_slice(b"\r\n");
    }

    pub fn file(&mut self, name: &str, filename: &str, mime: &str, bytes: &[u8]) {
        self.body
            .put_slice(format!("--{}\r\n", self.boundary).as_bytes());
        self.body.put_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n")
                .as_bytes(),
        );
        self.body
            .put_slice(format!("Content-Type: {mime}\r\n\r\n").as_bytes());
        self.body.put_slice(bytes);
        self.body.put_slice(b"\r\n");
    }

    pub fn finish(mut self) -> (String, Vec<u8>) {
        self.body
            .put_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        let content_type = format!("multipart/form-data; boundary={}", self.boundary);
        (content_type, self.body.freeze().to_vec())
    }
}

impl Default for MultipartForm {
    fn default() -> Self {
        Self::new()
    }
}

/// Form fields for the vitals the patient actually supplied, stringified
/// the way the backend's form parser expects them.
pub fn vitals_form_fields(vitals: &PatientVitals) -> Vec<(&'static str, String)> {
    let mut fields = Vec::new();

    if let Some(birthdate) = vitals.birthdate {
        fields.push(("birthdate", birthdate.format("%Y-%m-%d").to_string()));
    }
    if let Some(gender) = vitals.gender {
        fields.push(("gender", gender.as_str().to_string()));
    }
    if let Some(systolic) = vitals.systolic_bp {
        fields.push(("systolicBP", format!("{systolic}")));
    }
    if let Some(diastolic) = vitals.diastolic_bp {
        fields.push(("diastolicBP", format!("{diastolic}")));
    }
    if let Some(temperature) = vitals.temperature {
        fields.push(("temperature", format!("{temperature}")));
    }
    if let Some(heart_rate) = vitals.heart_rate {
        fields.push(("heartRate", format!("{heart_rate}")));
    }
    if let Some(has_cough) = vitals.has_cough {
        fields.push(("hasCough", bool_field(has_cough)));
    }
    if let Some(has_headaches) = vitals.has_headaches {
        fields.push(("hasHeadaches", bool_field(has_headaches)));
    }
    if let Some(can_smell_taste) = vitals.can_smell_taste {
        fields.push(("canSmellTaste", bool_field(can_smell_taste)));
    }

    fields
}

fn bool_field(value: bool) -> String {
    if value { "true" } else { "false" }.to_string()
}

#[derive(Debug, Clone, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignupRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub access: String,
    pub refresh: String,
    #[serde(default)]
    pub user: Option<UserProfile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshResponse {
    pub access: String,
    #[serde(default)]
    pub refresh: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeVitalsRequest {
    pub image_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birthdate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(rename = "systolicBP", skip_serializing_if = "Option::is_none")]
    pub systolic_bp: Option<f64>,
    #[serde(rename = "diastolicBP", skip_serializing_if = "Option::is_none")]
    pub diastolic_bp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heart_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_cough: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_headaches: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_smell_taste: Option<bool>,
}

impl AnalyzeVitalsRequest {
    pub fn new(image_id: &ImageId, vitals: &PatientVitals) -> Self {
        Self {
            image_id: image_id.as_str().to_string(),
            birthdate: vitals.birthdate.map(|d| d.format("%Y-%m-%d").to_string()),
            gender: vitals.gender.map(|g| g.as_str().to_string()),
            systolic_bp: vitals.systolic_bp,
            diastolic_bp: vitals.diastolic_bp,
            temperature: vitals.temperature,
            heart_rate: vitals.heart_rate,
            has_cough: vitals.has_cough,
            has_headaches: vitals.has_headaches,
            can_smell_taste: vitals.can_smell_taste,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalysisResponse {
    predictions: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    heatmap_url: Option<String>,
    #[serde(default)]
    diagnosis_with_vitals: Option<String>,
    #[serde(default)]
    image_id: Option<String>,
}

/// Reinterprets a successful analysis response. The server's own idea of
/// the top prediction is ignored; probabilities are clamped into [0, 1]
/// and the winner recomputed so a buggy payload cannot smuggle in an
/// inconsistent result.
pub fn parse_analysis_response(
    response: &HttpResponse,
    now_ms: u64,
) -> Result<AnalysisData, ApiError> {
    let wire: AnalysisResponse = response.json()?;

    let predictions: Vec<crate::Prediction> = wire
        .predictions
        .iter()
        .filter_map(|(label, value)| {
            let Some(probability) = value.as_f64() else {
                tracing::warn!(label = label.as_str(), "dropping non-numeric prediction");
                return None;
            };
            Some(crate::Prediction {
                label: label.clone(),
                probability,
            })
        })
        .collect();

    let severity = match wire.severity.as_deref() {
        None => Severity::Moderate,
        Some(raw) => Severity::parse(raw).unwrap_or_else(|| {
            tracing::warn!(severity = raw, "unknown severity in response, assuming moderate");
            Severity::Moderate
        }),
    };

    AnalysisData::from_predictions(
        wire.image_id.map(ImageId::new),
        predictions,
        severity,
        wire.heatmap_url,
        wire.diagnosis_with_vitals,
        AnalysisSource::Server,
        now_ms,
    )
    .ok_or_else(|| ApiError::MalformedResponse {
        message: "response carries no numeric predictions".to_string(),
    })
}

/// First usable message out of a DRF-style error body: `detail`, then
/// `non_field_errors`, then the first per-field error list.
pub fn extract_error_message(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;

    if let Some(detail) = value.get("detail").and_then(|v| v.as_str()) {
        return Some(detail.to_string());
    }

    if let Some(first) = value
        .get("non_field_errors")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .and_then(|v| v.as_str())
    {
        return Some(first.to_string());
    }

    if let Some(object) = value.as_object() {
        for (field, errors) in object {
            if let Some(first) = errors
                .as_array()
                .and_then(|a| a.first())
                .and_then(|v| v.as_str())
            {
                return Some(format!("{field}: {first}"));
            }
            if let Some(message) = errors.as_str() {
                return Some(format!("{field}: {message}"));
            }
        }
    }

    None
}

/// Builds every request the core sends. Owns the base URL; paths and
/// timeouts are fixed per endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiClient {
    base: ValidatedUrl,
}

impl ApiClient {
    pub fn new(base: ValidatedUrl) -> Self {
        Self { base }
    }

    pub fn base(&self) -> &ValidatedUrl {
        &self.base
    }

    pub fn health_request(&self) -> Result<HttpRequest, ApiError> {
        let url = self.base.join(HEALTH_PATH)?;
        let request = HttpRequest::get(url.as_str().to_string())?
            .with_header("Cache-Control", "no-cache")?
            .with_timeout(PROBE_TIMEOUT)?;
        Ok(request)
    }

    pub fn login_request(&self, username: &str, password: &str) -> Result<HttpRequest, ApiError> {
        let url = self.base.join(LOGIN_PATH)?;
        let request = HttpRequest::post(url.as_str().to_string())?
            .with_json(&LoginRequest { username, password })?
            .with_timeout(AUTH_TIMEOUT)?;
        Ok(request)
    }

    pub fn signup_request(&self, signup: &SignupRequest) -> Result<HttpRequest, ApiError> {
        let url = self.base.join(SIGNUP_PATH)?;
        let request = HttpRequest::post(url.as_str().to_string())?
            .with_json(signup)?
            .with_timeout(AUTH_TIMEOUT)?;
        Ok(request)
    }

    pub fn refresh_request(&self, refresh_token: &str) -> Result<HttpRequest, ApiError> {
        let url = self.base.join(REFRESH_PATH)?;
        let request = HttpRequest::post(url.as_str().to_string())?
            .with_json(&RefreshRequest {
                refresh: refresh_token,
            })?
            .with_timeout(AUTH_TIMEOUT)?;
        Ok(request)
    }

    pub fn profile_request(&self, access_token: &str) -> Result<HttpRequest, ApiError> {
        let url = self.base.join(PROFILE_PATH)?;
        let request = HttpRequest::get(url.as_str().to_string())?
            .with_bearer(access_token)?
            .with_timeout(AUTH_TIMEOUT)?;
        Ok(request)
    }

    pub fn upload_scan_request(
        &self,
        access_token: &str,
        image: &ImageBlob,
        vitals: Option<&PatientVitals>,
    ) -> Result<HttpRequest, ApiError> {
        let url = self.base.join(UPLOAD_SCAN_PATH)?;

        let mut form = MultipartForm::new();
        let filename = format!("scan.{}", extension_for_mime(&image.mime));
        form.file("image", &filename, &image.mime, &image.bytes);
        if let Some(vitals) = vitals {
            for (name, value) in vitals_form_fields(vitals) {
                form.text(name, &value);
            }
        }
        let (content_type, body) = form.finish();

        let request = HttpRequest::post(url.as_str().to_string())?
            .with_bearer(access_token)?
            .with_body(body, content_type)?
            .with_timeout(ANALYZE_TIMEOUT)?;
        Ok(request)
    }

    pub fn analyze_vitals_request(
        &self,
        access_token: &str,
        image_id: &ImageId,
        vitals: &PatientVitals,
    ) -> Result<HttpRequest, ApiError> {
        let url = self.base.join(ANALYZE_VITALS_PATH)?;
        let request = HttpRequest::post(url.as_str().to_string())?
            .with_bearer(access_token)?
            .with_json(&AnalyzeVitalsRequest::new(image_id, vitals))?
            .with_timeout(ANALYZE_TIMEOUT)?;
        Ok(request)
    }
}
