use crate::error::{Error, Result};
use crate::models::{
    PredictionItem, PredictionSet, RemedyRequest, RemedyResponse, RemoteIdentifyResponse,
};
use crate::preprocess::SourceImage;
use std::cmp::Ordering;
use std::time::Duration;

pub const DEFAULT_SERVICE_URL: &str = "http://localhost:8000";

const IDENTIFY_PATH: &str = "/api/identify";
const REMEDY_PATH: &str = "/api/remedy";
const UPLOAD_FIELD: &str = "file";
const FALLBACK_FILE_NAME: &str = "upload.png";

#[derive(Debug, Clone)]
pub struct RemoteClient {
    base_url: String,
    client: reqwest::Client,
}

impl RemoteClient {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url: url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Uploads the image and returns the service's top `k` predictions.
    pub async fn identify_remote(&self, image: &SourceImage, k: usize) -> Result<PredictionSet> {
        let url = format!("{}{}", self.base_url, IDENTIFY_PATH);
        let bytes = image.upload_bytes()?;
        let file_name = image.file_name().unwrap_or(FALLBACK_FILE_NAME).to_string();
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        let form = reqwest::multipart::Form::new().part(UPLOAD_FIELD, part);

        log::info!("Sending image to {url}");
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(request_failed)?;
        let body: RemoteIdentifyResponse = read_json(response).await?;

        if body.success != Some(true) {
            let reason = body
                .error
                .unwrap_or_else(|| "service did not report success".to_string());
            log::warn!("Service rejected identification: {reason}");
            return Err(Error::ServiceRejected(reason));
        }
        if let Some(class) = &body.predicted_class {
            log::debug!("Service predicted {class}");
        }

        let mut items: Vec<PredictionItem> = body
            .predictions
            .into_iter()
            .map(|p| PredictionItem {
                label: p.label,
                score: (p.score * 10000.0).round() / 10000.0,
            })
            .collect();
        items.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        items.truncate(k);
        Ok(PredictionSet::from_sorted(items))
    }

    pub async fn request_remedy(&self, symptoms: &str) -> Result<String> {
        let url = format!("{}{}", self.base_url, REMEDY_PATH);
        let req = RemedyRequest {
            symptoms: symptoms.to_string(),
        };
        let response = self
            .client
            .post(&url)
            .json(&req)
            .send()
            .await
            .map_err(request_failed)?;
        let body: RemedyResponse = read_json(response).await?;
        Ok(body.response)
    }
}

fn request_failed(err: reqwest::Error) -> Error {
    log::warn!("Could not reach the service: {err}");
    Error::Transport(format!("Request failed: {err}"))
}

async fn read_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        log::warn!("Service answered HTTP {status}: {detail}");
        return Err(Error::Transport(format!("HTTP {status}")));
    }
    response
        .json()
        .await
        .map_err(|e| Error::Transport(format!("Invalid response: {e}")))
}
