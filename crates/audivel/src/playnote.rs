//! Play.ht PlayNote client: document in, two-voice narration out.

use anyhow::Context;
use async_trait::async_trait;
use audivel_core::config::PlayHtConfig;
use audivel_core::{
    ClientError, ConversionRequest, JobId, RemoteConversionClient, RemoteStatus, SourceRef,
};
use reqwest::multipart::{Form, Part};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// PlayNote resource as returned by create / get.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayNote {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub audio_url: Option<String>,
}

/// Error body; the service is not consistent about the field name.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error_message: Option<String>,
    message: Option<String>,
    error: Option<String>,
}

pub struct PlayNoteClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: String,
    user_id: String,
}

impl PlayNoteClient {
    pub fn new(config: &PlayHtConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("audivel/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        let base_url = Url::parse(config.base_url.trim_end_matches('/'))
            .with_context(|| format!("Invalid PlayNote base URL: {}", config.base_url))?;
        Ok(Self {
            http,
            base_url,
            api_key: config.api_key.trim().to_string(),
            user_id: config.user_id.trim().to_string(),
        })
    }

    /// `<base>/playnotes[/<id>]`, with the id percent-encoded.
    fn endpoint(&self, id: Option<&JobId>) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ClientError::Rejected("base URL cannot have a path".into()))?;
            segments.pop_if_empty().push("playnotes");
            if let Some(id) = id {
                segments.push(&id.0);
            }
        }
        Ok(url)
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("AUTHORIZATION", &self.api_key)
            .header("X-USER-ID", &self.user_id)
            .header("Accept", "application/json")
    }

    async fn build_form(&self, request: &ConversionRequest) -> Result<Form, ClientError> {
        let mut form = match request.source() {
            SourceRef::Url(url) => Form::new().text("sourceFileUrl", url.clone()),
            SourceRef::File(path) => {
                let bytes = tokio::fs::read(path)
                    .await
                    .map_err(|e| ClientError::Rejected(format!("{}: {}", path.display(), e)))?;
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "document.pdf".to_string());
                let part = Part::bytes(bytes)
                    .file_name(file_name)
                    .mime_str("application/pdf")
                    .map_err(|e| ClientError::Rejected(e.to_string()))?;
                Form::new().part("sourceFile", part)
            }
        };
        form = form
            .text("synthesisStyle", request.style().as_str())
            .text("voice1", request.voice_1().as_str().to_string())
            .text("voice1Name", request.voice_1().display_name().to_string())
            .text("voice2", request.voice_2().as_str().to_string())
            .text("voice2Name", request.voice_2().display_name().to_string());
        Ok(form)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, ClientError> {
        let response = self
            .authorized(req)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify(status, &body))
    }

    async fn read_note(response: reqwest::Response) -> Result<PlayNote, ClientError> {
        response
            .json::<PlayNote>()
            .await
            .map_err(|e| ClientError::Transport(format!("unreadable PlayNote response: {}", e)))
    }
}

/// Server trouble and throttling are worth retrying; other refusals are not.
fn classify(status: StatusCode, body: &str) -> ClientError {
    let detail = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.error_message.or(b.message).or(b.error))
        .unwrap_or_else(|| body.trim().chars().take(200).collect());
    let message = if detail.is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("HTTP {}: {}", status, detail)
    };
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        ClientError::Transport(message)
    } else {
        ClientError::Rejected(message)
    }
}

#[async_trait]
impl RemoteConversionClient for PlayNoteClient {
    async fn create(&self, request: &ConversionRequest) -> Result<JobId, ClientError> {
        let form = self.build_form(request).await?;
        let url = self.endpoint(None)?;
        debug!("playnote: POST {}", url);
        let response = self.send(self.http.post(url).multipart(form)).await?;
        let note = Self::read_note(response).await?;
        debug!("playnote: created {} ({:?})", note.id, note.status);
        Ok(JobId(note.id))
    }

    async fn status(&self, id: &JobId) -> Result<RemoteStatus, ClientError> {
        let url = self.endpoint(Some(id))?;
        let response = self.send(self.http.get(url)).await?;
        let note = Self::read_note(response).await?;
        Ok(RemoteStatus {
            raw_status: note.status.unwrap_or_default(),
            audio_url: note.audio_url.filter(|u| !u.trim().is_empty()),
        })
    }

    async fn cancel(&self, id: &JobId) -> Result<(), ClientError> {
        let url = self.endpoint(Some(id))?;
        debug!("playnote: DELETE {}", url);
        self.send(self.http.delete(url)).await?;
        Ok(())
    }

    fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.user_id.is_empty()
    }
}
