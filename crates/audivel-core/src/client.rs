use async_trait::async_trait;

use crate::error::ClientError;
use crate::types::{ConversionRequest, JobId};

/// What one status fetch returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStatus {
    pub raw_status: String,
    pub audio_url: Option<String>,
}

impl RemoteStatus {
    pub fn new(raw_status: impl Into<String>) -> Self {
        Self {
            raw_status: raw_status.into(),
            audio_url: None,
        }
    }

    pub fn with_audio_url(mut self, url: impl Into<String>) -> Self {
        self.audio_url = Some(url.into());
        self
    }
}

/// Remote conversion service.  Implementations may be slow or flaky; the job
/// controller takes care of timeouts and retries.
#[async_trait]
pub trait RemoteConversionClient: Send + Sync + 'static {
    async fn create(&self, request: &ConversionRequest) -> Result<JobId, ClientError>;

    async fn status(&self, id: &JobId) -> Result<RemoteStatus, ClientError>;

    async fn cancel(&self, id: &JobId) -> Result<(), ClientError>;

    /// False when the client was built without usable API credentials.
    fn has_credentials(&self) -> bool {
        true
    }
}
