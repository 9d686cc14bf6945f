use crate::config::EnrollmentConfig;
use crate::error::VoiceError;
use echome_http::RetryingClient;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
struct EnrollmentRequest<'a> {
    model: &'a str,
    input: EnrollmentInput<'a>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum EnrollmentInput<'a> {
    CreateVoice {
        target_model: &'a str,
        prefix: &'a str,
        url: &'a str,
    },
    QueryVoice {
        voice_id: &'a str,
    },
}

#[derive(Debug, Default, Deserialize)]
struct EnrollmentResponse {
    #[serde(default)]
    output: EnrollmentOutput,
}

#[derive(Debug, Default, Deserialize)]
struct EnrollmentOutput {
    #[serde(default)]
    voice_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// Client for the voice-cloning endpoint.
pub struct VoiceEnrollment {
    http: RetryingClient,
    config: EnrollmentConfig,
    api_key: String,
}

impl VoiceEnrollment {
    pub fn new(http: RetryingClient, config: EnrollmentConfig, api_key: impl Into<String>) -> Self {
        Self {
            http,
            config,
            api_key: api_key.into(),
        }
    }

    /// Clones the voice in the sample at `audio_url` and returns its id.
    pub async fn create_voice(&self, audio_url: &str) -> Result<String, VoiceError> {
        if audio_url.trim().is_empty() {
            return Err(VoiceError::Enrollment("audio url is empty".into()));
        }
        let response = self
            .call(EnrollmentInput::CreateVoice {
                target_model: &self.config.target_model,
                prefix: &self.config.prefix,
                url: audio_url,
            })
            .await?;

        let voice_id = response
            .output
            .voice_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| VoiceError::Enrollment("response carried no voice_id".into()))?;
        tracing::info!(%voice_id, "voice enrolled");
        Ok(voice_id)
    }

    /// Returns true once the cloned voice is ready for synthesis.
    pub async fn query_voice(&self, voice_id: &str) -> Result<bool, VoiceError> {
        if voice_id.trim().is_empty() {
            return Err(VoiceError::Enrollment("voice id is empty".into()));
        }
        let response = self.call(EnrollmentInput::QueryVoice { voice_id }).await?;
        Ok(response.output.status.as_deref() == Some("OK"))
    }

    async fn call(&self, input: EnrollmentInput<'_>) -> Result<EnrollmentResponse, VoiceError> {
        let body = EnrollmentRequest {
            model: &self.config.model,
            input,
        };
        let request = self
            .http
            .inner()
            .post(&self.config.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .build()?;

        let response = self.http.execute(request).await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(VoiceError::Enrollment(format!("status {}: {}", status, text)));
        }
        serde_json::from_str(&text)
            .map_err(|e| VoiceError::Enrollment(format!("invalid response: {}: {}", e, text)))
    }
}
