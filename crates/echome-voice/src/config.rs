use serde::Deserialize;
use std::time::Duration;

fn default_inference_url() -> String {
    "wss://dashscope.aliyuncs.com/api-ws/v1/inference".to_string()
}

fn default_realtime_url() -> String {
    "wss://dashscope.aliyuncs.com/api-ws/v1/realtime".to_string()
}

fn default_asr_model() -> String {
    "paraformer-realtime-v2".to_string()
}

fn default_pcm() -> String {
    "pcm".to_string()
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_language_hints() -> Vec<String> {
    vec!["zh".to_string(), "en".to_string()]
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_write_timeout_secs() -> u64 {
    5
}

fn default_asr_idle_timeout_secs() -> u64 {
    15
}

fn default_finish_timeout_secs() -> u64 {
    10
}

fn default_asr_ping_interval_secs() -> u64 {
    5
}

/// Streaming recognition settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AsrConfig {
    #[serde(default = "default_inference_url")]
    pub url: String,

    #[serde(default = "default_asr_model")]
    pub model: String,

    #[serde(default = "default_pcm")]
    pub format: String,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_language_hints")]
    pub language_hints: Vec<String>,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,

    /// Longest silence tolerated from the upstream while audio is flowing.
    #[serde(default = "default_asr_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// How long to wait for `task-finished` after sending `finish-task`.
    #[serde(default = "default_finish_timeout_secs")]
    pub finish_timeout_secs: u64,

    /// Keepalive pings; pongs count as upstream activity, so this must stay
    /// well below `idle_timeout_secs`.
    #[serde(default = "default_asr_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            url: default_inference_url(),
            model: default_asr_model(),
            format: default_pcm(),
            sample_rate: default_sample_rate(),
            language_hints: default_language_hints(),
            connect_timeout_secs: default_connect_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            idle_timeout_secs: default_asr_idle_timeout_secs(),
            finish_timeout_secs: default_finish_timeout_secs(),
            ping_interval_secs: default_asr_ping_interval_secs(),
        }
    }
}

impl AsrConfig {
    pub(crate) fn timeouts(&self) -> SocketTimeouts {
        SocketTimeouts {
            connect: Duration::from_secs(self.connect_timeout_secs),
            write: Duration::from_secs(self.write_timeout_secs),
            idle: Duration::from_secs(self.idle_timeout_secs),
            finish: Duration::from_secs(self.finish_timeout_secs),
            ping: Duration::from_secs(self.ping_interval_secs.max(1)),
        }
    }
}

/// How a synthesis session is negotiated with the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TtsProtocol {
    /// Duplex inference socket: `run-task`, `continue-task`*, `finish-task`.
    RunTask,
    /// Realtime socket: `session.update` must be acknowledged before text.
    SessionUpdate,
}

/// One synthesis voice and the protocol its model speaks.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TtsProfile {
    pub model: String,
    pub voice: String,
    #[serde(default = "default_pcm")]
    pub format: String,
    #[serde(default)]
    pub sample_rate: Option<u32>,
    pub protocol: TtsProtocol,
    /// Realtime commit mode: `server_commit` or `commit`.
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub language_hints: Vec<String>,
}

fn default_mode() -> String {
    "server_commit".to_string()
}

impl TtsProfile {
    pub fn default_realtime() -> Self {
        Self {
            model: "qwen3-tts-flash-realtime".to_string(),
            voice: "Katerina".to_string(),
            format: default_pcm(),
            sample_rate: None,
            protocol: TtsProtocol::SessionUpdate,
            mode: default_mode(),
            language_hints: Vec::new(),
        }
    }

    pub fn default_cloned() -> Self {
        Self {
            model: "cosyvoice-v2".to_string(),
            voice: "longxiaochun_v2".to_string(),
            format: default_pcm(),
            sample_rate: None,
            protocol: TtsProtocol::RunTask,
            mode: default_mode(),
            language_hints: Vec::new(),
        }
    }

    /// Same profile speaking with another voice.
    pub fn with_voice(&self, voice: impl Into<String>) -> Self {
        Self {
            voice: voice.into(),
            ..self.clone()
        }
    }

    pub(crate) fn commits_manually(&self) -> bool {
        self.mode == "commit"
    }
}

fn default_tts_idle_timeout_secs() -> u64 {
    60
}

fn default_tts_ping_interval_secs() -> u64 {
    30
}

fn default_start_timeout_secs() -> u64 {
    10
}

/// Streaming synthesis settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TtsConfig {
    /// Socket for [`TtsProtocol::RunTask`] profiles.
    #[serde(default = "default_inference_url")]
    pub inference_url: String,

    /// Socket for [`TtsProtocol::SessionUpdate`] profiles; `?model=` is appended.
    #[serde(default = "default_realtime_url")]
    pub realtime_url: String,

    /// Voice used for characters without a usable cloned voice.
    #[serde(default = "TtsProfile::default_realtime")]
    pub default: TtsProfile,

    /// Model used for cloned voices; its `voice` is replaced per character.
    #[serde(default = "TtsProfile::default_cloned")]
    pub cloned: TtsProfile,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,

    /// Bound on the start acknowledgement.
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,

    /// Longest silence tolerated from the upstream while synthesizing.
    #[serde(default = "default_tts_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_tts_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            inference_url: default_inference_url(),
            realtime_url: default_realtime_url(),
            default: TtsProfile::default_realtime(),
            cloned: TtsProfile::default_cloned(),
            connect_timeout_secs: default_connect_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            start_timeout_secs: default_start_timeout_secs(),
            idle_timeout_secs: default_tts_idle_timeout_secs(),
            ping_interval_secs: default_tts_ping_interval_secs(),
        }
    }
}

impl TtsConfig {
    /// Picks the profile for a character: its cloned voice on the cloned
    /// model when it has one, the default profile otherwise.
    pub fn select(&self, cloned_voice: Option<&str>) -> TtsProfile {
        match cloned_voice.map(str::trim).filter(|v| !v.is_empty()) {
            Some(voice) => self.cloned.with_voice(voice),
            None => self.default.clone(),
        }
    }

    pub(crate) fn timeouts(&self) -> SocketTimeouts {
        SocketTimeouts {
            connect: Duration::from_secs(self.connect_timeout_secs),
            write: Duration::from_secs(self.write_timeout_secs),
            idle: Duration::from_secs(self.idle_timeout_secs),
            finish: Duration::from_secs(self.idle_timeout_secs),
            ping: Duration::from_secs(self.ping_interval_secs.max(1)),
        }
    }

    pub(crate) fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }
}

fn default_enrollment_url() -> String {
    "https://dashscope.aliyuncs.com/api/v1/services/audio/tts/customization".to_string()
}

fn default_enrollment_model() -> String {
    "voice-enrollment".to_string()
}

fn default_target_model() -> String {
    "cosyvoice-v2".to_string()
}

fn default_prefix() -> String {
    "echome".to_string()
}

/// Voice cloning endpoint settings.
#[derive(Debug, Clone, Deserialize)]
pub struct EnrollmentConfig {
    #[serde(default = "default_enrollment_url")]
    pub url: String,
    #[serde(default = "default_enrollment_model")]
    pub model: String,
    #[serde(default = "default_target_model")]
    pub target_model: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            url: default_enrollment_url(),
            model: default_enrollment_model(),
            target_model: default_target_model(),
            prefix: default_prefix(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SocketTimeouts {
    pub connect: Duration,
    pub write: Duration,
    pub idle: Duration,
    pub finish: Duration,
    pub ping: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_cloned_profile_only_with_a_voice() {
        let config = TtsConfig::default();
        let cloned = config.select(Some(" echome-abc "));
        assert_eq!(cloned.model, "cosyvoice-v2");
        assert_eq!(cloned.voice, "echome-abc");
        assert_eq!(cloned.protocol, TtsProtocol::RunTask);

        assert_eq!(config.select(Some("   ")), config.default);
        assert_eq!(config.select(None).protocol, TtsProtocol::SessionUpdate);
    }

    #[test]
    fn default_keepalive_fires_before_the_idle_deadline() {
        let asr = AsrConfig::default().timeouts();
        assert!(asr.ping * 3 <= asr.idle, "{:?}", asr);

        let tts = TtsConfig::default().timeouts();
        assert!(tts.ping * 2 <= tts.idle, "{:?}", tts);
    }

    #[test]
    fn profile_protocol_is_kebab_case() {
        let profile: TtsProfile = serde_json::from_str(
            r#"{"model":"m","voice":"v","protocol":"session-update","mode":"commit"}"#,
        )
        .unwrap();
        assert_eq!(profile.protocol, TtsProtocol::SessionUpdate);
        assert!(profile.commits_manually());
        assert_eq!(profile.format, "pcm");
    }
}
