//! Upstream wire messages.
//!
//! Two families share the speech upstream:
//!
//! * duplex task messages on the inference socket, an envelope of
//!   `header` (`action` or `event`, `task_id`) and `payload`;
//! * realtime messages on the realtime socket, flat objects tagged by `type`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskAction {
    RunTask,
    ContinueTask,
    FinishTask,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandHeader {
    pub action: TaskAction,
    pub task_id: String,
    pub streaming: &'static str,
}

/// Model parameters of a `run-task` command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TaskParameters {
    Recognition {
        format: String,
        sample_rate: u32,
        language_hints: Vec<String>,
        heartbeat: bool,
    },
    Synthesis {
        text_type: &'static str,
        voice: String,
        format: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sample_rate: Option<u32>,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_group: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<TaskParameters>,
    pub input: TaskInput,
}

/// A command on the duplex inference socket.
#[derive(Debug, Clone, Serialize)]
pub struct TaskCommand {
    pub header: CommandHeader,
    pub payload: CommandPayload,
}

impl TaskCommand {
    fn new(action: TaskAction, task_id: &str, payload: CommandPayload) -> Self {
        Self {
            header: CommandHeader {
                action,
                task_id: task_id.to_string(),
                streaming: "duplex",
            },
            payload,
        }
    }

    pub fn recognition(task_id: &str, model: &str, parameters: TaskParameters) -> Self {
        Self::new(
            TaskAction::RunTask,
            task_id,
            CommandPayload {
                task_group: Some("audio"),
                task: Some("asr"),
                function: Some("recognition"),
                model: Some(model.to_string()),
                parameters: Some(parameters),
                input: TaskInput::default(),
            },
        )
    }

    /// `run-task` for synthesis. `text`, when given, is synthesized without
    /// any `continue-task`.
    pub fn synthesis(
        task_id: &str,
        model: &str,
        parameters: TaskParameters,
        text: Option<String>,
    ) -> Self {
        Self::new(
            TaskAction::RunTask,
            task_id,
            CommandPayload {
                task_group: Some("audio"),
                task: Some("tts"),
                function: Some("SpeechSynthesizer"),
                model: Some(model.to_string()),
                parameters: Some(parameters),
                input: TaskInput { text },
            },
        )
    }

    pub fn continue_task(task_id: &str, text: impl Into<String>) -> Self {
        Self::new(
            TaskAction::ContinueTask,
            task_id,
            CommandPayload {
                input: TaskInput {
                    text: Some(text.into()),
                },
                ..Default::default()
            },
        )
    }

    pub fn finish_task(task_id: &str) -> Self {
        Self::new(TaskAction::FinishTask, task_id, CommandPayload::default())
    }
}

/// Event header on the duplex inference socket, discriminated by `event`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum EventHeader {
    TaskStarted {
        #[serde(default)]
        task_id: String,
    },
    ResultGenerated {
        #[serde(default)]
        task_id: String,
    },
    TaskFinished {
        #[serde(default)]
        task_id: String,
    },
    TaskFailed {
        #[serde(default)]
        task_id: String,
        #[serde(default)]
        error_code: Option<String>,
        #[serde(default)]
        error_message: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventPayload {
    #[serde(default)]
    pub output: Option<EventOutput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventOutput {
    #[serde(default)]
    pub sentence: Option<Sentence>,
}

/// A recognized sentence, partial until `sentence_end`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Sentence {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub sentence_end: bool,
    /// Keep-alive results carry no speech.
    #[serde(default)]
    pub heartbeat: bool,
}

/// An event on the duplex inference socket.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskEvent {
    pub header: EventHeader,
    #[serde(default)]
    pub payload: EventPayload,
}

impl TaskEvent {
    pub fn sentence(&self) -> Option<&Sentence> {
        self.payload.output.as_ref()?.sentence.as_ref()
    }
}

/// `session` object of a realtime `session.update`.
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeSession {
    pub mode: String,
    pub voice: String,
    pub language_type: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub language_hints: Vec<String>,
    pub format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
}

/// A client command on the realtime socket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum RealtimeCommand {
    #[serde(rename = "session.update")]
    SessionUpdate {
        event_id: String,
        session: RealtimeSession,
    },
    #[serde(rename = "input_text_buffer.append")]
    AppendText { event_id: String, text: String },
    #[serde(rename = "input_text_buffer.commit")]
    Commit { event_id: String },
    #[serde(rename = "session.finish")]
    Finish { event_id: String },
}

pub(crate) fn event_id() -> String {
    format!("event_{}", uuid::Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RealtimeErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// A server event on the realtime socket, discriminated by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum RealtimeEvent {
    #[serde(rename = "session.created")]
    SessionCreated {},
    #[serde(rename = "session.updated")]
    SessionUpdated {},
    #[serde(rename = "response.audio.delta", alias = "response.audio")]
    AudioDelta {
        #[serde(default)]
        delta: Option<String>,
        #[serde(default)]
        audio: Option<String>,
        #[serde(default)]
        data: Option<String>,
    },
    #[serde(rename = "response.audio.done")]
    AudioDone {},
    #[serde(rename = "response.done")]
    ResponseDone {},
    #[serde(rename = "session.finished")]
    SessionFinished {},
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: Option<RealtimeErrorBody>,
    },
    #[serde(other)]
    Unknown,
}

impl RealtimeEvent {
    /// Decoded audio of an audio event, from whichever field carries it.
    pub fn audio(&self) -> Option<Result<Vec<u8>, base64::DecodeError>> {
        let Self::AudioDelta { delta, audio, data } = self else {
            return None;
        };
        [delta, audio, data]
            .into_iter()
            .flatten()
            .find(|s| !s.is_empty())
            .map(|encoded| STANDARD.decode(encoded))
    }
}
