//! Duplex voice sessions against the speech upstream.
//!
//! Recognition ([`AsrAdapter`]) streams client audio up and transcripts
//! down; synthesis ([`TtsAdapter`]) streams text fragments up and audio
//! down. Both drive one upstream socket per session through the
//! [`SessionState`] machine and run their two legs as a supervised pair: the
//! first leg to fail cancels the other.
//!
//! [`VoiceEnrollment`] wraps the HTTP voice-cloning endpoint.

pub mod asr;
pub mod config;
pub mod enrollment;
pub mod error;
pub mod protocol;
pub mod session;
mod socket;
pub mod tts;

pub use asr::{AsrAdapter, Recognizer, Transcript};
pub use config::{AsrConfig, EnrollmentConfig, TtsConfig, TtsProfile, TtsProtocol};
pub use enrollment::VoiceEnrollment;
pub use error::VoiceError;
pub use session::{SessionEvent, SessionState};
pub use tts::{AudioSink, Synthesizer, TtsAdapter};
