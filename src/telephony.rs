//! Telephony control boundary.
//!
//! The engine consumes this interface for the terminal actions of a call:
//! playing audio or a platform announcement, transferring to a human, and
//! hanging up. Signaling, webhook parsing, and codec framing live on the
//! other side of this trait.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::provider::AudioClip;

/// Something to say to the caller.
#[derive(Debug, Clone)]
pub enum Utterance {
    /// Synthesized audio to play.
    Audio(AudioClip),
    /// Text for the telephony platform's native announcement voice, used
    /// when no synthesis provider is available.
    Text(String),
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("telephony command failed: {0}")]
pub struct TelephonyError(pub String);

/// Control channel for one live call. Implementations wrap the telephony
/// vendor's call-control API. The engine treats failures of these commands
/// as best-effort: logged, fallen through, never retried indefinitely.
#[async_trait]
pub trait TelephonyControl: Send + Sync {
    async fn answer(&self) -> Result<(), TelephonyError>;
    async fn speak(&self, utterance: Utterance) -> Result<(), TelephonyError>;
    async fn transfer(&self, number: &str) -> Result<(), TelephonyError>;
    async fn hangup(&self) -> Result<(), TelephonyError>;
}

/// What a [`RecordingTelephony`] saw, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelephonyAction {
    Answer,
    SpokeAudio,
    SpokeText(String),
    Transfer(String),
    Hangup,
}

/// Test double that records every command. Commands listed in
/// `fail_commands` return an error, for exercising the best-effort paths.
#[derive(Debug, Default)]
pub struct RecordingTelephony {
    actions: Mutex<Vec<TelephonyAction>>,
    pub fail_transfer: std::sync::atomic::AtomicBool,
    pub fail_speak: std::sync::atomic::AtomicBool,
}

impl RecordingTelephony {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actions(&self) -> Vec<TelephonyAction> {
        self.actions.lock().expect("telephony log lock poisoned").clone()
    }

    pub fn count(&self, predicate: impl Fn(&TelephonyAction) -> bool) -> usize {
        self.actions().iter().filter(|a| predicate(a)).count()
    }

    fn record(&self, action: TelephonyAction) {
        self.actions.lock().expect("telephony log lock poisoned").push(action);
    }
}

#[async_trait]
impl TelephonyControl for RecordingTelephony {
    async fn answer(&self) -> Result<(), TelephonyError> {
        self.record(TelephonyAction::Answer);
        Ok(())
    }

    async fn speak(&self, utterance: Utterance) -> Result<(), TelephonyError> {
        if self.fail_speak.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(TelephonyError("speak rejected".into()));
        }
        match utterance {
            Utterance::Audio(_) => self.record(TelephonyAction::SpokeAudio),
            Utterance::Text(text) => self.record(TelephonyAction::SpokeText(text)),
        }
        Ok(())
    }

    async fn transfer(&self, number: &str) -> Result<(), TelephonyError> {
        if self.fail_transfer.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(TelephonyError("transfer rejected".into()));
        }
        self.record(TelephonyAction::Transfer(number.to_string()));
        Ok(())
    }

    async fn hangup(&self) -> Result<(), TelephonyError> {
        self.record(TelephonyAction::Hangup);
        Ok(())
    }
}
