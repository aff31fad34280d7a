//! Notification trigger and the audible cues it fires.
//!
//! A [`NotificationTrigger`] is owned by one live subscription. It starts
//! [`TriggerState::Primed`] and flips to [`TriggerState::Active`] on the first
//! emission without making a sound, so opening an already busy conversation
//! stays quiet. Once active, every emission flagged as new-incoming plays the
//! cue exactly once, however many messages that emission brought.

use std::fmt;
use std::process::{Command, Stdio};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum CueError {
    #[error("Cue resource unavailable: {0}")]
    Unavailable(String),

    #[error("Cue playback failed: {0}")]
    Playback(String),
}

/// Something that can announce a new message.
///
/// `play` must not block for the duration of the sound.
pub trait NotificationCue: Send + Sync {
    fn play(&self) -> Result<(), CueError>;
}

/// Cue that only writes a log event. Used when no player is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCue;

impl NotificationCue for LogCue {
    fn play(&self) -> Result<(), CueError> {
        info!("new message notification");
        Ok(())
    }
}

/// Cue that launches an external player, e.g. `paplay /usr/share/sounds/x.oga`.
///
/// The child is reaped on a detached thread; its exit status is only logged.
#[derive(Debug, Clone)]
pub struct CommandCue {
    program: String,
    args: Vec<String>,
}

impl CommandCue {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a whitespace-separated command line. No shell is involved.
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

impl NotificationCue for CommandCue {
    fn play(&self) -> Result<(), CueError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CueError::Unavailable(format!("{}: {e}", self.program)))?;

        let program = self.program.clone();
        std::thread::spawn(move || match child.wait() {
            Ok(status) if !status.success() => {
                warn!(program = %program, %status, "cue player exited with failure");
            }
            Ok(_) => {}
            Err(e) => warn!(program = %program, error = %e, "could not wait for cue player"),
        });
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    /// No snapshot seen yet.
    Primed,
    /// Steady state; new-incoming emissions play the cue.
    Active,
}

/// Per-subscription notification state machine.
pub struct NotificationTrigger {
    state: TriggerState,
    cue: Arc<dyn NotificationCue>,
    played: u64,
}

impl NotificationTrigger {
    pub fn new(cue: Arc<dyn NotificationCue>) -> Self {
        Self {
            state: TriggerState::Primed,
            cue,
            played: 0,
        }
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    /// How many times the cue has been fired.
    pub fn played(&self) -> u64 {
        self.played
    }

    /// Feed one emission through the state machine. Returns whether the cue
    /// was fired.
    pub fn on_emission(&mut self, source: &dyn fmt::Display, new_incoming: bool) -> bool {
        match self.state {
            TriggerState::Primed => {
                self.state = TriggerState::Active;
                debug!(%source, "notification trigger active");
                false
            }
            TriggerState::Active if new_incoming => self.on_new_incoming(source),
            TriggerState::Active => false,
        }
    }

    /// Announce new incoming messages for `source`. Ignored while primed.
    ///
    /// Playback failures are logged and swallowed.
    pub fn on_new_incoming(&mut self, source: &dyn fmt::Display) -> bool {
        if self.state == TriggerState::Primed {
            return false;
        }
        self.played += 1;
        if let Err(e) = self.cue.play() {
            warn!(%source, error = %e, "notification cue failed");
        }
        true
    }
}

impl fmt::Debug for NotificationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationTrigger")
            .field("state", &self.state)
            .field("played", &self.played)
            .finish()
    }
}
