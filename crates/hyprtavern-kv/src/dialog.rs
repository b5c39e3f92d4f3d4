//! The password dialog collaborator.
//!
//! The graphical first-run / password-prompt dialog is an external
//! collaborator; the barmaid only depends on this interface. Both calls
//! are permitted to block indefinitely — they run on the store-open worker
//! thread, never on the protocol thread.

use std::collections::VecDeque;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

/// The dialog could not be shown (no display, helper missing, user killed
/// it).
#[derive(Debug, Error, PartialEq, Eq)]
#[error("dialog unavailable: {0}")]
pub struct DialogUnavailable(pub String);

/// A password source for first-run setup and unlock prompts.
pub trait Dialog: Send + Sync {
    /// Ask the user to choose a password for a brand-new store.
    ///
    /// # Errors
    ///
    /// [`DialogUnavailable`] when no prompt can be shown.
    fn first_time_setup(&self) -> Result<Zeroizing<String>, DialogUnavailable>;

    /// Ask the user for the password of an existing store.
    ///
    /// # Errors
    ///
    /// [`DialogUnavailable`] when no prompt can be shown.
    fn password_ask(&self) -> Result<Zeroizing<String>, DialogUnavailable>;
}

/// Environment variable naming the dialog helper binary.
pub const DIALOG_HELPER_ENV: &str = "HYPRTAVERN_DIALOG";

/// Default dialog helper looked up on `$PATH`.
pub const DEFAULT_DIALOG_HELPER: &str = "hyprtavern-ask";

/// Dialog backed by an external helper program.
///
/// The helper is invoked with a single argument, `setup` or `ask`, and
/// must print the password as its only line of stdout. A non-zero exit,
/// missing binary, or missing display surface all read as unavailable.
#[derive(Debug)]
pub struct CommandDialog {
    helper: PathBuf,
}

impl CommandDialog {
    /// Resolve the helper from [`DIALOG_HELPER_ENV`] or fall back to
    /// [`DEFAULT_DIALOG_HELPER`].
    #[must_use]
    pub fn from_env() -> Self {
        let helper = std::env::var_os(DIALOG_HELPER_ENV)
            .map_or_else(|| PathBuf::from(DEFAULT_DIALOG_HELPER), PathBuf::from);
        Self { helper }
    }

    fn run(&self, mode: &str) -> Result<Zeroizing<String>, DialogUnavailable> {
        // A prompt needs somewhere to draw. Checked per call: the tavern
        // environment may have gained a display since the last attempt.
        if std::env::var_os("WAYLAND_DISPLAY").is_none()
            && std::env::var_os("DISPLAY").is_none()
        {
            return Err(DialogUnavailable("no display".into()));
        }

        debug!("invoking dialog helper {:?} ({mode})", self.helper);

        let mut child = Command::new(&self.helper)
            .arg(mode)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| DialogUnavailable(format!("helper spawn failed: {e}")))?;

        let mut output = Zeroizing::new(String::new());
        if let Some(stdout) = child.stdout.as_mut() {
            stdout
                .read_to_string(&mut output)
                .map_err(|e| DialogUnavailable(format!("helper read failed: {e}")))?;
        }

        let status = child
            .wait()
            .map_err(|e| DialogUnavailable(format!("helper wait failed: {e}")))?;

        if !status.success() {
            return Err(DialogUnavailable(format!("helper exited with {status}")));
        }

        let password = output.lines().next().unwrap_or_default();
        Ok(Zeroizing::new(password.to_owned()))
    }
}

impl Dialog for CommandDialog {
    fn first_time_setup(&self) -> Result<Zeroizing<String>, DialogUnavailable> {
        self.run("setup")
    }

    fn password_ask(&self) -> Result<Zeroizing<String>, DialogUnavailable> {
        self.run("ask")
    }
}

/// Scripted dialog for tests: pops pre-seeded answers in order and reads
/// unavailable once the script runs dry.
#[derive(Debug, Default)]
pub struct ScriptedDialog {
    answers: Mutex<VecDeque<String>>,
}

impl ScriptedDialog {
    /// Seed the answer script.
    #[must_use]
    pub fn new(answers: impl IntoIterator<Item = &'static str>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().map(str::to_owned).collect()),
        }
    }

    fn pop(&self) -> Result<Zeroizing<String>, DialogUnavailable> {
        self.answers
            .lock()
            .expect("dialog script lock")
            .pop_front()
            .map(Zeroizing::new)
            .ok_or_else(|| DialogUnavailable("script exhausted".into()))
    }
}

impl Dialog for ScriptedDialog {
    fn first_time_setup(&self) -> Result<Zeroizing<String>, DialogUnavailable> {
        self.pop()
    }

    fn password_ask(&self) -> Result<Zeroizing<String>, DialogUnavailable> {
        self.pop()
    }
}
