//! Install prompt manager - "add to home screen" eligibility.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::domain::InstallPromptState;
use crate::infrastructure::{
    Clock, DeferredPrompt, DurableWriter, KeyValueStore, PromptOutcome, WriteOp,
};

/// Storage key of the last dismissal, as epoch milliseconds.
const DISMISSED_AT_KEY: &str = "install/dismissed-at";

/// Result of asking the user to install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallOutcome {
    /// The user installed the app.
    Accepted,
    /// The user declined the platform prompt.
    Dismissed,
    /// The banner was dismissed recently; nothing was shown.
    Suppressed,
    /// No platform prompt is held, or the app is already installed.
    Unavailable,
}

/// Holds the platform's deferred install prompt and the dismissal cooldown.
pub struct InstallPromptManager {
    writer: DurableWriter,
    clock: Arc<dyn Clock>,
    cooldown: Duration,
    prompt: Mutex<Option<Box<dyn DeferredPrompt>>>,
    dismissed_at: Mutex<Option<DateTime<Utc>>>,
    installed: AtomicBool,
}

impl InstallPromptManager {
    /// Create the manager, loading the persisted dismissal.
    ///
    /// `standalone` is true when the app was launched from the home screen,
    /// which means it is already installed.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        cooldown: Duration,
        standalone: bool,
    ) -> Self {
        let writer = DurableWriter::new(store, "install");

        let dismissed_at = match writer.store().get(DISMISSED_AT_KEY) {
            Ok(bytes) => bytes
                .and_then(|b| String::from_utf8(b).ok())
                .and_then(|s| s.trim().parse::<i64>().ok())
                .and_then(DateTime::from_timestamp_millis),
            Err(e) => {
                writer.degrade(&e.to_string());
                None
            }
        };

        Self {
            writer,
            clock,
            cooldown,
            prompt: Mutex::new(None),
            dismissed_at: Mutex::new(dismissed_at),
            installed: AtomicBool::new(standalone),
        }
    }

    /// Hold the platform's deferred prompt for later use.
    pub fn capture_prompt(&self, prompt: Box<dyn DeferredPrompt>) {
        if self.is_installed() {
            tracing::debug!("Ignoring install prompt, app already installed");
            return;
        }
        *self.prompt.lock() = Some(prompt);
        tracing::debug!("Install prompt captured");
    }

    /// The platform reported the app as installed.
    pub fn handle_app_installed(&self) {
        self.installed.store(true, Ordering::Release);
        self.prompt.lock().take();
        tracing::info!("App installed");
    }

    /// A deferred prompt is held and the app is not installed.
    #[must_use]
    pub fn is_installable(&self) -> bool {
        !self.is_installed() && self.prompt.lock().is_some()
    }

    /// Whether the app runs installed.
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    /// Whether the banner is inside its cooldown after a dismissal.
    #[must_use]
    pub fn is_suppressed(&self) -> bool {
        let now = self.clock.now();
        self.dismissed_at
            .lock()
            .is_some_and(|at| now - at < self.cooldown)
    }

    /// Whether the UI should offer installation right now.
    #[must_use]
    pub fn should_offer(&self) -> bool {
        self.is_installable() && !self.is_suppressed()
    }

    /// Show the platform prompt. The prompt can only be used once.
    pub fn prompt_user(&self) -> InstallOutcome {
        if self.is_installed() {
            return InstallOutcome::Unavailable;
        }
        if self.is_suppressed() {
            return InstallOutcome::Suppressed;
        }
        let Some(prompt) = self.prompt.lock().take() else {
            return InstallOutcome::Unavailable;
        };

        match prompt.prompt() {
            PromptOutcome::Accepted => {
                tracing::info!("Install prompt accepted");
                InstallOutcome::Accepted
            }
            PromptOutcome::Dismissed => {
                tracing::info!("Install prompt declined");
                InstallOutcome::Dismissed
            }
        }
    }

    /// Hide the banner for the cooldown period.
    pub fn dismiss(&self) {
        let now = self.clock.now();
        self.writer.write(&[WriteOp::put(
            DISMISSED_AT_KEY,
            now.timestamp_millis().to_string().into_bytes(),
        )]);
        *self.dismissed_at.lock() = Some(now);
        tracing::debug!(until = %(now + self.cooldown), "Install banner dismissed");
    }

    /// Current availability and dismissal.
    #[must_use]
    pub fn state(&self) -> InstallPromptState {
        InstallPromptState {
            available: self.is_installable(),
            dismissed_at: *self.dismissed_at.lock(),
        }
    }
}
