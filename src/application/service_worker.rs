//! Service worker controller - registration, updates, and messaging.
//!
//! Every platform failure is logged and turned into a no-op outcome; the
//! app keeps working without a background worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use super::observers::{ObserverSet, Subscription};
use crate::domain::AppError;
use crate::infrastructure::{MessageKind, WorkerHost, WorkerLifecycle, WorkerMessage, WorkerTarget};

/// Result of `register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegistrationOutcome {
    /// The worker was registered by this call.
    Registered,
    /// A previous call already registered it.
    AlreadyRegistered,
    /// The platform has no background workers.
    Unsupported,
    /// Registration was attempted and failed.
    Failed,
}

/// Result of `activate_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivationOutcome {
    /// The waiting worker was told to activate and the page is reloading.
    Reloading,
    /// A previous call already started the reload.
    AlreadyReloading,
    /// No update is waiting.
    NoUpdate,
    /// The waiting worker could not be reached.
    Failed,
}

/// Manages the background worker for the app.
pub struct ServiceWorkerController {
    host: Arc<dyn WorkerHost>,
    script_url: String,
    registered: AtomicBool,
    update_waiting: AtomicBool,
    reloading: AtomicBool,
    update_listeners: ObserverSet<()>,
    message_handlers: ObserverSet<WorkerMessage>,
}

impl ServiceWorkerController {
    /// Create a controller for the worker at `script_url`.
    pub fn new(host: Arc<dyn WorkerHost>, script_url: impl Into<String>) -> Self {
        Self {
            host,
            script_url: script_url.into(),
            registered: AtomicBool::new(false),
            update_waiting: AtomicBool::new(false),
            reloading: AtomicBool::new(false),
            update_listeners: ObserverSet::new(),
            message_handlers: ObserverSet::new(),
        }
    }

    /// Register the worker. Safe to call more than once.
    pub fn register(&self) -> RegistrationOutcome {
        if !self.host.is_supported() {
            tracing::debug!("Background worker not supported, skipping registration");
            return RegistrationOutcome::Unsupported;
        }
        if self.registered.load(Ordering::Acquire) {
            return RegistrationOutcome::AlreadyRegistered;
        }

        match self.host.register(&self.script_url) {
            Ok(()) => {
                if self.registered.swap(true, Ordering::AcqRel) {
                    return RegistrationOutcome::AlreadyRegistered;
                }
                tracing::info!(script = %self.script_url, "Background worker registered");
                RegistrationOutcome::Registered
            }
            Err(AppError::Unsupported { .. }) => RegistrationOutcome::Unsupported,
            Err(e) => {
                tracing::warn!(script = %self.script_url, error = %e, "Background worker registration failed");
                RegistrationOutcome::Failed
            }
        }
    }

    /// Whether `register` succeeded.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Whether a new worker is installed and waiting to activate.
    #[must_use]
    pub fn is_update_waiting(&self) -> bool {
        self.update_waiting.load(Ordering::Acquire)
    }

    /// Call `callback` whenever a new worker starts waiting.
    pub fn on_update_available(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.update_listeners.subscribe(move |()| callback())
    }

    /// Remove an update or message callback.
    pub fn unsubscribe(&self, token: Subscription) -> bool {
        self.update_listeners.unsubscribe(token) || self.message_handlers.unsubscribe(token)
    }

    /// Feed a lifecycle event from the platform.
    pub fn handle_lifecycle(&self, event: WorkerLifecycle) {
        tracing::debug!(?event, "Worker lifecycle event");
        match event {
            WorkerLifecycle::Waiting => {
                if !self.update_waiting.swap(true, Ordering::AcqRel) {
                    tracing::info!("Application update available");
                    self.update_listeners.notify(&());
                }
            }
            WorkerLifecycle::Activated => {
                self.update_waiting.store(false, Ordering::Release);
            }
            WorkerLifecycle::Installing | WorkerLifecycle::ControllerChanged => {}
        }
    }

    /// Activate the waiting worker and reload the page once.
    pub fn activate_update(&self) -> ActivationOutcome {
        if !self.is_update_waiting() {
            return ActivationOutcome::NoUpdate;
        }
        if self.reloading.swap(true, Ordering::AcqRel) {
            return ActivationOutcome::AlreadyReloading;
        }

        if let Err(e) = self
            .host
            .post_message(WorkerTarget::Waiting, &WorkerMessage::SkipWaiting)
        {
            tracing::warn!(error = %e, "Could not reach the waiting worker");
            self.reloading.store(false, Ordering::Release);
            return ActivationOutcome::Failed;
        }

        tracing::info!("Activating update and reloading");
        self.host.reload();
        ActivationOutcome::Reloading
    }

    /// Post a message to the active worker. Returns false if it was not delivered.
    pub fn send_message(&self, message: &WorkerMessage) -> bool {
        if !self.is_registered() {
            tracing::trace!(kind = ?message.kind(), "No worker registered, dropping message");
            return false;
        }
        match self.host.post_message(WorkerTarget::Active, message) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(kind = ?message.kind(), error = %e, "Worker message not delivered");
                false
            }
        }
    }

    /// Call `handler` for every incoming message of `kind`.
    pub fn on_message(
        &self,
        kind: MessageKind,
        handler: impl Fn(&WorkerMessage) + Send + Sync + 'static,
    ) -> Subscription {
        self.message_handlers.subscribe(move |message| {
            if message.kind() == kind {
                handler(message);
            }
        })
    }

    /// Dispatch a message received from the worker.
    pub fn handle_message(&self, message: &WorkerMessage) {
        tracing::debug!(kind = ?message.kind(), "Worker message received");
        self.message_handlers.notify(message);
    }

    /// Dispatch a raw JSON message. Malformed messages are logged and dropped.
    pub fn handle_raw_message(&self, raw: Value) {
        match serde_json::from_value::<WorkerMessage>(raw) {
            Ok(message) => self.handle_message(&message),
            Err(e) => tracing::warn!(error = %e, "Ignoring malformed worker message"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::Result;
    use crate::infrastructure::HeadlessWorkerHost;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// Worker host that records what it was asked to do.
    #[derive(Default)]
    pub struct RecordingHost {
        pub registrations: AtomicUsize,
        pub reloads: AtomicUsize,
        pub posted: Mutex<Vec<(WorkerTarget, WorkerMessage)>>,
        pub fail_posts: AtomicBool,
    }

    impl WorkerHost for RecordingHost {
        fn is_supported(&self) -> bool {
            true
        }

        fn register(&self, _script_url: &str) -> Result<()> {
            self.registrations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn post_message(&self, target: WorkerTarget, message: &WorkerMessage) -> Result<()> {
            if self.fail_posts.load(Ordering::SeqCst) {
                return Err(AppError::Platform {
                    message: "worker gone".into(),
                });
            }
            self.posted.lock().push((target, message.clone()));
            Ok(())
        }

        fn reload(&self) {
            self.reloads.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn controller() -> (Arc<RecordingHost>, ServiceWorkerController) {
        let host = Arc::new(RecordingHost::default());
        let controller = ServiceWorkerController::new(host.clone(), "/sw.js");
        (host, controller)
    }

    #[test]
    fn test_register_is_idempotent() {
        let (host, controller) = controller();

        assert_eq!(controller.register(), RegistrationOutcome::Registered);
        assert_eq!(controller.register(), RegistrationOutcome::AlreadyRegistered);
        assert_eq!(host.registrations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsupported_platform_is_a_noop() {
        let controller = ServiceWorkerController::new(Arc::new(HeadlessWorkerHost), "/sw.js");

        assert_eq!(controller.register(), RegistrationOutcome::Unsupported);
        assert!(!controller.send_message(&WorkerMessage::ClearCache));
        assert_eq!(controller.activate_update(), ActivationOutcome::NoUpdate);
    }

    #[test]
    fn test_update_activation_reloads_once() {
        let (host, controller) = controller();
        controller.register();

        let notified = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&notified);
        let _token = controller.on_update_available(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        controller.handle_lifecycle(WorkerLifecycle::Installing);
        assert_eq!(controller.activate_update(), ActivationOutcome::NoUpdate);

        controller.handle_lifecycle(WorkerLifecycle::Waiting);
        controller.handle_lifecycle(WorkerLifecycle::Waiting);
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        assert_eq!(controller.activate_update(), ActivationOutcome::Reloading);
        assert_eq!(controller.activate_update(), ActivationOutcome::AlreadyReloading);
        assert_eq!(host.reloads.load(Ordering::SeqCst), 1);
        assert_eq!(
            host.posted.lock().as_slice(),
            &[(WorkerTarget::Waiting, WorkerMessage::SkipWaiting)]
        );
    }

    #[test]
    fn test_unreachable_waiting_worker_does_not_reload() {
        let (host, controller) = controller();
        controller.handle_lifecycle(WorkerLifecycle::Waiting);
        host.fail_posts.store(true, Ordering::SeqCst);

        assert_eq!(controller.activate_update(), ActivationOutcome::Failed);
        assert_eq!(host.reloads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_handlers_are_keyed_by_kind() {
        let (_host, controller) = controller();
        let syncs = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&syncs);
        let token = controller.on_message(MessageKind::SyncTriggered, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        controller.handle_message(&WorkerMessage::ClearCache);
        controller.handle_raw_message(json!({ "type": "SYNC_TRIGGERED" }));
        controller.handle_raw_message(json!({ "type": "NOT_A_MESSAGE" }));
        assert_eq!(syncs.load(Ordering::SeqCst), 1);

        assert!(controller.unsubscribe(token));
        controller.handle_message(&WorkerMessage::SyncTriggered);
        assert_eq!(syncs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_delivery_is_reported() {
        let (host, controller) = controller();
        controller.register();

        assert!(controller.send_message(&WorkerMessage::ClearCache));
        host.fail_posts.store(true, Ordering::SeqCst);
        assert!(!controller.send_message(&WorkerMessage::ClearCache));
    }
}
