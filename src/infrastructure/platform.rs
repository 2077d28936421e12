//! Ports to the host platform.
//!
//! The engine never talks to a browser or OS directly. Hosts implement
//! these traits and feed platform events into the application layer.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{AppError, Result};

/// Samples current connectivity from the platform.
pub trait ConnectivityProbe: Send + Sync {
    /// Whether the platform currently reports a connection.
    fn is_online(&self) -> bool;
}

/// A probe with a fixed answer.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub bool);

impl ConnectivityProbe for StaticProbe {
    fn is_online(&self) -> bool {
        self.0
    }
}

/// Reports online when a TCP connection to the backend host succeeds.
///
/// The host is resolved on every sample; a failed lookup counts as offline.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    /// Build a probe for the host of `url`.
    ///
    /// # Errors
    /// Returns `Config` if the URL cannot be parsed or has no host.
    pub fn from_url(url: &str, timeout: Duration) -> Result<Self> {
        let parsed = reqwest::Url::parse(url).map_err(|e| AppError::Config {
            message: format!("Invalid backend URL {url}: {e}"),
        })?;
        let host = parsed.host_str().ok_or_else(|| AppError::Config {
            message: format!("Backend URL has no host: {url}"),
        })?;

        Ok(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port: parsed.port_or_known_default().unwrap_or(443),
            timeout,
        })
    }
}

impl ConnectivityProbe for TcpProbe {
    fn is_online(&self) -> bool {
        let addrs = match (self.host.as_str(), self.port).to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                tracing::debug!(host = %self.host, error = %e, "Backend host did not resolve");
                return false;
            }
        };
        addrs
            .into_iter()
            .any(|addr| TcpStream::connect_timeout(&addr, self.timeout).is_ok())
    }
}

/// Which worker a message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerTarget {
    /// The worker controlling the page.
    Active,
    /// A newly installed worker waiting to activate.
    Waiting,
}

/// Typed messages exchanged between the page and the background worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Ask a waiting worker to activate immediately.
    SkipWaiting,
    /// Background sync fired; the page should drain its queue.
    SyncTriggered,
    /// A drain finished.
    SyncComplete {
        /// Mutations applied.
        applied: usize,
        /// Mutations rejected.
        failed: usize,
    },
    /// Drop cached responses held by the worker.
    ClearCache,
    /// Any other message type.
    Custom {
        /// Application-defined type tag.
        kind: String,
        /// Message body.
        body: Value,
    },
}

/// Discriminant of a [`WorkerMessage`], used to register handlers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// [`WorkerMessage::SkipWaiting`]
    SkipWaiting,
    /// [`WorkerMessage::SyncTriggered`]
    SyncTriggered,
    /// [`WorkerMessage::SyncComplete`]
    SyncComplete,
    /// [`WorkerMessage::ClearCache`]
    ClearCache,
    /// [`WorkerMessage::Custom`] with the given tag.
    Custom(String),
}

impl WorkerMessage {
    /// Discriminant used for handler lookup.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::SkipWaiting => MessageKind::SkipWaiting,
            Self::SyncTriggered => MessageKind::SyncTriggered,
            Self::SyncComplete { .. } => MessageKind::SyncComplete,
            Self::ClearCache => MessageKind::ClearCache,
            Self::Custom { kind, .. } => MessageKind::Custom(kind.clone()),
        }
    }
}

/// Worker lifecycle events reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerLifecycle {
    /// A new worker started installing.
    Installing,
    /// The new worker finished installing and waits to activate.
    Waiting,
    /// The new worker activated.
    Activated,
    /// The page is now controlled by a different worker.
    ControllerChanged,
}

/// Host side of the background worker.
pub trait WorkerHost: Send + Sync {
    /// Whether the platform supports background workers at all.
    fn is_supported(&self) -> bool;

    /// Register the worker script.
    ///
    /// # Errors
    /// Returns `Platform` if registration fails.
    fn register(&self, script_url: &str) -> Result<()>;

    /// Post a message to a worker.
    ///
    /// # Errors
    /// Returns `Platform` if no such worker exists or delivery fails.
    fn post_message(&self, target: WorkerTarget, message: &WorkerMessage) -> Result<()>;

    /// Reload the page.
    fn reload(&self);
}

/// Worker host for environments without background workers.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessWorkerHost;

impl WorkerHost for HeadlessWorkerHost {
    fn is_supported(&self) -> bool {
        false
    }

    fn register(&self, _script_url: &str) -> Result<()> {
        Err(AppError::Unsupported {
            capability: "service worker",
        })
    }

    fn post_message(&self, _target: WorkerTarget, _message: &WorkerMessage) -> Result<()> {
        Err(AppError::Unsupported {
            capability: "service worker",
        })
    }

    fn reload(&self) {}
}

/// User's answer to the install prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptOutcome {
    /// The app was added to the home screen.
    Accepted,
    /// The user closed the prompt.
    Dismissed,
}

/// The platform's one-shot deferred install prompt.
///
/// Consumed by `prompt`, so it can be shown at most once.
pub trait DeferredPrompt: Send {
    /// Show the prompt and wait for the user's choice.
    fn prompt(self: Box<Self>) -> PromptOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_wire_format() {
        let msg = WorkerMessage::SyncComplete {
            applied: 2,
            failed: 1,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            json!({ "type": "SYNC_COMPLETE", "payload": { "applied": 2, "failed": 1 } })
        );

        let parsed: WorkerMessage =
            serde_json::from_value(json!({ "type": "SYNC_TRIGGERED" })).unwrap();
        assert_eq!(parsed, WorkerMessage::SyncTriggered);
    }

    #[test]
    fn test_headless_host_is_unsupported() {
        let host = HeadlessWorkerHost;
        assert!(!host.is_supported());
        assert!(matches!(
            host.register("/sw.js"),
            Err(AppError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_tcp_probe_resolves_on_every_sample() {
        let probe =
            TcpProbe::from_url("https://backend.invalid", Duration::from_millis(200)).unwrap();
        assert_eq!((probe.host.as_str(), probe.port), ("backend.invalid", 443));
        assert!(!probe.is_online());

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe =
            TcpProbe::from_url(&format!("http://127.0.0.1:{port}"), Duration::from_secs(1)).unwrap();
        assert!(probe.is_online());

        drop(listener);
        assert!(!probe.is_online());
    }

    #[test]
    fn test_tcp_probe_rejects_bad_urls() {
        assert!(matches!(
            TcpProbe::from_url("not a url", Duration::from_secs(1)),
            Err(AppError::Config { .. })
        ));
    }

    #[test]
    fn test_static_probe() {
        assert!(StaticProbe(true).is_online());
        assert!(!StaticProbe(false).is_online());
    }
}
