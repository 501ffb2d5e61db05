//! Tells a media server that a new file landed in the library.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use crate::config::SharedConfig;
use crate::sanitize::{redact_path, redact_url};

/// Called once per file placed in the library. Must not block for long.
pub trait LibraryNotifier: Send + Sync {
    fn notify(&self, placed: &Path, job_id: &str);
}

/// Does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl LibraryNotifier for NoopNotifier {
    fn notify(&self, _placed: &Path, _job_id: &str) {}
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HookPayload<'a> {
    path: String,
    job_id: &'a str,
}

/// POSTs `{"path": ..., "jobId": ...}` to a URL from a detached thread.
#[derive(Clone)]
pub struct WebhookNotifier {
    url: String,
    client: reqwest::blocking::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Sends the notification on the calling thread.
    pub fn send(&self, placed: &Path, job_id: &str) -> Result<(), reqwest::Error> {
        let payload = HookPayload {
            path: placed.display().to_string(),
            job_id,
        };
        self.client
            .post(&self.url)
            .json(&payload)
            .send()?
            .error_for_status()?;
        Ok(())
    }
}

impl LibraryNotifier for WebhookNotifier {
    fn notify(&self, placed: &Path, job_id: &str) {
        let hook = self.clone();
        let placed = placed.to_path_buf();
        let job_id = job_id.to_string();

        let spawned = std::thread::Builder::new()
            .name("library-hook".to_string())
            .spawn(move || match hook.send(&placed, &job_id) {
                Ok(()) => log::debug!(
                    "Library hook {} notified about {}",
                    redact_url(&hook.url),
                    redact_path(&placed)
                ),
                Err(e) => log::warn!("Library hook {} failed: {}", redact_url(&hook.url), e),
            });

        if let Err(e) = spawned {
            log::warn!("Could not start library hook thread: {}", e);
        }
    }
}

/// Follows `library_hook_url` in the live configuration.
///
/// The webhook client is rebuilt only when the URL changes; without a URL
/// placements are not announced.
pub struct ConfiguredNotifier {
    config: SharedConfig,
    hook: Mutex<Option<WebhookNotifier>>,
}

impl ConfiguredNotifier {
    pub fn new(config: SharedConfig) -> Self {
        Self {
            config,
            hook: Mutex::new(None),
        }
    }

    fn current_hook(&self) -> Option<WebhookNotifier> {
        let config = self.config.current();
        let url = config.library_hook_url.as_deref()?;

        let mut cached = match self.hook.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(hook) = cached.as_ref().filter(|h| h.url() == url) {
            return Some(hook.clone());
        }

        match WebhookNotifier::new(url) {
            Ok(hook) => {
                log::info!("Library hook now points at {}", redact_url(url));
                *cached = Some(hook.clone());
                Some(hook)
            }
            Err(e) => {
                log::warn!("Library hook {} unusable: {}", redact_url(url), e);
                *cached = None;
                None
            }
        }
    }
}

impl LibraryNotifier for ConfiguredNotifier {
    fn notify(&self, placed: &Path, job_id: &str) {
        if let Some(hook) = self.current_hook() {
            hook.notify(placed, job_id);
        }
    }
}
