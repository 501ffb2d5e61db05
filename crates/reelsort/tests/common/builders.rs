//! Builders for test configurations and test doubles.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use reelsort::classify::{ClassificationRequest, Classifier, DryRunClassifier, Suggestion};
use reelsort::config::{load_config_from_str, Config};
use reelsort::error::ClassifyError;
use reelsort::library_hook::LibraryNotifier;

/// Builder for `Config` instances rooted in a test directory.
pub struct ConfigBuilder {
    base: PathBuf,
    staging: bool,
    catch_all: Option<String>,
    collision_policy: &'static str,
    dry_run: bool,
    max_retries: u32,
    tick_interval_ms: u64,
    stall_threshold_secs: u64,
    missing_grace_secs: u64,
    completed_grace_secs: u64,
    movement_log: bool,
}

impl ConfigBuilder {
    /// Defaults matching a fresh installation, with every root under `base`.
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
            staging: false,
            catch_all: None,
            collision_policy: "rename",
            dry_run: false,
            max_retries: 3,
            tick_interval_ms: 1000,
            stall_threshold_secs: 30,
            missing_grace_secs: 5,
            completed_grace_secs: 10,
            movement_log: false,
        }
    }

    pub fn with_staging(mut self) -> Self {
        self.staging = true;
        self
    }

    pub fn catch_all(mut self, folder: &str) -> Self {
        self.catch_all = Some(folder.to_string());
        self
    }

    pub fn fail_on_collision(mut self) -> Self {
        self.collision_policy = "fail";
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn tick_interval_ms(mut self, ms: u64) -> Self {
        self.tick_interval_ms = ms;
        self
    }

    pub fn stall_threshold_secs(mut self, secs: u64) -> Self {
        self.stall_threshold_secs = secs;
        self
    }

    pub fn with_movement_log(mut self) -> Self {
        self.movement_log = true;
        self
    }

    pub fn inbox(&self) -> PathBuf {
        self.base.join("inbox")
    }

    pub fn done(&self) -> PathBuf {
        self.base.join("done")
    }

    pub fn staging(&self) -> PathBuf {
        self.base.join("staging")
    }

    pub fn library(&self) -> PathBuf {
        self.base.join("library")
    }

    pub fn movement_log_path(&self) -> PathBuf {
        self.base.join("movements.jsonl")
    }

    /// Renders the JSON document a user would write.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "version": "1.0",
            "inbox_directory": self.inbox(),
            "completed_directory": self.done(),
            "staging_directory": self.staging.then(|| self.staging()),
            "library_directory": self.library(),
            "catch_all_subfolder": self.catch_all,
            "collision_policy": self.collision_policy,
            "dry_run": self.dry_run,
            "max_retries": self.max_retries,
            "tick_interval_ms": self.tick_interval_ms,
            "stall_threshold_secs": self.stall_threshold_secs,
            "missing_grace_secs": self.missing_grace_secs,
            "completed_grace_secs": self.completed_grace_secs,
            "watch": { "poll_interval_secs": 1, "debounce_ms": 50 },
            "movement_log_path": self.movement_log.then(|| self.movement_log_path()),
        })
    }

    /// Builds the config through the regular loader, validation included.
    pub fn build(&self) -> Config {
        load_config_from_str(&self.to_json().to_string()).expect("test config is valid")
    }
}

pub fn suggestion(original: &str, name: &str, confidence: u8) -> Suggestion {
    Suggestion {
        original_path: PathBuf::from(original),
        suggested_name: name.to_string(),
        confidence,
    }
}

/// Classifier answering from a script. With nothing scripted it answers
/// like `DryRunClassifier`.
#[derive(Default)]
pub struct ScriptedClassifier {
    script: Mutex<VecDeque<Result<Vec<Suggestion>, ClassifyError>>>,
    always_fail: Mutex<Option<ClassifyError>>,
    requests: Mutex<Vec<ClassificationRequest>>,
}

impl ScriptedClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the answer for the next call.
    pub fn respond(&self, results: Vec<Suggestion>) {
        self.script.lock().unwrap().push_back(Ok(results));
    }

    /// Queues a failure for the next call.
    pub fn fail_next(&self, err: ClassifyError) {
        self.script.lock().unwrap().push_back(Err(err));
    }

    /// Every call fails with `err` once the script runs out.
    pub fn fail_always(&self, err: ClassifyError) {
        *self.always_fail.lock().unwrap() = Some(err);
    }

    pub fn requests(&self) -> Vec<ClassificationRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl Classifier for ScriptedClassifier {
    fn name(&self) -> &str {
        "scripted"
    }

    fn classify(&self, request: &ClassificationRequest) -> Result<Vec<Suggestion>, ClassifyError> {
        self.requests.lock().unwrap().push(request.clone());

        if let Some(next) = self.script.lock().unwrap().pop_front() {
            return next;
        }
        if let Some(err) = self.always_fail.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(request
            .inputs
            .iter()
            .map(|input| DryRunClassifier::suggest(input))
            .collect())
    }
}

/// Remembers every placement it is told about.
#[derive(Default)]
pub struct RecordingNotifier {
    placed: Mutex<Vec<(PathBuf, String)>>,
}

impl RecordingNotifier {
    pub fn placed(&self) -> Vec<(PathBuf, String)> {
        self.placed.lock().unwrap().clone()
    }
}

impl LibraryNotifier for RecordingNotifier {
    fn notify(&self, placed: &Path, job_id: &str) {
        self.placed
            .lock()
            .unwrap()
            .push((placed.to_path_buf(), job_id.to_string()));
    }
}
