//! Test harness for driving an engine deterministically.
//!
//! The harness owns a temp directory with inbox, done, staging and library
//! folders, an `Engine` built without threads, and the queue worker that
//! the tests tick by hand with explicit timestamps.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use reelsort::config::SharedConfig;
use reelsort::job::{Job, SourceRoot};
use reelsort::worker::{QueueWorker, Submitted};
use reelsort::Engine;

use super::builders::{ConfigBuilder, RecordingNotifier, ScriptedClassifier};

pub struct TestHarness {
    temp_dir: TempDir,
    pub inbox: PathBuf,
    pub done: PathBuf,
    pub staging: PathBuf,
    pub library: PathBuf,
    pub movement_log: PathBuf,
    pub classifier: Arc<ScriptedClassifier>,
    pub notifier: Arc<RecordingNotifier>,
    pub engine: Engine,
    worker: QueueWorker,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(|builder| builder)
    }

    pub fn with_config(adjust: impl FnOnce(ConfigBuilder) -> ConfigBuilder) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let builder = adjust(ConfigBuilder::new(temp_dir.path()));

        let inbox = builder.inbox();
        let done = builder.done();
        let staging = builder.staging();
        let library = builder.library();
        let movement_log = builder.movement_log_path();
        for dir in [&inbox, &done, &staging, &library] {
            std::fs::create_dir_all(dir).expect("Failed to create test directory");
        }

        let classifier = Arc::new(ScriptedClassifier::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = Engine::new(
            SharedConfig::new(builder.build()),
            Arc::clone(&classifier) as Arc<dyn reelsort::Classifier>,
            Arc::clone(&notifier) as Arc<dyn reelsort::LibraryNotifier>,
        );
        let worker = engine.queue_worker();

        Self {
            temp_dir,
            inbox,
            done,
            staging,
            library,
            movement_log,
            classifier,
            notifier,
            engine,
            worker,
        }
    }

    pub fn base(&self) -> &Path {
        self.temp_dir.path()
    }

    fn write(dir: &Path, relative: &str, contents: &str) -> PathBuf {
        let path = dir.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent directory");
        }
        std::fs::write(&path, contents).expect("Failed to write test file");
        path
    }

    /// Writes a file into the inbox and reports it, like the inbox watcher would.
    pub fn add_inbox(&self, relative: &str) -> Job {
        let path = Self::write(&self.inbox, relative, relative);
        self.engine
            .on_file_detected(SourceRoot::Inbox, &path, Path::new(relative))
            .expect("inbox file should create a job")
    }

    /// Reports an inbox file without creating it on disk.
    pub fn detect_inbox_only(&self, relative: &str) -> Job {
        self.engine
            .on_file_detected(SourceRoot::Inbox, &self.inbox.join(relative), Path::new(relative))
            .expect("inbox file should create a job")
    }

    /// Writes a finished download into the done folder and reports it.
    pub fn finish_download(&self, relative: &str) -> Option<Job> {
        let path = Self::write(&self.done, relative, relative);
        self.engine
            .on_file_detected(SourceRoot::Completion, &path, Path::new(relative))
    }

    /// Writes a file into the staging folder and reports it.
    pub fn add_staging(&self, relative: &str) -> Job {
        let path = Self::write(&self.staging, relative, relative);
        self.engine
            .on_file_detected(SourceRoot::Staging, &path, Path::new(relative))
            .expect("staging file should create a job")
    }

    /// Puts a file straight into the library, for collision tests.
    pub fn occupy_library(&self, relative: &str, contents: &str) -> PathBuf {
        Self::write(&self.library, relative, contents)
    }

    pub fn tick_at(&mut self, now: DateTime<Utc>) -> Option<Submitted> {
        self.worker.tick_at(now)
    }

    pub fn tick(&mut self) -> Option<Submitted> {
        self.tick_at(Utc::now())
    }

    pub fn job(&self, id: &str) -> Job {
        self.engine.registry().get(id).expect("job should exist")
    }
}
