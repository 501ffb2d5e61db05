//! End-to-end tests: files appear in watched roots, the queue worker
//! classifies them and the organizer files them into the library.

mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Duration as ChronoDuration, Utc};
use tempfile::TempDir;

use common::{suggestion, ConfigBuilder, RecordingNotifier, ScriptedClassifier, TestHarness};
use reelsort::classify::DryRunClassifier;
use reelsort::config::{SharedConfig, WatchConfig};
use reelsort::error::ClassifyError;
use reelsort::events::JobEventKind;
use reelsort::job::{FailureKind, JobPatch, JobStatus, SourceRoot};
use reelsort::watcher::RootWatcher;
use reelsort::worker::SubmitReason;
use reelsort::Engine;

#[test]
fn test_download_lifecycle() {
    let mut h = TestHarness::with_config(|c| c.with_movement_log());
    let job = h.add_inbox("Movie.2020.1080p.mkv");
    assert_eq!(job.status, JobStatus::QueuedForAi);

    h.classifier.respond(vec![suggestion(
        "Movie.2020.1080p.mkv",
        "Movies/Movie (2020).mkv",
        92,
    )]);
    let submitted = h.tick().unwrap();
    assert_eq!(submitted.reason, SubmitReason::Regular);
    assert!(submitted.succeeded);

    // Classified, but the download is still running
    let classified = h.job(&job.id);
    assert_eq!(classified.status, JobStatus::PendingCompletion);
    assert_eq!(classified.confidence, Some(92));
    assert!(classified.final_path.is_none());

    let finished = h.finish_download("Movie.2020.1080p.mkv").unwrap();
    assert_eq!(finished.id, job.id);

    let expected = h.library.join("Movies/Movie (2020).mkv");
    let done = h.job(&job.id);
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.final_path, Some(expected.clone()));
    assert!(expected.exists());
    assert!(!h.done.join("Movie.2020.1080p.mkv").exists());
    assert_eq!(h.notifier.placed(), vec![(expected, job.id.clone())]);

    let log = h.engine.movement_log().unwrap();
    let stats = log.stats().unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.successful, 1);
    assert_eq!(log.by_job(&job.id).unwrap().len(), 1);
}

#[test]
fn test_group_members_share_primary_directory() {
    let mut h = TestHarness::new();
    let video = h.add_inbox("Show/Show.S01E01.mkv");
    let subs = h.add_inbox("Show/Show.S01E01.srt");
    let video = h.job(&video.id);
    assert!(video.is_primary);
    assert!(video.group_id.is_some());
    assert_eq!(subs.group_id, video.group_id);

    h.classifier.respond(vec![
        suggestion("Show/Show.S01E01.mkv", "Show/Season 01/Show S01E01.mkv", 95),
        suggestion("Show/Show.S01E01.srt", "Subtitles/Show S01E01.srt", 60),
    ]);
    let submitted = h.tick().unwrap();
    assert_eq!(submitted.job_ids, vec![video.id.clone(), subs.id.clone()]);

    let request = &h.classifier.requests()[0];
    assert_eq!(
        request.inputs,
        vec![
            PathBuf::from("Show/Show.S01E01.mkv"),
            PathBuf::from("Show/Show.S01E01.srt")
        ]
    );
    assert_eq!(
        h.job(&subs.id).destination_relative(),
        PathBuf::from("Show/Season 01/Show S01E01.srt")
    );

    h.finish_download("Show/Show.S01E01.mkv");
    h.finish_download("Show/Show.S01E01.srt");

    assert!(h.library.join("Show/Season 01/Show S01E01.mkv").exists());
    assert!(h.library.join("Show/Season 01/Show S01E01.srt").exists());
    assert_eq!(h.job(&subs.id).status, JobStatus::Completed);
    // Emptied download folders go away, the root stays
    assert!(!h.done.join("Show").exists());
    assert!(h.done.exists());
}

#[test]
fn test_result_count_mismatch_fails_whole_group() {
    let mut h = TestHarness::new();
    let video = h.add_inbox("ep.mkv");
    let subs = h.add_inbox("ep.srt");

    h.classifier
        .respond(vec![suggestion("ep.mkv", "Show/Show S01E01.mkv", 90)]);
    let submitted = h.tick().unwrap();
    assert!(!submitted.succeeded);

    for id in [&video.id, &subs.id] {
        let job = h.job(id);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failure, Some(FailureKind::Classification));
        assert_eq!(job.retry_count, 1);
        assert!(job.error_message.is_some());
    }
}

#[test]
fn test_retries_stop_at_bound() {
    let mut h = TestHarness::new();
    h.classifier
        .fail_always(ClassifyError::Provider("service unavailable".to_string()));
    let job = h.add_inbox("a.mkv");

    assert_eq!(h.tick().unwrap().reason, SubmitReason::Regular);
    assert_eq!(h.tick().unwrap().reason, SubmitReason::Retry);
    assert_eq!(h.tick().unwrap().reason, SubmitReason::Retry);
    assert!(h.tick().is_none());

    let failed = h.job(&job.id);
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.retry_count, 3);
    assert!(failed.is_terminal());
    assert_eq!(h.classifier.call_count(), 3);

    // An operator can still push it through by hand
    let requeued = h
        .engine
        .resubmit_for_classification(&job.id, None)
        .unwrap();
    assert_eq!(requeued.retry_count, 0);
    assert_eq!(h.tick().unwrap().reason, SubmitReason::Priority);
}

#[test]
fn test_incomplete_group_is_forced_after_stall() {
    let mut h = TestHarness::with_config(|c| c.stall_threshold_secs(30));
    let video = h.add_inbox("ep.mkv");
    let subs = h.add_inbox("ep.srt");
    h.engine.resubmit_for_classification(&subs.id, None).unwrap();

    let t0 = Utc::now();
    let first = h.tick_at(t0).unwrap();
    assert_eq!(first.reason, SubmitReason::Priority);
    assert_eq!(first.job_ids, vec![subs.id.clone()]);

    // The primary's group is no longer complete
    assert!(h.tick_at(t0).is_none());
    assert!(h.tick_at(t0 + ChronoDuration::seconds(10)).is_none());

    let forced = h.tick_at(t0 + ChronoDuration::seconds(31)).unwrap();
    assert_eq!(forced.reason, SubmitReason::Stalled);
    assert_eq!(forced.job_ids, vec![video.id.clone()]);
    assert_eq!(h.job(&video.id).status, JobStatus::PendingCompletion);
}

#[test]
fn test_longest_stall_threshold_keeps_group_waiting() {
    let mut h = TestHarness::with_config(|c| c.stall_threshold_secs(315_360_000));
    h.add_inbox("ep.mkv");
    let subs = h.add_inbox("ep.srt");
    h.engine.resubmit_for_classification(&subs.id, None).unwrap();

    let t0 = Utc::now();
    assert!(h.tick_at(t0).is_some());
    assert!(h.tick_at(t0 + ChronoDuration::days(365)).is_none());
}

#[test]
fn test_collision_gets_numbered_name() {
    let mut h = TestHarness::new();
    let existing = h.occupy_library("Movies/A.mkv", "already here");
    let job = h.finish_download("a.mkv").unwrap();
    assert_eq!(job.source_root, SourceRoot::Completion);

    h.classifier
        .respond(vec![suggestion("a.mkv", "Movies/A.mkv", 90)]);
    h.tick().unwrap();

    let placed = h.job(&job.id);
    assert_eq!(placed.status, JobStatus::Completed);
    assert_eq!(placed.final_path, Some(h.library.join("Movies/A_1.mkv")));
    assert_eq!(std::fs::read_to_string(existing).unwrap(), "already here");
}

#[test]
fn test_catch_all_collision_overwrites() {
    let mut h = TestHarness::with_config(|c| c.catch_all(DryRunClassifier::FOLDER));
    let existing = h.occupy_library("Organized Files/Organized - b.mkv", "stale copy");
    let job = h.finish_download("b.mkv").unwrap();

    h.tick().unwrap();

    let placed = h.job(&job.id);
    assert_eq!(placed.status, JobStatus::Completed);
    assert_eq!(placed.final_path, Some(existing.clone()));
    assert_eq!(std::fs::read_to_string(existing).unwrap(), "b.mkv");
}

#[test]
fn test_collision_with_fail_policy_is_not_retried() {
    let mut h = TestHarness::with_config(|c| c.fail_on_collision().with_movement_log());
    h.occupy_library("Movies/A.mkv", "already here");
    let job = h.finish_download("a.mkv").unwrap();

    h.classifier
        .respond(vec![suggestion("a.mkv", "Movies/A.mkv", 90)]);
    h.tick().unwrap();

    let failed = h.job(&job.id);
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.failure, Some(FailureKind::Organize));
    assert!(!failed.is_retry_eligible());
    assert!(h.done.join("a.mkv").exists());
    assert!(h.tick().is_none());

    let stats = h.engine.movement_log().unwrap().stats().unwrap();
    assert_eq!(stats.failed, 1);
}

#[test]
fn test_staged_file_is_placed_after_classification() {
    let mut h = TestHarness::with_config(|c| c.with_staging());
    let job = h.add_staging("Film.mkv");
    assert_eq!(job.completed_path, Some(h.staging.join("Film.mkv")));

    h.classifier
        .respond(vec![suggestion("Film.mkv", "Movies/Film (2001).mkv", 88)]);
    h.tick().unwrap();

    assert_eq!(h.job(&job.id).status, JobStatus::Completed);
    assert!(h.library.join("Movies/Film (2001).mkv").exists());
    assert!(!h.staging.join("Film.mkv").exists());
}

#[test]
fn test_dry_run_completes_without_moving() {
    let mut h = TestHarness::with_config(|c| c.with_staging().dry_run().with_movement_log());
    let job = h.add_staging("x.mkv");

    h.tick().unwrap();

    let done = h.job(&job.id);
    let planned = h.library.join("Organized Files/Organized - x.mkv");
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.final_path, Some(planned.clone()));
    assert!(h.staging.join("x.mkv").exists());
    assert!(!planned.exists());

    let entries = h.engine.movement_log().unwrap().read_all(None).unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].dry_run);
}

#[test]
fn test_manual_edit_places_present_file() {
    let h = TestHarness::new();
    let job = h.finish_download("odd name.mkv").unwrap();

    let edited = h
        .engine
        .manual_edit(&job.id, "Movies/Odd (1999).mkv", None)
        .unwrap();

    assert_eq!(edited.status, JobStatus::Completed);
    assert!(h.library.join("Movies/Odd (1999).mkv").exists());
    assert_eq!(h.classifier.call_count(), 0);

    // Completed jobs are final
    assert!(h.engine.manual_edit(&job.id, "Other.mkv", None).is_err());
    assert!(h.engine.resubmit_for_classification(&job.id, None).is_err());
}

#[test]
fn test_manual_edit_with_override_directory() {
    let h = TestHarness::new();
    let job = h.finish_download("clip.mkv").unwrap();

    let edited = h
        .engine
        .manual_edit(
            &job.id,
            "ignored.mkv",
            Some(Path::new("Home Videos/2024/Clip.mkv")),
        )
        .unwrap();

    assert_eq!(
        edited.final_path,
        Some(h.library.join("Home Videos/2024/Clip.mkv"))
    );
}

#[test]
fn test_missing_file_is_dropped_after_grace() {
    let h = TestHarness::new();
    let job = h.detect_inbox_only("ghost.mkv");
    let t0 = Utc::now();

    let report = h.engine.housekeep_at(t0);
    assert!(report.removed.is_empty());
    assert_eq!(h.job(&job.id).missing_since, Some(t0));

    let report = h.engine.housekeep_at(t0 + ChronoDuration::seconds(6));
    assert_eq!(report.removed, vec![job.id.clone()]);
    assert!(h.engine.registry().is_empty());
}

#[test]
fn test_housekeeping_links_unnoticed_download() {
    let h = TestHarness::new();
    let job = h.detect_inbox_only("late.mkv");
    std::fs::write(h.done.join("late.mkv"), "late").unwrap();

    let report = h.engine.housekeep_at(Utc::now());

    assert_eq!(report.relocated.len(), 1);
    let linked = h.job(&job.id);
    assert_eq!(linked.completed_path, Some(h.done.join("late.mkv")));
    assert!(linked.missing_since.is_none());
}

#[test]
fn test_download_finishing_mid_classification_stays_linked() {
    let h = TestHarness::new();
    let job = h.add_inbox("Incoming/ep.mkv");
    h.engine
        .registry()
        .update(&job.id, JobPatch::status(JobStatus::ProcessingAi))
        .unwrap();

    std::fs::remove_file(h.inbox.join("Incoming/ep.mkv")).unwrap();
    h.finish_download("ep.mkv").unwrap();

    let linked = h.job(&job.id);
    assert_eq!(linked.status, JobStatus::ProcessingAi);
    assert_eq!(linked.completed_path, Some(h.done.join("ep.mkv")));

    let t0 = Utc::now();
    h.engine.housekeep_at(t0);
    let report = h.engine.housekeep_at(t0 + ChronoDuration::seconds(60));
    assert!(report.removed.is_empty());
    assert!(h.job(&job.id).missing_since.is_none());
}

#[test]
fn test_rescan_does_not_duplicate_jobs() {
    let h = TestHarness::new();
    h.add_inbox("a.mkv");
    h.add_inbox("Show/b.mkv");

    let scanner = RootWatcher::new(SourceRoot::Inbox, &h.inbox, &WatchConfig::default());
    for file in scanner.scan().unwrap() {
        assert!(h
            .engine
            .on_file_detected(file.root, &file.path, &file.relative_path)
            .is_none());
    }
    assert_eq!(h.engine.registry().len(), 2);
}

#[test]
fn test_registry_events_follow_the_job() {
    let mut h = TestHarness::new();
    let mut events = h.engine.subscribe();

    let job = h.add_inbox("a.mkv");
    h.tick().unwrap();

    let created = events.try_recv().unwrap();
    assert!(matches!(created.kind, JobEventKind::Created));
    assert_eq!(created.job_id, job.id);

    let statuses: Vec<JobStatus> = std::iter::from_fn(|| events.try_recv().ok())
        .map(|event| event.status)
        .collect();
    assert_eq!(
        statuses,
        vec![JobStatus::ProcessingAi, JobStatus::PendingCompletion]
    );
}

#[test]
fn test_running_engine_places_staged_file() {
    let temp_dir = TempDir::new().unwrap();
    let builder = ConfigBuilder::new(temp_dir.path())
        .with_staging()
        .tick_interval_ms(20);
    std::fs::create_dir_all(builder.staging()).unwrap();
    std::fs::write(builder.staging().join("clip.mkv"), "clip").unwrap();

    let classifier = Arc::new(ScriptedClassifier::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let mut engine = Engine::start(
        SharedConfig::new(builder.build()),
        classifier,
        Arc::clone(&notifier) as Arc<dyn reelsort::LibraryNotifier>,
    )
    .unwrap();

    let expected = builder.library().join("Organized Files/Organized - clip.mkv");
    let deadline = Instant::now() + Duration::from_secs(10);
    while !expected.exists() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    engine.shutdown();

    assert!(expected.exists());
    assert_eq!(notifier.placed().len(), 1);
}
