//! End-to-end tests of the job pipeline with scripted collaborators.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use std::time::Duration;

use grabcore::conversion::{ProcessingError, ToolParams};
use grabcore::download::{
    AudioCodec, DeliveryError, FetchError, JobFailure, JobHandle, JobState, Selection, SessionId, SubmitError,
};

fn split_selection() -> Selection {
    Selection::video(&video_only_1080(), &[video_only_1080(), audio_only_320()]).unwrap()
}

fn muxed_selection() -> Selection {
    Selection::video(&muxed_1080(), &[muxed_1080(), audio_only_320()]).unwrap()
}

async fn wait_for_state(handle: &JobHandle, expected: JobState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.state() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

fn assert_non_decreasing(fractions: &[f64]) {
    for pair in fractions.windows(2) {
        assert!(pair[0] <= pair[1], "progress went backwards: {:?}", fractions);
    }
}

#[tokio::test]
async fn test_split_video_is_muxed_and_delivered() {
    let source = FakeSource::new().serve(VIDEO_URL, 4096).serve(AUDIO_URL, 1024);
    let h = Harness::start(source, FakeTool::new(), RecordingTransport::new()).await;

    let handle = h.queue.submit(request(1, 1), split_selection()).unwrap();
    assert_eq!(wait(&handle).await, JobState::Completed);

    assert_eq!(
        handle.history(),
        vec![
            JobState::Queued,
            JobState::Fetching,
            JobState::Muxing,
            JobState::Delivering,
            JobState::Completed
        ]
    );

    let invocations = h.tool.invocations();
    assert_eq!(invocations.len(), 1);
    assert_eq!(
        invocations[0].params,
        ToolParams::Mux {
            container: "mp4".to_string()
        }
    );
    assert_eq!(invocations[0].inputs.len(), 2);

    match h.transport.artifacts().as_slice() {
        [Sent::Artifact {
            session,
            path,
            size,
            existed,
        }] => {
            assert_eq!(*session, SessionId(1));
            assert_eq!(*size, 5120);
            assert!(*existed);
            assert_eq!(path.file_name().unwrap(), "Test Clip.mp4");
        }
        other => panic!("unexpected artifacts: {:?}", other),
    }

    let reports = h.transport.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].state, JobState::Completed);

    let fractions = h.transport.progress_fractions();
    assert!(!fractions.is_empty());
    assert_non_decreasing(&fractions);
    assert!(fractions.iter().all(|f| (0.0..=1.0).contains(f)));

    assert_eq!(h.leftover_entries(), 0);
}

#[tokio::test]
async fn test_artifact_carries_uploader_and_resolution() {
    let source = FakeSource::new()
        .serve(VIDEO_URL, 4096)
        .serve(AUDIO_URL, 1024)
        .serve(MUXED_URL, 2048);
    let h = Harness::start(source, FakeTool::new(), RecordingTransport::new()).await;

    let video = h
        .queue
        .submit(request(1, 1).with_uploader("Rick Astley"), split_selection())
        .unwrap();
    assert_eq!(wait(&video).await, JobState::Completed);

    let audio_selection = Selection::audio(&[muxed_1080()], AudioCodec::Mp3, 192).unwrap();
    let audio = h.queue.submit(request(2, 2), audio_selection).unwrap();
    assert_eq!(wait(&audio).await, JobState::Completed);

    match h.transport.delivered().as_slice() {
        [video, audio] => {
            assert_eq!(video.title.as_deref(), Some("Test Clip"));
            assert_eq!(video.uploader.as_deref(), Some("Rick Astley"));
            assert_eq!(video.resolution.as_deref(), Some("1080p"));
            assert_eq!(audio.uploader, None);
            assert_eq!(audio.resolution, None);
        }
        other => panic!("unexpected deliveries: {:?}", other),
    }
}

#[tokio::test]
async fn test_muxed_video_skips_tool() {
    let source = FakeSource::new().serve(MUXED_URL, 6144);
    let h = Harness::start(source, FakeTool::new(), RecordingTransport::new()).await;

    let handle = h.queue.submit(request(1, 1), muxed_selection()).unwrap();
    assert_eq!(wait(&handle).await, JobState::Completed);
    assert_eq!(
        handle.history(),
        vec![
            JobState::Queued,
            JobState::Fetching,
            JobState::Delivering,
            JobState::Completed
        ]
    );
    assert!(h.tool.invocations().is_empty());
    assert_eq!(h.source.opened(), vec![MUXED_URL.to_string()]);
}

#[tokio::test]
async fn test_audio_selection_skips_video_fetch() {
    let source = FakeSource::new().serve(MUXED_URL, 6144).serve(AUDIO_URL, 1024);
    let h = Harness::start(source, FakeTool::new(), RecordingTransport::new()).await;

    let selection = Selection::audio(&[muxed_1080(), audio_only_320()], AudioCodec::Mp3, 192).unwrap();
    let handle = h.queue.submit(request(1, 1), selection).unwrap();
    assert_eq!(wait(&handle).await, JobState::Completed);

    assert_eq!(h.source.opened(), vec![AUDIO_URL.to_string()]);
    let invocations = h.tool.invocations();
    assert_eq!(invocations.len(), 1);
    assert_eq!(
        invocations[0].params,
        ToolParams::ExtractAudio {
            codec: AudioCodec::Mp3,
            bitrate_kbps: 192
        }
    );

    match h.transport.artifacts().as_slice() {
        [Sent::Artifact { path, .. }] => assert_eq!(path.extension().unwrap(), "mp3"),
        other => panic!("unexpected artifacts: {:?}", other),
    }
    assert_eq!(h.leftover_entries(), 0);
}

#[tokio::test]
async fn test_matching_audio_is_passed_through() {
    let source = FakeSource::new().serve(AUDIO_URL, 1024);
    let h = Harness::start(source, FakeTool::new(), RecordingTransport::new()).await;

    let selection = Selection::audio(&[muxed_1080(), audio_only_320()], AudioCodec::M4a, 128).unwrap();
    let handle = h.queue.submit(request(1, 1), selection).unwrap();
    assert_eq!(wait(&handle).await, JobState::Completed);

    assert!(!handle.history().contains(&JobState::Muxing));
    assert!(h.tool.invocations().is_empty());
    match h.transport.artifacts().as_slice() {
        [Sent::Artifact { size, .. }] => assert_eq!(*size, 1024),
        other => panic!("unexpected artifacts: {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_tool_fails_before_fetch() {
    let source = FakeSource::new().serve(VIDEO_URL, 4096).serve(AUDIO_URL, 1024);
    let h = Harness::start(source, FakeTool::missing(), RecordingTransport::new()).await;

    let handle = h.queue.submit(request(1, 1), split_selection()).unwrap();
    let state = wait(&handle).await;
    assert!(
        matches!(
            state,
            JobState::Failed(JobFailure::Processing(ProcessingError::ExternalToolUnavailable(_)))
        ),
        "unexpected state {:?}",
        state
    );
    assert!(h.source.opened().is_empty());
    assert_eq!(h.transport.reports().len(), 1);
    assert_eq!(h.leftover_entries(), 0);
}

#[tokio::test]
async fn test_missing_tool_does_not_block_muxed_video() {
    let source = FakeSource::new().serve(MUXED_URL, 2048);
    let h = Harness::start(source, FakeTool::missing(), RecordingTransport::new()).await;

    let handle = h.queue.submit(request(1, 1), muxed_selection()).unwrap();
    assert_eq!(wait(&handle).await, JobState::Completed);
}

#[tokio::test]
async fn test_duration_mismatch_fails_the_job() {
    let source = FakeSource::new().serve(VIDEO_URL, 4096).serve(AUDIO_URL, 1024);
    let tool = FakeTool::new().with_output_duration(170.0);
    let h = Harness::start(source, tool, RecordingTransport::new()).await;

    let handle = h.queue.submit(request(1, 1), split_selection()).unwrap();
    let state = wait(&handle).await;
    assert!(
        matches!(
            state,
            JobState::Failed(JobFailure::Processing(ProcessingError::DurationMismatch { .. }))
        ),
        "unexpected state {:?}",
        state
    );
    assert!(h.transport.artifacts().is_empty());
    assert_eq!(h.leftover_entries(), 0);
}

#[tokio::test]
async fn test_oversize_artifact_rejected_before_transfer() {
    let source = FakeSource::new().serve(MUXED_URL, 6144);
    let h = Harness::start_with(source, FakeTool::new(), RecordingTransport::new(), |dir| {
        test_config(dir).max_delivery_size(1000)
    })
    .await;

    let handle = h.queue.submit(request(1, 1), muxed_selection()).unwrap();
    assert_eq!(
        wait(&handle).await,
        JobState::Failed(JobFailure::Delivery(DeliveryError::SizeExceeded {
            size: 6144,
            limit: 1000
        }))
    );
    assert!(h.transport.artifacts().is_empty());
    assert_eq!(h.leftover_bytes().await, 0);

    let reports = h.transport.reports();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].message.contains("maximum"), "{}", reports[0].message);
}

#[tokio::test]
async fn test_failed_upload_is_retried_once() {
    let source = FakeSource::new().serve(MUXED_URL, 2048);
    let h = Harness::start(source, FakeTool::new(), RecordingTransport::failing_uploads(1)).await;

    let handle = h.queue.submit(request(1, 1), muxed_selection()).unwrap();
    assert_eq!(wait(&handle).await, JobState::Completed);

    let artifacts = h.transport.artifacts();
    assert_eq!(artifacts.len(), 2);
    // The retry still found the file on disk
    assert!(matches!(artifacts[1], Sent::Artifact { existed: true, .. }));
    assert_eq!(h.leftover_entries(), 0);
}

#[tokio::test]
async fn test_second_upload_failure_fails_the_job() {
    let source = FakeSource::new().serve(MUXED_URL, 2048);
    let h = Harness::start(source, FakeTool::new(), RecordingTransport::failing_uploads(2)).await;

    let handle = h.queue.submit(request(1, 1), muxed_selection()).unwrap();
    let state = wait(&handle).await;
    assert!(
        matches!(state, JobState::Failed(JobFailure::Delivery(DeliveryError::TransportRejected(_)))),
        "unexpected state {:?}",
        state
    );
    assert_eq!(h.transport.artifacts().len(), 2);
    assert_eq!(h.leftover_entries(), 0);
}

#[tokio::test]
async fn test_interrupted_fetch_is_retried() {
    let source = FakeSource::new().script(
        MUXED_URL,
        vec![
            Script::DropAfter { size: 2048, sent: 700 },
            Script::DropAfter { size: 2048, sent: 1500 },
            Script::Body { size: 2048, chunk: 512 },
        ],
    );
    let h = Harness::start(source, FakeTool::new(), RecordingTransport::new()).await;

    let handle = h.queue.submit(request(1, 1), muxed_selection()).unwrap();
    assert_eq!(wait(&handle).await, JobState::Completed);
    assert_eq!(h.source.open_count(MUXED_URL), 3);

    // No bytes from the aborted attempts leak into the artifact
    match h.transport.artifacts().as_slice() {
        [Sent::Artifact { size, .. }] => assert_eq!(*size, 2048),
        other => panic!("unexpected artifacts: {:?}", other),
    }
}

#[tokio::test]
async fn test_retry_budget_exhausted() {
    let source = FakeSource::new().script(MUXED_URL, vec![Script::DropAfter { size: 2048, sent: 100 }]);
    let h = Harness::start(source, FakeTool::new(), RecordingTransport::new()).await;

    let handle = h.queue.submit(request(1, 1), muxed_selection()).unwrap();
    let state = wait(&handle).await;
    assert!(
        matches!(
            state,
            JobState::Failed(JobFailure::Fetch(FetchError::NetworkInterrupted { attempts: 3, .. }))
        ),
        "unexpected state {:?}",
        state
    );
    assert_eq!(h.source.open_count(MUXED_URL), 3);
    assert_eq!(h.leftover_entries(), 0);
}

#[tokio::test]
async fn test_rejected_status_is_not_retried() {
    let source = FakeSource::new().script(MUXED_URL, vec![Script::Rejected(403)]);
    let h = Harness::start(source, FakeTool::new(), RecordingTransport::new()).await;

    let handle = h.queue.submit(request(1, 1), muxed_selection()).unwrap();
    assert_eq!(
        wait(&handle).await,
        JobState::Failed(JobFailure::Fetch(FetchError::Rejected { status: 403 }))
    );
    assert_eq!(h.source.open_count(MUXED_URL), 1);
}

#[tokio::test]
async fn test_rate_limit_requeues_the_job() {
    let source = FakeSource::new().script(
        MUXED_URL,
        vec![
            Script::RateLimited {
                retry_after: Some(Duration::from_millis(30)),
            },
            Script::Body { size: 2048, chunk: 512 },
        ],
    );
    let h = Harness::start(source, FakeTool::new(), RecordingTransport::new()).await;

    let handle = h.queue.submit(request(1, 1), muxed_selection()).unwrap();
    assert_eq!(wait(&handle).await, JobState::Completed);
    assert_eq!(
        handle.history(),
        vec![
            JobState::Queued,
            JobState::Fetching,
            JobState::Queued,
            JobState::Fetching,
            JobState::Delivering,
            JobState::Completed
        ]
    );
    assert_eq!(h.transport.reports().len(), 1);
}

#[tokio::test]
async fn test_rate_limit_gives_up_after_max_requeues() {
    let source = FakeSource::new().script(MUXED_URL, vec![Script::RateLimited { retry_after: None }]);
    let h = Harness::start(source, FakeTool::new(), RecordingTransport::new()).await;

    let handle = h.queue.submit(request(1, 1), muxed_selection()).unwrap();
    let state = wait(&handle).await;
    assert!(
        matches!(
            state,
            JobState::Failed(JobFailure::Fetch(FetchError::QuotaOrRateLimited { .. }))
        ),
        "unexpected state {:?}",
        state
    );
    // First attempt plus two requeues
    assert_eq!(h.source.open_count(MUXED_URL), 3);
    assert_eq!(h.leftover_entries(), 0);
}

#[tokio::test]
async fn test_huge_retry_after_keeps_the_job_manageable() {
    let source = FakeSource::new().script(
        MUXED_URL,
        vec![Script::RateLimited {
            retry_after: Some(Duration::from_secs(u64::MAX)),
        }],
    );
    let h = Harness::start(source, FakeTool::new(), RecordingTransport::new()).await;

    let handle = h.queue.submit(request(1, 1), muxed_selection()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.history().len() < 3 || h.queue.active_len() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // Back in the queue with its slot released, waiting out a capped cooldown
    assert_eq!(
        handle.history(),
        vec![JobState::Queued, JobState::Fetching, JobState::Queued]
    );
    assert_eq!(h.queue.active_len(), 0);
    assert_eq!(h.queue.queued_len(), 1);

    handle.cancel();
    assert_eq!(wait(&handle).await, JobState::Cancelled);
    assert_eq!(h.queue.queued_len(), 0);
    assert_eq!(h.transport.reports().len(), 1);
    assert_eq!(h.leftover_entries(), 0);
}

#[tokio::test]
async fn test_cancel_before_rate_limit_is_not_requeued() {
    let source = FakeSource::new().script(
        MUXED_URL,
        vec![Script::CancelThenRateLimit {
            retry_after: Some(Duration::from_millis(10)),
        }],
    );
    let h = Harness::start(source, FakeTool::new(), RecordingTransport::new()).await;

    let handle = h.queue.submit(request(1, 1), muxed_selection()).unwrap();
    h.source.cancel_on_open(handle.clone());

    assert_eq!(wait(&handle).await, JobState::Cancelled);
    assert_eq!(h.source.open_count(MUXED_URL), 1);
    assert_eq!(h.queue.queued_len(), 0);
    assert_eq!(h.queue.active_len(), 0);
    assert_eq!(h.queue.active_job(SessionId(1)).map(|j| j.id()), None);

    let reports = h.transport.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].state, JobState::Cancelled);
    assert_eq!(h.leftover_entries(), 0);
}

#[tokio::test]
async fn test_cancel_during_fetch_cleans_up() {
    let source = FakeSource::new().script(MUXED_URL, vec![Script::Hang { size: 8192, sent: 1024 }]);
    let h = Harness::start(source, FakeTool::new(), RecordingTransport::new()).await;

    let handle = h.queue.submit(request(1, 1), muxed_selection()).unwrap();
    wait_for_state(&handle, JobState::Fetching).await;
    // Wait for the first bytes to land on disk
    tokio::time::timeout(Duration::from_secs(2), async {
        while h.leftover_bytes().await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    handle.cancel();
    assert_eq!(wait(&handle).await, JobState::Cancelled);
    assert_eq!(h.leftover_bytes().await, 0);
    assert_eq!(h.leftover_entries(), 0);
    assert_eq!(h.queue.active_len(), 0);

    let reports = h.transport.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].state, JobState::Cancelled);
}

#[tokio::test]
async fn test_cancel_while_queued() {
    let source = FakeSource::new()
        .script(MUXED_URL, vec![Script::Hang { size: 8192, sent: 512 }])
        .serve(AUDIO_URL, 1024);
    let h = Harness::start_with(source, FakeTool::new(), RecordingTransport::new(), |dir| {
        test_config(dir).limits(1, 1)
    })
    .await;

    let running = h.queue.submit(request(1, 7), muxed_selection()).unwrap();
    wait_for_state(&running, JobState::Fetching).await;

    let audio = Selection::audio(&[audio_only_320()], AudioCodec::M4a, 128).unwrap();
    let queued = h.queue.submit(request(2, 7), audio).unwrap();
    assert_eq!(h.queue.queue_position(SessionId(2)), Some(1));

    assert_eq!(h.queue.cancel_session(SessionId(2)), Some(queued.id()));
    assert_eq!(wait(&queued).await, JobState::Cancelled);
    assert_eq!(queued.history(), vec![JobState::Queued, JobState::Cancelled]);
    assert_eq!(h.source.open_count(AUDIO_URL), 0);

    running.cancel();
    assert_eq!(wait(&running).await, JobState::Cancelled);
    assert_eq!(h.queue.queued_len(), 0);
}

#[tokio::test]
async fn test_deadline_fails_slow_fetch() {
    let source = FakeSource::new().script(MUXED_URL, vec![Script::Hang { size: 8192, sent: 512 }]);
    let h = Harness::start_with(source, FakeTool::new(), RecordingTransport::new(), |dir| {
        test_config(dir).job_timeout(Duration::from_millis(200))
    })
    .await;

    let handle = h.queue.submit(request(1, 1), muxed_selection()).unwrap();
    let state = wait(&handle).await;
    assert!(
        matches!(state, JobState::Failed(JobFailure::Timeout(_))),
        "unexpected state {:?}",
        state
    );
    assert_eq!(h.leftover_entries(), 0);
    assert_eq!(h.queue.active_len(), 0);
}

#[tokio::test]
async fn test_cancel_during_muxing_cleans_up() {
    let source = FakeSource::new().serve(VIDEO_URL, 4096).serve(AUDIO_URL, 1024);
    let tool = FakeTool::new().with_run_time(Duration::from_secs(30));
    let h = Harness::start(source, tool, RecordingTransport::new()).await;

    let handle = h.queue.submit(request(1, 1), split_selection()).unwrap();
    wait_for_state(&handle, JobState::Muxing).await;
    assert_eq!(h.queue.active_len(), 1);

    handle.cancel();
    assert_eq!(wait(&handle).await, JobState::Cancelled);
    assert_eq!(
        handle.history(),
        vec![
            JobState::Queued,
            JobState::Fetching,
            JobState::Muxing,
            JobState::Cancelled
        ]
    );
    assert_eq!(h.leftover_entries(), 0);
    assert_eq!(h.queue.active_len(), 0);
    assert!(h.transport.artifacts().is_empty());

    let reports = h.transport.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].state, JobState::Cancelled);
}

#[tokio::test]
async fn test_deadline_fails_slow_mux() {
    let source = FakeSource::new().serve(VIDEO_URL, 4096).serve(AUDIO_URL, 1024);
    let tool = FakeTool::new().with_run_time(Duration::from_secs(30));
    let h = Harness::start_with(source, tool, RecordingTransport::new(), |dir| {
        test_config(dir).job_timeout(Duration::from_millis(300))
    })
    .await;

    let handle = h.queue.submit(request(1, 1), split_selection()).unwrap();
    let state = wait(&handle).await;
    assert!(
        matches!(state, JobState::Failed(JobFailure::Timeout(_))),
        "unexpected state {:?}",
        state
    );
    assert!(handle.history().contains(&JobState::Muxing));
    assert_eq!(h.leftover_entries(), 0);
    assert_eq!(h.queue.active_len(), 0);
    assert!(h.transport.artifacts().is_empty());
}

#[tokio::test]
async fn test_session_holds_one_job_at_a_time() {
    let source = FakeSource::new().serve(MUXED_URL, 2048);
    let h = Harness::start(source, FakeTool::new(), RecordingTransport::new()).await;

    let first = h.queue.submit(request(5, 5), muxed_selection()).unwrap();
    let err = h.queue.submit(request(5, 5), muxed_selection()).unwrap_err();
    assert_eq!(err, SubmitError::SessionBusy(first.id().to_string()));

    assert_eq!(wait(&first).await, JobState::Completed);
    // Bindings are released with the terminal transition
    let second = h.queue.submit(request(5, 5), muxed_selection()).unwrap();
    assert_eq!(wait(&second).await, JobState::Completed);
}

#[tokio::test]
async fn test_queue_bound_rejects_submissions() {
    let source = FakeSource::new().script(MUXED_URL, vec![Script::Hang { size: 8192, sent: 512 }]);
    let h = Harness::start_with(source, FakeTool::new(), RecordingTransport::new(), |dir| {
        test_config(dir).limits(1, 1).max_queue_size(1)
    })
    .await;

    let running = h.queue.submit(request(1, 1), muxed_selection()).unwrap();
    wait_for_state(&running, JobState::Fetching).await;
    let _queued = h.queue.submit(request(2, 1), muxed_selection()).unwrap();
    assert_eq!(
        h.queue.submit(request(3, 1), muxed_selection()).unwrap_err(),
        SubmitError::QueueFull(1)
    );

    h.queue.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_respect_queue_bound() {
    let source = FakeSource::new().script(MUXED_URL, vec![Script::Hang { size: 8192, sent: 512 }]);
    let h = Harness::start_with(source, FakeTool::new(), RecordingTransport::new(), |dir| {
        test_config(dir).limits(1, 1).max_queue_size(3)
    })
    .await;

    let running = h.queue.submit(request(0, 0), muxed_selection()).unwrap();
    wait_for_state(&running, JobState::Fetching).await;

    let mut tasks = Vec::new();
    for session in 1..=16 {
        let queue = h.queue.clone();
        tasks.push(tokio::spawn(async move {
            queue.submit(request(session, session), muxed_selection())
        }));
    }
    let mut accepted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(e) => assert_eq!(e, SubmitError::QueueFull(3)),
        }
    }
    assert_eq!(accepted, 3);
    assert_eq!(h.queue.queued_len(), 3);

    h.queue.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_caps_are_never_exceeded() {
    let source = FakeSource::with_chunk_delay(Duration::from_millis(5)).serve(MUXED_URL, 4096);
    let h = Harness::start_with(source, FakeTool::new(), RecordingTransport::new(), |dir| {
        test_config(dir).limits(2, 1)
    })
    .await;

    let mut handles = Vec::new();
    for user in 0..3 {
        for n in 0..2 {
            let session = user * 10 + n;
            let handle = h.queue.submit(request(session, user), muxed_selection()).unwrap();
            handles.push((user, handle));
        }
    }

    // A job in Fetching or Muxing always holds an admission slot
    let running = |s: &JobState| matches!(s, JobState::Fetching | JobState::Muxing);
    loop {
        assert!(h.queue.active_len() <= 2);
        let states: Vec<(i64, JobState)> = handles.iter().map(|(u, h)| (*u, h.state())).collect();
        let total = states.iter().filter(|(_, s)| running(s)).count();
        assert!(total <= 2, "global cap exceeded: {:?}", states);
        for user in 0..3 {
            let per_user = states.iter().filter(|(u, s)| *u == user && running(s)).count();
            assert!(per_user <= 1, "per-user cap exceeded for {}: {:?}", user, states);
        }
        if states.iter().all(|(_, s)| s.is_terminal()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    for (_, handle) in &handles {
        assert_eq!(handle.state(), JobState::Completed);
    }
    assert_eq!(h.transport.reports().len(), 6);
    assert_eq!(h.leftover_entries(), 0);
}

#[tokio::test]
async fn test_shutdown_cancels_jobs_and_refuses_new_ones() {
    let source = FakeSource::new().script(MUXED_URL, vec![Script::Hang { size: 8192, sent: 512 }]);
    let h = Harness::start(source, FakeTool::new(), RecordingTransport::new()).await;

    let handle = h.queue.submit(request(1, 1), muxed_selection()).unwrap();
    wait_for_state(&handle, JobState::Fetching).await;

    h.queue.shutdown(Duration::from_secs(2)).await;
    assert_eq!(handle.state(), JobState::Cancelled);
    assert_eq!(
        h.queue.submit(request(2, 2), muxed_selection()).unwrap_err(),
        SubmitError::ShuttingDown
    );
    assert_eq!(h.leftover_entries(), 0);
}

#[tokio::test]
async fn test_start_purges_stale_temp_files() {
    let temp = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(temp.path().join("stale-job/incoming")).unwrap();
    std::fs::write(temp.path().join("stale-job/incoming/video.mp4.part"), b"junk").unwrap();

    let source = std::sync::Arc::new(FakeSource::new());
    let _queue = grabcore::download::JobQueue::start(
        test_config(temp.path()),
        grabcore::download::Collaborators {
            source,
            tool: std::sync::Arc::new(FakeTool::new()),
            transport: std::sync::Arc::new(RecordingTransport::new()),
        },
    )
    .await
    .unwrap();

    assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
}
