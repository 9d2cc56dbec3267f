mod common;

use std::{fs, time::Duration};

use parameter_server::storage::InitState;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use worker::{
    CheckpointTimer, Phase, Saver, Session, Snapshot, TrainingUnit, VariableSet, WorkerErr,
    checkpoint::INDEX_FILE, summary::EVENTS_FILE, supervisor::FINAL_STEP_TAG,
};

use common::{
    Coordinator, MockEnvFactory, MockTrainerFactory, Tracker, config, run_worker, scratch_dir,
    status,
};

const CLEAN_RUN: [Phase; 6] = [
    Phase::Uninitialized,
    Phase::Connecting,
    Phase::Synchronized,
    Phase::Running,
    Phase::Stopping,
    Phase::Terminated,
];

#[tokio::test(flavor = "multi_thread")]
async fn chief_trains_to_the_threshold_and_closes_env_once() {
    let ps = Coordinator::start().await;
    let log_dir = scratch_dir("chief");
    let tracker = Tracker::default();

    let outcome = run_worker(
        ps.cluster(1),
        config(0, &log_dir, 10),
        MockEnvFactory {
            tracker: tracker.clone(),
            fail: false,
        },
        MockTrainerFactory::new(tracker.clone()),
        status(0).0,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.final_step, 10);
    assert!(outcome.initialized_shared_state);
    assert_eq!(outcome.history, CLEAN_RUN);
    assert_eq!(tracker.count("process"), 10);
    assert_eq!(tracker.closes(), 1);

    // A clean stop signals the peers.
    assert!(ps.store.should_stop());
    assert_eq!(ps.store.init_state(), InitState::Done);

    let mut w = Vec::new();
    ps.store.pull("global/w", &mut w).unwrap();
    assert_eq!(w, [6.0, 6.0]);

    let events = fs::read_to_string(log_dir.join("train_0").join(EVENTS_FILE)).unwrap();
    assert!(events.contains(FINAL_STEP_TAG));

    fs::remove_dir_all(&log_dir).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn environment_failure_never_opens_a_session() {
    let ps = Coordinator::start().await;
    let log_dir = scratch_dir("env-failure");
    let tracker = Tracker::default();

    let envs = MockEnvFactory {
        tracker: tracker.clone(),
        fail: true,
    };
    let trainers = MockTrainerFactory::new(tracker.clone());

    let err = TrainingUnit::build(&config(0, &log_dir, 10), &envs, &trainers)
        .err()
        .unwrap();

    assert!(matches!(err, WorkerErr::EnvConstruction { rank: 0, .. }));
    assert!(err.to_string().contains("worker_0"));
    assert_eq!(tracker.trainers_built.load(std::sync::atomic::Ordering::SeqCst), 0);

    // Nothing reached the coordination layer or the disk.
    assert!(ps.store.is_empty());
    assert_eq!(ps.store.init_state(), InitState::Uninitialized);
    assert!(!log_dir.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn trainer_failure_closes_the_environment() {
    let log_dir = scratch_dir("trainer-failure");
    let tracker = Tracker::default();

    let envs = MockEnvFactory {
        tracker: tracker.clone(),
        fail: false,
    };
    let trainers = MockTrainerFactory {
        fail: true,
        ..MockTrainerFactory::new(tracker.clone())
    };

    let err = TrainingUnit::build(&config(1, &log_dir, 10), &envs, &trainers)
        .err()
        .unwrap();

    assert!(matches!(err, WorkerErr::TrainerConstruction { rank: 1, .. }));
    assert_eq!(tracker.closes(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn diagnostic_mode_needs_an_environment_id() {
    let log_dir = scratch_dir("diagnostic");
    let tracker = Tracker::default();

    let envs = MockEnvFactory {
        tracker: tracker.clone(),
        fail: false,
    };
    let trainers = MockTrainerFactory::new(tracker.clone());

    let mut cfg = config(0, &log_dir, 10);
    cfg.test_mode = true;

    let err = TrainingUnit::build(&cfg, &envs, &trainers).err().unwrap();
    assert!(matches!(err, WorkerErr::EnvConstruction { .. }));

    cfg.env_kwargs
        .insert("gym_id", serde_json::Value::from("CartPole-v0"));
    assert!(TrainingUnit::build(&cfg, &envs, &trainers).is_ok());
    assert_eq!(tracker.events(), ["diagnostic"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn non_chief_waits_until_the_chief_initializes() {
    let ps = Coordinator::start().await;
    let cluster = ps.cluster(2);
    let log_dir = scratch_dir("non-chief");
    let chief_tracker = Tracker::default();
    let follower_tracker = Tracker::default();

    let (follower_status, follower_rx) = status(1);
    let follower = tokio::spawn(run_worker(
        cluster.clone(),
        config(1, &log_dir, 6),
        MockEnvFactory {
            tracker: follower_tracker.clone(),
            fail: false,
        },
        MockTrainerFactory::new(follower_tracker.clone()),
        follower_status,
        CancellationToken::new(),
    ));

    sleep(Duration::from_millis(300)).await;

    assert!(!follower.is_finished());
    assert_eq!(follower_rx.borrow().phase, "connecting");
    assert!(ps.store.is_empty());
    assert_eq!(follower_tracker.count("sync"), 0);

    let chief = run_worker(
        cluster,
        config(0, &log_dir, 6),
        MockEnvFactory {
            tracker: chief_tracker.clone(),
            fail: false,
        },
        MockTrainerFactory::new(chief_tracker.clone()),
        status(0).0,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let follower = follower.await.unwrap().unwrap();

    assert!(chief.initialized_shared_state);
    assert!(!follower.initialized_shared_state);
    assert_eq!(follower.history.last(), Some(&Phase::Terminated));
    assert_eq!(follower_tracker.closes(), 1);
    assert_eq!(chief_tracker.closes(), 1);

    fs::remove_dir_all(&log_dir).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn replay_memory_is_filled_once_before_the_first_iteration() {
    let ps = Coordinator::start().await;
    let log_dir = scratch_dir("replay");
    let tracker = Tracker::default();

    let trainers = MockTrainerFactory {
        replay_memory: true,
        ..MockTrainerFactory::new(tracker.clone())
    };

    run_worker(
        ps.cluster(1),
        config(0, &log_dir, 3),
        MockEnvFactory {
            tracker: tracker.clone(),
            fail: false,
        },
        trainers,
        status(0).0,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(
        tracker.events(),
        ["sync", "start", "fill", "process", "process", "process"]
    );

    fs::remove_dir_all(&log_dir).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn no_iteration_when_the_threshold_is_already_reached() {
    let ps = Coordinator::start().await;
    let log_dir = scratch_dir("reached");
    let tracker = Tracker::default();
    ps.store.assign_step(10);

    let outcome = run_worker(
        ps.cluster(1),
        config(0, &log_dir, 10),
        MockEnvFactory {
            tracker: tracker.clone(),
            fail: false,
        },
        MockTrainerFactory::new(tracker.clone()),
        status(0).0,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.final_step, 10);
    assert_eq!(tracker.count("process"), 0);
    assert_eq!(tracker.closes(), 1);

    fs::remove_dir_all(&log_dir).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn an_iteration_may_overshoot_the_threshold() {
    let ps = Coordinator::start().await;
    let log_dir = scratch_dir("overshoot");
    let tracker = Tracker::default();

    let trainers = MockTrainerFactory {
        step_by: 3,
        ..MockTrainerFactory::new(tracker.clone())
    };

    let outcome = run_worker(
        ps.cluster(1),
        config(0, &log_dir, 10),
        MockEnvFactory {
            tracker: tracker.clone(),
            fail: false,
        },
        trainers,
        status(0).0,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.final_step, 12);
    assert_eq!(tracker.count("process"), 4);

    fs::remove_dir_all(&log_dir).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn iteration_error_fails_the_lifecycle_and_still_closes_env() {
    let ps = Coordinator::start().await;
    let log_dir = scratch_dir("iteration-error");
    let tracker = Tracker::default();

    let trainers = MockTrainerFactory {
        fail_at: Some(3),
        ..MockTrainerFactory::new(tracker.clone())
    };

    let err = run_worker(
        ps.cluster(1),
        config(0, &log_dir, 10),
        MockEnvFactory {
            tracker: tracker.clone(),
            fail: false,
        },
        trainers,
        status(0).0,
        CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.rank, 0);
    assert_eq!(err.phase, Phase::Running);
    assert!(matches!(err.source, WorkerErr::Trainer { op: "process", .. }));
    assert_eq!(tracker.count("process"), 3);
    assert_eq!(tracker.closes(), 1);

    // Peers are not told to stop after a failure.
    assert!(!ps.store.should_stop());

    fs::remove_dir_all(&log_dir).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn a_peer_stop_request_ends_training_cleanly() {
    let ps = Coordinator::start().await;
    let log_dir = scratch_dir("peer-stop");
    let tracker = Tracker::default();

    let trainers = MockTrainerFactory {
        delay: Duration::from_millis(10),
        ..MockTrainerFactory::new(tracker.clone())
    };

    let worker = tokio::spawn(run_worker(
        ps.cluster(1),
        config(0, &log_dir, u64::MAX),
        MockEnvFactory {
            tracker: tracker.clone(),
            fail: false,
        },
        trainers,
        status(0).0,
        CancellationToken::new(),
    ));

    sleep(Duration::from_millis(200)).await;
    ps.store.request_stop();

    let outcome = worker.await.unwrap().unwrap();

    assert_eq!(outcome.history, CLEAN_RUN);
    assert!(outcome.final_step > 0);
    assert_eq!(tracker.closes(), 1);

    fs::remove_dir_all(&log_dir).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn a_local_interrupt_stops_the_loop_and_the_peers() {
    let ps = Coordinator::start().await;
    let log_dir = scratch_dir("interrupt");
    let tracker = Tracker::default();
    let stop = CancellationToken::new();

    let trainers = MockTrainerFactory {
        delay: Duration::from_millis(10),
        ..MockTrainerFactory::new(tracker.clone())
    };

    let worker = tokio::spawn(run_worker(
        ps.cluster(1),
        config(0, &log_dir, u64::MAX),
        MockEnvFactory {
            tracker: tracker.clone(),
            fail: false,
        },
        trainers,
        status(0).0,
        stop.clone(),
    ));

    sleep(Duration::from_millis(200)).await;
    stop.cancel();

    let outcome = worker.await.unwrap().unwrap();

    assert_eq!(outcome.history.last(), Some(&Phase::Terminated));
    assert!(ps.store.should_stop());

    fs::remove_dir_all(&log_dir).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn interrupt_while_waiting_for_the_chief_fails() {
    let ps = Coordinator::start().await;
    let log_dir = scratch_dir("interrupt-waiting");
    let tracker = Tracker::default();
    let stop = CancellationToken::new();

    let follower = tokio::spawn(run_worker(
        ps.cluster(2),
        config(1, &log_dir, 10),
        MockEnvFactory {
            tracker: tracker.clone(),
            fail: false,
        },
        MockTrainerFactory::new(tracker.clone()),
        status(1).0,
        stop.clone(),
    ));

    sleep(Duration::from_millis(100)).await;
    stop.cancel();

    let err = follower.await.unwrap().unwrap_err();

    assert_eq!(err.phase, Phase::Connecting);
    assert!(matches!(err.source, WorkerErr::Interrupted));
    assert_eq!(tracker.closes(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn chief_checkpoints_and_restores_after_a_restart() {
    let log_dir = scratch_dir("checkpoint");
    let train_dir = log_dir.join("train");

    {
        let ps = Coordinator::start().await;
        let tracker = Tracker::default();

        let mut cfg = config(0, &log_dir, 40);
        cfg.save_interval = Duration::from_millis(50);
        cfg.max_to_keep = 2;

        let trainers = MockTrainerFactory {
            delay: Duration::from_millis(10),
            ..MockTrainerFactory::new(tracker.clone())
        };

        run_worker(
            ps.cluster(1),
            cfg,
            MockEnvFactory {
                tracker: tracker.clone(),
                fail: false,
            },
            trainers,
            status(0).0,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    }

    let snapshots = fs::read_dir(&train_dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("model.ckpt-"))
        .count();

    assert!((1..=2).contains(&snapshots), "{snapshots} snapshots kept");

    let index: serde_json::Value =
        serde_json::from_slice(&fs::read(train_dir.join(INDEX_FILE)).unwrap()).unwrap();
    let latest = index["latest"].as_str().unwrap();
    let snapshot: Snapshot =
        serde_json::from_slice(&fs::read(train_dir.join(latest)).unwrap()).unwrap();
    assert!(snapshot.global_step > 0);

    // A fresh coordination layer comes back with the checkpointed state.
    let ps = Coordinator::start().await;
    let tracker = Tracker::default();

    let outcome = run_worker(
        ps.cluster(1),
        config(0, &log_dir, 0),
        MockEnvFactory {
            tracker: tracker.clone(),
            fail: false,
        },
        MockTrainerFactory::new(tracker.clone()),
        status(0).0,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(outcome.initialized_shared_state);
    assert_eq!(outcome.final_step, snapshot.global_step);
    assert_eq!(tracker.count("process"), 0);

    let mut w = Vec::new();
    ps.store.pull("global/w", &mut w).unwrap();
    assert_eq!(w, snapshot.variables["global/w"]);

    fs::remove_dir_all(&log_dir).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn non_chief_waits_until_the_chief_finishes_restoring() {
    let ps = Coordinator::start().await;
    let log_dir = scratch_dir("mid-restore");
    let tracker = Tracker::default();

    // The chief won the election and restored the variables but not the step yet.
    assert!(ps.store.claim_init(0));
    ps.store.assign("global/w", &[1.0, 1.0]).unwrap();
    ps.store.assign("global/b", &[0.0]).unwrap();

    let (follower_status, follower_rx) = status(1);
    let follower = tokio::spawn(run_worker(
        ps.cluster(2),
        config(1, &log_dir, 5),
        MockEnvFactory {
            tracker: tracker.clone(),
            fail: false,
        },
        MockTrainerFactory::new(tracker.clone()),
        follower_status,
        CancellationToken::new(),
    ));

    sleep(Duration::from_millis(300)).await;

    assert!(!follower.is_finished());
    assert_eq!(follower_rx.borrow().phase, "connecting");
    assert_eq!(tracker.count("sync"), 0);

    ps.store.assign_step(1000);
    ps.store.finish_init();

    let outcome = follower.await.unwrap().unwrap();

    assert!(!outcome.initialized_shared_state);
    assert_eq!(outcome.final_step, 1000);
    assert_eq!(tracker.count("process"), 0);
    assert_eq!(tracker.closes(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn a_zero_save_interval_disables_checkpointing() {
    let ps = Coordinator::start().await;
    let log_dir = scratch_dir("no-checkpoints");
    let tracker = Tracker::default();

    let mut cfg = config(0, &log_dir, 20);
    cfg.save_interval = Duration::ZERO;

    let outcome = run_worker(
        ps.cluster(1),
        cfg,
        MockEnvFactory {
            tracker: tracker.clone(),
            fail: false,
        },
        MockTrainerFactory::new(tracker.clone()),
        status(0).0,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.history, CLEAN_RUN);
    assert_eq!(tracker.count("process"), 20);
    assert!(!log_dir.join("train").exists());

    fs::remove_dir_all(&log_dir).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn no_checkpoint_timer_runs_on_a_zero_interval() {
    let ps = Coordinator::start().await;
    let log_dir = scratch_dir("timer");
    let vars = VariableSet::new(common::declared_variables()).unwrap();

    let session = Session::connect(
        &ps.cluster(1),
        0,
        &vars,
        Duration::from_millis(20),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let saver = Saver::new(log_dir.join("train"), &vars, 1);
    assert!(CheckpointTimer::spawn(saver.clone(), session.clone(), Duration::ZERO).is_none());

    let timer = CheckpointTimer::spawn(saver, session.clone(), Duration::from_secs(60)).unwrap();
    timer.stop().await;
    session.close().await.unwrap();

    assert!(!log_dir.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn a_snapshot_with_another_shape_is_not_restored() {
    let ps = Coordinator::start().await;
    let log_dir = scratch_dir("mismatch");
    let train_dir = log_dir.join("train");
    let tracker = Tracker::default();

    let snapshot = Snapshot {
        global_step: 7,
        variables: [
            ("global/w".to_string(), vec![1.0, 2.0, 3.0]),
            ("global/b".to_string(), vec![0.0]),
        ]
        .into(),
    };

    fs::create_dir_all(&train_dir).unwrap();
    fs::write(
        train_dir.join("model.ckpt-7.json"),
        serde_json::to_vec(&snapshot).unwrap(),
    )
    .unwrap();
    fs::write(
        train_dir.join(INDEX_FILE),
        r#"{"latest": "model.ckpt-7.json", "all": ["model.ckpt-7.json"]}"#,
    )
    .unwrap();

    let err = run_worker(
        ps.cluster(1),
        config(0, &log_dir, 10),
        MockEnvFactory {
            tracker: tracker.clone(),
            fail: false,
        },
        MockTrainerFactory::new(tracker.clone()),
        status(0).0,
        CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.phase, Phase::Connecting);
    assert!(matches!(
        &err.source,
        WorkerErr::SnapshotMismatch { name, expected: 2, got: 3, .. } if *name == "global/w"
    ));

    // Nothing of the snapshot reached the shared state.
    assert!(ps.store.is_empty());
    assert_eq!(ps.store.global_step(), 0);
    assert_eq!(tracker.count("process"), 0);
    assert_eq!(tracker.closes(), 1);

    fs::remove_dir_all(&log_dir).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn a_failing_environment_close_does_not_block_teardown() {
    let ps = Coordinator::start().await;
    let log_dir = scratch_dir("close-failure");
    let tracker = Tracker::with_failing_close();

    let outcome = run_worker(
        ps.cluster(1),
        config(0, &log_dir, 3),
        MockEnvFactory {
            tracker: tracker.clone(),
            fail: false,
        },
        MockTrainerFactory::new(tracker.clone()),
        status(0).0,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.history, CLEAN_RUN);
    assert_eq!(outcome.final_step, 3);
    assert_eq!(tracker.closes(), 1);

    // The rest of the stop sequence still ran.
    assert!(ps.store.should_stop());

    fs::remove_dir_all(&log_dir).unwrap();
}
