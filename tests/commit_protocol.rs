mod common;

use collage::message::{PrepareRequest, Reply, ReplyKind};
use collage::network::{Delivery, Message, Transport};
use collage::prelude::*;
use common::*;
use std::thread;
use std::time::Duration;

const FILES: &[(&str, &[&str])] = &[("a", &["1.jpg"]), ("b", &["2.jpg"]), ("c", &["3.jpg"])];
const SOURCES: [&str; 3] = ["a:1.jpg", "b:2.jpg", "c:3.jpg"];

#[test]
fn test_unanimous_yes_publishes_artifact_and_deletes_sources() {
    let cluster = Cluster::new(FILES);
    let coordinator = cluster.start_coordinator(cluster.coordinator_config());

    let id = coordinator
        .start_commit("collage.jpg", b"collage".to_vec(), &SOURCES)
        .unwrap();
    assert!(wait_for_condition(|| !coordinator.is_active(&id), 5000));

    // The artifact is published and every source file is consumed.
    assert_eq!(cluster.artifact("collage.jpg").unwrap(), b"collage");
    for (node, file) in [("a", "1.jpg"), ("b", "2.jpg"), ("c", "3.jpg")] {
        assert!(!cluster.source_exists(node, file));
        assert_eq!(cluster.locked_files(node), 0);
        assert_eq!(cluster.times_asked(node), 1);
    }
    assert_eq!(log_files(&cluster.coordinator_log_dir()), 0);
    coordinator.shutdown();
}

#[test]
fn test_single_no_aborts_without_side_effects() {
    let cluster = Cluster::new(FILES);
    cluster.set_approval("c", false);
    let coordinator = cluster.start_coordinator(cluster.coordinator_config());

    let id = coordinator
        .start_commit("collage.jpg", b"collage".to_vec(), &SOURCES)
        .unwrap();
    assert!(wait_for_condition(|| !coordinator.is_active(&id), 5000));

    assert!(cluster.artifact("collage.jpg").is_none());
    for (node, file) in [("a", "1.jpg"), ("b", "2.jpg"), ("c", "3.jpg")] {
        assert!(cluster.source_exists(node, file));
        assert_eq!(cluster.locked_files(node), 0);
    }
    assert_eq!(log_files(&cluster.coordinator_log_dir()), 0);
}

#[test]
fn test_missing_source_file_aborts() {
    let cluster = Cluster::new(FILES);
    let coordinator = cluster.start_coordinator(cluster.coordinator_config());

    let id = coordinator
        .start_commit("collage.jpg", b"collage".to_vec(), &["a:1.jpg", "b:nope.jpg"])
        .unwrap();
    assert!(wait_for_condition(|| !coordinator.is_active(&id), 5000));

    assert!(cluster.artifact("collage.jpg").is_none());
    assert!(cluster.source_exists("a", "1.jpg"));
    // A missing file means the user is never asked.
    assert_eq!(cluster.times_asked("b"), 0);
}

#[test]
fn test_silent_participant_times_out_and_late_vote_is_dropped() {
    let cluster = Cluster::new(FILES);
    let config = cluster
        .coordinator_config()
        .with_prepare_timeout(Duration::from_millis(300));
    let coordinator = cluster.start_coordinator(config);

    // B hears nothing and says nothing until the deadline has passed.
    cluster.network.set_offline("b", true);
    let id = coordinator
        .start_commit("collage.jpg", b"collage".to_vec(), &SOURCES)
        .unwrap();
    assert!(wait_for_condition(
        || coordinator.phase_of(&id) != Some(Phase::Prepare),
        5000
    ));
    assert_eq!(coordinator.phase_of(&id), Some(Phase::Abort));

    // The delayed prepare finally reaches B, whose Yes arrives too late.
    cluster.network.set_offline("b", false);
    let late = PrepareRequest {
        txn_id: id.clone(),
        files: vec!["2.jpg".to_string()],
        image: b"collage".to_vec(),
    };
    cluster.participant("b").handle_prepare(SERVER, &late).unwrap();

    assert!(wait_for_condition(|| !coordinator.is_active(&id), 5000));
    assert!(cluster.artifact("collage.jpg").is_none());
    for (node, file) in [("a", "1.jpg"), ("b", "2.jpg"), ("c", "3.jpg")] {
        assert!(cluster.source_exists(node, file));
        assert!(wait_for_condition(|| cluster.locked_files(node) == 0, 2000));
    }
}

#[test]
fn test_duplicated_messages_ask_each_user_once() {
    let cluster = Cluster::new(FILES);
    cluster.network.set_link_filter(|_, _| Delivery::Duplicate);
    let coordinator = cluster.start_coordinator(cluster.coordinator_config());

    let id = coordinator
        .start_commit("collage.jpg", b"collage".to_vec(), &SOURCES)
        .unwrap();
    assert!(wait_for_condition(|| !coordinator.is_active(&id), 5000));

    assert_eq!(cluster.artifact("collage.jpg").unwrap(), b"collage");
    for node in ["a", "b", "c"] {
        assert_eq!(cluster.times_asked(node), 1);
    }
}

#[test]
fn test_overlapping_commits_are_mutually_exclusive() {
    let cluster = Cluster::new(&[("a", &["shared.jpg"]), ("b", &["1.jpg", "2.jpg"])]);
    let coordinator = cluster.start_coordinator(cluster.coordinator_config());

    let first = coordinator
        .start_commit("first.jpg", b"1".to_vec(), &["a:shared.jpg", "b:1.jpg"])
        .unwrap();
    let second = coordinator
        .start_commit("second.jpg", b"2".to_vec(), &["a:shared.jpg", "b:2.jpg"])
        .unwrap();
    assert!(wait_for_condition(
        || coordinator.active_transactions().is_empty(),
        5000
    ));
    assert!(!coordinator.is_active(&first) && !coordinator.is_active(&second));

    // Exactly one of them consumed the shared file.
    let published = [
        cluster.artifact("first.jpg").is_some(),
        cluster.artifact("second.jpg").is_some(),
    ];
    assert_eq!(published.iter().filter(|p| **p).count(), 1);
    assert!(!cluster.source_exists("a", "shared.jpg"));
    assert_eq!(cluster.source_exists("b", "1.jpg"), published[1]);
    assert_eq!(cluster.source_exists("b", "2.jpg"), published[0]);
}

#[test]
fn test_invalid_requests_are_rejected_up_front() {
    let cluster = Cluster::new(FILES);
    let coordinator = cluster.start_coordinator(cluster.coordinator_config());

    let no_sources: [&str; 0] = [];
    assert!(matches!(
        coordinator.start_commit("x.jpg", vec![], &no_sources),
        Err(CollageError::InvalidSource(_))
    ));
    assert!(coordinator.start_commit("x.jpg", vec![], &["a1.jpg"]).is_err());
    assert!(coordinator.start_commit("../x.jpg", vec![], &["a:1.jpg"]).is_err());
    assert!(coordinator.start_commit("x.jpg", vec![], &["a:../1.jpg"]).is_err());
    assert!(coordinator.active_transactions().is_empty());
    assert_eq!(log_files(&cluster.coordinator_log_dir()), 0);
}

#[test]
fn test_replies_for_unknown_transactions_are_ignored() {
    let cluster = Cluster::new(FILES);
    let coordinator = cluster.start_coordinator(cluster.coordinator_config());
    let stranger = cluster.network.endpoint("stranger");

    let unknown = Reply::new(TxnId::generate(), ReplyKind::Yes);
    stranger.send(Message::new(SERVER, unknown.encode())).unwrap();
    stranger.send(Message::new(SERVER, b"garbage".to_vec())).unwrap();
    thread::sleep(Duration::from_millis(100));

    // The coordinator is still serving.
    let id = coordinator
        .start_commit("collage.jpg", b"collage".to_vec(), &SOURCES)
        .unwrap();
    assert!(wait_for_condition(|| !coordinator.is_active(&id), 5000));
    assert!(cluster.artifact("collage.jpg").is_some());
}
