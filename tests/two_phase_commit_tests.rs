//! End-to-end Two-Phase Commit scenarios
//!
//! Coordinator and participants run in-process over localhost TCP with
//! short configured timeouts. Atomicity is asserted through the only
//! externally observable state: composites on the coordinator's disk,
//! source files and lock tables on the participants'.

use mosaic_rust::{
    ApprovalPolicy, AutoApprove, CommitMessage, CommitPhase, Coordinator, CoordinatorConfig,
    MessageHandler, MessageType, Network, NetworkConfig, Participant,
};
use std::fs;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn any_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn short_config() -> CoordinatorConfig {
    CoordinatorConfig {
        phase_one_timeout: Duration::from_secs(2),
        phase_two_timeout: Duration::from_millis(300),
    }
}

fn test_network_config() -> NetworkConfig {
    NetworkConfig {
        request_timeout: Duration::from_secs(2),
        ..NetworkConfig::default()
    }
}

struct ParticipantNode {
    dir: TempDir,
    participant: Arc<Participant>,
    addr: SocketAddr,
}

impl ParticipantNode {
    fn has_file(&self, name: &str) -> bool {
        self.dir.path().join(name).exists()
    }
}

async fn spawn_participant(
    node_id: &str,
    files: &[&str],
    policy: Arc<dyn ApprovalPolicy>,
) -> ParticipantNode {
    let dir = TempDir::new().unwrap();
    for file in files {
        fs::write(dir.path().join(file), b"pixels").unwrap();
    }
    let participant = Participant::new(node_id, dir.path(), policy).unwrap();
    participant.recover().unwrap();
    let network = Network::new(node_id, test_network_config());
    let addr = network
        .start_listener(any_addr(), participant.handler())
        .await
        .unwrap();
    ParticipantNode {
        dir,
        participant,
        addr,
    }
}

async fn spawn_coordinator(
    peers: &[(&str, SocketAddr)],
    config: CoordinatorConfig,
) -> (TempDir, Arc<Coordinator>) {
    let dir = TempDir::new().unwrap();
    let network = Network::new("coordinator", test_network_config());
    for (node, addr) in peers {
        network.add_peer(node.to_string(), *addr);
    }
    let coordinator = Coordinator::new(Arc::clone(&network), dir.path(), config);
    network
        .start_listener(any_addr(), coordinator.handler())
        .await
        .unwrap();
    coordinator.recover().await.unwrap();
    (dir, coordinator)
}

/// Poll until `check` passes or five seconds elapse.
async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn sources(refs: &[&str]) -> Vec<String> {
    refs.iter().map(|s| s.to_string()).collect()
}

/// Scenario: two sequential commits sharing one source file. The first
/// consumes `a:1.jpg`; the second must then draw a no-vote and abort
/// without writing its composite.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sequential_commits_with_shared_source() {
    let a = spawn_participant("a", &["1.jpg"], Arc::new(AutoApprove)).await;
    let b = spawn_participant("b", &["3.jpg", "4.jpg"], Arc::new(AutoApprove)).await;
    let c = spawn_participant("c", &["6.jpg"], Arc::new(AutoApprove)).await;
    let d = spawn_participant("d", &["carnegie.jpg"], Arc::new(AutoApprove)).await;

    let (work_dir, coordinator) = spawn_coordinator(
        &[
            ("a", a.addr),
            ("b", b.addr),
            ("c", c.addr),
            ("d", d.addr),
        ],
        short_config(),
    )
    .await;

    coordinator
        .start_commit(
            "composites/1.jpg",
            b"img1".to_vec(),
            &sources(&["a:1.jpg", "b:3.jpg", "c:6.jpg"]),
        )
        .await;
    wait_for("first commit to finish", || coordinator.in_flight() == 0).await;

    assert!(work_dir.path().join("composites/1.jpg").exists());
    assert!(!a.has_file("1.jpg"));
    assert!(!b.has_file("3.jpg"));
    assert!(!c.has_file("6.jpg"));

    coordinator
        .start_commit(
            "composites/2.jpg",
            b"img2".to_vec(),
            &sources(&["a:1.jpg", "b:4.jpg", "d:carnegie.jpg"]),
        )
        .await;
    wait_for("second commit to finish", || coordinator.in_flight() == 0).await;

    // a:1.jpg was already consumed, so the second commit aborted whole.
    assert!(!work_dir.path().join("composites/2.jpg").exists());
    assert!(b.has_file("4.jpg"));
    assert!(d.has_file("carnegie.jpg"));
    assert_eq!(b.participant.lock_count(), 0);
    assert_eq!(d.participant.lock_count(), 0);
}

/// Scenario: one operator denies. Decision is `no`; nothing is written,
/// nothing is deleted, every tentative lock is released.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_operator_denial_aborts_commit() {
    let deny = |_: &[u8], _: &[String]| false;
    let a = spawn_participant("a", &["1.jpg"], Arc::new(AutoApprove)).await;
    let b = spawn_participant("b", &["2.jpg"], Arc::new(deny)).await;
    let c = spawn_participant("c", &["3.jpg"], Arc::new(AutoApprove)).await;

    let (work_dir, coordinator) = spawn_coordinator(
        &[("a", a.addr), ("b", b.addr), ("c", c.addr)],
        short_config(),
    )
    .await;

    coordinator
        .start_commit(
            "composites/1.jpg",
            b"img".to_vec(),
            &sources(&["a:1.jpg", "b:2.jpg", "c:3.jpg"]),
        )
        .await;
    wait_for("denied commit to finish", || coordinator.in_flight() == 0).await;

    assert!(!work_dir.path().join("composites/1.jpg").exists());
    for node in [&a, &b, &c] {
        assert_eq!(node.participant.lock_count(), 0);
    }
    assert!(a.has_file("1.jpg"));
    assert!(b.has_file("2.jpg"));
    assert!(c.has_file("3.jpg"));
}

/// Scenario: one participant is unreachable in Phase I. Silence converts
/// to an abort decision after the vote window; survivors release their
/// locks. The unreachable node pins the commit in Phase II resend, which
/// is the accepted liveness trade, so the test does not wait for DONE.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_participant_aborts_phase_one() {
    let a = spawn_participant("a", &["1.jpg"], Arc::new(AutoApprove)).await;
    let b = spawn_participant("b", &["2.jpg"], Arc::new(AutoApprove)).await;

    // A port with nothing behind it: bind, read the address, drop.
    let dead_addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let config = CoordinatorConfig {
        phase_one_timeout: Duration::from_millis(500),
        phase_two_timeout: Duration::from_millis(300),
    };
    let (work_dir, coordinator) = spawn_coordinator(
        &[("a", a.addr), ("b", b.addr), ("ghost", dead_addr)],
        config,
    )
    .await;

    coordinator
        .start_commit(
            "composites/1.jpg",
            b"img".to_vec(),
            &sources(&["a:1.jpg", "b:2.jpg", "ghost:9.jpg"]),
        )
        .await;

    wait_for("survivors to release their locks", || {
        a.participant.lock_count() == 0 && b.participant.lock_count() == 0
    })
    .await;

    assert!(!work_dir.path().join("composites/1.jpg").exists());
    assert!(a.has_file("1.jpg"));
    assert!(b.has_file("2.jpg"));
}

/// Scenario: a participant crashes in Phase II after voting yes and before
/// deleting its file. The handler wrapper drops the first decision message
/// (the crash) and rebuilds the participant from its log (the restart);
/// the coordinator's resend then converges.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_participant_crash_in_phase_two_converges_on_resend() {
    let a = spawn_participant("a", &["1.jpg"], Arc::new(AutoApprove)).await;

    let b_dir = TempDir::new().unwrap();
    fs::write(b_dir.path().join("2.jpg"), b"pixels").unwrap();
    let b1 = Participant::new("b", b_dir.path(), Arc::new(AutoApprove)).unwrap();
    b1.recover().unwrap();

    let crashed = Arc::new(AtomicBool::new(false));
    let active: Arc<Mutex<MessageHandler>> = Arc::new(Mutex::new(b1.handler()));
    let rebuilt: Arc<Mutex<Option<Arc<Participant>>>> = Arc::new(Mutex::new(None));

    let wrapper: MessageHandler = {
        let crashed = Arc::clone(&crashed);
        let active = Arc::clone(&active);
        let rebuilt = Arc::clone(&rebuilt);
        let b_path = b_dir.path().to_path_buf();
        Arc::new(move |msg: CommitMessage| {
            if msg.msg_type == MessageType::CommitMsg && !crashed.swap(true, Ordering::SeqCst) {
                // Crash: the decision is lost before any effect. Restart:
                // replay the lock log into a fresh participant.
                let restarted =
                    Participant::new("b", &b_path, Arc::new(AutoApprove)).unwrap();
                restarted.recover().unwrap();
                assert_eq!(restarted.lock_holder("2.jpg").as_deref(), Some("composites/1.jpg"));
                *active.lock().unwrap() = restarted.handler();
                *rebuilt.lock().unwrap() = Some(restarted);
                return None;
            }
            let handler = active.lock().unwrap().clone();
            handler(msg)
        })
    };

    let b_network = Network::new("b", test_network_config());
    let b_addr = b_network.start_listener(any_addr(), wrapper).await.unwrap();

    let (work_dir, coordinator) =
        spawn_coordinator(&[("a", a.addr), ("b", b_addr)], short_config()).await;

    coordinator
        .start_commit(
            "composites/1.jpg",
            b"img".to_vec(),
            &sources(&["a:1.jpg", "b:2.jpg"]),
        )
        .await;
    wait_for("commit to converge after resend", || {
        coordinator.in_flight() == 0
    })
    .await;

    assert!(crashed.load(Ordering::SeqCst));
    assert!(work_dir.path().join("composites/1.jpg").exists());
    assert!(!a.has_file("1.jpg"));
    assert!(!b_dir.path().join("2.jpg").exists());
}

/// Scenario: two commits referencing the same source start concurrently.
/// The slow approver keeps the first commit in Phase I while the second's
/// query hits the already-locked file; exactly one commit wins.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_commits_conflict_on_shared_source() {
    let slow_approve = |_: &[u8], _: &[String]| {
        std::thread::sleep(Duration::from_millis(400));
        true
    };
    let a = spawn_participant("a", &["1.jpg"], Arc::new(AutoApprove)).await;
    let b = spawn_participant("b", &["3.jpg"], Arc::new(slow_approve)).await;
    let c = spawn_participant("c", &["5.jpg"], Arc::new(AutoApprove)).await;

    let (work_dir, coordinator) = spawn_coordinator(
        &[("a", a.addr), ("b", b.addr), ("c", c.addr)],
        short_config(),
    )
    .await;

    coordinator
        .start_commit(
            "composites/1.jpg",
            b"img1".to_vec(),
            &sources(&["a:1.jpg", "b:3.jpg"]),
        )
        .await;
    // Let the first commit take its lock on a before the rival asks.
    wait_for("first commit to lock a:1.jpg", || {
        a.participant.lock_holder("1.jpg").is_some()
    })
    .await;
    assert_eq!(
        coordinator.commit_phase("composites/1.jpg"),
        Some(CommitPhase::PhaseOne)
    );

    coordinator
        .start_commit(
            "composites/2.jpg",
            b"img2".to_vec(),
            &sources(&["a:1.jpg", "c:5.jpg"]),
        )
        .await;

    wait_for("both commits to finish", || coordinator.in_flight() == 0).await;

    assert!(work_dir.path().join("composites/1.jpg").exists());
    assert!(!work_dir.path().join("composites/2.jpg").exists());
    assert!(!a.has_file("1.jpg"));
    assert!(!b.has_file("3.jpg"));
    assert!(c.has_file("5.jpg"));
    assert_eq!(c.participant.lock_count(), 0);
}

/// A vote that lands after the Phase I window is ignored: the commit has
/// already aborted, the late voter's locks are still released by the abort
/// broadcast, and nothing panics.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_late_vote_after_timeout_is_ignored() {
    let tardy_approve = |_: &[u8], _: &[String]| {
        std::thread::sleep(Duration::from_millis(700));
        true
    };
    let a = spawn_participant("a", &["1.jpg"], Arc::new(AutoApprove)).await;
    let b = spawn_participant("b", &["2.jpg"], Arc::new(tardy_approve)).await;

    let config = CoordinatorConfig {
        phase_one_timeout: Duration::from_millis(300),
        phase_two_timeout: Duration::from_millis(300),
    };
    let (work_dir, coordinator) =
        spawn_coordinator(&[("a", a.addr), ("b", b.addr)], config).await;

    coordinator
        .start_commit(
            "composites/1.jpg",
            b"img".to_vec(),
            &sources(&["a:1.jpg", "b:2.jpg"]),
        )
        .await;
    wait_for("aborted commit to finish", || coordinator.in_flight() == 0).await;

    assert!(!work_dir.path().join("composites/1.jpg").exists());
    assert!(a.has_file("1.jpg"));
    assert!(b.has_file("2.jpg"));
    assert_eq!(a.participant.lock_count(), 0);
    assert_eq!(b.participant.lock_count(), 0);
}

/// A duplicate live file name is refused without disturbing the commit
/// that owns it.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_live_commit_refused() {
    let slow_approve = |_: &[u8], _: &[String]| {
        std::thread::sleep(Duration::from_millis(400));
        true
    };
    let a = spawn_participant("a", &["1.jpg"], Arc::new(slow_approve)).await;

    let (work_dir, coordinator) =
        spawn_coordinator(&[("a", a.addr)], short_config()).await;

    coordinator
        .start_commit("composites/1.jpg", b"img1".to_vec(), &sources(&["a:1.jpg"]))
        .await;
    // Same composite name while the first is still in Phase I.
    coordinator
        .start_commit("composites/1.jpg", b"other".to_vec(), &sources(&["a:1.jpg"]))
        .await;

    wait_for("the live commit to finish", || coordinator.in_flight() == 0).await;

    assert_eq!(
        fs::read(work_dir.path().join("composites/1.jpg")).unwrap(),
        b"img1"
    );
    assert!(!a.has_file("1.jpg"));
}
