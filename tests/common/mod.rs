//! Common utilities for collage integration tests.
#![allow(dead_code)]

use ahash::AHashMap as HashMap;
use collage::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const SERVER: &str = "Server";

/// Source files whose name starts with this prefix are always declined by
/// their user.
pub const VETO_PREFIX: &str = "veto";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Polls `condition` every 10 ms until it holds or `timeout_ms` elapse.
pub fn wait_for_condition<F>(condition: F, timeout_ms: u64) -> bool
where
    F: Fn() -> bool,
{
    let start = std::time::Instant::now();
    let timeout = Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    condition()
}

/// One running participant and the knobs of its simulated user.
pub struct TestNode {
    pub node: ParticipantNode,
    pub approve: Arc<AtomicBool>,
    pub asked: Arc<AtomicUsize>,
}

/// A coordinator-less cluster of participants on an in-memory network, all
/// rooted in one temporary directory.
pub struct Cluster {
    pub dir: TempDir,
    pub network: MemoryNetwork,
    nodes: HashMap<String, TestNode>,
}

impl Cluster {
    /// Starts one participant per entry, creating its source files.
    pub fn new(nodes: &[(&str, &[&str])]) -> Self {
        init_logging();
        let mut cluster = Self {
            dir: TempDir::new().unwrap(),
            network: MemoryNetwork::new(),
            nodes: HashMap::new(),
        };
        for (node_id, files) in nodes {
            let work_dir = cluster.work_dir(node_id);
            fs::create_dir_all(&work_dir).unwrap();
            for file in files.iter() {
                fs::write(work_dir.join(file), format!("{node_id}/{file}")).unwrap();
            }
            let approve = Arc::new(AtomicBool::new(true));
            let asked = Arc::new(AtomicUsize::new(0));
            let node = cluster.spawn_node(node_id, approve.clone(), asked.clone());
            cluster.nodes.insert(
                node_id.to_string(),
                TestNode {
                    node,
                    approve,
                    asked,
                },
            );
        }
        cluster
    }

    fn spawn_node(
        &self,
        node_id: &str,
        approve: Arc<AtomicBool>,
        asked: Arc<AtomicUsize>,
    ) -> ParticipantNode {
        let mut config = ParticipantConfig::new(node_id)
            .with_log_dir(self.dir.path().join(node_id).join("logs"))
            .with_work_dir(self.work_dir(node_id));
        config.receive_poll = Duration::from_millis(10);

        let confirm = move |_: &[u8], files: &[String]| {
            asked.fetch_add(1, Ordering::SeqCst);
            approve.load(Ordering::SeqCst)
                && !files.iter().any(|file| file.starts_with(VETO_PREFIX))
        };
        let endpoint = Arc::new(self.network.endpoint(node_id));
        let participant = Arc::new(Participant::new(config, endpoint, confirm));
        ParticipantNode::spawn(participant).unwrap()
    }

    /// Coordinator settings with short intervals, logging under the cluster
    /// directory.
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        let mut config = CoordinatorConfig::default()
            .with_node_id(SERVER)
            .with_log_dir(self.coordinator_log_dir())
            .with_artifact_dir(self.artifact_dir())
            .with_retry_interval(Duration::from_millis(50))
            .with_prepare_timeout(Duration::from_secs(5));
        config.receive_poll = Duration::from_millis(10);
        config
    }

    pub fn start_coordinator(&self, config: CoordinatorConfig) -> Coordinator {
        let endpoint = Arc::new(self.network.endpoint(SERVER));
        Coordinator::start(config, endpoint).unwrap()
    }

    /// Stops a participant and starts it again on the same directories, as
    /// a process restart would.
    pub fn restart_node(&mut self, node_id: &str) {
        let old = self.nodes.remove(node_id).unwrap();
        old.node.shutdown();
        let node = self.spawn_node(node_id, old.approve.clone(), old.asked.clone());
        self.nodes.insert(
            node_id.to_string(),
            TestNode {
                node,
                approve: old.approve,
                asked: old.asked,
            },
        );
    }

    pub fn node(&self, node_id: &str) -> &TestNode {
        self.nodes.get(node_id).expect("unknown node")
    }

    pub fn participant(&self, node_id: &str) -> &Arc<Participant> {
        self.node(node_id).node.participant()
    }

    pub fn set_approval(&self, node_id: &str, approve: bool) {
        self.node(node_id).approve.store(approve, Ordering::SeqCst);
    }

    pub fn times_asked(&self, node_id: &str) -> usize {
        self.node(node_id).asked.load(Ordering::SeqCst)
    }

    pub fn locked_files(&self, node_id: &str) -> usize {
        self.participant(node_id).locks().lock().len()
    }

    pub fn work_dir(&self, node_id: &str) -> PathBuf {
        self.dir.path().join(node_id).join("work")
    }

    pub fn source_exists(&self, node_id: &str, file: &str) -> bool {
        self.work_dir(node_id).join(file).exists()
    }

    pub fn coordinator_log_dir(&self) -> PathBuf {
        self.dir.path().join(SERVER).join("logs")
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.dir.path().join(SERVER).join("out")
    }

    pub fn artifact(&self, name: &str) -> Option<Vec<u8>> {
        fs::read(self.artifact_dir().join(name)).ok()
    }
}

pub fn log_files(dir: &Path) -> usize {
    match fs::read_dir(dir) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}
