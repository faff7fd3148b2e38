use crossbeam_channel::{select, tick, Receiver};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::coordinator::table::TransactionTable;
use crate::coordinator::transaction::Transaction;
use crate::coordinator::LoopCommand;
use crate::errors::Result;
use crate::types::Phase;

/// Retry and timeout driver.
///
/// Every pulse walks a snapshot of the live transactions and re-drives the
/// ones still waiting: it resends the prepare or the decision to the
/// participants that have not answered and aborts a vote collection that
/// has passed its deadline.
pub struct MsgSender {
    table: Arc<TransactionTable>,
    interval: Duration,
}

impl MsgSender {
    pub fn new(table: Arc<TransactionTable>, interval: Duration) -> Self {
        Self { table, interval }
    }

    /// Runs one pass over the live transactions.
    pub fn pulse(&self) {
        let now = Instant::now();
        for shared in self.table.snapshot() {
            let mut txn = shared.lock();
            if let Err(e) = drive(&mut txn, now) {
                warn!("Retry of transaction {} failed: {}", txn.id(), e);
            }
            if txn.phase() == Phase::Done {
                let id = txn.id().clone();
                drop(txn);
                self.table.remove(&id);
            }
        }
    }

    /// Pulses at a fixed interval until told to stop.
    pub fn run(self, commands: Receiver<LoopCommand>) {
        let ticker = tick(self.interval);
        loop {
            select! {
                recv(commands) -> _ => {
                    debug!("Retry loop shutting down");
                    break;
                }
                recv(ticker) -> _ => self.pulse(),
            }
        }
    }
}

fn drive(txn: &mut Transaction, now: Instant) -> Result<()> {
    match txn.phase() {
        Phase::Prepare if txn.is_timed_out(now) => {
            info!(
                "Transaction {} timed out waiting for {:?}",
                txn.id(),
                txn.pending_nodes()
            );
            txn.abort()
        }
        Phase::Prepare => {
            txn.resend_prepare();
            Ok(())
        }
        Phase::Commit | Phase::Abort => {
            // A failed artifact write leaves every acknowledgment in place.
            if !txn.try_finish()? {
                txn.resend_decision();
                txn.report_if_stale(now);
            }
            Ok(())
        }
        Phase::Done => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::message::{Reply, ReplyKind, Request};
    use crate::network::{MemoryNetwork, Transport};
    use crate::source_map::SourceMap;
    use crate::types::TxnId;
    use parking_lot::Mutex;
    use std::fs;
    use std::thread;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_millis(20);

    fn reply(id: &TxnId, kind: ReplyKind) -> Reply {
        Reply::new(id.clone(), kind)
    }

    #[test]
    fn pulse_resends_aborts_on_timeout_and_forgets_done_transactions() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(
            CoordinatorConfig::default()
                .with_log_dir(dir.path())
                .with_artifact_dir(dir.path())
                .with_prepare_timeout(Duration::from_millis(300)),
        );
        let network = MemoryNetwork::new();
        let server = Arc::new(network.endpoint("Server"));
        let a = network.endpoint("a");

        let table = Arc::new(TransactionTable::new());
        let id = TxnId::parse("t1").unwrap();
        let mut txn = Transaction::create(
            id.clone(),
            "out.jpg".to_string(),
            vec![1],
            SourceMap::parse(&["a:1.jpg"]).unwrap(),
            server,
            config,
        )
        .unwrap();
        txn.ask_for_vote().unwrap();
        let shared = table.insert(txn);
        let sender = MsgSender::new(table.clone(), Duration::from_secs(1));

        a.receive(WAIT).unwrap().unwrap();
        sender.pulse();
        let resent = a.receive(WAIT).unwrap().unwrap();
        assert!(matches!(Request::decode(&resent.body).unwrap(), Request::Prepare(_)));

        std::thread::sleep(Duration::from_millis(350));
        sender.pulse();
        assert_eq!(shared.lock().phase(), Phase::Abort);
        let decision = a.receive(WAIT).unwrap().unwrap();
        assert!(matches!(Request::decode(&decision.body).unwrap(), Request::Decision(_)));

        shared
            .lock()
            .handle_response("a", &Reply::new(id.clone(), ReplyKind::Ack))
            .unwrap();
        sender.pulse();
        assert!(table.get(&id).is_none());
    }

    #[test]
    fn pulse_finishes_a_commit_once_the_artifact_can_be_written() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");
        let config = Arc::new(
            CoordinatorConfig::default()
                .with_log_dir(dir.path().join("logs"))
                .with_artifact_dir(&out),
        );
        let network = MemoryNetwork::new();
        let id = TxnId::parse("t1").unwrap();
        let mut txn = Transaction::create(
            id.clone(),
            "out.jpg".to_string(),
            vec![7],
            SourceMap::parse(&["a:1.jpg"]).unwrap(),
            Arc::new(network.endpoint("Server")),
            config,
        )
        .unwrap();
        txn.ask_for_vote().unwrap();
        txn.handle_response("a", &reply(&id, ReplyKind::Yes)).unwrap();

        fs::write(&out, b"not a directory").unwrap();
        assert!(txn.handle_response("a", &reply(&id, ReplyKind::Ack)).is_err());
        let table = Arc::new(TransactionTable::new());
        let shared = table.insert(txn);
        let sender = MsgSender::new(table.clone(), Duration::from_secs(1));

        sender.pulse();
        assert_eq!(shared.lock().phase(), Phase::Commit);
        assert!(table.get(&id).is_some());

        fs::remove_file(&out).unwrap();
        sender.pulse();
        assert!(table.get(&id).is_none());
        assert_eq!(fs::read(out.join("out.jpg")).unwrap(), [7]);
    }

    #[test]
    fn pulse_waits_for_a_transaction_published_locked() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(
            CoordinatorConfig::default()
                .with_log_dir(dir.path())
                .with_artifact_dir(dir.path()),
        );
        let network = MemoryNetwork::new();
        let a = network.endpoint("a");
        let id = TxnId::parse("t1").unwrap();
        let txn = Transaction::create(
            id.clone(),
            "out.jpg".to_string(),
            vec![1],
            SourceMap::parse(&["a:1.jpg"]).unwrap(),
            Arc::new(network.endpoint("Server")),
            config,
        )
        .unwrap();

        let table = Arc::new(TransactionTable::new());
        let shared = Arc::new(Mutex::new(txn));
        let mut guard = shared.lock();
        table.publish(id.clone(), shared.clone());

        let sender = MsgSender::new(table, Duration::from_secs(1));
        let pulse = thread::spawn(move || sender.pulse());
        thread::sleep(Duration::from_millis(50));
        assert!(!pulse.is_finished());
        assert!(a.receive(WAIT).unwrap().is_none());

        guard.ask_for_vote().unwrap();
        drop(guard);
        pulse.join().unwrap();
        // The first prepare and the retry, both after the marker.
        for _ in 0..2 {
            let msg = a.receive(WAIT).unwrap().unwrap();
            assert!(matches!(Request::decode(&msg.body).unwrap(), Request::Prepare(_)));
        }
    }
}
