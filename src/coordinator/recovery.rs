use log::{error, info, warn};
use std::sync::Arc;

use crate::config::CoordinatorConfig;
use crate::coordinator::transaction::Transaction;
use crate::errors::Result;
use crate::network::Transport;
use crate::types::Phase;
use crate::wal::{self, Wal};

/// Rebuilds in-flight transactions from the coordinator's log directory.
pub struct RecoveryManager {
    config: Arc<CoordinatorConfig>,
    transport: Arc<dyn Transport>,
}

impl RecoveryManager {
    pub fn new(config: Arc<CoordinatorConfig>, transport: Arc<dyn Transport>) -> Self {
        Self { config, transport }
    }

    /// Loads every transaction that has a log.
    ///
    /// A log without a phase marker belongs to a transaction that never sent
    /// anything and is deleted. Unreadable logs are reported and left alone.
    pub fn transactions_to_recover(&self) -> Result<Vec<Transaction>> {
        let ids = wal::list_transactions(&self.config.log_dir)?;
        let mut transactions = Vec::with_capacity(ids.len());

        for id in ids {
            let wal = match Wal::open(&self.config.log_dir, &id) {
                Ok(wal) => wal,
                Err(e) => {
                    error!("Skipping log of transaction {}: {}", id, e);
                    continue;
                }
            };
            if wal.last_phase().is_none() {
                info!("Discarding log of transaction {} that never started", id);
                wal.remove()?;
                continue;
            }
            match Transaction::restore(wal, self.transport.clone(), self.config.clone()) {
                Ok(txn) => transactions.push(txn),
                Err(e) => error!("Skipping log of transaction {}: {}", id, e),
            }
        }

        if transactions.is_empty() {
            info!("Nothing to recover in {}", self.config.log_dir.display());
        } else {
            info!("Recovering {} transaction(s)", transactions.len());
        }
        Ok(transactions)
    }

    /// Re-drives a restored transaction from its logged phase.
    pub fn recover(&self, txn: &mut Transaction) -> Result<()> {
        info!("Recovering transaction {} in phase {}", txn.id(), txn.phase());
        match txn.phase() {
            Phase::Prepare => txn.ask_for_vote(),
            Phase::Commit | Phase::Abort => {
                txn.resend_decision();
                Ok(())
            }
            Phase::Done => {
                warn!("Transaction {} was already done", txn.id());
                Ok(())
            }
        }
    }
}
