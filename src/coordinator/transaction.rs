use ahash::AHashMap as HashMap;
use log::{debug, error, info, warn};
use std::fs::{self, File};
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use crate::config::CoordinatorConfig;
use crate::errors::{CollageError, Result};
use crate::message::{DecisionRequest, PrepareRequest, Reply, ReplyKind, Request};
use crate::network::{Message, Transport};
use crate::source_map::SourceMap;
use crate::types::{Decision, NodeId, Phase, TxnId};
use crate::wal::{self, LogRecord, TransactionParams, Wal};

/// Coordinator-side state machine of one commit attempt.
///
/// A transaction moves from `Prepare` to `Commit` or `Abort` and finally to
/// `Done`. Every phase change is made durable in the transaction's log before
/// anything about it is sent, so a restarted coordinator can resume from the
/// last phase marker. Callers serialize access per transaction; see
/// [`TransactionTable`](super::table::TransactionTable).
pub struct Transaction {
    id: TxnId,
    file_name: String,
    image: Vec<u8>,
    sources: SourceMap,
    phase: Phase,
    /// Votes while preparing, acknowledgments once decided. At most one entry
    /// per participant of `sources`.
    node_responses: HashMap<NodeId, bool>,
    start_time: Option<Instant>,
    last_response_time: Option<Instant>,
    decision_time: Option<Instant>,
    stale_reported: bool,
    /// Closed and deleted once the transaction is done.
    wal: Option<Wal>,
    transport: Arc<dyn Transport>,
    config: Arc<CoordinatorConfig>,
}

impl Transaction {
    /// Creates a transaction and durably logs its parameters.
    ///
    /// Nothing is sent until [`Transaction::ask_for_vote`].
    pub fn create(
        id: TxnId,
        file_name: String,
        image: Vec<u8>,
        sources: SourceMap,
        transport: Arc<dyn Transport>,
        config: Arc<CoordinatorConfig>,
    ) -> Result<Self> {
        let mut wal = Wal::open(&config.log_dir, &id)?;
        wal.append_durable(LogRecord::Params(TransactionParams {
            file_name: file_name.clone(),
            image: image.clone(),
            sources: sources.to_specs(),
        }))?;
        debug!("Logged parameters of transaction {}", id);

        Ok(Self::new(id, file_name, image, sources, Phase::Prepare, wal, transport, config))
    }

    /// Rebuilds a transaction from its log after a restart.
    ///
    /// # Errors
    ///
    /// Returns [`CollageError::CorruptLog`] if the log does not start with the
    /// transaction parameters or carries no phase marker.
    pub fn restore(
        wal: Wal,
        transport: Arc<dyn Transport>,
        config: Arc<CoordinatorConfig>,
    ) -> Result<Self> {
        let missing = |reason: &str| CollageError::CorruptLog {
            path: wal.path().to_path_buf(),
            reason: reason.to_string(),
        };
        let params = wal
            .params()
            .cloned()
            .ok_or_else(|| missing("missing transaction parameters"))?;
        let phase = wal
            .last_phase()
            .ok_or_else(|| missing("missing phase marker"))?;
        let sources = SourceMap::parse(&params.sources)?;

        let mut txn = Self::new(
            wal.txn_id().clone(),
            params.file_name,
            params.image,
            sources,
            phase,
            wal,
            transport,
            config,
        );
        // The deadlines restart with the process, even if recovery cannot
        // re-log the phase.
        let now = Instant::now();
        match phase {
            Phase::Prepare => txn.start_time = Some(now),
            Phase::Commit | Phase::Abort => txn.decision_time = Some(now),
            Phase::Done => {}
        }
        Ok(txn)
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        id: TxnId,
        file_name: String,
        image: Vec<u8>,
        sources: SourceMap,
        phase: Phase,
        wal: Wal,
        transport: Arc<dyn Transport>,
        config: Arc<CoordinatorConfig>,
    ) -> Self {
        Self {
            id,
            file_name,
            image,
            sources,
            phase,
            node_responses: HashMap::new(),
            start_time: None,
            last_response_time: None,
            decision_time: None,
            stale_reported: false,
            wal: Some(wal),
            transport,
            config,
        }
    }

    pub fn id(&self) -> &TxnId {
        &self.id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn sources(&self) -> &SourceMap {
        &self.sources
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Starts (or restarts) the vote collection.
    ///
    /// Resets the prepare deadline, durably logs a prepare marker and sends
    /// one prepare request per participant. Safe to repeat: participants
    /// answer a repeated prepare from their own log.
    pub fn ask_for_vote(&mut self) -> Result<()> {
        if self.phase != Phase::Prepare {
            return Err(CollageError::InvalidTransition {
                from: self.phase,
                to: Phase::Prepare,
            });
        }
        self.log_phase(Phase::Prepare)?;
        self.start_time = Some(Instant::now());
        self.last_response_time = None;
        self.node_responses.clear();
        info!(
            "Asking {} participant(s) to vote on transaction {}",
            self.sources.len(),
            self.id
        );
        self.send_prepare(false);
        Ok(())
    }

    /// Resends the prepare request to participants that have not voted yet.
    ///
    /// Does nothing before the prepare marker is durable.
    pub fn resend_prepare(&self) {
        if self.phase == Phase::Prepare && self.start_time.is_some() {
            self.send_prepare(true);
        }
    }

    /// Resends the decision to participants that have not acknowledged it.
    pub fn resend_decision(&self) {
        if self.phase.decision().is_some() {
            self.send_decision(true);
        }
    }

    /// Feeds one participant reply into the state machine.
    ///
    /// Replies from nodes outside the transaction, replies that do not fit
    /// the current phase and anything arriving after `Done` are dropped.
    pub fn handle_response(&mut self, from: &str, reply: &Reply) -> Result<()> {
        if !self.sources.contains_node(from) {
            debug!(
                "Dropping reply from {} to transaction {}: not a participant",
                from, self.id
            );
            return Ok(());
        }

        match (self.phase, reply.kind) {
            (Phase::Prepare, ReplyKind::Yes | ReplyKind::No) => {
                self.last_response_time = Some(Instant::now());
                self.node_responses
                    .entry(from.to_string())
                    .or_insert(reply.kind == ReplyKind::Yes);
                self.evaluate_votes()
            }
            (Phase::Commit | Phase::Abort, ReplyKind::Ack) => {
                self.node_responses.insert(from.to_string(), true);
                self.try_finish().map(|_| ())
            }
            (phase, kind) => {
                debug!(
                    "Dropping {:?} from {} to transaction {} in phase {}",
                    kind, from, self.id, phase
                );
                Ok(())
            }
        }
    }

    fn evaluate_votes(&mut self) -> Result<()> {
        let timed_out = match (self.start_time, self.last_response_time) {
            (Some(start), Some(last)) => last.duration_since(start) > self.config.prepare_timeout,
            _ => false,
        };
        let all_in = self.all_responses_in();

        if all_in && !timed_out && self.node_responses.values().all(|&yes| yes) {
            self.commit()
        } else if timed_out || (all_in && self.node_responses.values().any(|&yes| !yes)) {
            self.abort()
        } else {
            Ok(())
        }
    }

    /// Decides to commit. See [`Transaction::decide`].
    pub fn commit(&mut self) -> Result<()> {
        self.decide(Decision::Commit)
    }

    /// Decides to abort. See [`Transaction::decide`].
    pub fn abort(&mut self) -> Result<()> {
        self.decide(Decision::Abort)
    }

    /// Moves a preparing transaction to a decision phase.
    ///
    /// The phase marker is durable before the decision is broadcast. If a
    /// commit marker cannot be made durable the transaction aborts instead;
    /// if the abort marker fails too it stays in `Prepare` and the error is
    /// returned. Deciding the phase the transaction is already in only
    /// rebroadcasts the decision.
    ///
    /// # Errors
    ///
    /// Returns [`CollageError::InvalidTransition`] when asked for the other
    /// decision than the one already taken, or after `Done`.
    pub fn decide(&mut self, decision: Decision) -> Result<()> {
        let target = decision.phase();
        match self.phase {
            Phase::Prepare => {
                if let Err(e) = self.log_phase(target) {
                    if decision == Decision::Commit {
                        error!(
                            "Could not make commit of transaction {} durable, aborting: {}",
                            self.id, e
                        );
                        return self.decide(Decision::Abort);
                    }
                    return Err(e);
                }
                self.phase = target;
                self.node_responses.clear();
                self.decision_time = Some(Instant::now());
                self.stale_reported = false;
                info!("Transaction {} decided to {}", self.id, decision);
                self.send_decision(false);
                Ok(())
            }
            current if current == target => {
                self.send_decision(false);
                Ok(())
            }
            current => Err(CollageError::InvalidTransition {
                from: current,
                to: target,
            }),
        }
    }

    /// Completes a decided transaction once every participant acknowledged.
    ///
    /// A commit publishes the artifact first. The log is deleted afterwards
    /// and the transaction is `Done`. Returns whether it finished.
    ///
    /// # Errors
    ///
    /// A failed artifact write leaves the transaction in `Commit` so a later
    /// call can retry it.
    pub fn try_finish(&mut self) -> Result<bool> {
        if self.phase.decision().is_none() || !self.all_responses_in() {
            return Ok(false);
        }
        if self.phase == Phase::Commit {
            self.write_artifact().inspect_err(|e| {
                error!(
                    "Could not publish {} for transaction {}: {}",
                    self.file_name, self.id, e
                );
            })?;
        }

        info!("Transaction {} is done ({})", self.id, self.phase);
        self.phase = Phase::Done;
        self.node_responses.clear();
        if let Some(wal) = self.wal.take() {
            // A leftover log only makes recovery redo an idempotent decision.
            if let Err(e) = wal.remove() {
                warn!("Could not delete log of transaction {}: {}", self.id, e);
            }
        }
        Ok(true)
    }

    /// Drops a transaction that never sent anything, deleting its log.
    pub(crate) fn discard(&mut self) {
        self.phase = Phase::Done;
        if let Some(wal) = self.wal.take() {
            if let Err(e) = wal.remove() {
                warn!("Could not delete log of transaction {}: {}", self.id, e);
            }
        }
    }

    /// Whether every participant has answered in the current phase.
    pub fn all_responses_in(&self) -> bool {
        self.sources
            .nodes()
            .all(|node| self.node_responses.contains_key(node))
    }

    /// Participants that have not answered in the current phase.
    pub fn pending_nodes(&self) -> Vec<NodeId> {
        self.sources
            .nodes()
            .filter(|node| !self.node_responses.contains_key(*node))
            .cloned()
            .collect()
    }

    /// Whether the vote collection has exceeded its deadline at `now`.
    pub fn is_timed_out(&self, now: Instant) -> bool {
        self.phase == Phase::Prepare
            && self
                .start_time
                .is_some_and(|start| now.duration_since(start) > self.config.prepare_timeout)
    }

    /// Reports, once, a decision that has waited too long for acknowledgments.
    pub fn report_if_stale(&mut self, now: Instant) {
        let Some(decided) = self.decision_time else {
            return;
        };
        if self.stale_reported
            || self.phase.decision().is_none()
            || now.duration_since(decided) <= self.config.stale_decision_warning
        {
            return;
        }
        self.stale_reported = true;
        warn!(
            "Transaction {} decided {} {:?} ago and is still waiting for {:?}",
            self.id,
            self.phase,
            now.duration_since(decided),
            self.pending_nodes()
        );
    }

    fn log_phase(&mut self, phase: Phase) -> Result<()> {
        let wal = self.wal.as_mut().ok_or(CollageError::InvalidTransition {
            from: self.phase,
            to: phase,
        })?;
        wal.append_durable(LogRecord::Phase {
            txn_id: self.id.clone(),
            phase,
        })
    }

    fn send_prepare(&self, pending_only: bool) {
        for (node, files) in self.sources.iter() {
            if pending_only && self.node_responses.contains_key(node) {
                continue;
            }
            let request = Request::Prepare(PrepareRequest {
                txn_id: self.id.clone(),
                files: files.to_vec(),
                image: self.image.clone(),
            });
            self.send(node, &request);
        }
    }

    fn send_decision(&self, pending_only: bool) {
        let Some(decision) = self.phase.decision() else {
            return;
        };
        for (node, files) in self.sources.iter() {
            if pending_only && self.node_responses.contains_key(node) {
                continue;
            }
            let request = Request::Decision(DecisionRequest {
                txn_id: self.id.clone(),
                decision,
                files: files.to_vec(),
            });
            self.send(node, &request);
        }
    }

    fn send(&self, node: &NodeId, request: &Request) {
        // Retries cover a lost message, so a failed send is not fatal.
        if let Err(e) = self.transport.send(Message::new(node.clone(), request.encode())) {
            warn!("Failed to send to {} for transaction {}: {}", node, self.id, e);
        }
    }

    /// Publishes the artifact atomically: a synced temporary file renamed
    /// over the target.
    fn write_artifact(&self) -> Result<()> {
        let dir = &self.config.artifact_dir;
        fs::create_dir_all(dir)?;
        let target = dir.join(&self.file_name);
        let staging = dir.join(format!(".{}.{}.tmp", self.file_name, self.id));

        let mut file = File::create(&staging)?;
        file.write_all(&self.image)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&staging, &target)?;
        wal::sync_dir(dir)?;
        debug!("Published {}", target.display());
        Ok(())
    }
}
