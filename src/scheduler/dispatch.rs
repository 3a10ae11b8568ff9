//! Dispatch coordinator
//!
//! Owns the run loop: seeds dependency roots, admits ready units against
//! the worker pool, group caps and serial lanes, processes completions,
//! cascades skips across failed hard dependencies, and drives the
//! cancellation drain with a bounded grace period.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::graph::ExecutionGraph;
use crate::models::TestReport;

use super::lanes::{GroupLimits, SerialLanes};
use super::worker::{execute_unit, ExecutionEnv};

pub(crate) const DEPENDENCY_SKIP_REASON: &str = "dependency failed";

struct Completion {
    index: usize,
    report: TestReport,
}

pub(crate) struct Dispatcher {
    graph: Arc<ExecutionGraph>,
    env: Arc<ExecutionEnv>,
    lanes: SerialLanes,
    groups: GroupLimits,
    pool: Arc<Semaphore>,
    fail_fast: bool,
    grace: Duration,
    reports_tx: Option<mpsc::UnboundedSender<TestReport>>,

    tx: mpsc::UnboundedSender<Completion>,
    rx: mpsc::UnboundedReceiver<Completion>,

    remaining: Vec<usize>,
    skip_reason: Vec<Option<&'static str>>,
    resolved: Vec<bool>,
    claimed: Vec<bool>,
    ready: Vec<usize>,
    running: HashMap<usize, JoinHandle<()>>,
    reports: Vec<TestReport>,
    resolved_count: usize,
}

impl Dispatcher {
    pub(crate) fn new(
        graph: Arc<ExecutionGraph>,
        env: Arc<ExecutionEnv>,
        config: &SessionConfig,
        reports_tx: Option<mpsc::UnboundedSender<TestReport>>,
    ) -> Self {
        let nodes = graph.nodes();
        let lanes = SerialLanes::build(
            nodes
                .iter()
                .enumerate()
                .map(|(index, node)| (index, &node.descriptor.parallel)),
        );
        let groups = GroupLimits::build(nodes.iter().map(|node| &node.descriptor.parallel));
        let remaining: Vec<usize> = nodes.iter().map(|node| node.predecessors.len()).collect();
        let ready = remaining
            .iter()
            .enumerate()
            .filter(|(_, &count)| count == 0)
            .map(|(index, _)| index)
            .collect();
        let (tx, rx) = mpsc::unbounded_channel();

        Self {
            lanes,
            groups,
            pool: Arc::new(Semaphore::new(config.parallelism)),
            fail_fast: config.fail_fast,
            grace: config.cancellation_grace(),
            reports_tx,
            tx,
            rx,
            skip_reason: vec![None; remaining.len()],
            resolved: vec![false; remaining.len()],
            claimed: vec![false; remaining.len()],
            remaining,
            ready,
            running: HashMap::new(),
            reports: Vec::new(),
            resolved_count: 0,
            graph,
            env,
        }
    }

    /// Drive the run to completion: one terminal report per graph node.
    pub(crate) async fn run(mut self) -> Vec<TestReport> {
        let total = self.graph.len();
        let mut deadline: Option<tokio::time::Instant> = None;

        while self.resolved_count < total {
            if !self.env.cancel.is_cancelled() {
                self.dispatch_ready();
            }

            tokio::select! {
                Some(completion) = self.rx.recv() => {
                    self.on_completion(completion).await;
                }
                _ = self.env.cancel.cancelled(), if deadline.is_none() => {
                    deadline = Some(tokio::time::Instant::now() + self.grace);
                    self.cancel_pending().await;
                }
                _ = grace_expired(deadline) => {
                    self.abort_running();
                    break;
                }
            }
        }

        // Aborted workers may have raced a completion into the channel.
        while let Ok(completion) = self.rx.try_recv() {
            self.on_completion(completion).await;
        }
        for index in 0..total {
            if !self.resolved[index] {
                let descriptor = self.graph.node(index).descriptor.clone();
                self.finish(
                    index,
                    TestReport::cancelled(descriptor.id.clone(), descriptor.display_name.clone()),
                );
            }
        }

        self.reports
    }

    fn dispatch_ready(&mut self) {
        let candidates = std::mem::take(&mut self.ready);
        for index in candidates {
            if self.resolved[index] {
                continue;
            }
            if let Err(blocked) = self.try_dispatch(index) {
                self.ready.push(blocked);
            }
        }
    }

    fn try_dispatch(&mut self, index: usize) -> Result<(), usize> {
        let Ok(pool_permit) = self.pool.clone().try_acquire_owned() else {
            return Err(index);
        };
        let descriptor = self.graph.node(index).descriptor.clone();
        let group_permit = match self.groups.semaphore(&descriptor.parallel) {
            Some(semaphore) => match semaphore.try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => return Err(index),
            },
            None => None,
        };
        if !self.lanes.try_claim(index) {
            return Err(index);
        }
        self.claimed[index] = true;

        debug!(test = %descriptor.id, "dispatching");
        let env = self.env.clone();
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            let report = execute_unit(env, descriptor).await;
            drop(group_permit);
            drop(pool_permit);
            let _ = tx.send(Completion { index, report });
        });
        self.running.insert(index, handle);
        Ok(())
    }

    /// Record a terminal report and cascade through successors: hard edges
    /// from a non-passed predecessor mark the dependent skipped, and a
    /// skipped unit propagates onward through its own hard edges.
    async fn on_completion(&mut self, completion: Completion) {
        // The head completion comes from a worker, which has already left
        // its scope gates; cascaded skips never reach a worker and must
        // forfeit their membership here.
        let mut queue = VecDeque::from([(completion.index, completion.report, false)]);

        while let Some((index, report, forfeit)) = queue.pop_front() {
            if self.resolved[index] {
                continue;
            }
            let passed = report.outcome.is_passed();
            let failed = report.outcome.is_terminal_failure();
            self.finish(index, report);
            if forfeit {
                self.forfeit_scope(index).await;
            }

            if failed && self.fail_fast && !self.env.cancel.is_cancelled() {
                warn!("fail-fast: first failure cancels the session");
                self.env.cancel.cancel();
            }

            let successors = self.graph.node(index).successors.clone();
            for successor in successors {
                if self.resolved[successor] {
                    continue;
                }
                let hard_edge = self
                    .graph
                    .node(successor)
                    .predecessors
                    .iter()
                    .any(|edge| edge.predecessor == index && !edge.proceed_on_failure);
                if hard_edge && !passed {
                    self.skip_reason[successor] = Some(DEPENDENCY_SKIP_REASON);
                }

                self.remaining[successor] -= 1;
                if self.remaining[successor] == 0 {
                    match self.skip_reason[successor] {
                        Some(reason) => {
                            self.lanes.remove(successor);
                            let descriptor = self.graph.node(successor).descriptor.clone();
                            queue.push_back((
                                successor,
                                TestReport::skipped(
                                    descriptor.id.clone(),
                                    descriptor.display_name.clone(),
                                    reason,
                                ),
                                true,
                            ));
                        }
                        None => self.ready.push(successor),
                    }
                }
            }
        }
    }

    fn finish(&mut self, index: usize, report: TestReport) {
        self.resolved[index] = true;
        self.resolved_count += 1;
        self.running.remove(&index);
        if self.claimed[index] {
            self.lanes.release(index);
        }
        if let Some(tx) = &self.reports_tx {
            let _ = tx.send(report.clone());
        }
        self.reports.push(report);
    }

    /// Everything not yet running resolves to Cancelled immediately; running
    /// units get the grace period to observe the signal themselves.
    async fn cancel_pending(&mut self) {
        info!(
            running = self.running.len(),
            "cancellation requested, draining running tests"
        );
        for index in 0..self.graph.len() {
            if !self.resolved[index] && !self.running.contains_key(&index) {
                self.lanes.remove(index);
                let descriptor = self.graph.node(index).descriptor.clone();
                self.finish(
                    index,
                    TestReport::cancelled(descriptor.id.clone(), descriptor.display_name.clone()),
                );
                self.forfeit_scope(index).await;
            }
        }
        self.ready.clear();
    }

    /// A unit resolved without reaching a worker still counts as leaving its
    /// class and assembly, so After-All chains are not stranded waiting for
    /// it.
    async fn forfeit_scope(&self, index: usize) {
        let class = &self.graph.node(index).descriptor.class;
        for failure in self.env.gates.leave(class).await {
            warn!(%failure, "after-all hook failed");
        }
    }

    fn abort_running(&mut self) {
        warn!(
            stragglers = self.running.len(),
            "grace period elapsed, aborting remaining tests"
        );
        for (_, handle) in self.running.drain() {
            handle.abort();
        }
    }
}

async fn grace_expired(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
