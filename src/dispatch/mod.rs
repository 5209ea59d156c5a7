//! Dispatcher
//!
//! Owns the worker pool and the group queue. One event loop multiplexes
//! worker messages, the global run deadline, and SIGINT. Crash recovery
//! re-enqueues the unfinished remainder of a crashed worker's group; failed
//! attempts below the retry budget are re-enqueued as single-test groups.

mod pool;

pub use pool::{VariantKey, WorkerEvent, WorkerHandle};

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::config::RunConfig;
use crate::generate::{TestGroup, TestPlan};
use crate::models::{TestError, TestId, TestResult, TestStatus};
use crate::protocol::WorkerMessage;
use crate::report::Multiplexer;

/// How the dispatch loop ended.
#[derive(Clone, Copy, Debug, Default)]
pub struct DispatchOutcome {
    pub interrupted: bool,
    pub hit_global_timeout: bool,
    /// Count of tests whose final outcome is an unexpected failure.
    pub failures: u32,
}

struct ActiveGroup {
    group: TestGroup,
    completed: HashSet<TestId>,
    current: Option<TestId>,
}

struct WorkerSlot {
    handle: WorkerHandle,
    active: Option<ActiveGroup>,
    stop_sent: bool,
}

struct DispatchState<'a> {
    config: &'a RunConfig,
    fixture_files: &'a [PathBuf],
    plan: &'a mut TestPlan,
    reporters: &'a mut Multiplexer,
    events_tx: UnboundedSender<WorkerEvent>,
    queue: VecDeque<TestGroup>,
    workers: HashMap<u32, WorkerSlot>,
    next_worker_index: u32,
    next_group_id: u32,
    failures: u32,
    stopping: bool,
    interrupted: bool,
    hit_global_timeout: bool,
    sigint_at: Option<Instant>,
    hard_killed: bool,
}

/// Run the plan to completion and return how it ended. Reporters receive the
/// full per-test event stream along the way.
pub async fn run_tests(
    config: &RunConfig,
    plan: &mut TestPlan,
    fixture_files: &[PathBuf],
    reporters: &mut Multiplexer,
) -> Result<DispatchOutcome> {
    let (events_tx, events_rx) = unbounded_channel();
    let queue: VecDeque<TestGroup> = plan.groups.clone().into();
    let next_group_id = plan.groups.iter().map(|g| g.id + 1).max().unwrap_or(0);

    let mut state = DispatchState {
        config,
        fixture_files,
        plan,
        reporters,
        events_tx,
        queue,
        workers: HashMap::new(),
        next_worker_index: 0,
        next_group_id,
        failures: 0,
        stopping: false,
        interrupted: false,
        hit_global_timeout: false,
        sigint_at: None,
        hard_killed: false,
    };
    state.emit_load_failures();
    state.run(events_rx).await?;

    Ok(DispatchOutcome {
        interrupted: state.interrupted,
        hit_global_timeout: state.hit_global_timeout,
        failures: state.failures,
    })
}

async fn global_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl<'a> DispatchState<'a> {
    /// Report the synthesized failing test of every file that failed to load.
    fn emit_load_failures(&mut self) {
        for id in self.plan.load_failures.clone() {
            self.reporters.on_test_begin(self.plan.test(id));
            let result = match self.plan.test(id).results.last() {
                Some(result) => result.clone(),
                None => continue,
            };
            self.reporters.on_test_end(self.plan.test(id), &result);
            self.failures += 1;
        }
    }

    async fn run(&mut self, mut events_rx: UnboundedReceiver<WorkerEvent>) -> Result<()> {
        let deadline = (self.config.global_timeout_ms > 0).then(|| {
            tokio::time::Instant::now() + Duration::from_millis(self.config.global_timeout_ms)
        });

        self.try_assign().await?;

        loop {
            self.maybe_finish().await;
            if self.workers.is_empty() && (self.queue.is_empty() || self.stopping) {
                break;
            }

            tokio::select! {
                Some(event) = events_rx.recv() => {
                    self.handle_event(event).await?;
                }
                _ = tokio::signal::ctrl_c() => {
                    self.handle_sigint().await;
                    if self.should_hard_exit() {
                        break;
                    }
                }
                _ = global_deadline(deadline) => {
                    self.handle_global_timeout();
                    break;
                }
            }
        }
        Ok(())
    }

    fn variant_key(group: &TestGroup) -> VariantKey {
        (group.source_factory, group.variant_index)
    }

    /// Hand queued groups to idle workers: reuse a matching-variant worker,
    /// spawn below the cap, or retire one mismatched idle worker.
    async fn try_assign(&mut self) -> Result<()> {
        loop {
            if self.stopping || self.queue.is_empty() {
                return Ok(());
            }

            let matched = self.queue.iter().enumerate().find_map(|(qi, group)| {
                let key = Self::variant_key(group);
                self.workers
                    .iter()
                    .find(|(_, slot)| {
                        slot.active.is_none() && !slot.stop_sent && slot.handle.variant_key == key
                    })
                    .map(|(id, _)| (qi, *id))
            });
            if let Some((qi, worker_id)) = matched {
                let group = self
                    .queue
                    .remove(qi)
                    .expect("matched queue index disappeared");
                self.assign(worker_id, group).await;
                continue;
            }

            if self.workers.len() < self.config.workers.max(1) {
                let group = self.queue.pop_front().expect("queue emptied unexpectedly");
                let index = self.next_worker_index;
                self.next_worker_index += 1;
                match WorkerHandle::spawn(
                    index,
                    self.config,
                    self.fixture_files,
                    &group,
                    self.events_tx.clone(),
                )
                .await
                {
                    Ok(handle) => {
                        self.workers.insert(
                            index,
                            WorkerSlot {
                                handle,
                                active: None,
                                stop_sent: false,
                            },
                        );
                        self.assign(index, group).await;
                        continue;
                    }
                    Err(error) => {
                        self.queue.push_front(group);
                        return Err(error);
                    }
                }
            }

            // Pool is full of mismatched workers; retire one idle one and
            // wait for its exit to free capacity.
            let idle = self
                .workers
                .iter()
                .find(|(_, slot)| slot.active.is_none() && !slot.stop_sent)
                .map(|(id, _)| *id);
            if let Some(worker_id) = idle {
                self.stop_worker(worker_id).await;
            }
            return Ok(());
        }
    }

    async fn assign(&mut self, worker_id: u32, group: TestGroup) {
        let Some(slot) = self.workers.get_mut(&worker_id) else {
            self.queue.push_front(group);
            return;
        };
        debug!("assigning group {} to worker {worker_id}", group.id);
        slot.active = Some(ActiveGroup {
            group: group.clone(),
            completed: HashSet::new(),
            current: None,
        });
        if slot.handle.run(group).await.is_err() {
            // The child is gone; its closed event drives crash recovery.
            warn!("failed to send group to worker {worker_id}");
        }
    }

    async fn stop_worker(&mut self, worker_id: u32) {
        if let Some(slot) = self.workers.get_mut(&worker_id) {
            if !slot.stop_sent {
                slot.stop_sent = true;
                let _ = slot.handle.stop().await;
            }
        }
    }

    /// Once the queue is drained and every worker is idle, stop the pool.
    async fn maybe_finish(&mut self) {
        if !self.queue.is_empty() && !self.stopping {
            return;
        }
        if self.workers.values().any(|slot| slot.active.is_some()) {
            return;
        }
        let ids: Vec<u32> = self.workers.keys().copied().collect();
        for id in ids {
            self.stop_worker(id).await;
        }
    }

    async fn handle_event(&mut self, event: WorkerEvent) -> Result<()> {
        match event {
            WorkerEvent::Message(worker_id, message) => {
                self.handle_message(worker_id, message).await?;
            }
            WorkerEvent::StderrLine(worker_id, line) => {
                let current = self
                    .workers
                    .get(&worker_id)
                    .and_then(|slot| slot.active.as_ref())
                    .and_then(|active| active.current);
                let text = format!("{line}\n");
                match current {
                    Some(id) => self.reporters.on_stderr(&text, Some(self.plan.test(id))),
                    None => self.reporters.on_stderr(&text, None),
                }
            }
            WorkerEvent::Closed(worker_id) => {
                self.handle_closed(worker_id).await?;
            }
        }
        Ok(())
    }

    async fn handle_message(&mut self, worker_id: u32, message: WorkerMessage) -> Result<()> {
        match message {
            WorkerMessage::Ready => {
                debug!("worker {worker_id} ready");
            }
            WorkerMessage::TestBegin { test_id, .. } => {
                if let Some(active) = self
                    .workers
                    .get_mut(&worker_id)
                    .and_then(|slot| slot.active.as_mut())
                {
                    active.current = Some(test_id);
                }
                self.reporters.on_test_begin(self.plan.test(test_id));
            }
            WorkerMessage::Stdout { test_id, text } => match test_id {
                Some(id) => self.reporters.on_stdout(&text, Some(self.plan.test(id))),
                None => self.reporters.on_stdout(&text, None),
            },
            WorkerMessage::Stderr { test_id, text } => match test_id {
                Some(id) => self.reporters.on_stderr(&text, Some(self.plan.test(id))),
                None => self.reporters.on_stderr(&text, None),
            },
            WorkerMessage::TestEnd { test_id, result } => {
                let group = match self.workers.get_mut(&worker_id) {
                    Some(slot) => match slot.active.as_mut() {
                        Some(active) => {
                            active.completed.insert(test_id);
                            active.current = None;
                            active.group.clone()
                        }
                        None => return Ok(()),
                    },
                    None => return Ok(()),
                };
                self.record_result(&group, test_id, result);
            }
            WorkerMessage::Done { group_id } => {
                debug!("worker {worker_id} finished group {group_id}");
                if let Some(slot) = self.workers.get_mut(&worker_id) {
                    slot.active = None;
                }
                self.try_assign().await?;
            }
            WorkerMessage::FatalError { error } => {
                warn!("worker {worker_id} fatal: {}", error.message);
            }
        }
        Ok(())
    }

    /// Record one attempt: store it, notify reporters, then either re-enqueue
    /// a retry or count the failure.
    fn record_result(&mut self, group: &TestGroup, test_id: TestId, result: TestResult) {
        {
            let test = self.plan.test_mut(test_id);
            test.results.push(result.clone());
            test.annotations.extend(result.annotations.clone());
        }
        self.reporters.on_test_end(self.plan.test(test_id), &result);

        let attempts = self.plan.test(test_id).results.len() as u32;
        let retryable = matches!(result.status, TestStatus::Failed | TestStatus::TimedOut)
            && attempts <= self.config.retries
            && !self.stopping;
        if retryable {
            if let Some(entry) = group.entries.iter().find(|e| e.test_id == test_id) {
                let id = self.next_group_id;
                self.next_group_id += 1;
                self.queue
                    .push_back(group.retry_of(entry.clone(), id, attempts));
                return;
            }
        }

        if !self.plan.test(test_id).ok() {
            self.failures += 1;
            if self.config.max_failures > 0 && self.failures >= self.config.max_failures {
                debug!("max failures ({}) reached", self.config.max_failures);
                self.stopping = true;
                self.queue.clear();
            }
        }
    }

    async fn handle_closed(&mut self, worker_id: u32) -> Result<()> {
        let Some(mut slot) = self.workers.remove(&worker_id) else {
            return Ok(());
        };
        let status = slot.handle.wait_exit().await;

        if let Some(active) = slot.active.take() {
            debug!("worker {worker_id} crashed mid-group ({status})");
            let crash_error = TestError::new(format!(
                "worker process exited unexpectedly ({status})"
            ));
            if active.current.is_none() && active.completed.is_empty() {
                // The worker died before reaching any test (a broken file
                // load, most likely). Re-enqueueing would crash the
                // replacement the same way, so fail the whole group.
                for entry in &active.group.entries {
                    self.reporters.on_test_begin(self.plan.test(entry.test_id));
                    let mut result =
                        TestResult::new(active.group.retry_index, TestStatus::Failed);
                    result.start_time = Utc::now();
                    result.error = Some(crash_error.clone());
                    self.record_result(&active.group, entry.test_id, result);
                }
            } else {
                // The test that was running when the worker died is failed
                // with a synthesized error.
                if let Some(current) = active.current {
                    let mut result =
                        TestResult::new(active.group.retry_index, TestStatus::Failed);
                    result.start_time = Utc::now();
                    result.error = Some(crash_error);
                    self.record_result(&active.group, current, result);
                }
                // Survivors go back on the queue as a fresh group so
                // beforeAll runs again in the replacement worker.
                let surviving: Vec<_> = active
                    .group
                    .entries
                    .iter()
                    .filter(|e| {
                        !active.completed.contains(&e.test_id)
                            && Some(e.test_id) != active.current
                    })
                    .cloned()
                    .collect();
                if !surviving.is_empty() && !self.stopping {
                    let id = self.next_group_id;
                    self.next_group_id += 1;
                    self.queue.push_back(active.group.remainder(surviving, id));
                }
            }
        } else {
            debug!("worker {worker_id} exited ({status})");
        }

        if !self.stopping {
            self.try_assign().await?;
        }
        Ok(())
    }

    async fn handle_sigint(&mut self) {
        if let Some(at) = self.sigint_at {
            if at.elapsed() <= Duration::from_secs(1) {
                // Second interrupt within the grace window: hard kill.
                for slot in self.workers.values_mut() {
                    slot.handle.kill();
                }
                self.hard_killed = true;
                return;
            }
        }
        self.sigint_at = Some(Instant::now());
        self.interrupted = true;
        self.stopping = true;
        self.queue.clear();
        let ids: Vec<u32> = self.workers.keys().copied().collect();
        for id in ids {
            self.stop_worker(id).await;
        }
    }

    fn should_hard_exit(&self) -> bool {
        self.hard_killed
    }

    /// The whole-run deadline fired: every in-flight test becomes `timedOut`,
    /// workers are killed, reporters are told.
    fn handle_global_timeout(&mut self) {
        self.hit_global_timeout = true;
        self.stopping = true;
        self.queue.clear();
        self.reporters.on_timeout(self.config.global_timeout_ms);

        let active: Vec<(TestGroup, TestId)> = self
            .workers
            .values()
            .filter_map(|slot| {
                slot.active
                    .as_ref()
                    .and_then(|a| a.current.map(|id| (a.group.clone(), id)))
            })
            .collect();
        for (group, test_id) in active {
            let mut result = TestResult::new(group.retry_index, TestStatus::TimedOut);
            result.start_time = Utc::now();
            result.error = Some(TestError::new(format!(
                "global timeout of {}ms exceeded",
                self.config.global_timeout_ms
            )));
            self.record_result(&group, test_id, result);
        }
        for slot in self.workers.values_mut() {
            slot.handle.kill();
        }
    }
}
