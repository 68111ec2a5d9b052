//! The scheduler: a single-actor event loop owning every state transition
//! for agents, jobs, and tasks (§4.3, §4.4, §4.5).
//!
//! One task drains a command channel and a timer tick, so every mutation
//! of the in-flight world happens on one logical thread and needs no
//! cross-task locking beyond the database's own optimistic-concurrency
//! guards. `AgentRegistry` and `Potfile` are the only state shared with the
//! HTTP/WS layer, and both are safe for that by construction (`§registry`,
//! `§aggregator`).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kh_db::agents::AgentState;
use kh_db::devices::DeviceKind;
use kh_db::hashlists::HashlistStatus;
use kh_db::jobs::JobStatus;
use kh_db::tasks::{Task, TaskState};
use kh_db::{agents, devices, hashlists, jobs, tasks, DbPool};
use kh_ids::{AgentId, ArtifactDigest, HashlistId, JobId};
use kh_protocol::http::{AttackSpec, DeviceKindDto};
use kh_protocol::{
    defaults, AckPayload, ArtifactRef, ArtifactRefKind, AssignTaskPayload, BenchmarkResultPayload,
    CancelTaskPayload, DeviceReportPayload, FileSyncErrorPayload, Frame, HeartbeatPayload,
    MessageType, TaskAcceptedPayload, TaskCompletedPayload, TaskCrackedPayload, TaskFailedPayload,
    TaskFailureReason, TaskProgressPayload,
};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::aggregator::Potfile;
use crate::config::SchedulerTiming;
use crate::error::{Result, ServerError};
use crate::registry::{self, AgentRegistry};

/// Commands fed into the scheduler actor from the HTTP/WS layer.
pub enum SchedulerCommand {
    AgentConnected {
        agent_id: AgentId,
    },
    AgentDisconnected {
        agent_id: AgentId,
    },
    AgentFrame {
        agent_id: AgentId,
        frame: Frame,
    },
    SubmitJob {
        hashlist_id: HashlistId,
        attack_spec: serde_json::Value,
        keyspace_total: u64,
        priority: i64,
        required_device_kinds: Vec<String>,
        created_by: Option<String>,
        reply: oneshot::Sender<Result<JobId>>,
    },
    CancelJob {
        job_id: JobId,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cheaply-cloneable front door to the scheduler actor.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerCommand>,
}

impl SchedulerHandle {
    pub fn agent_connected(&self, agent_id: AgentId) {
        let _ = self.tx.send(SchedulerCommand::AgentConnected { agent_id });
    }

    pub fn agent_disconnected(&self, agent_id: AgentId) {
        let _ = self.tx.send(SchedulerCommand::AgentDisconnected { agent_id });
    }

    pub fn agent_frame(&self, agent_id: AgentId, frame: Frame) {
        let _ = self.tx.send(SchedulerCommand::AgentFrame { agent_id, frame });
    }

    pub async fn submit_job(
        &self,
        hashlist_id: HashlistId,
        attack_spec: serde_json::Value,
        keyspace_total: u64,
        priority: i64,
        required_device_kinds: Vec<String>,
        created_by: Option<String>,
    ) -> Result<JobId> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::SubmitJob {
                hashlist_id,
                attack_spec,
                keyspace_total,
                priority,
                required_device_kinds,
                created_by,
                reply,
            })
            .map_err(|_| ServerError::Fatal("scheduler is not running".into()))?;
        rx.await.map_err(|_| ServerError::Fatal("scheduler dropped the reply channel".into()))?
    }

    pub async fn cancel_job(&self, job_id: JobId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::CancelJob { job_id, reply })
            .map_err(|_| ServerError::Fatal("scheduler is not running".into()))?;
        rx.await.map_err(|_| ServerError::Fatal("scheduler dropped the reply channel".into()))?
    }
}

/// Spawn the scheduler actor and return a handle to it.
pub fn spawn(
    pool: DbPool,
    registry: Arc<AgentRegistry>,
    potfile: Arc<Potfile>,
    timing: SchedulerTiming,
) -> SchedulerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let scheduler = Scheduler::new(pool, registry, potfile, timing, rx);
    tokio::spawn(scheduler.run());
    SchedulerHandle { tx }
}

struct Scheduler {
    pool: DbPool,
    registry: Arc<AgentRegistry>,
    potfile: Arc<Potfile>,
    timing: SchedulerTiming,
    rx: mpsc::UnboundedReceiver<SchedulerCommand>,
    /// `(agent_id, hash_type_id) -> hashes/sec`, populated from
    /// `benchmark_result` frames. No durable table backs this: a restart
    /// simply re-learns it from the next benchmark each agent reports.
    benchmarks: HashMap<(AgentId, i64), u64>,
    idempotency: HashMap<AgentId, kh_protocol::IdempotencyWindow>,
    dispatch_backoff_ms: u64,
    dispatch_cooldown_until: Option<Instant>,
}

impl Scheduler {
    fn new(
        pool: DbPool,
        registry: Arc<AgentRegistry>,
        potfile: Arc<Potfile>,
        timing: SchedulerTiming,
        rx: mpsc::UnboundedReceiver<SchedulerCommand>,
    ) -> Self {
        Self {
            pool,
            registry,
            potfile,
            timing,
            rx,
            benchmarks: HashMap::new(),
            idempotency: HashMap::new(),
            dispatch_backoff_ms: defaults::DISPATCH_BACKOFF_BASE_MS,
            dispatch_cooldown_until: None,
        }
    }

    async fn run(mut self) {
        self.recover_orphaned_tasks_on_boot().await;
        let mut ticker = tokio::time::interval(Duration::from_millis(250));
        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                _ = ticker.tick() => self.on_tick().await,
            }
        }
        info!("scheduler actor shut down");
    }

    async fn handle_command(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::AgentConnected { agent_id } => self.on_agent_connected(agent_id).await,
            SchedulerCommand::AgentDisconnected { agent_id } => self.on_agent_disconnected(agent_id).await,
            SchedulerCommand::AgentFrame { agent_id, frame } => self.on_agent_frame(agent_id, frame).await,
            SchedulerCommand::SubmitJob {
                hashlist_id,
                attack_spec,
                keyspace_total,
                priority,
                required_device_kinds,
                created_by,
                reply,
            } => {
                let result = self
                    .submit_job(hashlist_id, attack_spec, keyspace_total, priority, required_device_kinds, created_by)
                    .await;
                let _ = reply.send(result);
            }
            SchedulerCommand::CancelJob { job_id, reply } => {
                let result = self.cancel_job(job_id).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn on_tick(&mut self) {
        self.sweep_stale_agents().await;
        self.sweep_unaccepted_dispatches().await;
        self.sweep_abandoned_tasks().await;
        self.plan_unplanned_jobs().await;
        self.dispatch_tick().await;
    }

    // -- admission ------------------------------------------------------

    async fn submit_job(
        &mut self,
        hashlist_id: HashlistId,
        attack_spec: serde_json::Value,
        keyspace_total: u64,
        priority: i64,
        required_device_kinds: Vec<String>,
        created_by: Option<String>,
    ) -> Result<JobId> {
        let hashlist = hashlists::get(&self.pool, hashlist_id).await?;
        if hashlist.status != HashlistStatus::Ready {
            return Err(ServerError::InvalidInput(format!(
                "hashlist {hashlist_id} is not ready (status: {:?})",
                hashlist.status
            )));
        }
        if keyspace_total == 0 {
            return Err(ServerError::InvalidInput("keyspace_total must be greater than zero".into()));
        }
        if required_device_kinds.is_empty() {
            return Err(ServerError::InvalidInput("at least one device kind is required".into()));
        }

        let job_id = jobs::create(
            &self.pool,
            hashlist_id,
            &attack_spec,
            keyspace_total,
            priority,
            &required_device_kinds,
            created_by.as_deref(),
            Utc::now(),
        )
        .await?;
        Ok(job_id)
    }

    async fn cancel_job(&mut self, job_id: JobId) -> Result<()> {
        jobs::get(&self.pool, job_id).await?;
        jobs::set_status(&self.pool, job_id, JobStatus::Cancelled).await?;
        self.cancel_in_flight_siblings(job_id, None).await;
        Ok(())
    }

    // -- planning ---------------------------------------------------------

    async fn plan_unplanned_jobs(&mut self) {
        let admitted = match jobs::list_admitted(&self.pool).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to list admitted jobs");
                return;
            }
        };
        for job in admitted {
            if job.status != JobStatus::Queued {
                continue;
            }
            match tasks::job_has_tasks(&self.pool, job.id).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(_) => continue,
            }

            let kinds: Vec<DeviceKind> =
                job.required_device_kinds.iter().filter_map(|s| DeviceKind::parse(s).ok()).collect();
            let rate = kinds
                .iter()
                .map(|k| crate::planner::conservative_default_rate(*k))
                .min()
                .unwrap_or_else(|| crate::planner::conservative_default_rate(DeviceKind::Cpu));

            let ranges = crate::planner::plan(
                job.keyspace_total,
                rate,
                defaults::DEFAULT_CHUNK_TARGET,
                Duration::from_secs(defaults::DEFAULT_MIN_CHUNK_SECS),
                Duration::from_secs(defaults::DEFAULT_MAX_CHUNK_SECS),
            );
            let ranges: Vec<(i64, i64)> = ranges.into_iter().map(|r| (r.start as i64, r.end as i64)).collect();
            if let Err(e) = tasks::create_batch(&self.pool, job.id, &ranges, Utc::now()).await {
                warn!(job_id = %job.id, error = %e, "failed to plan job into tasks");
            } else {
                info!(job_id = %job.id, task_count = ranges.len(), "planned job");
            }
        }
    }

    // -- dispatch -----------------------------------------------------------

    async fn dispatch_tick(&mut self) {
        if let Some(until) = self.dispatch_cooldown_until {
            if Instant::now() < until {
                return;
            }
        }

        let pending = match tasks::list_pending(&self.pool).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to list pending tasks");
                return;
            }
        };
        if pending.is_empty() {
            self.backoff_no_work();
            return;
        }

        let connected = self.registry.connected_ids().await;
        let mut used: HashSet<AgentId> = HashSet::new();
        let mut dispatched_any = false;
        let mut hashlist_cache: HashMap<HashlistId, i64> = HashMap::new();

        for task in pending {
            let job = match jobs::get(&self.pool, task.job_execution_id).await {
                Ok(j) => j,
                Err(_) => continue,
            };
            let hash_type_id = match hashlist_cache.get(&job.hashlist_id) {
                Some(id) => *id,
                None => match hashlists::get(&self.pool, job.hashlist_id).await {
                    Ok(h) => {
                        hashlist_cache.insert(job.hashlist_id, h.hash_type_id);
                        h.hash_type_id
                    }
                    Err(_) => continue,
                },
            };
            let kinds: Vec<DeviceKind> =
                job.required_device_kinds.iter().filter_map(|s| DeviceKind::parse(s).ok()).collect();
            let attack_spec: AttackSpec = match serde_json::from_value(job.attack_spec.clone()) {
                Ok(a) => a,
                Err(_) => continue,
            };
            let digests = required_digests(&attack_spec);
            if !self.all_digests_known(&digests).await {
                continue;
            }

            let Some(agent_id) = self.pick_agent(&connected, &used, &kinds, hash_type_id).await else {
                continue;
            };
            used.insert(agent_id);
            dispatched_any = true;
            self.dispatch_task_to(&task, agent_id, job.id, hash_type_id, &job.attack_spec, &digests).await;
        }

        if dispatched_any {
            self.dispatch_backoff_ms = defaults::DISPATCH_BACKOFF_BASE_MS;
            self.dispatch_cooldown_until = None;
        } else {
            self.backoff_no_work();
        }
    }

    async fn all_digests_known(&self, digests: &[ArtifactDigest]) -> bool {
        for digest in digests {
            if !kh_db::artifacts::exists(&self.pool, digest).await.unwrap_or(false) {
                return false;
            }
        }
        true
    }

    /// Pick the best eligible, not-yet-used agent for a task requiring one
    /// of `kinds` (§4.4 eligibility + preference order). Cache-locality is
    /// not tracked server-side (no wire message reports it), so the
    /// preference order actually implemented is: highest known benchmarked
    /// rate, then most-recently-idle, then lowest agent id.
    async fn pick_agent(
        &self,
        connected: &[AgentId],
        used: &HashSet<AgentId>,
        kinds: &[DeviceKind],
        hash_type_id: i64,
    ) -> Option<AgentId> {
        let mut best: Option<(AgentId, u64, DateTime<Utc>)> = None;

        for &agent_id in connected {
            if used.contains(&agent_id) || self.registry.is_dispatching(agent_id).await {
                continue;
            }
            let Ok(agent) = agents::get(&self.pool, agent_id).await else { continue };
            if agent.state != AgentState::Active {
                continue;
            }

            let mut matched_kind = None;
            for kind in kinds {
                if devices::has_enabled_device_of_kind(&self.pool, agent_id, *kind).await.unwrap_or(false) {
                    matched_kind = Some(*kind);
                    break;
                }
            }
            let Some(kind) = matched_kind else { continue };

            let rate = self
                .benchmarks
                .get(&(agent_id, hash_type_id))
                .copied()
                .unwrap_or_else(|| crate::planner::conservative_default_rate(kind));
            let idle_at = self.registry.last_idle_at(agent_id).await.unwrap_or(agent.created_at);

            let better = match &best {
                None => true,
                Some((best_id, best_rate, best_idle)) => {
                    rate > *best_rate
                        || (rate == *best_rate && idle_at > *best_idle)
                        || (rate == *best_rate && idle_at == *best_idle && agent_id < *best_id)
                }
            };
            if better {
                best = Some((agent_id, rate, idle_at));
            }
        }

        best.map(|(id, _, _)| id)
    }

    async fn dispatch_task_to(
        &mut self,
        task: &Task,
        agent_id: AgentId,
        job_id: JobId,
        hash_type_id: i64,
        attack_spec: &serde_json::Value,
        digests: &[ArtifactDigest],
    ) {
        if tasks::assign(&self.pool, task.id, agent_id).await.is_err() {
            return;
        }
        self.registry.set_dispatching(agent_id, true).await;
        let _ = jobs::set_status(&self.pool, job_id, JobStatus::Running).await;

        let mut required_artifacts = Vec::with_capacity(digests.len());
        for digest in digests {
            if let Some(artifact_ref) = self.artifact_ref(digest).await {
                required_artifacts.push(artifact_ref);
            }
        }

        let resume_from = if task.keyspace_processed > 0 {
            Some(task.keyspace_start as u64 + task.keyspace_processed as u64)
        } else {
            None
        };

        let payload = AssignTaskPayload {
            task_id: task.id,
            job_id,
            keyspace_start: task.keyspace_start as u64,
            keyspace_end: task.keyspace_end as u64,
            resume_from,
            attack_spec: attack_spec.clone(),
            hash_type_id,
            required_artifacts,
        };
        match Frame::new(MessageType::AssignTask, &payload, Utc::now()) {
            Ok(frame) => {
                self.registry.send(agent_id, frame).await;
            }
            Err(e) => warn!(task_id = %task.id, error = %e, "failed to build assign_task frame"),
        }
    }

    async fn artifact_ref(&self, digest: &ArtifactDigest) -> Option<ArtifactRef> {
        let artifact = kh_db::artifacts::get(&self.pool, digest).await.ok()?;
        Some(ArtifactRef {
            kind: artifact_ref_kind(artifact.kind),
            name: artifact.name,
            digest: artifact.digest,
            size: artifact.size as u64,
        })
    }

    fn backoff_no_work(&mut self) {
        let jitter = rand::thread_rng().gen_range(0..=defaults::DISPATCH_BACKOFF_JITTER_MS);
        let delay = self.dispatch_backoff_ms.min(defaults::DISPATCH_BACKOFF_MAX_MS) + jitter;
        self.dispatch_cooldown_until = Some(Instant::now() + Duration::from_millis(delay));
        self.dispatch_backoff_ms = (self.dispatch_backoff_ms * 2).min(defaults::DISPATCH_BACKOFF_MAX_MS);
    }

    // -- frames from agents -------------------------------------------------

    async fn on_agent_connected(&mut self, agent_id: AgentId) {
        if let Ok(agent) = agents::get(&self.pool, agent_id).await {
            if registry::transition(agent.state, AgentState::Active).is_ok() {
                let _ = agents::set_state(&self.pool, agent_id, AgentState::Active).await;
            }
        }
    }

    async fn on_agent_disconnected(&mut self, agent_id: AgentId) {
        if let Ok(agent) = agents::get(&self.pool, agent_id).await {
            if registry::transition(agent.state, AgentState::Disconnected).is_ok() {
                let _ = agents::set_state(&self.pool, agent_id, AgentState::Disconnected).await;
            }
        }
        if let Ok(in_flight) = tasks::list_in_flight_for_agent(&self.pool, agent_id).await {
            for task in in_flight {
                self.requeue_or_fail(task.id).await;
            }
        }
    }

    async fn on_agent_frame(&mut self, agent_id: AgentId, frame: Frame) {
        let now = Utc::now();
        match frame.message_type {
            MessageType::Heartbeat => {
                if frame.parse_payload::<HeartbeatPayload>().is_ok() {
                    let _ = agents::record_heartbeat(&self.pool, agent_id, now).await;
                }
            }
            MessageType::DeviceReport => {
                if let Ok(payload) = frame.parse_payload::<DeviceReportPayload>() {
                    let devices: Vec<devices::Device> = payload
                        .devices
                        .into_iter()
                        .map(|d| devices::Device {
                            agent_id,
                            device_index: d.device_index,
                            name: d.name,
                            kind: device_kind_from_dto(d.kind),
                            enabled: d.enabled,
                        })
                        .collect();
                    let _ = devices::upsert_report(&self.pool, agent_id, &devices).await;
                }
            }
            MessageType::TaskAccepted => {
                if let Ok(payload) = frame.parse_payload::<TaskAcceptedPayload>() {
                    if tasks::mark_running(&self.pool, payload.task_id, agent_id, now).await.is_ok() {
                        self.registry.set_dispatching(agent_id, false).await;
                        self.set_agent_state(agent_id, AgentState::Busy).await;
                    }
                }
            }
            MessageType::TaskProgress => {
                if self.observe_critical(agent_id, frame.id.clone()) {
                    if let Ok(payload) = frame.parse_payload::<TaskProgressPayload>() {
                        let _ = tasks::record_progress(
                            &self.pool,
                            payload.task_id,
                            agent_id,
                            payload.processed as i64,
                            now,
                        )
                        .await;
                    }
                }
                self.ack(agent_id, frame.id).await;
            }
            MessageType::TaskCracked => {
                if self.observe_critical(agent_id, frame.id.clone()) {
                    if let Ok(payload) = frame.parse_payload::<TaskCrackedPayload>() {
                        self.apply_cracks(payload).await;
                    }
                }
                self.ack(agent_id, frame.id).await;
            }
            MessageType::TaskCompleted => {
                if self.observe_critical(agent_id, frame.id.clone()) {
                    if let Ok(payload) = frame.parse_payload::<TaskCompletedPayload>() {
                        self.complete_task(payload, agent_id, now).await;
                    }
                }
                self.ack(agent_id, frame.id).await;
            }
            MessageType::TaskFailed => {
                if let Ok(payload) = frame.parse_payload::<TaskFailedPayload>() {
                    self.fail_task(payload, agent_id, now).await;
                }
            }
            MessageType::BenchmarkResult => {
                if self.observe_critical(agent_id, frame.id.clone()) {
                    if let Ok(payload) = frame.parse_payload::<BenchmarkResultPayload>() {
                        self.benchmarks.insert((agent_id, payload.hash_type_id), payload.rate_hashes_per_sec);
                    }
                }
                self.ack(agent_id, frame.id).await;
            }
            MessageType::FileSyncError => {
                if let Ok(payload) = frame.parse_payload::<FileSyncErrorPayload>() {
                    warn!(agent_id = %agent_id, task_id = %payload.task_id, digest = %payload.digest, detail = %payload.detail, "agent file sync failed");
                    self.fail_task(
                        TaskFailedPayload {
                            task_id: payload.task_id,
                            reason: TaskFailureReason::Retryable,
                            detail: Some(payload.detail),
                        },
                        agent_id,
                        now,
                    )
                    .await;
                }
            }
            other => warn!(agent_id = %agent_id, message_type = %other, "unexpected frame direction"),
        }
    }

    fn observe_critical(&mut self, agent_id: AgentId, frame_id: kh_ids::FrameId) -> bool {
        self.idempotency
            .entry(agent_id)
            .or_insert_with(|| kh_protocol::IdempotencyWindow::new(256))
            .observe(frame_id)
    }

    async fn ack(&self, agent_id: AgentId, in_reply_to: kh_ids::FrameId) {
        if let Ok(frame) = Frame::new(MessageType::Ack, AckPayload::default(), Utc::now()) {
            self.registry.send(agent_id, frame.reply_to(in_reply_to)).await;
        }
    }

    async fn set_agent_state(&self, agent_id: AgentId, to: AgentState) {
        if let Ok(agent) = agents::get(&self.pool, agent_id).await {
            if registry::transition(agent.state, to).is_ok() {
                let _ = agents::set_state(&self.pool, agent_id, to).await;
            }
        }
    }

    async fn apply_cracks(&mut self, payload: TaskCrackedPayload) {
        let Ok(task) = tasks::get(&self.pool, payload.task_id).await else { return };
        let Ok(job) = jobs::get(&self.pool, task.job_execution_id).await else { return };
        let indices: Vec<i64> = payload.hashes.iter().map(|h| h.index).collect();
        let cracks: Vec<(i64, String)> = payload.hashes.into_iter().map(|h| (h.index, h.plaintext)).collect();

        if hashlists::apply_cracks(&self.pool, job.hashlist_id, &cracks, Utc::now()).await.is_ok() {
            if let Ok(pairs) = hashlists::cracked_pairs(&self.pool, job.hashlist_id, &indices).await {
                if let Err(e) = self.potfile.append(&pairs).await {
                    warn!(error = %e, "failed to append cracked pairs to potfile");
                }
            }
        }
    }

    async fn complete_task(&mut self, payload: TaskCompletedPayload, agent_id: AgentId, now: DateTime<Utc>) {
        let Ok(task) = tasks::get(&self.pool, payload.task_id).await else { return };
        if tasks::mark_done(&self.pool, payload.task_id, agent_id).await.is_err() {
            return;
        }
        self.registry.mark_idle(agent_id, now).await;
        self.set_agent_state(agent_id, AgentState::Active).await;

        if jobs::all_tasks_done(&self.pool, task.job_execution_id).await.unwrap_or(false) {
            let _ = jobs::set_status(&self.pool, task.job_execution_id, JobStatus::Completed).await;
        }
    }

    async fn fail_task(&mut self, payload: TaskFailedPayload, agent_id: AgentId, now: DateTime<Utc>) {
        self.registry.mark_idle(agent_id, now).await;
        self.set_agent_state(agent_id, AgentState::Active).await;

        match payload.reason {
            TaskFailureReason::Cancelled => {
                let _ = tasks::mark_failed(&self.pool, payload.task_id).await;
            }
            TaskFailureReason::Retryable => {
                self.requeue_or_fail(payload.task_id).await;
            }
            TaskFailureReason::Fatal => {
                let _ = tasks::mark_failed(&self.pool, payload.task_id).await;
                if let Ok(task) = tasks::get(&self.pool, payload.task_id).await {
                    self.fail_job_cascade(task.job_execution_id, payload.task_id).await;
                }
            }
        }
    }

    // -- failure / requeue machinery (§4.5) ----------------------------------

    /// Abandon a task back to `pending`; if it has now exhausted
    /// `max_attempts`, fail it for good and fail the whole job.
    async fn requeue_or_fail(&mut self, task_id: kh_ids::TaskId) {
        let Ok(task) = tasks::abandon_and_requeue(&self.pool, task_id).await else { return };
        if task.attempts >= self.timing.max_attempts {
            let _ = tasks::mark_failed(&self.pool, task_id).await;
            self.fail_job_cascade(task.job_execution_id, task_id).await;
        }
    }

    async fn fail_job_cascade(&mut self, job_id: JobId, failed_task: kh_ids::TaskId) {
        let _ = jobs::set_status(&self.pool, job_id, JobStatus::Failed).await;
        self.cancel_in_flight_siblings(job_id, Some(failed_task)).await;
    }

    async fn cancel_in_flight_siblings(&mut self, job_id: JobId, exclude: Option<kh_ids::TaskId>) {
        let Ok(siblings) = tasks::list_in_flight_for_job(&self.pool, job_id).await else { return };
        for sibling in siblings {
            if Some(sibling.id) == exclude {
                continue;
            }
            if let Some(agent_id) = sibling.assigned_agent_id {
                let payload =
                    CancelTaskPayload { task_id: sibling.id, cancel_grace_secs: defaults::DEFAULT_CANCEL_GRACE.as_secs() };
                if let Ok(frame) = Frame::new(MessageType::CancelTask, &payload, Utc::now()) {
                    self.registry.send(agent_id, frame).await;
                }
            }
            let _ = tasks::mark_failed(&self.pool, sibling.id).await;
        }
    }

    // -- sweeps (§4.1, §4.5) --------------------------------------------------

    async fn sweep_stale_agents(&mut self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.timing.heartbeat_interval * self.timing.missed_heartbeats)
                .unwrap_or_default();
        let Ok(stale) = agents::list_stale(&self.pool, cutoff).await else { return };
        for agent in stale {
            if registry::transition(agent.state, AgentState::Disconnected).is_ok() {
                let _ = agents::set_state(&self.pool, agent.id, AgentState::Disconnected).await;
            }
            self.registry.disconnect(agent.id).await;
            if let Ok(in_flight) = tasks::list_in_flight_for_agent(&self.pool, agent.id).await {
                for task in in_flight {
                    self.requeue_or_fail(task.id).await;
                }
            }
        }
    }

    /// Tasks dispatched but never `task_accepted` within `accept_timeout`:
    /// revert to pending and mark the unresponsive agent `error` (§4.4).
    async fn sweep_unaccepted_dispatches(&mut self) {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.timing.accept_timeout).unwrap_or_default();
        let Ok(overdue) = tasks::list_overdue(&self.pool, cutoff).await else { return };
        for task in overdue {
            if task.state != TaskState::Assigned {
                continue;
            }
            if let Some(agent_id) = task.assigned_agent_id {
                self.set_agent_state(agent_id, AgentState::Error).await;
                self.registry.set_dispatching(agent_id, false).await;
            }
            self.requeue_or_fail(task.id).await;
        }
    }

    /// Running tasks whose agent has gone silent past `progress_timeout`
    /// (§4.5: covers both a crashed agent and a stuck file sync, since a
    /// stalled sync never produces a `task_progress` either).
    async fn sweep_abandoned_tasks(&mut self) {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.timing.progress_timeout).unwrap_or_default();
        let Ok(overdue) = tasks::list_overdue(&self.pool, cutoff).await else { return };
        for task in overdue {
            if task.state != TaskState::Running {
                continue;
            }
            self.requeue_or_fail(task.id).await;
        }
    }

    /// Startup recovery: any task still `assigned`/`running` predates this
    /// process, by definition, so a cutoff of "now" catches all of them.
    async fn recover_orphaned_tasks_on_boot(&mut self) {
        let Ok(overdue) = tasks::list_overdue(&self.pool, Utc::now()).await else { return };
        if !overdue.is_empty() {
            info!(count = overdue.len(), "recovering orphaned tasks from a prior run");
        }
        for task in overdue {
            let _ = tasks::abandon_and_requeue(&self.pool, task.id).await;
        }
    }
}

fn device_kind_from_dto(kind: DeviceKindDto) -> DeviceKind {
    match kind {
        DeviceKindDto::Cpu => DeviceKind::Cpu,
        DeviceKindDto::GpuNvidia => DeviceKind::GpuNvidia,
        DeviceKindDto::GpuAmd => DeviceKind::GpuAmd,
        DeviceKindDto::GpuIntel => DeviceKind::GpuIntel,
    }
}

fn artifact_ref_kind(kind: kh_db::artifacts::ArtifactKind) -> ArtifactRefKind {
    use kh_db::artifacts::ArtifactKind::*;
    match kind {
        Binary => ArtifactRefKind::Binary,
        Wordlist => ArtifactRefKind::Wordlist,
        Rule => ArtifactRefKind::Rule,
        Hashlist => ArtifactRefKind::Hashlist,
    }
}

fn required_digests(spec: &AttackSpec) -> Vec<ArtifactDigest> {
    let raw: Vec<&String> = match spec {
        AttackSpec::Straight { wordlist_digests, rule_digests } => {
            wordlist_digests.iter().chain(rule_digests.iter()).collect()
        }
        AttackSpec::Mask { .. } => Vec::new(),
        AttackSpec::Hybrid { wordlist_digests, .. } => wordlist_digests.iter().collect(),
    };
    raw.into_iter().filter_map(|d| ArtifactDigest::from_hex(d.clone()).ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kh_db::pool::{create_pool, DbConfig};

    async fn test_scheduler() -> Scheduler {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        let registry = AgentRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        let potfile = Arc::new(Potfile::open(dir.path()).await.unwrap());
        let (_tx, rx) = mpsc::unbounded_channel();
        Scheduler::new(
            pool,
            registry,
            potfile,
            SchedulerTiming {
                heartbeat_interval: Duration::from_secs(5),
                missed_heartbeats: 3,
                accept_timeout: Duration::from_secs(30),
                progress_timeout: Duration::from_secs(120),
                max_attempts: 5,
            },
            rx,
        )
    }

    async fn seed_ready_hashlist(pool: &DbPool, client_id: i64) -> HashlistId {
        hashlists::create(pool, client_id, 0, &[(0, "abcd".into(), None)], Utc::now()).await.unwrap()
    }

    #[tokio::test]
    async fn submit_job_rejects_a_hashlist_that_is_not_ready() {
        let mut scheduler = test_scheduler().await;
        sqlx::query(
            "INSERT INTO hashlists (client_id, hash_type_id, raw_hash_count, status, created_at) VALUES (1, 0, 10, 'uploading', datetime('now'))",
        )
        .execute(&scheduler.pool)
        .await
        .unwrap();

        let result = scheduler
            .submit_job(HashlistId::new(1), serde_json::json!({"mode": "mask", "mask": "?d?d"}), 100, 0, vec!["cpu".into()], None)
            .await;
        assert!(matches!(result, Err(ServerError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn submit_job_admits_a_ready_hashlist() {
        let mut scheduler = test_scheduler().await;
        let hashlist_id = seed_ready_hashlist(&scheduler.pool, 1).await;

        let job_id = scheduler
            .submit_job(
                hashlist_id,
                serde_json::json!({"mode": "mask", "mask": "?d?d?d?d"}),
                10_000,
                5,
                vec!["cpu".into()],
                Some("alice".into()),
            )
            .await
            .unwrap();

        let job = jobs::get(&scheduler.pool, job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.keyspace_total, 10_000);
    }

    #[tokio::test]
    async fn plan_unplanned_jobs_creates_tasks_covering_the_whole_keyspace() {
        let mut scheduler = test_scheduler().await;
        let hashlist_id = seed_ready_hashlist(&scheduler.pool, 1).await;
        let job_id = scheduler
            .submit_job(hashlist_id, serde_json::json!({"mode": "mask", "mask": "?d?d"}), 50_000, 0, vec!["cpu".into()], None)
            .await
            .unwrap();

        scheduler.plan_unplanned_jobs().await;

        let tasks = tasks::list_for_job(&scheduler.pool, job_id).await.unwrap();
        assert!(!tasks.is_empty());
        let mut cursor = 0i64;
        for task in &tasks {
            assert_eq!(task.keyspace_start, cursor);
            cursor = task.keyspace_end;
        }
        assert_eq!(cursor, 50_000);
    }

    #[tokio::test]
    async fn fatal_task_failure_fails_the_job_and_cancels_siblings() {
        let mut scheduler = test_scheduler().await;
        let hashlist_id = seed_ready_hashlist(&scheduler.pool, 1).await;
        let job_id = scheduler
            .submit_job(hashlist_id, serde_json::json!({"mode": "mask", "mask": "?d"}), 2_000, 0, vec!["cpu".into()], None)
            .await
            .unwrap();
        let ids = tasks::create_batch(&scheduler.pool, job_id, &[(0, 1_000), (1_000, 2_000)], Utc::now())
            .await
            .unwrap();

        sqlx::query("INSERT INTO claim_codes (code, continuous, created_at) VALUES ('c', 1, datetime('now'))")
            .execute(&scheduler.pool)
            .await
            .unwrap();
        let agent_id = agents::insert(&scheduler.pool, "hash", "agent", 1, Utc::now()).await.unwrap();
        tasks::assign(&scheduler.pool, ids[0], agent_id).await.unwrap();
        tasks::assign(&scheduler.pool, ids[1], agent_id).await.unwrap();

        scheduler
            .fail_task(
                TaskFailedPayload { task_id: ids[0], reason: TaskFailureReason::Fatal, detail: None },
                agent_id,
                Utc::now(),
            )
            .await;

        let job = jobs::get(&scheduler.pool, job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let sibling = tasks::get(&scheduler.pool, ids[1]).await.unwrap();
        assert_eq!(sibling.state, TaskState::Failed);
    }

    #[tokio::test]
    async fn retryable_failure_under_max_attempts_goes_back_to_pending() {
        let mut scheduler = test_scheduler().await;
        let hashlist_id = seed_ready_hashlist(&scheduler.pool, 1).await;
        let job_id = scheduler
            .submit_job(hashlist_id, serde_json::json!({"mode": "mask", "mask": "?d"}), 1_000, 0, vec!["cpu".into()], None)
            .await
            .unwrap();
        let ids = tasks::create_batch(&scheduler.pool, job_id, &[(0, 1_000)], Utc::now()).await.unwrap();

        sqlx::query("INSERT INTO claim_codes (code, continuous, created_at) VALUES ('c', 1, datetime('now'))")
            .execute(&scheduler.pool)
            .await
            .unwrap();
        let agent_id = agents::insert(&scheduler.pool, "hash", "agent", 1, Utc::now()).await.unwrap();
        tasks::assign(&scheduler.pool, ids[0], agent_id).await.unwrap();

        scheduler
            .fail_task(
                TaskFailedPayload { task_id: ids[0], reason: TaskFailureReason::Retryable, detail: None },
                agent_id,
                Utc::now(),
            )
            .await;

        let task = tasks::get(&scheduler.pool, ids[0]).await.unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.attempts, 1);
        let job = jobs::get(&scheduler.pool, job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn reassigned_task_carries_resume_from_its_processed_offset() {
        let mut scheduler = test_scheduler().await;
        let hashlist_id = seed_ready_hashlist(&scheduler.pool, 1).await;
        let job_id = scheduler
            .submit_job(hashlist_id, serde_json::json!({"mode": "mask", "mask": "?d?d?d?d?d"}), 100_000, 0, vec!["cpu".into()], None)
            .await
            .unwrap();
        let ids = tasks::create_batch(&scheduler.pool, job_id, &[(0, 100_000)], Utc::now()).await.unwrap();

        sqlx::query("INSERT INTO claim_codes (code, continuous, created_at) VALUES ('c', 1, datetime('now'))")
            .execute(&scheduler.pool)
            .await
            .unwrap();
        let first_agent = agents::insert(&scheduler.pool, "hash-a", "agent-a", 1, Utc::now()).await.unwrap();
        tasks::assign(&scheduler.pool, ids[0], first_agent).await.unwrap();
        tasks::mark_running(&scheduler.pool, ids[0], first_agent, Utc::now()).await.unwrap();
        tasks::record_progress(&scheduler.pool, ids[0], first_agent, 40_000, Utc::now()).await.unwrap();
        tasks::abandon_and_requeue(&scheduler.pool, ids[0]).await.unwrap();

        let second_agent = agents::insert(&scheduler.pool, "hash-b", "agent-b", 1, Utc::now()).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        scheduler.registry.connect(second_agent, tx, Utc::now()).await;

        let task = tasks::get(&scheduler.pool, ids[0]).await.unwrap();
        scheduler
            .dispatch_task_to(&task, second_agent, job_id, 0, &serde_json::json!({"mode": "mask", "mask": "?d?d?d?d?d"}), &[])
            .await;

        let frame = rx.try_recv().unwrap();
        let payload: AssignTaskPayload = frame.parse_payload().unwrap();
        assert_eq!(payload.resume_from, Some(40_000));
        assert_eq!(payload.keyspace_start, 0);
    }
}
