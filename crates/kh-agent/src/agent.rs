//! The agent's main event loop (§4.2, §4.4): one task executes at a time;
//! messages are exchanged over a single owned control channel that is
//! recreated on every reconnect.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use kh_ids::{AgentId, FrameId, MessageId, TaskId};
use kh_protocol::{
    defaults, AckPayload, AssignTaskPayload, CancelTaskPayload, DeviceReportPayload,
    FileSyncErrorPayload, FileSyncRequiredPayload, Frame, HeartbeatPayload, MessageType,
    TaskAcceptedPayload, TaskCompletedPayload, TaskCrackedPayload, TaskFailedPayload,
    TaskFailureReason, TaskProgressPayload,
};
use kh_security::credentials::AgentCredentials;
use kh_store::{ArtifactKind, FileStore, MessageBuffer};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::channel::Channel;
use crate::config::AgentArgs;
use crate::file_sync;
use crate::hashcat::{self, HashcatJob, TaskEvent};

pub struct Agent {
    server_url: String,
    credentials: AgentCredentials,
    store: FileStore,
    buffer: MessageBuffer,
    hashcat_path: PathBuf,
    http: reqwest::Client,
}

/// The task currently occupying this agent, plus its live event receiver.
/// Kept as locals inside `serve` (not `Agent` fields) so the reconnect
/// loop's `tokio::select!` can borrow them independently of `&mut self`.
struct RunningTask {
    task_id: TaskId,
    job: HashcatJob,
}

impl Agent {
    pub async fn new(args: &AgentArgs, credentials: AgentCredentials) -> anyhow::Result<Self> {
        let store = FileStore::open(args.data_dir.clone()).await?;
        let buffer_path = args.resolved_config_dir().join("message_buffer.json");
        let buffer = MessageBuffer::load_on_start(buffer_path).await?;
        Ok(Self {
            server_url: args.server_url.clone(),
            credentials,
            store,
            buffer,
            hashcat_path: args.hashcat_path.clone(),
            http: reqwest::Client::new(),
        })
    }

    /// Connect-serve-reconnect forever, with exponential backoff on
    /// connection failure (§4.2: base 1s, factor 2, cap 60s, jitter ±20%).
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let mut attempt: u32 = 0;
        loop {
            match Channel::connect(&self.server_url, self.credentials.agent_id, &self.credentials.api_key).await {
                Ok(mut channel) => {
                    attempt = 0;
                    info!(agent_id = self.credentials.agent_id, "control channel connected");
                    self.replay_buffer(&mut channel).await;
                    if let Err(e) = self.serve(&mut channel).await {
                        warn!(error = %e, "control channel session ended");
                    }
                    channel.close().await;
                }
                Err(e) => {
                    warn!(error = %e, "failed to connect control channel");
                }
            }

            let delay = reconnect_delay(attempt);
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(delay).await;
        }
    }

    async fn replay_buffer(&mut self, channel: &mut Channel) {
        for message in self.buffer.iterate().await {
            let Some(message_type) = parse_message_type(&message.kind) else {
                warn!(kind = %message.kind, "dropping buffered message of unknown type");
                continue;
            };
            let frame = Frame {
                id: FrameId::parse(&message.id.to_string()).unwrap_or_else(|_| FrameId::new()),
                message_type,
                ts: message.timestamp,
                payload: message.payload.clone(),
                in_reply_to: None,
            };
            if channel.send(&frame).await.is_err() {
                break;
            }
        }
    }

    async fn serve(&mut self, channel: &mut Channel) -> anyhow::Result<()> {
        let mut heartbeat = tokio::time::interval(defaults::DEFAULT_HEARTBEAT_INTERVAL);
        let mut task: Option<RunningTask> = None;
        let mut events: Option<mpsc::UnboundedReceiver<TaskEvent>> = None;

        loop {
            tokio::select! {
                frame = channel.recv() => {
                    match frame? {
                        Some(frame) => self.handle_inbound(channel, frame, &mut task, &mut events).await?,
                        None => {
                            info!("control channel closed by peer");
                            return Ok(());
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    self.send_heartbeat(channel, task.is_none()).await?;
                }
                event = recv_task_event(events.as_mut()) => {
                    if let Some(event) = event {
                        self.handle_task_event(channel, &mut task, &mut events, event).await?;
                    }
                }
            }
        }
    }

    async fn handle_inbound(
        &mut self,
        channel: &mut Channel,
        frame: Frame,
        task: &mut Option<RunningTask>,
        events: &mut Option<mpsc::UnboundedReceiver<TaskEvent>>,
    ) -> anyhow::Result<()> {
        match frame.message_type {
            MessageType::AssignTask => {
                let payload: AssignTaskPayload = frame.parse_payload()?;
                self.start_task(channel, payload, task, events).await?;
            }
            MessageType::CancelTask => {
                let payload: CancelTaskPayload = frame.parse_payload()?;
                self.cancel_task(channel, payload.task_id, payload.cancel_grace_secs, task, events).await?;
            }
            MessageType::FileSyncRequired => {
                let payload: FileSyncRequiredPayload = frame.parse_payload()?;
                if let Err(e) = file_sync::ensure_synced(&self.http, &self.server_url, &self.store, &payload.artifacts).await {
                    warn!(task_id = %payload.task_id, error = %e, "file sync failed");
                    self.report_file_sync_error(channel, payload.task_id, &payload.artifacts, &e).await?;
                }
            }
            MessageType::ForceDisconnect => {
                anyhow::bail!("server requested force_disconnect");
            }
            MessageType::ConfigPush => {
                info!("received config_push (runtime reconfiguration not yet applied)");
            }
            MessageType::Ack => {
                let payload: AckPayload = frame.parse_payload()?;
                let acked_id = payload.buffered_message_id.or_else(|| {
                    frame
                        .in_reply_to
                        .as_ref()
                        .and_then(|id| MessageId::parse(&id.to_string()).ok())
                });
                if let Some(id) = acked_id {
                    let _ = self.buffer.remove_by_ids(&[id]).await;
                }
            }
            other => {
                warn!(message_type = %other, "unexpected message direction from server");
            }
        }
        Ok(())
    }

    async fn start_task(
        &mut self,
        channel: &mut Channel,
        payload: AssignTaskPayload,
        task: &mut Option<RunningTask>,
        events: &mut Option<mpsc::UnboundedReceiver<TaskEvent>>,
    ) -> anyhow::Result<()> {
        let task_id = payload.task_id;
        let ack = Frame::new(MessageType::TaskAccepted, TaskAcceptedPayload { task_id }, Utc::now())?;
        channel.send(&ack).await?;

        if let Err(e) =
            file_sync::ensure_synced(&self.http, &self.server_url, &self.store, &payload.required_artifacts).await
        {
            warn!(task_id = %task_id, error = %e, "file sync failed before task start");
            self.report_file_sync_error(channel, task_id, &payload.required_artifacts, &e).await?;
            return Ok(());
        }

        let skip_offset = payload.resume_from.unwrap_or(payload.keyspace_start);
        let hashlist_path = self.store.root().join(ArtifactKind::Hashlist.subtree());
        let args = hashcat::build_args(
            payload.hash_type_id,
            skip_offset,
            payload.keyspace_end,
            &hashlist_path,
            &[],
        );
        match HashcatJob::spawn(&self.hashcat_path, task_id, &args) {
            Ok((job, rx)) => {
                *task = Some(RunningTask { task_id, job });
                *events = Some(rx);
            }
            Err(e) => {
                self.send_critical(channel, MessageType::TaskFailed, TaskFailedPayload {
                    task_id,
                    reason: TaskFailureReason::Retryable,
                    detail: Some(e.to_string()),
                }).await?;
            }
        }
        Ok(())
    }

    /// Report a file-sync failure for the artifact it actually concerns
    /// where known, falling back to the first required artifact (§4.5).
    async fn report_file_sync_error(
        &mut self,
        channel: &mut Channel,
        task_id: TaskId,
        required: &[kh_protocol::ArtifactRef],
        error: &file_sync::FileSyncError,
    ) -> anyhow::Result<()> {
        let Some(digest) = error.digest().cloned().or_else(|| required.first().map(|a| a.digest.clone())) else {
            return Ok(());
        };
        self.send_critical(channel, MessageType::FileSyncError, FileSyncErrorPayload {
            task_id,
            digest,
            detail: error.to_string(),
        }).await
    }

    async fn cancel_task(
        &mut self,
        channel: &mut Channel,
        task_id: TaskId,
        grace_secs: u64,
        task: &mut Option<RunningTask>,
        events: &mut Option<mpsc::UnboundedReceiver<TaskEvent>>,
    ) -> anyhow::Result<()> {
        if let Some(running) = task.as_mut() {
            if running.task_id == task_id {
                running.job.cancel(Duration::from_secs(grace_secs)).await;
                *task = None;
                *events = None;
                self.send_critical(channel, MessageType::TaskFailed, TaskFailedPayload {
                    task_id,
                    reason: TaskFailureReason::Cancelled,
                    detail: None,
                }).await?;
            }
        }
        Ok(())
    }

    async fn handle_task_event(
        &mut self,
        channel: &mut Channel,
        task: &mut Option<RunningTask>,
        events: &mut Option<mpsc::UnboundedReceiver<TaskEvent>>,
        event: TaskEvent,
    ) -> anyhow::Result<()> {
        let Some(running) = task.as_ref() else { return Ok(()) };
        let task_id = running.task_id;

        match event {
            TaskEvent::Progress { processed, rate_hashes_per_sec } => {
                self.send_critical(channel, MessageType::TaskProgress, TaskProgressPayload {
                    task_id,
                    processed,
                    rate_hashes_per_sec,
                    eta_secs: None,
                }).await?;
            }
            TaskEvent::Cracked(hashes) => {
                self.send_critical(channel, MessageType::TaskCracked, TaskCrackedPayload { task_id, hashes }).await?;
            }
            TaskEvent::Completed { keyspace_processed } => {
                self.send_critical(channel, MessageType::TaskCompleted, TaskCompletedPayload {
                    task_id,
                    keyspace_processed,
                }).await?;
                *task = None;
                *events = None;
            }
            TaskEvent::Failed { reason, detail } => {
                self.send_critical(channel, MessageType::TaskFailed, TaskFailedPayload { task_id, reason, detail }).await?;
                *task = None;
                *events = None;
            }
        }
        Ok(())
    }

    async fn send_heartbeat(&mut self, channel: &mut Channel, idle: bool) -> anyhow::Result<()> {
        let frame = Frame::new(
            MessageType::Heartbeat,
            HeartbeatPayload {
                agent_version: env!("CARGO_PKG_VERSION").to_string(),
                idle,
            },
            Utc::now(),
        )?;
        channel.send(&frame).await?;

        let devices = Frame::new(
            MessageType::DeviceReport,
            DeviceReportPayload { devices: crate::enrollment::enumerate_devices() },
            Utc::now(),
        )?;
        channel.send(&devices).await?;
        Ok(())
    }

    /// Critical messages (§4.2, §4.7) are appended to the durable buffer
    /// before send and removed only once the server's `ack` names them.
    async fn send_critical<T: serde::Serialize>(
        &mut self,
        channel: &mut Channel,
        message_type: MessageType,
        payload: T,
    ) -> anyhow::Result<()> {
        let frame = Frame::new(message_type, &payload, Utc::now())?;
        if message_type.is_critical() {
            self.buffer
                .append(kh_store::BufferedMessage {
                    id: MessageId::parse(&frame.id.to_string()).unwrap_or_else(|_| MessageId::new()),
                    kind: message_type.as_str().to_string(),
                    payload: serde_json::to_value(&payload)?,
                    timestamp: frame.ts,
                    agent_id: AgentId::new(self.credentials.agent_id),
                })
                .await?;
        }
        channel.send(&frame).await?;
        Ok(())
    }
}

fn parse_message_type(kind: &str) -> Option<MessageType> {
    MessageType::ALL.iter().copied().find(|mt| mt.as_str() == kind)
}

async fn recv_task_event(events: Option<&mut mpsc::UnboundedReceiver<TaskEvent>>) -> Option<TaskEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// `base * factor^attempt` capped at `cap`, jittered by ±`jitter_pct`
/// (§4.2).
fn reconnect_delay(attempt: u32) -> Duration {
    let base = defaults::RECONNECT_BACKOFF_BASE_MS as f64;
    let factor = defaults::RECONNECT_BACKOFF_FACTOR;
    let cap = defaults::RECONNECT_BACKOFF_CAP_MS as f64;
    let raw = (base * factor.powi(attempt as i32)).min(cap);

    let jitter_pct = defaults::RECONNECT_BACKOFF_JITTER_PCT;
    let jitter = rand::thread_rng().gen_range(-jitter_pct..=jitter_pct);
    let jittered = (raw * (1.0 + jitter)).max(0.0);
    Duration::from_millis(jittered as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_never_exceeds_cap_plus_jitter() {
        for attempt in 0..20 {
            let delay = reconnect_delay(attempt);
            let max_allowed = (defaults::RECONNECT_BACKOFF_CAP_MS as f64
                * (1.0 + defaults::RECONNECT_BACKOFF_JITTER_PCT)) as u64;
            assert!(delay.as_millis() as u64 <= max_allowed);
        }
    }

    #[test]
    fn message_type_names_round_trip() {
        for mt in MessageType::ALL {
            assert_eq!(parse_message_type(mt.as_str()), Some(*mt));
        }
        assert_eq!(parse_message_type("not_a_type"), None);
    }
}
