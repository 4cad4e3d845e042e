//! Supervisor façade
//!
//! Every public operation takes the caller's key secret first. Mutating
//! operations are authorized for their scope before the alias is looked
//! up; read operations only need a valid key.

pub mod error;
pub mod managed_process;
pub mod process;
pub mod scheduler;
pub mod state_machine;

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

use crate::auth::{AdminKey, ApiKey, AuthError, IssuedKey, KeyAuthority, KeyStorage, Scope};
use crate::config::{GlobalConfig, ServerConfig};
use crate::console::{
    ConsoleBuffer, ConsoleEvent, ConsoleLine, EventBus, EventKind, EventMatcher, RestartReason,
    Subscription, SubscriptionFilter,
};
use crate::instance::{InstanceRegistry, InstanceSummary};
use crate::utils::format_duration;

pub use error::SupervisorError;
use managed_process::{ExitSignal, ManagedProcess, OutputLines};
use process::{LaunchSpec, ProcessExit};
use scheduler::ScheduledAction;
use state_machine::InstanceStatus;

type Result<T> = std::result::Result<T, SupervisorError>;

/// Outcome of `send_command`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CommandReply {
    pub command: String,
    /// First console line after the command, if one arrived in time.
    pub reply: Option<String>,
    /// False when the reply carries the server's unknown-command marker.
    pub recognized: bool,
}

/// Everything the background tasks of one spawn need.
struct Launch {
    process: Arc<ManagedProcess>,
    lines: OutputLines,
    generation: u64,
    matcher: Arc<EventMatcher>,
    buffer: Arc<std::sync::Mutex<ConsoleBuffer>>,
    probe: Duration,
}

enum StartPlan {
    AlreadyUp(InstanceStatus),
    Launched(Launch),
}

#[derive(Clone)]
pub struct Supervisor {
    registry: Arc<InstanceRegistry>,
    keys: Arc<KeyAuthority>,
    bus: EventBus,
}

impl Supervisor {
    pub fn new(registry: Arc<InstanceRegistry>, keys: Arc<KeyAuthority>, bus: EventBus) -> Self {
        Self { registry, keys, bus }
    }

    /// Build from the loaded configuration.
    ///
    /// The key store must be readable and the admin key must exist (or be
    /// created) afterwards; either failure is returned. A server entry that
    /// failed to parse or fails validation is logged and skipped.
    pub fn from_config(config: &GlobalConfig, store: Box<dyn KeyStorage>) -> Result<(Self, AdminKey)> {
        let keys = KeyAuthority::load(store).map_err(AuthError::from)?;
        let admin = keys.generate_admin_key()?;

        let registry = Arc::new(InstanceRegistry::new());
        for skipped in &config.skipped {
            tracing::error!("[{}] Skipping instance: {}", skipped.name, skipped.reason);
        }
        for entry in &config.servers {
            if let Err(e) = registry.register(&entry.name, entry.config.clone(), entry.autostart) {
                tracing::error!("[{}] Skipping instance: {}", entry.name, e);
            }
        }
        tracing::info!("Loaded {} server instances", registry.aliases().len());

        Ok((Self::new(registry, Arc::new(keys), EventBus::default()), admin))
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn keys(&self) -> &Arc<KeyAuthority> {
        &self.keys
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // ─── Lifecycle operations ────────────────────────────────

    pub async fn start(&self, key: &str, alias: &str) -> Result<InstanceStatus> {
        self.keys.authorize(key, &Scope::manage(alias))?;
        self.start_instance(alias).await
    }

    pub async fn stop(&self, key: &str, alias: &str) -> Result<InstanceStatus> {
        self.keys.authorize(key, &Scope::manage(alias))?;
        self.stop_instance(alias, true).await
    }

    /// Stop without the graceful shutdown command.
    pub async fn kill(&self, key: &str, alias: &str) -> Result<InstanceStatus> {
        self.keys.authorize(key, &Scope::manage(alias))?;
        self.stop_instance(alias, false).await
    }

    pub async fn restart(&self, key: &str, alias: &str) -> Result<InstanceStatus> {
        self.keys.authorize(key, &Scope::manage(alias))?;
        self.restart_instance(alias, RestartReason::Manual).await
    }

    /// Restart after `delay`. Players are warned right away and again at
    /// every configured alert offset shorter than the delay; the restart
    /// itself is carried out by the scheduler loop.
    ///
    /// Replaces any pending periodic restart. A delay under one second
    /// restarts immediately.
    pub async fn restart_in(&self, key: &str, alias: &str, delay: Duration) -> Result<InstanceStatus> {
        self.keys.authorize(key, &Scope::manage(alias))?;
        if delay.as_secs() == 0 {
            return self.restart_instance(alias, RestartReason::Manual).await;
        }

        self.registry.with_instance(alias, |inst| {
            if inst.status() != InstanceStatus::Running {
                return Err(SupervisorError::NotRunning(alias.to_string()));
            }
            let offsets = inst.config.restart.alert_offsets.clone();
            inst.schedule.arm(Instant::now(), delay, &offsets);
            Ok(())
        })??;

        tracing::info!("[{}] Restart requested in {}", alias, format_duration(delay.as_secs()));
        self.fire_alert(alias, delay.as_secs()).await;
        Ok(InstanceStatus::Running)
    }

    pub async fn send_command(&self, key: &str, alias: &str, command: &str) -> Result<CommandReply> {
        self.keys.authorize(key, &Scope::manage(alias))?;

        let (process, config) = self.registry.with_instance(alias, |inst| {
            match (&inst.process, inst.status()) {
                (Some(process), InstanceStatus::Running) => Ok((process.clone(), inst.config.clone())),
                _ => Err(SupervisorError::NotRunning(alias.to_string())),
            }
        })??;

        // 쓰기 전에 구독해야 응답 줄을 놓치지 않음
        let mut replies = self.bus.subscribe(SubscriptionFilter::Alias(alias.to_string()));

        process
            .write_line(command)
            .await
            .map_err(|e| SupervisorError::from_process(alias, e))?;
        tracing::info!("[{}] Command sent: {}", alias, command);
        self.bus.publish(ConsoleEvent::new(alias, EventKind::CommandSent { command: command.to_string() }));

        let reply = tokio::time::timeout(config.command_reply_timeout(), async {
            while let Some(event) = replies.next().await {
                if let Some(line) = &event.line {
                    return Some(line.clone());
                }
            }
            None
        })
        .await
        .ok()
        .flatten();

        let marker = config.console.unknown_command_marker.to_lowercase();
        let recognized = match &reply {
            Some(line) if !marker.is_empty() => !line.to_lowercase().contains(&marker),
            _ => true,
        };

        Ok(CommandReply {
            command: command.to_string(),
            reply,
            recognized,
        })
    }

    // ─── Key operations ──────────────────────────────────────

    pub fn issue_key(&self, key: &str, owner: &str, scopes: BTreeSet<Scope>) -> Result<IssuedKey> {
        Ok(self.keys.issue(key, owner, scopes)?)
    }

    pub fn revoke_key(&self, key: &str, target_secret: &str) -> Result<ApiKey> {
        Ok(self.keys.revoke(key, target_secret)?)
    }

    pub fn revoke_key_by_id(&self, key: &str, key_id: &str) -> Result<ApiKey> {
        Ok(self.keys.revoke_by_id(key, key_id)?)
    }

    pub fn list_keys(&self, key: &str) -> Result<Vec<ApiKey>> {
        Ok(self.keys.list(key)?)
    }

    // ─── Queries ─────────────────────────────────────────────

    pub fn status(&self, key: &str, alias: &str) -> Result<InstanceSummary> {
        self.keys.authenticate(key)?;
        let now = Instant::now();
        self.registry.with_instance(alias, |inst| inst.summary(now))
    }

    pub fn list(&self, key: &str) -> Result<Vec<InstanceSummary>> {
        self.keys.authenticate(key)?;
        Ok(self.registry.summaries(Instant::now()))
    }

    /// Online players, sorted.
    pub fn players(&self, key: &str, alias: &str) -> Result<Vec<String>> {
        self.keys.authenticate(key)?;
        self.registry
            .with_instance(alias, |inst| inst.players.iter().cloned().collect())
    }

    pub fn console_history(&self, key: &str, alias: &str, count: usize) -> Result<Vec<ConsoleLine>> {
        self.keys.authenticate(key)?;
        let buffer = self.registry.with_instance(alias, |inst| inst.buffer.clone())?;
        let lines = buffer.lock().unwrap_or_else(|e| e.into_inner()).recent(count);
        Ok(lines)
    }

    pub fn console_since(&self, key: &str, alias: &str, since_id: u64) -> Result<Vec<ConsoleLine>> {
        self.keys.authenticate(key)?;
        let buffer = self.registry.with_instance(alias, |inst| inst.buffer.clone())?;
        let lines = buffer.lock().unwrap_or_else(|e| e.into_inner()).since(since_id);
        Ok(lines)
    }

    pub fn subscribe(&self, key: &str, filter: SubscriptionFilter) -> Result<Subscription> {
        self.keys.authenticate(key)?;
        if let SubscriptionFilter::Alias(alias) = &filter {
            if !self.registry.contains(alias) {
                return Err(SupervisorError::AliasNotFound(alias.clone()));
            }
        }
        Ok(self.bus.subscribe(filter))
    }

    // ─── Instance management ─────────────────────────────────

    pub fn register_instance(&self, key: &str, alias: &str, config: ServerConfig) -> Result<()> {
        self.keys.authorize(key, &Scope::ManageAll)?;
        self.registry.register(alias, config, false)
    }

    /// Remove an instance, stopping its process first.
    pub async fn remove_instance(&self, key: &str, alias: &str) -> Result<()> {
        self.keys.authorize(key, &Scope::ManageAll)?;

        let has_process = self.registry.with_instance(alias, |inst| inst.status().has_process())?;
        if has_process {
            self.stop_instance(alias, true).await?;
        }

        if let Some(removed) = self.registry.remove(alias) {
            // stop 이후 다시 시작된 경우
            if let Some(process) = removed.process {
                process.terminate(false).await;
            }
        }
        Ok(())
    }

    /// Start every instance marked `autostart`, one after another.
    pub async fn autostart(&self) {
        let aliases: Vec<String> = self
            .registry
            .summaries(Instant::now())
            .into_iter()
            .filter(|s| s.autostart)
            .map(|s| s.alias)
            .collect();

        for alias in aliases {
            match self.start_instance(&alias).await {
                Ok(status) => tracing::info!("[{}] Autostart: {}", alias, status),
                Err(e) => tracing::error!("[{}] Autostart failed: {}", alias, e),
            }
        }
    }

    /// Gracefully stop every live instance.
    pub async fn shutdown(&self) {
        let mut stops = JoinSet::new();
        for alias in self.registry.aliases() {
            let supervisor = self.clone();
            stops.spawn(async move {
                if let Err(e) = supervisor.stop_instance(&alias, true).await {
                    tracing::warn!("[{}] Shutdown stop failed: {}", alias, e);
                }
            });
        }
        while stops.join_next().await.is_some() {}
        tracing::info!("All instances stopped");
    }

    // ─── Scheduler entry points ──────────────────────────────

    pub(crate) fn collect_due(&self, now: Instant) -> Vec<(String, Vec<ScheduledAction>)> {
        self.registry.collect_due(now)
    }

    pub(crate) async fn run_scheduled(&self, alias: &str, actions: Vec<ScheduledAction>) {
        for action in actions {
            match action {
                ScheduledAction::Alert { seconds_remaining } => self.fire_alert(alias, seconds_remaining).await,
                ScheduledAction::Restart => {
                    if let Err(e) = self.restart_instance(alias, RestartReason::Scheduled).await {
                        tracing::error!("[{}] Scheduled restart failed: {}", alias, e);
                    }
                }
            }
        }
    }

    async fn fire_alert(&self, alias: &str, seconds_remaining: u64) {
        tracing::info!("[{}] Restart in {}", alias, format_duration(seconds_remaining));
        self.bus.publish(ConsoleEvent::new(alias, EventKind::RestartAlert { seconds_remaining }));

        let target = self.registry.with_instance(alias, |inst| {
            let command = inst.config.restart.alert_command.clone().filter(|c| !c.trim().is_empty());
            match (&inst.process, inst.status(), command) {
                (Some(process), InstanceStatus::Running, Some(command)) => Some((process.clone(), command)),
                _ => None,
            }
        });

        if let Ok(Some((process, command))) = target {
            let line = command.replace("{time}", &format_duration(seconds_remaining));
            if let Err(e) = process.write_line(&line).await {
                tracing::warn!("[{}] Could not deliver restart alert: {}", alias, e);
            }
        }
    }

    // ─── Internal lifecycle ──────────────────────────────────

    async fn start_instance(&self, alias: &str) -> Result<InstanceStatus> {
        let plan = self.registry.with_instance(alias, |inst| -> Result<StartPlan> {
            let status = inst.status();
            match status {
                InstanceStatus::Starting | InstanceStatus::Running => return Ok(StartPlan::AlreadyUp(status)),
                InstanceStatus::Stopping => {
                    return Err(SupervisorError::InvalidState {
                        alias: alias.to_string(),
                        operation: "start",
                        status,
                    })
                }
                InstanceStatus::Stopped | InstanceStatus::Crashed => {}
            }

            let spec = LaunchSpec::resolve(&inst.config).map_err(|source| {
                tracing::error!("[{}] Cannot resolve launch command: {}", alias, source);
                SupervisorError::Spawn { alias: alias.to_string(), source }
            })?;
            let (process, lines) = ManagedProcess::spawn(alias, &spec).map_err(|source| {
                tracing::error!("[{}] Spawn failed: {}", alias, source);
                SupervisorError::Spawn { alias: alias.to_string(), source }
            })?;

            inst.transition(InstanceStatus::Starting).map_err(|e| SupervisorError::InvalidState {
                alias: alias.to_string(),
                operation: "start",
                status: e.from,
            })?;
            inst.generation += 1;
            inst.players.clear();
            let process = Arc::new(process);
            inst.process = Some(process.clone());

            let policy = &inst.config.restart;
            if policy.enabled {
                inst.schedule.arm(Instant::now(), policy.interval(), &policy.alert_offsets);
            }

            Ok(StartPlan::Launched(Launch {
                process,
                lines,
                generation: inst.generation,
                matcher: inst.matcher.clone(),
                buffer: inst.buffer.clone(),
                probe: inst.config.startup_probe(),
            }))
        })??;

        let launch = match plan {
            StartPlan::AlreadyUp(status) => return Ok(status),
            StartPlan::Launched(launch) => launch,
        };
        self.publish_status(alias, InstanceStatus::Starting);

        let generation = launch.generation;
        let mut exit = launch.process.exit_signal();
        tokio::spawn(self.clone().pump_console(
            alias.to_string(),
            generation,
            launch.lines,
            launch.matcher,
            launch.buffer,
        ));
        tokio::spawn(self.clone().watch_exit(alias.to_string(), generation, launch.process.exit_signal()));
        drop(launch.process);

        // probe 시간 동안 살아 있어야 Running
        if tokio::time::timeout(launch.probe, exit.wait()).await.is_ok() {
            let outcome = exit.get().unwrap_or_else(ProcessExit::unknown);
            self.handle_exit(alias, generation, outcome);
            return self.registry.with_instance(alias, |inst| inst.status());
        }

        let promoted = self.registry.with_instance(alias, |inst| {
            if inst.generation == generation && inst.status() == InstanceStatus::Starting {
                inst.transition(InstanceStatus::Running).is_ok()
            } else {
                false
            }
        })?;
        if promoted {
            self.publish_status(alias, InstanceStatus::Running);
        }
        self.registry.with_instance(alias, |inst| inst.status())
    }

    async fn stop_instance(&self, alias: &str, graceful: bool) -> Result<InstanceStatus> {
        let target = self.registry.with_instance(alias, |inst| {
            inst.schedule.disarm();
            match inst.status() {
                InstanceStatus::Stopped => None,
                InstanceStatus::Crashed => {
                    let _ = inst.transition(InstanceStatus::Stopped);
                    Some((None, InstanceStatus::Stopped))
                }
                InstanceStatus::Stopping => inst
                    .process
                    .clone()
                    .map(|p| (Some((p, inst.generation)), InstanceStatus::Stopping)),
                InstanceStatus::Starting | InstanceStatus::Running => {
                    let _ = inst.transition(InstanceStatus::Stopping);
                    inst.process
                        .clone()
                        .map(|p| (Some((p, inst.generation)), InstanceStatus::Stopping))
                }
            }
        })?;

        let Some((process, status)) = target else {
            return Ok(InstanceStatus::Stopped);
        };
        self.publish_status(alias, status);

        if let Some((process, generation)) = process {
            tracing::info!("[{}] Stopping (graceful: {})", alias, graceful);
            let outcome = process.terminate(graceful).await;
            drop(process);
            self.handle_exit(alias, generation, outcome);
        }
        self.registry.with_instance(alias, |inst| inst.status())
    }

    async fn restart_instance(&self, alias: &str, reason: RestartReason) -> Result<InstanceStatus> {
        if !self.registry.contains(alias) {
            return Err(SupervisorError::AliasNotFound(alias.to_string()));
        }
        tracing::info!("[{}] Restarting ({:?})", alias, reason);
        self.bus.publish(ConsoleEvent::new(alias, EventKind::RestartTriggered { reason }));

        self.stop_instance(alias, true).await?;
        self.start_instance(alias).await
    }

    /// Apply an exit of spawn `generation`. Idempotent: later calls for the
    /// same exit find the status already settled.
    fn handle_exit(&self, alias: &str, generation: u64, outcome: ProcessExit) {
        let result = self.registry.with_instance(alias, |inst| {
            if inst.generation != generation || !inst.status().has_process() {
                return None;
            }
            let from = inst.status();
            let to = from.after_exit(outcome.success);
            let _ = inst.transition(to);
            inst.process = None;
            inst.players.clear();
            inst.schedule.disarm();

            let policy = &inst.config.restart;
            let recover = to == InstanceStatus::Crashed
                && from == InstanceStatus::Running
                && policy.enabled
                && policy.restart_on_crash;
            Some((to, recover.then(|| policy.crash_restart_delay())))
        });

        let Ok(Some((status, recover_after))) = result else { return };
        if status == InstanceStatus::Crashed {
            tracing::warn!("[{}] Process crashed ({})", alias, outcome);
        }
        self.publish_status(alias, status);

        if let Some(delay) = recover_after {
            tracing::info!("[{}] Restarting after crash in {:?}", alias, delay);
            let supervisor = self.clone();
            let alias = alias.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                // 그 사이 누군가 시작/정지했으면 건너뜀
                let still_crashed = supervisor
                    .registry
                    .with_instance(&alias, |inst| {
                        inst.generation == generation && inst.status() == InstanceStatus::Crashed
                    })
                    .unwrap_or(false);
                if still_crashed {
                    if let Err(e) = supervisor.restart_instance(&alias, RestartReason::Crash).await {
                        tracing::error!("[{}] Crash recovery failed: {}", alias, e);
                    }
                }
            });
        }
    }

    async fn watch_exit(self, alias: String, generation: u64, mut exit: ExitSignal) {
        let outcome = exit.wait().await;
        self.handle_exit(&alias, generation, outcome);
    }

    async fn pump_console(
        self,
        alias: String,
        generation: u64,
        mut lines: OutputLines,
        matcher: Arc<EventMatcher>,
        buffer: Arc<std::sync::Mutex<ConsoleBuffer>>,
    ) {
        while let Some(output) = lines.next_line().await {
            let stored = buffer
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(output.source, output.text);
            tracing::debug!("[{}] {}", alias, stored.text);

            let kind = matcher.classify(&stored.text);
            match &kind {
                EventKind::PlayerConnected { username, .. } => {
                    tracing::info!("[{}] Player joined: {}", alias, username);
                    let _ = self.registry.with_instance(&alias, |inst| {
                        // 종료 후 남은 출력은 이벤트만 발행
                        if inst.generation == generation && inst.status().has_process() {
                            inst.players.insert(username.clone());
                        }
                    });
                }
                EventKind::PlayerDisconnected { username, reason } => {
                    tracing::info!("[{}] Player left: {} ({})", alias, username, reason);
                    let _ = self.registry.with_instance(&alias, |inst| {
                        if inst.generation == generation && inst.status().has_process() {
                            inst.players.remove(username);
                        }
                    });
                }
                _ => {}
            }

            self.bus.publish(ConsoleEvent::new(&alias, kind).with_line(&stored.text, Some(stored.source)));
        }
        tracing::debug!("[{}] Console stream closed", alias);
    }

    fn publish_status(&self, alias: &str, status: InstanceStatus) {
        self.bus.publish(ConsoleEvent::new(alias, EventKind::StatusChanged { status }));
    }
}
