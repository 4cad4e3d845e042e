//! Server Instance Registry
//!
//! Alias → instance map. All reads and writes happen under one lock, and
//! no caller holds it across an await point.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::{validate_alias, ServerConfig};
use crate::console::{ConsoleBuffer, EventMatcher};
use crate::supervisor::error::SupervisorError;
use crate::supervisor::managed_process::ManagedProcess;
use crate::supervisor::scheduler::{RestartSchedule, ScheduledAction};
use crate::supervisor::state_machine::{InstanceStatus, StateMachine, TransitionError};

/// 서버 인스턴스 - 설정, 상태, 실행 중인 프로세스, 재시작 일정
pub struct ServerInstance {
    pub alias: String,
    pub config: Arc<ServerConfig>,
    pub matcher: Arc<EventMatcher>,
    pub autostart: bool,
    state: StateMachine,
    /// Present iff the status has a process (Starting/Running/Stopping).
    pub process: Option<Arc<ManagedProcess>>,
    /// Bumped on every spawn; exit watchers of older spawns are ignored.
    pub generation: u64,
    pub schedule: RestartSchedule,
    pub players: BTreeSet<String>,
    pub buffer: Arc<Mutex<ConsoleBuffer>>,
}

impl ServerInstance {
    fn new(alias: &str, config: ServerConfig, autostart: bool) -> Self {
        let (matcher, warnings) = EventMatcher::compile(&config.console);
        for warning in &warnings {
            tracing::warn!("[{}] Console pattern {}", alias, warning);
        }

        Self {
            alias: alias.to_string(),
            buffer: Arc::new(Mutex::new(ConsoleBuffer::with_capacity(config.scrollback_lines))),
            config: Arc::new(config),
            matcher: Arc::new(matcher),
            autostart,
            state: StateMachine::new(),
            process: None,
            generation: 0,
            schedule: RestartSchedule::Idle,
            players: BTreeSet::new(),
        }
    }

    pub fn status(&self) -> InstanceStatus {
        self.state.status()
    }

    pub fn transition(&mut self, to: InstanceStatus) -> Result<InstanceStatus, TransitionError> {
        let from = self.state.transition(to)?;
        tracing::info!("[{}] State transition: {} -> {}", self.alias, from, to);
        Ok(from)
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid())
    }

    pub fn summary(&self, now: Instant) -> InstanceSummary {
        InstanceSummary {
            alias: self.alias.clone(),
            status: self.status(),
            pid: self.pid(),
            players_online: self.players.len(),
            next_restart_secs: self.schedule.next_restart_in(now).map(|d| d.as_secs()),
            autostart: self.autostart,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InstanceSummary {
    pub alias: String,
    pub status: InstanceStatus,
    pub pid: Option<u32>,
    pub players_online: usize,
    pub next_restart_secs: Option<u64>,
    pub autostart: bool,
}

#[derive(Default)]
pub struct InstanceRegistry {
    instances: Mutex<HashMap<String, ServerInstance>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, alias: &str, config: ServerConfig, autostart: bool) -> Result<(), SupervisorError> {
        validate_alias(alias)?;
        config.validate()?;

        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        if instances.contains_key(alias) {
            return Err(SupervisorError::AliasExists(alias.to_string()));
        }
        instances.insert(alias.to_string(), ServerInstance::new(alias, config, autostart));
        tracing::info!("[{}] Instance registered", alias);
        Ok(())
    }

    pub fn remove(&self, alias: &str) -> Option<ServerInstance> {
        let removed = self
            .instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(alias);
        if removed.is_some() {
            tracing::info!("[{}] Instance removed", alias);
        }
        removed
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.instances.lock().unwrap_or_else(|e| e.into_inner()).contains_key(alias)
    }

    /// Run `f` on the instance under the registry lock.
    pub fn with_instance<R>(
        &self,
        alias: &str,
        f: impl FnOnce(&mut ServerInstance) -> R,
    ) -> Result<R, SupervisorError> {
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        let instance = instances
            .get_mut(alias)
            .ok_or_else(|| SupervisorError::AliasNotFound(alias.to_string()))?;
        Ok(f(instance))
    }

    pub fn aliases(&self) -> Vec<String> {
        let instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        let mut aliases: Vec<String> = instances.keys().cloned().collect();
        aliases.sort();
        aliases
    }

    pub fn summaries(&self, now: Instant) -> Vec<InstanceSummary> {
        let instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<InstanceSummary> = instances.values().map(|i| i.summary(now)).collect();
        list.sort_by(|a, b| a.alias.cmp(&b.alias));
        list
    }

    /// Poll every armed schedule.
    pub fn collect_due(&self, now: Instant) -> Vec<(String, Vec<ScheduledAction>)> {
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        let mut due: Vec<(String, Vec<ScheduledAction>)> = instances
            .values_mut()
            .filter(|i| i.schedule.is_armed())
            .filter_map(|i| {
                let actions = i.schedule.poll(now);
                (!actions.is_empty()).then(|| (i.alias.clone(), actions))
            })
            .collect();
        due.sort_by(|a, b| a.0.cmp(&b.0));
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> ServerConfig {
        ServerConfig::new("/bin/true")
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = InstanceRegistry::new();
        registry.register("b", config(), false).unwrap();
        registry.register("a", config(), true).unwrap();

        assert_eq!(registry.aliases(), vec!["a", "b"]);
        let status = registry.with_instance("a", |i| i.status()).unwrap();
        assert_eq!(status, InstanceStatus::Stopped);
        assert!(matches!(
            registry.with_instance("zzz", |_| ()),
            Err(SupervisorError::AliasNotFound(alias)) if alias == "zzz"
        ));
    }

    #[test]
    fn test_register_rejects_duplicates_and_bad_config() {
        let registry = InstanceRegistry::new();
        registry.register("a", config(), false).unwrap();
        assert!(matches!(
            registry.register("a", config(), false),
            Err(SupervisorError::AliasExists(_))
        ));
        assert!(matches!(
            registry.register("bad alias", config(), false),
            Err(SupervisorError::Config(_))
        ));
        assert!(matches!(
            registry.register("c", ServerConfig::new(""), false),
            Err(SupervisorError::Config(_))
        ));
        assert!(!registry.contains("c"));
    }

    #[test]
    fn test_bad_pattern_still_registers() {
        let registry = InstanceRegistry::new();
        let mut cfg = config();
        cfg.console.player_chat = "(".into();
        registry.register("a", cfg, false).unwrap();
        assert!(registry.contains("a"));
    }

    #[test]
    fn test_collect_due_only_armed() {
        let registry = InstanceRegistry::new();
        registry.register("a", config(), false).unwrap();
        registry.register("b", config(), false).unwrap();

        let now = Instant::now();
        registry
            .with_instance("a", |i| i.schedule.arm(now, Duration::from_secs(10), &[5]))
            .unwrap();

        assert!(registry.collect_due(now).is_empty());
        let due = registry.collect_due(now + Duration::from_secs(11));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, "a");
        assert_eq!(due[0].1.len(), 2);

        let summaries = registry.summaries(now);
        assert_eq!(summaries[0].next_restart_secs, None);
    }

    #[test]
    fn test_remove() {
        let registry = InstanceRegistry::new();
        registry.register("a", config(), false).unwrap();
        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
        assert!(registry.aliases().is_empty());
    }
}
