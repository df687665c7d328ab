use crate::config::SupervisorSettings;
use crate::events::{
    ChannelObserver, Observers, StatusChangeEvent, StatusObserver, SubscriptionId,
};
use crate::probe::{CommandResult, ObservedState, ServiceBackend, ServiceCommand};
use crate::registry::{RegistryError, ServiceDescriptor, ServiceRegistry};
use crate::status::{ServiceDetail, ServiceSnapshot, ServiceState, ServiceStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

// ---------------------------------------------------------------------------
// Control types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Start,
    Stop,
    Restart,
}

impl std::fmt::Display for ControlAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlAction::Start => write!(f, "start"),
            ControlAction::Stop => write!(f, "stop"),
            ControlAction::Restart => write!(f, "restart"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "reason", content = "service", rename_all = "snake_case")]
pub enum ControlRejection {
    #[error("a control operation is already in progress for `{0}`")]
    AlreadyInProgress(String),
    #[error("unknown service: {0}")]
    UnknownService(String),
    #[error("supervisor is shutting down")]
    ShuttingDown,
}

/// Immediate answer to a control request. The effect of an accepted
/// request is observed through status events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    Accepted,
    Rejected(ControlRejection),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "message", rename_all = "snake_case")]
pub enum ControlResult {
    Succeeded,
    AlreadyInDesiredState,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlReport {
    pub service_id: String,
    pub action: ControlAction,
    #[serde(flatten)]
    pub result: ControlResult,
    pub final_state: ServiceState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchEntry {
    Completed(ControlReport),
    Rejected {
        service_id: String,
        rejection: ControlRejection,
    },
}

impl BatchEntry {
    pub fn service_id(&self) -> &str {
        match self {
            BatchEntry::Completed(report) => &report.service_id,
            BatchEntry::Rejected { service_id, .. } => service_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub action: ControlAction,
    pub entries: Vec<BatchEntry>,
}

// ---------------------------------------------------------------------------
// Per-service slot
// ---------------------------------------------------------------------------

struct SlotState {
    status: ServiceStatus,
    /// In-flight flag; set and cleared only under the slot lock.
    busy: bool,
    /// Bumped whenever a control operation begins or ends, so a probe that
    /// straddled one is discarded.
    epoch: u64,
    unknown_streak: u32,
}

struct ServiceSlot {
    descriptor: Arc<ServiceDescriptor>,
    state: Mutex<SlotState>,
    /// Held across update-and-publish so events for one service keep order.
    transition: Mutex<()>,
}

impl ServiceSlot {
    fn new(descriptor: Arc<ServiceDescriptor>) -> Self {
        Self {
            descriptor,
            state: Mutex::new(SlotState {
                status: ServiceStatus::unknown(),
                busy: false,
                epoch: 0,
                unknown_streak: 0,
            }),
            transition: Mutex::new(()),
        }
    }

    fn snapshot(&self) -> ServiceSnapshot {
        let st = lock(&self.state);
        ServiceSnapshot {
            id: self.descriptor.id.clone(),
            display_name: self.descriptor.display_name.clone(),
            state: st.status.state,
            last_updated: st.status.last_updated,
            process: st.status.process.clone(),
        }
    }

    /// Epoch to probe under, or None while a control operation runs.
    fn idle_epoch(&self) -> Option<u64> {
        let st = lock(&self.state);
        (!st.busy).then_some(st.epoch)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// ControlOperation
// ---------------------------------------------------------------------------

/// Proof of the in-flight flag for one service. Dropping it clears the
/// flag, whatever path the operation took.
struct ControlOperation {
    inner: Arc<Inner>,
    slot: Arc<ServiceSlot>,
    action: ControlAction,
}

impl Drop for ControlOperation {
    fn drop(&mut self) {
        {
            let mut st = lock(&self.slot.state);
            st.busy = false;
            st.epoch += 1;
        }
        self.inner.in_flight.send_modify(|n| *n = n.saturating_sub(1));
        self.inner.wake.notify_one();
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct Inner {
    registry: Arc<ServiceRegistry>,
    backend: Arc<dyn ServiceBackend>,
    settings: SupervisorSettings,
    slots: HashMap<String, Arc<ServiceSlot>>,
    observers: Observers,
    in_flight: watch::Sender<usize>,
    shutdown: watch::Sender<bool>,
    wake: Notify,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

/// Owns the status of every registered service, reconciles it against the
/// OS, and serializes control operations per service.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        backend: Arc<dyn ServiceBackend>,
        settings: SupervisorSettings,
    ) -> Self {
        let slots = registry
            .all()
            .iter()
            .map(|d| (d.id.clone(), Arc::new(ServiceSlot::new(Arc::clone(d)))))
            .collect();
        let (in_flight, _) = watch::channel(0);
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                registry,
                backend,
                settings,
                slots,
                observers: Observers::new(),
                in_flight,
                shutdown,
                wake: Notify::new(),
                poll_task: Mutex::new(None),
            }),
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    // -- Observers --

    pub fn subscribe(&self, observer: Arc<dyn StatusObserver>) -> SubscriptionId {
        self.inner.observers.subscribe(observer)
    }

    pub fn subscribe_channel(
        &self,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<StatusChangeEvent>) {
        let (observer, rx) = ChannelObserver::new();
        (self.subscribe(Arc::new(observer)), rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.observers.unsubscribe(id)
    }

    // -- Queries --

    pub fn list_services(&self) -> Vec<ServiceSnapshot> {
        self.inner
            .registry
            .all()
            .iter()
            .filter_map(|d| self.inner.slots.get(&d.id))
            .map(|slot| slot.snapshot())
            .collect()
    }

    pub fn snapshot(&self, id: &str) -> Result<ServiceSnapshot, RegistryError> {
        Ok(self.slot(id)?.snapshot())
    }

    /// Current status plus a fresh process lookup for running services.
    pub async fn get_service_detail(&self, id: &str) -> Result<ServiceDetail, RegistryError> {
        let slot = Arc::clone(self.slot(id)?);
        let descriptor = &slot.descriptor;

        if slot.snapshot().state == ServiceState::Running {
            let metadata = tokio::time::timeout(
                self.inner.settings.probe_timeout(),
                self.inner.backend.process_metadata(descriptor),
            )
            .await
            .ok()
            .flatten();
            let mut st = lock(&slot.state);
            if st.status.state == ServiceState::Running {
                st.status.process = metadata;
            }
        }

        let snapshot = slot.snapshot();
        let process = snapshot.process.as_ref();
        Ok(ServiceDetail {
            id: descriptor.id.clone(),
            display_name: descriptor.display_name.clone(),
            service_name: descriptor.service_name.clone(),
            state: snapshot.state,
            last_updated: snapshot.last_updated,
            pid: process.map(|p| p.pid),
            memory_percent: process.map(|p| p.memory_percent),
            cpu_percent: process.map(|p| p.cpu_percent),
            ports: descriptor.ports.clone(),
        })
    }

    fn slot(&self, id: &str) -> Result<&Arc<ServiceSlot>, RegistryError> {
        self.inner
            .slots
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    // -- Reconciliation --

    /// Spawn the periodic reconciliation task. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut task = lock(&self.inner.poll_task);
        if task.is_some() || self.is_shutting_down() {
            return;
        }
        let this = self.clone();
        let shutdown_rx = self.inner.shutdown.subscribe();
        *task = Some(tokio::spawn(this.run_loop(shutdown_rx)));
    }

    /// Wake the reconciliation task now instead of at the next interval.
    pub fn reconcile_now(&self) {
        self.inner.wake.notify_one();
    }

    async fn run_loop(self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!(
            services = self.inner.registry.len(),
            interval_ms = self.inner.settings.poll_interval_ms,
            "supervisor started"
        );

        let mut interval = tokio::time::interval(self.inner.settings.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.inner.wake.notified() => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
            if *shutdown_rx.borrow() {
                break;
            }
            self.reconcile_once().await;
        }

        tracing::debug!("reconciliation loop exited");
    }

    /// Probe every service concurrently and publish changes as they land.
    pub async fn reconcile_once(&self) {
        let mut tasks = JoinSet::new();
        for descriptor in self.inner.registry.all() {
            let Some(slot) = self.inner.slots.get(&descriptor.id) else {
                continue;
            };
            let this = self.clone();
            let slot = Arc::clone(slot);
            tasks.spawn(async move { this.reconcile_service(&slot).await });
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "reconcile task failed");
            }
        }
    }

    async fn reconcile_service(&self, slot: &ServiceSlot) {
        let Some(epoch) = slot.idle_epoch() else {
            return;
        };

        let observed = self.probe(&slot.descriptor).await;
        self.apply_observation(slot, observed, epoch);

        if slot.descriptor.process_name.is_none() {
            return;
        }
        if slot.snapshot().state != ServiceState::Running {
            return;
        }
        let metadata = tokio::time::timeout(
            self.inner.settings.probe_timeout(),
            self.inner.backend.process_metadata(&slot.descriptor),
        )
        .await
        .ok()
        .flatten();

        let mut st = lock(&slot.state);
        if st.epoch == epoch && !st.busy && st.status.state == ServiceState::Running {
            st.status.process = metadata;
        }
    }

    /// Fold a probe result into the stored state. An inconclusive probe only
    /// surfaces as Unknown after `unknown_threshold` in a row.
    fn apply_observation(&self, slot: &ServiceSlot, observed: ObservedState, epoch: u64) {
        let _order = lock(&slot.transition);
        let event = {
            let mut st = lock(&slot.state);
            if st.busy || st.epoch != epoch {
                return;
            }

            let next = match observed {
                ObservedState::Running | ObservedState::Stopped => {
                    st.unknown_streak = 0;
                    ServiceState::from(observed)
                }
                ObservedState::Unknown => {
                    st.unknown_streak = st.unknown_streak.saturating_add(1);
                    if st.status.state == ServiceState::Unknown
                        || st.unknown_streak < self.inner.settings.unknown_threshold.max(1)
                    {
                        return;
                    }
                    ServiceState::Unknown
                }
            };
            st.status.last_updated = Utc::now();
            Self::transition(&slot.descriptor.id, &mut st, next)
        };

        if let Some(event) = event {
            self.inner.observers.publish(&event);
        }
    }

    /// Unconditional state change for control operations.
    fn set_state(&self, slot: &ServiceSlot, next: ServiceState) {
        let _order = lock(&slot.transition);
        let event = {
            let mut st = lock(&slot.state);
            st.unknown_streak = 0;
            st.status.last_updated = Utc::now();
            Self::transition(&slot.descriptor.id, &mut st, next)
        };

        if let Some(event) = event {
            self.inner.observers.publish(&event);
        }
    }

    fn transition(id: &str, st: &mut SlotState, next: ServiceState) -> Option<StatusChangeEvent> {
        let previous = st.status.state;
        if next != ServiceState::Running {
            st.status.process = None;
        }
        if previous == next {
            return None;
        }
        st.status.state = next;
        tracing::info!(service = %id, from = %previous, to = %next, "status changed");
        Some(StatusChangeEvent {
            service_id: id.to_string(),
            previous,
            current: next,
            timestamp: st.status.last_updated,
        })
    }

    async fn probe(&self, descriptor: &ServiceDescriptor) -> ObservedState {
        let timeout = self.inner.settings.probe_timeout();
        match tokio::time::timeout(timeout, self.inner.backend.probe(descriptor)).await {
            Ok(state) => state,
            Err(_) => {
                tracing::warn!(service = %descriptor.id, ?timeout, "probe timed out");
                ObservedState::Unknown
            }
        }
    }

    // -- Control --

    /// Check-and-set the in-flight flag. The returned operation clears it on
    /// drop.
    fn begin(&self, id: &str, action: ControlAction) -> Result<ControlOperation, ControlRejection> {
        let slot = self
            .inner
            .slots
            .get(id)
            .ok_or_else(|| ControlRejection::UnknownService(id.to_string()))?;

        {
            let mut st = lock(&slot.state);
            if st.busy {
                return Err(ControlRejection::AlreadyInProgress(id.to_string()));
            }
            st.busy = true;
            st.epoch += 1;
        }
        self.inner.in_flight.send_modify(|n| *n += 1);

        let operation = ControlOperation {
            inner: Arc::clone(&self.inner),
            slot: Arc::clone(slot),
            action,
        };

        // Checked after registering so stop() cannot miss this operation.
        if self.is_shutting_down() {
            return Err(ControlRejection::ShuttingDown);
        }
        Ok(operation)
    }

    /// Fire-and-forget control of one service.
    pub fn control(&self, id: &str, action: ControlAction) -> ControlOutcome {
        match self.begin(id, action) {
            Ok(operation) => {
                self.spawn_run(operation);
                ControlOutcome::Accepted
            }
            Err(rejection) => {
                tracing::debug!(service = %id, %action, %rejection, "control rejected");
                ControlOutcome::Rejected(rejection)
            }
        }
    }

    /// Control one service and wait for the operation to finish. Dropping
    /// the returned future does not cancel the operation; the service stays
    /// in flight until its command completes.
    pub async fn control_and_wait(
        &self,
        id: &str,
        action: ControlAction,
    ) -> Result<ControlReport, ControlRejection> {
        let operation = self.begin(id, action).inspect_err(|rejection| {
            tracing::debug!(service = %id, %action, %rejection, "control rejected");
        })?;
        let slot = Arc::clone(&operation.slot);

        match self.spawn_run(operation).await {
            Ok(report) => Ok(report),
            Err(e) => Ok(self.aborted(&slot, action, &e)),
        }
    }

    /// The spawned task owns the operation, so the in-flight flag outlives
    /// any caller waiting on it.
    fn spawn_run(&self, operation: ControlOperation) -> JoinHandle<ControlReport> {
        let this = self.clone();
        tokio::spawn(async move { this.run(operation).await })
    }

    /// Executes on a nested task so a panic still leaves the service in a
    /// settled state before the flag is released.
    async fn run(&self, operation: ControlOperation) -> ControlReport {
        let slot = Arc::clone(&operation.slot);
        let action = operation.action;

        let this = self.clone();
        let task_slot = Arc::clone(&slot);
        let handle = tokio::spawn(async move { this.execute(&task_slot, action).await });

        let report = match handle.await {
            Ok(report) => report,
            Err(e) => self.aborted(&slot, action, &e),
        };

        drop(operation);
        report
    }

    fn aborted(
        &self,
        slot: &ServiceSlot,
        action: ControlAction,
        error: &tokio::task::JoinError,
    ) -> ControlReport {
        let id = &slot.descriptor.id;
        tracing::error!(service = %id, %action, %error, "control task aborted");
        self.set_state(slot, ServiceState::Error);
        ControlReport {
            service_id: id.clone(),
            action,
            result: ControlResult::Failed(format!("control task aborted: {error}")),
            final_state: ServiceState::Error,
        }
    }

    async fn execute(&self, slot: &ServiceSlot, action: ControlAction) -> ControlReport {
        let descriptor = &slot.descriptor;
        let (result, final_state) = match action {
            ControlAction::Start | ControlAction::Stop => {
                let command = if action == ControlAction::Start {
                    ServiceCommand::Start
                } else {
                    ServiceCommand::Stop
                };
                let target = command.target();
                if self.probe(descriptor).await == target {
                    tracing::info!(service = %descriptor.id, %action, "already in desired state");
                    let state = ServiceState::from(target);
                    self.set_state(slot, state);
                    (ControlResult::AlreadyInDesiredState, state)
                } else {
                    self.set_state(slot, ServiceState::Pending);
                    self.drive(slot, command).await
                }
            }
            ControlAction::Restart => {
                // No atomic restart in the OS service manager: stop, settle, start.
                self.set_state(slot, ServiceState::Pending);
                let (stop_result, _) = self.drive(slot, ServiceCommand::Stop).await;
                if let ControlResult::Failed(ref message) = stop_result {
                    tracing::warn!(
                        service = %descriptor.id,
                        %message,
                        "stop during restart failed"
                    );
                }
                tokio::time::sleep(self.inner.settings.restart_settle()).await;
                self.set_state(slot, ServiceState::Pending);
                match self.drive(slot, ServiceCommand::Start).await {
                    (ControlResult::AlreadyInDesiredState, state) => {
                        (ControlResult::Succeeded, state)
                    }
                    other => other,
                }
            }
        };

        ControlReport {
            service_id: descriptor.id.clone(),
            action,
            result,
            final_state,
        }
    }

    /// Invoke one OS command and settle the stored state. A failed exit is
    /// never trusted on its own: the service is re-probed for ground truth.
    async fn drive(
        &self,
        slot: &ServiceSlot,
        command: ServiceCommand,
    ) -> (ControlResult, ServiceState) {
        let descriptor = &slot.descriptor;
        let timeout = self.inner.settings.command_timeout();
        let outcome = tokio::time::timeout(timeout, self.inner.backend.execute(descriptor, command))
            .await
            .unwrap_or_else(|_| {
                CommandResult::Failed(format!("{command} timed out after {timeout:?}"))
            });

        let target = ServiceState::from(command.target());
        match outcome {
            CommandResult::Succeeded => {
                self.set_state(slot, target);
                (ControlResult::Succeeded, target)
            }
            CommandResult::AlreadyInDesiredState => {
                self.set_state(slot, target);
                (ControlResult::AlreadyInDesiredState, target)
            }
            CommandResult::Failed(message) => {
                tracing::warn!(service = %descriptor.id, %command, %message, "command failed");
                let state = match self.probe(descriptor).await {
                    ObservedState::Unknown => ServiceState::Error,
                    observed => ServiceState::from(observed),
                };
                self.set_state(slot, state);
                if state == target {
                    tracing::info!(
                        service = %descriptor.id,
                        %command,
                        "command reported failure but service reached target state"
                    );
                    (ControlResult::Succeeded, state)
                } else {
                    (ControlResult::Failed(message), state)
                }
            }
        }
    }

    // -- Batch control --

    fn stagger(&self, action: ControlAction) -> Duration {
        let settings = &self.inner.settings;
        Duration::from_millis(match action {
            ControlAction::Start => settings.start_stagger_ms,
            ControlAction::Stop => settings.stop_stagger_ms,
            ControlAction::Restart => settings.restart_stagger_ms,
        })
    }

    /// Fire-and-forget batch control of every registered service.
    pub fn control_all(&self, action: ControlAction) -> JoinHandle<BatchReport> {
        let this = self.clone();
        tokio::spawn(async move { this.control_all_and_wait(action).await })
    }

    /// Control every service in registry order, one after another. A failure
    /// on one service never aborts the batch.
    pub async fn control_all_and_wait(&self, action: ControlAction) -> BatchReport {
        let stagger = self.stagger(action);
        let mut entries = Vec::with_capacity(self.inner.registry.len());

        for (i, descriptor) in self.inner.registry.all().iter().enumerate() {
            if i > 0 && !stagger.is_zero() && !self.is_shutting_down() {
                tokio::time::sleep(stagger).await;
            }

            let entry = match self.control_and_wait(&descriptor.id, action).await {
                Ok(report) => BatchEntry::Completed(report),
                Err(rejection) => BatchEntry::Rejected {
                    service_id: descriptor.id.clone(),
                    rejection,
                },
            };
            entries.push(entry);
        }

        BatchReport { action, entries }
    }

    // -- Shutdown --

    /// Halt reconciliation, reject new control requests and wait (bounded)
    /// for in-flight operations. Returns false if the wait timed out.
    pub async fn stop(&self) -> bool {
        self.inner.shutdown.send_replace(true);

        let task = lock(&self.inner.poll_task).take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::warn!(error = %e, "reconciliation task ended abnormally");
        }

        let mut in_flight = self.inner.in_flight.subscribe();
        let timeout = self.inner.settings.shutdown_timeout();
        let drained = tokio::time::timeout(timeout, async move {
            in_flight.wait_for(|n| *n == 0).await.is_ok()
        })
        .await
        .unwrap_or(false);

        if drained {
            tracing::info!("supervisor stopped");
        } else {
            tracing::warn!(?timeout, "timed out waiting for in-flight control operations");
        }
        drained
    }
}
