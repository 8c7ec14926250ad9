//! Registry of running reflection loops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};

use super::controller::{ReflectionController, ReflectionHandle, ReflectionRequest};
use crate::config::ReflectionConfig;
use crate::models::reflection::{ReflectionState, ReflectionSummary};
use crate::session::SessionCoordinator;
use crate::{AppError, Result};

struct GroupEntry {
    handle: ReflectionHandle,
    task: Option<JoinHandle<ReflectionSummary>>,
}

/// Starts, controls, and reports on orchestration groups.
#[derive(Clone)]
pub struct ReflectionGroups {
    coordinator: Arc<SessionCoordinator>,
    config: ReflectionConfig,
    groups: Arc<Mutex<HashMap<String, GroupEntry>>>,
}

impl ReflectionGroups {
    /// Create an empty registry.
    #[must_use]
    pub fn new(coordinator: Arc<SessionCoordinator>, config: ReflectionConfig) -> Self {
        Self {
            coordinator,
            config,
            groups: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn a driver loop for `request` and return its group identifier.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Propagates validation errors from [`ReflectionController::new`], and
    /// returns `AppError::Busy` if any named session already belongs to an
    /// active group.
    pub fn start_reflection(&self, request: ReflectionRequest) -> Result<String> {
        let mut groups = self.lock();
        for (group_id, entry) in groups.iter() {
            if entry.handle.state().phase.is_terminal() {
                continue;
            }
            if let Some(session) = shared_member(&request, &entry.handle) {
                return Err(AppError::Busy(format!(
                    "session {session} is already in reflection group {group_id}"
                )));
            }
        }

        let members = request.members();
        let (controller, handle) =
            ReflectionController::new(Arc::clone(&self.coordinator), request, self.config.clone())?;
        let group_id = handle.group_id().to_owned();
        let task = tokio::spawn(controller.run().in_current_span());
        info!(%group_id, ?members, "reflection group started");

        groups.insert(
            group_id.clone(),
            GroupEntry {
                handle,
                task: Some(task),
            },
        );
        Ok(group_id)
    }

    /// Freeze a loop at its next phase boundary.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown group.
    pub fn pause_reflection(&self, group_id: &str) -> Result<()> {
        self.with_handle(group_id, ReflectionHandle::pause)?;
        info!(group_id, "reflection pause requested");
        Ok(())
    }

    /// Let a paused loop continue.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown group.
    pub fn resume_reflection(&self, group_id: &str) -> Result<()> {
        self.with_handle(group_id, ReflectionHandle::resume)?;
        info!(group_id, "reflection resume requested");
        Ok(())
    }

    /// Stop a loop at its next phase boundary. The loop finishes with
    /// outcome `Cancelled`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown group.
    pub fn stop_reflection(&self, group_id: &str) -> Result<()> {
        self.with_handle(group_id, ReflectionHandle::stop)?;
        info!(group_id, "reflection stop requested");
        Ok(())
    }

    /// Latest published state of a group.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown group.
    pub fn reflection_state(&self, group_id: &str) -> Result<ReflectionState> {
        self.with_handle(group_id, ReflectionHandle::state)
    }

    /// Identifiers of every known group, finished ones included.
    #[must_use]
    pub fn group_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Wait for a group's loop to finish and return its summary.
    ///
    /// Only the first caller receives the summary; later calls see
    /// `AppError::NotFound`. The final state stays readable through
    /// [`reflection_state`](Self::reflection_state) until the group is
    /// released with [`forget_reflection`](Self::forget_reflection).
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown or already awaited group,
    /// or `AppError::Orchestration` if the driver task panicked.
    pub async fn await_reflection(&self, group_id: &str) -> Result<ReflectionSummary> {
        let task = self
            .lock()
            .get_mut(group_id)
            .and_then(|entry| entry.task.take())
            .ok_or_else(|| AppError::NotFound(format!("reflection group {group_id}")))?;

        task.await.map_err(|err| {
            warn!(group_id, %err, "reflection driver task failed");
            AppError::Orchestration(format!("reflection driver failed: {err}"))
        })
    }

    /// Drop a finished group from the registry and return its final state.
    ///
    /// An un-awaited summary is discarded with it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown group, or `AppError::Busy`
    /// while the loop is still running.
    pub fn forget_reflection(&self, group_id: &str) -> Result<ReflectionState> {
        let mut groups = self.lock();
        let state = groups
            .get(group_id)
            .map(|entry| entry.handle.state())
            .ok_or_else(|| AppError::NotFound(format!("reflection group {group_id}")))?;
        if !state.phase.is_terminal() {
            return Err(AppError::Busy(format!(
                "reflection group {group_id} is still running"
            )));
        }
        groups.remove(group_id);
        info!(group_id, "reflection group forgotten");
        Ok(state)
    }

    fn with_handle<T>(&self, group_id: &str, f: impl FnOnce(&ReflectionHandle) -> T) -> Result<T> {
        self.lock()
            .get(group_id)
            .map(|entry| f(&entry.handle))
            .ok_or_else(|| AppError::NotFound(format!("reflection group {group_id}")))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, GroupEntry>> {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn shared_member(request: &ReflectionRequest, running: &ReflectionHandle) -> Option<String> {
    request
        .members()
        .into_iter()
        .find(|session| running.members().contains(session))
}

impl std::fmt::Debug for ReflectionGroups {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReflectionGroups")
            .field("groups", &self.group_ids())
            .finish_non_exhaustive()
    }
}
