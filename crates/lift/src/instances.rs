use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::content::WorldTemplateId;
use crate::types::{ConnectionId, InstanceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Requested,
    Loaded,
    Active,
    Unloaded,
}

/// Opaque handle to a materialized world instance. Only the loader that
/// produced it interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceHandle {
    pub instance_id: InstanceId,
    pub template: WorldTemplateId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded(InstanceHandle),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadCompletion {
    pub instance_id: InstanceId,
    pub outcome: LoadOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("world template {0} is not registered")]
    UnknownTemplate(WorldTemplateId),
    #[error("instance {0} already has a load in flight or loaded")]
    AlreadyRequested(InstanceId),
}

/// Materializes world instances additively. A request either fails at once
/// (invalid template) or later yields exactly one completion from
/// `poll_completions`.
pub trait WorldLoader {
    fn request_load(
        &mut self,
        instance_id: InstanceId,
        template: WorldTemplateId,
    ) -> Result<(), LoadError>;
    fn poll_completions(&mut self, out: &mut Vec<LoadCompletion>);
    fn request_unload(&mut self, handle: InstanceHandle);
}

#[derive(Debug)]
struct InFlightLoad {
    instance_id: InstanceId,
    template: WorldTemplateId,
    polls_left: u32,
    fail: bool,
}

/// In-process loader. Every template in the catalog may be loaded any
/// number of times concurrently; each load completes after `latency_polls`
/// calls to `poll_completions`.
#[derive(Debug)]
pub struct SimulatedWorldLoader {
    world_count: usize,
    latency_polls: u32,
    in_flight: Vec<InFlightLoad>,
    loaded: BTreeMap<InstanceId, WorldTemplateId>,
    failing_templates: BTreeSet<WorldTemplateId>,
    fail_next_loads: usize,
}

impl SimulatedWorldLoader {
    pub fn new(world_count: usize, latency_polls: u32) -> Self {
        Self {
            world_count,
            latency_polls,
            in_flight: Vec::new(),
            loaded: BTreeMap::new(),
            failing_templates: BTreeSet::new(),
            fail_next_loads: 0,
        }
    }

    /// The next `count` accepted requests complete with `Failed`.
    pub fn fail_next_loads(&mut self, count: usize) {
        self.fail_next_loads = self.fail_next_loads.saturating_add(count);
    }

    pub fn fail_template(&mut self, template: WorldTemplateId) {
        self.failing_templates.insert(template);
    }

    pub fn is_loaded(&self, instance_id: InstanceId) -> bool {
        self.loaded.contains_key(&instance_id)
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

impl WorldLoader for SimulatedWorldLoader {
    fn request_load(
        &mut self,
        instance_id: InstanceId,
        template: WorldTemplateId,
    ) -> Result<(), LoadError> {
        if template.0 as usize >= self.world_count {
            return Err(LoadError::UnknownTemplate(template));
        }
        if self.loaded.contains_key(&instance_id)
            || self
                .in_flight
                .iter()
                .any(|load| load.instance_id == instance_id)
        {
            return Err(LoadError::AlreadyRequested(instance_id));
        }
        let fail = if self.fail_next_loads > 0 {
            self.fail_next_loads -= 1;
            true
        } else {
            self.failing_templates.contains(&template)
        };
        self.in_flight.push(InFlightLoad {
            instance_id,
            template,
            polls_left: self.latency_polls,
            fail,
        });
        Ok(())
    }

    fn poll_completions(&mut self, out: &mut Vec<LoadCompletion>) {
        let mut still_loading = Vec::with_capacity(self.in_flight.len());
        for mut load in self.in_flight.drain(..) {
            if load.polls_left > 0 {
                load.polls_left -= 1;
                still_loading.push(load);
                continue;
            }
            let outcome = if load.fail {
                LoadOutcome::Failed(format!(
                    "simulated load failure for template {}",
                    load.template
                ))
            } else {
                self.loaded.insert(load.instance_id, load.template);
                LoadOutcome::Loaded(InstanceHandle {
                    instance_id: load.instance_id,
                    template: load.template,
                })
            };
            out.push(LoadCompletion {
                instance_id: load.instance_id,
                outcome,
            });
        }
        self.in_flight = still_loading;
    }

    fn request_unload(&mut self, handle: InstanceHandle) {
        self.in_flight
            .retain(|load| load.instance_id != handle.instance_id);
        if self.loaded.remove(&handle.instance_id).is_some() {
            debug!(instance_id = %handle.instance_id, "simulated_instance_unloaded");
        }
    }
}

#[derive(Debug)]
struct InstanceRecord {
    template: WorldTemplateId,
    state: InstanceState,
    handle: Option<InstanceHandle>,
    occupants: BTreeSet<ConnectionId>,
    unload_at: Option<Duration>,
}

/// Authority-side registry of world instances: lifecycle state, committed
/// occupants and scheduled unloads.
#[derive(Debug, Default)]
pub struct WorldInstances {
    records: BTreeMap<InstanceId, InstanceRecord>,
}

impl WorldInstances {
    pub fn insert_requested(&mut self, instance_id: InstanceId, template: WorldTemplateId) {
        self.records.insert(
            instance_id,
            InstanceRecord {
                template,
                state: InstanceState::Requested,
                handle: None,
                occupants: BTreeSet::new(),
                unload_at: None,
            },
        );
    }

    pub fn mark_loaded(&mut self, handle: InstanceHandle) -> bool {
        let Some(record) = self.records.get_mut(&handle.instance_id) else {
            return false;
        };
        if record.state != InstanceState::Requested {
            return false;
        }
        record.state = InstanceState::Loaded;
        record.handle = Some(handle);
        true
    }

    /// Marks an instance that never loaded as gone.
    pub fn mark_failed(&mut self, instance_id: InstanceId) {
        if let Some(record) = self.records.get_mut(&instance_id) {
            record.state = InstanceState::Unloaded;
            record.handle = None;
            record.unload_at = None;
        }
    }

    pub fn state(&self, instance_id: InstanceId) -> Option<InstanceState> {
        self.records.get(&instance_id).map(|record| record.state)
    }

    pub fn template(&self, instance_id: InstanceId) -> Option<WorldTemplateId> {
        self.records.get(&instance_id).map(|record| record.template)
    }

    pub fn add_occupant(&mut self, instance_id: InstanceId, connection: ConnectionId) {
        if let Some(record) = self.records.get_mut(&instance_id) {
            if matches!(record.state, InstanceState::Loaded | InstanceState::Active) {
                record.state = InstanceState::Active;
                record.occupants.insert(connection);
                record.unload_at = None;
            }
        }
    }

    /// Removes `connection` from whichever instance it occupies and returns
    /// that instance with its remaining occupant count.
    pub fn remove_occupant(&mut self, connection: ConnectionId) -> Option<(InstanceId, usize)> {
        self.records.iter_mut().find_map(|(id, record)| {
            record
                .occupants
                .remove(&connection)
                .then(|| (*id, record.occupants.len()))
        })
    }

    pub fn instance_of(&self, connection: ConnectionId) -> Option<InstanceId> {
        self.records
            .iter()
            .find(|(_, record)| record.occupants.contains(&connection))
            .map(|(id, _)| *id)
    }

    pub fn occupant_count(&self, instance_id: InstanceId) -> usize {
        self.records
            .get(&instance_id)
            .map_or(0, |record| record.occupants.len())
    }

    pub fn schedule_unload(&mut self, instance_id: InstanceId, at: Duration) {
        if let Some(record) = self.records.get_mut(&instance_id) {
            if record.handle.is_some() && record.unload_at.is_none() {
                debug!(
                    instance_id = %instance_id,
                    at_ms = at.as_millis() as u64,
                    "instance_unload_scheduled"
                );
                record.unload_at = Some(at);
            }
        }
    }

    /// Transitions the instance to `Unloaded` and returns the handle to pass
    /// to the loader, if it was loaded.
    pub fn unload_now(&mut self, instance_id: InstanceId) -> Option<InstanceHandle> {
        let record = self.records.get_mut(&instance_id)?;
        let handle = record.handle.take()?;
        record.state = InstanceState::Unloaded;
        record.occupants.clear();
        record.unload_at = None;
        info!(instance_id = %instance_id, "instance_unloaded");
        Some(handle)
    }

    pub fn take_due_unloads(&mut self, now: Duration) -> Vec<InstanceHandle> {
        let due = self
            .records
            .iter()
            .filter(|(_, record)| record.unload_at.is_some_and(|at| at <= now))
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        due.into_iter()
            .filter_map(|instance_id| self.unload_now(instance_id))
            .collect()
    }

    /// Instances that are requested, loaded or active.
    pub fn live_count(&self) -> usize {
        self.records
            .values()
            .filter(|record| record.state != InstanceState::Unloaded)
            .count()
    }

    /// Forgets unloaded records. Returns how many were dropped.
    pub fn prune_unloaded(&mut self) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, record| record.state != InstanceState::Unloaded);
        before - self.records.len()
    }
}
