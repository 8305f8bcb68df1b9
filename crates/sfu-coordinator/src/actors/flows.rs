//! Per-room flow list and consumption records.
//!
//! Owned by the `RoomActor`; never shared. Flows keep publication order so
//! `existingFlows` and `consume` iterate oldest first.

use super::messages::FlowRecord;
use crate::errors::SfuError;
use crate::signaling::FlowInfo;
use common::types::{FlowId, PeerId};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct FlowRegistry {
    flows: Vec<FlowRecord>,
    /// Flow → peers holding a consumer of it. At most one record per pair.
    consumers: HashMap<FlowId, HashSet<PeerId>>,
}

impl FlowRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a flow.
    ///
    /// # Errors
    ///
    /// `SfuError::Conflict` if a flow with the same id is already published.
    pub fn insert(&mut self, record: FlowRecord) -> Result<(), SfuError> {
        if self.contains(&record.flow_id) {
            return Err(SfuError::Conflict("Flow already published".to_string()));
        }
        self.flows.push(record);
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, flow_id: &FlowId) -> bool {
        self.flows.iter().any(|f| &f.flow_id == flow_id)
    }

    #[must_use]
    pub fn get(&self, flow_id: &FlowId) -> Option<&FlowRecord> {
        self.flows.iter().find(|f| &f.flow_id == flow_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Every published flow, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<FlowInfo> {
        self.flows.iter().map(FlowRecord::info).collect()
    }

    /// Flows `peer` does not own and does not already consume.
    #[must_use]
    pub fn consumable_by(&self, peer: PeerId) -> Vec<FlowInfo> {
        self.flows
            .iter()
            .filter(|f| f.owner != peer && !self.is_consuming(peer, &f.flow_id))
            .map(FlowRecord::info)
            .collect()
    }

    #[must_use]
    pub fn is_consuming(&self, peer: PeerId, flow_id: &FlowId) -> bool {
        self.consumers
            .get(flow_id)
            .is_some_and(|peers| peers.contains(&peer))
    }

    /// Record that `peer` consumes `flow_id`.
    ///
    /// Returns `Ok(false)` when the record already exists.
    ///
    /// # Errors
    ///
    /// - `SfuError::FlowNotFound` if the flow is no longer published
    /// - `SfuError::Conflict` if `peer` owns the flow
    pub fn record_consumer(&mut self, peer: PeerId, flow_id: &FlowId) -> Result<bool, SfuError> {
        let owner = self
            .get(flow_id)
            .map(|f| f.owner)
            .ok_or_else(|| SfuError::FlowNotFound(flow_id.to_string()))?;
        if owner == peer {
            return Err(SfuError::Conflict("Cannot consume own flow".to_string()));
        }
        Ok(self
            .consumers
            .entry(flow_id.clone())
            .or_default()
            .insert(peer))
    }

    /// Drop every consumption record held by `peer`.
    pub fn forget_consumer(&mut self, peer: PeerId) -> usize {
        let mut forgotten = 0;
        self.consumers.retain(|_, peers| {
            if peers.remove(&peer) {
                forgotten += 1;
            }
            !peers.is_empty()
        });
        forgotten
    }

    /// Unpublish every flow owned by `owner`, with their consumption records.
    pub fn remove_owned_by(&mut self, owner: PeerId) -> Vec<FlowRecord> {
        let (removed, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.flows)
                .into_iter()
                .partition(|f| f.owner == owner);
        self.flows = kept;
        for record in &removed {
            self.consumers.remove(&record.flow_id);
        }
        removed
    }

    /// Unpublish everything.
    pub fn drain(&mut self) -> Vec<FlowRecord> {
        self.consumers.clear();
        std::mem::take(&mut self.flows)
    }

    /// Total consumption records.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.values().map(HashSet::len).sum()
    }
}
