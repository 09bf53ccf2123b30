//! OTA orchestrator: two sub-engines (broadcast-pull, targeted-push)
//! sharing the rule that at most one node-facing OTA job of either kind,
//! and at most one self-OTA, may be in flight at once.

pub mod blob;
pub mod broadcast;
pub mod push;
pub mod self_ota;

use crate::node::NodeMac;
use broadcast::BroadcastPullJob;
use push::PushOtaJob;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OtaError {
    #[error("a node-facing OTA job is already active")]
    AlreadyActive,
    #[error("no OTA job is active")]
    NotActive,
    #[error(transparent)]
    Broadcast(#[from] broadcast::BroadcastOtaError),
    #[error(transparent)]
    Push(#[from] push::PushOtaError),
}

/// Either kind of node-facing OTA job -- never both at once.
pub enum NodeOtaJob {
    BroadcastPull(BroadcastPullJob),
    TargetedPush(PushOtaJob),
}

/// Owns the exclusivity invariant: at most one `NodeOtaJob` at a time.
/// Self-OTA has its own independent slot (the self-OTA writer carries its
/// own `is_active` state and is not tracked here).
#[derive(Default)]
pub struct OtaOrchestrator {
    active: Option<NodeOtaJob>,
}

impl OtaOrchestrator {
    pub fn new() -> Self {
        OtaOrchestrator { active: None }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn start_broadcast_pull(&mut self, job: BroadcastPullJob) -> Result<(), OtaError> {
        if self.active.is_some() {
            return Err(OtaError::AlreadyActive);
        }
        self.active = Some(NodeOtaJob::BroadcastPull(job));
        Ok(())
    }

    pub fn start_targeted_push(&mut self, job: PushOtaJob) -> Result<(), OtaError> {
        if self.active.is_some() {
            return Err(OtaError::AlreadyActive);
        }
        self.active = Some(NodeOtaJob::TargetedPush(job));
        Ok(())
    }

    pub fn broadcast_mut(&mut self) -> Option<&mut BroadcastPullJob> {
        match &mut self.active {
            Some(NodeOtaJob::BroadcastPull(job)) => Some(job),
            _ => None,
        }
    }

    pub fn push_mut(&mut self) -> Option<&mut PushOtaJob> {
        match &mut self.active {
            Some(NodeOtaJob::TargetedPush(job)) => Some(job),
            _ => None,
        }
    }

    /// `OtaComplete`/`OtaFailed` are dispatched to both sub-engines by the
    /// mesh router; each must silently ignore MACs it does not own. This
    /// checks ownership before handing the event to whichever engine is
    /// active.
    pub fn owns_mac(&self, mac: &NodeMac) -> bool {
        match &self.active {
            Some(NodeOtaJob::BroadcastPull(job)) => job.participants.contains_key(mac),
            Some(NodeOtaJob::TargetedPush(job)) => &job.target == mac,
            None => false,
        }
    }

    pub fn finish(&mut self) {
        self.active = None;
    }

    pub fn abort(&mut self) {
        match &mut self.active {
            Some(NodeOtaJob::BroadcastPull(job)) => job.abort(),
            Some(NodeOtaJob::TargetedPush(job)) => job.fail(),
            None => {}
        }
        self.active = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::DeviceType;

    fn mac(b: u8) -> NodeMac {
        NodeMac([0, 0, 0, 0, 0, b])
    }

    fn push_job() -> PushOtaJob {
        PushOtaJob::new(mac(1), 180, 0, push::DEFAULT_RETRY_BUDGET)
    }

    fn broadcast_job() -> BroadcastPullJob {
        let inputs = broadcast::StartJobInputs {
            url: "http://x".into(),
            version: "1.0.0".into(),
            version_packed: 0x010000,
            sha256_hex: "0".repeat(64),
            total_size: 16,
            device_type: DeviceType::Relay,
            targets: vec![],
        };
        BroadcastPullJob::new(inputs, 0)
    }

    #[test]
    fn exclusivity_blocks_a_second_job_of_either_kind() {
        let mut orch = OtaOrchestrator::new();
        orch.start_broadcast_pull(broadcast_job()).unwrap();
        assert_eq!(
            orch.start_targeted_push(push_job()).unwrap_err(),
            OtaError::AlreadyActive
        );
        orch.finish();
        orch.start_targeted_push(push_job()).unwrap();
        assert_eq!(
            orch.start_broadcast_pull(broadcast_job()).unwrap_err(),
            OtaError::AlreadyActive
        );
    }

    #[test]
    fn owns_mac_ignores_macs_not_owned_by_the_active_engine() {
        let mut orch = OtaOrchestrator::new();
        orch.start_targeted_push(push_job()).unwrap();
        assert!(orch.owns_mac(&mac(1)));
        assert!(!orch.owns_mac(&mac(2)));
    }

    #[test]
    fn abort_clears_the_active_slot() {
        let mut orch = OtaOrchestrator::new();
        orch.start_targeted_push(push_job()).unwrap();
        orch.abort();
        assert!(!orch.is_active());
    }
}
