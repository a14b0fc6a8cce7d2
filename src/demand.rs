use crate::node::{NodeId, ServiceName};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::{BTreeSet, HashMap};

/// Per-name demand statistics accumulated at an active replica and shipped to
/// a reconfigurator inside DemandReport. The wire form is the fixed-width
/// request count; the name travels in the enclosing message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DemandProfile {
    pub service_name: ServiceName,
    pub request_count: u64,
}

impl DemandProfile {
    pub fn new(service_name: ServiceName) -> Self {
        DemandProfile {
            service_name,
            request_count: 0,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u64(self.request_count);
        buf.freeze()
    }

    pub fn decode(service_name: ServiceName, mut blob: Bytes) -> Self {
        let request_count = if blob.len() >= 8 { blob.get_u64() } else { 0 };
        DemandProfile {
            service_name,
            request_count,
        }
    }
}

/// DemandPolicy decides when accumulated demand is worth reporting and
/// whether reported demand warrants a placement change. Advisory only: no
/// policy decision is required for protocol correctness.
pub trait DemandPolicy: Send + Sync + 'static {
    fn register(&self, profile: &mut DemandProfile, sender: Option<&NodeId>);

    fn should_report(&self, profile: &DemandProfile) -> bool;

    fn combine(&self, into: &mut DemandProfile, other: &DemandProfile);

    /// A replacement group, or None to leave placement alone.
    fn should_reconfigure(
        &self,
        profile: &DemandProfile,
        current_actives: &BTreeSet<NodeId>,
    ) -> Option<BTreeSet<NodeId>>;
}

/// The null policy: never reports, never reconfigures. Keeping this the
/// default makes demand reporting strictly opt-in.
pub struct NullDemandPolicy;

impl DemandPolicy for NullDemandPolicy {
    fn register(&self, _profile: &mut DemandProfile, _sender: Option<&NodeId>) {}

    fn should_report(&self, _profile: &DemandProfile) -> bool {
        false
    }

    fn combine(&self, _into: &mut DemandProfile, _other: &DemandProfile) {}

    fn should_reconfigure(
        &self,
        _profile: &DemandProfile,
        _current_actives: &BTreeSet<NodeId>,
    ) -> Option<BTreeSet<NodeId>> {
        None
    }
}

/// Counts requests and reports every `report_every` of them. Leaves
/// placement decisions to the reconfigurator's side of the policy.
pub struct RequestCountPolicy {
    pub report_every: u64,
}

impl DemandPolicy for RequestCountPolicy {
    fn register(&self, profile: &mut DemandProfile, _sender: Option<&NodeId>) {
        profile.request_count += 1;
    }

    fn should_report(&self, profile: &DemandProfile) -> bool {
        profile.request_count > 0 && profile.request_count % self.report_every == 0
    }

    fn combine(&self, into: &mut DemandProfile, other: &DemandProfile) {
        into.request_count += other.request_count;
    }

    fn should_reconfigure(
        &self,
        _profile: &DemandProfile,
        _current_actives: &BTreeSet<NodeId>,
    ) -> Option<BTreeSet<NodeId>> {
        None
    }
}

/// AggregateDemandProfiler owns the per-name profiles on one node. The
/// active replica feeds it every application request; profiles that crossed
/// the report threshold are plucked (taken and reset) for shipping, and
/// `trim` discards the long tail that never crossed it.
pub struct AggregateDemandProfiler {
    policy: std::sync::Arc<dyn DemandPolicy>,
    profiles: HashMap<ServiceName, DemandProfile>,
}

impl AggregateDemandProfiler {
    pub fn new(policy: std::sync::Arc<dyn DemandPolicy>) -> Self {
        AggregateDemandProfiler {
            policy,
            profiles: HashMap::new(),
        }
    }

    /// Registers one request and says whether the name's profile is now
    /// worth reporting.
    pub fn register(&mut self, service_name: &ServiceName, sender: Option<&NodeId>) -> bool {
        let profile = self
            .profiles
            .entry(service_name.clone())
            .or_insert_with(|| DemandProfile::new(service_name.clone()));
        self.policy.register(profile, sender);
        self.policy.should_report(profile)
    }

    /// Takes the profile for shipping, leaving a fresh one behind.
    pub fn pluck(&mut self, service_name: &ServiceName) -> Option<DemandProfile> {
        self.profiles
            .insert(service_name.clone(), DemandProfile::new(service_name.clone()))
    }

    /// Merges a received profile (reconfigurator side).
    pub fn combine(&mut self, received: DemandProfile) -> &DemandProfile {
        let profile = self
            .profiles
            .entry(received.service_name.clone())
            .or_insert_with(|| DemandProfile::new(received.service_name.clone()));
        self.policy.combine(profile, &received);
        profile
    }

    /// Discards profiles that never reached the report threshold.
    pub fn trim(&mut self) {
        let policy = self.policy.clone();
        self.profiles.retain(|_, profile| policy.should_report(profile));
    }

    pub fn should_reconfigure(
        &self,
        service_name: &ServiceName,
        current_actives: &BTreeSet<NodeId>,
    ) -> Option<BTreeSet<NodeId>> {
        let profile = self.profiles.get(service_name)?;
        self.policy.should_reconfigure(profile, current_actives)
    }
}
