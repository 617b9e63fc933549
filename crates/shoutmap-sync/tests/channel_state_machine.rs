//! Stateful property testing for the channel registry.
//!
//! Random interleavings of lease acquisition, subscription and release
//! across a few channel names. The model tracks, per name:
//!
//! - live lease count (the channel exists while it is non-zero)
//! - whether the current channel has joined the backend topic
//! - which live lease, if any, holds the duty to subscribe
//!
//! and per lease whether it was released and whether it was told to
//! subscribe. Only leases told to subscribe ever call `subscribe`, so a
//! channel whose claimer goes away unjoined must hand the claim on.

use std::sync::Arc;

use proptest::prelude::*;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use tokio::runtime::Runtime;

use shoutmap_backend::MemoryBackend;
use shoutmap_sync::{ChannelLease, ChannelRegistry, ChannelState};

const NAMES: [&str; 3] = ["shout-likes", "shout-comments", "notifications"];

#[derive(Debug, Clone)]
pub enum RegistryOp {
    /// Lease the channel with this name index.
    Acquire(usize),
    /// Subscribe through this lease, which was told to subscribe.
    Subscribe(usize),
    /// Release this lease; releasing twice must be a no-op.
    Release(usize),
}

#[derive(Clone, Debug)]
pub struct LeaseModel {
    pub name: usize,
    pub released: bool,
    pub should_subscribe: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ChannelModel {
    pub live: usize,
    pub joined: bool,
    pub claimer: Option<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct RegistryModel {
    pub leases: Vec<LeaseModel>,
    pub channels: [ChannelModel; 3],
}

impl ReferenceStateMachine for RegistryModel {
    type State = Self;
    type Transition = RegistryOp;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Self::default()).boxed()
    }

    fn transitions(state: &Self::State) -> BoxedStrategy<Self::Transition> {
        let acquire = (0..NAMES.len()).prop_map(RegistryOp::Acquire);
        if state.leases.is_empty() {
            return acquire.boxed();
        }
        let count = state.leases.len();
        let claimers: Vec<usize> = state
            .leases
            .iter()
            .enumerate()
            .filter(|(_, l)| l.should_subscribe && !l.released)
            .map(|(i, _)| i)
            .collect();
        if claimers.is_empty() {
            return prop_oneof![
                3 => acquire,
                3 => (0..count).prop_map(RegistryOp::Release),
            ]
            .boxed();
        }
        prop_oneof![
            3 => acquire,
            2 => prop::sample::select(claimers).prop_map(RegistryOp::Subscribe),
            3 => (0..count).prop_map(RegistryOp::Release),
        ]
        .boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            RegistryOp::Acquire(name) => {
                let index = state.leases.len();
                let channel = &mut state.channels[*name];
                let should_subscribe = !channel.joined && channel.claimer.is_none();
                if should_subscribe {
                    channel.claimer = Some(index);
                }
                channel.live += 1;
                state.leases.push(LeaseModel {
                    name: *name,
                    released: false,
                    should_subscribe,
                });
            }
            RegistryOp::Subscribe(lease) => {
                let name = state.leases[*lease].name;
                state.channels[name].joined = true;
            }
            RegistryOp::Release(index) => {
                let lease = &mut state.leases[*index];
                if !lease.released {
                    lease.released = true;
                    let channel = &mut state.channels[lease.name];
                    channel.live -= 1;
                    if !channel.joined && channel.claimer == Some(*index) {
                        channel.claimer = None;
                    }
                    if channel.live == 0 {
                        *channel = ChannelModel::default();
                    }
                }
            }
        }
        state
    }

    fn preconditions(state: &Self::State, transition: &Self::Transition) -> bool {
        match transition {
            RegistryOp::Acquire(name) => *name < NAMES.len(),
            RegistryOp::Subscribe(lease) => state
                .leases
                .get(*lease)
                .is_some_and(|l| l.should_subscribe && !l.released),
            RegistryOp::Release(lease) => *lease < state.leases.len(),
        }
    }
}

pub struct RegistryHarness {
    runtime: Runtime,
    backend: Arc<MemoryBackend>,
    registry: Arc<ChannelRegistry>,
    leases: Vec<ChannelLease>,
}

impl RegistryHarness {
    fn new() -> Self {
        let runtime = Runtime::new().expect("Failed to create tokio runtime");
        let backend = MemoryBackend::new();
        let registry = ChannelRegistry::new(backend.clone());
        Self {
            runtime,
            backend,
            registry,
            leases: Vec::new(),
        }
    }

    fn apply_operation(&mut self, op: &RegistryOp, model: &RegistryModel) {
        match op {
            RegistryOp::Acquire(name) => {
                let lease = self.registry.get_or_create_channel(NAMES[*name]);
                let expected = model.leases[self.leases.len()].should_subscribe;
                assert_eq!(
                    lease.should_subscribe, expected,
                    "should_subscribe mismatch for {}",
                    NAMES[*name]
                );
                self.leases.push(lease);
            }
            RegistryOp::Subscribe(index) => {
                let lease = &self.leases[*index];
                let result = self.runtime.block_on(lease.channel.subscribe());
                assert!(result.is_ok(), "subscribe failed: {:?}", result.err());
                assert_eq!(lease.channel.state(), ChannelState::Joined);
            }
            RegistryOp::Release(index) => {
                let lease = &self.leases[*index];
                self.runtime
                    .block_on(self.registry.safe_remove_channel(lease));
                assert!(lease.is_released());
            }
        }
    }

    fn verify_invariants(&self, model: &RegistryModel) {
        // Invariant 1: a channel exists exactly while it has live leases
        let live: Vec<&str> = NAMES
            .iter()
            .zip(model.channels.iter())
            .filter(|(_, c)| c.live > 0)
            .map(|(name, _)| *name)
            .collect();
        assert_eq!(self.registry.channel_count(), live.len());

        // Invariant 2: exactly the joined channels hold a backend topic
        let mut joined: Vec<&str> = NAMES
            .iter()
            .zip(model.channels.iter())
            .filter(|(_, c)| c.joined)
            .map(|(name, _)| *name)
            .collect();
        joined.sort();
        assert_eq!(self.backend.joined_topics(), joined);

        // Invariant 3: a claimed channel that has not joined is still idle
        for (name, channel) in NAMES.iter().zip(model.channels.iter()) {
            if channel.live > 0 && !channel.joined && channel.claimer.is_some() {
                let current = self.registry.get(name).expect("live channel missing");
                assert_eq!(current.state(), ChannelState::Idle);
            }
        }

        // Invariant 4: unreleased leases of a name share one handle
        for (lease, lease_model) in self.leases.iter().zip(model.leases.iter()) {
            if lease_model.released {
                continue;
            }
            let current = self
                .registry
                .get(NAMES[lease_model.name])
                .expect("live lease without registered channel");
            assert!(Arc::ptr_eq(&current, &lease.channel));
            assert_eq!(
                current.lease_count(),
                model.channels[lease_model.name].live
            );
        }
    }
}

impl StateMachineTest for RegistryHarness {
    type SystemUnderTest = Self;
    type Reference = RegistryModel;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        Self::new()
    }

    fn apply(
        mut state: Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        state.apply_operation(&transition, ref_state);
        state.verify_invariants(ref_state);
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        state.verify_invariants(ref_state);
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 10000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn channel_registry_state_machine_test(sequential 1..60 => RegistryHarness);
}

#[test]
fn test_names_are_independent() {
    let harness = RegistryHarness::new();
    let likes = harness.registry.get_or_create_channel("shout-likes");
    let comments = harness.registry.get_or_create_channel("shout-comments");

    assert!(likes.should_subscribe);
    assert!(comments.should_subscribe);
    assert!(!Arc::ptr_eq(&likes.channel, &comments.channel));
    assert_eq!(harness.registry.channel_count(), 2);
}

#[test]
fn test_release_before_subscribe_never_joins() {
    let harness = RegistryHarness::new();
    let lease = harness.registry.get_or_create_channel("x");
    harness.runtime.block_on(async {
        harness.registry.safe_remove_channel(&lease).await;
        // Subscribing through the released handle is a no-op.
        lease.channel.subscribe().await.unwrap();
    });

    assert_eq!(lease.channel.state(), ChannelState::Closed);
    assert_eq!(harness.registry.channel_count(), 0);
    assert!(harness.backend.joined_topics().is_empty());
}
