//! Unit tests for the request registry.

use std::time::{Duration, Instant};

use rstest::{fixture, rstest};

use super::*;

fn kvm() -> DriverId {
    DriverId::new("kvm")
}

fn xen() -> DriverId {
    DriverId::new("xen")
}

#[fixture]
fn now() -> Instant {
    Instant::now()
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

#[test]
fn new_registry_is_empty() {
    let registry = RequestRegistry::new();
    assert!(registry.is_empty());
    assert_eq!(registry.len(), 0);
}

#[rstest]
fn second_register_for_the_same_pair_is_rejected(now: Instant) {
    let registry = RequestRegistry::new();
    let deadline = now + Duration::from_secs(30);
    registry
        .register(&kvm(), VmId::new(4), Verb::Migrate, deadline)
        .expect("first register");

    let error = registry
        .register(&kvm(), VmId::new(4), Verb::Poll, deadline)
        .expect_err("pair is busy");

    assert_eq!(
        error,
        AlreadyPending {
            driver: kvm(),
            vm: VmId::new(4),
            verb: Verb::Migrate,
        }
    );
    assert!(error.to_string().contains("MIGRATE pending for VM 4"));
    let pending = registry.pending(&kvm(), VmId::new(4)).expect("still pending");
    assert_eq!(pending.verb(), Verb::Migrate);
}

#[rstest]
fn pairs_are_independent_across_drivers_and_vms(now: Instant) {
    let registry = RequestRegistry::new();
    let deadline = now + Duration::from_secs(30);
    registry
        .register(&kvm(), VmId::new(1), Verb::Deploy, deadline)
        .expect("kvm vm 1");
    registry
        .register(&xen(), VmId::new(1), Verb::Deploy, deadline)
        .expect("xen vm 1");
    registry
        .register(&kvm(), VmId::new(2), Verb::Deploy, deadline)
        .expect("kvm vm 2");
    assert_eq!(registry.len(), 3);
}

#[rstest]
fn register_succeeds_again_after_resolve(now: Instant) {
    let registry = RequestRegistry::new();
    let deadline = now + Duration::from_secs(30);
    registry
        .register(&kvm(), VmId::new(9), Verb::Save, deadline)
        .expect("first register");

    let resolved = registry.resolve(&kvm(), VmId::new(9)).expect("resolved");
    assert_eq!(resolved.driver(), &kvm());
    assert_eq!(resolved.deadline(), deadline);
    assert!(resolved.submitted_at() <= Instant::now());
    assert!(registry.resolve(&kvm(), VmId::new(9)).is_none());

    registry
        .register(&kvm(), VmId::new(9), Verb::Restore, deadline)
        .expect("pair is free again");
}

// ---------------------------------------------------------------------------
// Reply resolution
// ---------------------------------------------------------------------------

#[rstest]
fn reply_with_another_verb_leaves_the_entry_pending(now: Instant) {
    let registry = RequestRegistry::new();
    registry
        .register(&kvm(), VmId::new(3), Verb::Poll, now + Duration::from_secs(5))
        .expect("register");

    assert!(
        registry
            .resolve_reply(&kvm(), VmId::new(3), Verb::Deploy)
            .is_none()
    );
    assert!(registry.pending(&kvm(), VmId::new(3)).is_some());

    let resolved = registry
        .resolve_reply(&kvm(), VmId::new(3), Verb::Poll)
        .expect("matching verb resolves");
    assert_eq!(resolved.verb(), Verb::Poll);
    assert!(registry.is_empty());
}

#[rstest]
fn reply_from_another_driver_does_not_resolve(now: Instant) {
    let registry = RequestRegistry::new();
    registry
        .register(&kvm(), VmId::new(3), Verb::Poll, now + Duration::from_secs(5))
        .expect("register");
    assert!(
        registry
            .resolve_reply(&xen(), VmId::new(3), Verb::Poll)
            .is_none()
    );
    assert_eq!(registry.len(), 1);
}

// ---------------------------------------------------------------------------
// Sweeping
// ---------------------------------------------------------------------------

#[rstest]
fn sweep_removes_only_expired_entries(now: Instant) {
    let registry = RequestRegistry::new();
    registry
        .register(&kvm(), VmId::new(1), Verb::Migrate, now + Duration::from_secs(2))
        .expect("short deadline");
    registry
        .register(&kvm(), VmId::new(2), Verb::Deploy, now + Duration::from_secs(1))
        .expect("shortest deadline");
    registry
        .register(&kvm(), VmId::new(3), Verb::Poll, now + Duration::from_secs(60))
        .expect("long deadline");

    let expired = registry.sweep(now + Duration::from_secs(5));

    let vms: Vec<VmId> = expired.iter().map(|entry| entry.request().vm()).collect();
    assert_eq!(vms, vec![VmId::new(2), VmId::new(1)]);
    let first = expired.first().expect("one expired entry");
    assert_eq!(first.overdue(), Duration::from_secs(4));
    assert_eq!(registry.len(), 1);
    assert!(registry.pending(&kvm(), VmId::new(3)).is_some());
}

#[rstest]
fn sweep_before_any_deadline_is_a_no_op(now: Instant) {
    let registry = RequestRegistry::new();
    registry
        .register(&kvm(), VmId::new(1), Verb::Reboot, now + Duration::from_secs(2))
        .expect("register");
    assert!(registry.sweep(now).is_empty());
    assert_eq!(registry.len(), 1);
}

#[rstest]
fn register_succeeds_after_a_timeout_sweep(now: Instant) {
    let registry = RequestRegistry::new();
    registry
        .register(&kvm(), VmId::new(5), Verb::Migrate, now + Duration::from_secs(1))
        .expect("register");
    assert_eq!(registry.sweep(now + Duration::from_secs(2)).len(), 1);
    registry
        .register(&kvm(), VmId::new(5), Verb::Migrate, now + Duration::from_secs(10))
        .expect("pair is free after the sweep");
}

#[rstest]
fn overdue_lists_without_removing(now: Instant) {
    let registry = RequestRegistry::new();
    registry
        .register(&kvm(), VmId::new(4), Verb::Save, now + Duration::from_secs(3))
        .expect("later deadline");
    registry
        .register(&kvm(), VmId::new(6), Verb::Reset, now + Duration::from_secs(1))
        .expect("earlier deadline");

    let overdue = registry.overdue(now + Duration::from_secs(5));

    let vms: Vec<VmId> = overdue.iter().map(OutstandingRequest::vm).collect();
    assert_eq!(vms, vec![VmId::new(6), VmId::new(4)]);
    assert_eq!(registry.len(), 2);
}

#[rstest]
fn expire_removes_the_request_it_was_given(now: Instant) {
    let registry = RequestRegistry::new();
    registry
        .register(&kvm(), VmId::new(5), Verb::Migrate, now + Duration::from_secs(1))
        .expect("register");
    let later = now + Duration::from_secs(3);
    let candidate = registry
        .overdue(later)
        .into_iter()
        .next()
        .expect("one overdue request");

    let timed_out = registry.expire(&candidate, later).expect("still pending");

    assert_eq!(timed_out.request(), &candidate);
    assert_eq!(timed_out.overdue(), Duration::from_secs(2));
    assert!(registry.is_empty());
}

#[rstest]
fn expire_skips_a_request_replaced_by_a_newer_one(now: Instant) {
    let registry = RequestRegistry::new();
    registry
        .register(&kvm(), VmId::new(5), Verb::Migrate, now + Duration::from_secs(1))
        .expect("register");
    let later = now + Duration::from_secs(3);
    let candidate = registry
        .overdue(later)
        .into_iter()
        .next()
        .expect("one overdue request");
    registry
        .resolve(&kvm(), VmId::new(5))
        .expect("reply resolves it");
    registry
        .register(&kvm(), VmId::new(5), Verb::Migrate, now + Duration::from_secs(1))
        .expect("same verb, same deadline, new command");

    assert_eq!(registry.expire(&candidate, later), None);
    assert_eq!(registry.len(), 1);
}

// ---------------------------------------------------------------------------
// Driver recovery
// ---------------------------------------------------------------------------

#[rstest]
fn drain_driver_only_touches_that_driver(now: Instant) {
    let registry = RequestRegistry::new();
    let deadline = now + Duration::from_secs(30);
    registry
        .register(&kvm(), VmId::new(8), Verb::Shutdown, deadline)
        .expect("kvm vm 8");
    registry
        .register(&kvm(), VmId::new(2), Verb::Deploy, deadline)
        .expect("kvm vm 2");
    registry
        .register(&xen(), VmId::new(2), Verb::Deploy, deadline)
        .expect("xen vm 2");

    let drained = registry.drain_driver(&kvm());

    let vms: Vec<VmId> = drained.iter().map(OutstandingRequest::vm).collect();
    assert_eq!(vms, vec![VmId::new(2), VmId::new(8)]);
    assert_eq!(registry.len(), 1);
    assert!(registry.pending(&xen(), VmId::new(2)).is_some());
}
