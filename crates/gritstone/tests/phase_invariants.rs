//! Phase lifecycle and configuration-error invariants.

use gritstone::{
    Harness, HarnessConfig, HarnessError, MemStore, PhaseName, PhaseState,
};

fn harness(seed: i64) -> Harness<MemStore> {
    Harness::new(MemStore::reliable(), HarnessConfig::default().with_seed(seed)).expect("harness")
}

#[test]
fn misaligned_start_is_a_configuration_error() {
    let harness = harness(1);
    let err = harness.populate(37, 64, 1).expect_err("start=37 must fail");
    assert!(matches!(err, HarnessError::Config(_)), "got {err:?}");
    // Rejected before any operation executed, and before the phase began.
    assert_eq!(harness.phase_state(PhaseName::Populate), PhaseState::Before);
    assert_eq!(harness.tallies().succeeded, 0);
}

#[test]
fn misaligned_count_is_a_configuration_error() {
    let harness = harness(1);
    assert!(harness.populate(0, 37, 1).is_err());
    assert!(harness.exercise(0, 100, 1).is_err());
    assert!(harness.check(64, 63, 1).is_err());
    assert!(harness.clean(0, -64, 1).is_err());
}

#[test]
fn negative_start_is_a_configuration_error() {
    let harness = harness(1);
    assert!(matches!(
        harness.populate(-64, 64, 1),
        Err(HarnessError::Config(_))
    ));
}

#[test]
fn zero_threads_is_a_configuration_error() {
    let harness = harness(1);
    assert!(matches!(
        harness.populate(0, 64, 0),
        Err(HarnessError::Config(_))
    ));
}

#[test]
fn phases_are_single_use() {
    let harness = harness(2);
    assert!(harness.populate(0, 0, 1).expect("first populate").passed);

    let err = harness.populate(0, 0, 1).expect_err("second populate");
    match err {
        HarnessError::PhaseReuse { phase, state } => {
            assert_eq!(phase, PhaseName::Populate);
            assert_eq!(state, PhaseState::Passed);
        }
        other => panic!("expected PhaseReuse, got {other:?}"),
    }
}

#[test]
fn each_phase_tracks_its_own_state() {
    let harness = harness(3);
    for phase in [
        PhaseName::Populate,
        PhaseName::Exercise,
        PhaseName::Check,
        PhaseName::Clean,
    ] {
        assert_eq!(harness.phase_state(phase), PhaseState::Before);
    }

    harness.populate(0, 64, 1).expect("populate");
    assert_eq!(harness.phase_state(PhaseName::Populate), PhaseState::Passed);
    assert_eq!(harness.phase_state(PhaseName::Exercise), PhaseState::Before);

    harness.exercise(0, 64, 1).expect("exercise");
    assert_eq!(harness.phase_state(PhaseName::Exercise), PhaseState::Passed);
}

#[test]
fn empty_range_passes_trivially() {
    let harness = harness(4);
    let report = harness.exercise(0, 0, 1).expect("empty exercise");
    assert!(report.passed);
    assert_eq!(report.tallies.succeeded, 0);
}

#[test]
fn invalid_percentages_fail_at_construction() {
    let config = HarnessConfig {
        read_percent: 101,
        ..HarnessConfig::default()
    };
    assert!(matches!(
        Harness::new(MemStore::reliable(), config),
        Err(HarnessError::Config(_))
    ));

    let config = HarnessConfig {
        bulk_put_percent: 200,
        ..HarnessConfig::default()
    };
    assert!(Harness::new(MemStore::reliable(), config).is_err());
}

#[test]
fn stop_request_halts_between_blocks() {
    let harness = harness(5);
    harness.request_stop();
    let report = harness.populate(0, 6400, 2).expect("populate");
    // Stop was requested before the phase began: nothing should execute.
    assert_eq!(report.tallies.succeeded, 0);
}

#[test]
fn more_threads_than_blocks_still_works() {
    let harness = harness(6);
    let report = harness.populate(0, 64, 8).expect("populate");
    assert!(report.passed);
    assert_eq!(report.tallies.succeeded, 64);
}
