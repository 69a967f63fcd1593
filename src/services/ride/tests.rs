//! Tests for the ride state machine

use super::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

/// Machine with capacity 4, 30 s boarding window and 30 s ride
fn create_test_ride() -> (RideStateMachine, Instant) {
    (RideStateMachine::new(4, RideTimings::default()), Instant::now())
}

fn assert_invariants(ride: &RideStateMachine) {
    let c = ride.cycle();
    assert!(c.entered <= c.capacity, "entered {} > capacity {}", c.entered, c.capacity);
    assert!(c.exited <= c.entered, "exited {} > entered {}", c.exited, c.entered);
    match c.state {
        RideState::Boarding => assert!(c.ride_end_at.is_none()),
        RideState::Running => {
            assert!(c.boarding_deadline.is_none());
            assert!(c.ride_end_at.is_some());
        }
        RideState::Unloading => {
            assert!(c.boarding_deadline.is_none());
            assert!(c.ride_end_at.is_none());
        }
    }
}

/// Drive a ride from BOARDING into UNLOADING with `riders` aboard
fn unloading_with(riders: u32) -> (RideStateMachine, Instant) {
    let (mut ride, t0) = create_test_ride();
    for i in 0..riders {
        ride.on_entry(t0 + secs(i as u64));
    }
    let started = t0 + secs(riders as u64 - 1);
    if ride.state() == RideState::Boarding {
        ride.tick(started + secs(30));
    }
    ride.tick(started + secs(60));
    assert_eq!(ride.state(), RideState::Unloading);
    (ride, started + secs(60))
}

#[test]
fn test_initial_state() {
    let (ride, _) = create_test_ride();
    let snap = ride.snapshot();

    assert_eq!(ride.state(), RideState::Boarding);
    assert_eq!(ride.remaining_seats(), 4);
    assert!(snap.boarding_open);
    assert!(!snap.running);
    assert!(!snap.unloading);
    assert_eq!(snap.remaining_seats, 4);
}

#[test]
fn test_full_ride_scenario() {
    let (mut ride, t0) = create_test_ride();

    for i in 0..3 {
        let snap = ride.on_entry(t0 + secs(i)).unwrap();
        assert_eq!(snap.state, RideState::Boarding);
        assert_eq!(snap.remaining_seats, 3 - i as u32);
    }

    // Fourth entry fills the ride and starts it immediately
    let snap = ride.on_entry(t0 + secs(3)).unwrap();
    assert_eq!(snap.state, RideState::Running);
    assert_eq!(snap.remaining_seats, 0);
    assert_eq!(ride.start_cause(), Some(RideStartCause::Full));
    assert_eq!(ride.cycle().ride_end_at, Some(t0 + secs(33)));

    assert!(ride.tick(t0 + secs(32)).is_none());
    let snap = ride.tick(t0 + secs(33)).unwrap();
    assert_eq!(snap.state, RideState::Unloading);
    assert!(snap.unloading);

    for i in 34..37 {
        let snap = ride.on_exit(t0 + secs(i)).unwrap();
        assert_eq!(snap.state, RideState::Unloading);
    }

    let snap = ride.on_exit(t0 + secs(37)).unwrap();
    assert_eq!(snap.state, RideState::Boarding);
    assert_eq!(snap.remaining_seats, 4);
    assert_eq!(ride.cycle().entered, 0);
    assert_eq!(ride.cycle().exited, 0);
}

#[test]
fn test_partial_boarding_scenario() {
    let (mut ride, t0) = create_test_ride();

    ride.on_entry(t0);
    assert_eq!(ride.cycle().boarding_deadline, Some(t0 + secs(30)));

    assert!(ride.tick(t0 + secs(29)).is_none());
    let snap = ride.tick(t0 + secs(30)).unwrap();

    assert_eq!(snap.state, RideState::Running);
    assert_eq!(snap.remaining_seats, 3);
    assert_eq!(ride.start_cause(), Some(RideStartCause::BoardingWindow));
    assert!(ride.cycle().boarding_deadline.is_none());
}

#[test]
fn test_deadline_preserves_remaining_seats_into_run() {
    let (mut ride, t0) = create_test_ride();

    ride.on_entry(t0);
    ride.on_entry(t0 + secs(2));
    ride.tick(t0 + secs(40));

    assert_eq!(ride.state(), RideState::Running);
    assert_eq!(ride.remaining_seats(), 2);

    // Seats stay reserved through the run and unload
    ride.tick(t0 + secs(70));
    assert_eq!(ride.state(), RideState::Unloading);
    assert_eq!(ride.remaining_seats(), 2);
}

#[test]
fn test_each_entry_restarts_boarding_window() {
    let (mut ride, t0) = create_test_ride();

    ride.on_entry(t0);
    ride.on_entry(t0 + secs(20));
    assert_eq!(ride.cycle().boarding_deadline, Some(t0 + secs(50)));

    // Original deadline passes without effect
    assert!(ride.tick(t0 + secs(30)).is_none());
    assert_eq!(ride.state(), RideState::Boarding);

    assert!(ride.tick(t0 + secs(50)).is_some());
    assert_eq!(ride.state(), RideState::Running);
}

#[test]
fn test_empty_boarding_waits_indefinitely() {
    let (mut ride, t0) = create_test_ride();

    assert!(ride.tick(t0 + secs(31)).is_none());
    assert!(ride.tick(t0 + secs(3600)).is_none());
    assert_eq!(ride.state(), RideState::Boarding);

    // The first entry starts the countdown
    ride.on_entry(t0 + secs(3600));
    assert!(ride.tick(t0 + secs(3629)).is_none());
    assert!(ride.tick(t0 + secs(3630)).is_some());
}

#[test]
fn test_idempotent_ticks() {
    let (mut ride, t0) = create_test_ride();
    ride.on_entry(t0);

    let at = t0 + secs(30);
    assert!(ride.tick(at).is_some());
    assert!(ride.tick(at).is_none());
    assert!(ride.tick(at).is_none());
    assert_eq!(ride.state(), RideState::Running);
}

#[test]
fn test_entries_ignored_while_running() {
    let (mut ride, t0) = create_test_ride();
    ride.on_entry(t0);
    ride.tick(t0 + secs(30));

    assert!(ride.on_entry(t0 + secs(31)).is_none());
    assert!(ride.on_exit(t0 + secs(32)).is_none());
    assert_eq!(ride.cycle().entered, 1);
    assert_eq!(ride.cycle().exited, 0);
}

#[test]
fn test_entries_ignored_while_unloading() {
    let (mut ride, t) = unloading_with(2);

    assert!(ride.on_entry(t + secs(1)).is_none());
    assert_eq!(ride.cycle().entered, 2);
    assert_eq!(ride.state(), RideState::Unloading);
}

#[test]
fn test_exit_ignored_while_boarding() {
    let (mut ride, t0) = create_test_ride();
    ride.on_entry(t0);

    assert!(ride.on_exit(t0 + secs(1)).is_none());
    assert_eq!(ride.cycle().exited, 0);
    assert_eq!(ride.state(), RideState::Boarding);
}

#[test]
fn test_partial_drain_keeps_unloading() {
    let (mut ride, t) = unloading_with(3);

    ride.on_exit(t + secs(1));
    ride.on_exit(t + secs(2));
    assert_eq!(ride.state(), RideState::Unloading);
    assert_eq!(ride.cycle().exited, 2);

    let snap = ride.on_exit(t + secs(3)).unwrap();
    assert!(snap.boarding_open);
    assert_eq!(snap.remaining_seats, 4);
}

#[test]
fn test_stuck_unloading_stays_unloading() {
    let (mut ride, t) = unloading_with(2);
    ride.on_exit(t);

    // No watchdog inside the machine: time alone never leaves UNLOADING
    assert!(ride.tick(t + secs(86_400)).is_none());
    assert_eq!(ride.state(), RideState::Unloading);
}

#[test]
fn test_entry_after_filling_is_not_counted() {
    let mut ride = RideStateMachine::new(2, RideTimings::default());
    let t0 = Instant::now();

    ride.on_entry(t0);
    assert!(ride.on_entry(t0 + secs(1)).is_some());
    assert_eq!(ride.state(), RideState::Running);

    // Someone lingering at the entrance after the last seat was taken
    assert!(ride.on_entry(t0 + secs(2)).is_none());
    assert_eq!(ride.cycle().entered, 2);
    assert_eq!(ride.remaining_seats(), 0);
}

#[test]
fn test_batch_diagnostics() {
    let (mut ride, t0) = create_test_ride();

    ride.on_entry(t0);
    ride.on_entry(t0 + secs(2));
    assert_eq!(ride.cycle().batch_size, 2);

    // Gap larger than group_gap starts a new batch
    ride.on_entry(t0 + secs(10));
    assert_eq!(ride.cycle().batch_size, 1);
    assert_eq!(ride.cycle().last_entry_at, Some(t0 + secs(10)));

    // Batch resets when the ride starts
    ride.on_entry(t0 + secs(11));
    assert_eq!(ride.state(), RideState::Running);
    assert_eq!(ride.cycle().batch_size, 0);
}

#[test]
fn test_batch_does_not_affect_transitions() {
    let timings = RideTimings { group_gap: Duration::ZERO, ..RideTimings::default() };
    let mut ride = RideStateMachine::new(4, timings);
    let t0 = Instant::now();

    ride.on_entry(t0);
    ride.on_entry(t0 + secs(1));
    assert_eq!(ride.cycle().batch_size, 1);
    assert_eq!(ride.state(), RideState::Boarding);
    assert_eq!(ride.cycle().boarding_deadline, Some(t0 + secs(31)));
}

#[test]
fn test_invariants_hold_under_noisy_input() {
    let (mut ride, t0) = create_test_ride();

    // Seeded mix of entries, exits and ticks
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);
    let mut now = t0;
    let mut cycles = 0;
    for _ in 0..5_000 {
        now += Duration::from_millis(rng.gen_range(0..4_000));
        let before = ride.state();
        match rng.gen_range(0..3) {
            0 => {
                ride.on_entry(now);
            }
            1 => {
                ride.on_exit(now);
            }
            _ => {
                ride.tick(now);
            }
        }
        if before == RideState::Unloading && ride.state() == RideState::Boarding {
            cycles += 1;
        }
        assert_invariants(&ride);
    }
    assert!(cycles > 0, "noise never completed a cycle");
}

#[test]
fn test_checkpoint_roundtrip_mid_ride() {
    let (mut ride, t0) = create_test_ride();
    ride.on_entry(t0);
    ride.on_entry(t0 + secs(1));
    ride.tick(t0 + secs(31));

    let checkpoint = ride.checkpoint(t0 + secs(41));
    assert_eq!(checkpoint.state, RideState::Running);
    assert_eq!(checkpoint.ride_remaining_ms, Some(20_000));

    // Restart: the new process has its own clock origin
    let restart = Instant::now() + secs(500);
    let json = serde_json::to_string(&checkpoint).unwrap();
    let restored: CycleCheckpoint = serde_json::from_str(&json).unwrap();
    let mut resumed = RideStateMachine::resume_at(
        4,
        RideTimings::default(),
        &restored,
        restart,
        restored.saved_at_ms,
    )
    .unwrap();

    assert_eq!(resumed.state(), RideState::Running);
    assert_eq!(resumed.remaining_seats(), 2);
    assert!(resumed.tick(restart + secs(19)).is_none());
    assert_eq!(resumed.tick(restart + secs(20)).unwrap().state, RideState::Unloading);
}

#[test]
fn test_checkpoint_expired_deadline_fires_on_next_tick() {
    let (mut ride, t0) = create_test_ride();
    ride.on_entry(t0);

    let checkpoint = ride.checkpoint(t0 + secs(45));
    assert_eq!(checkpoint.boarding_remaining_ms, Some(0));

    let restart = Instant::now();
    let mut resumed =
        RideStateMachine::resume(4, RideTimings::default(), &checkpoint, restart).unwrap();
    assert_eq!(resumed.tick(restart).unwrap().state, RideState::Running);
}

#[test]
fn test_resume_rejects_inconsistent_checkpoints() {
    let now = Instant::now();
    let base = CycleCheckpoint {
        state: RideState::Unloading,
        capacity: 4,
        entered: 3,
        exited: 1,
        boarding_remaining_ms: None,
        ride_remaining_ms: None,
        batch_size: 0,
        saved_at_ms: 0,
    };
    assert!(RideStateMachine::resume(4, RideTimings::default(), &base, now).is_ok());
    let running = CycleCheckpoint {
        state: RideState::Running,
        exited: 0,
        ride_remaining_ms: Some(30_000),
        ..base.clone()
    };
    assert!(RideStateMachine::resume(4, RideTimings::default(), &running, now).is_ok());

    let bad = [
        CycleCheckpoint { capacity: 6, ..base.clone() },
        CycleCheckpoint { entered: 5, ..base.clone() },
        CycleCheckpoint { exited: 3, ..base.clone() },
        CycleCheckpoint { ride_remaining_ms: Some(5), ..base.clone() },
        CycleCheckpoint { state: RideState::Running, exited: 0, ..base.clone() },
        CycleCheckpoint { state: RideState::Boarding, exited: 0, ..base.clone() },
        CycleCheckpoint {
            state: RideState::Boarding,
            entered: 4,
            exited: 0,
            boarding_remaining_ms: Some(1),
            ..base.clone()
        },
        // Timers longer than the configured ones
        CycleCheckpoint { ride_remaining_ms: Some(30_001), ..running.clone() },
        CycleCheckpoint { ride_remaining_ms: Some(u64::MAX), ..running.clone() },
        CycleCheckpoint {
            state: RideState::Boarding,
            entered: 2,
            exited: 0,
            boarding_remaining_ms: Some(45_000),
            ..base.clone()
        },
    ];
    for checkpoint in &bad {
        assert!(
            RideStateMachine::resume(4, RideTimings::default(), checkpoint, now).is_err(),
            "accepted {checkpoint:?}"
        );
    }
}

#[test]
fn test_resume_takes_downtime_off_the_timers() {
    let running = CycleCheckpoint {
        state: RideState::Running,
        capacity: 4,
        entered: 2,
        exited: 0,
        boarding_remaining_ms: None,
        ride_remaining_ms: Some(25_000),
        batch_size: 0,
        saved_at_ms: 1_000_000,
    };

    // Down for 20 s: 5 s of the ride are left
    let restart = Instant::now();
    let mut resumed =
        RideStateMachine::resume_at(4, RideTimings::default(), &running, restart, 1_020_000)
            .unwrap();
    assert!(resumed.tick(restart + secs(4)).is_none());
    assert_eq!(resumed.tick(restart + secs(5)).unwrap().state, RideState::Unloading);

    // Down longer than the ride: it ends on the first tick
    let mut resumed =
        RideStateMachine::resume_at(4, RideTimings::default(), &running, restart, 1_090_000)
            .unwrap();
    assert_eq!(resumed.tick(restart).unwrap().state, RideState::Unloading);

    // Clock stepped back since the save: no downtime
    let mut resumed =
        RideStateMachine::resume_at(4, RideTimings::default(), &running, restart, 900_000)
            .unwrap();
    assert!(resumed.tick(restart + secs(24)).is_none());
    assert!(resumed.tick(restart + secs(25)).is_some());
}
