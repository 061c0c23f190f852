//! Cluster integration tests: elections, log repair, command flow,
//! backfill and slave mode across real engines wired over the
//! in-memory network.
//!
//! Two cluster flavours (see `common`): `Cluster::new` runs fast real
//! timers so elections fire on their own; `Cluster::controlled` makes
//! timeouts effectively infinite so forced roles drive every
//! transition deterministically.

#[allow(dead_code)]
mod common;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::Cluster;
use skiff::storage::Storage;
use skiff::{CommandStatus, Role, SkiffError};

// =============================================================================
// Elections
// =============================================================================

#[test]
fn election_converges_to_single_leader() {
    let mut cluster = Cluster::new();
    cluster.start();

    cluster.wait_for_leader();
    assert_eq!(cluster.leader_count(), 1, "more than one leader elected");
}

#[test]
fn term_increases_past_persisted_term() {
    let mut cluster = Cluster::new();
    let term = 10;
    for id in [4, 5, 6] {
        cluster.insert(id, term, 1, "command 1");
        cluster.save_vote(id, term, None);
    }
    cluster.start();

    let leader = cluster.wait_for_leader();
    assert!(cluster.member(leader).current_term().unwrap() > term);
}

#[test]
fn member_with_shorter_log_never_leads() {
    let mut cluster = Cluster::new();
    cluster.insert(4, 1, 1, "command 1");
    cluster.insert(5, 1, 1, "command 1");
    cluster.insert(4, 1, 2, "command 2");
    cluster.insert(5, 1, 2, "command 2");
    cluster.insert(6, 1, 1, "command 1");
    cluster.start();

    let leader = cluster.wait_for_leader();
    assert_ne!(leader, 6, "member with the shorter log won the election");
    assert!(!cluster.member(6).is_leader());
}

#[test]
fn member_with_older_log_term_never_leads() {
    let mut cluster = Cluster::new();
    for id in [4, 5, 6] {
        cluster.insert(id, 1, 1, "command 1");
    }
    cluster.insert(4, 2, 2, "command 2");
    cluster.insert(5, 2, 2, "command 2");
    cluster.start();

    let leader = cluster.wait_for_leader();
    assert_ne!(leader, 6);
}

#[test]
fn new_leader_writes_noop_over_uncommitted_entries() {
    let mut cluster = Cluster::new();
    // Two members hold an uncommitted entry from an old term; everyone
    // has moved on to term 10 since.
    cluster.insert(4, 5, 1, "command 1");
    cluster.insert(5, 5, 1, "command 1");
    cluster.save_vote(4, 10, None);
    cluster.save_vote(5, 10, None);
    cluster.start();

    let leader = cluster.wait_for_leader();
    assert_ne!(leader, 6, "member without the entry won the election");

    // The old entry commits, with the post-election no-op right after.
    cluster.assert_command(leader, 5, 1, "command 1");
    cluster.assert_command(leader, 0, 2, "");
}

#[test]
fn disabled_member_never_leads_and_leadership_moves() {
    let mut cluster = Cluster::new();
    cluster.start();

    let first = cluster.wait_for_leader();
    cluster.member(first).enable(false).unwrap();

    let mut second = 0;
    cluster.wait_until("another member takes over", || {
        for m in cluster.shard1_members() {
            if m.member_id() != first && m.is_leader() {
                second = m.member_id();
                return true;
            }
        }
        false
    });
    assert_ne!(second, first);
    assert!(!cluster.member(first).is_leader(), "disabled member must not lead");

    // Re-enabled, the old leader may participate again.
    cluster.member(first).enable(true).unwrap();
    cluster.wait_for_leader();
}

#[test]
fn role_change_events_fire_off_the_hot_path() {
    let mut cluster = Cluster::controlled();
    cluster.start();

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let id = cluster.engine("A").register_role_listener(move |event| {
        sink.lock().unwrap().push((event.old_role, event.new_role, event.leader_id));
    });

    cluster.member(4).force_role(Role::Candidate).unwrap();
    cluster.wait_until("member 4 leads", || cluster.member(4).is_leader());
    cluster.wait_until("both transitions observed", || events.lock().unwrap().len() >= 2);

    let seen = events.lock().unwrap().clone();
    assert_eq!(seen[0].0, Role::Follower);
    assert_eq!(seen[0].1, Role::Candidate);
    assert_eq!(seen[0].2, None);
    assert_eq!(seen[1].0, Role::Candidate);
    assert_eq!(seen[1].1, Role::Leader);
    assert_eq!(seen[1].2, Some(4));

    cluster.engine("A").unregister_role_listener(id);
}

// =============================================================================
// Log repair
// =============================================================================

#[test]
fn max_gap_round_trips() {
    let mut cluster = Cluster::controlled();
    cluster.start();
    let member = cluster.member(4);
    member.set_max_gap(99).unwrap();
    assert_eq!(member.max_gap().unwrap(), 99);
}

#[test]
fn missing_entry_repaired_on_restart() {
    let mut cluster = Cluster::controlled();
    // A gap at index 2: the write of 3 settled, 2 never did.
    let term = 1;
    cluster.insert(4, term, 1, "command 1");
    cluster.insert(4, term, 3, "command 3");
    cluster.save_vote(4, term, None);
    cluster.set_max_gap(4, 1);
    cluster.start();
    cluster.member(4).force_role(Role::Leader).unwrap();

    // The orphaned entry is gone; the new command takes index 2, with
    // no no-op in between (the tail already carries the current term).
    cluster.commit(4, "command 2");
    cluster.assert_command(6, 0, 1, "command 1");
    cluster.assert_command(6, 0, 2, "command 2");
}

#[test]
fn short_lived_leaders_entry_is_overwritten() {
    let mut cluster = Cluster::controlled();
    // Member 4 wrote at term 101 but never replicated it; 5 and 6 hold
    // the surviving history.
    cluster.insert(4, 101, 1, "command 2");
    for id in [5, 6] {
        cluster.insert(id, 100, 1, "command 1");
        cluster.insert(id, 102, 2, "command 3");
    }
    cluster.start();
    cluster.member(6).force_role(Role::Leader).unwrap();

    cluster.assert_command(4, 100, 1, "command 1");
    cluster.assert_command(4, 102, 2, "command 3");
}

#[test]
fn consecutive_noops_replicate_and_overwrite() {
    let mut cluster = Cluster::controlled();
    let term = 1;
    cluster.insert(4, term + 1, 1, "");
    cluster.insert(4, term + 2, 2, "");
    cluster.insert(4, term + 2, 3, "command 1");
    cluster.save_vote(4, term, None);
    for index in 1..=4 {
        cluster.insert(5, term, index, "to be deleted");
    }
    cluster.start();
    cluster.member(4).force_role(Role::Leader).unwrap();

    cluster.assert_command(6, 0, 1, "");
    cluster.assert_command(6, 0, 2, "");
    cluster.assert_command(6, 0, 3, "command 1");
    // The follower's stale suffix went with the overwrite.
    cluster.assert_command(5, 0, 3, "command 1");
}

// =============================================================================
// Commands
// =============================================================================

#[test]
fn commit_and_read_back_on_every_member() {
    let mut cluster = Cluster::controlled();
    cluster.start();
    cluster.member(4).force_role(Role::Leader).unwrap();

    cluster.commit(4, "command 1");

    for id in [4, 5, 6] {
        cluster.assert_command(id, 0, 1, ""); // post-election no-op
        cluster.assert_command(id, 0, 2, "command 1");
    }
}

#[test]
fn commands_take_consecutive_indices() {
    let mut cluster = Cluster::controlled();
    cluster.start();
    cluster.member(4).force_role(Role::Leader).unwrap();

    cluster.commit(4, "command 1");
    cluster.commit(4, "command 2");

    cluster.assert_command(4, 0, 1, "");
    cluster.assert_command(4, 0, 2, "command 1");
    cluster.assert_command(4, 0, 3, "command 2");
    // Reads are repeatable.
    cluster.assert_command(4, 0, 2, "command 1");
}

#[test]
fn reader_blocks_until_the_entry_commits() {
    let mut cluster = Cluster::controlled();
    cluster.start();
    cluster.member(4).force_role(Role::Leader).unwrap();

    let shard = cluster.shard_of(5);
    let reader = thread::spawn(move || {
        shard
            .committed_command(2, Some(10_000))
            .map(|command| command.as_string())
    });

    thread::sleep(Duration::from_millis(300));
    cluster.commit(4, "command 1");
    assert_eq!(reader.join().unwrap().unwrap(), "command 1");
}

#[test]
fn read_times_out_when_nothing_commits() {
    let mut cluster = Cluster::controlled();
    cluster.start();

    let shard = cluster.shard_of(4);
    match shard.committed_command(100, Some(50)) {
        Err(SkiffError::Timeout(_)) => {}
        other => panic!("expected timeout, got {:?}", other.map(|c| c.as_string())),
    }
}

#[test]
fn commit_timeout_is_not_rollback() {
    let mut cluster = Cluster::controlled();
    // Only the leader's host runs; no quorum exists yet.
    cluster.start_host("A");
    cluster.member(4).force_role(Role::Leader).unwrap();

    let shard = cluster.shard_of(4);
    let mut command = shard.checkout_command();
    match command.commit(b"late", Some(1)) {
        Err(SkiffError::Timeout(_)) => {}
        other => panic!("expected timeout, got {:?}", other),
    }
    assert_eq!(command.status(), CommandStatus::Timeout);
    command.release();

    // Quorum arrives later; the timed-out entry still commits and
    // readers observe it.
    cluster.start_host("B");
    cluster.start_host("C");
    cluster.assert_command(4, 0, 2, "late");
}

#[test]
fn index_zero_is_rejected() {
    let mut cluster = Cluster::controlled();
    cluster.start();
    let shard = cluster.shard_of(6);
    assert!(matches!(
        shard.committed_command(0, Some(100)),
        Err(SkiffError::InvalidIndex(0))
    ));
}

#[test]
fn oversize_command_is_rejected_synchronously() {
    let mut cluster = Cluster::controlled();
    cluster.start();
    cluster.member(4).force_role(Role::Leader).unwrap();

    let shard = cluster.shard_of(4);
    let mut command = shard.checkout_command();
    let payload = vec![0u8; 1001]; // command_max_size + 1
    match command.commit(&payload, None) {
        Err(SkiffError::CommandTooLarge { size, max }) => {
            assert_eq!(size, 1001);
            assert_eq!(max, 1000);
        }
        other => panic!("expected size rejection, got {:?}", other),
    }
    assert_eq!(command.status(), CommandStatus::Error);
}

#[test]
fn commit_on_non_leader_is_rejected() {
    let mut cluster = Cluster::controlled();
    cluster.start();

    // Nobody was forced into leadership; everyone is a follower.
    let shard = cluster.shard_of(5);
    let mut command = shard.checkout_command();
    match command.commit(b"command 1", Some(1000)) {
        Err(SkiffError::NotLeader { .. }) => {}
        other => panic!("expected NotLeader, got {:?}", other),
    }
}

#[test]
fn payload_bytes_round_trip_exactly() {
    let mut cluster = Cluster::controlled();
    cluster.start();
    cluster.member(4).force_role(Role::Leader).unwrap();

    let payload: Vec<u8> = (0..1000u32).map(|i| (i * 31 % 251) as u8).collect();
    let shard = cluster.shard_of(4);
    let mut command = shard.checkout_command();
    command.commit(&payload, Some(10_000)).unwrap();
    let index = command.index();
    command.release();

    for id in [4, 5, 6] {
        let read = cluster
            .shard_of(id)
            .committed_command(index, Some(10_000))
            .unwrap();
        assert_eq!(read.data(), payload.as_slice(), "member {}", id);
    }
}

#[test]
fn progress_indices_stay_ordered() {
    let mut cluster = Cluster::controlled();
    cluster.start();
    cluster.member(4).force_role(Role::Leader).unwrap();
    for i in 0..10 {
        cluster.commit(4, &format!("command {}", i));
    }

    for id in [4, 5, 6] {
        let member = cluster.member(id);
        let commit = member.commit_index().unwrap();
        let saved = member.saved_index().unwrap();
        assert!(commit <= saved, "member {}: commit {} > saved {}", id, commit, saved);
    }
}

#[test]
fn clean_shutdown_resets_max_gap() {
    let mut cluster = Cluster::controlled();
    cluster.start();
    cluster.member(4).force_role(Role::Leader).unwrap();
    cluster.commit(4, "command 1");

    cluster.stop_all();
    for id in [4, 5, 6] {
        assert_eq!(cluster.storage.max_gap(id).unwrap(), 0, "member {}", id);
    }
}

#[test]
fn restart_recovers_log_vote_and_term() {
    let mut cluster = Cluster::controlled();
    cluster.start();
    cluster.member(4).force_role(Role::Leader).unwrap();
    for i in 1..=3 {
        cluster.commit(4, &format!("command {}", i));
    }
    let term_before = cluster.member(4).current_term().unwrap();

    cluster.restart();

    assert!(cluster.member(4).current_term().unwrap() >= term_before);
    cluster.member(4).force_role(Role::Leader).unwrap();
    cluster.assert_command(4, 0, 2, "command 1");
    cluster.assert_command(4, 0, 4, "command 3");
}

// =============================================================================
// Backfill
// =============================================================================

#[test]
fn leader_backfills_behind_followers() {
    let mut cluster = Cluster::controlled();
    let term = 1;
    cluster.insert(4, term, 1, "command 1");
    cluster.save_vote(4, term, None);
    cluster.start();
    cluster.member(4).force_role(Role::Leader).unwrap();

    cluster.assert_command(5, term, 1, "command 1");
    cluster.assert_command(6, term, 1, "command 1");
}

#[test]
fn backfill_preserves_per_entry_terms() {
    let mut cluster = Cluster::controlled();
    let cterm = 100;
    let term = 5;
    for i in 1..=10u64 {
        cluster.insert(4, term + i, i, &format!("command {}", i));
        cluster.insert(5, term + i, i, &format!("command {}", i));
    }
    cluster.save_vote(4, cterm, None);
    cluster.start();
    cluster.member(4).force_role(Role::Leader).unwrap();

    for i in 1..=10u64 {
        cluster.assert_command(6, term + i, i, &format!("command {}", i));
    }
}

#[test]
fn large_backfill_replaces_stale_history() {
    let mut cluster = Cluster::new();
    for i in 1..=1000u64 {
        cluster.insert(4, 1, i, &format!("older {}", i));
    }
    for i in 1..=1000u64 {
        cluster.insert(5, 2, i, &format!("newer {}", i));
        cluster.insert(6, 2, i, &format!("newer {}", i));
    }
    cluster.start();

    let leader = cluster.wait_for_leader();
    assert_ne!(leader, 4, "stale-history member won the election");

    cluster.assert_command(4, 2, 1000, "newer 1000");
    cluster.assert_command(4, 2, 1, "newer 1");
}

#[test]
fn match_index_converges_to_saved_index() {
    let mut cluster = Cluster::controlled();
    let term = 5;
    for i in 1..=10u64 {
        cluster.insert(4, term + i, i, &format!("command {}", i));
    }
    cluster.start();
    cluster.member(4).force_role(Role::Leader).unwrap();

    let shard = cluster.shard_of(4);
    let follower = shard.member(5).unwrap();
    cluster.wait_until("follower catches up", || follower.is_log_up_to_date());
    assert_eq!(shard.last_saved_index(), 10);
}

// =============================================================================
// Slave mode
// =============================================================================

#[test]
fn slave_to_same_shard_is_rejected() {
    let mut cluster = Cluster::new();
    cluster.start();
    cluster.wait_for_leader();

    for (member, master) in [(4, 5), (5, 6), (6, 4)] {
        match cluster.member(member).set_slave(Some(master)) {
            Err(SkiffError::SameShard { master: m }) => assert_eq!(m, master),
            other => panic!("expected SameShard, got {:?}", other),
        }
        assert!(cluster.member(member).slave_status().is_none());
    }
    cluster.wait_for_leader();
}

#[test]
fn slave_mirrors_a_foreign_leader() {
    let mut cluster = Cluster::new();
    let term = 77;
    let ncmds = 100u64;
    for id in [4, 5, 6] {
        for i in 1..=ncmds {
            cluster.insert(id, term, i, &format!("command {}", i));
        }
        cluster.save_vote(id, term, None);
    }
    cluster.start();
    cluster.member(4).force_role(Role::Leader).unwrap();
    cluster.start_host("D");
    cluster.start_host("E");

    let slave1 = cluster.member(1);
    let slave2 = cluster.member(2);

    // Pointing at a non-leader attaches nothing.
    slave1.set_slave(Some(6)).unwrap();
    thread::sleep(Duration::from_millis(600));
    assert!(!slave1.slave_status().unwrap().running, "slave of a non-leader must not run");

    // Pointing at the leader mirrors its log. Repeated set_slave calls
    // are idempotent.
    slave1.set_slave(Some(4)).unwrap();
    slave2.set_slave(Some(4)).unwrap();
    cluster.wait_until("slaves catch up", || {
        slave1.set_slave(Some(4)).unwrap();
        slave2.set_slave(Some(4)).unwrap();
        slave1.slave_status().map(|s| s.saved_index >= ncmds).unwrap_or(false)
            && slave2.slave_status().map(|s| s.saved_index >= ncmds).unwrap_or(false)
    });
    assert!(slave1.slave_status().unwrap().running);
    assert!(slave2.slave_status().unwrap().running);

    // Reads on a slaved shard fail typed.
    let shard2 = cluster.shard_of(1);
    match shard2.committed_command(1, Some(100)) {
        Err(SkiffError::SlaveMode) => {}
        other => panic!("expected SlaveMode, got {:?}", other.map(|c| c.as_string())),
    }

    // Leaving slave mode restores normal operation: shard2 elects a
    // leader over the mirrored history and serves reads from it.
    slave1.set_slave(None).unwrap();
    slave2.set_slave(None).unwrap();
    assert!(slave1.slave_status().is_none());
    assert!(slave2.slave_status().is_none());

    cluster.wait_until("shard2 elects a leader", || {
        cluster.member(1).is_leader() || cluster.member(2).is_leader()
    });
    let shard2_leader = if cluster.member(1).is_leader() { 1 } else { 2 };
    cluster.assert_command(shard2_leader, term, 1, "command 1");
    cluster.assert_command(shard2_leader, term, ncmds, &format!("command {}", ncmds));
}
