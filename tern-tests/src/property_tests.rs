//! Randomized invariant checks over the epoch cache and the registry.

use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tern_controller::ReplicaRegistry;
use tern_core::Epoch;
use tern_epoch::EpochCache;
use tern_protocol::{
    AlterSyncStateSetRequest, ElectMasterRequest, GetReplicaInfoRequest, RegisterBrokerRequest,
};

use crate::harness::InProcessController;

/// Builds a random strictly-monotonic epoch history.
fn random_history(rng: &mut StdRng, len: usize) -> (Vec<(Epoch, i64)>, i64) {
    let mut entries = Vec::with_capacity(len);
    let mut epoch = 0u32;
    let mut offset = 0i64;
    for _ in 0..len {
        epoch += rng.gen_range(1..4);
        entries.push((Epoch::new(epoch), offset));
        offset += rng.gen_range(1..2000);
    }
    (entries, offset)
}

#[test]
fn test_consistent_point_on_shared_prefix_histories() {
    for seed in 0..64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let shared_len = rng.gen_range(1..6);
        let (shared, shared_end) = random_history(&mut rng, shared_len);
        let last_epoch = shared.last().map(|&(e, _)| e.get()).unwrap_or(0);

        // Both sides extend the shared history with disjoint epochs
        // starting at the same offset: the consistent point is exactly
        // where they diverged.
        let mut local = shared.clone();
        local.push((Epoch::new(last_epoch + 1), shared_end));
        let mut remote = shared.clone();
        remote.push((Epoch::new(last_epoch + 2), shared_end));

        let local_cache = EpochCache::from_entries(local, shared_end + rng.gen_range(1..500));
        let remote_cache = EpochCache::from_entries(remote, shared_end + rng.gen_range(1..500));

        assert_eq!(
            local_cache.find_consistent_point(&remote_cache),
            Some(shared_end),
            "seed {seed}: divergence point not found"
        );
        // The relation is symmetric here: both sides agree on the prefix.
        assert_eq!(
            remote_cache.find_consistent_point(&local_cache),
            Some(shared_end),
            "seed {seed}: asymmetric consistent point"
        );
    }
}

#[test]
fn test_consistent_point_on_prefix_replica() {
    for seed in 0..64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let history_len = rng.gen_range(1..6);
        let (history, end) = random_history(&mut rng, history_len);

        // The replica read only part of the newest epoch.
        let last_start = history.last().map(|&(_, s)| s).unwrap_or(0);
        let cut = rng.gen_range(last_start..=end);

        let full = EpochCache::from_entries(history.clone(), end);
        let replica = EpochCache::from_entries(history, cut);

        assert_eq!(
            replica.find_consistent_point(&full),
            Some(cut),
            "seed {seed}: prefix replica should be consistent up to its cut"
        );
    }
}

#[test]
fn test_disjoint_histories_have_no_consistent_point() {
    for seed in 0..64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let history_len = rng.gen_range(1..5);
        let (history, end) = random_history(&mut rng, history_len);

        // Shift every epoch past the local range: nothing can match.
        let max_epoch = history.last().map(|&(e, _)| e.get()).unwrap_or(0);
        let shifted: Vec<(Epoch, i64)> = history
            .iter()
            .map(|&(e, s)| (Epoch::new(e.get() + max_epoch + 1), s))
            .collect();

        let local = EpochCache::from_entries(history, end);
        let remote = EpochCache::from_entries(shifted, end);
        assert_eq!(local.find_consistent_point(&remote), None, "seed {seed}");
    }
}

#[test]
fn test_suffix_truncation_is_idempotent() {
    for seed in 0..64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let history_len = rng.gen_range(1..6);
        let (history, end) = random_history(&mut rng, history_len);
        let cache = EpochCache::from_entries(history, end);

        let point = rng.gen_range(0..=end);
        cache.truncate_suffix_from_offset(point).unwrap();
        let once = cache.all_entries();

        cache.truncate_suffix_from_offset(point).unwrap();
        assert_eq!(cache.all_entries(), once, "seed {seed}");

        // Everything kept lies at or below the truncation point.
        for entry in once {
            assert!(entry.start_offset < point || entry.start_offset == 0);
            assert!(entry.end_offset <= point.max(entry.start_offset));
        }
    }
}

#[test]
fn test_registry_epochs_monotonic_and_one_master_per_epoch() {
    let addresses: Vec<String> = (0..5).map(|i| format!("127.0.0.1:90{i:02}")).collect();

    for seed in 0..32 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut registry = ReplicaRegistry::new();
        let mut masters_by_epoch: HashMap<u32, String> = HashMap::new();
        let mut last_master_epoch = 0u32;
        let mut last_sync_epoch = 0u32;

        for _ in 0..200 {
            match rng.gen_range(0..3) {
                0 => {
                    let address = &addresses[rng.gen_range(0..addresses.len())];
                    let result = registry.register_broker(&RegisterBrokerRequest::new(
                        "cluster1", "broker1", address,
                    ));
                    InProcessController::commit(&mut registry, result);
                }
                1 => {
                    let info = registry
                        .get_replica_info(&GetReplicaInfoRequest::new("broker1", "nobody:0"))
                        .response()
                        .clone();
                    if info.master_address.is_empty() {
                        continue;
                    }
                    let mut new_set: HashSet<String> =
                        HashSet::from([info.master_address.clone()]);
                    for address in &addresses {
                        if rng.gen_bool(0.5) {
                            new_set.insert(address.clone());
                        }
                    }
                    let result = registry.alter_sync_state_set(&AlterSyncStateSetRequest::new(
                        "broker1",
                        info.master_address.clone(),
                        info.master_epoch,
                        new_set,
                        info.sync_state_set.sync_state_set_epoch,
                    ));
                    InProcessController::commit(&mut registry, result);
                }
                _ => {
                    let result = registry.elect_master(&ElectMasterRequest::new("broker1"));
                    InProcessController::commit(&mut registry, result);
                }
            }

            let info = registry
                .get_replica_info(&GetReplicaInfoRequest::new("broker1", "nobody:0"))
                .response()
                .clone();
            if !info.error_code.is_ok() {
                continue;
            }

            // P1: epochs never decrease.
            assert!(info.master_epoch.get() >= last_master_epoch, "seed {seed}");
            assert!(
                info.sync_state_set.sync_state_set_epoch.get() >= last_sync_epoch,
                "seed {seed}"
            );
            last_master_epoch = info.master_epoch.get();
            last_sync_epoch = info.sync_state_set.sync_state_set_epoch.get();

            // P3: one master per epoch, ever.
            if !info.master_address.is_empty() {
                let recorded = masters_by_epoch
                    .entry(info.master_epoch.get())
                    .or_insert_with(|| info.master_address.clone());
                assert_eq!(recorded, &info.master_address, "seed {seed}");
            }

            // P4: master in ISR, ISR within registered replicas.
            if !info.master_address.is_empty() {
                assert!(
                    info.sync_state_set
                        .sync_state_set
                        .contains(&info.master_address),
                    "seed {seed}"
                );
            }
        }
    }
}
