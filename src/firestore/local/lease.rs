use std::collections::BTreeSet;
use std::time::Duration;

use crate::firestore::error::{failed_precondition, internal_error, FirestoreResult};
use crate::firestore::local::persistence::{ClientMetadata, PersistenceTransaction, PrimaryLease};
use crate::firestore::model::TargetId;

/// How often the lease and the client metadata row are refreshed.
pub const LEASE_REFRESH_INTERVAL: Duration = Duration::from_secs(4);
/// A lease not refreshed for this long may be taken over. Several refresh
/// intervals, so a late tick or a suspended process does not hand the
/// lease to another client while the owner still acts as primary.
pub const MAX_PRIMARY_AGE_MS: i64 = 20_000;
/// Client metadata rows older than this are pruned.
pub const MAX_CLIENT_AGE_MS: i64 = 30 * 60 * 1_000;

const CHANGE_COUNTER: &str = "change_counter";

pub const EXCLUSIVE_LEASE_MESSAGE: &str =
    "Another client holds exclusive access to the persistence layer. Enable multi-client mode on every client sharing the store.";

/// Coordinates which client sharing a store owns the network connection.
#[derive(Clone, Debug)]
pub struct LeaseCoordinator {
    client_id: String,
    allow_tab_synchronization: bool,
}

impl LeaseCoordinator {
    pub fn new(client_id: impl Into<String>, allow_tab_synchronization: bool) -> Self {
        Self {
            client_id: client_id.into(),
            allow_tab_synchronization,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn allows_tab_synchronization(&self) -> bool {
        self.allow_tab_synchronization
    }

    /// Takes the lease when it is absent, expired or already ours, unless a
    /// foreground client could take it instead while we are in the
    /// background. Returns whether this client is now primary.
    ///
    /// Fails with `FailedPrecondition` when another client holds the lease
    /// and either side did not enable multi-client mode.
    pub fn try_acquire_or_extend(
        &self,
        txn: &mut dyn PersistenceTransaction,
        now_ms: i64,
    ) -> FirestoreResult<bool> {
        let current = txn.get_primary_lease()?;
        let can_take = match &current {
            Some(lease) if lease.owner_id == self.client_id => true,
            Some(lease) if is_lease_valid(lease, now_ms) => false,
            _ => !self.yields_to_foreground_client(txn, now_ms)?,
        };
        if !can_take {
            let exclusive = current
                .as_ref()
                .map(|lease| !lease.allow_tab_synchronization)
                .unwrap_or(false);
            if exclusive || !self.allow_tab_synchronization {
                return Err(failed_precondition(EXCLUSIVE_LEASE_MESSAGE));
            }
            return Ok(false);
        }
        txn.put_primary_lease(&PrimaryLease {
            owner_id: self.client_id.clone(),
            lease_timestamp_ms: now_ms,
            allow_tab_synchronization: self.allow_tab_synchronization,
        })?;
        Ok(true)
    }

    /// Deletes the lease when this client holds it.
    pub fn release_lease(&self, txn: &mut dyn PersistenceTransaction) -> FirestoreResult<()> {
        if let Some(lease) = txn.get_primary_lease()? {
            if lease.owner_id == self.client_id {
                txn.delete_primary_lease()?;
            }
        }
        Ok(())
    }

    /// Writes this client's metadata row and prunes rows, including batch
    /// outcomes nobody collected, not refreshed within [`MAX_CLIENT_AGE_MS`].
    /// Returns the ids of pruned clients.
    pub fn refresh_client_metadata(
        &self,
        txn: &mut dyn PersistenceTransaction,
        now_ms: i64,
        in_foreground: bool,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> FirestoreResult<Vec<String>> {
        txn.put_client_metadata(&ClientMetadata {
            client_id: self.client_id.clone(),
            update_time_ms: now_ms,
            in_foreground,
            active_target_ids: active_target_ids.clone(),
        })?;
        let mut pruned = Vec::new();
        for client in txn.get_all_client_metadata()? {
            if client.client_id != self.client_id && now_ms - client.update_time_ms > MAX_CLIENT_AGE_MS {
                txn.remove_client_metadata(&client.client_id)?;
                pruned.push(client.client_id);
            }
        }
        txn.remove_mutation_outcomes_before(now_ms - MAX_CLIENT_AGE_MS)?;
        Ok(pruned)
    }

    pub fn set_in_foreground(
        &self,
        txn: &mut dyn PersistenceTransaction,
        in_foreground: bool,
        now_ms: i64,
    ) -> FirestoreResult<()> {
        let mut metadata = txn
            .get_all_client_metadata()?
            .into_iter()
            .find(|client| client.client_id == self.client_id)
            .unwrap_or_else(|| ClientMetadata {
                client_id: self.client_id.clone(),
                update_time_ms: now_ms,
                in_foreground,
                active_target_ids: BTreeSet::new(),
            });
        metadata.in_foreground = in_foreground;
        metadata.update_time_ms = now_ms;
        txn.put_client_metadata(&metadata)
    }

    pub fn remove_client(&self, txn: &mut dyn PersistenceTransaction) -> FirestoreResult<()> {
        txn.remove_client_metadata(&self.client_id)
    }

    /// Whether any other live client still listens to `target_id`.
    pub fn is_target_active_elsewhere(
        &self,
        txn: &mut dyn PersistenceTransaction,
        target_id: TargetId,
        now_ms: i64,
    ) -> FirestoreResult<bool> {
        Ok(txn.get_all_client_metadata()?.iter().any(|client| {
            client.client_id != self.client_id
                && now_ms - client.update_time_ms <= MAX_CLIENT_AGE_MS
                && client.active_target_ids.contains(&target_id)
        }))
    }

    /// Targets other live clients listen to. The primary serves them.
    pub fn active_targets_of_other_clients(
        &self,
        txn: &mut dyn PersistenceTransaction,
        now_ms: i64,
    ) -> FirestoreResult<BTreeSet<TargetId>> {
        Ok(txn
            .get_all_client_metadata()?
            .into_iter()
            .filter(|client| client.client_id != self.client_id && now_ms - client.update_time_ms <= MAX_CLIENT_AGE_MS)
            .flat_map(|client| client.active_target_ids)
            .collect())
    }

    fn yields_to_foreground_client(
        &self,
        txn: &mut dyn PersistenceTransaction,
        now_ms: i64,
    ) -> FirestoreResult<bool> {
        let clients = txn.get_all_client_metadata()?;
        let self_in_foreground = clients
            .iter()
            .find(|client| client.client_id == self.client_id)
            .map(|client| client.in_foreground)
            .unwrap_or(true);
        if self_in_foreground {
            return Ok(false);
        }
        Ok(clients.iter().any(|client| {
            client.client_id != self.client_id
                && client.in_foreground
                && is_fresh(client.update_time_ms, now_ms, MAX_PRIMARY_AGE_MS)
        }))
    }
}

/// A lease is valid for [`MAX_PRIMARY_AGE_MS`]. A timestamp in the future
/// means a skewed clock and counts as expired.
pub fn is_lease_valid(lease: &PrimaryLease, now_ms: i64) -> bool {
    is_fresh(lease.lease_timestamp_ms, now_ms, MAX_PRIMARY_AGE_MS)
}

fn is_fresh(timestamp_ms: i64, now_ms: i64, max_age_ms: i64) -> bool {
    let age = now_ms - timestamp_ms;
    (0..max_age_ms).contains(&age)
}

/// Counter bumped by every change a secondary client must pick up.
pub fn read_change_counter(txn: &mut dyn PersistenceTransaction) -> FirestoreResult<u64> {
    txn.get_global(CHANGE_COUNTER)?
        .map(|value| {
            value
                .parse::<u64>()
                .map_err(|err| internal_error(format!("corrupt change counter: {err}")))
        })
        .transpose()
        .map(|value| value.unwrap_or(0))
}

pub fn bump_change_counter(txn: &mut dyn PersistenceTransaction) -> FirestoreResult<u64> {
    let next = read_change_counter(txn)?.wrapping_add(1);
    txn.put_global(CHANGE_COUNTER, &next.to_string())?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::memory::MemoryPersistence;
    use crate::firestore::local::persistence::Persistence;
    use std::sync::Arc;

    fn store() -> Arc<dyn Persistence> {
        Arc::new(MemoryPersistence::new())
    }

    fn acquire(persistence: &Arc<dyn Persistence>, client: &LeaseCoordinator, now: i64) -> bool {
        persistence
            .run_transaction("lease", |txn| client.try_acquire_or_extend(txn, now))
            .unwrap()
    }

    #[test]
    fn only_one_client_wins_within_the_window() {
        let persistence = store();
        let a = LeaseCoordinator::new("a", true);
        let b = LeaseCoordinator::new("b", true);
        assert!(acquire(&persistence, &a, 1_000));
        assert!(!acquire(&persistence, &b, 1_000));
        assert!(acquire(&persistence, &a, 4_000));
        assert!(!acquire(&persistence, &b, 8_999));
    }

    #[test]
    fn exclusive_lease_rejects_other_clients() {
        let persistence = store();
        let a = LeaseCoordinator::new("a", false);
        let b = LeaseCoordinator::new("b", true);
        assert!(acquire(&persistence, &a, 1_000));
        let err = persistence
            .run_transaction("lease", |txn| b.try_acquire_or_extend(txn, 1_001))
            .unwrap_err();
        assert_eq!(err.code, crate::firestore::error::FirestoreErrorCode::FailedPrecondition);
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let persistence = store();
        let a = LeaseCoordinator::new("a", true);
        let b = LeaseCoordinator::new("b", true);
        assert!(acquire(&persistence, &a, 1_000));
        assert!(!acquire(&persistence, &b, 1_000 + MAX_PRIMARY_AGE_MS - 1));
        assert!(acquire(&persistence, &b, 1_000 + MAX_PRIMARY_AGE_MS));
        assert!(!acquire(&persistence, &a, 1_001 + MAX_PRIMARY_AGE_MS));
    }

    #[test]
    fn future_lease_counts_as_expired() {
        let lease = PrimaryLease {
            owner_id: "a".into(),
            lease_timestamp_ms: 10_000,
            allow_tab_synchronization: true,
        };
        assert!(!is_lease_valid(&lease, 9_000));
        assert!(is_lease_valid(&lease, 10_000));
        assert!(!is_lease_valid(&lease, 10_000 + MAX_PRIMARY_AGE_MS));
    }

    #[test]
    fn late_renewals_keep_the_lease() {
        let refresh_ms = LEASE_REFRESH_INTERVAL.as_millis() as i64;
        assert!(MAX_PRIMARY_AGE_MS >= 3 * refresh_ms);

        let persistence = store();
        let a = LeaseCoordinator::new("a", true);
        let b = LeaseCoordinator::new("b", true);
        assert!(acquire(&persistence, &a, 0));
        // One tick a second late, then two ticks missed entirely.
        assert!(!acquire(&persistence, &b, refresh_ms + 1_000));
        assert!(!acquire(&persistence, &b, 3 * refresh_ms));
        assert!(acquire(&persistence, &a, 3 * refresh_ms + 500));
        assert!(!acquire(&persistence, &b, 3 * refresh_ms + 501));
    }

    #[test]
    fn released_lease_is_free() {
        let persistence = store();
        let a = LeaseCoordinator::new("a", true);
        let b = LeaseCoordinator::new("b", true);
        assert!(acquire(&persistence, &a, 1_000));
        persistence
            .run_transaction("release", |txn| a.release_lease(txn))
            .unwrap();
        assert!(acquire(&persistence, &b, 1_001));
    }

    #[test]
    fn background_client_yields_to_foreground_client() {
        let persistence = store();
        let fg = LeaseCoordinator::new("fg", true);
        let bg = LeaseCoordinator::new("bg", true);
        persistence
            .run_transaction("meta", |txn| {
                fg.set_in_foreground(txn, true, 1_000)?;
                bg.set_in_foreground(txn, false, 1_000)
            })
            .unwrap();
        assert!(!acquire(&persistence, &bg, 1_000));
        assert!(acquire(&persistence, &fg, 1_000));
    }

    #[test]
    fn stale_clients_are_pruned() {
        let persistence = store();
        let a = LeaseCoordinator::new("a", true);
        let b = LeaseCoordinator::new("b", true);
        let targets = BTreeSet::from([2]);
        persistence
            .run_transaction("old", |txn| b.refresh_client_metadata(txn, 0, true, &targets))
            .unwrap();
        assert!(persistence
            .run_transaction("check", |txn| a.is_target_active_elsewhere(txn, 2, 10))
            .unwrap());
        let pruned = persistence
            .run_transaction("new", |txn| {
                a.refresh_client_metadata(txn, MAX_CLIENT_AGE_MS + 1, true, &BTreeSet::new())
            })
            .unwrap();
        assert_eq!(pruned, vec!["b".to_string()]);
    }

    #[test]
    fn change_counter_increments() {
        let persistence = store();
        let value = persistence
            .run_transaction("bump", |txn| {
                bump_change_counter(txn)?;
                bump_change_counter(txn)
            })
            .unwrap();
        assert_eq!(value, 2);
    }
}
