//! Live view of the peer set and the relay-tree shape derived from it.
//!
//! Every peer maintains the same membership snapshot from the discovery
//! stream and sorts it identically (leader first, then relays, then
//! schedulers, lexicographic within a role). Two things hang off that
//! shared order: the score-aggregation target for a pod key, and this
//! peer's slice of the fan-out tree.

mod slice_cache;

pub use slice_cache::{Endpoint, EndpointEvent, EndpointSlice, SliceCache};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use tokio::sync::watch;

use crate::config::RELAY_PREFIX;

/// 32-bit FNV-1a. Shared by the scoring-target hash and the log sampler;
/// must agree on every peer for a given key.
pub fn fnv1a_32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in data {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

pub struct MemberSet {
    cache: SliceCache,
    pod_name: String,
    fan_out: usize,
    allow_solo: bool,
    leader: RwLock<String>,
    sub_members: RwLock<Vec<Endpoint>>,
    /// Set on membership or leader change; the next `sub_members()` caller
    /// rebuilds the cached slice.
    dirty: AtomicBool,
    epoch: watch::Sender<u64>,
}

impl MemberSet {
    pub fn new(pod_name: impl Into<String>, fan_out: usize, allow_solo: bool) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            cache: SliceCache::new(),
            pod_name: pod_name.into(),
            fan_out: fan_out.max(1),
            allow_solo,
            leader: RwLock::new(String::new()),
            sub_members: RwLock::new(Vec::new()),
            dirty: AtomicBool::new(true),
            epoch,
        }
    }

    pub fn pod_name(&self) -> &str {
        &self.pod_name
    }

    pub fn is_relay(pod_name: &str) -> bool {
        pod_name.starts_with(RELAY_PREFIX)
    }

    /// Apply one discovery event. Redundant re-deliveries (same slice
    /// generation) do not disturb subscribers.
    pub fn ingest(&self, event: EndpointEvent) {
        let changed = match event {
            EndpointEvent::Applied(slice) => self.cache.apply(slice),
            EndpointEvent::Removed(name) => self.cache.remove(&name),
        };
        if changed {
            self.mark_changed();
        }
    }

    /// Subscribe to membership epochs. The value only ever increases; a
    /// change means the snapshot (or leader) moved.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }

    fn mark_changed(&self) {
        self.dirty.store(true, Ordering::Release);
        self.epoch.send_modify(|epoch| *epoch += 1);
    }

    pub fn member_count(&self) -> usize {
        let count = self.cache.member_count();
        if count == 0 && self.allow_solo {
            return 1;
        }
        count
    }

    pub fn member_count_no_relays(&self) -> usize {
        let count = self
            .cache
            .members()
            .iter()
            .filter(|m| !Self::is_relay(&m.pod_name))
            .count();
        if count == 0 && self.allow_solo {
            return 1;
        }
        count
    }

    /// All members; in solo mode an empty set is replaced by a loopback
    /// entry for this peer.
    pub fn members(&self) -> Vec<Endpoint> {
        let members = self.cache.members();
        if members.is_empty() && self.allow_solo {
            return vec![Endpoint::new(self.pod_name.clone(), "127.0.0.1")];
        }
        members
    }

    pub fn leader(&self) -> String {
        self.leader.read().unwrap().clone()
    }

    /// Record the elected leader. The relay tree is rooted at the leader,
    /// so any change invalidates the cached topology.
    pub fn set_leader(&self, leader: &str) {
        {
            let mut current = self.leader.write().unwrap();
            if *current == leader {
                return;
            }
            *current = leader.to_string();
        }
        self.mark_changed();
    }

    /// (role rank, name) key realizing the cluster-wide order: leader, then
    /// relays, then schedulers, lexicographic within each role.
    fn sort_key<'a>(&self, pod_name: &'a str, leader: &str) -> (u8, &'a str) {
        if pod_name == leader {
            (0, pod_name)
        } else if Self::is_relay(pod_name) {
            (1, pod_name)
        } else {
            (2, pod_name)
        }
    }

    fn sort_members(&self, members: &mut [Endpoint]) {
        let leader = self.leader();
        members.sort_by(|a, b| {
            self.sort_key(&a.pod_name, &leader)
                .cmp(&self.sort_key(&b.pod_name, &leader))
        });
    }

    /// Members in the shared cluster-wide order.
    pub fn sorted_members(&self) -> Vec<Endpoint> {
        let mut members = self.members();
        self.sort_members(&mut members);
        members
    }

    /// The endpoint responsible for aggregating scores for `key`. Every
    /// peer computing this against the same snapshot gets the same answer.
    pub fn target_for_scoring(&self, key: &str) -> Option<Endpoint> {
        let members = self.members();
        match members.len() {
            0 => None,
            1 => members.into_iter().next(),
            len => {
                let mut members = members;
                self.sort_members(&mut members);
                let index = fnv1a_32(key.as_bytes()) as usize % len;
                Some(members.swap_remove(index))
            }
        }
    }

    /// This peer's downstream fan-out list: the k-ary slice rooted at its
    /// index in the sorted snapshot. Cached until membership or leader
    /// changes.
    pub fn sub_members(&self) -> Vec<Endpoint> {
        if !self.dirty.load(Ordering::Acquire) {
            return self.sub_members.read().unwrap().clone();
        }

        let mut cached = self.sub_members.write().unwrap();
        self.dirty.store(false, Ordering::Release);

        let subs = self.compute_sub_members();
        if !subs.is_empty() {
            tracing::info!(
                pod = %self.pod_name,
                sub_members = ?subs.iter().map(|m| m.pod_name.as_str()).collect::<Vec<_>>(),
                "relay sub-members updated"
            );
        }
        *cached = subs.clone();
        subs
    }

    fn compute_sub_members(&self) -> Vec<Endpoint> {
        let mut members = self.cache.members();
        if members.len() <= 1 {
            return Vec::new();
        }
        self.sort_members(&mut members);

        let index = if self.leader() == self.pod_name {
            0
        } else {
            match members.iter().position(|m| m.pod_name == self.pod_name) {
                Some(index) => index,
                // Not in the snapshot yet; relay nothing rather than
                // relaying some other peer's slice.
                None => return Vec::new(),
            }
        };

        let start = index * self.fan_out + 1;
        if start >= members.len() {
            return Vec::new();
        }
        let end = (start + self.fan_out).min(members.len());
        members[start..end].to_vec()
    }
}
