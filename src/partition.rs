//! Node partitioning (leader only).
//!
//! The leader keeps every node labeled with the scheduler peer that owns
//! it, so each peer filters and scores only its share of the inventory.
//! Planning is a pure function over the current labels; applying is a
//! bounded-concurrency patch storm. Nodes already in a group that is not
//! over its target stay put, so membership churn moves as few nodes as
//! possible.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cluster::{LabelPatcher, NodeInventory, NodeMeta};
use crate::membership::MemberSet;

/// Concurrent label patches in flight during one rebalance.
const PATCH_PARALLELISM: usize = 1000;

/// Compute the label moves needed to balance `nodes` across `groups`.
///
/// Guarantees, given a non-empty `groups`:
/// - every returned move targets a group below `ceil(nodes/groups)`;
/// - after applying, no group exceeds `ceil(nodes/groups)`;
/// - nodes whose current group is valid and not over target never move.
pub fn plan_partitions(nodes: &[NodeMeta], groups: &[String]) -> Vec<(String, String)> {
    if groups.is_empty() {
        return Vec::new();
    }
    let desired = nodes.len().div_ceil(groups.len());

    let mut counts: HashMap<&str, usize> = groups.iter().map(|g| (g.as_str(), 0)).collect();
    let mut to_move: Vec<&NodeMeta> = Vec::new();
    for node in nodes {
        match node.group.as_deref().and_then(|g| counts.get_mut(g)) {
            Some(count) if *count < desired => *count += 1,
            _ => to_move.push(node),
        }
    }
    if to_move.is_empty() {
        return Vec::new();
    }

    let mut short_groups: Vec<&str> = groups
        .iter()
        .map(String::as_str)
        .filter(|group| counts[group] < desired)
        .collect();

    let mut moves = Vec::with_capacity(to_move.len());
    let mut cursor = 0usize;
    for node in to_move {
        if short_groups.is_empty() {
            break;
        }
        let index = cursor % short_groups.len();
        let group = short_groups[index];
        *counts.get_mut(group).unwrap() += 1;
        moves.push((node.name.clone(), group.to_string()));
        if counts[group] >= desired {
            // The group just filled: drop it and keep the cursor where the
            // next group slid into place.
            short_groups.remove(index);
            if !short_groups.is_empty() {
                cursor = index % short_groups.len();
            }
        } else {
            cursor = index + 1;
        }
    }
    moves
}

pub struct NodePartitioner {
    members: Arc<MemberSet>,
    inventory: Arc<dyn NodeInventory>,
    patcher: Arc<dyn LabelPatcher>,
    min_interval: Duration,
}

impl NodePartitioner {
    pub fn new(
        members: Arc<MemberSet>,
        inventory: Arc<dyn NodeInventory>,
        patcher: Arc<dyn LabelPatcher>,
        min_interval: Duration,
    ) -> Self {
        Self {
            members,
            inventory,
            patcher,
            min_interval,
        }
    }

    /// Drive rebalances until cancelled: promptly on membership or
    /// inventory change when the minimum interval has passed, otherwise on
    /// the next tick.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("node partitioner started");
        let mut member_epochs = self.members.subscribe();
        let mut inventory_epochs = self.inventory.watch();
        let mut ticker = tokio::time::interval(self.min_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // immediate first tick

        self.rebalance().await;
        let mut last_run = Instant::now();
        let mut dirty = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("node partitioner stopped");
                    return;
                }
                _ = ticker.tick() => {}
                changed = member_epochs.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    dirty = true;
                }
                changed = inventory_epochs.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    dirty = true;
                }
            }

            if dirty && last_run.elapsed() >= self.min_interval {
                dirty = false;
                self.rebalance().await;
                last_run = Instant::now();
            }
        }
    }

    pub async fn rebalance(&self) {
        let groups: Vec<String> = self
            .members
            .members()
            .into_iter()
            .filter(|member| !MemberSet::is_relay(&member.pod_name))
            .map(|member| member.pod_name)
            .collect();
        if groups.is_empty() {
            tracing::info!("no scheduler peers, skipping node partitioning");
            return;
        }

        let nodes = self.inventory.nodes().await;
        let moves = plan_partitions(&nodes, &groups);
        if moves.is_empty() {
            tracing::debug!(nodes = nodes.len(), groups = groups.len(), "partitions already balanced");
            return;
        }

        let patcher = &self.patcher;
        let moved = stream::iter(moves)
            .map(|(node, group)| async move {
                match patcher.set_group(&node, &group).await {
                    Ok(()) => 1usize,
                    Err(err) => {
                        tracing::warn!(node = %node, group = %group, error = %err, "node label patch failed");
                        0
                    }
                }
            })
            .buffer_unordered(PATCH_PARALLELISM)
            .fold(0usize, |total, n| async move { total + n })
            .await;
        tracing::info!(moved, nodes = nodes.len(), groups = groups.len(), "node partitions updated");
    }
}
