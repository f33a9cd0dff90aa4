//! Per-pod score aggregation.
//!
//! For each pod key, the peer that owns the key (see
//! `MemberSet::target_for_scoring`) collects one score from every scheduler
//! peer and picks a single winner at the earlier of quorum or a deadline.
//! Every caller for the key observes the same winner; at most one caller is
//! granted the permit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::watch;

use crate::membership::MemberSet;

/// Ties beyond this many candidates are broken among the first 100 only,
/// keeping evaluator memory bounded at large cluster sizes.
const MAX_TIE_CANDIDATES: usize = 100;

/// One peer's best score for a pod. Score 0 is the "not schedulable here"
/// sentinel; it is recorded but can never beat a positive score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Score {
    pub node_name: String,
    pub score: i64,
}

/// Result of registering a score: the winning score for the key and
/// whether this caller holds the (unique) permit.
#[derive(Debug, Clone)]
pub struct ScoreOutcome {
    pub winner: Score,
    pub permit: bool,
}

#[derive(Debug)]
struct EvaluatorState {
    limit: usize,
    scores: Vec<Score>,
    fired: bool,
    start: Instant,
}

#[derive(Debug)]
struct Evaluator {
    state: Mutex<EvaluatorState>,
    winner: watch::Sender<Option<Score>>,
    /// Only the first waiter whose node matches the winner is permitted.
    granted: AtomicBool,
}

impl Evaluator {
    fn new(limit: usize) -> Self {
        let (winner, _) = watch::channel(None);
        Self {
            state: Mutex::new(EvaluatorState {
                limit,
                scores: Vec::new(),
                fired: false,
                start: Instant::now(),
            }),
            winner,
            granted: AtomicBool::new(false),
        }
    }

    async fn wait_winner(&self) -> Score {
        let mut rx = self.winner.subscribe();
        let winner = rx
            .wait_for(|winner| winner.is_some())
            .await
            .expect("evaluator outlives its waiters");
        winner.clone().expect("waited for Some")
    }
}

enum FireReason {
    Quorum,
    Deadline,
}

pub struct ScoreBoard {
    evaluators: Mutex<HashMap<String, Arc<Evaluator>>>,
    members: Arc<MemberSet>,
    deadline: Duration,
}

impl ScoreBoard {
    pub fn new(members: Arc<MemberSet>, deadline: Duration) -> Self {
        Self {
            evaluators: Mutex::new(HashMap::new()),
            members,
            deadline,
        }
    }

    /// Register `score` for `key` and wait for the winner. The evaluator is
    /// created lazily on the first score for a key and garbage-collected
    /// when it fires.
    pub async fn record_and_wait(self: &Arc<Self>, key: &str, score: Score) -> ScoreOutcome {
        let evaluator = {
            let mut table = self.evaluators.lock().unwrap();
            match table.get(key) {
                Some(evaluator) => evaluator.clone(),
                None => {
                    let limit = self.members.member_count_no_relays();
                    let evaluator = Arc::new(Evaluator::new(limit));
                    table.insert(key.to_string(), evaluator.clone());
                    self.arm_deadline(key.to_string(), evaluator.clone());
                    evaluator
                }
            }
        };

        let node_name = score.node_name.clone();
        let at_quorum = {
            let mut state = evaluator.state.lock().unwrap();
            state.scores.push(score);
            !state.fired && state.scores.len() >= state.limit.max(1)
        };
        if at_quorum {
            self.fire(key, &evaluator, FireReason::Quorum);
        }

        let winner = evaluator.wait_winner().await;
        let permit =
            winner.node_name == node_name && !evaluator.granted.swap(true, Ordering::SeqCst);
        ScoreOutcome { winner, permit }
    }

    fn arm_deadline(self: &Arc<Self>, key: String, evaluator: Arc<Evaluator>) {
        let board = Arc::clone(self);
        let deadline = self.deadline;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            board.fire(&key, &evaluator, FireReason::Deadline);
        });
    }

    /// Choose the winner and wake every waiter. Runs at most once per
    /// evaluator, whichever of quorum or deadline trips first.
    fn fire(&self, key: &str, evaluator: &Arc<Evaluator>, reason: FireReason) {
        let (winner, score_count, elapsed) = {
            let mut state = evaluator.state.lock().unwrap();
            if state.fired {
                return;
            }
            state.fired = true;
            (
                pick_winner(&state.scores),
                state.scores.len(),
                state.start.elapsed(),
            )
        };

        self.evaluators.lock().unwrap().remove(key);

        tracing::info!(
            key,
            winner = %winner.node_name,
            winning_score = winner.score,
            score_count,
            elapsed_ms = elapsed.as_millis() as u64,
            reason = match reason {
                FireReason::Quorum => "quorum",
                FireReason::Deadline => "deadline",
            },
            "score evaluation fired"
        );
        let _ = evaluator.winner.send(Some(winner));
    }

    #[cfg(test)]
    pub fn open_evaluators(&self) -> usize {
        self.evaluators.lock().unwrap().len()
    }
}

/// Highest score wins; ties are broken uniformly among the (capped)
/// candidate set.
fn pick_winner(scores: &[Score]) -> Score {
    let mut max_score = i64::MIN;
    let mut candidates: Vec<&Score> = Vec::new();
    for score in scores {
        if score.score > max_score {
            max_score = score.score;
            candidates.clear();
            candidates.push(score);
        } else if score.score == max_score && candidates.len() < MAX_TIE_CANDIDATES {
            candidates.push(score);
        }
    }
    match candidates.len() {
        // A deadline can beat the first score in; nobody wins.
        0 => Score {
            node_name: String::new(),
            score: 0,
        },
        1 => candidates[0].clone(),
        len => candidates[rand::thread_rng().gen_range(0..len)].clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{Endpoint, EndpointEvent, EndpointSlice};
    use std::time::Duration;

    fn members(names: &[&str]) -> Arc<MemberSet> {
        let set = MemberSet::new(names.first().copied().unwrap_or("p"), 10, true);
        if !names.is_empty() {
            set.ingest(EndpointEvent::Applied(EndpointSlice {
                name: "peers-1".to_string(),
                generation: 1,
                endpoints: names
                    .iter()
                    .map(|name| Endpoint::new(*name, "127.0.0.1"))
                    .collect(),
            }));
        }
        Arc::new(set)
    }

    fn score(node: &str, value: i64) -> Score {
        Score {
            node_name: node.to_string(),
            score: value,
        }
    }

    #[tokio::test]
    async fn quorum_fires_with_highest_score() {
        let board = Arc::new(ScoreBoard::new(
            members(&["swarm-sched-a", "swarm-sched-b"]),
            Duration::from_secs(5),
        ));

        let first = {
            let board = board.clone();
            tokio::spawn(async move { board.record_and_wait("default/p", score("n1", 7)).await })
        };
        // Give the first waiter time to register before quorum completes.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = board.record_and_wait("default/p", score("n2", 5)).await;
        let first = first.await.unwrap();

        assert_eq!(first.winner, score("n1", 7));
        assert_eq!(second.winner, score("n1", 7));
        assert!(first.permit);
        assert!(!second.permit);
        assert_eq!(board.open_evaluators(), 0);
    }

    #[tokio::test]
    async fn permit_is_granted_at_most_once_for_equal_scores() {
        let board = Arc::new(ScoreBoard::new(
            members(&["swarm-sched-a", "swarm-sched-b"]),
            Duration::from_secs(5),
        ));

        // Both peers report the same node with the same score.
        let first = {
            let board = board.clone();
            tokio::spawn(async move { board.record_and_wait("default/p", score("n1", 7)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = board.record_and_wait("default/p", score("n1", 7)).await;
        let first = first.await.unwrap();

        assert_eq!(
            [first.permit, second.permit].iter().filter(|p| **p).count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fires_with_partial_scores() {
        let board = Arc::new(ScoreBoard::new(
            members(&["swarm-sched-a", "swarm-sched-b", "swarm-sched-c"]),
            Duration::from_secs(5),
        ));

        let started = tokio::time::Instant::now();
        let waiter = {
            let board = board.clone();
            tokio::spawn(async move { board.record_and_wait("default/p", score("n1", 3)).await })
        };
        let outcome = waiter.await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(outcome.winner, score("n1", 3));
        assert!(outcome.permit);
        assert_eq!(board.open_evaluators(), 0);
    }

    #[tokio::test]
    async fn zero_scores_cannot_beat_a_positive_score() {
        let board = Arc::new(ScoreBoard::new(
            members(&["swarm-sched-a", "swarm-sched-b"]),
            Duration::from_secs(5),
        ));

        let zero = {
            let board = board.clone();
            tokio::spawn(async move { board.record_and_wait("default/p", score("", 0)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let positive = board.record_and_wait("default/p", score("n1", 1)).await;
        let zero = zero.await.unwrap();

        assert_eq!(positive.winner, score("n1", 1));
        assert!(positive.permit);
        assert!(!zero.permit);
    }

    #[tokio::test]
    async fn solo_mode_fires_on_single_score() {
        let board = Arc::new(ScoreBoard::new(members(&[]), Duration::from_secs(5)));
        let outcome = board.record_and_wait("default/p", score("n1", 9)).await;
        assert_eq!(outcome.winner, score("n1", 9));
        assert!(outcome.permit);
    }

    #[tokio::test]
    async fn separate_keys_use_separate_evaluators() {
        let board = Arc::new(ScoreBoard::new(members(&["swarm-sched-a"]), Duration::from_secs(5)));
        let a = board.record_and_wait("default/a", score("n1", 2)).await;
        let b = board.record_and_wait("default/b", score("n2", 4)).await;
        assert_eq!(a.winner, score("n1", 2));
        assert_eq!(b.winner, score("n2", 4));
        assert!(a.permit && b.permit);
    }
}
