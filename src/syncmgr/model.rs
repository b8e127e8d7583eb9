//! Stateright model of segment sync and checkpoint advancement
//!
//! Explores every interleaving of task submission, dispatch, completion,
//! external block/unblock, checkpoint requests and publication for a few
//! segments on one channel, and checks:
//! - SINGLE_HOLDER: at most one task per segment runs, never while blocked
//! - SEGMENT_FIFO: same-segment tasks finish in submission order
//! - WORKERS_BOUNDED: running tasks never exceed the pool size
//! - CHECKPOINT_FLOOR: the published checkpoint never passes an in-flight start
//! - CHECKPOINT_MONOTONIC: publications never go backwards

use stateright::{Model, Property};
use std::collections::{BTreeSet, VecDeque};

#[derive(Clone, Debug)]
pub struct SyncModelConfig {
    pub segments: usize,
    pub max_tasks: usize,
    pub parallelism: usize,
}

impl Default for SyncModelConfig {
    fn default() -> Self {
        SyncModelConfig {
            segments: 2,
            max_tasks: 3,
            parallelism: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockState {
    Free,
    Task,
    Blocked,
}

/// Task identity: start and checkpoint timestamps
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelTask {
    pub segment: usize,
    pub start_ts: u64,
    pub cp_ts: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SyncState {
    pub queues: Vec<VecDeque<ModelTask>>,
    pub locks: Vec<LockState>,
    pub running: Vec<Option<ModelTask>>,
    pub finished: Vec<Vec<u64>>,
    pub in_flight: BTreeSet<ModelTask>,
    pub submitted: usize,
    /// Latest consumed timestamp on the channel
    pub next_ts: u64,
    pub pending_cp: Option<u64>,
    pub published_cp: u64,
    pub regressed: bool,
}

impl SyncState {
    fn new(segments: usize) -> Self {
        SyncState {
            queues: vec![VecDeque::new(); segments],
            locks: vec![LockState::Free; segments],
            running: vec![None; segments],
            finished: vec![Vec::new(); segments],
            in_flight: BTreeSet::new(),
            submitted: 0,
            next_ts: 1,
            pending_cp: None,
            published_cp: 0,
            regressed: false,
        }
    }

    fn workers_busy(&self) -> usize {
        self.running.iter().filter(|r| r.is_some()).count()
    }

    /// Mirrors the write buffer: earliest in-flight start, else latest consumed
    fn safe_checkpoint(&self) -> u64 {
        self.in_flight
            .iter()
            .map(|t| t.start_ts)
            .min()
            .unwrap_or(self.next_ts)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SyncAction {
    Submit(usize),
    Start(usize),
    Finish(usize),
    Block(usize),
    Unblock(usize),
    RequestCheckpoint,
    Publish,
}

pub struct SyncModel {
    pub config: SyncModelConfig,
}

impl SyncModel {
    pub fn new(config: SyncModelConfig) -> Self {
        SyncModel { config }
    }
}

impl Model for SyncModel {
    type State = SyncState;
    type Action = SyncAction;

    fn init_states(&self) -> Vec<Self::State> {
        vec![SyncState::new(self.config.segments)]
    }

    fn actions(&self, state: &Self::State, actions: &mut Vec<Self::Action>) {
        for seg in 0..self.config.segments {
            if state.submitted < self.config.max_tasks {
                actions.push(SyncAction::Submit(seg));
            }
            if state.locks[seg] == LockState::Free
                && !state.queues[seg].is_empty()
                && state.workers_busy() < self.config.parallelism
            {
                actions.push(SyncAction::Start(seg));
            }
            if state.running[seg].is_some() {
                actions.push(SyncAction::Finish(seg));
            }
            match state.locks[seg] {
                LockState::Free => actions.push(SyncAction::Block(seg)),
                LockState::Blocked => actions.push(SyncAction::Unblock(seg)),
                LockState::Task => {}
            }
        }
        actions.push(SyncAction::RequestCheckpoint);
        if state.pending_cp.is_some() {
            actions.push(SyncAction::Publish);
        }
    }

    fn next_state(&self, state: &Self::State, action: Self::Action) -> Option<Self::State> {
        let mut next = state.clone();
        match action {
            SyncAction::Submit(seg) => {
                let task = ModelTask {
                    segment: seg,
                    start_ts: next.next_ts,
                    cp_ts: next.next_ts + 1,
                };
                next.next_ts += 2;
                next.submitted += 1;
                next.in_flight.insert(task);
                next.queues[seg].push_back(task);
            }
            SyncAction::Start(seg) => {
                let task = next.queues[seg].pop_front()?;
                next.locks[seg] = LockState::Task;
                next.running[seg] = Some(task);
            }
            SyncAction::Finish(seg) => {
                let task = next.running[seg].take()?;
                next.in_flight.remove(&task);
                next.finished[seg].push(task.cp_ts);
                next.locks[seg] = LockState::Free;
            }
            SyncAction::Block(seg) => {
                if next.locks[seg] != LockState::Free {
                    return None;
                }
                next.locks[seg] = LockState::Blocked;
            }
            SyncAction::Unblock(seg) => {
                if next.locks[seg] != LockState::Blocked {
                    return None;
                }
                next.locks[seg] = LockState::Free;
            }
            SyncAction::RequestCheckpoint => {
                let cp = next.safe_checkpoint();
                if cp <= next.published_cp {
                    return None;
                }
                match next.pending_cp {
                    Some(pending) if pending >= cp => return None,
                    _ => next.pending_cp = Some(cp),
                }
            }
            SyncAction::Publish => {
                let cp = next.pending_cp.take()?;
                if cp < next.published_cp {
                    next.regressed = true;
                }
                next.published_cp = cp;
            }
        }
        Some(next)
    }

    fn properties(&self) -> Vec<Property<Self>> {
        vec![
            Property::always("single_holder", |_: &SyncModel, state: &SyncState| {
                state
                    .running
                    .iter()
                    .zip(&state.locks)
                    .all(|(running, lock)| running.is_none() || *lock == LockState::Task)
            }),
            Property::always("segment_fifo", |_: &SyncModel, state: &SyncState| {
                state
                    .finished
                    .iter()
                    .all(|done| done.windows(2).all(|w| w[0] < w[1]))
            }),
            Property::always("workers_bounded", |model: &SyncModel, state: &SyncState| {
                state.workers_busy() <= model.config.parallelism
            }),
            Property::always("checkpoint_floor", |_: &SyncModel, state: &SyncState| {
                state
                    .in_flight
                    .iter()
                    .all(|t| state.published_cp <= t.start_ts)
            }),
            Property::always("checkpoint_monotonic", |_: &SyncModel, state: &SyncState| {
                !state.regressed
            }),
            Property::sometimes("all_synced_and_published", |model: &SyncModel, state: &SyncState| {
                state.submitted == model.config.max_tasks
                    && state.in_flight.is_empty()
                    && state.published_cp == state.next_ts
            }),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stateright::Checker;

    fn apply(model: &SyncModel, state: SyncState, actions: &[SyncAction]) -> SyncState {
        actions.iter().fold(state, |s, a| {
            model
                .next_state(&s, a.clone())
                .unwrap_or_else(|| panic!("action {:?} not enabled", a))
        })
    }

    #[test]
    fn test_blocked_segment_cannot_start() {
        let model = SyncModel::new(SyncModelConfig::default());
        let state = apply(
            &model,
            SyncState::new(2),
            &[SyncAction::Block(0), SyncAction::Submit(0)],
        );

        let mut actions = Vec::new();
        model.actions(&state, &mut actions);
        assert!(!actions.contains(&SyncAction::Start(0)));

        let state = apply(&model, state, &[SyncAction::Unblock(0), SyncAction::Start(0)]);
        assert_eq!(state.locks[0], LockState::Task);
    }

    #[test]
    fn test_checkpoint_held_by_in_flight_task() {
        let model = SyncModel::new(SyncModelConfig::default());
        let state = apply(
            &model,
            SyncState::new(2),
            &[
                SyncAction::Submit(0),
                SyncAction::Submit(1),
                SyncAction::RequestCheckpoint,
                SyncAction::Publish,
            ],
        );
        assert_eq!(state.published_cp, 1);

        let state = apply(
            &model,
            state,
            &[
                SyncAction::Start(0),
                SyncAction::Finish(0),
                SyncAction::RequestCheckpoint,
                SyncAction::Publish,
            ],
        );
        // Segment 1's task started at ts 3
        assert_eq!(state.published_cp, 3);
    }

    #[test]
    fn test_small_model_check() {
        let model = SyncModel::new(SyncModelConfig {
            segments: 2,
            max_tasks: 2,
            parallelism: 1,
        });
        model.checker().spawn_bfs().join().assert_properties();
    }

    #[test]
    #[ignore] // Run with: cargo test sync_model -- --ignored --nocapture
    fn stateright_sync_model_check() {
        let model = SyncModel::new(SyncModelConfig {
            segments: 2,
            max_tasks: 4,
            parallelism: 2,
        });
        let checker = model.checker().spawn_bfs().join();
        println!("States explored: {}", checker.unique_state_count());
        checker.assert_properties();
    }
}
