//! Batched PUCT self-play scheduler: a producer/consumer pipeline that
//! multiplexes `batch_size * num_sectors` independent [`TreeEngine`]s
//! through an external batched evaluator, one sector of `batch_size` at a
//! time.
//!
//! Protocol: the host calls [`BatchedScheduler::select`], which blocks
//! until the upcoming sector's slot is idle, then returns owned clones of
//! that sector's board/metadata rows for the host to hand to its
//! evaluator. The host calls [`BatchedScheduler::update`] with the
//! evaluator's `(q, policy)` output, which publishes the sector and
//! returns immediately; a dedicated consumer thread picks it up, spawns an
//! ephemeral worker pool over disjoint contiguous engine sub-ranges (no
//! per-engine locking needed — `thread::scope` + `split_at_mut` prove the
//! ranges are disjoint to the borrow checker), and marks the sector idle
//! again once every worker has applied its engine's `update` followed
//! immediately by the next `select`.

use std::path::PathBuf;
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info};

use super::error::SchedulerError;
use super::mcts::TreeEngine;
use super::position::{BoardTensor, MetadataTensor};
use super::record::PolicyTensor;

struct EngineSlot {
    engine: TreeEngine,
    board: BoardTensor,
    metadata: MetadataTensor,
}

/// A sector awaiting (or mid-) consumption. `sector < 0` means idle.
struct WorkingSector {
    sector: i64,
    q: Vec<f32>,
    policy: Vec<PolicyTensor>,
}

struct State {
    slots: Vec<EngineSlot>,
    working: Vec<WorkingSector>,
    cur_sector: usize,
    alive: bool,
}

struct Shared {
    cpuct: f32,
    batch_size: usize,
    num_sectors: usize,
    num_threads: usize,
    state: Mutex<State>,
    queue_add: Condvar,
    queue_remove: Condvar,
}

pub struct BatchedScheduler {
    shared: std::sync::Arc<Shared>,
    consumer: Option<thread::JoinHandle<()>>,
}

impl BatchedScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sims_per_move: u64,
        temperature: f32,
        autoplay: bool,
        output_prefix: Option<&str>,
        num_threads: usize,
        batch_size: usize,
        num_sectors: usize,
        cpuct: f32,
    ) -> Result<Self, SchedulerError> {
        if batch_size == 0 {
            return Err(SchedulerError::EmptyBatch);
        }
        if num_sectors == 0 {
            return Err(SchedulerError::EmptySectors);
        }
        if sims_per_move == 0 {
            return Err(SchedulerError::EmptySimBudget);
        }
        if num_threads == 0 {
            return Err(SchedulerError::EmptyThreadCount);
        }

        let total = batch_size * num_sectors;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the unix epoch")
            .as_nanos();

        let mut slots = Vec::with_capacity(total);
        for i in 0..total {
            let output_base = output_prefix.map(|prefix| PathBuf::from(format!("{prefix}_{i}_{timestamp}")));
            let mut engine = TreeEngine::new(sims_per_move, temperature, autoplay, output_base);
            let mut board: BoardTensor = [[0; 8]; 8];
            let mut metadata: MetadataTensor = [0; 5];
            engine.select(cpuct, &mut board, &mut metadata);
            slots.push(EngineSlot { engine, board, metadata });
        }

        let working = (0..num_sectors).map(|_| WorkingSector { sector: -1, q: Vec::new(), policy: Vec::new() }).collect();

        let shared = std::sync::Arc::new(Shared {
            cpuct,
            batch_size,
            num_sectors,
            num_threads,
            state: Mutex::new(State { slots, working, cur_sector: 0, alive: true }),
            queue_add: Condvar::new(),
            queue_remove: Condvar::new(),
        });

        let consumer_shared = std::sync::Arc::clone(&shared);
        let consumer = thread::spawn(move || consumer_loop(consumer_shared));

        info!("batched scheduler started: {total} engines over {num_sectors} sectors of {batch_size}");

        Ok(BatchedScheduler { shared, consumer: Some(consumer) })
    }

    /// Blocks until the upcoming sector is idle, then returns owned clones
    /// of its board/metadata rows for the host to evaluate.
    pub fn select(&self) -> Vec<(BoardTensor, MetadataTensor)> {
        let mut guard = self.shared.state.lock().unwrap();
        let cur = guard.cur_sector;
        while guard.working[cur].sector >= 0 {
            guard = self.shared.queue_remove.wait(guard).unwrap();
        }
        let start = cur * self.shared.batch_size;
        let end = start + self.shared.batch_size;
        guard.slots[start..end].iter().map(|s| (s.board, s.metadata)).collect()
    }

    /// Publishes `(q, policy)` for the current sector and advances to the
    /// next one. Returns immediately; the consumer thread does the work.
    ///
    /// `q` and `policy` must remain meaningful until the scheduler has had
    /// `num_sectors` further `update` calls — in this owned-value design
    /// that just means not reusing the vectors, since ownership transfers.
    pub fn update(&self, q: Vec<f32>, policy: Vec<PolicyTensor>) {
        assert_eq!(q.len(), self.shared.batch_size, "q must have one entry per engine in the sector");
        assert_eq!(policy.len(), self.shared.batch_size, "policy must have one tensor per engine in the sector");

        let mut guard = self.shared.state.lock().unwrap();
        let cur = guard.cur_sector;
        guard.working[cur] = WorkingSector { sector: cur as i64, q, policy };
        guard.cur_sector = (cur + 1) % self.shared.num_sectors;
        drop(guard);
        self.shared.queue_add.notify_all();
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, State> {
        let mut guard = self.shared.state.lock().unwrap();
        while guard.working.iter().any(|w| w.sector >= 0) {
            guard = self.shared.queue_remove.wait(guard).unwrap();
        }
        guard
    }

    /// Forces every engine to sample and play its best move immediately
    /// (bypassing the sim budget), undoing any pending selection first.
    /// Blocks until no sector is mid-processing.
    pub fn play_best_moves(&self, reset: bool) {
        let mut guard = self.lock_idle();
        let cpuct = self.shared.cpuct;
        for slot in guard.slots.iter_mut() {
            slot.engine.undo_select();
            if reset {
                slot.engine.play_best_move_and_reset();
            } else {
                slot.engine.play_best_move();
            }
            slot.engine.select(cpuct, &mut slot.board, &mut slot.metadata);
        }
    }

    pub fn set_temperature(&self, temperature: f32) {
        let mut guard = self.lock_idle();
        for slot in guard.slots.iter_mut() {
            slot.engine.set_temperature(temperature);
        }
    }

    pub fn all_games_over(&self) -> bool {
        let guard = self.lock_idle();
        guard.slots.iter().all(|s| s.engine.is_over())
    }

    pub fn proportion_of_games_over(&self) -> f64 {
        let guard = self.lock_idle();
        let over = guard.slots.iter().filter(|s| s.engine.is_over()).count();
        over as f64 / guard.slots.len() as f64
    }

    pub fn results(&self) -> Vec<i32> {
        let guard = self.lock_idle();
        guard.slots.iter().map(|s| s.engine.terminal_evaluation()).collect()
    }

    pub fn current_sector(&self) -> usize {
        self.shared.state.lock().unwrap().cur_sector
    }

    /// Per-engine current root visit counts. Diagnostic only; used by this
    /// crate's own scheduler tests to check throughput without a real
    /// evaluator.
    pub fn sim_counts(&self) -> Vec<u64> {
        let guard = self.lock_idle();
        guard.slots.iter().map(|s| s.engine.current_sims()).collect()
    }

    pub fn num_engines(&self) -> usize {
        self.shared.batch_size * self.shared.num_sectors
    }
}

impl Drop for BatchedScheduler {
    fn drop(&mut self) {
        {
            let mut guard = self.shared.state.lock().unwrap();
            guard.alive = false;
        }
        self.shared.queue_add.notify_all();
        if let Some(handle) = self.consumer.take() {
            handle.join().expect("scheduler consumer thread panicked");
        }
    }
}

fn find_working_sector(working: &[WorkingSector], cur_sector: usize) -> Option<usize> {
    let n = working.len();
    (0..n).map(|i| (cur_sector + i) % n).find(|&j| working[j].sector >= 0)
}

fn consumer_loop(shared: std::sync::Arc<Shared>) {
    loop {
        let mut guard = shared.state.lock().unwrap();
        let sector_idx = loop {
            if !guard.alive {
                return;
            }
            if let Some(idx) = find_working_sector(&guard.working, guard.cur_sector) {
                break idx;
            }
            guard = shared.queue_add.wait(guard).unwrap();
        };

        let sector = guard.working[sector_idx].sector as usize;
        let q = std::mem::take(&mut guard.working[sector_idx].q);
        let policy = std::mem::take(&mut guard.working[sector_idx].policy);
        debug!("consuming sector {sector}");

        update_sector(&shared, &mut guard, sector, &q, &policy);

        guard.working[sector_idx].sector = -1;
        drop(guard);
        shared.queue_remove.notify_all();
    }
}

/// Runs `e.update(q[i], policy[i])` then `e.select(...)` for every engine
/// in `sector`, spread across `num_threads` workers each covering a
/// disjoint contiguous sub-range.
fn update_sector(shared: &Shared, state: &mut State, sector: usize, q: &[f32], policy: &[PolicyTensor]) {
    let start = sector * shared.batch_size;
    let end = start + shared.batch_size;
    let total = end - start;
    let num_threads = shared.num_threads.min(total).max(1);
    let cpuct = shared.cpuct;

    thread::scope(|scope| {
        let mut rest_slots = &mut state.slots[start..end];
        let mut rest_q = q;
        let mut rest_policy = policy;
        for t in 0..num_threads {
            let chunk_start = t * total / num_threads;
            let chunk_end = (t + 1) * total / num_threads;
            let len = chunk_end - chunk_start;

            let (chunk, remaining_slots) = rest_slots.split_at_mut(len);
            rest_slots = remaining_slots;
            let (q_chunk, remaining_q) = rest_q.split_at(len);
            rest_q = remaining_q;
            let (policy_chunk, remaining_policy) = rest_policy.split_at(len);
            rest_policy = remaining_policy;

            scope.spawn(move || {
                for ((slot, &qv), pv) in chunk.iter_mut().zip(q_chunk.iter()).zip(policy_chunk.iter()) {
                    slot.engine.update(qv, pv);
                    slot.engine.select(cpuct, &mut slot.board, &mut slot.metadata);
                }
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_policy() -> PolicyTensor {
        [[[0.0f32; super::super::policy::NUM_PLANES]; 8]; 8]
    }

    #[test]
    fn construction_rejects_empty_configuration() {
        assert!(matches!(
            BatchedScheduler::new(0, 1.0, false, None, 1, 1, 1, 1.0),
            Err(SchedulerError::EmptySimBudget)
        ));
        assert!(matches!(
            BatchedScheduler::new(10, 1.0, false, None, 1, 0, 1, 1.0),
            Err(SchedulerError::EmptyBatch)
        ));
        assert!(matches!(
            BatchedScheduler::new(10, 1.0, false, None, 1, 1, 0, 1.0),
            Err(SchedulerError::EmptySectors)
        ));
        assert!(matches!(
            BatchedScheduler::new(10, 1.0, false, None, 0, 1, 1, 1.0),
            Err(SchedulerError::EmptyThreadCount)
        ));
    }

    #[test]
    fn select_update_cycle_advances_sim_counts_without_deadlock() {
        let batch_size = 4;
        let num_sectors = 2;
        let scheduler = BatchedScheduler::new(1_000_000, 1.0, false, None, 2, batch_size, num_sectors, 1.0).unwrap();

        for _ in 0..50 {
            let rows = scheduler.select();
            assert_eq!(rows.len(), batch_size);
            let q = vec![0.0f32; batch_size];
            let policy = vec![uniform_policy(); batch_size];
            scheduler.update(q, policy);
        }

        let counts = scheduler.sim_counts();
        assert_eq!(counts.len(), batch_size * num_sectors);
        for &count in &counts {
            assert!(count >= 1, "every engine should have been selected/updated at least once");
        }
    }

    #[test]
    fn current_sector_cycles_through_every_sector() {
        let scheduler = BatchedScheduler::new(1_000_000, 1.0, false, None, 1, 2, 3, 1.0).unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..6 {
            seen.insert(scheduler.current_sector());
            let rows = scheduler.select();
            let q = vec![0.0f32; rows.len()];
            let policy = vec![uniform_policy(); rows.len()];
            scheduler.update(q, policy);
        }
        assert_eq!(seen, [0, 1, 2].into_iter().collect());
    }
}
