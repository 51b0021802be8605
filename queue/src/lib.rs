#![deny(clippy::pedantic)]
#![deny(clippy::cargo)]

//! A fixed pool of worker threads, each owning a FIFO of input items, with
//! randomized work stealing between them.
//!
//! Callers supply a mapper (per-item work), an associative reducer (fold of
//! per-item outputs) and an initializer for worker-owned data. Items are
//! distributed round-robin before [`WorkQueue::run_all`]; a running mapper
//! may queue follow-up work onto its own worker through
//! [`WorkerState::push_task`]. Per-worker outputs are reduced as tasks
//! complete on that worker and folded across workers at join time.
//!
//! There are no ordering guarantees between items, so the reducer must not
//! care about reduction order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{ensure, Result};
use log::trace;
use rand::seq::SliceRandom;

/// Analyses may recurse through deep structures on pathological inputs, so
/// workers get a generous stack.
const WORKER_STACK_SIZE: usize = 8 * 1024 * 1024;

type Mapper<'a, I, O, D> = dyn Fn(&mut WorkerState<I, D>, I) -> O + Send + Sync + 'a;
type Reducer<'a, O> = dyn Fn(O, O) -> O + Send + Sync + 'a;
type DataInit<'a, D> = dyn Fn(usize) -> D + Send + Sync + 'a;

/// The per-worker view handed to every mapper invocation: the worker-owned
/// data and a handle onto the worker's own queue.
pub struct WorkerState<I, D> {
    pub data: D,
    id: usize,
    queue: Arc<Mutex<VecDeque<I>>>,
}

impl<I, D> WorkerState<I, D> {
    /// Queues follow-up work onto this worker's own queue. This is the only
    /// legal way to submit items while the pool is running; the task is
    /// picked up by this worker or by a stealing neighbour.
    ///
    /// # Panics
    ///
    /// Panics when the queue lock is poisoned, i.e. another worker died.
    pub fn push_task(&self, item: I) {
        self.queue.lock().expect("worker queue poisoned").push_back(item);
    }

    #[must_use]
    pub fn worker_id(&self) -> usize { self.id }
}

pub struct WorkQueue<'a, I, O, D> {
    mapper: Box<Mapper<'a, I, O, D>>,
    reducer: Box<Reducer<'a, O>>,
    data_init: Box<DataInit<'a, D>>,
    queues: Vec<Arc<Mutex<VecDeque<I>>>>,
    next_queue: usize,
}

impl<'a, I, O, D> WorkQueue<'a, I, O, D> {
    /// # Errors
    ///
    /// Fails when `num_threads` is zero.
    pub fn new<M, R, F>(num_threads: usize, mapper: M, reducer: R, data_init: F) -> Result<Self>
    where
        M: Fn(&mut WorkerState<I, D>, I) -> O + Send + Sync + 'a,
        R: Fn(O, O) -> O + Send + Sync + 'a,
        F: Fn(usize) -> D + Send + Sync + 'a, {
        ensure!(num_threads >= 1, "work queue needs at least one worker");
        Ok(Self {
            mapper: Box::new(mapper),
            reducer: Box::new(reducer),
            data_init: Box::new(data_init),
            queues: (0..num_threads)
                .map(|_| Arc::new(Mutex::new(VecDeque::new())))
                .collect(),
            next_queue: 0,
        })
    }

    /// Places an item into a worker queue, round-robin across workers. Only
    /// legal before [`WorkQueue::run_all`]; use [`WorkerState::push_task`]
    /// from inside a running mapper instead.
    ///
    /// # Panics
    ///
    /// Panics when the queue lock is poisoned, which cannot happen before
    /// the pool runs.
    pub fn add_item(&mut self, item: I) {
        let slot = self.next_queue;
        self.next_queue = (slot + 1) % self.queues.len();
        self.queues[slot]
            .lock()
            .expect("worker queue poisoned")
            .push_back(item);
    }

    /// Runs every queued item to completion and folds the per-worker outputs
    /// into `initial`. Blocks until all workers have exited.
    ///
    /// # Panics
    ///
    /// Propagates worker panics; the pool is not transactional.
    #[must_use]
    pub fn run_all(self, initial: O) -> O
    where
        I: Send,
        O: Send, {
        let outputs: Vec<Option<O>> = thread::scope(|s| {
            let pool = &self;
            (0..self.queues.len())
                .map(|id| {
                    thread::Builder::new()
                        .name(format!("worker-{id}"))
                        .stack_size(WORKER_STACK_SIZE)
                        .spawn_scoped(s, move || pool.worker_loop(id))
                        .expect("failed to spawn worker thread")
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|handle| handle.join().expect("worker thread panicked"))
                .collect()
        });
        outputs
            .into_iter()
            .flatten()
            .fold(initial, |acc, out| (self.reducer)(acc, out))
    }

    fn worker_loop(&self, id: usize) -> Option<O> {
        // Each worker walks its own randomized permutation of victims, own
        // queue forced to the front. A shared permutation would send every
        // idle worker to the same victim.
        let mut order: Vec<usize> = (0..self.queues.len()).filter(|&w| w != id).collect();
        order.shuffle(&mut rand::thread_rng());
        order.insert(0, id);

        let mut state = WorkerState {
            data: (self.data_init)(id),
            id,
            queue: Arc::clone(&self.queues[id]),
        };
        let mut acc: Option<O> = None;
        'drain: loop {
            for &victim in &order {
                let task = self.queues[victim]
                    .lock()
                    .expect("worker queue poisoned")
                    .pop_front();
                if let Some(task) = task {
                    if victim != id {
                        trace!("worker {id} stole a task from worker {victim}");
                    }
                    let out = (self.mapper)(&mut state, task);
                    acc = Some(match acc.take() {
                        None => out,
                        Some(prev) => (self.reducer)(prev, out),
                    });
                    continue 'drain;
                }
            }
            // A full pass over every queue came up empty.
            break;
        }
        acc
    }
}

impl<'a, I, O> WorkQueue<'a, I, O, ()> {
    /// Map/reduce without per-worker data.
    ///
    /// # Errors
    ///
    /// Fails when `num_threads` is zero.
    pub fn map_reduce<M, R>(num_threads: usize, mapper: M, reducer: R) -> Result<Self>
    where
        M: Fn(&mut WorkerState<I, ()>, I) -> O + Send + Sync + 'a,
        R: Fn(O, O) -> O + Send + Sync + 'a, {
        Self::new(num_threads, mapper, reducer, |_| ())
    }
}

impl<'a, I> WorkQueue<'a, I, (), ()> {
    /// Fire-and-forget variant: no outputs, no reducer, no per-worker data.
    ///
    /// # Errors
    ///
    /// Fails when `num_threads` is zero.
    pub fn foreach<W>(num_threads: usize, work: W) -> Result<Self>
    where
        W: Fn(&mut WorkerState<I, ()>, I) + Send + Sync + 'a, {
        Self::new(num_threads, move |state, item| work(state, item), |(), ()| (), |_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use itertools::Itertools;

    use super::*;

    #[test]
    fn zero_workers_is_an_error() {
        assert!(WorkQueue::<u32, u32, ()>::map_reduce(0, |_, x| x, |a, b| a + b).is_err());
    }

    #[test]
    fn reduction_is_independent_of_thread_count() {
        for threads in [1, 4, 8] {
            let mut queue =
                WorkQueue::map_reduce(threads, |_, x: u64| x * x, |a, b| a + b).unwrap();
            for x in 1..=100 {
                queue.add_item(x);
            }
            assert_eq!(queue.run_all(0), 338_350);
        }
    }

    #[test]
    fn every_item_is_consumed_exactly_once() {
        let seen = Mutex::new(Vec::new());
        let mut queue =
            WorkQueue::foreach(8, |_, x: usize| seen.lock().unwrap().push(x)).unwrap();
        for x in 0..1000 {
            queue.add_item(x);
        }
        let () = queue.run_all(());
        let seen = seen.into_inner().unwrap().into_iter().sorted().collect_vec();
        assert_eq!(seen, (0..1000).collect_vec());
    }

    #[test]
    fn one_seed_task_fans_out_across_the_pool() {
        // The single seed lands on worker 0 and queues the real work from
        // inside the mapper; the other seven workers start empty and can
        // only make progress by stealing.
        let mut queue = WorkQueue::map_reduce(
            8,
            |state, x: u64| {
                if x == 0 {
                    for y in 1..=100 {
                        state.push_task(y);
                    }
                }
                x
            },
            |a, b| a + b,
        )
        .unwrap();
        queue.add_item(0);
        assert_eq!(queue.run_all(0), 5050);
    }

    #[test]
    fn worker_data_stays_with_its_worker() {
        let mut queue = WorkQueue::new(
            4,
            |state: &mut WorkerState<usize, usize>, _| {
                assert_eq!(state.data, state.worker_id());
                vec![state.data]
            },
            |mut a: Vec<usize>, b| {
                a.extend(b);
                a
            },
            |id| id,
        )
        .unwrap();
        for x in 0..64 {
            queue.add_item(x);
        }
        let ids = queue.run_all(Vec::new());
        assert_eq!(ids.len(), 64);
        assert!(ids.iter().all(|&id| id < 4));
    }

    #[test]
    fn single_worker_drains_in_submission_order() {
        let mut queue = WorkQueue::map_reduce(
            1,
            |_, x: u32| vec![x],
            |mut a: Vec<u32>, b| {
                a.extend(b);
                a
            },
        )
        .unwrap();
        for x in 0..10 {
            queue.add_item(x);
        }
        assert_eq!(queue.run_all(Vec::new()), (0..10).collect_vec());
    }
}
