//! Cross-thread coordination primitives: the chunk/result message types,
//! the bounded work queues, and the iteration barrier.
//!
//! These are the *only* shared-mutable coordination points in the engine
//! (spec §5). Rather than wrap gamma/Elog-theta rows in a mutex, the rows
//! a worker needs for its assigned individuals travel by value inside a
//! [`Chunk`]; the worker's answer travels back the same way inside a
//! [`ChunkResult`]. The coordinator is the only thread that ever holds the
//! authoritative `Matrix`/`Tensor3` storage.

use std::sync::{Arc, Condvar, Mutex};

use crossbeam_channel::{Receiver, RecvError, SendError, Sender};
use svi_state::RateSchedule;

/// Everything a worker needs to update one individual at the current
/// locus, checked out of the coordinator's gamma/Elog-theta matrices for
/// the duration of the chunk.
#[derive(Debug, Clone)]
pub struct IndivPayload {
    pub id: u32,
    pub gamma_row: Vec<f64>,
    pub elog_theta_row: Vec<f64>,
    pub c_indiv: u64,
}

/// One unit of dispatch: a locus, a read-only snapshot of its Elog-beta
/// row, and the individuals a worker must update there this iteration.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub locus: u32,
    /// Flat `k * t` snapshot of `elog_beta[locus]`, valid for the whole
    /// chunk because only the coordinator writes it, and only between
    /// iterations.
    pub elog_beta_row: Vec<f64>,
    pub alpha: Vec<f64>,
    pub indiv_schedule: RateSchedule,
    pub init_phase: bool,
    /// Force a worker to flush any init-phase deferred gamma update before
    /// (or instead of, if `indivs` is empty) processing this chunk — used
    /// once at the end of init phase so no worker is left holding rows.
    pub force_flush: bool,
    pub indivs: Vec<IndivPayload>,
}

/// A finished gamma-row update, ready for the coordinator to `put_row`
/// back into its matrices.
#[derive(Debug, Clone)]
pub struct GammaUpdate {
    pub id: u32,
    pub gamma_row: Vec<f64>,
    pub elog_theta_row: Vec<f64>,
    pub etheta_row: Vec<f64>,
    pub c_indiv: u64,
    pub rho_indiv: f64,
}

/// A worker's contribution for the chunk it just finished. `gamma_updates`
/// is non-empty for every main-phase chunk; in init phase it carries the
/// *previous* locus's deferred gamma updates (see spec §4.E step 2) and is
/// empty on a worker's very first chunk.
#[derive(Debug, Clone)]
pub struct ChunkResult {
    pub worker_id: usize,
    pub gamma_updates: Vec<GammaUpdate>,
    /// Flat `k * t` local lambda accumulator for the chunk's locus.
    pub lambda_acc: Vec<f64>,
}

/// The coordinator's chunk-dispatch queue (`out_q` in spec §4.D).
#[derive(Clone)]
pub struct OutQueue {
    tx: Sender<Chunk>,
    rx: Receiver<Chunk>,
}

impl OutQueue {
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self { tx, rx }
    }

    pub fn push(&self, chunk: Chunk) -> Result<(), SendError<Chunk>> {
        self.tx.send(chunk)
    }

    /// Blocks until a chunk is available.
    pub fn pop(&self) -> Result<Chunk, RecvError> {
        self.rx.recv()
    }
}

/// The worker-completion queue (`in_q` in spec §4.D).
#[derive(Clone)]
pub struct InQueue {
    tx: Sender<ChunkResult>,
    rx: Receiver<ChunkResult>,
}

impl InQueue {
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self { tx, rx }
    }

    pub fn push(&self, report: ChunkResult) -> Result<(), SendError<ChunkResult>> {
        self.tx.send(report)
    }

    pub fn pop(&self) -> Result<ChunkResult, RecvError> {
        self.rx.recv()
    }
}

/// Broadcast barrier keyed on a single monotonically-increasing counter
/// (`iter` in main phase, `x` in init phase per spec §4.D).
///
/// The coordinator calls [`Barrier::notify`] before pushing chunks for an
/// iteration and [`Barrier::advance`] after reducing every worker's
/// contribution; workers capture [`Barrier::current`] when they pop a
/// chunk and block in [`Barrier::wait_for_advance`] until that value has
/// moved past what they observed. Counter mutation and the condvar notify
/// happen under the same lock, so there is no lost-wakeup window.
pub struct Barrier {
    inner: Mutex<u64>,
    cvar: Condvar,
}

impl Barrier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(0),
            cvar: Condvar::new(),
        })
    }

    /// Current counter value.
    pub fn current(&self) -> u64 {
        *self.inner.lock().expect("barrier mutex poisoned")
    }

    /// Wake any workers waiting on the current value without changing it;
    /// used before dispatching a fresh batch of chunks.
    pub fn notify(&self) {
        let _guard = self.inner.lock().expect("barrier mutex poisoned");
        self.cvar.notify_all();
    }

    /// Increment the counter and wake every waiter. Must only be called
    /// after all T worker contributions for the current value have been
    /// reduced (spec §5's barrier discipline).
    pub fn advance(&self) -> u64 {
        let mut guard = self.inner.lock().expect("barrier mutex poisoned");
        *guard += 1;
        self.cvar.notify_all();
        *guard
    }

    /// Block until the counter has moved past `observed`.
    pub fn wait_for_advance(&self, observed: u64) -> u64 {
        let guard = self.inner.lock().expect("barrier mutex poisoned");
        let guard = self
            .cvar
            .wait_while(guard, |v| *v <= observed)
            .expect("barrier mutex poisoned");
        *guard
    }
}

impl Default for Barrier {
    fn default() -> Self {
        Self {
            inner: Mutex::new(0),
            cvar: Condvar::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn schedule() -> RateSchedule {
        RateSchedule {
            tau0: 1.0,
            kappa: 0.5,
        }
    }

    #[test]
    fn chunk_round_trips_through_the_out_queue() {
        let q = OutQueue::bounded(4);
        let chunk = Chunk {
            locus: 7,
            elog_beta_row: vec![0.1, 0.2, 0.3, 0.4],
            alpha: vec![1.0, 1.0],
            indiv_schedule: schedule(),
            init_phase: false,
            force_flush: false,
            indivs: vec![IndivPayload {
                id: 3,
                gamma_row: vec![1.0, 2.0],
                elog_theta_row: vec![-0.5, -0.6],
                c_indiv: 0,
            }],
        };
        q.push(chunk).unwrap();
        let popped = q.pop().unwrap();
        assert_eq!(popped.locus, 7);
        assert_eq!(popped.indivs.len(), 1);
        assert_eq!(popped.indivs[0].id, 3);
    }

    #[test]
    fn result_round_trips_through_the_in_queue() {
        let q = InQueue::bounded(4);
        q.push(ChunkResult {
            worker_id: 2,
            gamma_updates: vec![GammaUpdate {
                id: 3,
                gamma_row: vec![1.1, 2.1],
                elog_theta_row: vec![-0.4, -0.5],
                etheta_row: vec![0.4, 0.6],
                c_indiv: 1,
                rho_indiv: 0.9,
            }],
            lambda_acc: vec![1.0, 2.0],
        })
        .unwrap();
        let r = q.pop().unwrap();
        assert_eq!(r.worker_id, 2);
        assert_eq!(r.gamma_updates.len(), 1);
        assert_eq!(r.lambda_acc, vec![1.0, 2.0]);
    }

    #[test]
    fn advance_wakes_a_waiting_thread() {
        let barrier = Barrier::new();
        let observed = barrier.current();
        let b2 = Arc::clone(&barrier);
        let handle = thread::spawn(move || {
            b2.wait_for_advance(observed);
        });
        thread::sleep(Duration::from_millis(20));
        barrier.advance();
        handle.join().expect("worker thread should not panic");
    }

    #[test]
    fn advance_increments_monotonically() {
        let barrier = Barrier::new();
        assert_eq!(barrier.current(), 0);
        assert_eq!(barrier.advance(), 1);
        assert_eq!(barrier.advance(), 2);
        assert_eq!(barrier.current(), 2);
    }
}
