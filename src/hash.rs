use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use hashbrown::HashMap;
use sha1::{Digest, Sha1};
use tokio::sync::mpsc::UnboundedSender;

use crate::storage::{Advice, Chunk};

pub const HASH_LEN: usize = 20;

pub type PieceHash = [u8; HASH_LEN];

/// Advise this many queued chunks ahead of the one being hashed.
const READAHEAD: usize = 2;

type Key = (u64, u64);

struct Job {
    owner: u64,
    seq: u64,
    index: u32,
    chunk: Arc<Chunk>,
    signal: UnboundedSender<()>,
}

#[derive(Default)]
struct State {
    pending: VecDeque<Job>,
    running: Option<Key>,
    done: HashMap<Key, PieceHash>,
    /// Submission order per owner: (seq, piece index).
    order: HashMap<u64, VecDeque<(u64, u32)>>,
    quit: bool,
}

struct Inner {
    state: Mutex<State>,
    work_cv: Condvar,
    done_cv: Condvar,
}

/// SHA-1 pipeline on a dedicated worker thread.
///
/// Jobs are hashed in submission order. Completions land in a map guarded
/// by the same mutex; the submitting side drains them with
/// [`completions`](HashQueue::completions), which preserves submission
/// order per owner. Each job carries a channel sender used to poke the
/// owner's async loop when its digest is ready.
pub struct HashQueue {
    inner: Arc<Inner>,
    worker: Option<JoinHandle<()>>,
    seq: AtomicU64,
}

impl Default for HashQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl HashQueue {
    pub fn new() -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State::default()),
            work_cv: Condvar::new(),
            done_cv: Condvar::new(),
        });

        let worker_inner = inner.clone();
        let worker = std::thread::Builder::new()
            .name("hash-worker".into())
            .spawn(move || worker_loop(&worker_inner))
            .expect("spawning the hash worker");

        Self {
            inner,
            worker: Some(worker),
            seq: AtomicU64::new(0),
        }
    }

    /// Queue a fully written chunk for hashing. `signal` is poked once the
    /// digest is available.
    pub fn submit(&self, owner: u64, index: u32, chunk: Arc<Chunk>, signal: UnboundedSender<()>) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);

        let mut state = self.inner.state.lock().unwrap();
        state.order.entry(owner).or_default().push_back((seq, index));
        state.pending.push_back(Job {
            owner,
            seq,
            index,
            chunk,
            signal,
        });
        drop(state);

        self.inner.work_cv.notify_one();
    }

    /// Completed digests for an owner, in submission order. Stops at the
    /// first still-outstanding job so results never overtake each other.
    pub fn completions(&self, owner: u64) -> Vec<(u32, PieceHash)> {
        let mut state = self.inner.state.lock().unwrap();
        let mut out = Vec::new();

        if !state.order.contains_key(&owner) {
            return out;
        }

        let mut drained = Vec::new();
        loop {
            let front = match state.order.get(&owner) {
                Some(q) => q.front().copied(),
                None => None,
            };
            match front {
                Some((seq, index)) if state.done.contains_key(&(owner, seq)) => {
                    state.order.get_mut(&owner).unwrap().pop_front();
                    drained.push((seq, index));
                }
                _ => break,
            }
        }
        if state.order.get(&owner).is_some_and(|q| q.is_empty()) {
            state.order.remove(&owner);
        }

        for (seq, index) in drained {
            let digest = state.done.remove(&(owner, seq)).unwrap();
            out.push((index, digest));
        }
        out
    }

    /// Cancel everything queued under an owner.
    ///
    /// Entries not yet started are removed outright. If the owner's job is
    /// on the worker right now, this waits for the result to reach the
    /// completion map and consumes it silently. Returns the indexes whose
    /// digests will never be delivered.
    pub fn remove(&self, owner: u64) -> Vec<u32> {
        let mut state = self.inner.state.lock().unwrap();

        state.pending.retain(|j| j.owner != owner);

        while matches!(state.running, Some((o, _)) if o == owner) {
            state = self.inner.done_cv.wait(state).unwrap();
        }

        let mut cancelled = Vec::new();
        if let Some(queue) = state.order.remove(&owner) {
            for (seq, index) in queue {
                state.done.remove(&(owner, seq));
                cancelled.push(index);
            }
        }
        cancelled
    }

    /// True while the owner has submissions that have not been drained.
    pub fn has_work(&self, owner: u64) -> bool {
        self.inner.state.lock().unwrap().order.contains_key(&owner)
    }
}

impl Drop for HashQueue {
    fn drop(&mut self) {
        self.inner.state.lock().unwrap().quit = true;
        self.inner.work_cv.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(inner: &Inner) {
    loop {
        let mut state = inner.state.lock().unwrap();
        while state.pending.is_empty() && !state.quit {
            state = inner.work_cv.wait(state).unwrap();
        }
        if state.quit {
            return;
        }

        let job = state.pending.pop_front().unwrap();
        state.running = Some((job.owner, job.seq));

        // Keep the next few chunks faulting in while this one hashes.
        let readahead: Vec<Arc<Chunk>> = state
            .pending
            .iter()
            .take(READAHEAD)
            .map(|j| j.chunk.clone())
            .collect();
        drop(state);

        for chunk in &readahead {
            chunk.advise(Advice::WillNeed);
        }
        if job.chunk.incore_length(0) < job.chunk.len {
            job.chunk.advise(Advice::WillNeed);
        }

        let mut sha = Sha1::new();
        for window in job.chunk.windows() {
            sha.update(window.bytes());
        }
        let digest: PieceHash = sha.finalize().into();

        let mut state = inner.state.lock().unwrap();
        state.running = None;
        state.done.insert((job.owner, job.seq), digest);
        drop(state);

        inner.done_cv.notify_all();
        let _ = job.signal.send(());
    }
}
