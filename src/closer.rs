//! Process-wide pool for close work.
//!
//! Close and failure listener callbacks run off the engine task on a small
//! pool of named worker threads, initialized at first use and living until
//! process exit. The pool is an offloading optimization, never required for
//! correctness: if it is unavailable the job runs inline on the caller.

use std::sync::mpsc::{channel, Sender};
use std::sync::{Mutex, OnceLock};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

const NUM_WORKERS: usize = 4;

static POOL: OnceLock<Sender<Job>> = OnceLock::new();

fn pool() -> &'static Sender<Job> {
    POOL.get_or_init(|| {
        let (tx, rx) = channel::<Job>();
        let rx = std::sync::Arc::new(Mutex::new(rx));

        for tag in 1..=NUM_WORKERS {
            let rx = rx.clone();
            thread::Builder::new()
                .name(format!("rudp-closing-{tag}"))
                .spawn(move || loop {
                    let job = match rx.lock() {
                        Ok(guard) => guard.recv(),
                        Err(_) => break,
                    };
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })
                .expect("failed to spawn closing worker");
        }

        tx
    })
}

/// Runs `job` on the closing pool, or inline if the pool cannot take it.
pub(crate) fn execute<F: FnOnce() + Send + 'static>(job: F) {
    if let Err(rejected) = pool().send(Box::new(job)) {
        (rejected.0)();
    }
}
