//! The grace worker thread
//!
//! Deferred callbacks are queued over a channel and drained in batches:
//! the worker collects whatever is pending, waits one grace period, then
//! runs the batch. Callbacks therefore execute outside every critical
//! section that could still observe the memory they reclaim.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};
use log::debug;

use crate::epoch::State;
use crate::grace::Callback;

enum Msg {
    Run(Callback),
    Shutdown,
}

pub(crate) struct GraceWorker {
    tx: Sender<Msg>,
    handle: Option<JoinHandle<()>>,
}

impl GraceWorker {
    pub(crate) fn spawn(state: Arc<State>) -> GraceWorker {
        let (tx, rx) = unbounded();
        let handle = std::thread::Builder::new()
            .name("splitmap-grace".into())
            .spawn(move || Self::run(state, rx))
            .expect("failed to spawn grace worker");
        GraceWorker {
            tx,
            handle: Some(handle),
        }
    }

    pub(crate) fn defer(&self, cb: Callback) {
        // The channel only closes after Shutdown, which is only sent from
        // drop; a failed send here would mean a callback after teardown.
        self.tx
            .send(Msg::Run(cb))
            .expect("grace worker is gone");
    }

    fn run(state: Arc<State>, rx: Receiver<Msg>) {
        let mut batch: Vec<Callback> = Vec::new();
        let mut shutdown = false;
        while !shutdown {
            match rx.recv() {
                Ok(Msg::Run(cb)) => batch.push(cb),
                Ok(Msg::Shutdown) | Err(_) => shutdown = true,
            }
            // Coalesce everything already queued into one grace period.
            for msg in rx.try_iter() {
                match msg {
                    Msg::Run(cb) => batch.push(cb),
                    Msg::Shutdown => shutdown = true,
                }
            }
            if !batch.is_empty() {
                debug!("grace worker: running {} deferred callbacks", batch.len());
                state.synchronize();
                for cb in batch.drain(..) {
                    cb();
                }
            }
        }
    }
}

impl Drop for GraceWorker {
    fn drop(&mut self) {
        let _ = self.tx.send(Msg::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
