//! The serialization barrier.
//!
//! All manager state lives behind one logical critical section. Public
//! operations enter through [`Syncer::begin`] and hold an RAII guard.
//! Engine callbacks re-enter through [`Syncer::call_later_in_lock`]:
//! when the section is free the job runs immediately on the calling
//! thread; otherwise it is queued and drained by the current holder
//! before the section is released, so state mutations stay serialized
//! without ever blocking an engine thread. User callbacks go through
//! [`Syncer::call_later`] and run strictly after the section is
//! released, so they may re-enter the manager.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard};

type LockJob<T> = Box<dyn FnOnce(&mut T) + Send>;
type DeferredJob = Box<dyn FnOnce() + Send>;

struct Ctl<T> {
    held: bool,
    in_lock: VecDeque<LockJob<T>>,
    deferred: VecDeque<DeferredJob>,
}

pub(crate) struct Syncer<T> {
    state: Mutex<T>,
    ctl: Mutex<Ctl<T>>,
    free: Condvar,
}

impl<T> Syncer<T> {
    pub fn new(state: T) -> Self {
        Self {
            state: Mutex::new(state),
            ctl: Mutex::new(Ctl { held: false, in_lock: VecDeque::new(), deferred: VecDeque::new() }),
            free: Condvar::new(),
        }
    }

    /// Enter the critical section, blocking until it is free.
    pub fn begin(&self) -> SyncerGuard<'_, T> {
        let mut ctl = self.ctl.lock().unwrap();
        while ctl.held {
            ctl = self.free.wait(ctl).unwrap();
        }
        ctl.held = true;
        drop(ctl);
        // The held flag serializes access, so this lock is uncontended.
        let state = self.state.lock().unwrap();
        SyncerGuard { syncer: self, state: Some(state) }
    }

    /// Run `job` inside the critical section. Immediate when the
    /// section is free; queued for the current holder otherwise. Never
    /// blocks.
    pub fn call_later_in_lock(&self, job: impl FnOnce(&mut T) + Send + 'static) {
        {
            let mut ctl = self.ctl.lock().unwrap();
            if ctl.held {
                ctl.in_lock.push_back(Box::new(job));
                return;
            }
            ctl.held = true;
        }
        let mut state = self.state.lock().unwrap();
        job(&mut state);
        self.finish(state);
    }

    /// Schedule `job` to run after the critical section is released.
    /// Must be called by code running inside the section.
    pub fn call_later(&self, job: impl FnOnce() + Send + 'static) {
        self.ctl.lock().unwrap().deferred.push_back(Box::new(job));
    }

    /// Drain queued in-lock jobs, release the section, then run the
    /// deferred jobs outside it.
    fn finish(&self, mut state: MutexGuard<'_, T>) {
        let mut deferred = VecDeque::new();
        loop {
            let job = {
                let mut ctl = self.ctl.lock().unwrap();
                match ctl.in_lock.pop_front() {
                    Some(job) => Some(job),
                    None => {
                        // Atomic with the emptiness check, so a job
                        // enqueued now sees the section free.
                        ctl.held = false;
                        std::mem::swap(&mut deferred, &mut ctl.deferred);
                        None
                    }
                }
            };
            match job {
                Some(job) => job(&mut state),
                None => break,
            }
        }
        drop(state);
        self.free.notify_one();
        for job in deferred {
            job();
        }
    }
}

pub(crate) struct SyncerGuard<'a, T> {
    syncer: &'a Syncer<T>,
    state: Option<MutexGuard<'a, T>>,
}

impl<T> Deref for SyncerGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.state.as_ref().expect("guard state present")
    }
}

impl<T> DerefMut for SyncerGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.state.as_mut().expect("guard state present")
    }
}

impl<T> Drop for SyncerGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            self.syncer.finish(state);
        }
    }
}
