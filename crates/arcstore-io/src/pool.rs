//! Bounded pool of archive writers shared by crawl worker threads.
//!
//! Borrowing hands out exclusive ownership of one writer, so no two threads
//! ever touch the same container file. The number of writers alive (idle or
//! borrowed) never exceeds the configured capacity, which also caps the
//! number of open container files.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{ArchiveError, ArchiveResult};
use crate::writer::{ArchiveWriter, WriterFactory};

struct PoolState {
    idle: VecDeque<ArchiveWriter>,
    /// Writers currently lent out.
    borrowed: usize,
    /// Writers alive, idle or borrowed.
    live: usize,
    closed: bool,
}

/// Capacity-bounded writer pool.
pub struct WriterPool {
    config: PoolConfig,
    factory: WriterFactory,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl WriterPool {
    /// Create a pool; writers are constructed on demand.
    pub fn new(config: PoolConfig, factory: WriterFactory) -> ArchiveResult<Self> {
        if config.max_active == 0 {
            return Err(ArchiveError::Config("pool capacity must be at least 1".to_string()));
        }
        info!(capacity = config.max_active, max_wait_ms = config.max_wait_ms, "writer pool created");
        Ok(Self {
            config,
            factory,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                borrowed: 0,
                live: 0,
                closed: false,
            }),
            available: Condvar::new(),
        })
    }

    /// Maximum writers alive at once.
    pub fn capacity(&self) -> usize {
        self.config.max_active
    }

    /// Writers currently borrowed.
    pub fn active_count(&self) -> usize {
        self.state.lock().borrowed
    }

    /// Writers waiting in the idle set.
    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Writers alive, idle or borrowed.
    pub fn live_count(&self) -> usize {
        self.state.lock().live
    }

    /// Factory used to build writers.
    pub fn factory(&self) -> &WriterFactory {
        &self.factory
    }

    /// Borrow with the configured timeout.
    pub fn borrow(&self) -> ArchiveResult<ArchiveWriter> {
        self.borrow_timeout(self.config.max_wait())
    }

    /// Borrow a writer, waiting up to `timeout` for one to free up.
    pub fn borrow_timeout(&self, timeout: Duration) -> ArchiveResult<ArchiveWriter> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut state = self.state.lock();
        let mut timed_out = false;
        loop {
            if state.closed {
                return Err(ArchiveError::PoolClosed);
            }
            if let Some(writer) = state.idle.pop_front() {
                state.borrowed += 1;
                debug!(writer = writer.id(), active = state.borrowed, "borrowed idle writer");
                return Ok(writer);
            }
            if state.live < self.config.max_active {
                state.live += 1;
                state.borrowed += 1;
                let writer = self.factory.create();
                debug!(writer = writer.id(), active = state.borrowed, "borrowed new writer");
                return Ok(writer);
            }
            if timed_out {
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(waited_ms, capacity = self.config.max_active, "writer pool exhausted");
                return Err(ArchiveError::PoolExhausted {
                    waited_ms,
                    capacity: self.config.max_active,
                });
            }
            timed_out = self.available.wait_until(&mut state, deadline).timed_out();
        }
    }

    /// Give a writer back for the next borrower. A poisoned writer is
    /// invalidated instead.
    pub fn return_writer(&self, writer: ArchiveWriter) -> ArchiveResult<()> {
        if writer.is_poisoned() {
            return self.invalidate(writer).map(|_| ());
        }
        let mut state = self.state.lock();
        state.borrowed = state.borrowed.saturating_sub(1);
        if state.closed {
            state.live = state.live.saturating_sub(1);
            drop(state);
            let mut writer = writer;
            return writer.close();
        }
        debug!(writer = writer.id(), active = state.borrowed, "returned writer");
        state.idle.push_back(writer);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Discard a writer permanently, renaming its open file as invalid.
    pub fn invalidate(&self, writer: ArchiveWriter) -> ArchiveResult<Option<PathBuf>> {
        {
            let mut state = self.state.lock();
            state.borrowed = state.borrowed.saturating_sub(1);
            state.live = state.live.saturating_sub(1);
            warn!(writer = writer.id(), active = state.borrowed, "invalidated writer");
        }
        self.available.notify_one();
        writer.invalidate()
    }

    /// Borrow, run `f`, then return the writer, or invalidate it when the
    /// failure may have left a partial record behind.
    pub fn with_writer<T, F>(&self, f: F) -> ArchiveResult<T>
    where
        F: FnOnce(&mut ArchiveWriter) -> ArchiveResult<T>,
    {
        let mut writer = self.borrow()?;
        match f(&mut writer) {
            Ok(value) => {
                self.return_writer(writer)?;
                Ok(value)
            }
            Err(err) => {
                if writer.is_poisoned() || err.requires_invalidation() {
                    if let Err(inv) = self.invalidate(writer) {
                        warn!(error = %inv, "failed to invalidate writer");
                    }
                } else if let Err(ret) = self.return_writer(writer) {
                    warn!(error = %ret, "failed to return writer");
                }
                Err(err)
            }
        }
    }

    /// Close every idle writer and refuse further borrows. Writers still
    /// lent out are closed when returned.
    pub fn close(&self) -> ArchiveResult<()> {
        let drained: Vec<ArchiveWriter> = {
            let mut state = self.state.lock();
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.live = state.live.saturating_sub(drained.len());
            drained
        };
        self.available.notify_all();
        let mut first_err = None;
        for mut writer in drained {
            if let Err(e) = writer.close() {
                warn!(writer = writer.id(), error = %e, "failed to close writer");
                first_err.get_or_insert(e);
            }
        }
        info!("writer pool closed");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
