//! Job ledger: jobs this node emitted and jobs it runs for others, keyed by cookie.

use std::collections::HashMap;

use crate::cookie::Cookie;
use crate::protocol::JobStatus;
use crate::registry::PeerId;

/// Default number of jobs accepted for execution at once.
pub const DEFAULT_MAX_RUNNING_JOBS: usize = 4;

/// Default lifetime of an unanswered offer, in ticks.
pub const DEFAULT_OFFER_TIMEOUT_TICKS: u64 = 30;

/// Script source and its single numeric argument.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPayload {
    pub source: String,
    pub arg: f64,
}

/// Lifecycle of a job this node originated. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EmittedState {
    QuerySent,
    Running,
    Finished { status: JobStatus, result: f64 },
}

impl EmittedState {
    pub fn rank(&self) -> u8 {
        match self {
            EmittedState::QuerySent => 0,
            EmittedState::Running => 1,
            EmittedState::Finished { .. } => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmittedJob {
    pub cookie: Cookie,
    pub state: EmittedState,
    pub payload: JobPayload,
    /// Peer the job was dispatched to.
    pub executor: Option<PeerId>,
}

/// Lifecycle of a job run on behalf of another peer. Queued and Executing both count as running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivedState {
    Queued,
    Executing,
    Finished,
}

#[derive(Debug, Clone)]
pub struct ReceivedJob {
    pub cookie: Cookie,
    /// Where the result goes; re-resolved through the registry at send time.
    pub requester: PeerId,
    pub state: ReceivedState,
    pub payload: JobPayload,
}

/// One job handed to the script engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub cookie: Cookie,
    pub arg: f64,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("job not found")]
    NotFound,
    #[error("job already dispatched")]
    AlreadyDispatched,
    #[error("job is not running")]
    NotRunning,
    #[error("no capacity")]
    NoCapacity,
    #[error("job already received")]
    Duplicate,
}

/// Both job tables plus capacity accounting.
pub struct JobLedger {
    emitted: HashMap<Cookie, EmittedJob>,
    /// Received jobs in arrival order; executed last-in-first-out.
    received: Vec<ReceivedJob>,
    /// Offers made and not yet answered by a Job (cookie -> tick of the offer).
    reservations: HashMap<Cookie, u64>,
    max_running: usize,
}

impl JobLedger {
    pub fn new(max_running: usize) -> Self {
        Self {
            emitted: HashMap::new(),
            received: Vec::new(),
            reservations: HashMap::new(),
            max_running,
        }
    }

    /// Record a new job originated here, in QuerySent.
    pub fn emit(&mut self, cookie: Cookie, payload: JobPayload) {
        self.emitted.insert(
            cookie,
            EmittedJob {
                cookie,
                state: EmittedState::QuerySent,
                payload,
                executor: None,
            },
        );
    }

    pub fn emitted(&self, cookie: &Cookie) -> Option<&EmittedJob> {
        self.emitted.get(cookie)
    }

    /// First offer for a job still in QuerySent: move to Running and hand back the payload.
    pub fn accept_offer(&mut self, cookie: &Cookie, executor: PeerId) -> Result<&JobPayload, LedgerError> {
        let job = self.emitted.get_mut(cookie).ok_or(LedgerError::NotFound)?;
        if job.state != EmittedState::QuerySent {
            return Err(LedgerError::AlreadyDispatched);
        }
        job.state = EmittedState::Running;
        job.executor = Some(executor);
        Ok(&job.payload)
    }

    /// Result for a Running job: move to Finished.
    pub fn record_result(
        &mut self,
        cookie: &Cookie,
        status: JobStatus,
        result: f64,
    ) -> Result<(), LedgerError> {
        let job = self.emitted.get_mut(cookie).ok_or(LedgerError::NotFound)?;
        if job.state != EmittedState::Running {
            return Err(LedgerError::NotRunning);
        }
        job.state = EmittedState::Finished { status, result };
        Ok(())
    }

    /// Received jobs not yet finished.
    pub fn running_count(&self) -> usize {
        self.received
            .iter()
            .filter(|j| j.state != ReceivedState::Finished)
            .count()
    }

    /// Room for another job, counting outstanding offers.
    pub fn has_capacity(&self) -> bool {
        self.running_count() + self.reservations.len() < self.max_running
    }

    /// Hold a slot for an offer until the job arrives or the reservation expires.
    pub fn reserve(&mut self, cookie: Cookie, now: u64) {
        self.reservations.insert(cookie, now);
    }

    pub fn release(&mut self, cookie: &Cookie) -> bool {
        self.reservations.remove(cookie).is_some()
    }

    pub fn is_reserved(&self, cookie: &Cookie) -> bool {
        self.reservations.contains_key(cookie)
    }

    /// Drop reservations older than `ttl` ticks. Returns the expired cookies.
    pub fn expire_reservations(&mut self, now: u64, ttl: u64) -> Vec<Cookie> {
        let expired: Vec<Cookie> = self
            .reservations
            .iter()
            .filter(|(_, &t)| now.saturating_sub(t) > ttl)
            .map(|(&c, _)| c)
            .collect();
        for c in &expired {
            self.reservations.remove(c);
        }
        expired
    }

    /// Accept a job for execution. Uses the cookie's reservation if there is one.
    pub fn take(
        &mut self,
        cookie: Cookie,
        requester: PeerId,
        payload: JobPayload,
    ) -> Result<(), LedgerError> {
        if self.received.iter().any(|j| j.cookie == cookie) {
            return Err(LedgerError::Duplicate);
        }
        if !self.release(&cookie) && !self.has_capacity() {
            return Err(LedgerError::NoCapacity);
        }
        self.received.push(ReceivedJob {
            cookie,
            requester,
            state: ReceivedState::Queued,
            payload,
        });
        Ok(())
    }

    pub fn received(&self, cookie: &Cookie) -> Option<&ReceivedJob> {
        self.received.iter().find(|j| j.cookie == *cookie)
    }

    pub fn is_executing(&self) -> bool {
        self.received
            .iter()
            .any(|j| j.state == ReceivedState::Executing)
    }

    /// Start the most recently queued job. None while another job is executing.
    pub fn next_execution(&mut self) -> Option<ExecutionRequest> {
        if self.is_executing() {
            return None;
        }
        let job = self
            .received
            .iter_mut()
            .rev()
            .find(|j| j.state == ReceivedState::Queued)?;
        job.state = ReceivedState::Executing;
        Some(ExecutionRequest {
            cookie: job.cookie,
            arg: job.payload.arg,
            source: job.payload.source.clone(),
        })
    }

    /// Finish an executing job and remove it from the active set.
    pub fn finish_execution(&mut self, cookie: &Cookie) -> Result<ReceivedJob, LedgerError> {
        let idx = self
            .received
            .iter()
            .position(|j| j.cookie == *cookie)
            .ok_or(LedgerError::NotFound)?;
        if self.received[idx].state != ReceivedState::Executing {
            return Err(LedgerError::NotRunning);
        }
        let mut job = self.received.remove(idx);
        job.state = ReceivedState::Finished;
        Ok(job)
    }
}

impl Default for JobLedger {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RUNNING_JOBS)
    }
}
