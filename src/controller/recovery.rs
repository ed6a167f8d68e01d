use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::{ExecutionConfig, RecoveryCleanupType};
use crate::error::{Result, SlicerError};
use crate::scheduler::SliceState;
use crate::slicer::{SliceOutput, SlicerFn, StartingPoint};
use crate::store::{ExecutionStore, SliceRecord, StateStore};

/// Records fetched per state-store query.
const PAGE_SIZE: usize = 100;

/// What to do once every recoverable slice has been re-emitted.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    /// Resume the regular slicers from these points
    StartingPoints(Vec<StartingPoint>),
    /// The recovered execution had already sliced everything
    Exit,
}

struct RecoveryInner {
    recover_ex_id: String,
    slicers: usize,
    states: Vec<SliceState>,
    state_store: Arc<dyn StateStore>,
    ex_store: Arc<dyn ExecutionStore>,
    slicers_finished: AtomicBool,
    remaining: AtomicUsize,
    outcome: watch::Sender<Option<RecoveryOutcome>>,
    closed: CancellationToken,
}

/// Re-emits the incomplete slices of a previous execution.
#[derive(Clone)]
pub struct ExecutionRecovery {
    inner: Arc<RecoveryInner>,
}

impl ExecutionRecovery {
    pub fn new(
        config: &ExecutionConfig,
        state_store: Arc<dyn StateStore>,
        ex_store: Arc<dyn ExecutionStore>,
    ) -> Result<Self> {
        let recover_ex_id = config.recovered_execution.clone().ok_or_else(|| {
            SlicerError::InvalidConfig("recovery requires recovered_execution".into())
        })?;
        let states = match config.recovered_slice_type {
            RecoveryCleanupType::Errors => vec![SliceState::Error],
            RecoveryCleanupType::All => vec![SliceState::Error, SliceState::Start],
        };
        let (outcome, _) = watch::channel(None);
        Ok(Self {
            inner: Arc::new(RecoveryInner {
                recover_ex_id,
                slicers: config.slicers.max(1),
                states,
                state_store,
                ex_store,
                slicers_finished: AtomicBool::new(false),
                remaining: AtomicUsize::new(config.slicers.max(1)),
                outcome,
                closed: CancellationToken::new(),
            }),
        })
    }

    /// Check the recovered execution exists and note whether its slicers finished.
    pub async fn initialize(&self) -> Result<()> {
        let record = self.inner.ex_store.get(&self.inner.recover_ex_id).await?;
        self.inner
            .slicers_finished
            .store(record.slicers_finished, Ordering::SeqCst);

        let mut recoverable = 0;
        for state in &self.inner.states {
            recoverable += self
                .inner
                .state_store
                .count(&self.inner.recover_ex_id, *state)
                .await?;
        }
        tracing::info!(
            recover_ex_id = %self.inner.recover_ex_id,
            recoverable,
            slicers_finished = record.slicers_finished,
            "Recovering execution"
        );
        Ok(())
    }

    pub fn recover_ex_id(&self) -> &str {
        &self.inner.recover_ex_id
    }

    /// One slicer function per slicer of the recovered execution.
    pub fn new_slicer(&self) -> Vec<Box<dyn SlicerFn>> {
        (0..self.inner.slicers)
            .map(|slicer_id| {
                Box::new(RecoverySlicerFn {
                    inner: self.inner.clone(),
                    slicer_id,
                    buffer: VecDeque::new(),
                    from: 0,
                    exhausted: false,
                    reported: false,
                }) as Box<dyn SlicerFn>
            })
            .collect()
    }

    pub fn recovery_complete(&self) -> bool {
        self.inner.outcome.borrow().is_some()
    }

    /// Wait for the outcome. Returns None if recovery was shut down first.
    pub async fn wait_for_outcome(&self) -> Option<RecoveryOutcome> {
        let mut rx = self.inner.outcome.subscribe();
        tokio::select! {
            outcome = rx.wait_for(|o| o.is_some()) => outcome.ok().and_then(|o| o.clone()),
            _ = self.inner.closed.cancelled() => None,
        }
    }

    /// Stop re-emitting slices and release anyone waiting for the outcome.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.close();
        Ok(())
    }
}

impl RecoveryInner {
    async fn slicer_exhausted(&self) -> Result<()> {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) != 1 {
            return Ok(());
        }

        let outcome = if self.slicers_finished.load(Ordering::SeqCst) {
            RecoveryOutcome::Exit
        } else {
            let mut points = Vec::with_capacity(self.slicers);
            for slicer_id in 0..self.slicers {
                if let Some(last) = self
                    .state_store
                    .last_slice(&self.recover_ex_id, slicer_id)
                    .await?
                {
                    points.push(StartingPoint {
                        slicer_id,
                        request: last.request,
                    });
                }
            }
            RecoveryOutcome::StartingPoints(points)
        };

        tracing::info!(recover_ex_id = %self.recover_ex_id, outcome = ?outcome, "Recovery slicers exhausted");
        self.outcome.send_replace(Some(outcome));
        Ok(())
    }
}

struct RecoverySlicerFn {
    inner: Arc<RecoveryInner>,
    slicer_id: usize,
    buffer: VecDeque<SliceRecord>,
    from: usize,
    exhausted: bool,
    reported: bool,
}

#[async_trait]
impl SlicerFn for RecoverySlicerFn {
    async fn next_slice(&mut self) -> Result<SliceOutput> {
        if self.inner.closed.is_cancelled() {
            return Ok(SliceOutput::Done);
        }

        if self.buffer.is_empty() && !self.exhausted {
            let page = self
                .inner
                .state_store
                .query(
                    &self.inner.recover_ex_id,
                    self.slicer_id,
                    &self.inner.states,
                    self.from,
                    PAGE_SIZE,
                )
                .await?;
            self.from += page.len();
            self.exhausted = page.len() < PAGE_SIZE;
            self.buffer.extend(page);
        }

        if let Some(record) = self.buffer.pop_front() {
            return Ok(SliceOutput::Recovered(record.to_slice()));
        }

        if !self.reported {
            self.reported = true;
            self.inner.slicer_exhausted().await?;
        }
        Ok(SliceOutput::Done)
    }
}
