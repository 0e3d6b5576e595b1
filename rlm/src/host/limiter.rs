//! Sub-query fan-out under a call budget.

use std::sync::Arc;
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::{BudgetExceeded, CallBudget, remaining_budget};
use crate::host::pool::WorkerPool;
use crate::io::backend::ReasoningBackend;

/// Upper bound on threads used by one batch.
pub const MAX_BATCH_WORKERS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubQueryError {
    #[error("llm_query requires a non-empty prompt")]
    EmptyPrompt,
    #[error("llm_query_batched requires a non-empty list of prompts")]
    EmptyBatch,
    #[error(transparent)]
    BudgetExceeded(#[from] BudgetExceeded),
    #[error("sub-query timed out after {}s", .after.as_secs_f64())]
    Timeout { after: Duration },
    #[error("sub-query failed: {0}")]
    Backend(String),
    /// Failures as `(index, cause)`, sorted by index.
    #[error("{} of {total} sub-queries failed: {}", .failures.len(), batch_details(.failures))]
    Batch {
        total: usize,
        failures: Vec<(usize, String)>,
    },
}

fn batch_details(failures: &[(usize, String)]) -> String {
    failures
        .iter()
        .map(|(index, cause)| format!("[{index}] {cause}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Single queries share the injected pool; each batch builds its own.
pub struct SubQueryLimiter {
    backend: Arc<dyn ReasoningBackend>,
    budget: Arc<CallBudget>,
    single: WorkerPool,
    timeout: Duration,
    max_batch_workers: usize,
}

impl SubQueryLimiter {
    pub fn new(
        backend: Arc<dyn ReasoningBackend>,
        budget: Arc<CallBudget>,
        single: WorkerPool,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            budget,
            single,
            timeout,
            max_batch_workers: MAX_BATCH_WORKERS,
        }
    }

    pub fn with_max_batch_workers(mut self, max: usize) -> Self {
        self.max_batch_workers = max.clamp(1, MAX_BATCH_WORKERS);
        self
    }

    pub fn budget(&self) -> &CallBudget {
        &self.budget
    }

    #[instrument(skip_all, fields(prompt_len = prompt.len()))]
    pub fn query(&self, prompt: &str) -> Result<String, SubQueryError> {
        if prompt.trim().is_empty() {
            return Err(SubQueryError::EmptyPrompt);
        }
        let used = self.budget.check_and_increment(1)?;
        debug!(used, ceiling = self.budget.ceiling(), "sub-query reserved");

        let backend = Arc::clone(&self.backend);
        let prompt = prompt.to_string();
        let rx = self
            .single
            .submit(move || backend.complete(&prompt))
            .map_err(|err| SubQueryError::Backend(format!("{err:#}")))?;
        match rx.recv_timeout(self.timeout) {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(err)) => Err(SubQueryError::Backend(format!("{err:#}"))),
            Err(RecvTimeoutError::Timeout) => {
                warn!(timeout_secs = self.timeout.as_secs(), "sub-query timed out");
                Err(SubQueryError::Timeout {
                    after: self.timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(SubQueryError::Backend(
                "sub-query worker stopped before answering".to_string(),
            )),
        }
    }

    /// Reserves the whole batch up front; one failure fails the batch.
    #[instrument(skip_all, fields(batch = prompts.len()))]
    pub fn query_batched(&self, prompts: &[String]) -> Result<Vec<String>, SubQueryError> {
        if prompts.is_empty() {
            return Err(SubQueryError::EmptyBatch);
        }
        let used = self.budget.check_and_increment(prompts.len())?;
        let workers = prompts
            .len()
            .min(self.budget.ceiling())
            .min(self.max_batch_workers)
            .max(1);
        info!(used, workers, "dispatching sub-query batch");

        let mut pool = WorkerPool::new("rlm-subquery-batch", workers)
            .map_err(|err| SubQueryError::Backend(format!("{err:#}")))?;
        let mut pending = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let backend = Arc::clone(&self.backend);
            let prompt = prompt.clone();
            let submitted = if prompt.trim().is_empty() {
                Err(SubQueryError::EmptyPrompt.to_string())
            } else {
                pool.submit(move || backend.complete(&prompt))
                    .map_err(|err| format!("{err:#}"))
            };
            pending.push(submitted);
        }

        // One timeout per wave of queued prompts.
        let waves = prompts.len().div_ceil(workers);
        let deadline = Instant::now() + self.timeout.saturating_mul(waves_u32(waves));

        let mut answers = Vec::with_capacity(prompts.len());
        let mut failures = Vec::new();
        for (index, submitted) in pending.into_iter().enumerate() {
            let outcome = submitted.and_then(|rx| {
                let remaining = remaining_budget(deadline).unwrap_or(Duration::ZERO);
                match rx.recv_timeout(remaining) {
                    Ok(Ok(text)) => Ok(text),
                    Ok(Err(err)) => Err(format!("{err:#}")),
                    Err(RecvTimeoutError::Timeout) => Err(SubQueryError::Timeout {
                        after: self.timeout,
                    }
                    .to_string()),
                    Err(RecvTimeoutError::Disconnected) => {
                        Err("sub-query worker stopped before answering".to_string())
                    }
                }
            });
            match outcome {
                Ok(text) => answers.push(text),
                Err(cause) => failures.push((index, cause)),
            }
        }
        pool.shutdown();

        if failures.is_empty() {
            return Ok(answers);
        }
        warn!(failed = failures.len(), total = prompts.len(), "sub-query batch failed");
        Err(SubQueryError::Batch {
            total: prompts.len(),
            failures,
        })
    }
}

fn waves_u32(waves: usize) -> u32 {
    u32::try_from(waves).unwrap_or(u32::MAX)
}
