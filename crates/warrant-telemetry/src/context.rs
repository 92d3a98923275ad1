//! Per-job context for correlating maintenance runs in logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Context for one run of a maintenance or migration job.
///
/// Every log line emitted while the job's span is entered carries the
/// `run_id`, so a single run can be followed through interleaved output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobContext {
    /// Unique id of this run.
    pub run_id: Uuid,
    /// Job name, e.g. `purge_duplicates`.
    pub job: String,
    /// Whether the job only reports and writes nothing.
    pub dry_run: bool,
    /// Run id of the job that started this one, if any.
    pub parent_run: Option<Uuid>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Additional fields.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl JobContext {
    /// Create a context for a new run of `job`.
    #[must_use]
    pub fn new(job: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            job: job.into(),
            dry_run: false,
            parent_run: None,
            started_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    /// Create a context for a step run as part of this job.
    #[must_use]
    pub fn child(&self, job: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            job: job.into(),
            dry_run: self.dry_run,
            parent_run: Some(self.run_id),
            started_at: Utc::now(),
            metadata: self.metadata.clone(),
        }
    }

    /// Mark the run as dry-run.
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Add metadata.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Milliseconds since the run started.
    #[must_use]
    pub fn elapsed_ms(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.started_at)
            .num_milliseconds()
    }

    /// A span carrying this run's identity.
    #[must_use]
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "job",
            run_id = %self.run_id,
            job = %self.job,
            dry_run = self.dry_run,
            parent_run = self.parent_run.map(|id| id.to_string()),
        )
    }

    /// Enter the span and log start/finish around the guard's lifetime.
    #[must_use]
    pub fn enter(self) -> JobGuard {
        JobGuard::new(self)
    }
}

/// Keeps a job span entered and logs completion on drop.
pub struct JobGuard {
    context: JobContext,
    /// Held to keep the span active until the guard is dropped.
    #[allow(dead_code)]
    span: tracing::span::EnteredSpan,
}

impl JobGuard {
    fn new(context: JobContext) -> Self {
        let span = context.span().entered();
        tracing::info!("job started");
        Self { context, span }
    }

    /// The run's context.
    #[must_use]
    pub fn context(&self) -> &JobContext {
        &self.context
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        tracing::info!(elapsed_ms = self.context.elapsed_ms(), "job finished");
    }
}
