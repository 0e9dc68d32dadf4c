//! Run ID allocation, validation and uniqueness

use crate::store::{CollaboratorError, RunHistoryStore, RunIdGenerator, StoreResult};
use crate::{OrchestratorError, Result};
use dagrun_core::RunRef;
use dashmap::DashSet;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Longest run ID a caller may supply
pub const MAX_RUN_ID_LEN: usize = 64;

lazy_static! {
    static ref RUN_ID_CHARS: Regex = Regex::new(r"^[A-Za-z0-9_-]+$").unwrap();
}

/// Check a caller-supplied run ID
pub fn validate_run_id(run_id: &str) -> Result<()> {
    let reason = if run_id.is_empty() {
        "must not be empty".to_string()
    } else if run_id.len() > MAX_RUN_ID_LEN {
        format!("must be at most {MAX_RUN_ID_LEN} characters")
    } else if !RUN_ID_CHARS.is_match(run_id) {
        "may only contain letters, digits, '_' and '-'".to_string()
    } else {
        return Ok(());
    };

    Err(OrchestratorError::InvalidRunId {
        run_id: run_id.to_string(),
        reason,
    })
}

/// Time-ordered UUID run IDs
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidV7Generator;

impl RunIdGenerator for UuidV7Generator {
    fn generate(&self) -> StoreResult<String> {
        Ok(Uuid::now_v7().to_string())
    }
}

/// Allocates run IDs and guards their uniqueness
#[derive(Clone)]
pub struct RunIdentity {
    generator: Arc<dyn RunIdGenerator>,
    history: Arc<dyn RunHistoryStore>,
    reserved: Arc<DashSet<RunRef>>,
}

impl RunIdentity {
    pub fn new(generator: Arc<dyn RunIdGenerator>, history: Arc<dyn RunHistoryStore>) -> Self {
        Self {
            generator,
            history,
            reserved: Arc::new(DashSet::new()),
        }
    }

    pub fn allocate(&self) -> Result<String> {
        Ok(self.generator.generate()?)
    }

    /// Validate an explicit ID, or allocate one when none (or an empty one) is given
    pub fn resolve(&self, requested: Option<&str>) -> Result<String> {
        match requested {
            Some(id) if !id.is_empty() => {
                validate_run_id(id)?;
                Ok(id.to_string())
            }
            _ => self.allocate(),
        }
    }

    /// Succeeds only when the run-history store has no attempt for the run
    pub async fn ensure_unique(&self, workflow_name: &str, run_id: &str) -> Result<()> {
        let run = RunRef::new(workflow_name, run_id);
        match self.history.find_attempt(&run).await {
            Err(CollaboratorError::NotFound(_)) => Ok(()),
            Ok(_) => Err(OrchestratorError::AlreadyExists(run)),
            Err(err) => Err(err.into()),
        }
    }

    /// Reserve the run for the lifetime of the returned guard, then check
    /// the history store.
    ///
    /// A second reservation of the same run inside this process fails with
    /// `AlreadyExists` until the first guard is dropped.
    pub async fn reserve(&self, workflow_name: &str, run_id: &str) -> Result<Reservation> {
        let run = RunRef::new(workflow_name, run_id);
        if !self.reserved.insert(run.clone()) {
            debug!(run = %run, "Run ID already reserved by a concurrent submission");
            return Err(OrchestratorError::AlreadyExists(run));
        }

        let reservation = Reservation {
            reserved: self.reserved.clone(),
            run,
        };
        self.ensure_unique(workflow_name, run_id).await?;

        Ok(reservation)
    }

    pub fn is_reserved(&self, run: &RunRef) -> bool {
        self.reserved.contains(run)
    }
}

/// Releases a reserved run ID on drop
#[derive(Debug)]
pub struct Reservation {
    reserved: Arc<DashSet<RunRef>>,
    run: RunRef,
}

impl Reservation {
    pub fn run(&self) -> &RunRef {
        &self.run
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.reserved.remove(&self.run);
    }
}
