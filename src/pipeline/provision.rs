//! On-demand table creation for the one-shot insert path.
//!
//! A freshly created table is not immediately visible to streaming writes, so
//! after creating it the whole insert cycle is restarted once a consistency
//! delay has passed. The delay backs off between rounds and the number of
//! rounds is bounded.

use std::time::Duration;

use log::{debug, info, warn};

use crate::backend::{InsertAllResponse, StreamingBackend};
use crate::error::{InsertError, Result};
use crate::metrics::Metrics;
use crate::schema::TableSchema;
use crate::table::TableRef;

pub const DEFAULT_CONSISTENCY_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_PROVISION_DELAY: Duration = Duration::from_secs(600);
pub const DEFAULT_PROVISION_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionPolicy {
    /// Wait after the first create.
    pub consistency_delay: Duration,
    /// Growth factor applied to the wait on every further round.
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    /// Create-and-wait rounds before giving up.
    pub max_attempts: u32,
}

impl Default for ProvisionPolicy {
    fn default() -> Self {
        Self {
            consistency_delay: DEFAULT_CONSISTENCY_DELAY,
            backoff_multiplier: 2.0,
            max_delay: DEFAULT_MAX_PROVISION_DELAY,
            max_attempts: DEFAULT_PROVISION_ATTEMPTS,
        }
    }
}

impl ProvisionPolicy {
    /// Wait before restart number `round` (zero based).
    pub fn delay_for(&self, round: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .max(1.0)
            .powi(round.min(i32::MAX as u32) as i32);
        let secs = (self.consistency_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Blocks the calling thread for the given duration.
pub type Sleeper = dyn Fn(Duration) + Send + Sync;

pub struct AutoProvisioner<'a> {
    backend: &'a dyn StreamingBackend,
    table: &'a TableRef,
    schema: &'a TableSchema,
    policy: &'a ProvisionPolicy,
    metrics: &'a Metrics,
    sleep: &'a Sleeper,
}

impl<'a> AutoProvisioner<'a> {
    pub fn new(
        backend: &'a dyn StreamingBackend,
        table: &'a TableRef,
        schema: &'a TableSchema,
        policy: &'a ProvisionPolicy,
        metrics: &'a Metrics,
        sleep: &'a Sleeper,
    ) -> Self {
        Self {
            backend,
            table,
            schema,
            policy,
            metrics,
            sleep,
        }
    }

    /// Runs `insert`; each time it reports the table missing, creates the
    /// table, waits, and runs `insert` again from the start.
    pub fn run<F>(&self, mut insert: F) -> Result<InsertAllResponse>
    where
        F: FnMut() -> Result<InsertAllResponse>,
    {
        let mut rounds = 0;
        loop {
            let err = match insert() {
                Err(err) if err.is_not_found() => err,
                other => return other,
            };

            if rounds >= self.policy.max_attempts {
                if rounds == 0 {
                    return Err(err);
                }
                warn!(
                    "{} still missing after {} provisioning round(s)",
                    self.table, rounds
                );
                return Err(InsertError::DestinationNotVisible {
                    table: self.table.to_string(),
                    attempts: rounds,
                });
            }

            self.create()?;

            let delay = self.policy.delay_for(rounds);
            info!(
                "Waiting {:?} for {} to become visible before retrying",
                delay, self.table
            );
            self.metrics.inc_provision_waits();
            (self.sleep)(delay);
            rounds += 1;
        }
    }

    fn create(&self) -> Result<()> {
        match self.backend.create_table(self.table, self.schema) {
            Ok(()) => {
                info!("Created {} with schema {}", self.table, self.schema);
                self.metrics.inc_tables_created();
                Ok(())
            }
            Err(err) => match InsertError::from_api(err) {
                InsertError::AlreadyExists(_) => {
                    debug!("{} was created concurrently", self.table);
                    Ok(())
                }
                other => Err(other),
            },
        }
    }
}
