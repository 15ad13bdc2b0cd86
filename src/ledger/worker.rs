//! Expiry Sweeper
//!
//! Background worker that gives every non-terminal record an SLA-bounded
//! resolution:
//! - PENDING past its deadline: ask the gateway, then complete, fail or expire
//! - CREATED older than `abandon_after`: no instance is still submitting it, fail it
//! - SUBMITTED older than the SLA: the queued ack was lost, acknowledge it
//!
//! Every change goes through the engine's compare-and-swap transitions, so
//! several sweepers may run against one store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::engine::LedgerEngine;
use super::error::LedgerError;
use super::state::LedgerState;
use super::types::LedgerRecord;
use crate::gateway::GatewayStatus;

/// Configuration for the expiry sweeper
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// How often to scan
    pub scan_interval: Duration,
    /// Maximum records per category per scan
    pub batch_size: usize,
    /// Poll the gateway before declaring an expired record FAILED
    pub reconcile_with_gateway: bool,
    /// Age at which a CREATED record counts as abandoned. Must be longer than
    /// the slowest initiate retry loop on any instance sharing the store.
    pub abandon_after: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(15),
            batch_size: 100,
            reconcile_with_gateway: true,
            abandon_after: Duration::from_secs(600),
        }
    }
}

/// What one sweep changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub reconciled: usize,
    pub abandoned: usize,
    pub acknowledged: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.expired + self.reconciled + self.abandoned + self.acknowledged
    }
}

pub struct ExpirySweeper {
    engine: Arc<LedgerEngine>,
    config: SweeperConfig,
}

impl ExpirySweeper {
    pub fn new(engine: Arc<LedgerEngine>, config: SweeperConfig) -> Self {
        Self { engine, config }
    }

    pub fn with_defaults(engine: Arc<LedgerEngine>) -> Self {
        Self::new(engine, SweeperConfig::default())
    }

    /// Run the sweeper loop forever.
    pub async fn run(&self) -> ! {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            pending_sla_secs = self.engine.config().pending_sla.as_secs(),
            reconcile = self.config.reconcile_with_gateway,
            abandon_after_secs = self.config.abandon_after.as_secs(),
            "Starting expiry sweeper"
        );

        loop {
            match self.sweep_once().await {
                Ok(report) if report.total() > 0 => {
                    info!(
                        expired = report.expired,
                        reconciled = report.reconciled,
                        abandoned = report.abandoned,
                        acknowledged = report.acknowledged,
                        "Sweep finished"
                    );
                }
                Ok(_) => debug!("Sweep found nothing to do"),
                Err(e) => error!(error = %e, "Sweep failed"),
            }

            tokio::time::sleep(self.config.scan_interval).await;
        }
    }

    /// Run a single sweep.
    pub async fn sweep_once(&self) -> Result<SweepReport, LedgerError> {
        let now = Utc::now();
        let store = self.engine.store();
        let mut report = SweepReport::default();

        let expired = store
            .find_expired_pending(now, self.config.batch_size)
            .await?;
        for record in expired {
            match self.resolve_expired(&record).await {
                Ok(Resolution::Reconciled) => report.reconciled += 1,
                Ok(Resolution::Expired) => report.expired += 1,
                Ok(Resolution::Unchanged) => {}
                Err(e) => {
                    error!(record_id = %record.id, error = %e, "Failed to resolve expired record")
                }
            }
        }

        let abandon_after = chrono::Duration::from_std(self.config.abandon_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let created = store
            .find_stale(LedgerState::Created, now - abandon_after, self.config.batch_size)
            .await?;
        for record in created {
            match self
                .engine
                .abandon(record.id, "gateway was never reached")
                .await
            {
                Ok(t) if t.applied => {
                    warn!(record_id = %record.id, "Abandoned stale CREATED record");
                    report.abandoned += 1;
                }
                Ok(_) => {}
                Err(e) => error!(record_id = %record.id, error = %e, "Failed to abandon record"),
            }
        }

        let sla = chrono::Duration::from_std(self.engine.config().pending_sla)
            .unwrap_or_else(|_| chrono::Duration::seconds(180));
        let submitted = store
            .find_stale(LedgerState::Submitted, now - sla, self.config.batch_size)
            .await?;
        for record in submitted {
            match self.engine.acknowledge(record.id).await {
                Ok(t) if t.applied => {
                    warn!(record_id = %record.id, "Acknowledged stale SUBMITTED record");
                    report.acknowledged += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(record_id = %record.id, error = %e, "Failed to acknowledge record")
                }
            }
        }

        Ok(report)
    }

    async fn resolve_expired(&self, record: &LedgerRecord) -> Result<Resolution, LedgerError> {
        if self.config.reconcile_with_gateway
            && let Some(reference) = &record.external_reference
        {
            match self
                .engine
                .gateway()
                .query_status(record.kind, reference)
                .await
            {
                Ok(GatewayStatus::Settled(outcome)) => {
                    match self.engine.apply_callback(&outcome).await {
                        Ok(updated) => {
                            info!(
                                record_id = %record.id,
                                state = %updated.state,
                                "Expired record reconciled with gateway"
                            );
                            return Ok(if updated.state.is_terminal() {
                                Resolution::Reconciled
                            } else {
                                Resolution::Unchanged
                            });
                        }
                        // An unusable settlement must not pin the record in PENDING
                        Err(e @ LedgerError::MalformedCallback(_)) => {
                            warn!(
                                record_id = %record.id,
                                error = %e,
                                "Gateway settlement rejected, expiring record"
                            );
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(GatewayStatus::InProgress) => {
                    debug!(record_id = %record.id, "Gateway still processing, expiring anyway");
                }
                Ok(GatewayStatus::Unknown) => {}
                Err(e) => {
                    warn!(record_id = %record.id, error = %e, "Gateway status query failed");
                }
            }
        }

        let result = self.engine.expire(record.id).await?;
        Ok(if result.applied {
            info!(record_id = %record.id, "Pending record timed out");
            Resolution::Expired
        } else {
            Resolution::Unchanged
        })
    }
}

enum Resolution {
    Reconciled,
    Expired,
    Unchanged,
}
