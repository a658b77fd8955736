use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, instrument};

use crate::aggregate::Period;
use crate::app::AppContext;

/// Scheduled recompute of the current and previous month.
///
/// The previous month is included so events ingested late (a batch job over last
/// month's logs) are reflected without a manual recompute. Recomputes are full replaces,
/// so running this repeatedly is safe.
#[instrument(skip_all)]
pub async fn run(ctx: &AppContext) -> Result<()> {
    let current = Period::month_of(Utc::now().date_naive())?;
    let previous = current.previous_month()?;

    for period in [previous, current] {
        let report = ctx
            .aggregator
            .recompute(&period.label)
            .await
            .with_context(|| format!("recomputing digest stats for {}", period.label))?;
        ctx.metrics.set_digest_stats(&report.period, report.stats.len());
        info!(
            period = %report.period,
            digests = report.stats.len(),
            instances = report.instances.len(),
            "scheduled aggregation finished"
        );
    }
    Ok(())
}
