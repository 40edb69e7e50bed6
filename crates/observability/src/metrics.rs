//! Job runner metrics.
//!
//! Recording goes through the `metrics` facade; without an installed recorder
//! every call is a no-op, so libraries record unconditionally and only the
//! binary decides whether to export.

use std::net::SocketAddr;

use metrics::{Unit, describe_counter, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

pub const JOBS_CLAIMED: &str = "courier_jobs_claimed_total";
pub const JOBS_SUCCEEDED: &str = "courier_jobs_succeeded_total";
pub const JOBS_FAILED: &str = "courier_jobs_failed_total";
pub const JOB_CLAIM_ERRORS: &str = "courier_job_claim_errors_total";
pub const JOB_DURATION: &str = "courier_job_duration_seconds";

/// Label carrying the job name.
pub const LABEL_JOB_NAME: &str = "job_name";

/// Register descriptions for every runner metric.
pub fn describe() {
    describe_counter!(JOBS_CLAIMED, Unit::Count, "Jobs claimed from the store");
    describe_counter!(
        JOBS_SUCCEEDED,
        Unit::Count,
        "Jobs whose handler succeeded and whose row was deleted"
    );
    describe_counter!(
        JOBS_FAILED,
        Unit::Count,
        "Jobs whose handler run did not succeed"
    );
    describe_counter!(JOB_CLAIM_ERRORS, Unit::Count, "Claim attempts that hit a storage error");
    describe_histogram!(JOB_DURATION, Unit::Seconds, "Handler execution time");
}

/// Install a Prometheus recorder serving `/metrics` on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn install_prometheus(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    describe();
    Ok(())
}
