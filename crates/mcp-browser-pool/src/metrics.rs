//! Pool metrics, recorded through the `metrics` facade.
//!
//! Nothing is exported from here; without an installed recorder every call
//! is a no-op.

/// Record the pool's current size after it changes.
pub fn record_pool_size(total: usize, in_use: usize) {
    metrics::gauge!("browser_pool_instances").set(total as f64);
    metrics::gauge!("browser_pool_instances_in_use").set(in_use as f64);
}

/// Record a newly created instance.
pub fn record_instance_created() {
    metrics::counter!("browser_pool_instances_created_total").increment(1);
}

/// Record destroyed instances, labelled by why they went away.
pub fn record_instances_destroyed(reason: &str, count: usize) {
    let labels = [("reason", reason.to_string())];
    metrics::counter!("browser_pool_instances_destroyed_total", &labels).increment(count as u64);
}

/// Record an `acquire` rejected because the pool was full.
pub fn record_exhausted() {
    metrics::counter!("browser_pool_exhausted_total").increment(1);
}

/// Record a context creation that failed after retries, by original error code.
pub fn record_context_failure(code: &str) {
    let labels = [("code", code.to_string())];
    metrics::counter!("browser_context_failures_total", &labels).increment(1);
}
