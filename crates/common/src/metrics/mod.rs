//! Metrics and observability utilities
//!
//! Prometheus metrics with standardized naming for the generation pipeline.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

/// Metrics prefix for all Portray metrics
pub const METRICS_PREFIX: &str = "portray";

/// Buckets for generation latency (remote image API calls are slow)
pub const GENERATION_BUCKETS: &[f64] = &[
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.500,  // 2.5s
    5.000,  // 5s
    10.00,  // 10s
    30.00,  // 30s
    60.00,  // 60s
    120.0,  // 2m
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Submission metrics
    describe_counter!(
        format!("{}_batches_submitted_total", METRICS_PREFIX),
        Unit::Count,
        "Total generation batches submitted"
    );

    describe_counter!(
        format!("{}_jobs_enqueued_total", METRICS_PREFIX),
        Unit::Count,
        "Total generation jobs enqueued"
    );

    // Job metrics
    describe_counter!(
        format!("{}_jobs_finalized_total", METRICS_PREFIX),
        Unit::Count,
        "Total jobs reaching a terminal state"
    );

    describe_counter!(
        format!("{}_jobs_rate_limited_total", METRICS_PREFIX),
        Unit::Count,
        "Total jobs parked for a rate-limit retry"
    );

    describe_counter!(
        format!("{}_stale_locks_reclaimed_total", METRICS_PREFIX),
        Unit::Count,
        "Total stale job locks reclaimed"
    );

    // Generation metrics
    describe_counter!(
        format!("{}_generation_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total generation API requests"
    );

    describe_histogram!(
        format!("{}_generation_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Generation API call latency in seconds"
    );

    describe_counter!(
        format!("{}_photos_uploaded_total", METRICS_PREFIX),
        Unit::Count,
        "Total photos uploaded to blob storage"
    );

    // Queue metrics
    describe_gauge!(
        format!("{}_queue_depth", METRICS_PREFIX),
        Unit::Count,
        "Number of messages in the wake-up queue"
    );

    tracing::info!("Metrics registered");
}

/// Record a submission and its fan-out
pub fn record_submission(job_count: usize) {
    counter!(format!("{}_batches_submitted_total", METRICS_PREFIX)).increment(1);
    counter!(format!("{}_jobs_enqueued_total", METRICS_PREFIX)).increment(job_count as u64);
}

/// Record a generation API call
pub fn record_generation(duration_secs: f64, model: &str, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_generation_requests_total", METRICS_PREFIX),
        "model" => model.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    if success {
        histogram!(
            format!("{}_generation_duration_seconds", METRICS_PREFIX),
            "model" => model.to_string()
        )
        .record(duration_secs);
    }
}

/// Record a job reaching a terminal state
pub fn record_job_finalized(status: &str) {
    counter!(
        format!("{}_jobs_finalized_total", METRICS_PREFIX),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a job parked for a rate-limit retry
pub fn record_rate_limited() {
    counter!(format!("{}_jobs_rate_limited_total", METRICS_PREFIX)).increment(1);
}

/// Record stale lock reclamation
pub fn record_stale_locks(count: u64) {
    if count > 0 {
        counter!(format!("{}_stale_locks_reclaimed_total", METRICS_PREFIX)).increment(count);
    }
}

/// Record a photo landing in blob storage
pub fn record_photo_uploaded() {
    counter!(format!("{}_photos_uploaded_total", METRICS_PREFIX)).increment(1);
}

/// Record wake-up queue depth
pub fn record_queue_depth(depth: usize) {
    gauge!(format!("{}_queue_depth", METRICS_PREFIX)).set(depth as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_buckets_sorted() {
        let mut prev = 0.0;
        for &bucket in GENERATION_BUCKETS {
            assert!(bucket > prev);
            prev = bucket;
        }
    }

    #[test]
    fn test_recording_does_not_panic() {
        record_submission(4);
        record_generation(1.5, "mock-image-model", true);
        record_generation(0.2, "mock-image-model", false);
        record_job_finalized("completed");
        record_rate_limited();
        record_stale_locks(2);
        record_photo_uploaded();
        record_queue_depth(3);
    }
}
