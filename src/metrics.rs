//! Process-wide counters, exposed in Prometheus text format at `/metrics`.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($(($static_name:ident, $inc_fn:ident, $metric:literal, $help:literal)),* $(,)?) => {
        $(
            static $static_name: AtomicU64 = AtomicU64::new(0);

            pub fn $inc_fn() {
                $static_name.fetch_add(1, Ordering::Relaxed);
            }
        )*

        /// Render all counters as Prometheus text exposition.
        pub fn render() -> String {
            let mut out = String::new();
            $(
                out.push_str(concat!("# HELP ", $metric, " ", $help, "\n"));
                out.push_str(concat!("# TYPE ", $metric, " counter\n"));
                out.push_str($metric);
                out.push(' ');
                out.push_str(&$static_name.load(Ordering::Relaxed).to_string());
                out.push('\n');
            )*
            out
        }
    };
}

counters!(
    (
        JOB_PROXY_REQUESTS,
        inc_job_proxy_requests,
        "pub_job_proxy_requests",
        "Incoming requests accessing the Job proxy"
    ),
    (
        JOB_PROXY_ERRORS,
        inc_job_proxy_errors,
        "pub_job_proxy_errors",
        "Reverse proxy failures while forwarding to a Job"
    ),
    (
        JOB_PROXY_REQUEST_ERRORS,
        inc_job_proxy_request_errors,
        "pub_job_proxy_request_errors",
        "Proxy request failures caused by bad requests"
    ),
    (
        JOB_PROXY_CONNECTION_BROKEN,
        inc_job_proxy_connection_broken,
        "pub_job_proxy_connection_broken_errors",
        "Proxy failures due to a broken connection to a Job"
    ),
    (
        JOB_PROXY_CONNECTION_REFUSED,
        inc_job_proxy_connection_refused,
        "pub_job_proxy_connection_refused_errors",
        "Proxy failures due to a refused connection to a Job"
    ),
    (
        JOB_PROXY_CONTEXT_CANCELED,
        inc_job_proxy_context_canceled,
        "pub_job_proxy_context_canceled_errors",
        "Proxy failures due to a canceled request"
    ),
    (
        JOB_PROXY_CONTEXT_DEADLINE,
        inc_job_proxy_context_deadline,
        "pub_job_proxy_context_deadline_errors",
        "Proxy failures due to a timed out Job call"
    ),
    (
        LIFECYCLE_CALLS,
        inc_lifecycle_calls,
        "pub_lifecycle_calls",
        "Calls made to the Lifecycle component"
    ),
    (
        LIFECYCLE_ERRORS,
        inc_lifecycle_errors,
        "pub_lifecycle_errors",
        "Failed calls to the Lifecycle component"
    ),
    (
        LIFECYCLE_CACHE_HITS,
        inc_lifecycle_cache_hits,
        "pub_lifecycle_cache_hits",
        "Authorization results served from the fresh cache"
    ),
    (
        LIFECYCLE_CACHE_STALE_HITS,
        inc_lifecycle_cache_stale_hits,
        "pub_lifecycle_cache_stale_hits",
        "Authorization results served stale during a Lifecycle outage"
    ),
    (
        AUTH_SUCCESSFUL,
        inc_auth_successful,
        "pub_auth_successful",
        "Successful authentication attempts"
    ),
    (
        AUTH_FAILED,
        inc_auth_failed,
        "pub_auth_failed",
        "Failed authentication attempts"
    ),
    (
        ASYNC_JOB_CALLS_STARTED,
        inc_async_job_calls_started,
        "pub_async_job_calls_started",
        "Async job call tasks started"
    ),
    (
        ASYNC_JOB_CALLS_DONE,
        inc_async_job_calls_done,
        "pub_async_job_calls_done",
        "Async job call tasks ended successfully"
    ),
    (
        ASYNC_JOB_CALLS_ERRORS,
        inc_async_job_calls_errors,
        "pub_async_job_calls_errors",
        "Async job call tasks ended with an error"
    ),
    (
        ASYNC_RETRIED_CRASHED_TASK,
        inc_async_retried_crashed_task,
        "pub_async_retried_crashed_task",
        "Async tasks retried after a crashed job call"
    ),
    (
        ASYNC_RETRIED_MISSING_TASK,
        inc_async_retried_missing_task,
        "pub_async_retried_missing_task",
        "Async tasks resumed after going missing from their replica"
    ),
    (
        ASYNC_RETRIED_TASK,
        inc_async_retried_task,
        "pub_async_retried_task",
        "Async task retries, for any reason"
    ),
    (
        PANIC_ERRORS,
        inc_panic_errors,
        "pub_panic_errors",
        "Panics recovered in request handlers"
    ),
    (
        HEALTH_REQUESTS,
        inc_health_requests,
        "pub_health_requests",
        "Health-check requests"
    ),
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_contains_counter_lines() {
        inc_health_requests();
        let text = render();
        assert!(text.contains("# TYPE pub_health_requests counter"));
        assert!(text.contains("pub_job_proxy_requests "));
    }
}
