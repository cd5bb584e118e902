use metrics::{describe_counter, describe_gauge, describe_histogram};

// bridges currently open, labelled by direction
pub const METRICS_BRIDGE_LIVE: &str = "relay_bridge_bridge_live";

// proxied sessions, labelled by direction
pub const METRICS_SESSION_LIVE: &str = "relay_bridge_session_live";
pub const METRICS_SESSION_COUNT: &str = "relay_bridge_session_count";
pub const METRICS_SESSION_ERROR_COUNT: &str = "relay_bridge_session_error_count";
pub const METRICS_SESSION_DURATION: &str = "relay_bridge_session_duration";

// opposite side connect failures, labelled by direction
pub const METRICS_CONNECT_ERROR_COUNT: &str = "relay_bridge_connect_error_count";

// payload, upstream is local -> relay
pub const METRICS_BYTES_UPSTREAM: &str = "relay_bridge_bytes_upstream";
pub const METRICS_BYTES_DOWNSTREAM: &str = "relay_bridge_bytes_downstream";

pub fn describe_metrics() {
    describe_gauge!(METRICS_BRIDGE_LIVE, "Open bridges");

    describe_gauge!(METRICS_SESSION_LIVE, "Live proxied sessions");
    describe_counter!(METRICS_SESSION_COUNT, "Number of proxied sessions");
    describe_counter!(METRICS_SESSION_ERROR_COUNT, "Number of sessions ended by an I/O error");
    describe_histogram!(METRICS_SESSION_DURATION, "Session duration in seconds");

    describe_counter!(METRICS_CONNECT_ERROR_COUNT, "Number of failed opposite side connects");

    describe_counter!(METRICS_BYTES_UPSTREAM, "Bytes copied from local to relay");
    describe_counter!(METRICS_BYTES_DOWNSTREAM, "Bytes copied from relay to local");
}
