//! OpenTelemetry instruments for connection, subscription, record, RPC and
//! listener activity. All instruments are prefixed `meshsync.server.*`.
//!
//! ```rust,no_run
//! use meshsync_server::ServerMetrics;
//!
//! let metrics = ServerMetrics::new("my-service");
//! metrics.record_connection(5);
//! metrics.record_request("READ", "success", 0.025);
//! ```

use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, Meter},
    KeyValue,
};

pub struct ServerMetrics {
    pub connections_active: Gauge<i64>,
    pub connections_total: Counter<u64>,
    /// Dispatched actions across all topics (READ, UPDATE, PROVIDE, LISTEN, ...).
    pub requests_total: Counter<u64>,
    pub request_duration: Histogram<f64>,
    /// Local subscriber count, tagged by topic.
    pub subscribers_total: Gauge<i64>,
    pub publish_total: Counter<u64>,
    pub errors_total: Counter<u64>,
    /// Listener reconcile passes (tagged `outcome=assigned|cleared|no_candidate`).
    pub listener_reconciles_total: Counter<u64>,
    /// Records currently held in the cache, pinned or not.
    pub records_cached: Gauge<i64>,
}

impl ServerMetrics {
    pub fn new(service_name: impl Into<String>) -> Self {
        let name: &'static str = Box::leak(service_name.into().into_boxed_str());
        let meter = global::meter(name);
        Self::new_with_meter(&meter)
    }

    pub fn new_with_meter(meter: &Meter) -> Self {
        Self {
            connections_active: meter
                .i64_gauge("meshsync.server.connections.active")
                .with_description("Number of active transport connections")
                .build(),
            connections_total: meter
                .u64_counter("meshsync.server.connections.total")
                .with_description("Total number of connections established")
                .build(),
            requests_total: meter
                .u64_counter("meshsync.server.requests.total")
                .with_description("Total number of actions dispatched")
                .build(),
            request_duration: meter
                .f64_histogram("meshsync.server.request.duration")
                .with_description("Action handling duration in seconds")
                .build(),
            subscribers_total: meter
                .i64_gauge("meshsync.server.subscribers.total")
                .with_description("Total number of active subscribers")
                .build(),
            publish_total: meter
                .u64_counter("meshsync.server.publish.total")
                .with_description("Total number of messages published")
                .build(),
            errors_total: meter
                .u64_counter("meshsync.server.errors.total")
                .with_description("Total number of errors encountered")
                .build(),
            listener_reconciles_total: meter
                .u64_counter("meshsync.server.listener.reconciles.total")
                .with_description("Listener provider reconcile passes")
                .build(),
            records_cached: meter
                .i64_gauge("meshsync.server.records.cached")
                .with_description("Records currently held in the record cache")
                .build(),
        }
    }

    /// Record a new connection
    pub fn record_connection(&self, active: i64) {
        self.connections_active.record(active, &[]);
        self.connections_total.add(1, &[]);
    }

    /// Record a disconnection
    pub fn record_disconnection(&self, active: i64) {
        self.connections_active.record(active, &[]);
    }

    /// Record a request
    pub fn record_request(&self, method: &str, status: &str, duration_secs: f64) {
        let attributes = &[
            KeyValue::new("method", method.to_string()),
            KeyValue::new("status", status.to_string()),
        ];
        self.requests_total.add(1, attributes);
        self.request_duration.record(duration_secs, attributes);
    }

    /// Update subscriber count
    pub fn update_subscribers(&self, topic: &str, count: i64) {
        let attributes = &[KeyValue::new("topic", topic.to_string())];
        self.subscribers_total.record(count, attributes);
    }

    /// Record a published message
    pub fn record_publish(&self, topic: &str) {
        let attributes = &[KeyValue::new("topic", topic.to_string())];
        self.publish_total.add(1, attributes);
    }

    /// Record an error
    pub fn record_error(&self, error_type: &str) {
        let attributes = &[KeyValue::new("error_type", error_type.to_string())];
        self.errors_total.add(1, attributes);
    }

    pub fn record_listener_reconcile(&self, outcome: &str) {
        let attributes = &[KeyValue::new("outcome", outcome.to_string())];
        self.listener_reconciles_total.add(1, attributes);
    }

    pub fn update_records_cached(&self, count: i64) {
        self.records_cached.record(count, &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = ServerMetrics::new("test-server");
        
        // Just test that metrics can be created without panicking
        metrics.record_connection(1);
        metrics.record_request("test_method", "success", 0.1);
        metrics.update_subscribers("test_topic", 5);
        metrics.record_publish("test_topic");
        metrics.record_error("test_error");
        metrics.record_disconnection(0);
        metrics.record_listener_reconcile("assigned");
        metrics.update_records_cached(42);
    }

    #[test]
    fn test_connection_metrics() {
        let metrics = ServerMetrics::new("test-server-conn");
        
        // Record connections
        metrics.record_connection(1);
        metrics.record_connection(2);
        metrics.record_connection(3);
        
        // Record disconnections
        metrics.record_disconnection(2);
        metrics.record_disconnection(1);
        metrics.record_disconnection(0);
    }

    #[test]
    fn test_request_metrics() {
        let metrics = ServerMetrics::new("test-server-req");
        
        // Record successful requests
        metrics.record_request("add", "success", 0.05);
        metrics.record_request("multiply", "success", 0.03);
        
        // Record failed requests
        metrics.record_request("divide", "error", 0.01);
        
        // Record errors
        metrics.record_error("invalid_params");
        metrics.record_error("method_not_found");
    }

    #[test]
    fn test_pubsub_metrics() {
        let metrics = ServerMetrics::new("test-server-pubsub");
        
        // Update subscriber counts
        metrics.update_subscribers("events", 5);
        metrics.update_subscribers("logs", 3);
        metrics.update_subscribers("events", 7);
        
        // Record publishes
        metrics.record_publish("events");
        metrics.record_publish("logs");
        metrics.record_publish("events");
        metrics.record_publish("events");
    }
}

