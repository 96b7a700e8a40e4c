// ==== Polling ====
/// Counter for records returned by the broker client
pub const CONSUMER_RECORDS_RECEIVED: &str = "durable_consumer_records_received_total";

/// Counter for poll errors, labelled fatal or retriable
pub const CONSUMER_POLL_ERRORS: &str = "durable_consumer_poll_errors_total";

/// Counter for payloads that carried the magic prefix but failed to decode
pub const CONSUMER_FORMAT_ERRORS: &str = "durable_consumer_format_errors_total";

// ==== Dispatch ====
/// Counter for handler dispatches, labelled by outcome
pub const HANDLER_DISPATCHES: &str = "durable_consumer_handler_dispatches_total";

/// Counter for completion sinks dropped without a signal
pub const HANDLER_SINKS_DROPPED: &str = "durable_consumer_handler_sinks_dropped_total";

// ==== Watermarks ====
/// Gauge for the in-memory watermark per partition
pub const PARTITION_WATERMARK: &str = "durable_consumer_partition_watermark";

/// Gauge for dispatches still awaiting a completion per partition
pub const PARTITION_PENDING: &str = "durable_consumer_partition_pending";

/// Counter for partitions reset because the broker repositioned them
pub const PARTITION_RESETS: &str = "durable_consumer_partition_resets_total";

// ==== Commits ====
/// Counter for commit attempts, labelled by status
pub const COMMIT_ATTEMPTS: &str = "durable_consumer_commit_attempts_total";

/// Histogram for commit call duration in milliseconds
pub const COMMIT_DURATION_MS: &str = "durable_consumer_commit_duration_ms";
