// ==== Reader metrics ====

/// Counter for records emitted by the reader
pub const RECORDS_READ: &str = "partitioned_log_records_read_total";

/// Counter for payload bytes emitted by the reader
pub const BYTES_READ: &str = "partitioned_log_bytes_read_total";

/// Gauge for unread records per partition relative to the read position
pub const BACKLOG_RECORDS: &str = "partitioned_log_backlog_records";

/// Gauge for estimated unread bytes per partition
pub const BACKLOG_BYTES: &str = "partitioned_log_backlog_bytes";

// ==== Checkpoint metrics ====

/// Counter for best-effort consumer-group commits enqueued on finalize
pub const CHECKPOINT_COMMITS_ENQUEUED: &str = "partitioned_log_checkpoint_commits_enqueued_total";

// ==== Sink metrics ====

/// Counter for records written, labelled by shard
pub const RECORDS_WRITTEN: &str = "partitioned_log_records_written_total";

/// Counter for sink transactions committed, labelled by shard
pub const TRANSACTIONS_COMMITTED: &str = "partitioned_log_transactions_committed_total";

/// Counter for sink transactions aborted, labelled by shard
pub const TRANSACTIONS_ABORTED: &str = "partitioned_log_transactions_aborted_total";
