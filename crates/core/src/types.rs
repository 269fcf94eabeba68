/// Job identifiers are assigned by the upstream producer and carried
/// verbatim in the queue envelope.
pub type JobId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
