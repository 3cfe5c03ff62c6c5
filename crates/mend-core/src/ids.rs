use chrono::Utc;
use uuid::Uuid;

/// First eight hex characters of an id, for branch names and log lines.
pub fn short_id(id: &Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

/// Branch name for one pipeline run: `feedback-<short-id>-<timestamp-ms>`.
/// The millisecond suffix keeps retried feedbacks on distinct branches.
pub fn branch_name(feedback_id: &Uuid) -> String {
    format!(
        "feedback-{}-{}",
        short_id(feedback_id),
        Utc::now().timestamp_millis()
    )
}
