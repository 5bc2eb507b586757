//! Prefixed, time-ordered id constructors.
//!
//! All persisted entities use UUID v7 ids with a short type prefix so an id
//! is self-describing in logs and database dumps. UUID v7 ids sort by
//! creation time, which the stores rely on for natural ordering.

use uuid::Uuid;

/// New session id (`ses_` prefix).
#[must_use]
pub fn session_id() -> String {
    format!("ses_{}", Uuid::now_v7())
}

/// New message id (`msg_` prefix).
#[must_use]
pub fn message_id() -> String {
    format!("msg_{}", Uuid::now_v7())
}

/// New part id (`prt_` prefix).
#[must_use]
pub fn part_id() -> String {
    format!("prt_{}", Uuid::now_v7())
}

/// New tool-call id (`tc_` prefix).
#[must_use]
pub fn tool_call_id() -> String {
    format!("tc_{}", Uuid::now_v7())
}

/// Current UTC timestamp as RFC 3339.
#[must_use]
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_prefixes() {
        assert!(session_id().starts_with("ses_"));
        assert!(message_id().starts_with("msg_"));
        assert!(part_id().starts_with("prt_"));
        assert!(tool_call_id().starts_with("tc_"));
    }

    #[test]
    fn ids_are_unique() {
        let a = message_id();
        let b = message_id();
        assert_ne!(a, b);
    }

    #[test]
    fn ids_sort_by_creation_time() {
        let earlier = part_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let later = part_id();
        assert!(earlier < later);
    }

    #[test]
    fn timestamp_is_rfc3339() {
        let ts = now_rfc3339();
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }
}
