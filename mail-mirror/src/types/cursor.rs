//! Page tokens for descending `latest_received_on` listings.
//!
//! Tokens are `<latest_received_on>|<id>`. The id breaks ties between
//! threads that share a timestamp, so chained pages never skip or repeat a
//! row. A bare timestamp token is still accepted and means "strictly older".

use std::cmp::Ordering;

use crate::types::Thread;

const SEPARATOR: char = '|';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
    pub received_on: String,
    pub id: Option<String>,
}

impl PageCursor {
    /// Cursor positioned just after `thread` in listing order
    pub fn after(thread: &Thread) -> Self {
        Self {
            received_on: thread.latest_received_on.clone(),
            id: Some(thread.id.clone()),
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        match token.split_once(SEPARATOR) {
            Some((received_on, id)) if !id.is_empty() => Some(Self {
                received_on: received_on.to_string(),
                id: Some(id.to_string()),
            }),
            Some((received_on, _)) => Some(Self {
                received_on: received_on.to_string(),
                id: None,
            }),
            None => Some(Self {
                received_on: token.to_string(),
                id: None,
            }),
        }
    }

    pub fn encode(&self) -> String {
        match &self.id {
            Some(id) => format!("{}{}{}", self.received_on, SEPARATOR, id),
            None => self.received_on.clone(),
        }
    }
}

/// Listing order: newest first, id descending within a timestamp
pub fn listing_order(a: &Thread, b: &Thread) -> Ordering {
    b.latest_received_on
        .cmp(&a.latest_received_on)
        .then_with(|| b.id.cmp(&a.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Sender;

    fn thread(id: &str, received_on: &str) -> Thread {
        Thread {
            id: id.into(),
            thread_id: id.into(),
            provider_id: "google".into(),
            latest_sender: Sender {
                name: None,
                email: "a@example.com".into(),
            },
            latest_received_on: received_on.into(),
            latest_subject: String::new(),
        }
    }

    #[test]
    fn test_parse_composite() {
        let cursor = PageCursor::parse("2024-01-02T00:00:00.000Z|t-9").unwrap();
        assert_eq!(cursor.received_on, "2024-01-02T00:00:00.000Z");
        assert_eq!(cursor.id.as_deref(), Some("t-9"));
        assert_eq!(cursor.encode(), "2024-01-02T00:00:00.000Z|t-9");
    }

    #[test]
    fn test_parse_bare_timestamp() {
        let cursor = PageCursor::parse("2024-01-02T00:00:00.000Z").unwrap();
        assert_eq!(cursor.id, None);
        assert!(PageCursor::parse("  ").is_none());
    }

    #[test]
    fn test_listing_order() {
        let mut threads = vec![
            thread("a", "2024-01-01T00:00:00.000Z"),
            thread("c", "2024-01-02T00:00:00.000Z"),
            thread("b", "2024-01-02T00:00:00.000Z"),
        ];
        threads.sort_by(listing_order);
        let ids: Vec<&str> = threads.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }
}
