use serde::{Deserialize, Serialize};

use crate::error::DrError;

// ============================================================================
// Response envelope
// ============================================================================

/// Structured success/failure envelope returned by every stage endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failure class from [`DrError::kind`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl<T> Envelope<T> {
    pub fn data(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            error: None,
            kind: None,
        }
    }

    pub fn failure(err: &DrError) -> Self {
        Self {
            success: false,
            data: None,
            message: None,
            error: Some(err.to_string()),
            kind: Some(err.kind().to_string()),
        }
    }
}

impl Envelope<()> {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: None,
            message: Some(message.into()),
            error: None,
            kind: None,
        }
    }
}

// ============================================================================
// Batch outcomes
// ============================================================================

/// Outcome for one item of a batch stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome<T> {
    /// Natural key of the item (serial, canonical name, path, VM name).
    pub key: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Per-item results of a batch stage. A failed item never hides the
/// outcome of its siblings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport<T> {
    pub items: Vec<ItemOutcome<T>>,
    pub succeeded: usize,
    pub failed: usize,
}

impl<T> Default for BatchReport<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            succeeded: 0,
            failed: 0,
        }
    }
}

impl<T> BatchReport<T> {
    pub fn push_ok(&mut self, key: impl Into<String>, data: T) {
        self.succeeded += 1;
        self.items.push(ItemOutcome {
            key: key.into(),
            ok: true,
            data: Some(data),
            error: None,
            kind: None,
        });
    }

    pub fn push_err(&mut self, key: impl Into<String>, err: &DrError) {
        self.failed += 1;
        self.items.push(ItemOutcome {
            key: key.into(),
            ok: false,
            data: None,
            error: Some(err.to_string()),
            kind: Some(err.kind().to_string()),
        });
    }

    pub fn push(&mut self, key: impl Into<String>, result: Result<T, DrError>) {
        match result {
            Ok(data) => self.push_ok(key, data),
            Err(e) => self.push_err(key, &e),
        }
    }

    pub fn success_count(&self) -> usize {
        self.succeeded
    }

    pub fn failure_count(&self) -> usize {
        self.failed
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Outcome for `key`, if the batch contained it.
    pub fn get(&self, key: &str) -> Option<&ItemOutcome<T>> {
        self.items.iter().find(|i| i.key == key)
    }

    /// Order items by key so reports are stable regardless of completion order.
    pub fn sorted(mut self) -> Self {
        self.items.sort_by(|a, b| a.key.cmp(&b.key));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_success_omits_error() {
        let env = Envelope::data(vec![1, 2]);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"], serde_json::json!([1, 2]));
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_envelope_failure_carries_kind() {
        let env: Envelope<()> = Envelope::failure(&DrError::invalid("missing vms"));
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["kind"], "invalid_input");
        assert!(json["error"].as_str().unwrap().contains("missing vms"));
        assert!(json.get("data").is_none());
    }

    #[test]
    fn test_envelope_message() {
        let env = Envelope::message("Reinitialized");
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["message"], "Reinitialized");
    }

    #[test]
    fn test_batch_report_counts() {
        let mut report = BatchReport::default();
        report.push_ok("b", 1);
        report.push("a", Err(DrError::invalid("nope")));
        report.push("c", Ok(3));
        assert_eq!(report.success_count(), 2);
        assert_eq!(report.failure_count(), 1);

        let report = report.sorted();
        assert_eq!(report.items[0].key, "a");
        assert!(!report.get("a").unwrap().ok);
        assert_eq!(report.get("a").unwrap().kind.as_deref(), Some("invalid_input"));
        assert_eq!(report.get("c").unwrap().data, Some(3));
    }

    #[test]
    fn test_batch_report_parses_failed_items_without_data() {
        #[derive(Debug, PartialEq, Deserialize)]
        struct Mounted {
            datastore: String,
        }

        let json = serde_json::json!({
            "items": [
                { "key": "a", "ok": true, "data": { "datastore": "VOL-A" } },
                { "key": "b", "ok": false, "error": "gone", "kind": "not_found" }
            ],
            "succeeded": 1,
            "failed": 1
        });
        let report: BatchReport<Mounted> = serde_json::from_value(json).unwrap();
        assert_eq!(
            report.get("a").unwrap().data,
            Some(Mounted {
                datastore: "VOL-A".to_string()
            })
        );
        assert!(report.get("b").unwrap().data.is_none());
        assert_eq!(report.get("b").unwrap().kind.as_deref(), Some("not_found"));
    }

    #[test]
    fn test_batch_report_default_empty() {
        let report: BatchReport<()> = BatchReport::default();
        assert!(report.is_empty());
        assert_eq!(report.success_count(), 0);
        assert_eq!(report.failure_count(), 0);
    }
}
