//! Recover structured records from mixed log/JSON script output.
//!
//! PowerCLI writes host messages and warnings to stdout ahead of the
//! payload, and its serializer is not contract-stable across versions. The
//! extractor skips everything before the first line that opens a JSON
//! object or array, parses the JSON documents from there, and only when
//! that fails applies a repair pass (quote bare keys, normalize single
//! quotes) before trying again.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use drctl_core::{DrError, Result};

/// Longest excerpt of a bad payload carried in the error.
const EXCERPT_LEN: usize = 200;

/// Bare word immediately preceding a colon in key position.
static BARE_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:"#).expect("bare key pattern is valid")
});

/// The payload portion of `stdout`: everything from the first line whose
/// trimmed content starts with `{` or `[`.
pub fn payload_start(stdout: &str) -> Option<&str> {
    let mut offset = 0;
    for line in stdout.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            return Some(stdout[offset + (line.len() - trimmed.len())..].trim_end());
        }
        offset += line.len();
    }
    None
}

/// Best-effort syntactic repair: quote bare keys, then turn single quotes
/// into double quotes. Lossy for strings containing quotes or colons.
pub fn repair(text: &str) -> Cow<'_, str> {
    let keyed = BARE_KEY.replace_all(text, r#"$1"$2":"#);
    if keyed.contains('\'') {
        Cow::Owned(keyed.replace('\'', "\""))
    } else {
        keyed
    }
}

/// Parse every JSON document in `text`. PowerShell writes one document
/// per pipeline object, so documents may follow each other; parsing stops
/// at the first trailing line that does not open another one.
fn parse_documents(text: &str) -> std::result::Result<Vec<Value>, serde_json::Error> {
    let mut documents = Vec::new();
    let mut rest = text;
    loop {
        let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<Value>();
        match stream.next() {
            Some(value) => documents.push(value?),
            None if documents.is_empty() => return serde_json::from_str(rest).map(|v| vec![v]),
            None => break,
        }
        rest = rest[stream.byte_offset()..].trim_start();
        if !(rest.starts_with('{') || rest.starts_with('[')) {
            break;
        }
    }
    Ok(documents)
}

fn excerpt(text: &str) -> String {
    text.chars().take(EXCERPT_LEN).collect()
}

/// Extract the payload of `operation`'s output as raw JSON values, one per
/// record. A single object is a one-element collection.
pub fn extract_values(operation: &str, stdout: &str) -> Result<Vec<Value>> {
    let payload = payload_start(stdout).ok_or_else(|| DrError::NoPayloadFound {
        operation: operation.to_string(),
    })?;

    let documents = match parse_documents(payload) {
        Ok(v) => v,
        Err(strict) => {
            let repaired = repair(payload);
            tracing::debug!(operation, error = %strict, "Payload not strict JSON, repairing");
            parse_documents(&repaired).map_err(|e| DrError::PayloadMalformed {
                operation: operation.to_string(),
                reason: e.to_string(),
                excerpt: excerpt(&repaired),
            })?
        }
    };

    Ok(documents
        .into_iter()
        .flat_map(|value| match value {
            Value::Array(items) => items,
            other => vec![other],
        })
        .collect())
}

/// Extract and deserialize every record of `operation`'s output as `T`.
pub fn extract<T: DeserializeOwned>(operation: &str, stdout: &str) -> Result<Vec<T>> {
    extract_values(operation, stdout)?
        .into_iter()
        .map(|value| {
            let shown = excerpt(&value.to_string());
            serde_json::from_value(value).map_err(|e| DrError::PayloadMalformed {
                operation: operation.to_string(),
                reason: format!("unexpected record shape: {}", e),
                excerpt: shown,
            })
        })
        .collect()
}

/// Extract exactly one record, as for single-item operations.
pub fn extract_one<T: DeserializeOwned>(operation: &str, stdout: &str) -> Result<T> {
    let mut records = extract::<T>(operation, stdout)?;
    match records.len() {
        1 => Ok(records.remove(0)),
        0 => Err(DrError::NoPayloadFound {
            operation: operation.to_string(),
        }),
        n => Err(DrError::PayloadMalformed {
            operation: operation.to_string(),
            reason: format!("expected one record, got {}", n),
            excerpt: String::new(),
        }),
    }
}

/// A nested field PowerShell may serialize as a single object, an array,
/// or `null`, depending on how many items it held.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct OneOrMany<T>(pub Vec<T>);

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        self.0
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for OneOrMany<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr<T> {
            Many(Vec<T>),
            One(T),
        }

        Ok(match Option::<Repr<T>>::deserialize(deserializer)? {
            None => Self(Vec::new()),
            Some(Repr::Many(items)) => Self(items),
            Some(Repr::One(item)) => Self(vec![item]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Vm {
        vm_name: String,
        status: String,
    }

    #[test]
    fn test_log_lines_before_payload_are_discarded() {
        let payload = r#"[{"vm_name":"VM-1","status":"registered"},{"vm_name":"VM-2","status":"registered"}]"#;
        let stdout = format!(
            "connected to vcenter01\nWARNING: PowerCLI scripts should not use...\nregistered VM-1\n{}\n",
            payload
        );
        let direct: Value = serde_json::from_str(payload).unwrap();
        let values = extract_values("register_vm", &stdout).unwrap();
        assert_eq!(Value::Array(values), direct);
    }

    #[test]
    fn test_pretty_payload_spanning_lines() {
        let stdout = "log line\n  {\n    \"vm_name\": \"VM-1\",\n    \"status\": \"powered_on\"\n  }\n";
        let vms: Vec<Vm> = extract("power_on", stdout).unwrap();
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].status, "powered_on");
    }

    #[test]
    fn test_single_object_normalized_to_one_element() {
        let stdout = r#"{"vm_name":"VM-1","status":"powered_on"}"#;
        let vms: Vec<Vm> = extract("power_on", stdout).unwrap();
        assert_eq!(
            vms,
            vec![Vm {
                vm_name: "VM-1".to_string(),
                status: "powered_on".to_string()
            }]
        );
    }

    #[test]
    fn test_trailing_noise_after_payload_ignored() {
        let stdout = "{\"vm_name\":\"VM-1\",\"status\":\"registered\"}\nDisconnected from vcenter01\n";
        let vm: Vm = extract_one("register_vm", stdout).unwrap();
        assert_eq!(vm.vm_name, "VM-1");
    }

    #[test]
    fn test_back_to_back_documents_are_all_kept() {
        let stdout = "registered\n{\"vm_name\":\"VM-1\",\"status\":\"on\"}\n{\"vm_name\":\"VM-2\",\"status\":\"on\"}\nDisconnected\n";
        let vms: Vec<Vm> = extract("power_on", stdout).unwrap();
        let names: Vec<&str> = vms.iter().map(|v| v.vm_name.as_str()).collect();
        assert_eq!(names, ["VM-1", "VM-2"]);
        assert!(extract_one::<Vm>("power_on", stdout).is_err());
    }

    #[test]
    fn test_broken_second_document_is_malformed() {
        let stdout = "{\"vm_name\":\"VM-1\",\"status\":\"on\"}\n{\"vm_name\": \"VM-2\", \"status\":\n";
        let err = extract_values("power_on", stdout).unwrap_err();
        assert_eq!(err.kind(), "payload_malformed");
    }

    #[test]
    fn test_bare_keys_and_single_quotes_repaired() {
        let stdout = "Checking Serial 1234\n{vm_name: 'VM-1', status: 'registered'}\n";
        let vm: Vm = extract_one("register_vm", stdout).unwrap();
        assert_eq!(vm.vm_name, "VM-1");
        assert_eq!(vm.status, "registered");
    }

    #[test]
    fn test_repair_only_touches_key_positions() {
        assert_eq!(repair("{a: 'x', b: 1}"), "{\"a\": \"x\", \"b\": 1}");
        assert_eq!(repair("[{name: 'VM-1'}]"), "[{\"name\": \"VM-1\"}]");
    }

    #[test]
    fn test_valid_json_with_colons_is_not_repaired() {
        let stdout = r#"{"vm_name":"VM-1","status":"at 12:30 it's done"}"#;
        let vm: Vm = extract_one("power_on", stdout).unwrap();
        assert_eq!(vm.status, "at 12:30 it's done");
    }

    #[test]
    fn test_embedded_quote_fails_as_malformed() {
        let stdout = "{vm_name: 'O'Brien', status: 'registered'}";
        let err = extract_values("register_vm", stdout).unwrap_err();
        match err {
            DrError::PayloadMalformed { operation, excerpt, .. } => {
                assert_eq!(operation, "register_vm");
                assert!(excerpt.contains("Brien"));
            }
            other => panic!("expected PayloadMalformed, got {:?}", other),
        }
    }

    #[test]
    fn test_no_payload_found() {
        let err = extract_values("lun_check", "connected\nnothing matched\n").unwrap_err();
        assert!(err.is_empty_result());
        assert!(matches!(
            extract_values("lun_check", "").unwrap_err(),
            DrError::NoPayloadFound { .. }
        ));
    }

    #[test]
    fn test_wrong_record_shape_is_malformed() {
        let err = extract::<Vm>("power_on", r#"[{"name":"VM-1"}]"#).unwrap_err();
        assert_eq!(err.kind(), "payload_malformed");
    }

    #[test]
    fn test_extract_one_rejects_many() {
        let stdout = r#"[{"vm_name":"a","status":"x"},{"vm_name":"b","status":"y"}]"#;
        assert!(extract_one::<Vm>("power_on", stdout).is_err());
    }

    #[test]
    fn test_empty_array_payload() {
        assert!(extract_values("host_inventory", "[]").unwrap().is_empty());
    }

    #[test]
    fn test_one_or_many_shapes() {
        #[derive(Deserialize)]
        struct Folder {
            #[serde(default)]
            files: OneOrMany<String>,
        }
        let one: Folder = serde_json::from_value(json!({ "files": "a.vmx" })).unwrap();
        let many: Folder = serde_json::from_value(json!({ "files": ["a.vmx", "b.vmx"] })).unwrap();
        let null: Folder = serde_json::from_value(json!({ "files": null })).unwrap();
        let missing: Folder = serde_json::from_value(json!({})).unwrap();
        assert_eq!(one.files.into_vec(), vec!["a.vmx"]);
        assert_eq!(many.files.0.len(), 2);
        assert!(null.files.0.is_empty());
        assert!(missing.files.0.is_empty());
    }
}
