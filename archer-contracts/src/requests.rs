use serde::{Deserialize, Serialize};

/// Body of `POST /scans`.
///
/// Every field defaults so that missing fields surface as validation
/// errors naming the field rather than as a body parse failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewScanRequest {
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nuclei_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// Body of `POST /tasks/{id}/completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedTaskRequest {
    pub results: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_default_to_empty() {
        let request: NewScanRequest =
            serde_json::from_str(r#"{"targets":["10.0.0.1"]}"#).unwrap();
        assert_eq!(request.targets, vec!["10.0.0.1"]);
        assert!(request.ports.is_empty());
        assert!(request.modules.is_empty());
        assert!(request.nuclei_types.is_none());
    }
}
