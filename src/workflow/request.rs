use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::state::WorkflowKind;

/// What the caller asks the engine to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowRequest {
    /// Copy a folder of images into a dataset and publish it
    Import {
        dataset_id: String,
        source: PathBuf,
        /// Remove existing dataset content before copying
        #[serde(default)]
        replace: bool,
        #[serde(default)]
        note: Option<String>,
    },
    /// Commit and push local edits under the dataset directory
    Publish { dataset_id: String, message: String },
    /// Bring the clone up to date with the remote
    FetchLatest {
        dataset_id: String,
        /// Proceed even when the clone has uncommitted changes
        #[serde(default)]
        allow_dirty: bool,
        /// The fetch updates a working copy other operators share
        #[serde(default)]
        update_shared: bool,
    },
    /// Check out a historical revision. Refused unless `confirmed`.
    RestoreVersion {
        dataset_id: String,
        revision: String,
        #[serde(default)]
        confirmed: bool,
    },
    /// Leave a restored revision and return to the tip of the branch
    ReturnToLatest { dataset_id: String },
}

impl WorkflowRequest {
    pub fn kind(&self) -> WorkflowKind {
        match self {
            WorkflowRequest::Import { .. } => WorkflowKind::Import,
            WorkflowRequest::Publish { .. } => WorkflowKind::Publish,
            WorkflowRequest::FetchLatest { .. } => WorkflowKind::FetchLatest,
            WorkflowRequest::RestoreVersion { .. } => WorkflowKind::RestoreVersion,
            WorkflowRequest::ReturnToLatest { .. } => WorkflowKind::ReturnToLatest,
        }
    }

    pub fn dataset_id(&self) -> &str {
        match self {
            WorkflowRequest::Import { dataset_id, .. }
            | WorkflowRequest::Publish { dataset_id, .. }
            | WorkflowRequest::FetchLatest { dataset_id, .. }
            | WorkflowRequest::RestoreVersion { dataset_id, .. }
            | WorkflowRequest::ReturnToLatest { dataset_id } => dataset_id,
        }
    }

    /// Whether the run mutates shared state and must hold the dataset lock
    pub fn requires_lock(&self) -> bool {
        match self {
            WorkflowRequest::Import { .. }
            | WorkflowRequest::Publish { .. }
            | WorkflowRequest::RestoreVersion { .. } => true,
            WorkflowRequest::FetchLatest { update_shared, .. } => *update_shared,
            WorkflowRequest::ReturnToLatest { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_requirements() {
        let import = WorkflowRequest::Import {
            dataset_id: "cam1".to_string(),
            source: PathBuf::from("/images"),
            replace: false,
            note: None,
        };
        assert!(import.requires_lock());
        assert_eq!(import.kind(), WorkflowKind::Import);

        let fetch = |update_shared| WorkflowRequest::FetchLatest {
            dataset_id: "cam1".to_string(),
            allow_dirty: false,
            update_shared,
        };
        assert!(!fetch(false).requires_lock());
        assert!(fetch(true).requires_lock());

        let back = WorkflowRequest::ReturnToLatest {
            dataset_id: "cam1".to_string(),
        };
        assert!(!back.requires_lock());
        assert_eq!(back.dataset_id(), "cam1");
    }

    #[test]
    fn test_request_deserializes_from_tagged_json() {
        let request: WorkflowRequest = serde_json::from_str(
            r#"{"kind":"restore_version","dataset_id":"cam1","revision":"1a2b3c4"}"#,
        )
        .unwrap();
        assert_eq!(
            request,
            WorkflowRequest::RestoreVersion {
                dataset_id: "cam1".to_string(),
                revision: "1a2b3c4".to_string(),
                confirmed: false,
            }
        );
    }
}
