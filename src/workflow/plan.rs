//! Step sequences per workflow
//!
//! Cancellation is observed only between steps, so each step is the unit
//! that either runs to completion or never starts.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::request::WorkflowRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    AcquireLock,
    ValidateSource,
    CheckCleanWorkspace,
    CheckAttachedHead,
    DetectChanges,
    DiscardLocalChanges,
    PullMetadata,
    PullData,
    ClearData,
    CopyFiles,
    WriteMetadata,
    TrackData,
    StageFiles,
    StageDataset,
    Commit,
    PushData,
    PushMetadata,
    CheckoutRevision,
    CheckoutBranch,
    CheckoutData,
}

impl Step {
    pub fn label(self) -> &'static str {
        match self {
            Step::AcquireLock => "acquire dataset lock",
            Step::ValidateSource => "validate source folder",
            Step::CheckCleanWorkspace => "check workspace is clean",
            Step::CheckAttachedHead => "check workspace is on latest",
            Step::DetectChanges => "detect dataset changes",
            Step::DiscardLocalChanges => "discard local changes",
            Step::PullMetadata => "pull metadata",
            Step::PullData => "pull data",
            Step::ClearData => "clear existing dataset files",
            Step::CopyFiles => "copy image files",
            Step::WriteMetadata => "write dataset metadata",
            Step::TrackData => "track data",
            Step::StageFiles => "stage files",
            Step::StageDataset => "stage dataset changes",
            Step::Commit => "commit",
            Step::PushData => "push data",
            Step::PushMetadata => "push metadata",
            Step::CheckoutRevision => "checkout version",
            Step::CheckoutBranch => "checkout latest",
            Step::CheckoutData => "checkout data",
        }
    }

    /// Talks to a remote; failures go through the retry policy
    pub fn is_network(self) -> bool {
        matches!(
            self,
            Step::PullMetadata | Step::PullData | Step::PushData | Step::PushMetadata
        )
    }

    /// Large-file transfers may be aborted mid-flight by cancellation.
    /// Every other step runs to completion once started.
    pub fn is_abortable(self) -> bool {
        matches!(self, Step::PullData | Step::PushData)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The ordered steps a request runs
pub fn plan(request: &WorkflowRequest) -> Vec<Step> {
    use Step::*;

    let lock: &[Step] = if request.requires_lock() {
        &[AcquireLock]
    } else {
        &[]
    };

    match request {
        WorkflowRequest::Import { replace, .. } => {
            let mut steps = vec![ValidateSource];
            steps.extend_from_slice(lock);
            steps.extend([PullMetadata, PullData]);
            if *replace {
                steps.push(ClearData);
            }
            steps.extend([
                CopyFiles,
                WriteMetadata,
                TrackData,
                StageFiles,
                Commit,
                PushData,
                PushMetadata,
            ]);
            steps
        }
        WorkflowRequest::Publish { .. } => {
            let mut steps = vec![CheckAttachedHead];
            steps.extend_from_slice(lock);
            steps.extend([
                DetectChanges,
                TrackData,
                StageDataset,
                Commit,
                PushData,
                PushMetadata,
            ]);
            steps
        }
        WorkflowRequest::FetchLatest { allow_dirty, .. } => {
            let mut steps = Vec::new();
            if !allow_dirty {
                steps.push(CheckCleanWorkspace);
            }
            steps.extend_from_slice(lock);
            steps.extend([PullMetadata, PullData, CheckoutData]);
            steps
        }
        WorkflowRequest::RestoreVersion { .. } => {
            let mut steps = lock.to_vec();
            steps.extend([CheckoutRevision, PullData, CheckoutData]);
            steps
        }
        WorkflowRequest::ReturnToLatest { .. } => vec![
            DiscardLocalChanges,
            CheckoutBranch,
            PullMetadata,
            PullData,
            CheckoutData,
        ],
    }
}
