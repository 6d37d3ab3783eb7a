//! Provisioning steps and the progress log.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Pipeline steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepName {
    CreateDatabase,
    ConfigureOptions,
    CreateLoginAndUser,
    CopySchema,
    CopyExtendedProperties,
    CopyIndexes,
    CopyData,
    CreateAdminAccount,
    RegisterMetadata,
    Done,
    RolledBack,
}

impl StepName {
    /// Every step of a successful run, `Done` last.
    pub const PIPELINE: [StepName; 10] = [
        StepName::CreateDatabase,
        StepName::ConfigureOptions,
        StepName::CreateLoginAndUser,
        StepName::CopySchema,
        StepName::CopyExtendedProperties,
        StepName::CopyIndexes,
        StepName::CopyData,
        StepName::CreateAdminAccount,
        StepName::RegisterMetadata,
        StepName::Done,
    ];

    /// Whether a failure of this step rolls the whole run back.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            StepName::CreateDatabase | StepName::CreateLoginAndUser | StepName::CopySchema
        )
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Done,
    Failed,
}

/// One entry of the progress log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningStep {
    pub name: StepName,
    pub status: StepStatus,
    pub message: String,
}

/// Append-only step log with an optional live observer.
#[derive(Debug, Default)]
pub struct ProgressLog {
    steps: Vec<ProvisioningStep>,
    observer: Option<mpsc::UnboundedSender<ProvisioningStep>>,
}

impl ProgressLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log that also forwards every entry to `observer`.
    pub fn observed(observer: mpsc::UnboundedSender<ProvisioningStep>) -> Self {
        Self {
            steps: Vec::new(),
            observer: Some(observer),
        }
    }

    pub fn record(&mut self, name: StepName, status: StepStatus, message: impl Into<String>) {
        let step = ProvisioningStep {
            name,
            status,
            message: message.into(),
        };
        if let Some(tx) = &self.observer {
            // A caller that stopped listening does not stop the run.
            let _ = tx.send(step.clone());
        }
        self.steps.push(step);
    }

    pub fn running(&mut self, name: StepName, message: impl Into<String>) {
        self.record(name, StepStatus::Running, message);
    }

    pub fn done(&mut self, name: StepName, message: impl Into<String>) {
        self.record(name, StepStatus::Done, message);
    }

    pub fn failed(&mut self, name: StepName, message: impl Into<String>) {
        self.record(name, StepStatus::Failed, message);
    }

    pub fn steps(&self) -> &[ProvisioningStep] {
        &self.steps
    }

    pub fn into_steps(self) -> Vec<ProvisioningStep> {
        self.steps
    }

    /// Final status of each step, in first-seen order.
    pub fn final_statuses(&self) -> Vec<(StepName, StepStatus)> {
        let mut out: Vec<(StepName, StepStatus)> = Vec::new();
        for step in &self.steps {
            match out.iter_mut().find(|(n, _)| *n == step.name) {
                Some(entry) => entry.1 = step.status,
                None => out.push((step.name, step.status)),
            }
        }
        out
    }
}
