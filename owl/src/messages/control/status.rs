use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// Capability whose state is shown on the status indicator.
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone, Copy, Display)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Detection,
    Recording,
}

/// Status message generated when a pipeline starts or stops.
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct StatusMessage {
    /// Pipeline that changed.
    pub capability: Capability,
    /// True when the pipeline started.
    pub enabled: bool,
}

impl StatusMessage {
    pub fn new(capability: Capability, enabled: bool) -> Self {
        Self {
            capability,
            enabled,
        }
    }
}
