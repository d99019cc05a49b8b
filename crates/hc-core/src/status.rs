use std::fmt;

/// Run status of a coupled model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ModelStatus {
    #[default]
    NotRun,
    Initialized,
    Executing,
    Executed,
    Done,
    Failed,
}

impl ModelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelStatus::NotRun => "not-run",
            ModelStatus::Initialized => "initialized",
            ModelStatus::Executing => "executing",
            ModelStatus::Executed => "executed",
            ModelStatus::Done => "done",
            ModelStatus::Failed => "failed",
        }
    }

    /// Whether `on_execute` may be called in this status.
    pub fn can_execute(&self) -> bool {
        matches!(self, ModelStatus::Initialized | ModelStatus::Executed)
    }

    /// Whether `on_finish` may be called in this status.
    pub fn can_finish(&self) -> bool {
        matches!(
            self,
            ModelStatus::Initialized | ModelStatus::Executed | ModelStatus::Done
        )
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
