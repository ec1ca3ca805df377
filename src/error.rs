use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to launch Chrome: {0}")]
    LaunchFailed(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Action failed: {0}")]
    Transient(String),

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Extension archive too short")]
    ArchiveTooShort,

    #[error("Bad extension archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Callback event not registered: {0}")]
    EventNotRegistered(String),

    #[error("Timed out waiting for callback event: {0}")]
    AwaitTimeout(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Mailbox error: {0}")]
    Mailbox(String),

    #[error("Flow failed: {0}")]
    FlowFatal(String),

    #[error("CDP error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether a bounded-retry loop may run this action again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Transient(_)
                | EngineError::AwaitTimeout(_)
                | EngineError::ElementNotFound(_)
                | EngineError::Cdp(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
