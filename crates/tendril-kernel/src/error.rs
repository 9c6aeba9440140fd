/// Contract violations and lease conflicts raised by the kernel.
///
/// Store functions return `anyhow::Result`; these variants travel inside it
/// and can be recovered with `err.downcast_ref::<KernelError>()`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("unknown prog: {0}")]
    UnknownProg(String),
    #[error("unknown label {label} for prog {prog}")]
    UnknownLabel { prog: String, label: String },
    #[error("unknown semaphore {name} for prog {prog}")]
    UnknownSemaphore { prog: String, name: String },
    #[error("pop value must be a string or an object, got {0}")]
    InvalidPop(String),
    #[error("malformed stack on strand {0}: popped frame has no back link to its caller")]
    MalformedStack(String),
    #[error("strand {0} would be left with an empty stack")]
    EmptyStack(String),
    #[error("lease on strand {0} was lost before commit")]
    LeaseLost(String),
    #[error("strand not found: {0}")]
    StrandNotFound(String),
    #[error("strand {0} has already finished")]
    AlreadyFinished(String),
}
