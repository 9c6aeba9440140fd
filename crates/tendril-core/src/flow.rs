use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tendril_kernel::Frame;

/// What a label handler asks the runner to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    /// Run `label` of the current prog next; keeps the lease.
    Hop(String),
    /// Stay on the current label and become due again after the delay.
    Nap(Duration),
    /// Call into `prog` at `label` with a fresh frame on top of the stack.
    Push {
        prog: String,
        label: String,
        frame: Frame,
    },
    /// Return `value` to the caller frame, or finish the strand at depth 1.
    /// Must be a string or a JSON object.
    Pop(Value),
    /// Give this tick to due children, then behave as `Nap(0)`.
    Donate,
}

impl Flow {
    pub fn kind(&self) -> &'static str {
        match self {
            Flow::Hop(_) => "hop",
            Flow::Nap(_) => "nap",
            Flow::Push { .. } => "push",
            Flow::Pop(_) => "pop",
            Flow::Donate => "donate",
        }
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flow::Hop(label) => write!(f, "hop {label}"),
            Flow::Nap(d) => write!(f, "nap {}s", d.as_secs()),
            Flow::Push { prog, label, .. } => write!(f, "push {prog}.{label}"),
            Flow::Pop(_) => f.write_str("pop"),
            Flow::Donate => f.write_str("donate"),
        }
    }
}
