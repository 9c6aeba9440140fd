//! Durable strand/prog execution runtime.
//!
//! A [`Prog`] describes a workflow as labels; a strand is one persisted
//! execution of it. The [`Runner`] advances a strand under a lease, one
//! label per tick, and the [`Dispatcher`] keeps a pool of workers busy with
//! due strands.

use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::json;
use tendril_events::Bus;
use tendril_kernel::{Kernel, KernelError, NewStrand, FRAME_LINK};
use tendril_topics as topics;

pub mod config;
mod counters;
pub mod ctx;
pub mod deadline;
pub mod dispatcher;
pub mod flow;
pub mod page;
pub mod prog;
pub mod registry;
pub mod runner;

pub use ctx::{Ctx, Reaped};
pub use deadline::{deadline_tag, DeadlineMonitor};
pub use dispatcher::Dispatcher;
pub use flow::Flow;
pub use page::{page_tag, PageNexus, PageRequest, Severity};
pub use prog::{NoSemaphore, Prog, Symbol};
pub use registry::Registry;
pub use runner::{backoff, RunOutcome, Runner};
pub use tendril_kernel::{Frame, PageInsert, PageRow, StrandRow};

/// Where and how [`assemble_with`] creates the strand.
#[derive(Debug, Clone)]
pub struct AssembleOptions<L> {
    pub id: Option<String>,
    pub parent_id: Option<String>,
    /// Defaults to `start`.
    pub label: Option<L>,
}

impl<L> Default for AssembleOptions<L> {
    fn default() -> Self {
        Self {
            id: None,
            parent_id: None,
            label: None,
        }
    }
}

/// Creates a strand of `P` at `start`, due immediately.
pub async fn assemble<P: Prog>(kernel: &Kernel, frame: Frame) -> Result<StrandRow> {
    assemble_with::<P>(kernel, frame, AssembleOptions::default()).await
}

pub async fn assemble_with<P: Prog>(
    kernel: &Kernel,
    frame: Frame,
    opts: AssembleOptions<P::Label>,
) -> Result<StrandRow> {
    let label = match opts.label {
        Some(label) => label,
        None => P::Label::parse("start").ok_or_else(|| KernelError::UnknownLabel {
            prog: P::NAME.to_string(),
            label: "start".to_string(),
        })?,
    };
    let mut new = NewStrand::new(P::NAME, label.as_str(), frame);
    if let Some(id) = opts.id {
        new = new.with_id(id);
    }
    if let Some(parent) = opts.parent_id {
        new = new.with_parent(parent);
    }
    kernel.insert_strand_async(&new).await
}

/// Requests semaphore `name` on a running strand from outside any tick and
/// wakes it. The name must belong to a prog on the strand's stack.
pub async fn signal(
    kernel: &Kernel,
    registry: &Registry,
    bus: &Bus,
    strand_id: &str,
    name: &str,
) -> Result<()> {
    let strand = kernel
        .get_strand_async(strand_id)
        .await?
        .ok_or_else(|| KernelError::StrandNotFound(strand_id.to_string()))?;
    if strand.is_finished() {
        return Err(KernelError::AlreadyFinished(strand_id.to_string()).into());
    }
    let callers = strand
        .stack
        .iter()
        .filter_map(|frame| frame.get(FRAME_LINK).and_then(runner::parse_link))
        .map(|(prog, _)| prog);
    let known = std::iter::once(strand.prog.clone())
        .chain(callers)
        .any(|prog| registry.validate_semaphore(&prog, name).is_ok());
    if !known {
        return Err(KernelError::UnknownSemaphore {
            prog: strand.prog,
            name: name.to_string(),
        }
        .into());
    }
    kernel.incr_semaphore_async(strand_id, name).await?;
    let env = bus.publish(
        topics::TOPIC_SEMAPHORE_INCR,
        Some(strand_id),
        &json!({"prog": strand.prog, "name": name}),
    );
    kernel.append_event_async(&env).await?;
    tracing::info!(strand = %strand_id, semaphore = %name, "semaphore requested");
    Ok(())
}

/// Serializes a parameter struct into a frame.
pub fn to_frame<T: Serialize>(params: &T) -> Result<Frame> {
    match serde_json::to_value(params)? {
        serde_json::Value::Object(frame) => Ok(frame),
        other => Err(anyhow!("frame parameters must serialize to an object, got {other}")),
    }
}
