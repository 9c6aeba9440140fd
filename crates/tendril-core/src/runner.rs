use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tendril_events::{Bus, Envelope};
use tendril_kernel::{
    ts, Frame, Kernel, KernelError, SemaphoreOp, StrandRow, TickCommit, FRAME_DEADLINE_AT,
    FRAME_DEADLINE_TARGET, FRAME_LINK,
};
use tendril_topics as topics;

use crate::config::DEFAULT_LEASE_SECS;
use crate::counters;
use crate::ctx::Tick;
use crate::deadline::deadline_tag;
use crate::flow::Flow;
use crate::page::PageSemaphore;
use crate::prog::Symbol;
use crate::registry::Registry;

/// Longest error backoff, in seconds.
const MAX_BACKOFF_SECS: u64 = 600;

/// How a run ended. Lease conflicts are not errors: another worker simply
/// owns the strand right now.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Busy,
    /// Still runnable (budget spent, or single tick); due again immediately.
    Continued { label: String },
    Napped { label: String, until: String },
    Donated { children: usize },
    Exited(Frame),
}

pub fn backoff(tries: i64) -> Duration {
    let exp = tries.clamp(0, 16) as u32;
    Duration::from_secs(2u64.saturating_pow(exp).min(MAX_BACKOFF_SECS))
}

/// Strand fields carried from tick to tick while the lease is held.
struct Cursor {
    id: String,
    parent_id: Option<String>,
    prog: String,
    label: String,
    stack: Vec<Frame>,
    retval: Option<Frame>,
    tries: i64,
}

impl From<StrandRow> for Cursor {
    fn from(row: StrandRow) -> Self {
        Self {
            id: row.id,
            parent_id: row.parent_id,
            prog: row.prog,
            label: row.label,
            stack: row.stack,
            retval: row.retval,
            tries: row.tries,
        }
    }
}

enum Step {
    Continue,
    Nap(String),
    Donate,
    Exit(Frame),
}

/// Executes strands under a lease: one label per tick, each tick committed
/// atomically and fenced on the lease holder token.
pub struct Runner {
    kernel: Kernel,
    registry: Arc<Registry>,
    bus: Bus,
    lease: Duration,
    budget: Duration,
}

impl Runner {
    pub fn new(kernel: Kernel, registry: Arc<Registry>, bus: Bus) -> Self {
        let lease = Duration::from_secs(DEFAULT_LEASE_SECS);
        Self {
            kernel,
            registry,
            bus,
            lease,
            budget: lease / 4,
        }
    }

    /// Also resets the run budget to a quarter of the lease.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self.budget = lease / 4;
        self
    }

    pub fn with_run_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Leases the strand and keeps executing labels while it hops, pushes or
    /// pops to a caller, until it naps, exits, donates, or the run budget is
    /// spent. Does not look at `schedule`.
    pub async fn run(&self, id: &str) -> Result<RunOutcome> {
        self.drive(id, true, None).await
    }

    /// Leases the strand and executes exactly one label.
    pub async fn tick(&self, id: &str) -> Result<RunOutcome> {
        self.drive(id, false, None).await
    }

    /// Runs a donated-to child inside the parent's remaining budget.
    fn run_boxed<'a>(
        &'a self,
        id: &'a str,
        until: Instant,
    ) -> Pin<Box<dyn Future<Output = Result<RunOutcome>> + Send + 'a>> {
        Box::pin(self.drive(id, true, Some(until)))
    }

    async fn drive(
        &self,
        id: &str,
        keep_going: bool,
        until: Option<Instant>,
    ) -> Result<RunOutcome> {
        let holder = uuid::Uuid::new_v4().to_string();
        let Some(row) = self
            .kernel
            .acquire_lease_async(id, &holder, self.lease)
            .await?
        else {
            return match self.kernel.get_strand_async(id).await? {
                None => Err(KernelError::StrandNotFound(id.to_string()).into()),
                Some(row) if row.is_finished() => {
                    Err(KernelError::AlreadyFinished(id.to_string()).into())
                }
                Some(_) => Ok(RunOutcome::Busy),
            };
        };
        let budget_end = until.unwrap_or_else(|| Instant::now() + self.budget);
        let mut cursor = Cursor::from(row);
        loop {
            let step = match self.step(&mut cursor, &holder).await {
                Ok(step) => step,
                Err(err) => {
                    self.fail(&cursor, &holder, &err).await;
                    return Err(err);
                }
            };
            match step {
                Step::Continue if keep_going && Instant::now() < budget_end => continue,
                Step::Continue => {
                    self.kernel.release_lease_async(&cursor.id, &holder).await?;
                    return Ok(RunOutcome::Continued {
                        label: cursor.label,
                    });
                }
                Step::Nap(until) => {
                    return Ok(RunOutcome::Napped {
                        label: cursor.label,
                        until,
                    })
                }
                Step::Exit(value) => return Ok(RunOutcome::Exited(value)),
                Step::Donate => {
                    let children = self.donate(&cursor.id, budget_end).await;
                    self.kernel.release_lease_async(&cursor.id, &holder).await?;
                    return Ok(RunOutcome::Donated { children });
                }
            }
        }
    }

    /// Runs each due, unfinished child once, starting no child after
    /// `until`. Child failures are already recorded on the child and only
    /// logged here.
    async fn donate(&self, id: &str, until: Instant) -> usize {
        let children = match self.kernel.children_async(id).await {
            Ok(children) => children,
            Err(err) => {
                tracing::warn!(strand = %id, error = %err, "could not list children to donate to");
                return 0;
            }
        };
        let now = ts(Utc::now());
        let mut ran = 0;
        for child in children
            .iter()
            .filter(|c| !c.is_finished() && c.schedule <= now)
        {
            if Instant::now() >= until {
                tracing::debug!(strand = %id, ran, "donate budget spent");
                break;
            }
            match self.run_boxed(&child.id, until).await {
                Ok(RunOutcome::Busy) => {}
                Ok(_) => ran += 1,
                Err(err) => {
                    ran += 1;
                    tracing::warn!(strand = %child.id, parent = %id, error = %err, "child run failed during donate");
                }
            }
        }
        ran
    }

    async fn step(&self, cursor: &mut Cursor, holder: &str) -> Result<Step> {
        let prog = self.registry.get(&cursor.prog)?;
        let semaphores = self.kernel.semaphore_snapshot_async(&cursor.id).await?;
        let mut tick = Tick::new(
            self.kernel.clone(),
            self.bus.clone(),
            cursor.id.clone(),
            cursor.parent_id.clone(),
            holder.to_string(),
            cursor.prog.clone(),
            cursor.label.clone(),
            cursor.stack.clone(),
            cursor.retval.clone(),
            semaphores,
            self.lease,
        )?;
        let flow = prog.run_tick(&mut tick).await;
        if tick.locked {
            if let Err(err) = self.kernel.unlock_all_async(holder).await {
                tracing::warn!(strand = %cursor.id, error = %err, "failed to release advisory locks");
            }
        }
        let flow = flow?;
        tracing::debug!(
            strand = %cursor.id,
            prog = %cursor.prog,
            label = %cursor.label,
            flow = %flow,
            "tick"
        );
        counters::tick(&cursor.prog, flow.kind());
        let (commit, step, mut events) = self.apply(tick, flow).await?;

        if let Err(err) = self.kernel.commit_tick_async(commit.clone()).await {
            if matches!(
                err.downcast_ref::<KernelError>(),
                Some(KernelError::LeaseLost(_))
            ) {
                counters::lease_lost();
                tracing::warn!(strand = %cursor.id, "lease lost before commit; tick discarded");
                self.bus.publish(
                    topics::TOPIC_STRAND_LEASE_LOST,
                    Some(&cursor.id),
                    &json!({"label": cursor.label}),
                );
            }
            return Err(err);
        }

        cursor.prog = commit.prog;
        cursor.label = commit.label;
        cursor.stack = commit.stack;
        cursor.retval = commit.retval;
        cursor.tries = 0;

        if let Step::Exit(value) = &step {
            events.push(Envelope::new(
                topics::TOPIC_STRAND_EXITED,
                Some(&cursor.id),
                &json!({"prog": cursor.prog, "parent_id": cursor.parent_id, "exitval": value}),
            ));
        }
        for env in events {
            if let Err(err) = self.kernel.append_event_async(&env).await {
                tracing::warn!(kind = %env.kind, error = %err, "failed to record event");
            }
            self.bus.publish_envelope(env);
        }
        Ok(step)
    }

    /// Turns a handler's flow into the commit for this tick.
    async fn apply(&self, tick: Tick, flow: Flow) -> Result<(TickCommit, Step, Vec<Envelope>)> {
        let Tick {
            id,
            holder,
            mut prog,
            mut label,
            mut stack,
            mut retval,
            seen,
            mut semaphore_ops,
            replaced_deadlines,
            buds,
            reaped,
            events,
            ..
        } = tick;
        let now = Utc::now();
        let mut schedule = ts(now);
        let mut exitval = None;
        let mut release = false;
        // (prog, target) of deadline registrations removed by this tick
        let mut cleared: Vec<(String, Option<String>)> = replaced_deadlines;

        let step = match flow {
            Flow::Hop(next) => {
                self.registry.validate_label(&prog, &next)?;
                label = next;
                retval = None;
                Step::Continue
            }
            Flow::Nap(delay) => {
                schedule = ts(now + chrono::Duration::from_std(delay)?);
                release = true;
                Step::Nap(schedule.clone())
            }
            Flow::Push {
                prog: callee,
                label: entry,
                mut frame,
            } => {
                self.registry.validate_label(&callee, &entry)?;
                frame.insert(FRAME_LINK.to_string(), json!([prog, label]));
                stack.insert(0, frame);
                prog = callee;
                label = entry;
                retval = None;
                Step::Continue
            }
            Flow::Pop(value) => {
                let value = pop_value(value)?;
                if stack.len() > 1 {
                    let top = stack.remove(0);
                    let (caller, caller_label) = top
                        .get(FRAME_LINK)
                        .and_then(parse_link)
                        .ok_or_else(|| KernelError::MalformedStack(id.clone()))?;
                    if let Some(target) = deadline_target(&top) {
                        cleared.push((prog.clone(), target));
                    }
                    self.registry.validate_label(&caller, &caller_label)?;
                    prog = caller;
                    label = caller_label;
                    retval = Some(value);
                    Step::Continue
                } else {
                    if let Some(target) = take_deadline(&mut stack[0]) {
                        cleared.push((prog.clone(), target));
                    }
                    exitval = Some(value.clone());
                    release = true;
                    Step::Exit(value)
                }
            }
            Flow::Donate => Step::Donate,
        };

        if let Some(top) = stack.first_mut() {
            let reached = matches!(deadline_target(top), Some(Some(ref t)) if *t == label);
            if reached {
                if let Some(target) = take_deadline(top) {
                    cleared.push((prog.clone(), target));
                }
            }
        }
        for (owner, target) in cleared {
            let tag = deadline_tag(&id, &owner, target.as_deref());
            if let Some(page) = self.kernel.find_open_page_async(&tag).await? {
                semaphore_ops.push(SemaphoreOp::incr(page.id, PageSemaphore::Resolve.as_str()));
            }
        }

        let commit = TickCommit {
            id,
            holder,
            prog,
            label,
            stack,
            schedule,
            exitval,
            retval,
            release,
            buds,
            semaphores: semaphore_ops,
            reaped,
            seen,
        };
        Ok((commit, step, events))
    }

    /// Records a failed tick: nothing it buffered is kept, `tries` grows and
    /// the strand is pushed out by the backoff.
    async fn fail(&self, cursor: &Cursor, holder: &str, err: &anyhow::Error) {
        counters::tick_failed(&cursor.prog);
        let tries = cursor.tries + 1;
        let retry_at = Utc::now()
            + chrono::Duration::from_std(backoff(tries)).unwrap_or(chrono::Duration::zero());
        match self
            .kernel
            .record_failure_async(&cursor.id, holder, retry_at)
            .await
        {
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(strand = %cursor.id, error = %e, "failed to record tick failure")
            }
        }
        self.bus.publish(
            topics::TOPIC_STRAND_ERRORED,
            Some(&cursor.id),
            &json!({
                "prog": cursor.prog,
                "label": cursor.label,
                "tries": tries,
                "error": format!("{err:#}"),
            }),
        );
    }
}

fn pop_value(value: Value) -> Result<Frame> {
    match value {
        Value::String(msg) => {
            let mut frame = Frame::new();
            frame.insert("msg".to_string(), Value::String(msg));
            Ok(frame)
        }
        Value::Object(frame) => Ok(frame),
        other => Err(KernelError::InvalidPop(other.to_string()).into()),
    }
}

pub(crate) fn parse_link(link: &Value) -> Option<(String, String)> {
    match link.as_array()?.as_slice() {
        [prog, label] => Some((prog.as_str()?.to_string(), label.as_str()?.to_string())),
        _ => None,
    }
}

/// `Some(target)` when the frame carries a deadline registration.
fn deadline_target(frame: &Frame) -> Option<Option<String>> {
    frame.get(FRAME_DEADLINE_AT)?;
    Some(
        frame
            .get(FRAME_DEADLINE_TARGET)
            .and_then(Value::as_str)
            .map(str::to_string),
    )
}

fn take_deadline(frame: &mut Frame) -> Option<Option<String>> {
    let target = deadline_target(frame)?;
    frame.remove(FRAME_DEADLINE_AT);
    frame.remove(FRAME_DEADLINE_TARGET);
    Some(target)
}
