use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::time::Duration;
use tendril_events::{Bus, Envelope};
use tendril_kernel::{
    parse_ts, ts, Frame, Kernel, KernelError, NewStrand, SemaphoreOp, StrandRow,
    FRAME_DEADLINE_AT, FRAME_DEADLINE_TARGET,
};

use crate::flow::Flow;
use crate::prog::{Prog, Symbol};

/// Mutable state of one tick. Nothing here reaches the store until the
/// runner commits it; a failed handler discards the whole thing.
pub struct Tick {
    pub(crate) kernel: Kernel,
    pub(crate) bus: Bus,
    pub(crate) id: String,
    pub(crate) parent_id: Option<String>,
    pub(crate) holder: String,
    pub(crate) prog: String,
    pub(crate) label: String,
    pub(crate) stack: Vec<Frame>,
    pub(crate) retval: Option<Frame>,
    /// Pending semaphores and their generation, as of tick start.
    pub(crate) seen: Vec<(String, i64)>,
    /// Local view: `seen`, plus anything `is_set` observed, adjusted by this
    /// tick's own `incr`/`decr`.
    pub(crate) semaphores: BTreeMap<String, i64>,
    pub(crate) semaphore_ops: Vec<SemaphoreOp>,
    pub(crate) replaced_deadlines: Vec<(String, Option<String>)>,
    pub(crate) buds: Vec<NewStrand>,
    pub(crate) reaped: Vec<String>,
    pub(crate) events: Vec<Envelope>,
    pub(crate) lock_hold: Duration,
    pub(crate) locked: bool,
}

impl Tick {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        kernel: Kernel,
        bus: Bus,
        id: String,
        parent_id: Option<String>,
        holder: String,
        prog: String,
        label: String,
        stack: Vec<Frame>,
        retval: Option<Frame>,
        seen: Vec<(String, i64)>,
        lock_hold: Duration,
    ) -> Result<Self> {
        if stack.is_empty() {
            return Err(KernelError::EmptyStack(id).into());
        }
        Ok(Self {
            kernel,
            bus,
            id,
            parent_id,
            holder,
            prog,
            label,
            stack,
            retval,
            semaphores: seen.iter().cloned().collect(),
            seen,
            semaphore_ops: Vec::new(),
            replaced_deadlines: Vec::new(),
            buds: Vec::new(),
            reaped: Vec::new(),
            events: Vec::new(),
            lock_hold,
            locked: false,
        })
    }
}

/// A finished child harvested by [`Ctx::reap`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reaped {
    pub id: String,
    pub prog: String,
    pub exitval: Frame,
}

/// Handler-facing view of a tick, typed by the prog currently on top of the
/// stack so labels and semaphore names are checked at compile time.
pub struct Ctx<'a, P: Prog> {
    tick: &'a mut Tick,
    _prog: PhantomData<fn() -> P>,
}

impl<'a, P: Prog> Ctx<'a, P> {
    pub(crate) fn new(tick: &'a mut Tick) -> Self {
        Self {
            tick,
            _prog: PhantomData,
        }
    }

    pub fn id(&self) -> &str {
        &self.tick.id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.tick.parent_id.as_deref()
    }

    pub fn label(&self) -> &str {
        &self.tick.label
    }

    pub fn depth(&self) -> usize {
        self.tick.stack.len()
    }

    pub fn kernel(&self) -> &Kernel {
        &self.tick.kernel
    }

    pub fn bus(&self) -> &Bus {
        &self.tick.bus
    }

    // ---- frame ----

    pub fn frame(&self) -> &Frame {
        &self.tick.stack[0]
    }

    pub fn frame_mut(&mut self) -> &mut Frame {
        &mut self.tick.stack[0]
    }

    pub fn param<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.param_opt(key)?
            .ok_or_else(|| anyhow!("strand {} frame has no parameter {key}", self.tick.id))
    }

    pub fn param_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.frame().get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
        }
    }

    pub fn set_param<T: Serialize>(&mut self, key: &str, value: T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.frame_mut().insert(key.to_string(), value);
        Ok(())
    }

    /// Value popped by the last callee, until the next hop or push.
    pub fn retval(&self) -> Option<&Frame> {
        self.tick.retval.as_ref()
    }

    /// Queues an event; published only if the tick commits.
    pub fn emit<T: Serialize>(&mut self, kind: &str, payload: &T) {
        let env = Envelope::new(kind, Some(&self.tick.id), payload);
        self.tick.events.push(env);
    }

    // ---- control flow ----

    pub fn hop(&self, label: P::Label) -> Flow {
        Flow::Hop(label.as_str().to_string())
    }

    pub fn nap(&self, secs: u64) -> Flow {
        Flow::Nap(Duration::from_secs(secs))
    }

    pub fn push<Q: Prog>(&self, frame: Frame, label: Q::Label) -> Flow {
        Flow::Push {
            prog: Q::NAME.to_string(),
            label: label.as_str().to_string(),
            frame,
        }
    }

    pub fn pop(&self, value: impl Into<Value>) -> Flow {
        Flow::Pop(value.into())
    }

    /// Finishes the strand. Identical to [`Ctx::pop`] on a one-frame stack.
    pub fn exit(&self, value: impl Into<Value>) -> Flow {
        Flow::Pop(value.into())
    }

    pub fn donate(&self) -> Flow {
        Flow::Donate
    }

    // ---- semaphores ----

    /// Reads the set of semaphores captured when the tick started.
    pub fn when_set(&self, name: P::Semaphore) -> bool {
        self.tick.semaphores.contains_key(name.as_str())
    }

    /// Reads the store, seeing increments made since the tick started. What
    /// it sees here is what a later `decr` in this tick consumes.
    pub async fn is_set(&mut self, name: P::Semaphore) -> Result<bool> {
        if self.when_set(name) {
            return Ok(true);
        }
        let seq = self
            .tick
            .kernel
            .semaphore_seq_async(&self.tick.id, name.as_str())
            .await?;
        match seq {
            Some(seq) => {
                self.tick.semaphores.insert(name.as_str().to_string(), seq);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn incr(&mut self, name: P::Semaphore) {
        // A request made by the tick itself is always consumable by it.
        self.tick.semaphores.insert(name.as_str().to_string(), i64::MAX);
        self.tick
            .semaphore_ops
            .push(SemaphoreOp::incr(&self.tick.id, name.as_str()));
    }

    /// Consumes the requests this tick has seen. One that arrives after
    /// the tick looked stays pending and wakes the strand again.
    pub fn decr(&mut self, name: P::Semaphore) {
        let upto = self.tick.semaphores.remove(name.as_str()).unwrap_or(0);
        self.tick
            .semaphore_ops
            .push(SemaphoreOp::decr(&self.tick.id, name.as_str(), Some(upto)));
    }

    /// Signals another strand running prog `Q`; it is woken at commit.
    pub fn incr_on<Q: Prog>(&mut self, strand_id: &str, name: Q::Semaphore) {
        self.tick
            .semaphore_ops
            .push(SemaphoreOp::incr(strand_id, name.as_str()));
    }

    // ---- children ----

    /// Starts a child at `start`. The child exists once this tick commits.
    pub fn bud<Q: Prog>(&mut self, frame: Frame) -> Result<String> {
        let start = Q::Label::parse("start").ok_or_else(|| KernelError::UnknownLabel {
            prog: Q::NAME.to_string(),
            label: "start".to_string(),
        })?;
        Ok(self.bud_at::<Q>(frame, start))
    }

    pub fn bud_at<Q: Prog>(&mut self, frame: Frame, label: Q::Label) -> String {
        let child = NewStrand::new(Q::NAME, label.as_str(), frame).with_parent(&self.tick.id);
        let id = child.id.clone();
        self.tick.buds.push(child);
        id
    }

    /// Stored children not reaped during this tick.
    pub async fn children(&self) -> Result<Vec<StrandRow>> {
        let rows = self.tick.kernel.children_async(&self.tick.id).await?;
        Ok(rows
            .into_iter()
            .filter(|c| !self.tick.reaped.contains(&c.id))
            .collect())
    }

    /// Harvests finished children; they are deleted when the tick commits.
    pub async fn reap(&mut self) -> Result<Vec<Reaped>> {
        let mut out = Vec::new();
        for child in self.children().await? {
            if let Some(exitval) = child.exitval {
                self.tick.reaped.push(child.id.clone());
                out.push(Reaped {
                    id: child.id,
                    prog: child.prog,
                    exitval,
                });
            }
        }
        Ok(out)
    }

    /// True once no children remain, counting buds of this tick.
    pub async fn is_leaf(&self) -> Result<bool> {
        Ok(self.tick.buds.is_empty() && self.children().await?.is_empty())
    }

    pub async fn reap_or_donate(&mut self, label: P::Label) -> Result<Flow> {
        self.reap().await?;
        if self.is_leaf().await? {
            Ok(self.hop(label))
        } else {
            Ok(self.donate())
        }
    }

    // ---- deadlines ----

    /// Requires the strand to reach `target` (or pop this frame when `None`)
    /// within `secs`. An existing registration is only replaced by an
    /// earlier one or one with a different target.
    pub fn register_deadline(&mut self, target: Option<P::Label>, secs: u64) {
        self.set_deadline(target, secs, false);
    }

    /// Like [`Ctx::register_deadline`] but may also push the deadline later.
    pub fn register_deadline_extendable(&mut self, target: Option<P::Label>, secs: u64) {
        self.set_deadline(target, secs, true);
    }

    fn set_deadline(&mut self, target: Option<P::Label>, secs: u64, allow_extension: bool) {
        let at = Utc::now() + chrono::Duration::seconds(secs as i64);
        let target = target.map(|t| t.as_str());
        let frame = self.frame();
        let current_at = frame
            .get(FRAME_DEADLINE_AT)
            .and_then(Value::as_str)
            .and_then(|s| parse_ts(s).ok());
        let current_target = frame
            .get(FRAME_DEADLINE_TARGET)
            .and_then(Value::as_str)
            .map(str::to_string);
        let replace = match current_at {
            None => true,
            Some(cur) => current_target.as_deref() != target || at < cur || allow_extension,
        };
        if !replace {
            return;
        }
        if current_at.is_some() && current_target.as_deref() != target {
            // the page escalated for the old target no longer has an owner
            self.tick
                .replaced_deadlines
                .push((self.tick.prog.clone(), current_target));
        }
        let frame = self.frame_mut();
        frame.insert(
            FRAME_DEADLINE_TARGET.to_string(),
            target.map_or(Value::Null, |t| Value::String(t.to_string())),
        );
        frame.insert(FRAME_DEADLINE_AT.to_string(), Value::String(ts(at)));
    }

    // ---- locks ----

    /// Takes a named advisory lock until the end of this tick.
    pub async fn try_lock(&mut self, key: &str) -> Result<bool> {
        let got = self
            .tick
            .kernel
            .try_lock_async(key, &self.tick.holder, self.tick.lock_hold)
            .await?;
        if got {
            self.tick.locked = true;
        }
        Ok(got)
    }
}
