#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tendril_core::{prog_enum, Ctx, Flow, Frame, NoSemaphore, Prog, Registry, Runner, Symbol};
use tendril_events::Bus;
use tendril_kernel::Kernel;

pub struct Harness {
    pub _dir: tempfile::TempDir,
    pub kernel: Kernel,
    pub bus: Bus,
    pub registry: Arc<Registry>,
    pub runner: Runner,
}

pub fn harness(configure: impl FnOnce(&mut Registry)) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let kernel = Kernel::open(dir.path()).expect("open kernel");
    let bus = Bus::new(64);
    let mut registry = Registry::with_builtins();
    configure(&mut registry);
    let registry = Arc::new(registry);
    let runner = Runner::new(kernel.clone(), registry.clone(), bus.clone());
    Harness {
        _dir: dir,
        kernel,
        bus,
        registry,
        runner,
    }
}

pub fn frame(v: Value) -> Frame {
    v.as_object().cloned().expect("frame literal must be an object")
}

// ---------------------------------------------------------------------------
// Counter: loops through `step` until n reaches the limit.

prog_enum! {
    pub enum CounterLabel { Start => "start", Step => "step" }
}

pub struct Counter;

#[async_trait]
impl Prog for Counter {
    const NAME: &'static str = "Counter";
    type Label = CounterLabel;
    type Semaphore = NoSemaphore;

    async fn run(&self, label: CounterLabel, ctx: &mut Ctx<'_, Self>) -> Result<Flow> {
        match label {
            CounterLabel::Start => {
                ctx.set_param("n", 0)?;
                Ok(ctx.hop(CounterLabel::Step))
            }
            CounterLabel::Step => {
                let n: u64 = ctx.param("n")?;
                let limit: u64 = ctx.param_opt("limit")?.unwrap_or(3);
                if n < limit {
                    ctx.set_param("n", n + 1)?;
                    Ok(ctx.hop(CounterLabel::Step))
                } else {
                    Ok(ctx.exit(json!({"n": n})))
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Caller pushes Doubler and exits with what it returns.

prog_enum! {
    pub enum CallerLabel { Start => "start" }
}

pub struct Caller;

#[async_trait]
impl Prog for Caller {
    const NAME: &'static str = "Caller";
    type Label = CallerLabel;
    type Semaphore = NoSemaphore;

    async fn run(&self, _label: CallerLabel, ctx: &mut Ctx<'_, Self>) -> Result<Flow> {
        if let Some(ret) = ctx.retval() {
            return Ok(ctx.exit(json!({"got": ret, "depth": ctx.depth()})));
        }
        let x: i64 = ctx.param("x")?;
        Ok(ctx.push::<Doubler>(frame(json!({"x": x})), DoublerLabel::Start))
    }
}

prog_enum! {
    pub enum DoublerLabel { Start => "start" }
}

pub struct Doubler;

#[async_trait]
impl Prog for Doubler {
    const NAME: &'static str = "Doubler";
    type Label = DoublerLabel;
    type Semaphore = NoSemaphore;

    async fn run(&self, _label: DoublerLabel, ctx: &mut Ctx<'_, Self>) -> Result<Flow> {
        let x: i64 = ctx.param("x")?;
        Ok(ctx.pop(json!({"doubled": x * 2})))
    }
}

// ---------------------------------------------------------------------------
// Fan-out parent and its children.

prog_enum! {
    pub enum ParentLabel { Start => "start", Wait => "wait", Done => "done" }
}

pub struct Parent;

#[async_trait]
impl Prog for Parent {
    const NAME: &'static str = "Parent";
    type Label = ParentLabel;
    type Semaphore = NoSemaphore;

    async fn run(&self, label: ParentLabel, ctx: &mut Ctx<'_, Self>) -> Result<Flow> {
        match label {
            ParentLabel::Start => {
                ctx.bud::<Child>(frame(json!({"value": 1})))?;
                ctx.bud::<Child>(frame(json!({"value": 2})))?;
                let leaf = ctx.is_leaf().await?;
                ctx.set_param("leaf_after_bud", leaf)?;
                ctx.set_param("sum", 0)?;
                ctx.set_param("reaped", 0)?;
                Ok(ctx.hop(ParentLabel::Wait))
            }
            ParentLabel::Wait => {
                let mut sum: i64 = ctx.param("sum")?;
                let mut count: i64 = ctx.param("reaped")?;
                for child in ctx.reap().await? {
                    sum += child.exitval["value"].as_i64().unwrap_or(0);
                    count += 1;
                }
                // a second reap in the same tick finds nothing new
                count += ctx.reap().await?.len() as i64;
                ctx.set_param("sum", sum)?;
                ctx.set_param("reaped", count)?;
                if ctx.is_leaf().await? {
                    Ok(ctx.hop(ParentLabel::Done))
                } else {
                    Ok(ctx.donate())
                }
            }
            ParentLabel::Done => {
                let sum: i64 = ctx.param("sum")?;
                let count: i64 = ctx.param("reaped")?;
                Ok(ctx.exit(json!({"sum": sum, "reaped": count})))
            }
        }
    }
}

prog_enum! {
    pub enum ChildLabel { Start => "start" }
}

pub struct Child;

#[async_trait]
impl Prog for Child {
    const NAME: &'static str = "Child";
    type Label = ChildLabel;
    type Semaphore = NoSemaphore;

    async fn run(&self, _label: ChildLabel, ctx: &mut Ctx<'_, Self>) -> Result<Flow> {
        let value: i64 = ctx.param("value")?;
        Ok(ctx.pop(json!({"value": value})))
    }
}

// ---------------------------------------------------------------------------
// Misbehaving progs.

prog_enum! {
    pub enum FaultyLabel { Start => "start" }
}

prog_enum! {
    pub enum FaultySemaphore { Flag => "flag" }
}

pub struct Faulty;

#[async_trait]
impl Prog for Faulty {
    const NAME: &'static str = "Faulty";
    type Label = FaultyLabel;
    type Semaphore = FaultySemaphore;

    async fn run(&self, _label: FaultyLabel, ctx: &mut Ctx<'_, Self>) -> Result<Flow> {
        ctx.bud::<Child>(frame(json!({"value": 9})))?;
        ctx.incr(FaultySemaphore::Flag);
        ctx.set_param("touched", true)?;
        anyhow::bail!("provider said no")
    }
}

prog_enum! {
    pub enum RawLabel { Start => "start" }
}

/// Returns whatever flow its frame describes, bypassing the typed helpers.
pub struct Raw;

#[async_trait]
impl Prog for Raw {
    const NAME: &'static str = "Raw";
    type Label = RawLabel;
    type Semaphore = NoSemaphore;

    async fn run(&self, _label: RawLabel, ctx: &mut Ctx<'_, Self>) -> Result<Flow> {
        let kind: String = ctx.param("flow")?;
        let flow = match kind.as_str() {
            "hop_unknown" => Flow::Hop("nowhere".to_string()),
            "pop_number" => Flow::Pop(json!(5)),
            "push_unknown" => Flow::Push {
                prog: "Ghost".to_string(),
                label: "start".to_string(),
                frame: Frame::new(),
            },
            _ => Flow::Pop(json!("plain")),
        };
        Ok(flow)
    }
}

// ---------------------------------------------------------------------------
// Slow: naps in a handler so two workers can race for it.

prog_enum! {
    pub enum SlowLabel { Start => "start" }
}

pub struct Slow {
    pub executions: Arc<AtomicUsize>,
    pub hold: Duration,
}

#[async_trait]
impl Prog for Slow {
    const NAME: &'static str = "Slow";
    type Label = SlowLabel;
    type Semaphore = NoSemaphore;

    async fn run(&self, _label: SlowLabel, ctx: &mut Ctx<'_, Self>) -> Result<Flow> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        if ctx.param_opt::<bool>("steal")?.unwrap_or(false) {
            // lease has expired by now; another worker grabs the strand
            ctx.kernel()
                .acquire_lease_async(ctx.id(), "thief", Duration::from_secs(60))
                .await?;
        }
        Ok(ctx.nap(60))
    }
}

// ---------------------------------------------------------------------------
// Signals: consumes a restart request each time it runs.

prog_enum! {
    pub enum SignalsLabel { Wait => "wait", Start => "start" }
}

prog_enum! {
    pub enum SignalsSemaphore { Restart => "restart", Other => "other" }
}

pub struct Signals;

#[async_trait]
impl Prog for Signals {
    const NAME: &'static str = "Signals";
    type Label = SignalsLabel;
    type Semaphore = SignalsSemaphore;

    async fn run(&self, _label: SignalsLabel, ctx: &mut Ctx<'_, Self>) -> Result<Flow> {
        if ctx.when_set(SignalsSemaphore::Restart) {
            if ctx.param_opt::<bool>("rerequest")?.unwrap_or(false) {
                // an operator asks again while this tick is still running
                ctx.set_param("rerequest", false)?;
                ctx.kernel()
                    .incr_semaphore_async(ctx.id(), SignalsSemaphore::Restart.as_str())
                    .await?;
            }
            ctx.decr(SignalsSemaphore::Restart);
            let n: u64 = ctx.param_opt("restarts")?.unwrap_or(0);
            ctx.set_param("restarts", n + 1)?;
        }
        let live = ctx.is_set(SignalsSemaphore::Other).await?;
        ctx.set_param("other_seen", live)?;
        let still_set = ctx.when_set(SignalsSemaphore::Restart);
        ctx.set_param("restart_after_decr", still_set)?;
        Ok(ctx.nap(60))
    }
}

// ---------------------------------------------------------------------------
// Deadliner: registers a deadline on `done` and waits for `go`. `shift`
// moves the registration to `later`.

prog_enum! {
    pub enum DeadlinerLabel {
        Start => "start",
        Wait => "wait",
        Done => "done",
        Later => "later",
        Rules => "rules",
    }
}

prog_enum! {
    pub enum DeadlinerSemaphore { Go => "go", Shift => "shift" }
}

pub struct Deadliner;

#[async_trait]
impl Prog for Deadliner {
    const NAME: &'static str = "Deadliner";
    type Label = DeadlinerLabel;
    type Semaphore = DeadlinerSemaphore;

    async fn run(&self, label: DeadlinerLabel, ctx: &mut Ctx<'_, Self>) -> Result<Flow> {
        match label {
            DeadlinerLabel::Start => {
                let target = if ctx.param_opt::<bool>("must_exit")?.unwrap_or(false) {
                    None
                } else {
                    Some(DeadlinerLabel::Done)
                };
                ctx.register_deadline(target, 0);
                Ok(ctx.hop(DeadlinerLabel::Wait))
            }
            DeadlinerLabel::Wait => {
                if ctx.when_set(DeadlinerSemaphore::Shift) {
                    ctx.decr(DeadlinerSemaphore::Shift);
                    ctx.register_deadline(Some(DeadlinerLabel::Later), 3600);
                    return Ok(ctx.nap(60));
                }
                if ctx.when_set(DeadlinerSemaphore::Go) {
                    ctx.decr(DeadlinerSemaphore::Go);
                    Ok(ctx.hop(DeadlinerLabel::Done))
                } else {
                    Ok(ctx.nap(60))
                }
            }
            DeadlinerLabel::Later => Ok(ctx.nap(3600)),
            DeadlinerLabel::Done => {
                if ctx.param_opt::<bool>("must_exit")?.unwrap_or(false) {
                    Ok(ctx.exit("finished"))
                } else {
                    Ok(ctx.nap(3600))
                }
            }
            DeadlinerLabel::Rules => {
                ctx.register_deadline(Some(DeadlinerLabel::Done), 100);
                let first = deadline_at(ctx);
                ctx.register_deadline(Some(DeadlinerLabel::Done), 200);
                let later_same_target = deadline_at(ctx);
                ctx.register_deadline(Some(DeadlinerLabel::Done), 50);
                let earlier = deadline_at(ctx);
                ctx.register_deadline_extendable(Some(DeadlinerLabel::Done), 300);
                let extended = deadline_at(ctx);
                ctx.register_deadline(None, 400);
                let retargeted = deadline_at(ctx);
                ctx.set_param("first", first)?;
                ctx.set_param("later_same_target", later_same_target)?;
                ctx.set_param("earlier", earlier)?;
                ctx.set_param("extended", extended)?;
                ctx.set_param("retargeted", retargeted)?;
                Ok(ctx.nap(3600))
            }
        }
    }
}

fn deadline_at(ctx: &Ctx<'_, Deadliner>) -> Option<Value> {
    ctx.frame().get("deadline_at").cloned()
}

// ---------------------------------------------------------------------------
// PgServer: the replica catch-up wait.

prog_enum! {
    pub enum PgLabel {
        Start => "start",
        WaitCatchUp => "wait_catch_up",
        WaitSynchronization => "wait_synchronization",
        Wait => "wait",
    }
}

prog_enum! {
    pub enum PgSemaphore { Configure => "configure" }
}

pub struct PgServer {
    pub lsn_caught_up: Arc<AtomicBool>,
}

#[async_trait]
impl Prog for PgServer {
    const NAME: &'static str = "PgServer";
    type Label = PgLabel;
    type Semaphore = PgSemaphore;

    async fn run(&self, label: PgLabel, ctx: &mut Ctx<'_, Self>) -> Result<Flow> {
        match label {
            PgLabel::Start => Ok(ctx.hop(PgLabel::WaitCatchUp)),
            PgLabel::WaitCatchUp => {
                if !self.lsn_caught_up.load(Ordering::SeqCst) {
                    return Ok(ctx.nap(30));
                }
                ctx.set_param("synchronization_status", "ready")?;
                ctx.incr(PgSemaphore::Configure);
                if ctx.param_opt::<bool>("synchronous")?.unwrap_or(false) {
                    Ok(ctx.hop(PgLabel::WaitSynchronization))
                } else {
                    Ok(ctx.hop(PgLabel::Wait))
                }
            }
            PgLabel::WaitSynchronization | PgLabel::Wait => Ok(ctx.nap(60)),
        }
    }
}

// ---------------------------------------------------------------------------
// Resource with members: destroy tears down children first.

prog_enum! {
    pub enum ResourceLabel {
        Start => "start",
        Wait => "wait",
        Destroy => "destroy",
        WaitChildrenDestroy => "wait_children_destroy",
        Cleanup => "cleanup",
    }
}

prog_enum! {
    pub enum ResourceSemaphore { Destroy => "destroy" }
}

pub struct Resource;

#[async_trait]
impl Prog for Resource {
    const NAME: &'static str = "Resource";
    type Label = ResourceLabel;
    type Semaphore = ResourceSemaphore;

    async fn before_run(&self, ctx: &mut Ctx<'_, Self>) -> Result<Option<Flow>> {
        let tearing_down = matches!(
            ResourceLabel::parse(ctx.label()),
            Some(
                ResourceLabel::Destroy
                    | ResourceLabel::WaitChildrenDestroy
                    | ResourceLabel::Cleanup
            )
        );
        if ctx.when_set(ResourceSemaphore::Destroy) && !tearing_down {
            return Ok(Some(ctx.hop(ResourceLabel::Destroy)));
        }
        Ok(None)
    }

    async fn run(&self, label: ResourceLabel, ctx: &mut Ctx<'_, Self>) -> Result<Flow> {
        match label {
            ResourceLabel::Start => {
                ctx.bud::<Member>(Frame::new())?;
                ctx.bud::<Member>(Frame::new())?;
                Ok(ctx.hop(ResourceLabel::Wait))
            }
            ResourceLabel::Wait => Ok(ctx.nap(3600)),
            ResourceLabel::Destroy => {
                ctx.decr(ResourceSemaphore::Destroy);
                for child in ctx.children().await? {
                    ctx.incr_on::<Member>(&child.id, MemberSemaphore::Destroy);
                }
                Ok(ctx.hop(ResourceLabel::WaitChildrenDestroy))
            }
            ResourceLabel::WaitChildrenDestroy => {
                ctx.reap_or_donate(ResourceLabel::Cleanup).await
            }
            ResourceLabel::Cleanup => Ok(ctx.exit("resource destroyed")),
        }
    }
}

prog_enum! {
    pub enum MemberLabel { Start => "start", Wait => "wait" }
}

prog_enum! {
    pub enum MemberSemaphore { Destroy => "destroy" }
}

pub struct Member;

#[async_trait]
impl Prog for Member {
    const NAME: &'static str = "Member";
    type Label = MemberLabel;
    type Semaphore = MemberSemaphore;

    async fn run(&self, label: MemberLabel, ctx: &mut Ctx<'_, Self>) -> Result<Flow> {
        match label {
            MemberLabel::Start => Ok(ctx.hop(MemberLabel::Wait)),
            MemberLabel::Wait => {
                if ctx.when_set(MemberSemaphore::Destroy) {
                    Ok(ctx.pop("member destroyed"))
                } else {
                    Ok(ctx.nap(3600))
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Locker: takes the `shared` advisory lock and reports whether it got it.

prog_enum! {
    pub enum LockerLabel { Start => "start" }
}

pub struct Locker;

#[async_trait]
impl Prog for Locker {
    const NAME: &'static str = "Locker";
    type Label = LockerLabel;
    type Semaphore = NoSemaphore;

    async fn run(&self, _label: LockerLabel, ctx: &mut Ctx<'_, Self>) -> Result<Flow> {
        let got = ctx.try_lock("shared").await?;
        ctx.set_param("got", got)?;
        if let Some(ms) = ctx.param_opt::<u64>("hold_ms")? {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if ctx.param_opt::<bool>("fail")?.unwrap_or(false) {
            anyhow::bail!("failed while holding the lock");
        }
        Ok(ctx.nap(60))
    }
}

// ---------------------------------------------------------------------------
// Fanout: buds `n` Slow children and donates until they are gone.

prog_enum! {
    pub enum FanoutLabel { Start => "start", Wait => "wait", Done => "done" }
}

pub struct Fanout;

#[async_trait]
impl Prog for Fanout {
    const NAME: &'static str = "Fanout";
    type Label = FanoutLabel;
    type Semaphore = NoSemaphore;

    async fn run(&self, label: FanoutLabel, ctx: &mut Ctx<'_, Self>) -> Result<Flow> {
        match label {
            FanoutLabel::Start => {
                let n: u64 = ctx.param("n")?;
                for _ in 0..n {
                    ctx.bud::<Slow>(Frame::new())?;
                }
                Ok(ctx.hop(FanoutLabel::Wait))
            }
            FanoutLabel::Wait => ctx.reap_or_donate(FanoutLabel::Done).await,
            FanoutLabel::Done => Ok(ctx.exit("fanned out")),
        }
    }
}
