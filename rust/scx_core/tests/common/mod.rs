#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use scx_core::*;

/// Initialize tracing from `RUST_LOG`.
///
/// `try_init()` is idempotent: first call in the process succeeds,
/// subsequent calls are silently ignored.
pub fn setup_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .event_format(ScxFormat)
        .with_test_writer()
        .try_init();
}

/// Callback names in invocation order, shared with the test body.
pub type CallLog = Arc<Mutex<Vec<(&'static str, Option<TaskId>)>>>;

/// Wraps a policy and records every callback it receives.
pub struct Recorder<P> {
    inner: P,
    log: CallLog,
}

impl<P: Policy> Recorder<P> {
    pub fn new(inner: P) -> (Self, CallLog) {
        let log = CallLog::default();
        (
            Recorder {
                inner,
                log: log.clone(),
            },
            log,
        )
    }

    fn record(&self, name: &'static str, task: Option<TaskId>) {
        self.log.lock().unwrap().push((name, task));
    }
}

/// Number of times `name` was called, for any task.
pub fn count(log: &CallLog, name: &str) -> usize {
    log.lock().unwrap().iter().filter(|(n, _)| *n == name).count()
}

impl<P: Policy> Policy for Recorder<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn init(&self, ops: &Ops<'_>) -> Result<()> {
        self.record("init", None);
        self.inner.init(ops)
    }

    fn exit(&self, info: &ExitInfo) {
        self.record("exit", None);
        self.inner.exit(info)
    }

    fn init_task(&self, ops: &Ops<'_>, task: TaskId, args: &InitTaskArgs) -> Result<()> {
        self.record("init_task", Some(task));
        self.inner.init_task(ops, task, args)
    }

    fn exit_task(&self, ops: &Ops<'_>, task: TaskId) {
        self.record("exit_task", Some(task));
        self.inner.exit_task(ops, task)
    }

    fn enable(&self, ops: &Ops<'_>, task: TaskId) {
        self.record("enable", Some(task));
        self.inner.enable(ops, task)
    }

    fn disable(&self, ops: &Ops<'_>, task: TaskId) {
        self.record("disable", Some(task));
        self.inner.disable(ops, task)
    }

    fn select_cpu(
        &self,
        ops: &Ops<'_>,
        task: TaskId,
        prev_cpu: CpuId,
        wake_flags: WakeFlags,
    ) -> Result<CpuId> {
        self.record("select_cpu", Some(task));
        self.inner.select_cpu(ops, task, prev_cpu, wake_flags)
    }

    fn enqueue(&self, ops: &Ops<'_>, task: TaskId, enq_flags: EnqFlags) -> Result<()> {
        self.record("enqueue", Some(task));
        self.inner.enqueue(ops, task, enq_flags)
    }

    fn dequeue(&self, ops: &Ops<'_>, task: TaskId, deq_flags: DeqFlags) {
        self.record("dequeue", Some(task));
        self.inner.dequeue(ops, task, deq_flags)
    }

    fn dispatch(&self, ops: &Ops<'_>, cpu: CpuId, prev: Option<TaskId>) -> Result<()> {
        self.record("dispatch", prev);
        self.inner.dispatch(ops, cpu, prev)
    }

    fn tick(&self, ops: &Ops<'_>, task: TaskId) {
        self.record("tick", Some(task));
        self.inner.tick(ops, task)
    }

    fn runnable(&self, ops: &Ops<'_>, task: TaskId, enq_flags: EnqFlags) {
        self.record("runnable", Some(task));
        self.inner.runnable(ops, task, enq_flags)
    }

    fn running(&self, ops: &Ops<'_>, task: TaskId) {
        self.record("running", Some(task));
        self.inner.running(ops, task)
    }

    fn stopping(&self, ops: &Ops<'_>, task: TaskId, runnable: bool) {
        self.record("stopping", Some(task));
        self.inner.stopping(ops, task, runnable)
    }

    fn quiescent(&self, ops: &Ops<'_>, task: TaskId, deq_flags: DeqFlags) {
        self.record("quiescent", Some(task));
        self.inner.quiescent(ops, task, deq_flags)
    }

    fn set_weight(&self, ops: &Ops<'_>, task: TaskId, weight: Weight) {
        self.record("set_weight", Some(task));
        self.inner.set_weight(ops, task, weight)
    }

    fn set_cpumask(&self, ops: &Ops<'_>, task: TaskId, cpumask: &Cpumask) {
        self.record("set_cpumask", Some(task));
        self.inner.set_cpumask(ops, task, cpumask)
    }

    fn cpu_acquire(&self, ops: &Ops<'_>, cpu: CpuId) {
        self.record("cpu_acquire", None);
        self.inner.cpu_acquire(ops, cpu)
    }

    fn cpu_release(&self, ops: &Ops<'_>, cpu: CpuId, reason: CpuReleaseReason) {
        self.record("cpu_release", None);
        self.inner.cpu_release(ops, cpu, reason)
    }

    fn cpu_online(&self, ops: &Ops<'_>, cpu: CpuId) {
        self.record("cpu_online", None);
        self.inner.cpu_online(ops, cpu)
    }

    fn cpu_offline(&self, ops: &Ops<'_>, cpu: CpuId) {
        self.record("cpu_offline", None);
        self.inner.cpu_offline(ops, cpu)
    }
}

/// Build and load a core on a `ManualHost`.
pub fn start<P: Policy + 'static>(cfg: SchedConfig, policy: P) -> (ScxCore, Arc<ManualHost>) {
    let host = Arc::new(ManualHost::new());
    let core = ScxCore::new(cfg, policy, host.clone()).unwrap();
    core.init().unwrap();
    (core, host)
}

/// `init_task` + `enable` with the given affinity (all CPUs if empty).
pub fn add_task(core: &ScxCore, id: u64, cpus: &[u32]) -> TaskId {
    let task = TaskId(id);
    let nr = core.nr_cpu_ids();
    let mut args = InitTaskArgs::new(nr);
    if !cpus.is_empty() {
        let cpus: Vec<CpuId> = cpus.iter().map(|&c| CpuId(c)).collect();
        args = args.with_cpus(Cpumask::from_cpus(nr as usize, &cpus).unwrap());
    }
    core.init_task(task, &args).unwrap();
    core.enable(task).unwrap();
    task
}
