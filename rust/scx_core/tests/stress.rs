//! Randomized concurrent workload: one thread per CPU drives dispatch, pick,
//! tick and stop for its CPU, and in between wakes up, dequeues, reweights
//! and exits random tasks. Every round ends at a barrier where the
//! cross-structure invariants are checked.
//!
//! `STRESS_SEED` selects the workload (default 42).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Barrier, Mutex};
use std::thread;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use scx_core::*;

mod common;

const NR_CPUS: u32 = 4;
const NR_TASKS: u64 = 48;
const ROUNDS: usize = 25;
const STEPS_PER_ROUND: usize = 200;

/// What the host believes about a task. Only changed with the task's lock
/// held, and the lock is held across the core call that causes the change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum View {
    NotCreated,
    Sleeping,
    Waking,
    Queued,
    Running(CpuId),
    Gone,
}

fn seed() -> u64 {
    std::env::var("STRESS_SEED")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(42)
}

/// A CPU thread can change a task's state under another thread's feet, so
/// some calls legitimately find the task elsewhere. Anything else is a bug.
fn tolerated<T>(res: Result<T>) -> anyhow::Result<Option<T>> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e @ (ScxError::BadState { .. } | ScxError::UnknownTask(_))) => {
            tracing::debug!(%e, "raced");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

struct World<'a> {
    core: &'a ScxCore,
    views: &'a [Mutex<View>],
    picks: &'a AtomicU64,
}

impl World<'_> {
    fn view(&self, task: TaskId) -> &Mutex<View> {
        &self.views[(task.0 - 1) as usize]
    }

    /// Host-side operation on a random task that nobody else is touching.
    fn step_task(&self, cpu: CpuId, rng: &mut SmallRng) -> anyhow::Result<()> {
        let task = TaskId(rng.gen_range(1..=NR_TASKS));
        let Ok(mut view) = self.view(task).try_lock() else {
            return Ok(());
        };
        let core = self.core;

        match *view {
            View::NotCreated => {
                let args = InitTaskArgs::new(NR_CPUS).with_weight(rng.gen_range(1..=400));
                core.init_task(task, &args)?;
                core.enable(task)?;
                *view = View::Sleeping;
            }
            View::Sleeping | View::Waking if rng.gen_bool(0.05) => {
                core.exit_task(task)?;
                *view = View::Gone;
            }
            View::Sleeping => {
                let prev = CpuId(rng.gen_range(0..NR_CPUS));
                core.select_cpu(cpu, task, prev, WakeFlags::TTWU)?;
                core.enqueue(cpu, task, EnqFlags::WAKEUP)?;
                *view = View::Queued;
            }
            View::Waking => {
                core.enqueue(cpu, task, EnqFlags::empty())?;
                *view = View::Queued;
            }
            View::Queued | View::Running(_) if rng.gen_bool(0.03) => {
                core.exit_task(task)?;
                *view = View::Gone;
            }
            View::Queued if rng.gen_bool(0.2) => {
                if tolerated(core.dequeue(cpu, task, DeqFlags::SLEEP))?.is_some() {
                    *view = View::Sleeping;
                }
            }
            View::Queued | View::Running(_) if rng.gen_bool(0.1) => {
                core.set_weight(task, rng.gen_range(1..=400))?;
            }
            View::Queued | View::Running(_) | View::Gone => {}
        }
        Ok(())
    }

    /// Drive `cpu`: run the current task for a while, or find a new one.
    fn step_cpu(
        &self,
        cpu: CpuId,
        current: &mut Option<TaskId>,
        rng: &mut SmallRng,
    ) -> anyhow::Result<()> {
        let core = self.core;
        let Some(task) = *current else {
            if !core.dispatch(cpu, None)? {
                return Ok(());
            }
            let Some(task) = core.pick_task(cpu)? else {
                return Ok(());
            };
            self.picks.fetch_add(1, Ordering::Relaxed);
            *current = Some(task);
            let mut view = self.view(task).lock().unwrap();
            match *view {
                View::Queued => *view = View::Running(cpu),
                View::Gone => {}
                other => anyhow::bail!("picked task {task} the host sees as {other:?}"),
            }
            return Ok(());
        };

        let Some(expired) = tolerated(core.tick(cpu, task, rng.gen_range(0..=2_000_000)))? else {
            *current = None;
            return Ok(());
        };
        if !expired && !rng.gen_bool(0.2) {
            return Ok(());
        }

        let runnable = rng.gen_bool(0.7);
        let state = tolerated(core.stop(cpu, task, runnable))?;
        *current = None;
        let mut view = self.view(task).lock().unwrap();
        if let (Some(state), View::Running(on)) = (state, *view) {
            anyhow::ensure!(on == cpu, "task {task} stopped on {cpu} but ran on {on}");
            *view = match state {
                TaskState::Queued => View::Queued,
                _ if runnable => View::Waking,
                _ => View::Sleeping,
            };
        }
        Ok(())
    }
}

#[test]
fn test_stress_random_ops() {
    common::setup_test();
    let seed = seed();
    let (core, host) = common::start(SchedConfig::with_cpus(NR_CPUS), ScxSimple::weighted());
    let views: Vec<Mutex<View>> = (0..NR_TASKS).map(|_| Mutex::new(View::NotCreated)).collect();
    let picks = AtomicU64::new(0);
    let barrier = Barrier::new(NR_CPUS as usize);
    let failure: Mutex<Option<String>> = Mutex::new(None);

    let world = World {
        core: &core,
        views: &views,
        picks: &picks,
    };

    thread::scope(|s| {
        for cpu in 0..NR_CPUS {
            let (world, host, barrier, failure) = (&world, &host, &barrier, &failure);
            thread::Builder::new()
                .name(format!("cpu{cpu}"))
                .spawn_scoped(s, move || {
                    let cpu = CpuId(cpu);
                    let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(u64::from(cpu.0)));
                    let mut current = None;
                    let failed = || failure.lock().unwrap().is_some();

                    // Every thread must reach every barrier, failed or not.
                    for round in 0..ROUNDS {
                        for _ in 0..STEPS_PER_ROUND {
                            if failed() {
                                break;
                            }
                            let res = if rng.gen_bool(0.5) {
                                world.step_cpu(cpu, &mut current, &mut rng)
                            } else {
                                world.step_task(cpu, &mut rng)
                            };
                            if let Err(e) = res {
                                failure
                                    .lock()
                                    .unwrap()
                                    .get_or_insert(format!("{cpu} in round {round}: {e:#}"));
                            }
                        }
                        if barrier.wait().is_leader() {
                            host.take_kicks();
                            if let Err(e) = world.core.check_invariants() {
                                failure
                                    .lock()
                                    .unwrap()
                                    .get_or_insert(format!("after round {round}: {e:#}"));
                            }
                        }
                        barrier.wait();
                    }
                })
                .unwrap();
        }
    });

    if let Some(msg) = failure.into_inner().unwrap() {
        panic!("STRESS_SEED={seed}: {msg}");
    }
    assert!(core.is_enabled(), "{:?}", core.exit_info());
    assert!(picks.load(Ordering::Relaxed) > 0);
    tracing::info!(picks = picks.load(Ordering::Relaxed), events = ?core.events(), "stress done");

    let nr_live = views
        .iter()
        .filter(|v| !matches!(*v.lock().unwrap(), View::NotCreated | View::Gone))
        .count();
    assert_eq!(core.nr_tasks(), nr_live);

    let info = core.exit();
    assert_eq!(info.kind, ExitKind::Done);
    assert_eq!(core.nr_tasks(), 0);
}
