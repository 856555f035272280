// This test suite runs whole loops through the pipeline: the parent forks the stage workers and
// the try-commit process, commits in-process, and re-executes misspeculated iterations with the
// loop's recovery function before restarting the pipeline. Every test compares the final heap
// with what a plain sequential run of the same loop computes, which is the property the runtime
// promises. The loops cover forward flow through a value channel and versioned memory, forward
// flow through memory alone (stage 0 writes a[i], the replicas read a[i - 1]), the same loop
// reading a[i] in the iteration that writes it, which the try-commit rejects every time, an
// explicit misspeculation raised by a replica, a loop-carried write from a later stage back into
// stage 0 (caught by the ordering tokens), and the same loop-carried value broken by a
// linear value predictor, including a stride change that invalidates the prediction. Memory
// registered in place (a stack frame of the test) runs the forward loop outside the heap window.

//! End-to-end runs of speculative loops.

use std::mem;

use specpipe::commit::CommitOutcome;
use specpipe::core::region::Sharing;
use specpipe::core::test_utils::{fork_lock, TestContext};
use specpipe::core::{MappedRegion, Runtime, RuntimeContext, RuntimeResult, StageError, PAGE_SIZE};
use specpipe::pipeline::{LoopControl, SpeculativeLoop, StageSpec, Topology, Worker};
use specpipe::predict::{Numeric, PredictorKind, PredictorSpec};
use specpipe::queue::ChannelId;
use specpipe::{HeapClass, MisspecReason};

const WORD: usize = 8;

fn context() -> RuntimeContext {
    let _ = env_logger::builder().is_test(true).try_init();
    TestContext::new().context().unwrap()
}

fn two_stage() -> Topology {
    Topology::new(vec![StageSpec::sequential(), StageSpec::parallel(2)], 1).unwrap()
}

fn two_sequential() -> Topology {
    Topology::new(vec![StageSpec::sequential(), StageSpec::sequential()], 1).unwrap()
}

fn words(rt: &Runtime, base: usize, n: u64) -> Vec<u64> {
    // SAFETY: callers pass allocations of at least `n` words.
    (0..n as usize).map(|i| unsafe { rt.load(base + i * WORD) }).collect()
}

/// Stage 0 keeps a running sum and passes `i * i` on; the replicas write
/// `v + 1` into the output.
struct Squares {
    trip: u64,
    sum: usize,
    out: usize,
    channel: ChannelId,
    fail_at: Option<u64>,
}

impl Squares {
    fn expected(trip: u64) -> (u64, Vec<u64>) {
        let mut sum = 0;
        let out = (0..trip)
            .map(|i| {
                sum += i;
                i * i + 1
            })
            .collect();
        (sum, out)
    }
}

impl SpeculativeLoop for Squares {
    fn header(&mut self, worker: &mut Worker<'_>) -> Result<LoopControl, StageError> {
        Ok(if worker.current_iter() < self.trip {
            LoopControl::Continue
        } else {
            LoopControl::Exit(7)
        })
    }

    fn stage(&mut self, stage: usize, worker: &mut Worker<'_>) -> Result<(), StageError> {
        let i = worker.current_iter();
        if stage == 0 {
            // SAFETY: `sum` is a live versioned word.
            unsafe {
                let sum: u64 = worker.load(self.sum);
                worker.store(self.sum, sum + i);
            }
            return worker.produce(self.channel, i * i);
        }
        let v = worker.consume(self.channel)?;
        if self.fail_at == Some(i) {
            return Err(MisspecReason::Explicit(3).into());
        }
        // SAFETY: `out` holds `trip` words.
        unsafe { worker.store(self.out + i as usize * WORD, v + 1) };
        Ok(())
    }

    fn recover(&mut self, rt: &mut Runtime, low: u64, high: u64) -> RuntimeResult<Option<u32>> {
        for i in low..=high {
            if i >= self.trip {
                return Ok(Some(7));
            }
            // SAFETY: as in `stage`.
            unsafe {
                let sum: u64 = rt.load(self.sum);
                rt.store(self.sum, sum + i);
                rt.store(self.out + i as usize * WORD, i * i + 1);
            }
        }
        Ok(None)
    }
}

fn run_squares(trip: u64, fail_at: Option<u64>) -> (RuntimeContext, u32, Squares) {
    let mut ctx = context();
    let rt = ctx.runtime_mut();
    let sum = rt.calloc(HeapClass::Versioned, 1, WORD).unwrap();
    let out = rt.calloc(HeapClass::Versioned, trip as usize, WORD).unwrap();
    ctx.begin_invocation(two_stage()).unwrap();
    let channel = ctx.create_queue(0, 1).unwrap();
    let mut body = Squares {
        trip,
        sum,
        out,
        channel,
        fail_at,
    };
    let code = ctx.run(&mut body, 0).unwrap();
    (ctx, code, body)
}

#[test]
fn test_forward_flow_loop_commits_every_iteration() {
    let _guard = fork_lock();
    let (mut ctx, code, body) = run_squares(24, None);
    assert_eq!(code, 7);
    assert_eq!(ctx.last_committed(), Some(23));
    assert_eq!(ctx.misspec_iter(), None);

    let (sum, out) = Squares::expected(24);
    let rt = ctx.runtime();
    // SAFETY: the sum word.
    assert_eq!(unsafe { rt.load::<u64>(body.sum) }, sum);
    assert_eq!(words(rt, body.out, 24), out);
    ctx.end_invocation().unwrap();
}

#[test]
fn test_explicit_misspeculation_is_recovered() {
    let _guard = fork_lock();
    let (mut ctx, code, body) = run_squares(20, Some(9));
    assert_eq!(code, 7);

    let (sum, out) = Squares::expected(20);
    let rt = ctx.runtime();
    // SAFETY: the sum word.
    assert_eq!(unsafe { rt.load::<u64>(body.sum) }, sum);
    assert_eq!(words(rt, body.out, 20), out);
    ctx.end_invocation().unwrap();
}

#[test]
fn test_misspeculation_in_the_last_iteration() {
    let _guard = fork_lock();
    // the restarted pipeline takes the exit straight away
    let (mut ctx, code, body) = run_squares(6, Some(5));
    assert_eq!(code, 7);
    assert_eq!(words(ctx.runtime(), body.out, 6), Squares::expected(6).1);
    ctx.end_invocation().unwrap();
}

/// Stage 0 writes `a[i] = 100 + i`; every replica of stage 1 copies `a[i - 1]`
/// into `out[i]`, or `a[i]` itself with `same_iteration`.
struct Forward {
    trip: u64,
    a: usize,
    out: usize,
    same_iteration: bool,
    recovered: Vec<(u64, u64)>,
}

impl Forward {
    fn new(trip: u64, a: usize, out: usize, same_iteration: bool) -> Self {
        Self {
            trip,
            a,
            out,
            same_iteration,
            recovered: Vec::new(),
        }
    }

    fn source(&self, i: u64) -> Option<u64> {
        if self.same_iteration {
            Some(i)
        } else {
            i.checked_sub(1)
        }
    }

    /// `a` and `out` after a sequential run.
    fn expected(&self) -> (Vec<u64>, Vec<u64>) {
        let a: Vec<u64> = (0..self.trip).map(|i| 100 + i).collect();
        let out = (0..self.trip)
            .map(|i| self.source(i).map_or(0, |j| a[j as usize]))
            .collect();
        (a, out)
    }
}

impl SpeculativeLoop for Forward {
    fn header(&mut self, worker: &mut Worker<'_>) -> Result<LoopControl, StageError> {
        Ok(if worker.current_iter() < self.trip {
            LoopControl::Continue
        } else {
            LoopControl::Exit(0)
        })
    }

    fn stage(&mut self, stage: usize, worker: &mut Worker<'_>) -> Result<(), StageError> {
        let i = worker.current_iter();
        // SAFETY: `a` and `out` hold `trip` words.
        unsafe {
            if stage == 0 {
                worker.store(self.a + i as usize * WORD, 100 + i);
                return Ok(());
            }
            let v = match self.source(i) {
                Some(j) => worker.load::<u64>(self.a + j as usize * WORD),
                None => 0,
            };
            worker.store(self.out + i as usize * WORD, v);
        }
        Ok(())
    }

    fn recover(&mut self, rt: &mut Runtime, low: u64, high: u64) -> RuntimeResult<Option<u32>> {
        self.recovered.push((low, high));
        for i in low..=high {
            if i >= self.trip {
                return Ok(Some(0));
            }
            // SAFETY: as in `stage`.
            unsafe {
                rt.store(self.a + i as usize * WORD, 100 + i);
                let v = match self.source(i) {
                    Some(j) => rt.load::<u64>(self.a + j as usize * WORD),
                    None => 0,
                };
                rt.store(self.out + i as usize * WORD, v);
            }
        }
        Ok(None)
    }
}

fn forward_loop(ctx: &mut RuntimeContext, trip: u64, same_iteration: bool) -> Forward {
    let rt = ctx.runtime_mut();
    let a = rt.calloc(HeapClass::Versioned, trip as usize, WORD).unwrap();
    let out = rt.calloc(HeapClass::Versioned, trip as usize, WORD).unwrap();
    Forward::new(trip, a, out, same_iteration)
}

#[test]
fn test_memory_forwarded_to_the_next_iteration_commits_cleanly() {
    let _guard = fork_lock();
    let mut ctx = context();
    let mut body = forward_loop(&mut ctx, 10, false);
    ctx.begin_invocation(two_stage()).unwrap();

    assert_eq!(ctx.run(&mut body, 0).unwrap(), 0);
    assert_eq!(ctx.last_committed(), Some(9));
    assert_eq!(ctx.misspec_iter(), None);
    assert!(body.recovered.is_empty());

    let (a, out) = body.expected();
    assert_eq!(out, [0, 100, 101, 102, 103, 104, 105, 106, 107, 108]);
    assert_eq!(words(ctx.runtime(), body.a, 10), a);
    assert_eq!(words(ctx.runtime(), body.out, 10), out);
    ctx.end_invocation().unwrap();
}

#[test]
fn test_same_iteration_read_is_detected_and_recovered() {
    let _guard = fork_lock();
    let mut ctx = context();
    let mut body = forward_loop(&mut ctx, 10, true);
    ctx.begin_invocation(two_stage()).unwrap();

    // one pipeline run by hand, to look at the control block before recovery
    ctx.spawn_workers_callback(0, &mut body).unwrap();
    let outcome = ctx.commit(0).unwrap();
    ctx.join_children().unwrap();
    assert_eq!(outcome, CommitOutcome::Misspeculated { iteration: 0 });
    assert_eq!(ctx.last_committed(), None);
    let validator = ctx.topology().unwrap().try_commit_node(0);
    let pcb = ctx.pcb().unwrap();
    assert_eq!(
        pcb.misspec_origin(),
        Some((0, validator, MisspecReason::SameIterationRead { addr: 0, stage: 0 }.code()))
    );

    body.recover(ctx.runtime_mut(), 0, 0).unwrap();
    ctx.recovery_finished(None).unwrap();
    assert_eq!(ctx.misspec_iter(), None);

    // every restart reads a value its own iteration writes, so each
    // iteration ends up re-executed on its own
    assert_eq!(ctx.run(&mut body, 1).unwrap(), 0);
    assert_eq!(body.recovered, (0..10).map(|i| (i, i)).collect::<Vec<_>>());

    let (a, out) = body.expected();
    assert_eq!(out, (100..110).collect::<Vec<u64>>());
    assert_eq!(words(ctx.runtime(), body.a, 10), a);
    assert_eq!(words(ctx.runtime(), body.out, 10), out);
    ctx.end_invocation().unwrap();
}

#[test]
fn test_registered_stack_memory_is_tracked_in_place() {
    let _guard = fork_lock();
    let mut ctx = context();
    let mut frame = [0u64; 10];
    let a = frame.as_mut_ptr() as usize;
    ctx.register_region(a, mem::size_of_val(&frame), HeapClass::Unclassified)
        .unwrap();
    let out = ctx.runtime_mut().calloc(HeapClass::Versioned, 10, WORD).unwrap();
    let mut body = Forward::new(10, a, out, false);
    ctx.begin_invocation(two_stage()).unwrap();

    assert_eq!(ctx.run(&mut body, 0).unwrap(), 0);
    assert_eq!(ctx.last_committed(), Some(9));
    assert_eq!(ctx.misspec_iter(), None);

    let (expected_a, expected_out) = body.expected();
    // SAFETY: `frame` is live; commit wrote it through `a`.
    let committed: Vec<u64> = (0..10)
        .map(|i| unsafe { std::ptr::read_volatile((a + i * WORD) as *const u64) })
        .collect();
    assert_eq!(committed, expected_a);
    assert_eq!(words(ctx.runtime(), out, 10), expected_out);
    ctx.end_invocation().unwrap();
}

#[test]
fn test_region_registration_rules() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut ctx = TestContext::new().context().unwrap();
    let memory = MappedRegion::new(4 * PAGE_SIZE, Sharing::Private).unwrap();
    let base = memory.addr();

    ctx.register_region(base + 8, 2 * PAGE_SIZE, HeapClass::Unclassified)
        .unwrap();
    // the first registration covers three whole pages
    assert_eq!(ctx.runtime().mirror().regions().len(), 1);
    assert_eq!(ctx.runtime().mirror().regions()[0].len(), 3 * PAGE_SIZE);

    // same class again: only the page not yet tracked is added
    ctx.register_region(base, 4 * PAGE_SIZE, HeapClass::Unclassified)
        .unwrap();
    let regions = ctx.runtime().mirror().regions();
    assert_eq!(regions.len(), 2);
    assert_eq!(regions[1].begin, base + 3 * PAGE_SIZE);
    assert!(ctx.runtime().mirror().is_backed(base + 4 * PAGE_SIZE - 8, 8));

    assert!(ctx.register_region(base, 8, HeapClass::StagePrivate).is_err());
    assert!(ctx.register_region(base, 0, HeapClass::Unclassified).is_err());
    let window = ctx.runtime().layout().base;
    assert!(ctx.register_region(window, 8, HeapClass::Unclassified).is_err());

    let other = MappedRegion::new(PAGE_SIZE, Sharing::Private).unwrap();
    assert!(ctx.register_region(other.addr(), 8, HeapClass::Versioned).is_err());
    ctx.begin_invocation(two_stage()).unwrap();
    assert!(ctx.register_region(other.addr(), 8, HeapClass::ReadOnly).is_err());
    ctx.end_invocation().unwrap();
}

/// Stage 1 moves a cursor that stage 0 of the next iteration reads, and stage
/// 0 records what it saw. `jump_at` makes the cursor skip once.
struct Cursor {
    trip: u64,
    cursor: usize,
    seen: usize,
    jump_at: Option<u64>,
}

impl Cursor {
    fn step(&self, i: u64) -> u64 {
        if self.jump_at == Some(i) {
            24
        } else {
            8
        }
    }

    fn expected(&self) -> Vec<u64> {
        let mut cursor = 0x1000;
        (0..self.trip)
            .map(|i| {
                let seen = cursor;
                cursor += self.step(i);
                seen
            })
            .collect()
    }
}

impl SpeculativeLoop for Cursor {
    fn header(&mut self, worker: &mut Worker<'_>) -> Result<LoopControl, StageError> {
        Ok(if worker.current_iter() < self.trip {
            LoopControl::Continue
        } else {
            LoopControl::Exit(0)
        })
    }

    fn stage(&mut self, stage: usize, worker: &mut Worker<'_>) -> Result<(), StageError> {
        let i = worker.current_iter();
        // SAFETY: `cursor` is one word and `seen` holds `trip` words.
        unsafe {
            let at: u64 = worker.load(self.cursor);
            if stage == 0 {
                worker.store(self.seen + i as usize * WORD, at);
            } else {
                worker.store(self.cursor, at + self.step(i));
            }
        }
        Ok(())
    }

    fn recover(&mut self, rt: &mut Runtime, low: u64, high: u64) -> RuntimeResult<Option<u32>> {
        for i in low..=high {
            if i >= self.trip {
                return Ok(Some(0));
            }
            // SAFETY: as in `stage`.
            unsafe {
                let at: u64 = rt.load(self.cursor);
                rt.store(self.seen + i as usize * WORD, at);
                rt.store(self.cursor, at + self.step(i));
            }
        }
        Ok(None)
    }
}

fn cursor_loop(ctx: &mut RuntimeContext, trip: u64, jump_at: Option<u64>) -> Cursor {
    let rt = ctx.runtime_mut();
    let cursor = rt.calloc(HeapClass::Versioned, 1, WORD).unwrap();
    let seen = rt.calloc(HeapClass::Versioned, trip as usize, WORD).unwrap();
    // SAFETY: the cursor word.
    unsafe { rt.store(cursor, 0x1000u64) };
    Cursor {
        trip,
        cursor,
        seen,
        jump_at,
    }
}

#[test]
fn test_loop_carried_write_from_a_later_stage_is_caught() {
    let _guard = fork_lock();
    let mut ctx = context();
    let mut body = cursor_loop(&mut ctx, 10, None);
    ctx.begin_invocation(two_sequential()).unwrap();
    // without a predictor every run loses its second iteration to the backward
    // flow, and recovery still produces the sequential result
    assert_eq!(ctx.run(&mut body, 0).unwrap(), 0);
    assert_eq!(words(ctx.runtime(), body.seen, 10), body.expected());
    // SAFETY: the cursor word.
    assert_eq!(unsafe { ctx.runtime().load::<u64>(body.cursor) }, 0x1000 + 80);
    ctx.end_invocation().unwrap();
}

fn predicted_cursor(ctx: &mut RuntimeContext, body: &Cursor) {
    ctx.register_predictor(PredictorSpec {
        site: 1,
        context: 0,
        ptr: body.cursor,
        size: WORD,
        kind: PredictorKind::Linear(Numeric::Integer),
    })
    .unwrap();
}

#[test]
fn test_linear_prediction_breaks_the_loop_carried_dependence() {
    let _guard = fork_lock();
    let mut ctx = context();
    let mut body = cursor_loop(&mut ctx, 16, None);
    ctx.begin_invocation(two_sequential()).unwrap();
    predicted_cursor(&mut ctx, &body);

    assert_eq!(ctx.run(&mut body, 0).unwrap(), 0);
    assert_eq!(ctx.misspec_iter(), None, "every read of the cursor was predicted");
    assert_eq!(ctx.last_committed(), Some(15));
    assert_eq!(words(ctx.runtime(), body.seen, 16), body.expected());
    ctx.end_invocation().unwrap();
}

#[test]
fn test_stride_change_invalidates_the_prediction() {
    let _guard = fork_lock();
    let mut ctx = context();
    let mut body = cursor_loop(&mut ctx, 16, Some(6));
    ctx.begin_invocation(two_sequential()).unwrap();
    predicted_cursor(&mut ctx, &body);

    assert_eq!(ctx.run(&mut body, 0).unwrap(), 0);
    let expected = body.expected();
    assert_eq!(words(ctx.runtime(), body.seen, 16), expected);
    // SAFETY: the cursor word.
    let end: u64 = unsafe { ctx.runtime().load(body.cursor) };
    assert_eq!(end, 0x1000 + 15 * 8 + 24);
    ctx.end_invocation().unwrap();
}
