//! Dependency ordering and the parallel phase scheduler.
//!
//! `build_order` runs single-threaded between phases: it injects the
//! compile phase's fence-induced edges, promotes weak edges where that
//! cannot create a cycle, detects cycles with a three-color DFS, and
//! rebuilds reverse edges, remaining-dependency counters, and the seed
//! of the ready queue. The DFS stores its colors in each global's
//! `ideps_left` counter; the counter is re-initialized before any worker
//! sees it.
//!
//! `precheck_all` / `compile_all` then spawn workers that drain the
//! queue. Completion of a global atomically decrements its dependents'
//! counters and enqueues the ones that reach zero; a worker error stops
//! the run, wakes every waiter, and the first error is rethrown once all
//! workers have exited.

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread;

use diagnostics::{CompilerError, Diagnostic, DiagnosticPart, Result};

use crate::globals::{Context, GlobalKind};
use crate::interface::{Backend, Evaluator};
use crate::phase::Phase;
use crate::pool::{lock, read_lock, write_lock, GlobalId};

// DFS colors stored transiently in `ideps_left`; white is 0.
const GRAY: u32 = 1;
const BLACK: u32 = 2;

#[derive(Debug, Default)]
struct ReadyState {
    ready: Vec<GlobalId>,
    globals_left: usize,
    stopped: bool,
}

/// The shared ready queue: a LIFO of globals whose dependencies are all
/// complete, plus the count of globals still to process this phase.
#[derive(Debug, Default)]
pub(crate) struct ReadyQueue {
    state: Mutex<ReadyState>,
    cv: Condvar,
}

impl ReadyQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn begin_phase(&self, globals_left: usize) {
        let mut state = lock(&self.state);
        state.globals_left = globals_left;
        state.stopped = false;
    }

    fn stop(&self) {
        lock(&self.state).stopped = true;
        self.cv.notify_all();
    }
}

impl Context {
    /// Rebuilds the dependency order for the next parallel phase.
    ///
    /// # Errors
    ///
    /// Returns a recursive-definition error listing every participant
    /// when the strong graph contains a cycle.
    ///
    /// # Panics
    ///
    /// Panics when called out of phase order.
    pub fn build_order(&self, precheck: bool) -> Result<()> {
        self.phase_cell().advance_to(if precheck {
            Phase::OrderPrecheck
        } else {
            Phase::OrderCompile
        });

        if !precheck {
            self.add_fence_ideps();
        }

        // Convert weak ideps:
        for id in self.globals().ids() {
            let global = self.globals().get(id);
            let weak = std::mem::take(&mut write_lock(&global.deps).weak_ideps);
            for idep in weak {
                // No point if we already have the idep.
                if read_lock(&global.deps).ideps.contains(&idep) {
                    continue;
                }
                // Avoid loops.
                if self.has_dep(idep, id) {
                    continue;
                }
                write_lock(&global.deps).ideps.insert(idep);
            }
        }

        // Detect cycles (coloring 'ideps_left'), and clear iuses:
        for id in self.globals().ids() {
            let mut trail = Vec::new();
            self.detect_cycle(id, &mut trail)?;
            write_lock(&self.globals().get(id).deps).iuses.clear();
        }

        // Populate reverse edges, initialize counters, seed the queue:
        let mut seed = Vec::new();
        for id in self.globals().ids() {
            let global = self.globals().get(id);
            let ideps = global.ideps();
            global
                .ideps_left
                .store(u32::try_from(ideps.len()).expect("idep count"), Ordering::Release);
            for idep in &ideps {
                write_lock(&self.globals().get(*idep).deps).iuses.push(id);
            }
            if ideps.is_empty() {
                seed.push(id);
            }
        }
        let mut state = lock(&self.ready.state);
        state.ready.clear();
        state.ready.extend(seed);
        Ok(())
    }

    /// Adds the compile phase's fence-induced edges: a function that
    /// waits on NMIs gains a strong edge to each parent mode's NMI; a
    /// function that merely fences gains a weak edge.
    fn add_fence_ideps(&self) {
        for fn_id in self.fns().ids() {
            let f = self.fns().get(fn_id);
            let Some(precheck) = f.precheck_opt() else {
                continue;
            };
            if precheck.tracked.wait_nmis.is_empty() && precheck.tracked.fences.is_empty() {
                continue;
            }
            let strong = !precheck.tracked.wait_nmis.is_empty();
            let fn_global = f.global;
            for mode in f.parent_modes() {
                let nmi = self.fns().get(self.fns().get(mode).mode_nmi(self));
                let nmi_global = nmi.global;
                if strong {
                    assert!(
                        !self.has_dep(nmi_global, fn_global),
                        "fence edge would create a cycle"
                    );
                    write_lock(&self.globals().get(fn_global).deps)
                        .ideps
                        .insert(nmi_global);
                } else {
                    write_lock(&self.globals().get(fn_global).deps)
                        .weak_ideps
                        .insert(nmi_global);
                }
            }
        }
    }

    /// Three-color DFS over the strong graph. Colors live in
    /// `ideps_left` (white/gray/black as 0/1/2) until `build_order`
    /// re-initializes the counters.
    ///
    /// Returns the gray global that closed a cycle while the stack
    /// unwinds, collecting each participant into `trail`.
    fn detect_cycle(
        &self,
        id: GlobalId,
        trail: &mut Vec<DiagnosticPart>,
    ) -> Result<Option<GlobalId>> {
        let global = self.globals().get(id);
        match global.ideps_left.load(Ordering::Relaxed) {
            BLACK => return Ok(None),
            GRAY => return Ok(Some(id)),
            _ => {}
        }
        global.ideps_left.store(GRAY, Ordering::Relaxed);

        for idep in global.ideps() {
            let Some(offender) = self.detect_cycle(idep, trail)? else {
                continue;
            };
            if offender != id {
                trail.push(match global.loc() {
                    Some(loc) => DiagnosticPart::note_at(loc, "mutually recursive with:"),
                    None => DiagnosticPart::note(format!("mutually recursive with {}", global.name)),
                });
                return Ok(Some(offender));
            }
            // The cycle closed back on this global; report it.
            let mut diagnostic = match global.loc() {
                Some(loc) => Diagnostic::error_at(
                    loc,
                    format!("{} has a recursive definition", global.name),
                ),
                None => Diagnostic::error(format!("{} has a recursive definition", global.name)),
            };
            for part in trail.drain(..) {
                diagnostic.push(part);
            }
            return Err(diagnostic.into());
        }

        global.ideps_left.store(BLACK, Ordering::Relaxed);
        Ok(None)
    }

    /// Blocks until a global is ready or the phase is over. `None` tells
    /// the worker to exit: everything is processed or the run stopped.
    pub(crate) fn await_ready_global(&self) -> Option<GlobalId> {
        let mut state = lock(&self.ready.state);
        loop {
            if state.stopped || state.globals_left == 0 {
                return None;
            }
            if let Some(id) = state.ready.pop() {
                return Some(id);
            }
            state = self
                .ready
                .cv
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Marks a global done: decrements every dependent's counter,
    /// enqueues the ones that reached zero, and wakes waiters when work
    /// appeared or the phase just drained.
    pub(crate) fn completed(&self, id: GlobalId) {
        let iuses = read_lock(&self.globals().get(id).deps).iuses.clone();
        let mut newly_ready = Vec::with_capacity(iuses.len());
        for dependent in iuses {
            let previous = self
                .globals()
                .get(dependent)
                .ideps_left
                .fetch_sub(1, Ordering::AcqRel);
            debug_assert!(previous > 0, "ideps_left underflow");
            if previous == 1 {
                newly_ready.push(dependent);
            }
        }

        let globals_left;
        let pushed = !newly_ready.is_empty();
        {
            let mut state = lock(&self.ready.state);
            state.ready.extend(newly_ready);
            state.globals_left -= 1;
            globals_left = state.globals_left;
        }
        if pushed || globals_left == 0 {
            self.ready.cv.notify_all();
        }
    }

    /// Runs `work` on the configured number of worker threads; the first
    /// error stops the run and is rethrown after all workers exit.
    fn parallelize(&self, work: impl std::ops::Fn() -> Result<()> + Sync) -> Result<()> {
        let first_error: Mutex<Option<CompilerError>> = Mutex::new(None);
        thread::scope(|scope| {
            for _ in 0..self.options().worker_threads() {
                scope.spawn(|| {
                    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(&work)) {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            let mut slot = lock(&first_error);
                            if slot.is_none() {
                                *slot = Some(err);
                            }
                            drop(slot);
                            self.ready.stop();
                        }
                        // A panicking worker must still release its
                        // siblings before the scope re-raises the panic.
                        Err(payload) => {
                            self.ready.stop();
                            std::panic::resume_unwind(payload);
                        }
                    }
                });
            }
        });
        let result = match lock(&first_error).take() {
            Some(err) => Err(err),
            None => Ok(()),
        };
        result
    }

    /// The parallel precheck phase, followed by single-threaded mode/NMI
    /// finalization.
    ///
    /// # Errors
    ///
    /// Rethrows the first worker error, or a finalization error.
    pub fn precheck_all(&self, eval: &dyn Evaluator) -> Result<()> {
        self.phase_cell().advance_to(Phase::Precheck);
        self.ready.begin_phase(self.globals().len());
        log::debug!(
            "precheck: {} globals on {} workers",
            self.globals().len(),
            self.options().worker_threads()
        );

        self.parallelize(|| {
            while let Some(id) = self.await_ready_global() {
                self.precheck_global(id, eval)?;
            }
            Ok(())
        })?;

        self.precheck_finish()
    }

    /// The parallel compile phase.
    ///
    /// # Errors
    ///
    /// Rethrows the first worker error.
    pub fn compile_all(&self, backend: &dyn Backend) -> Result<()> {
        self.phase_cell().advance_to(Phase::Compile);
        self.ready.begin_phase(self.globals().len());
        log::debug!(
            "compile: {} globals on {} workers",
            self.globals().len(),
            self.options().worker_threads()
        );

        self.parallelize(|| {
            while let Some(id) = self.await_ready_global() {
                self.compile_global(id, backend)?;
            }
            Ok(())
        })
    }

    fn precheck_global(&self, id: GlobalId, eval: &dyn Evaluator) -> Result<()> {
        let global = self.globals().get(id);
        log::trace!("prechecking {}", global.name);
        debug_assert!(self.deps_done(&global.ideps(), Phase::Precheck));

        match global.kind() {
            GlobalKind::Fn(fn_id) => self.fn_precheck(fn_id, eval)?,
            GlobalKind::Var(_) | GlobalKind::Const(_) => {
                let datum = self.datum(id).expect("datum kind");
                self.datum_precheck(datum, eval)?;
            }
            GlobalKind::Struct(struct_id) => self.struct_precheck(struct_id, eval)?,
            GlobalKind::Group(_) => {}
            GlobalKind::Undefined => {
                return Err(CompilerError::msg(format!(
                    "invalid global {}",
                    global.name
                )));
            }
        }

        global.set_prechecked();
        self.completed(id);
        Ok(())
    }

    fn compile_global(&self, id: GlobalId, backend: &dyn Backend) -> Result<()> {
        let global = self.globals().get(id);
        log::trace!("compiling {}", global.name);
        debug_assert!(self.deps_done(&global.ideps(), Phase::Compile));

        match global.kind() {
            GlobalKind::Fn(fn_id) => self.fn_compile(fn_id, backend)?,
            GlobalKind::Var(_)
            | GlobalKind::Const(_)
            | GlobalKind::Struct(_)
            | GlobalKind::Group(_) => {}
            GlobalKind::Undefined => {
                return Err(CompilerError::msg(format!(
                    "invalid global {}",
                    global.name
                )));
            }
        }

        global.set_compiled();
        self.completed(id);
        Ok(())
    }

    fn deps_done(&self, ideps: &BTreeSet<GlobalId>, phase: Phase) -> bool {
        ideps.iter().all(|&idep| {
            let global = self.globals().get(idep);
            match phase {
                Phase::Precheck => global.prechecked(),
                _ => global.compiled(),
            }
        })
    }
}
