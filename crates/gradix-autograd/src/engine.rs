//! Engine - Backward Graph Executor
//!
//! Drives an already-built backward DAG to completion. One worker thread is
//! pinned to each device queue; a task always runs on the thread of the
//! device its gradients live on. That binding is the engine's central
//! invariant: two tasks on one device are serialized, which is what lets
//! `AccumulateGrad` (and any other node with internal state) run without
//! locks of its own.
//!
//! `execute` seeds the roots, discovers stochastic nodes, counts per-node
//! in-degrees, and then blocks until the outstanding-task counter drains.
//! Workers evaluate functions, reduce their outputs into the successors'
//! input buffers, and enqueue each successor the moment its dependency
//! count reaches zero. The first failing task latches its error; later
//! tasks for the same graph skip evaluation but still drain the counter so
//! the caller unblocks.
//!
//! @version 0.1.0
//! @author `Gradix` Development Team

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use gradix_core::{accelerator_count, Device};

use crate::error::{AutogradError, Result};
use crate::function::{FnHandle, FnId, VarList};
use crate::input_buffer::InputBuffer;
use crate::variable::Variable;

// =============================================================================
// Callbacks
// =============================================================================

/// Per-`execute` intercept for one function. May rewrite the inputs in
/// place; returning `false` suppresses propagation through the node.
///
/// Suppression substitutes empty placeholder outputs of the correct arity:
/// successors still become ready and run with `None` inputs, which their
/// `apply` must tolerate (`AccumulateGrad` does not).
pub type Callback = Box<dyn Fn(&FnHandle, &mut VarList) -> bool + Send + Sync>;

/// Intercepts keyed by function identity.
pub type CallbackMap = HashMap<FnId, Callback>;

// =============================================================================
// Tasks and Queues
// =============================================================================

struct FunctionTask {
    base: Arc<GraphTask>,
    func: FnHandle,
    inputs: InputBuffer,
}

/// Device-affine FIFO of runnable tasks: pushed at the front, popped at the
/// back, so arrival order is preserved per device.
#[derive(Default)]
struct ReadyQueue {
    queue: Mutex<VecDeque<FunctionTask>>,
    not_empty: Condvar,
}

impl ReadyQueue {
    fn push_front(&self, task: FunctionTask) {
        {
            let mut queue = self.queue.lock();
            task.base.outstanding_tasks.fetch_add(1, Ordering::SeqCst);
            queue.push_front(task);
        }
        self.not_empty.notify_one();
    }

    fn pop_back(&self) -> FunctionTask {
        let mut queue = self.queue.lock();
        loop {
            if let Some(task) = queue.pop_back() {
                return task;
            }
            self.not_empty.wait(&mut queue);
        }
    }
}

// =============================================================================
// Graph Task
// =============================================================================

struct GraphState {
    dependencies: HashMap<FnId, usize>,
    not_ready: HashMap<FnId, InputBuffer>,
    exception: Option<AutogradError>,
}

/// Shared state of one `execute` call: the dependency map, the partially
/// filled input buffers, the first-failure latch, and the completion signal.
struct GraphTask {
    state: Mutex<GraphState>,
    not_done: Condvar,
    has_error: AtomicBool,
    outstanding_tasks: AtomicU64,
    keep_graph: bool,
    has_any_work: AtomicBool,
    callbacks: CallbackMap,
}

impl GraphTask {
    fn new(keep_graph: bool, callbacks: CallbackMap) -> Self {
        Self {
            state: Mutex::new(GraphState {
                dependencies: HashMap::new(),
                not_ready: HashMap::new(),
                exception: None,
            }),
            not_done: Condvar::new(),
            has_error: AtomicBool::new(false),
            outstanding_tasks: AtomicU64::new(0),
            keep_graph,
            has_any_work: AtomicBool::new(false),
            callbacks,
        }
    }
}

// =============================================================================
// Worker Loop
// =============================================================================

fn queue_slot(device: Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(index) => index + 1,
    }
}

fn ready_queue(queues: &[Arc<ReadyQueue>], device: Device) -> Result<&Arc<ReadyQueue>> {
    queues.get(queue_slot(device)).ok_or_else(|| {
        AutogradError::internal(format!("no worker thread registered for device {device}"))
    })
}

fn thread_main(queue: &ReadyQueue, queues: &[Arc<ReadyQueue>]) {
    trace!("backward worker started");
    loop {
        let FunctionTask { base, func, inputs } = queue.pop_back();
        if !base.has_error.load(Ordering::SeqCst) {
            if let Err(err) = evaluate_function(queues, &base, &func, inputs) {
                thread_on_exception(&base, &func, err);
            }
        }
        if base.outstanding_tasks.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _state = base.state.lock();
            base.not_done.notify_all();
        }
    }
}

fn thread_on_exception(base: &GraphTask, func: &FnHandle, err: AutogradError) {
    let mut state = base.state.lock();
    if !base.has_error.load(Ordering::SeqCst) {
        debug!(function = %func.name(), error = %err, "backward task failed; latching first error");
        state.exception = Some(err);
        base.has_error.store(true, Ordering::SeqCst);
    }
}

fn call_function(base: &GraphTask, func: &FnHandle, inputs: InputBuffer) -> Result<VarList> {
    let mut inputs = inputs.variables();
    for hook in func.meta().pre_hooks() {
        inputs = hook.call(inputs)?;
    }

    if let Some(callback) = base.callbacks.get(&func.id()) {
        if !callback(func, &mut inputs) {
            trace!(function = %func.name(), "callback suppressed propagation");
            return Ok(vec![None; func.num_next_functions()]);
        }
    }

    let post_hooks = func.meta().post_hooks();
    if post_hooks.is_empty() {
        func.apply(inputs)
    } else {
        let mut outputs = func.apply(inputs.clone())?;
        for hook in post_hooks {
            outputs = hook.call(outputs, &inputs)?;
        }
        Ok(outputs)
    }
}

fn evaluate_function(
    queues: &[Arc<ReadyQueue>],
    base: &Arc<GraphTask>,
    func: &FnHandle,
    inputs: InputBuffer,
) -> Result<()> {
    trace!(function = %func.name(), "evaluating function");
    let outputs = call_function(base, func, inputs)?;

    if !base.keep_graph {
        func.release_variables();
    }

    let next_functions = func.next_functions();
    if outputs.len() != next_functions.len() {
        return Err(AutogradError::InvalidOutputCount {
            name: func.name(),
            expected: next_functions.len(),
            actual: outputs.len(),
        });
    }

    for (output, edge) in outputs.into_iter().zip(next_functions) {
        let Some(next_fn) = edge.function else {
            continue;
        };
        // Stochastic functions were seeded directly during graph analysis;
        // non-executable successors are off the live subgraph.
        if next_fn.is_stochastic() || !next_fn.is_executable() {
            continue;
        }

        let mut state = base.state.lock();
        let remaining = match state.dependencies.get_mut(&next_fn.id()) {
            None => {
                return Err(AutogradError::DependencyNotFound {
                    name: next_fn.name(),
                })
            }
            Some(count) => {
                *count -= 1;
                *count
            }
        };
        let is_ready = remaining == 0;
        if is_ready {
            state.dependencies.remove(&next_fn.id());
        }

        let mut buffer = state
            .not_ready
            .remove(&next_fn.id())
            .unwrap_or_else(|| InputBuffer::new(next_fn.num_inputs()));
        buffer.add(edge.input_nr, output)?;

        if is_ready {
            drop(state);
            let queue = ready_queue(queues, buffer.device())?;
            queue.push_front(FunctionTask {
                base: Arc::clone(base),
                func: next_fn,
                inputs: buffer,
            });
        } else {
            state.not_ready.insert(next_fn.id(), buffer);
        }
    }
    Ok(())
}

// =============================================================================
// Engine
// =============================================================================

/// Executor for backward graphs.
///
/// Owns one ready queue per device; queue slot 0 serves the host, slot
/// `d + 1` serves accelerator `d`. Worker threads are spawned detached at
/// construction and live for the rest of the process.
pub struct Engine {
    queues: Arc<Vec<Arc<ReadyQueue>>>,
}

impl Engine {
    /// Creates an engine with `num_devices` accelerator queues plus the
    /// host queue, spawning one detached worker per queue.
    #[must_use]
    pub fn new(num_devices: usize) -> Self {
        let queues: Arc<Vec<Arc<ReadyQueue>>> = Arc::new(
            (0..=num_devices)
                .map(|_| Arc::new(ReadyQueue::default()))
                .collect(),
        );
        for (slot, queue) in queues.iter().enumerate() {
            let queue = Arc::clone(queue);
            let all_queues = Arc::clone(&queues);
            thread::Builder::new()
                .name(format!("gradix-worker-{slot}"))
                .spawn(move || thread_main(&queue, &all_queues))
                .expect("failed to spawn backward worker thread");
        }
        Self { queues }
    }

    /// Returns the process-wide engine, sized by accelerator discovery.
    #[must_use]
    pub fn global() -> &'static Engine {
        static ENGINE: Lazy<Engine> = Lazy::new(|| Engine::new(accelerator_count()));
        &ENGINE
    }

    /// Runs the backward graph reachable from `input_roots`, blocking until
    /// every reachable executable function has run or one of them failed.
    ///
    /// `input_roots` names the edges where upstream gradients enter the
    /// graph, paired one-to-one with `inputs`. With `keep_graph` unset,
    /// functions release their saved state after evaluating. `callbacks`
    /// intercept individual functions for this call only.
    ///
    /// On success every reached leaf has its `grad` updated. On failure the
    /// first worker error is returned and the rest of the graph is
    /// abandoned without rollback.
    pub fn execute(
        &self,
        input_roots: &[(FnHandle, usize)],
        inputs: &[Variable],
        keep_graph: bool,
        callbacks: CallbackMap,
    ) -> Result<()> {
        if input_roots.len() != inputs.len() {
            return Err(AutogradError::internal(format!(
                "expected one upstream gradient per root edge, got {} roots and {} gradients",
                input_roots.len(),
                inputs.len()
            )));
        }

        let task = Arc::new(GraphTask::new(keep_graph, callbacks));
        let mut state = task.state.lock();

        // Find the unique roots and seed their input buffers.
        let mut roots = self.find_roots(&task, input_roots, inputs)?;

        // Stochastic functions run unconditionally; seed them too.
        self.find_stochastic_functions(&task, &mut roots)?;

        if !task.has_any_work.load(Ordering::SeqCst) {
            return Err(AutogradError::NoExecutableGraph);
        }

        compute_dependencies(roots, &mut state);

        while task.outstanding_tasks.load(Ordering::SeqCst) != 0 {
            task.not_done.wait(&mut state);
        }

        if task.has_error.load(Ordering::SeqCst) {
            return Err(state.exception.take().unwrap_or_else(|| {
                AutogradError::internal("a worker failed without recording an error")
            }));
        }
        if !state.not_ready.is_empty() {
            return Err(AutogradError::UnreachableFunctions);
        }
        Ok(())
    }

    /// Groups the root edges by function, seeds a buffer per executable
    /// root, and enqueues it on its gradients' device.
    fn find_roots(
        &self,
        task: &Arc<GraphTask>,
        input_roots: &[(FnHandle, usize)],
        inputs: &[Variable],
    ) -> Result<Vec<FnHandle>> {
        let mut roots: Vec<FnHandle> = Vec::new();
        let mut seen: HashSet<FnId> = HashSet::new();
        let mut buffers: HashMap<FnId, InputBuffer> = HashMap::new();

        for ((root, input_nr), input) in input_roots.iter().zip(inputs) {
            if seen.insert(root.id()) {
                roots.push(root.clone());
            }
            if !root.is_executable() {
                continue;
            }
            let buffer = buffers
                .entry(root.id())
                .or_insert_with(|| InputBuffer::new(root.num_inputs()));
            buffer.add(*input_nr, Some(input.clone()))?;
        }

        for root in &roots {
            // Non-executable roots stay in the traversal set but get no task.
            let Some(buffer) = buffers.remove(&root.id()) else {
                continue;
            };
            let queue = ready_queue(&self.queues, buffer.device())?;
            queue.push_front(FunctionTask {
                base: Arc::clone(task),
                func: root.clone(),
                inputs: buffer,
            });
            task.has_any_work.store(true, Ordering::SeqCst);
        }
        Ok(roots)
    }

    /// Breadth-first sweep that seeds every reachable stochastic function
    /// with an empty input buffer on the host queue.
    fn find_stochastic_functions(
        &self,
        task: &Arc<GraphTask>,
        roots: &mut Vec<FnHandle>,
    ) -> Result<()> {
        let mut seen: HashSet<FnId> = HashSet::new();
        let mut search: Vec<FnHandle> = roots.clone();
        while let Some(func) = search.pop() {
            for edge in func.next_functions() {
                let Some(next_fn) = edge.function else {
                    continue;
                };
                if next_fn.is_stochastic()
                    && next_fn.is_executable()
                    && !seen.contains(&next_fn.id())
                {
                    trace!(function = %next_fn.name(), "seeding stochastic function");
                    let queue = ready_queue(&self.queues, Device::Cpu)?;
                    queue.push_front(FunctionTask {
                        base: Arc::clone(task),
                        func: next_fn.clone(),
                        inputs: InputBuffer::new(0),
                    });
                    roots.push(next_fn.clone());
                    task.has_any_work.store(true, Ordering::SeqCst);
                }
                if seen.insert(next_fn.id()) {
                    search.push(next_fn);
                }
            }
        }
        Ok(())
    }
}

/// Counts, for every executable non-stochastic function reachable from the
/// roots, how many in-edges will deliver a gradient to it.
fn compute_dependencies(roots: Vec<FnHandle>, state: &mut GraphState) {
    let mut seen: HashSet<FnId> = roots.iter().map(FnHandle::id).collect();
    let mut queue = roots;
    while let Some(func) = queue.pop() {
        // Filters out roots that are not executable.
        if !func.is_executable() {
            continue;
        }
        for edge in func.next_functions() {
            let Some(next_fn) = edge.function else {
                continue;
            };
            if !next_fn.is_executable() || next_fn.is_stochastic() {
                continue;
            }
            *state.dependencies.entry(next_fn.id()).or_insert(0) += 1;
            if seen.insert(next_fn.id()) {
                queue.push(next_fn);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
