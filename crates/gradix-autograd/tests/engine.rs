//! End-to-end backward graph executions: chains, fan-in, multi-output
//! roots, stochastic seeding, error propagation, and scheduling invariants.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use gradix_autograd::{
    AutogradError, CallbackMap, Edge, Engine, FnHandle, Function, FunctionMeta, Result,
    SavedVariable, VarList, Variable,
};
use gradix_core::Device;
use gradix_tensor::Tensor;

// =============================================================================
// Test Harness
// =============================================================================

type Behavior = Box<dyn Fn(&[Option<Variable>]) -> Result<VarList> + Send + Sync>;

/// A scriptable graph node that records every invocation.
struct TracedFn {
    meta: FunctionMeta,
    calls: Mutex<Vec<Vec<Option<f32>>>>,
    threads: Mutex<Vec<Option<String>>>,
    released: AtomicBool,
    behavior: Behavior,
}

impl TracedFn {
    fn build(
        num_inputs: usize,
        executable: bool,
        stochastic: bool,
        behavior: Behavior,
    ) -> (Arc<TracedFn>, FnHandle) {
        let meta = FunctionMeta::new(executable, stochastic);
        meta.set_num_inputs(num_inputs);
        let func = Arc::new(TracedFn {
            meta,
            calls: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
            behavior,
        });
        let handle = FnHandle::from_arc(func.clone());
        (func, handle)
    }

    fn new(num_inputs: usize, behavior: Behavior) -> (Arc<TracedFn>, FnHandle) {
        Self::build(num_inputs, true, false, behavior)
    }

    fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn calls(&self) -> Vec<Vec<Option<f32>>> {
        self.calls.lock().clone()
    }

    fn thread_names(&self) -> Vec<Option<String>> {
        self.threads.lock().clone()
    }
}

impl Function for TracedFn {
    fn meta(&self) -> &FunctionMeta {
        &self.meta
    }

    fn apply(&self, inputs: VarList) -> Result<VarList> {
        let snapshot = inputs
            .iter()
            .map(|var| var.as_ref().map(|v| v.data().to_vec()[0]))
            .collect();
        self.calls.lock().push(snapshot);
        self.threads
            .lock()
            .push(thread::current().name().map(str::to_string));
        (self.behavior)(&inputs)
    }

    fn release_variables(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    fn name(&self) -> String {
        "TracedFn".into()
    }
}

/// Passes every input through unchanged.
fn identity() -> Behavior {
    Box::new(|inputs| Ok(inputs.to_vec()))
}

/// A volatile scalar gradient, the shape upstream gradients normally take.
fn grad(value: f32) -> Variable {
    Variable::new(Tensor::scalar(value), false, true)
}

fn leaf_with_accumulator() -> (Variable, FnHandle) {
    let leaf = Variable::new(Tensor::scalar(0.0), true, false);
    let acc = leaf.get_grad_accumulator().unwrap();
    (leaf, acc)
}

fn leaf_grad_value(leaf: &Variable) -> f32 {
    leaf.grad().unwrap().data().to_vec()[0]
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn linear_chain_reaches_leaf() {
    let (leaf, acc) = leaf_with_accumulator();
    let (a, a_h) = TracedFn::new(1, identity());
    a_h.meta().set_next_functions(vec![Edge::new(Some(acc), 0)]);
    let (b, b_h) = TracedFn::new(1, identity());
    b_h.meta()
        .set_next_functions(vec![Edge::new(Some(a_h), 0)]);

    let engine = Engine::new(0);
    engine
        .execute(&[(b_h.clone(), 0)], &[grad(1.0)], false, CallbackMap::new())
        .unwrap();

    assert_eq!(b.call_count(), 1);
    assert_eq!(a.calls(), vec![vec![Some(1.0)]]);
    assert_eq!(leaf_grad_value(&leaf), 1.0);
}

#[test]
fn diamond_fan_in_sums_before_single_apply() {
    let (leaf, acc) = leaf_with_accumulator();
    let (a, a_h) = TracedFn::new(1, identity());
    a_h.meta().set_next_functions(vec![Edge::new(Some(acc), 0)]);
    let (_b1, b1_h) = TracedFn::new(1, identity());
    b1_h.meta()
        .set_next_functions(vec![Edge::new(Some(a_h.clone()), 0)]);
    let (_b2, b2_h) = TracedFn::new(1, identity());
    b2_h.meta()
        .set_next_functions(vec![Edge::new(Some(a_h), 0)]);

    let engine = Engine::new(0);
    engine
        .execute(
            &[(b1_h, 0), (b2_h, 0)],
            &[grad(2.0), grad(3.0)],
            false,
            CallbackMap::new(),
        )
        .unwrap();

    // Both branches reduce into one buffer before A runs exactly once.
    assert_eq!(a.calls(), vec![vec![Some(5.0)]]);
    assert_eq!(leaf_grad_value(&leaf), 5.0);
}

#[test]
fn multi_output_root_fills_every_slot() {
    let (leaf, acc) = leaf_with_accumulator();
    let sum_inputs: Behavior = Box::new(|inputs| {
        let total: f32 = inputs
            .iter()
            .flatten()
            .map(|v| v.data().to_vec()[0])
            .sum();
        Ok(vec![Some(Variable::new(Tensor::scalar(total), false, true))])
    });
    let (a, a_h) = TracedFn::new(2, sum_inputs);
    a_h.meta().set_next_functions(vec![Edge::new(Some(acc), 0)]);

    let engine = Engine::new(0);
    engine
        .execute(
            &[(a_h.clone(), 0), (a_h, 1)],
            &[grad(1.0), grad(0.0)],
            false,
            CallbackMap::new(),
        )
        .unwrap();

    assert_eq!(a.calls(), vec![vec![Some(1.0), Some(0.0)]]);
    assert_eq!(leaf_grad_value(&leaf), 1.0);
}

#[test]
fn arity_mismatch_is_fatal() {
    let (_leaf, acc) = leaf_with_accumulator();
    let two_outputs: Behavior = Box::new(|_| Ok(vec![Some(grad(1.0)), Some(grad(2.0))]));
    let (_a, a_h) = TracedFn::new(1, two_outputs);
    a_h.meta().set_next_functions(vec![Edge::new(Some(acc), 0)]);

    let engine = Engine::new(0);
    let err = engine
        .execute(&[(a_h, 0)], &[grad(1.0)], false, CallbackMap::new())
        .unwrap_err();
    assert!(err.to_string().contains("invalid number of outputs"));
    assert!(err.to_string().contains("expected 1, but got 2"));
}

#[test]
fn inplace_mutation_of_saved_input_fails_backward() {
    let (_leaf, acc) = leaf_with_accumulator();

    let saved_src = Variable::new(Tensor::from_vec(vec![1.0, 2.0], &[2]).unwrap(), true, false);
    let _keep_acc = saved_src.get_grad_accumulator().unwrap();
    let saved = SavedVariable::new(&saved_src, None);

    let unpacks: Behavior = Box::new(move |inputs| {
        saved.unpack()?;
        Ok(inputs.to_vec())
    });
    let (_a, a_h) = TracedFn::new(1, unpacks);
    a_h.meta().set_next_functions(vec![Edge::new(Some(acc), 0)]);

    // Mutate the saved tensor between "forward" and backward.
    saved_src.data().fill_(9.0).unwrap();
    saved_src.bump_version();

    let engine = Engine::new(0);
    let err = engine
        .execute(&[(a_h, 0)], &[grad(1.0)], false, CallbackMap::new())
        .unwrap_err();
    assert!(matches!(err, AutogradError::ModifiedByInplaceOperation));
    assert!(err.to_string().contains("modified by an inplace operation"));
}

#[test]
fn stochastic_only_graph_fires_once() {
    let fire: Behavior = Box::new(|_| Ok(Vec::new()));
    let (s, s_h) = TracedFn::build(1, true, true, fire);
    let (r, r_h) = TracedFn::build(1, false, false, identity());
    r_h.meta()
        .set_next_functions(vec![Edge::new(Some(s_h), 0)]);

    let engine = Engine::new(0);
    engine
        .execute(&[(r_h, 0)], &[grad(1.0)], false, CallbackMap::new())
        .unwrap();

    // The stochastic node bootstraps its own gradient: one call, no inputs.
    assert_eq!(s.calls(), vec![Vec::<Option<f32>>::new()]);
    // The non-executable root never runs.
    assert_eq!(r.call_count(), 0);
}

#[test]
fn empty_executable_graph_is_an_error() {
    let (_r, r_h) = TracedFn::build(1, false, false, identity());
    let engine = Engine::new(0);
    let err = engine
        .execute(&[(r_h, 0)], &[grad(1.0)], false, CallbackMap::new())
        .unwrap_err();
    assert!(matches!(err, AutogradError::NoExecutableGraph));
    assert!(err
        .to_string()
        .contains("no graph nodes that require computing gradients"));
}

// =============================================================================
// Accumulation and Lifecycle
// =============================================================================

#[test]
fn leaf_grad_sums_across_executions() {
    let (leaf, acc) = leaf_with_accumulator();
    let (_a, a_h) = TracedFn::new(1, identity());
    a_h.meta().set_next_functions(vec![Edge::new(Some(acc), 0)]);

    let engine = Engine::new(0);
    let first = grad(1.0);
    engine
        .execute(&[(a_h.clone(), 0)], &[first.clone()], false, CallbackMap::new())
        .unwrap();
    engine
        .execute(&[(a_h, 0)], &[grad(2.0)], false, CallbackMap::new())
        .unwrap();

    assert_eq!(leaf_grad_value(&leaf), 3.0);
    // The first contribution was cloned, so mutating it cannot corrupt grad.
    assert!(!leaf.grad().unwrap().data().shares_storage(&first.data()));
    first.data().fill_(100.0).unwrap();
    assert_eq!(leaf_grad_value(&leaf), 3.0);
}

#[test]
fn release_variables_respects_keep_graph() {
    let (_leaf, acc) = leaf_with_accumulator();
    let (a, a_h) = TracedFn::new(1, identity());
    a_h.meta().set_next_functions(vec![Edge::new(Some(acc.clone()), 0)]);

    let engine = Engine::new(0);
    engine
        .execute(&[(a_h, 0)], &[grad(1.0)], true, CallbackMap::new())
        .unwrap();
    assert!(!a.released.load(Ordering::SeqCst));

    let (b, b_h) = TracedFn::new(1, identity());
    b_h.meta().set_next_functions(vec![Edge::new(Some(acc), 0)]);
    engine
        .execute(&[(b_h, 0)], &[grad(1.0)], false, CallbackMap::new())
        .unwrap();
    assert!(b.released.load(Ordering::SeqCst));
}

#[test]
fn callback_false_suppresses_propagation() {
    // B feeds A; A's gradient goes nowhere. Suppressing B still readies A,
    // which then observes an empty placeholder input.
    let (a, a_h) = TracedFn::new(1, identity());
    a_h.meta().set_next_functions(vec![Edge::new(None, 0)]);
    let (b, b_h) = TracedFn::new(1, identity());
    b_h.meta()
        .set_next_functions(vec![Edge::new(Some(a_h), 0)]);

    let mut callbacks = CallbackMap::new();
    callbacks.insert(b_h.id(), Box::new(|_, _| false));

    let engine = Engine::new(0);
    engine
        .execute(&[(b_h, 0)], &[grad(1.0)], false, callbacks)
        .unwrap();

    assert_eq!(b.call_count(), 0);
    assert_eq!(a.calls(), vec![vec![None]]);
}

// =============================================================================
// Failure Propagation
// =============================================================================

#[test]
fn first_exception_wins_and_unblocks_caller() {
    let fail_left: Behavior =
        Box::new(|_| Err(AutogradError::internal("left kernel failed")));
    let fail_right: Behavior =
        Box::new(|_| Err(AutogradError::internal("right kernel failed")));
    let (_f1, f1_h) = TracedFn::new(1, fail_left);
    let (_f2, f2_h) = TracedFn::new(1, fail_right);

    let fan_out: Behavior = Box::new(|inputs| {
        let g = inputs[0].clone();
        Ok(vec![g.clone(), g])
    });
    let (_b, b_h) = TracedFn::new(1, fan_out);
    b_h.meta().set_next_functions(vec![
        Edge::new(Some(f1_h), 0),
        Edge::new(Some(f2_h), 0),
    ]);

    let engine = Engine::new(0);
    let err = engine
        .execute(&[(b_h, 0)], &[grad(1.0)], false, CallbackMap::new())
        .unwrap_err();
    // Exactly one of the two failures surfaces; the caller is unblocked.
    assert!(err.to_string().contains("kernel failed"));
}

#[test]
fn failing_and_succeeding_branches_leave_one_error() {
    let (leaf, acc) = leaf_with_accumulator();
    let (_ok, ok_h) = TracedFn::new(1, identity());
    ok_h.meta().set_next_functions(vec![Edge::new(Some(acc), 0)]);
    let fail: Behavior = Box::new(|_| Err(AutogradError::internal("boom")));
    let (_bad, bad_h) = TracedFn::new(1, fail);

    let engine = Engine::new(0);
    let err = engine
        .execute(
            &[(bad_h, 0), (ok_h, 0)],
            &[grad(1.0), grad(1.0)],
            false,
            CallbackMap::new(),
        )
        .unwrap_err();
    assert!(err.to_string().contains("boom"));
    // The graph is abandoned without rollback: the successful branch may or
    // may not have accumulated, but the engine itself stays usable.
    let _ = leaf.grad();
    let (leaf2, acc2) = leaf_with_accumulator();
    let (_c, c_h) = TracedFn::new(1, identity());
    c_h.meta().set_next_functions(vec![Edge::new(Some(acc2), 0)]);
    engine
        .execute(&[(c_h, 0)], &[grad(4.0)], false, CallbackMap::new())
        .unwrap();
    assert_eq!(leaf_grad_value(&leaf2), 4.0);
}

// =============================================================================
// Scheduling Invariants
// =============================================================================

#[test]
fn apply_is_never_entered_concurrently() {
    let in_flight = Arc::new(AtomicBool::new(false));
    let overlapped = Arc::new(AtomicBool::new(false));
    let behavior: Behavior = {
        let in_flight = Arc::clone(&in_flight);
        let overlapped = Arc::clone(&overlapped);
        Box::new(move |_| {
            if in_flight.swap(true, Ordering::SeqCst) {
                overlapped.store(true, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(1));
            in_flight.store(false, Ordering::SeqCst);
            Ok(Vec::new())
        })
    };
    let (shared, shared_h) = TracedFn::new(1, behavior);
    shared_h.meta().set_next_functions(Vec::new());

    let mut workers = Vec::new();
    for _ in 0..8 {
        let handle = shared_h.clone();
        workers.push(thread::spawn(move || {
            for _ in 0..5 {
                Engine::global()
                    .execute(&[(handle.clone(), 0)], &[grad(1.0)], false, CallbackMap::new())
                    .unwrap();
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(shared.call_count(), 40);
    assert!(!overlapped.load(Ordering::SeqCst));
}

#[test]
fn tasks_run_on_their_gradient_device_thread() {
    let engine = Engine::new(1);

    let (cpu_fn, cpu_h) = TracedFn::new(1, identity());
    cpu_h.meta().set_next_functions(vec![Edge::new(None, 0)]);
    engine
        .execute(&[(cpu_h, 0)], &[grad(1.0)], false, CallbackMap::new())
        .unwrap();
    assert_eq!(
        cpu_fn.thread_names(),
        vec![Some("gradix-worker-0".to_string())]
    );

    let (cuda_fn, cuda_h) = TracedFn::new(1, identity());
    cuda_h.meta().set_next_functions(vec![Edge::new(None, 0)]);
    let cuda_grad = Variable::new(
        Tensor::from_vec_on(vec![1.0], &[1], Device::Cuda(0)).unwrap(),
        false,
        true,
    );
    engine
        .execute(&[(cuda_h, 0)], &[cuda_grad], false, CallbackMap::new())
        .unwrap();
    assert_eq!(
        cuda_fn.thread_names(),
        vec![Some("gradix-worker-1".to_string())]
    );
}
