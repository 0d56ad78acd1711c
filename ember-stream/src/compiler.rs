//! Stream Compilation
//!
//! Compiling a stream interprets its free program against a scope tree and
//! folds the chunks it outputs. The interpreter runs one step at a time:
//!
//! 1. normalise the program with `view_l`
//! 2. before continuing after any step, check whether the current scope was
//!    interrupted and if so resume the continuation with the interruption
//! 3. interpret the step (output, evaluation, acquisition, scope changes)
//!
//! The root scope is opened and closed by `bracket_case`, so every
//! resource is released however the compilation ends.

use std::sync::Arc;

use ember_runtime::panic::catch_panic;
use ember_runtime::{Effect, Error, ExitCase};

use crate::algebra::{boxed, unbox, Algebra, Cont, FreeC, StepResult, Terminal, Value, ViewL};
use crate::chunk::Chunk;
use crate::interrupt::Interrupt;
use crate::scope::CompileScope;
use crate::stream::Stream;
use crate::token::Token;

type Scope<F> = Arc<CompileScope<F>>;

/// Outcome of running a program up to its next output.
enum Run<F: Effect> {
    Done(Scope<F>),
    Out { head: Value, scope: Scope<F>, tail: FreeC<F> },
    Interrupted { context: Token, error: Option<Error> },
}

/// Next chunk of a compiled program: the chunk, the scope it came from, and
/// the rest of the program.
pub(crate) type Pulled<F> = Option<(Value, Scope<F>, FreeC<F>)>;

/// Run `stream` in `scope` until it outputs a chunk or ends.
pub(crate) fn compile_loop<F: Effect>(scope: Scope<F>, stream: FreeC<F>) -> F::Of<Pulled<F>> {
    F::flat_map(go(scope, stream), |run| match run {
        Run::Done(_) => F::pure(None),
        Run::Out { head, scope, tail } => F::pure(Some((head, scope, tail))),
        Run::Interrupted { error: None, .. } => F::pure(None),
        Run::Interrupted { error: Some(e), .. } => F::raise_error(e),
    })
}

fn go<F: Effect>(scope: Scope<F>, stream: FreeC<F>) -> F::Of<Run<F>> {
    F::suspend(move || match stream.view_l() {
        ViewL::Result(Terminal::Pure(_)) => F::pure(Run::Done(scope)),
        ViewL::Result(Terminal::Fail(e)) => F::raise_error(e),
        ViewL::Result(Terminal::Interrupted { context, error }) => F::pure(Run::Interrupted { context, error }),
        ViewL::View { step, next } => interpret(scope, step, next),
    })
}

/// Continue with `k` unless `scope` was interrupted, in which case the
/// continuation receives the interruption instead.
fn interrupt_guard<F, K>(scope: Scope<F>, next: Cont<F>, k: K) -> F::Of<Run<F>>
where
    F: Effect,
    K: FnOnce(Scope<F>, Cont<F>) -> F::Of<Run<F>> + Send + 'static,
{
    match scope.is_interrupted() {
        None => k(scope, next),
        Some(Interrupt::Failed(e)) => go(scope, next(Terminal::Fail(e))),
        Some(Interrupt::Scope(context)) => go(scope, next(Terminal::Interrupted { context, error: None })),
    }
}

fn interpret<F: Effect>(scope: Scope<F>, step: Algebra<F>, next: Cont<F>) -> F::Of<Run<F>> {
    match step {
        Algebra::Output(head) => interrupt_guard(scope, next, move |scope, next| {
            F::pure(Run::Out { head, scope, tail: next(Terminal::unit()) })
        }),

        Algebra::Step { stream, scope: step_scope_id } => {
            let step_scope = match step_scope_id {
                None => Some(Arc::clone(&scope)),
                Some(id) => scope.find_step_scope(id),
            };
            let Some(step_scope) = step_scope else {
                return F::raise_error(Error::illegal_state(format!(
                    "no scope for step: current {}, requested {:?}",
                    scope.id(),
                    step_scope_id
                )));
            };
            F::flat_map(F::attempt(go(step_scope, *stream)), move |stepped| match stepped {
                Ok(Run::Done(done_scope)) => interrupt_guard(done_scope, next, |scope, next| {
                    go(scope, next(Terminal::Pure(boxed(None::<(Value, Token, FreeC<F>)>))))
                }),
                Ok(Run::Out { head, scope: out_scope, tail }) => {
                    // A step run in another scope hands control back to the
                    // scope that issued it.
                    let out_id = out_scope.id();
                    let next_scope = if step_scope_id.is_some() { scope } else { out_scope };
                    interrupt_guard(next_scope, next, move |scope, next| {
                        let result: StepResult<F> = Some((head, out_id, tail));
                        go(scope, next(Terminal::Pure(boxed(result))))
                    })
                }
                Ok(Run::Interrupted { context, error }) => go(scope, next(Terminal::Interrupted { context, error })),
                Err(e) => go(scope, next(Terminal::Fail(e))),
            })
        }

        Algebra::Eval(fa) => {
            let evaluated = scope.interruptible_eval_erased(fa);
            F::flat_map(evaluated, move |r| match r {
                Ok(v) => go(scope, next(Terminal::Pure(v))),
                Err(Interrupt::Failed(e)) => go(scope, next(Terminal::Fail(e))),
                Err(Interrupt::Scope(context)) => go(scope, next(Terminal::Interrupted { context, error: None })),
            })
        }

        Algebra::Acquire(fa) => interrupt_guard(scope, next, move |scope, next| {
            let acquired = scope.acquire_erased(fa);
            F::flat_map(acquired, move |r| {
                let result = match r {
                    Ok(pair) => Terminal::Pure(boxed(pair)),
                    Err(e) => Terminal::Fail(e),
                };
                go(scope, next(result))
            })
        }),

        Algebra::GetScope => {
            let current = boxed(Arc::clone(&scope));
            go(scope, next(Terminal::Pure(current)))
        }

        Algebra::OpenScope(interruptible) => interrupt_guard(scope, next, move |scope, next| {
            let opened = scope.open(interruptible);
            F::flat_map(opened, move |r| match r {
                Err(e) => go(scope, next(Terminal::Fail(e))),
                Ok(child) => {
                    let id = child.id();
                    go(child, next(Terminal::Pure(boxed(id))))
                }
            })
        }),

        Algebra::CloseScope { scope_id, interrupted, exit_case } => {
            let target = scope
                .find_self_or_ancestor(scope_id)
                .or_else(|| scope.find_self_or_child(scope_id));
            match target {
                Some(to_close) => close_and_go(to_close, exit_case, interrupted, next),
                None => {
                    // Already closed, carry on in the current scope.
                    let result = match interrupted {
                        Some((context, error)) => Terminal::Interrupted { context, error },
                        None => Terminal::unit(),
                    };
                    go(scope, next(result))
                }
            }
        }
    }
}

fn close_and_go<F: Effect>(
    to_close: Scope<F>,
    exit: ExitCase,
    interrupted: Option<(Token, Option<Error>)>,
    next: Cont<F>,
) -> F::Of<Run<F>> {
    let closing = to_close.close(exit);
    F::flat_map(closing, move |closed| {
        let ancestor = to_close.nearest_open_ancestor();
        let result = match interrupted {
            None => match closed {
                Ok(()) => Terminal::unit(),
                Err(e) => Terminal::Fail(e),
            },
            Some((context, error)) => {
                let error = match (error, closed.err()) {
                    (Some(e), Some(close_err)) => Some(e.compose(close_err)),
                    (e, close_err) => e.or(close_err),
                };
                if ancestor.find_self_or_ancestor(context).is_some() {
                    Terminal::Interrupted { context, error }
                } else {
                    // The interrupted scope is gone: resume normally.
                    match error {
                        None => Terminal::unit(),
                        Some(e) => Terminal::Fail(e),
                    }
                }
            }
        };
        go(ancestor, next(result))
    })
}

// ============================================================================
// Folding
// ============================================================================

/// Fold every output chunk of `stream` into `init`, in a fresh root scope.
///
/// A panic in `f` is fed back into the stream as a failure so its handlers
/// and finalizers see it; the rest of the stream is drained and the
/// compilation fails with that error.
pub(crate) fn compile<F, O, B, G>(stream: FreeC<F>, init: B, f: G) -> F::Of<B>
where
    F: Effect,
    O: Send + 'static,
    B: Send + 'static,
    G: FnMut(B, Chunk<O>) -> B + Send + 'static,
{
    F::bracket_case(
        F::delay(|| CompileScope::<F>::new_root(None)),
        move |scope| fold_loop(scope, stream, init, f),
        |scope, exit| {
            F::flat_map(scope.close(exit), |closed| match closed {
                Ok(()) => F::unit(),
                Err(e) => F::raise_error(e),
            })
        },
    )
}

fn fold_loop<F, O, B, G>(scope: Scope<F>, stream: FreeC<F>, acc: B, mut f: G) -> F::Of<B>
where
    F: Effect,
    O: Send + 'static,
    B: Send + 'static,
    G: FnMut(B, Chunk<O>) -> B + Send + 'static,
{
    F::flat_map(compile_loop(scope, stream), move |pulled| match pulled {
        None => F::pure(acc),
        Some((head, scope, tail)) => {
            let chunk: Chunk<O> = unbox(head);
            match catch_panic(move || {
                let acc = f(acc, chunk);
                (acc, f)
            }) {
                Ok((acc, f)) => fold_loop(scope, tail, acc, f),
                Err(e) => {
                    tracing::debug!(error = %e, "fold function failed");
                    let failed = e.clone();
                    F::flat_map(drain_loop(scope, tail.as_handler(e)), move |()| F::raise_error(failed))
                }
            }
        }
    })
}

fn drain_loop<F: Effect>(scope: Scope<F>, stream: FreeC<F>) -> F::Of<()> {
    F::flat_map(compile_loop(scope, stream), |pulled| match pulled {
        None => F::unit(),
        Some((_, scope, tail)) => drain_loop(scope, tail),
    })
}

// ============================================================================
// Compiler
// ============================================================================

/// The ways to run a stream to a single effect.
///
/// Obtained from [`Stream::compile`]. Every method opens a fresh root scope
/// and closes it when the returned effect finishes.
#[must_use = "a compiler does nothing until a fold method is called"]
pub struct Compiler<F: Effect, O> {
    stream: Stream<F, O>,
}

impl<F: Effect, O: Send + 'static> Compiler<F, O> {
    pub(crate) fn new(stream: Stream<F, O>) -> Self {
        Compiler { stream }
    }

    /// Fold every chunk.
    pub fn fold_chunks<B, G>(self, init: B, f: G) -> F::Of<B>
    where
        B: Send + 'static,
        G: FnMut(B, Chunk<O>) -> B + Send + 'static,
    {
        compile(self.stream.into_free(), init, f)
    }

    /// Fold every element.
    pub fn fold<B, G>(self, init: B, mut f: G) -> F::Of<B>
    where
        B: Send + 'static,
        G: FnMut(B, O) -> B + Send + 'static,
    {
        self.fold_chunks(init, move |acc, chunk: Chunk<O>| chunk.into_iter().fold(acc, &mut f))
    }

    /// Collect every element.
    pub fn to_list(self) -> F::Of<Vec<O>> {
        self.fold_chunks(Vec::new(), |mut acc, chunk| {
            acc.extend(chunk);
            acc
        })
    }

    /// Collect every element into one chunk.
    pub fn to_chunk(self) -> F::Of<Chunk<O>> {
        F::map(self.to_list(), Chunk::from_vec)
    }

    /// Run for effects only.
    pub fn drain(self) -> F::Of<()> {
        self.fold_chunks((), |(), _| ())
    }

    /// The last element, if any.
    pub fn last(self) -> F::Of<Option<O>> {
        self.fold_chunks(None, |acc, chunk: Chunk<O>| chunk.into_iter().last().or(acc))
    }

    /// Number of elements.
    pub fn count(self) -> F::Of<usize> {
        self.fold_chunks(0usize, |n, chunk| n + chunk.len())
    }
}
