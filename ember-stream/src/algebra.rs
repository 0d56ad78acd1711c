//! The Free Structure Behind Pulls and Streams
//!
//! A stream program is a tree of [`FreeC`] nodes: finished results, single
//! algebra steps, and binds whose continuation receives the [`Terminal`]
//! of the node before it. The compiler never recurses into that tree; it
//! asks [`FreeC::view_l`] for the left-most step and the continuation that
//! consumes its result.
//!
//! ## Value erasure
//!
//! Results and chunks travel as `Box<dyn Any + Send>`. The typed wrappers
//! ([`Pull`](crate::Pull), [`Stream`](crate::Stream)) box on the way in and
//! unbox on the way out, so a mismatch is a bug in this crate, never a user
//! error.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use ember_runtime::panic::catch_panic;
use ember_runtime::{Effect, Error, ExitCase, FunctionK};

use crate::interrupt::Interruptible;
use crate::token::Token;

/// An erased value.
pub(crate) type Value = Box<dyn Any + Send>;

pub(crate) fn unbox<A: 'static>(value: Value) -> A {
    *value.downcast::<A>().expect("stream value type mismatch")
}

pub(crate) fn boxed<A: Send + 'static>(a: A) -> Value {
    Box::new(a)
}

/// Release action registered with a scope, receiving how the scope ended.
pub type Finalizer<F> = Box<dyn FnOnce(ExitCase) -> <F as Effect>::Of<()> + Send>;

/// The continuation of a bind.
pub(crate) type Cont<F> = Box<dyn FnOnce(Terminal) -> FreeC<F> + Send>;

/// What a `Step` hands back: the chunk, the scope it was produced in, and
/// the rest of the stepped stream.
pub(crate) type StepResult<F> = Option<(Value, Token, FreeC<F>)>;

/// How a free program ended.
pub(crate) enum Terminal {
    Pure(Value),
    Fail(Error),
    /// Evaluation stopped because the scope `context` was interrupted.
    /// Errors raised while unwinding are deferred here until the
    /// interruption is resumed.
    Interrupted {
        context: Token,
        error: Option<Error>,
    },
}

impl Terminal {
    pub(crate) fn unit() -> Self {
        Terminal::Pure(boxed(()))
    }

    pub(crate) fn exit_case(&self) -> ExitCase {
        match self {
            Terminal::Pure(_) => ExitCase::Completed,
            Terminal::Fail(e) => ExitCase::Error(e.clone()),
            Terminal::Interrupted { .. } => ExitCase::Canceled,
        }
    }
}

impl fmt::Debug for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminal::Pure(_) => f.write_str("Pure(..)"),
            Terminal::Fail(e) => f.debug_tuple("Fail").field(e).finish(),
            Terminal::Interrupted { context, error } => f
                .debug_struct("Interrupted")
                .field("context", context)
                .field("error", error)
                .finish(),
        }
    }
}

/// One primitive instruction.
pub(crate) enum Algebra<F: Effect> {
    /// Emit a chunk (an erased `Chunk<O>`).
    Output(Value),
    /// Evaluate an effect.
    Eval(F::Of<Value>),
    /// Acquire a resource and register its finalizer with the current scope.
    Acquire(F::Of<(Value, Finalizer<F>)>),
    /// Open a child scope; yields its token.
    OpenScope(Option<Interruptible<F>>),
    /// Close the scope `scope_id`, resuming an interruption if one is given.
    CloseScope {
        scope_id: Token,
        interrupted: Option<(Token, Option<Error>)>,
        exit_case: ExitCase,
    },
    /// Yield the current scope.
    GetScope,
    /// Run `stream` until its next output, in `scope` if given.
    Step {
        stream: Box<FreeC<F>>,
        scope: Option<Token>,
    },
}

/// A free program over [`Algebra`].
pub(crate) enum FreeC<F: Effect> {
    Result(Terminal),
    Eval(Algebra<F>),
    Bind(Box<FreeC<F>>, Cont<F>),
    /// A program of another effect type parked as the tail of a translated
    /// step. It is unwrapped before anything evaluates it.
    Foreign(Value),
}

/// The left-most step of a program.
pub(crate) enum ViewL<F: Effect> {
    Result(Terminal),
    View { step: Algebra<F>, next: Cont<F> },
}

/// Run a continuation, turning a panic into a failed program.
fn guarded<F: Effect>(f: impl FnOnce() -> FreeC<F>) -> FreeC<F> {
    catch_panic(f).unwrap_or_else(FreeC::fail)
}

impl<F: Effect> FreeC<F> {
    pub(crate) fn pure(v: Value) -> Self {
        FreeC::Result(Terminal::Pure(v))
    }

    pub(crate) fn unit() -> Self {
        FreeC::Result(Terminal::unit())
    }

    pub(crate) fn fail(e: Error) -> Self {
        FreeC::Result(Terminal::Fail(e))
    }

    pub(crate) fn interrupted(context: Token, error: Option<Error>) -> Self {
        FreeC::Result(Terminal::Interrupted { context, error })
    }

    pub(crate) fn eval(step: Algebra<F>) -> Self {
        FreeC::Eval(step)
    }

    pub(crate) fn suspend<G>(f: G) -> Self
    where
        G: FnOnce() -> FreeC<F> + Send + 'static,
    {
        Self::unit().flat_map(move |_| f())
    }

    pub(crate) fn is_pure(&self) -> bool {
        matches!(self, FreeC::Result(Terminal::Pure(_)))
    }

    pub(crate) fn transform_with<G>(self, f: G) -> Self
    where
        G: FnOnce(Terminal) -> FreeC<F> + Send + 'static,
    {
        FreeC::Bind(Box::new(self), Box::new(move |r| guarded(move || f(r))))
    }

    pub(crate) fn flat_map<G>(self, f: G) -> Self
    where
        G: FnOnce(Value) -> FreeC<F> + Send + 'static,
    {
        self.transform_with(move |r| match r {
            Terminal::Pure(v) => f(v),
            other => FreeC::Result(other),
        })
    }

    pub(crate) fn map<G>(self, f: G) -> Self
    where
        G: FnOnce(Value) -> Value + Send + 'static,
    {
        self.flat_map(move |v| FreeC::pure(f(v)))
    }

    pub(crate) fn handle_error_with<G>(self, h: G) -> Self
    where
        G: FnOnce(Error) -> FreeC<F> + Send + 'static,
    {
        self.transform_with(move |r| match r {
            Terminal::Fail(e) => h(e),
            other => FreeC::Result(other),
        })
    }

    /// Feed `e` into the first pending continuation, discarding its step.
    pub(crate) fn as_handler(self, e: Error) -> Self {
        match self.view_l() {
            ViewL::Result(Terminal::Pure(_)) => FreeC::fail(e),
            ViewL::Result(Terminal::Fail(e2)) => FreeC::fail(e2.compose(e)),
            ViewL::Result(Terminal::Interrupted { context, error }) => {
                let error = match error {
                    Some(t) => e.compose(t),
                    None => e,
                };
                FreeC::interrupted(context, Some(error))
            }
            ViewL::View { next, .. } => guarded(move || next(Terminal::Fail(e))),
        }
    }

    /// Reassociate binds until the left-most node is a step or a result.
    pub(crate) fn view_l(self) -> ViewL<F> {
        let mut free = self;
        loop {
            match free {
                FreeC::Result(r) => return ViewL::Result(r),
                FreeC::Eval(step) => {
                    return ViewL::View { step, next: Box::new(FreeC::Result) };
                }
                FreeC::Foreign(_) => return ViewL::Result(Terminal::Fail(foreign_evaluated())),
                FreeC::Bind(fx, f) => match *fx {
                    FreeC::Result(r) => free = f(r),
                    FreeC::Eval(step) => return ViewL::View { step, next: f },
                    FreeC::Foreign(_) => free = f(Terminal::Fail(foreign_evaluated())),
                    FreeC::Bind(w, g) => {
                        free = FreeC::Bind(w, Box::new(move |e| FreeC::Bind(Box::new(g(e)), f)));
                    }
                },
            }
        }
    }
}

fn foreign_evaluated() -> Error {
    Error::illegal_state("untranslated stream segment evaluated directly")
}

// ============================================================================
// Smart constructors
// ============================================================================

pub(crate) fn output<F: Effect>(chunk: Value) -> FreeC<F> {
    FreeC::eval(Algebra::Output(chunk))
}

pub(crate) fn eval<F: Effect>(fa: F::Of<Value>) -> FreeC<F> {
    FreeC::eval(Algebra::Eval(fa))
}

/// Acquire `R`, keeping a clone for the finalizer. Yields `(R, Token)`
/// erased, the token naming the registered resource.
pub(crate) fn acquire<F, R, Rel>(acquire: F::Of<R>, release: Rel) -> FreeC<F>
where
    F: Effect,
    R: Clone + Send + 'static,
    Rel: FnOnce(R, ExitCase) -> F::Of<()> + Send + 'static,
{
    let fa = F::map(acquire, move |r: R| {
        let kept = r.clone();
        let finalizer: Finalizer<F> = Box::new(move |exit| release(kept, exit));
        (boxed(r), finalizer)
    });
    FreeC::eval(Algebra::Acquire(fa))
}

pub(crate) fn get_scope<F: Effect>() -> FreeC<F> {
    FreeC::eval(Algebra::GetScope)
}

pub(crate) fn step<F: Effect>(stream: FreeC<F>, scope: Option<Token>) -> FreeC<F> {
    FreeC::eval(Algebra::Step { stream: Box::new(stream), scope })
}

/// Step `stream` in the current scope. Yields `Option<(Value, FreeC<F>)>`.
pub(crate) fn uncons<F: Effect>(stream: FreeC<F>) -> FreeC<F> {
    step(stream, None).map(|v| {
        let step: StepResult<F> = unbox(v);
        boxed(step.map(|(head, _, tail)| (head, tail)))
    })
}

pub(crate) fn close_scope<F: Effect>(
    scope_id: Token,
    interrupted: Option<(Token, Option<Error>)>,
    exit_case: ExitCase,
) -> FreeC<F> {
    FreeC::eval(Algebra::CloseScope { scope_id, interrupted, exit_case })
}

/// Run `s` in a fresh child scope that closes when `s` ends.
pub(crate) fn scope<F: Effect>(s: FreeC<F>) -> FreeC<F> {
    scope0(s, None)
}

/// Run `s` in a fresh interruptible child scope.
pub(crate) fn interrupt_scope<F: Effect>(s: FreeC<F>, interruptible: Interruptible<F>) -> FreeC<F> {
    scope0(s, Some(interruptible))
}

fn scope0<F: Effect>(s: FreeC<F>, interruptible: Option<Interruptible<F>>) -> FreeC<F> {
    FreeC::eval(Algebra::OpenScope(interruptible)).flat_map(move |id| {
        let scope_id: Token = unbox(id);
        s.transform_with(move |r| {
            let exit_case = r.exit_case();
            match r {
                Terminal::Pure(_) => close_scope(scope_id, None, exit_case),
                Terminal::Interrupted { context, error } => close_scope(scope_id, Some((context, error)), exit_case),
                Terminal::Fail(err) => close_scope(scope_id, None, exit_case).transform_with(move |closed| match closed {
                    Terminal::Pure(_) => FreeC::fail(err),
                    Terminal::Fail(err0) => FreeC::fail(err.compose(err0)),
                    Terminal::Interrupted { context, .. } => FreeC::fail(Error::illegal_state(format!(
                        "scope {scope_id} interrupted by {context} while closing after a failure"
                    ))),
                }),
            }
        })
    })
}

/// Re-enter `stream` after an inner segment was interrupted: the next
/// pending step sees the interruption instead of running.
pub(crate) fn interrupt_boundary<F: Effect>(stream: FreeC<F>, interrupted: (Token, Option<Error>)) -> FreeC<F> {
    let (context, error) = interrupted;
    match stream.view_l() {
        ViewL::Result(Terminal::Pure(_)) => FreeC::interrupted(context, error),
        ViewL::Result(Terminal::Fail(e)) => FreeC::fail(match error {
            Some(deferred) => deferred.compose(e),
            None => e,
        }),
        ViewL::Result(Terminal::Interrupted { context, error }) => FreeC::interrupted(context, error),
        ViewL::View { step: Algebra::CloseScope { scope_id, exit_case, .. }, next } => {
            close_scope(scope_id, Some((context, error)), exit_case).transform_with(next)
        }
        ViewL::View { next, .. } => guarded(move || next(Terminal::Interrupted { context, error })),
    }
}

// ============================================================================
// Translation
// ============================================================================

/// Translate every effect of `free` through `fk`.
///
/// Nested steps are translated lazily: when a stepped stream outputs, its
/// untranslated tail is parked in [`FreeC::Foreign`] and handed back to the
/// source-level continuation, which translates it again on its next step.
pub(crate) fn translate<F, G, K>(
    free: FreeC<F>,
    main_level: bool,
    fk: Arc<K>,
    concurrent: Option<Interruptible<G>>,
) -> FreeC<G>
where
    F: Effect,
    G: Effect,
    K: FunctionK<F, G>,
{
    match free.view_l() {
        ViewL::Result(r) => FreeC::Result(r),
        ViewL::View { step: instruction, next } => match instruction {
            Algebra::Output(values) => FreeC::eval(Algebra::Output(values)).transform_with(move |r| match r {
                r @ Terminal::Pure(_) if !main_level => FreeC::Foreign(boxed(next(r))),
                r => translate(next(r), main_level, fk, concurrent),
            }),
            Algebra::Step { stream, scope } => {
                let inner = translate(*stream, false, Arc::clone(&fk), concurrent);
                step(inner, scope).transform_with(move |r| {
                    let r = match r {
                        Terminal::Pure(v) => foreign_step_result::<F, G>(v),
                        other => other,
                    };
                    translate(next(r), main_level, fk, concurrent)
                })
            }
            Algebra::Eval(fa) => eval(fk.apply(fa)).transform_with(move |r| translate(next(r), main_level, fk, concurrent)),
            Algebra::Acquire(fa) => {
                let release_k = Arc::clone(&fk);
                let fg = G::map(fk.apply(fa), move |(v, finalizer): (Value, Finalizer<F>)| {
                    let translated: Finalizer<G> = Box::new(move |exit| release_k.apply(finalizer(exit)));
                    (v, translated)
                });
                FreeC::eval(Algebra::Acquire(fg)).transform_with(move |r| translate(next(r), main_level, fk, concurrent))
            }
            Algebra::OpenScope(interruptible) => {
                let target = interruptible.and(concurrent);
                FreeC::eval(Algebra::OpenScope(target))
                    .transform_with(move |r| translate(next(r), main_level, fk, concurrent))
            }
            Algebra::CloseScope { scope_id, interrupted, exit_case } => close_scope(scope_id, interrupted, exit_case)
                .transform_with(move |r| translate(next(r), main_level, fk, concurrent)),
            Algebra::GetScope => {
                let failed = Terminal::Fail(Error::illegal_state("scope access is unavailable in a translated stream"));
                translate(next(failed), main_level, fk, concurrent)
            }
        },
    }
}

/// Convert a target-level step result back into a source-level one.
fn foreign_step_result<F: Effect, G: Effect>(v: Value) -> Terminal {
    let stepped: StepResult<G> = unbox(v);
    match stepped {
        None => Terminal::Pure(boxed(None::<(Value, Token, FreeC<F>)>)),
        Some((head, token, FreeC::Foreign(tail))) => match tail.downcast::<FreeC<F>>() {
            Ok(tail) => Terminal::Pure(boxed(Some((head, token, *tail)))),
            Err(_) => Terminal::Fail(Error::illegal_state("translated tail has the wrong effect type")),
        },
        Some(_) => Terminal::Fail(Error::illegal_state("translated step returned a native tail")),
    }
}

// ============================================================================
// Tests
// ============================================================================
