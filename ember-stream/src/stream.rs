//! Streams
//!
//! A [`Stream<F, O>`] describes a sequence of `O` values whose production
//! may evaluate `F` effects and acquire resources. Like an effect value, a
//! stream does nothing until it is compiled with [`Stream::compile`].
//!
//! # Example
//!
//! ```rust,ignore
//! use ember_runtime::{IoEffect, IO};
//! use ember_stream::Stream;
//!
//! let lines = Stream::<IoEffect, _>::bracket(IO::delay(open_file), |f| IO::delay(move || f.close()))
//!     .flat_map(|f| Stream::emits(f.lines()))
//!     .filter(|line| !line.is_empty())
//!     .take(10);
//!
//! let first_ten = lines.compile().to_list().unsafe_run_sync()?;
//! ```
//!
//! ## Scoping
//!
//! `bracket`, `scope`, `handle_error_with` and [`Pull::stream`] run their
//! stream in a child scope; resources acquired inside are released when
//! that stream ends, fails or is interrupted, and always before the
//! enclosing scope closes.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use ember_runtime::{timer, Concurrent, Effect, Error, ExitCase, FunctionK, IoEffect};
use parking_lot::Mutex;

use crate::algebra::{self, boxed, unbox, FreeC, Terminal, Value};
use crate::chunk::Chunk;
use crate::compiler::Compiler;
use crate::interrupt::Interruptible;
use crate::pull::{Pull, ToPull};
use crate::scope::CompileScope;
use crate::token::Token;

/// A stream of `O` values produced with `F` effects.
#[must_use = "a stream does nothing until it is compiled"]
pub struct Stream<F: Effect, O> {
    free: FreeC<F>,
    _marker: PhantomData<fn() -> O>,
}

impl<F: Effect, O> fmt::Debug for Stream<F, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Stream(..)")
    }
}

type SharedFn<A, B> = Arc<dyn Fn(A) -> B + Send + Sync>;

impl<F: Effect, O: Send + 'static> Stream<F, O> {
    pub(crate) fn from_free(free: FreeC<F>) -> Self {
        Stream { free, _marker: PhantomData }
    }

    pub(crate) fn into_free(self) -> FreeC<F> {
        self.free
    }

    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// The stream with no elements.
    pub fn empty() -> Self {
        Self::from_free(FreeC::unit())
    }

    /// A single element.
    pub fn emit(o: O) -> Self {
        Self::chunk(Chunk::singleton(o))
    }

    /// Every element of `items`, as one chunk.
    pub fn emits<I: IntoIterator<Item = O>>(items: I) -> Self {
        Self::chunk(items.into_iter().collect())
    }

    /// The elements of a chunk.
    pub fn chunk(chunk: Chunk<O>) -> Self {
        if chunk.is_empty() {
            Self::empty()
        } else {
            Self::from_free(algebra::output::<F>(boxed(chunk)))
        }
    }

    /// The result of an effect.
    pub fn eval(fo: F::Of<O>) -> Self {
        Self::from_free(
            algebra::eval::<F>(F::map(fo, boxed)).flat_map(|v| algebra::output(boxed(Chunk::singleton(unbox::<O>(v))))),
        )
    }

    /// Run an effect for its side effects, emitting nothing.
    pub fn eval_<A: Send + 'static>(fa: F::Of<A>) -> Self {
        Self::from_free(algebra::eval::<F>(F::map(fa, boxed)).map(|_| boxed(())))
    }

    /// A stream that fails with `e`.
    pub fn raise_error(e: Error) -> Self {
        Self::from_free(FreeC::fail(e))
    }

    /// Build the stream when it is run.
    pub fn suspend<G>(f: G) -> Self
    where
        G: FnOnce() -> Stream<F, O> + Send + 'static,
    {
        Self::from_free(FreeC::suspend(move || f().free))
    }

    // ------------------------------------------------------------------------
    // Composition
    // ------------------------------------------------------------------------

    /// This stream followed by `next`.
    pub fn append(self, next: Stream<F, O>) -> Self {
        Self::from_free(self.free.transform_with(move |r| match r {
            Terminal::Pure(_) => next.free,
            other => FreeC::Result(other),
        }))
    }

    /// `chunk` followed by this stream.
    pub fn cons(self, chunk: Chunk<O>) -> Self {
        if chunk.is_empty() {
            self
        } else {
            Self::chunk(chunk).append(self)
        }
    }

    /// Transform every chunk.
    pub fn map_chunks<O2, G>(self, f: G) -> Stream<F, O2>
    where
        O2: Send + 'static,
        G: Fn(Chunk<O>) -> Chunk<O2> + Send + Sync + 'static,
    {
        fn go<F: Effect, O: Send + 'static, O2: Send + 'static>(
            s: Stream<F, O>,
            f: SharedFn<Chunk<O>, Chunk<O2>>,
        ) -> Pull<F, O2, ()> {
            s.pull().uncons().flat_map(move |step| match step {
                None => Pull::done(),
                Some((head, tail)) => Pull::output(f(head)).then(go(tail, f)),
            })
        }
        go(self, Arc::new(f)).stream_no_scope()
    }

    /// Transform every element.
    pub fn map<O2, G>(self, f: G) -> Stream<F, O2>
    where
        O2: Send + 'static,
        G: Fn(O) -> O2 + Send + Sync + 'static,
    {
        self.map_chunks(move |chunk| chunk.map(&f))
    }

    /// Keep the elements matching `p`.
    pub fn filter<P>(self, p: P) -> Self
    where
        P: Fn(&O) -> bool + Send + Sync + 'static,
    {
        self.map_chunks(move |chunk| chunk.filter(&p))
    }

    /// Run the stream for its effects, emitting nothing.
    pub fn drain(self) -> Self {
        self.map_chunks(|_| Chunk::empty())
    }

    /// Replace every element with the stream built from it.
    pub fn flat_map<O2, G>(self, f: G) -> Stream<F, O2>
    where
        O2: Send + 'static,
        G: Fn(O) -> Stream<F, O2> + Send + Sync + 'static,
    {
        flat_map_free(self.free, Arc::new(f))
    }

    /// Evaluate an effect per element.
    pub fn eval_map<O2, G>(self, f: G) -> Stream<F, O2>
    where
        O2: Send + 'static,
        G: Fn(O) -> F::Of<O2> + Send + Sync + 'static,
    {
        self.flat_map(move |o| Stream::eval(f(o)))
    }

    /// At most the first `n` elements.
    pub fn take(self, n: usize) -> Self {
        self.pull().take(n).void().stream()
    }

    /// On failure, release this stream's resources and continue with the
    /// stream built from the error.
    pub fn handle_error_with<G>(self, h: G) -> Self
    where
        G: FnOnce(Error) -> Stream<F, O> + Send + 'static,
    {
        Self::from_free(algebra::scope(self.free).handle_error_with(move |e| h(e).free))
    }

    /// Run this stream in its own scope.
    pub fn scope(self) -> Self {
        Self::from_free(algebra::scope(self.free))
    }

    /// Run `finalizer` when this stream ends, however it ends.
    pub fn on_finalize(self, finalizer: F::Of<()>) -> Self {
        let body = self.free;
        let guarded = algebra::acquire::<F, (), _>(F::unit(), move |(), _| finalizer).flat_map(move |_| body);
        Self::from_free(algebra::scope(guarded))
    }

    /// Pull-level access to this stream.
    pub fn pull(self) -> ToPull<F, O> {
        ToPull::new(self)
    }

    /// Ways to run this stream to a single effect.
    pub fn compile(self) -> Compiler<F, O> {
        Compiler::new(self)
    }

    /// Translate every effect to `G`.
    ///
    /// Interruptible scopes become plain scopes, and the current scope is
    /// not reachable from inside the translated stream.
    pub fn translate<G, K>(self, fk: K) -> Stream<G, O>
    where
        G: Effect,
        K: FunctionK<F, G>,
    {
        let free = self.free;
        let fk = Arc::new(fk);
        Stream::from_free(FreeC::suspend(move || algebra::translate(free, true, fk, None)))
    }

    /// Translate every effect to a concurrent `G`, keeping interruptible
    /// scopes interruptible.
    pub fn translate_interruptible<G, K>(self, fk: K) -> Stream<G, O>
    where
        G: Concurrent,
        K: FunctionK<F, G>,
    {
        let free = self.free;
        let fk = Arc::new(fk);
        Stream::from_free(FreeC::suspend(move || {
            algebra::translate(free, true, fk, Some(Interruptible::<G>::new()))
        }))
    }
}

impl<F: Effect, O: Clone + Send + 'static> Stream<F, O> {
    /// Emit the acquired resource; `release` runs once the stream ends.
    pub fn bracket<Rel>(acquire: F::Of<O>, release: Rel) -> Self
    where
        Rel: FnOnce(O) -> F::Of<()> + Send + 'static,
    {
        Self::bracket_case(acquire, move |o, _| release(o))
    }

    /// Like [`Stream::bracket`], telling `release` how the stream ended.
    pub fn bracket_case<Rel>(acquire: F::Of<O>, release: Rel) -> Self
    where
        Rel: FnOnce(O, ExitCase) -> F::Of<()> + Send + 'static,
    {
        let acquired = algebra::acquire::<F, O, Rel>(acquire, release).flat_map(|v| {
            let (o, _id): (Value, Token) = unbox(v);
            algebra::output(boxed(Chunk::singleton(unbox::<O>(o))))
        });
        Self::from_free(algebra::scope(acquired))
    }
}

impl<F: Effect> Stream<F, Arc<CompileScope<F>>> {
    /// Emit the scope the stream is running in.
    pub fn get_scope() -> Self {
        Self::from_free(
            algebra::get_scope::<F>()
                .flat_map(|v| algebra::output(boxed(Chunk::singleton(unbox::<Arc<CompileScope<F>>>(v))))),
        )
    }
}

impl<F: Concurrent, O: Send + 'static> Stream<F, O> {
    /// Run this stream in its own interruptible scope.
    pub fn interrupt_scope(self) -> Self {
        Self::from_free(algebra::interrupt_scope(self.free, Interruptible::new()))
    }

    /// Stop the stream when `halt` completes.
    ///
    /// `Ok(())` ends the stream quietly; `Err(e)` fails it with `e`. Either
    /// way the stream's resources are released.
    pub fn interrupt_when(self, halt: F::Of<Result<(), Error>>) -> Self {
        let body = self.free;
        let watched = algebra::get_scope::<F>().flat_map(move |v| {
            let scope: Arc<CompileScope<F>> = unbox(v);
            let watcher = F::flat_map(halt, move |cause| scope.interrupt(cause));
            supervise::<F>(watcher).flat_map(move |_| body)
        });
        Self::from_free(algebra::interrupt_scope(watched, Interruptible::new()))
    }
}

impl<O: Send + 'static> Stream<IoEffect, O> {
    /// Stop the stream quietly after `limit`.
    pub fn interrupt_after(self, limit: Duration) -> Self {
        self.interrupt_when(timer::sleep(limit).map(|()| Ok(())))
    }
}

/// Fork `fiber` for the lifetime of the current scope.
fn supervise<F: Concurrent>(fiber: F::Of<()>) -> FreeC<F> {
    let started = F::map(F::fork(fiber), |cancel| Arc::new(Mutex::new(Some(cancel))));
    algebra::acquire::<F, _, _>(started, |slot: Arc<Mutex<Option<F::Of<()>>>>, _| {
        let cancel = slot.lock().take();
        cancel.unwrap_or_else(F::unit)
    })
    .map(|_| boxed(()))
}

fn flat_map_free<F, O, O2>(free: FreeC<F>, f: SharedFn<O, Stream<F, O2>>) -> Stream<F, O2>
where
    F: Effect,
    O: Send + 'static,
    O2: Send + 'static,
{
    Stream::from_free(algebra::uncons(free).flat_map(move |v| {
        let step: Option<(Value, FreeC<F>)> = unbox(v);
        match step {
            None => FreeC::unit(),
            Some((head, tail)) => {
                let chunk: Chunk<O> = unbox(head);
                if chunk.len() == 1 && tail.is_pure() {
                    // Last element: the inner stream is the whole result.
                    match chunk.into_iter().next() {
                        Some(o) => f(o).free,
                        None => FreeC::unit(),
                    }
                } else {
                    each_element(chunk.into_iter(), tail, f)
                }
            }
        }
    }))
}

fn each_element<F, O, O2>(mut items: std::vec::IntoIter<O>, tail: FreeC<F>, f: SharedFn<O, Stream<F, O2>>) -> FreeC<F>
where
    F: Effect,
    O: Send + 'static,
    O2: Send + 'static,
{
    match items.next() {
        None => flat_map_free(tail, f).free,
        Some(o) => {
            let inner = f(o).free;
            inner.transform_with(move |r| match r {
                Terminal::Pure(_) => each_element(items, tail, f),
                Terminal::Fail(e) => FreeC::fail(e),
                Terminal::Interrupted { context, error } => {
                    flat_map_free(algebra::interrupt_boundary(tail, (context, error)), f).free
                }
            })
        }
    }
}
