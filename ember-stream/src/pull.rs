//! Pulls
//!
//! A [`Pull<F, O, R>`] is a program that may evaluate `F` effects, output
//! chunks of `O`, and finally yields an `R`. Pulls are the low-level way to
//! write stream transformations: uncons a stream, decide what to output,
//! and recurse on the tail. [`Pull::stream`] turns a unit-result pull back
//! into a [`Stream`].

use std::fmt;
use std::marker::PhantomData;

use ember_runtime::{Effect, Error, ExitCase};

use crate::algebra::{self, boxed, unbox, FreeC, Value};
use crate::chunk::Chunk;
use crate::stream::Stream;
use crate::token::Token;

/// A stream program that outputs `O` and yields `R`.
#[must_use = "a pull does nothing until it is turned into a stream and compiled"]
pub struct Pull<F: Effect, O, R> {
    free: FreeC<F>,
    _marker: PhantomData<fn() -> (O, R)>,
}

impl<F: Effect, O, R> fmt::Debug for Pull<F, O, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pull(..)")
    }
}

impl<F: Effect, O: Send + 'static, R: Send + 'static> Pull<F, O, R> {
    pub(crate) fn from_free(free: FreeC<F>) -> Self {
        Pull { free, _marker: PhantomData }
    }

    /// Yield `r` without output.
    pub fn pure(r: R) -> Self {
        Self::from_free(FreeC::pure(boxed(r)))
    }

    /// Fail with `e`.
    pub fn raise_error(e: Error) -> Self {
        Self::from_free(FreeC::fail(e))
    }

    /// Evaluate an effect and yield its result.
    pub fn eval(fr: F::Of<R>) -> Self {
        Self::from_free(algebra::eval::<F>(F::map(fr, boxed)))
    }

    /// Build the pull when it is run.
    pub fn suspend<G>(f: G) -> Self
    where
        G: FnOnce() -> Pull<F, O, R> + Send + 'static,
    {
        Self::from_free(FreeC::suspend(move || f().free))
    }

    /// Continue with a pull built from the result.
    pub fn flat_map<R2, G>(self, f: G) -> Pull<F, O, R2>
    where
        R2: Send + 'static,
        G: FnOnce(R) -> Pull<F, O, R2> + Send + 'static,
    {
        Pull::from_free(self.free.flat_map(move |v| f(unbox::<R>(v)).free))
    }

    /// Run `next` after this pull, discarding the result.
    pub fn then<R2: Send + 'static>(self, next: Pull<F, O, R2>) -> Pull<F, O, R2> {
        Pull::from_free(self.free.flat_map(move |_| next.free))
    }

    /// Transform the result.
    pub fn map<R2, G>(self, f: G) -> Pull<F, O, R2>
    where
        R2: Send + 'static,
        G: FnOnce(R) -> R2 + Send + 'static,
    {
        Pull::from_free(self.free.map(move |v| boxed(f(unbox::<R>(v)))))
    }

    /// Replace the result.
    pub fn as_<R2: Send + 'static>(self, r2: R2) -> Pull<F, O, R2> {
        self.map(move |_| r2)
    }

    /// Discard the result.
    pub fn void(self) -> Pull<F, O, ()> {
        self.as_(())
    }

    /// Recover from a failure with another pull.
    pub fn handle_error_with<G>(self, h: G) -> Self
    where
        G: FnOnce(Error) -> Pull<F, O, R> + Send + 'static,
    {
        Self::from_free(self.free.handle_error_with(move |e| h(e).free))
    }
}

impl<F: Effect, O: Send + 'static, R: Clone + Send + 'static> Pull<F, O, R> {
    /// Acquire a resource in the current scope. `release` runs when that
    /// scope closes.
    pub fn acquire<Rel>(acquire: F::Of<R>, release: Rel) -> Self
    where
        Rel: FnOnce(R, ExitCase) -> F::Of<()> + Send + 'static,
    {
        Self::from_free(algebra::acquire::<F, R, Rel>(acquire, release).map(|v| {
            let (r, _id): (Value, Token) = unbox(v);
            r
        }))
    }
}

impl<F: Effect, O: Send + 'static> Pull<F, O, ()> {
    /// The pull that does nothing.
    pub fn done() -> Self {
        Self::pure(())
    }

    /// Output one value.
    pub fn output1(o: O) -> Self {
        Self::output(Chunk::singleton(o))
    }

    /// Output a chunk. An empty chunk outputs nothing.
    pub fn output(chunk: Chunk<O>) -> Self {
        if chunk.is_empty() {
            Self::done()
        } else {
            Self::from_free(algebra::output::<F>(boxed(chunk)))
        }
    }

    /// The stream of this pull's output, in its own scope.
    pub fn stream(self) -> Stream<F, O> {
        Stream::from_free(algebra::scope(self.free))
    }

    /// The stream of this pull's output, in the caller's scope.
    pub fn stream_no_scope(self) -> Stream<F, O> {
        Stream::from_free(self.free)
    }
}

/// Pull-level operations on a stream, from [`Stream::pull`].
pub struct ToPull<F: Effect, O> {
    stream: Stream<F, O>,
}

impl<F: Effect, O: Send + 'static> ToPull<F, O> {
    pub(crate) fn new(stream: Stream<F, O>) -> Self {
        ToPull { stream }
    }

    /// Await the next chunk: `None` when the stream is done, otherwise the
    /// chunk and the rest of the stream.
    pub fn uncons<X: Send + 'static>(self) -> Pull<F, X, Option<(Chunk<O>, Stream<F, O>)>> {
        Pull::from_free(algebra::uncons(self.stream.into_free()).map(|v| {
            let step: Option<(Value, FreeC<F>)> = unbox(v);
            boxed(step.map(|(head, tail)| (unbox::<Chunk<O>>(head), Stream::<F, O>::from_free(tail))))
        }))
    }

    /// Await the next element.
    pub fn uncons1<X: Send + 'static>(self) -> Pull<F, X, Option<(O, Stream<F, O>)>> {
        self.uncons().flat_map(|step| match step {
            None => Pull::pure(None),
            Some((head, tail)) => {
                let mut items = head.into_iter();
                match items.next() {
                    None => tail.pull().uncons1(),
                    Some(first) => Pull::pure(Some((first, tail.cons(items.collect())))),
                }
            }
        })
    }

    /// Output at most `n` elements, yielding the rest of the stream unless
    /// it ended first.
    pub fn take(self, n: usize) -> Pull<F, O, Option<Stream<F, O>>> {
        if n == 0 {
            return Pull::pure(Some(self.stream));
        }
        self.uncons().flat_map(move |step| match step {
            None => Pull::pure(None),
            Some((head, tail)) => {
                let m = head.len();
                if m <= n {
                    Pull::output(head).then(tail.pull().take(n - m))
                } else {
                    let (taken, rest) = head.split_at(n);
                    Pull::output(taken).then(Pull::pure(Some(tail.cons(rest))))
                }
            }
        })
    }

    /// Output every element of the stream.
    pub fn echo(self) -> Pull<F, O, ()> {
        Pull::from_free(self.stream.into_free())
    }
}

// ============================================================================
// Tests
// ============================================================================
