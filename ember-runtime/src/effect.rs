//! # Effect Abstraction
//!
//! Code that should run over any effect type (the stream compiler and its
//! scope tree) is written against these traits rather than [`IO`] directly.
//!
//! ## Design
//!
//! An effect type is a marker implementing [`Effect`], whose generic
//! associated type `Of<A>` names the effect value producing an `A`. The
//! one built-in instance is [`IoEffect`], with `Of<A> = IO<A>`.
//!
//! - [`Effect`]: sequencing, errors, brackets, uncancelable regions
//! - [`Concurrent`]: cancelable registration, racing, forking, lifting `IO`
//! - [`FunctionK`]: a natural transformation `F::Of<A> -> G::Of<A>`

use crate::callback::Callback;
use crate::error::{Error, ExitCase};
use crate::io::IO;
use crate::race::Either;

/// A type constructor of effect values.
pub trait Effect: Sized + Send + Sync + 'static {
    /// The effect value producing an `A`.
    type Of<A: Send + 'static>: Send + 'static;

    /// Lift a value.
    fn pure<A: Send + 'static>(a: A) -> Self::Of<A>;

    /// The unit effect.
    fn unit() -> Self::Of<()> {
        Self::pure(())
    }

    /// A failed effect.
    fn raise_error<A: Send + 'static>(e: Error) -> Self::Of<A>;

    /// Suspend a side effect.
    fn delay<A, F>(f: F) -> Self::Of<A>
    where
        A: Send + 'static,
        F: FnOnce() -> A + Send + 'static;

    /// Defer building an effect until it is evaluated.
    fn suspend<A, F>(f: F) -> Self::Of<A>
    where
        A: Send + 'static,
        F: FnOnce() -> Self::Of<A> + Send + 'static;

    /// Sequence a dependent effect.
    fn flat_map<A, B, F>(fa: Self::Of<A>, f: F) -> Self::Of<B>
    where
        A: Send + 'static,
        B: Send + 'static,
        F: FnOnce(A) -> Self::Of<B> + Send + 'static;

    /// Transform the result.
    fn map<A, B, F>(fa: Self::Of<A>, f: F) -> Self::Of<B>
    where
        A: Send + 'static,
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        Self::flat_map(fa, move |a| Self::pure(f(a)))
    }

    /// Expose failures as values.
    fn attempt<A: Send + 'static>(fa: Self::Of<A>) -> Self::Of<Result<A, Error>>;

    /// Recover from a failure.
    fn handle_error_with<A, F>(fa: Self::Of<A>, f: F) -> Self::Of<A>
    where
        A: Send + 'static,
        F: FnOnce(Error) -> Self::Of<A> + Send + 'static;

    /// Turn an exposed failure back into a raised one.
    fn rethrow<A: Send + 'static>(fa: Self::Of<Result<A, Error>>) -> Self::Of<A> {
        Self::flat_map(fa, |r| match r {
            Ok(a) => Self::pure(a),
            Err(e) => Self::raise_error(e),
        })
    }

    /// Acquire, use, release with the exit case.
    fn bracket_case<A, B, U, R>(acquire: Self::Of<A>, use_: U, release: R) -> Self::Of<B>
    where
        A: Clone + Send + 'static,
        B: Send + 'static,
        U: FnOnce(A) -> Self::Of<B> + Send + 'static,
        R: FnOnce(A, ExitCase) -> Self::Of<()> + Send + 'static;

    /// Evaluate without observing cancellation.
    fn uncancelable<A: Send + 'static>(fa: Self::Of<A>) -> Self::Of<A>;
}

/// Effects that support cancellation and concurrency.
pub trait Concurrent: Effect {
    /// An asynchronous effect with a cancellation token.
    fn cancelable<A, F>(k: F) -> Self::Of<A>
    where
        A: Send + 'static,
        F: FnOnce(Callback<A>) -> Self::Of<()> + Send + 'static;

    /// Race two effects and cancel the loser.
    fn race<A, B>(fa: Self::Of<A>, fb: Self::Of<B>) -> Self::Of<Either<A, B>>
    where
        A: Send + 'static,
        B: Send + 'static;

    /// Start `fa` concurrently. The result is the effect that cancels it.
    fn fork(fa: Self::Of<()>) -> Self::Of<Self::Of<()>>;

    /// Embed an [`IO`].
    fn lift_io<A: Send + 'static>(io: IO<A>) -> Self::Of<A>;
}

/// A natural transformation between effect types.
pub trait FunctionK<F: Effect, G: Effect>: Send + Sync + 'static {
    /// Translate one effect value.
    fn apply<A: Send + 'static>(&self, fa: F::Of<A>) -> G::Of<A>;
}

/// The identity transformation.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityK;

impl<F: Effect> FunctionK<F, F> for IdentityK {
    fn apply<A: Send + 'static>(&self, fa: F::Of<A>) -> F::Of<A> {
        fa
    }
}

/// The [`IO`] effect.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoEffect;

impl Effect for IoEffect {
    type Of<A: Send + 'static> = IO<A>;

    fn pure<A: Send + 'static>(a: A) -> IO<A> {
        IO::pure(a)
    }

    fn raise_error<A: Send + 'static>(e: Error) -> IO<A> {
        IO::raise_error(e)
    }

    fn delay<A, F>(f: F) -> IO<A>
    where
        A: Send + 'static,
        F: FnOnce() -> A + Send + 'static,
    {
        IO::delay(f)
    }

    fn suspend<A, F>(f: F) -> IO<A>
    where
        A: Send + 'static,
        F: FnOnce() -> IO<A> + Send + 'static,
    {
        IO::suspend(f)
    }

    fn flat_map<A, B, F>(fa: IO<A>, f: F) -> IO<B>
    where
        A: Send + 'static,
        B: Send + 'static,
        F: FnOnce(A) -> IO<B> + Send + 'static,
    {
        fa.flat_map(f)
    }

    fn map<A, B, F>(fa: IO<A>, f: F) -> IO<B>
    where
        A: Send + 'static,
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        fa.map(f)
    }

    fn attempt<A: Send + 'static>(fa: IO<A>) -> IO<Result<A, Error>> {
        fa.attempt()
    }

    fn handle_error_with<A, F>(fa: IO<A>, f: F) -> IO<A>
    where
        A: Send + 'static,
        F: FnOnce(Error) -> IO<A> + Send + 'static,
    {
        fa.handle_error_with(f)
    }

    fn bracket_case<A, B, U, R>(acquire: IO<A>, use_: U, release: R) -> IO<B>
    where
        A: Clone + Send + 'static,
        B: Send + 'static,
        U: FnOnce(A) -> IO<B> + Send + 'static,
        R: FnOnce(A, ExitCase) -> IO<()> + Send + 'static,
    {
        acquire.bracket_case(use_, release)
    }

    fn uncancelable<A: Send + 'static>(fa: IO<A>) -> IO<A> {
        fa.uncancelable()
    }
}

impl Concurrent for IoEffect {
    fn cancelable<A, F>(k: F) -> IO<A>
    where
        A: Send + 'static,
        F: FnOnce(Callback<A>) -> IO<()> + Send + 'static,
    {
        IO::cancelable(k)
    }

    fn race<A, B>(fa: IO<A>, fb: IO<B>) -> IO<Either<A, B>>
    where
        A: Send + 'static,
        B: Send + 'static,
    {
        fa.race(fb)
    }

    fn fork(fa: IO<()>) -> IO<IO<()>> {
        fa.start().map(|fiber| fiber.cancel())
    }

    fn lift_io<A: Send + 'static>(io: IO<A>) -> IO<A> {
        io
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sum_twice<F: Effect>(n: i64) -> F::Of<i64> {
        F::flat_map(F::delay(move || n), |a| F::map(F::pure(a), move |b| a + b))
    }

    #[test]
    fn test_generic_program_over_io() {
        assert_eq!(sum_twice::<IoEffect>(21).unsafe_run_sync().unwrap(), 42);
    }

    #[test]
    fn test_rethrow_default() {
        let failed = IoEffect::rethrow::<i32>(IO::pure(Err(Error::msg("inner"))));
        assert_eq!(failed.unsafe_run_sync().unwrap_err().to_string(), "inner");
    }

    #[test]
    fn test_identity_k() {
        let io = <IdentityK as FunctionK<IoEffect, IoEffect>>::apply(&IdentityK, IO::pure(5));
        assert_eq!(io.unsafe_run_sync().unwrap(), 5);
    }

    #[test]
    fn test_fork_returns_cancel_token() {
        let gate = crate::sync::Deferred::<()>::new();
        let cancel = IoEffect::fork(gate.get()).unsafe_run_sync().unwrap();
        cancel.unsafe_run_sync().unwrap();
    }
}
