//! The Compile Scope Tree
//!
//! Every compilation of a stream builds a tree of [`CompileScope`]s. The
//! root lives as long as the compilation; `scope`, `bracket` and
//! `handle_error_with` open children. Resources are registered with the
//! scope that was current when they were acquired and are released when that
//! scope closes.
//!
//! ## Ownership
//!
//! The open scopes of one tree live in a shared arena keyed by [`Token`].
//! Nodes refer to their parent and children by token only, and a
//! [`CompileScope`] is a handle onto the arena: its id, the ids of its
//! ancestors (root first) and its interrupt context. Closing a scope removes
//! its node, so the arena holds exactly the open scopes. Dropping every
//! handle of a tree frees it whether or not it was closed.
//!
//! ## Closing
//!
//! Closing is depth-first: children close newest first, then resources
//! release newest first. Every failure along the way is collected into one
//! composite error and the rest of the tree is still closed.

use std::fmt;
use std::iter;
use std::sync::Arc;

use ember_runtime::{CompositeFailure, Effect, Either, Error, ExitCase};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::algebra::{boxed, unbox, Finalizer, Value};
use crate::interrupt::{Interrupt, InterruptContext, Interruptible};
use crate::resource::{collect_errors, Lease, Resource};
use crate::token::Token;

/// Ids from the root down to the parent.
type Ancestry = Arc<[Token]>;

struct Node<F: Effect> {
    ancestors: Ancestry,
    interrupt: Option<InterruptContext<F>>,
    resources: Vec<Arc<Resource<F>>>,
    children: Vec<Token>,
}

impl<F: Effect> Node<F> {
    fn new(ancestors: Ancestry, interrupt: Option<InterruptContext<F>>) -> Self {
        Node { ancestors, interrupt, resources: Vec::new(), children: Vec::new() }
    }
}

type Nodes<F> = FxHashMap<Token, Node<F>>;

/// The open scopes of one tree.
struct Arena<F: Effect> {
    nodes: Mutex<Nodes<F>>,
}

/// A node of the resource tree of one stream compilation.
pub struct CompileScope<F: Effect> {
    id: Token,
    ancestors: Ancestry,
    interrupt: Option<InterruptContext<F>>,
    arena: Arc<Arena<F>>,
}

impl<F: Effect> fmt::Debug for CompileScope<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nodes = self.arena.nodes.lock();
        let node = nodes.get(&self.id);
        f.debug_struct("CompileScope")
            .field("id", &self.id)
            .field("parent", &self.ancestors.last())
            .field("open", &node.is_some())
            .field("resources", &node.map_or(0, |n| n.resources.len()))
            .field("children", &node.map_or(0, |n| n.children.len()))
            .field("interruptible", &self.interrupt.is_some())
            .finish()
    }
}

impl<F: Effect> CompileScope<F> {
    /// A new root scope.
    pub fn new_root(interruptible: Option<Interruptible<F>>) -> Arc<Self> {
        let id = Token::new();
        let interrupt = interruptible.map(|i| InterruptContext::root(i, id));
        let ancestors: Ancestry = Arc::from([]);
        let mut nodes = Nodes::<F>::default();
        nodes.insert(id, Node::new(ancestors.clone(), interrupt.clone()));
        tracing::trace!(scope = %id, "opened root scope");
        Arc::new(CompileScope { id, ancestors, interrupt, arena: Arc::new(Arena { nodes: Mutex::new(nodes) }) })
    }

    /// Handle onto the open scope `id` of the same tree.
    fn handle(&self, nodes: &Nodes<F>, id: Token) -> Option<Arc<Self>> {
        nodes.get(&id).map(|node| {
            Arc::new(CompileScope {
                id,
                ancestors: node.ancestors.clone(),
                interrupt: node.interrupt.clone(),
                arena: Arc::clone(&self.arena),
            })
        })
    }

    /// Handle onto the ancestor at `depth` (0 is the root), open or not.
    fn ancestor_at(&self, nodes: &Nodes<F>, depth: usize) -> Arc<Self> {
        let id = self.ancestors[depth];
        self.handle(nodes, id).unwrap_or_else(|| {
            Arc::new(CompileScope {
                id,
                ancestors: Arc::from(&self.ancestors[..depth]),
                interrupt: None,
                arena: Arc::clone(&self.arena),
            })
        })
    }

    /// Identity of this scope.
    pub fn id(&self) -> Token {
        self.id
    }

    /// The enclosing scope, `None` for the root.
    pub fn parent(&self) -> Option<Arc<Self>> {
        let depth = self.ancestors.len().checked_sub(1)?;
        Some(self.ancestor_at(&self.arena.nodes.lock(), depth))
    }

    /// True until the scope is closed.
    pub fn is_open(&self) -> bool {
        self.arena.nodes.lock().contains_key(&self.id)
    }

    /// True if the scope can be interrupted.
    pub fn is_interruptible(&self) -> bool {
        self.interrupt.is_some()
    }

    /// Ids of the open children, oldest first.
    pub fn child_ids(&self) -> Vec<Token> {
        self.arena.nodes.lock().get(&self.id).map_or_else(Vec::new, |n| n.children.clone())
    }

    /// Number of resources currently registered.
    pub fn resource_count(&self) -> usize {
        self.arena.nodes.lock().get(&self.id).map_or(0, |n| n.resources.len())
    }

    /// Open a child scope.
    ///
    /// If this scope is already closed the child is opened under the nearest
    /// open ancestor instead; if even the root is closed the result is an
    /// `IllegalState` error.
    pub fn open(self: &Arc<Self>, interruptible: Option<Interruptible<F>>) -> F::Of<Result<Arc<Self>, Error>> {
        let this = Arc::clone(self);
        F::suspend(move || {
            let id = Token::new();
            let interrupt = match &this.interrupt {
                None => interruptible.map(|i| InterruptContext::root(i, id)),
                Some(parent) => Some(parent.child(interruptible, id)),
            };
            let ancestors: Ancestry = this.ancestors.iter().copied().chain(iter::once(this.id)).collect();

            let registered = {
                let mut nodes = this.arena.nodes.lock();
                match nodes.get_mut(&this.id) {
                    Some(parent) => {
                        parent.children.push(id);
                        nodes.insert(id, Node::new(ancestors.clone(), interrupt.clone()));
                        true
                    }
                    None => false,
                }
            };

            if registered {
                tracing::trace!(scope = %id, parent = %this.id, "opened scope");
                let arena = Arc::clone(&this.arena);
                return F::pure(Ok(Arc::new(CompileScope { id, ancestors, interrupt, arena })));
            }

            if let Some(ctx) = &interrupt {
                ctx.cancel_parent();
            }
            if this.ancestors.is_empty() {
                F::pure(Err(Error::illegal_state("cannot re-open root scope")))
            } else {
                this.nearest_open_ancestor().open(interruptible)
            }
        })
    }

    /// Run `acquire` and register its result with this scope.
    ///
    /// If the scope closed before the resource could be registered, `release`
    /// runs immediately and the result is
    /// [`Error::AcquireAfterScopeClosed`]. A failed acquisition registers
    /// nothing.
    pub fn acquire_resource<R, Rel>(
        self: &Arc<Self>,
        acquire: F::Of<R>,
        release: Rel,
    ) -> F::Of<Result<(R, Token), Error>>
    where
        R: Clone + Send + 'static,
        Rel: FnOnce(R, ExitCase) -> F::Of<()> + Send + 'static,
    {
        let fa = F::map(acquire, move |r: R| {
            let kept = r.clone();
            let finalizer: Finalizer<F> = Box::new(move |exit| release(kept, exit));
            (boxed(r), finalizer)
        });
        F::map(self.acquire_erased(fa), |r| r.map(|(v, id)| (unbox::<R>(v), id)))
    }

    pub(crate) fn acquire_erased(
        self: &Arc<Self>,
        acquire: F::Of<(Value, Finalizer<F>)>,
    ) -> F::Of<Result<(Value, Token), Error>> {
        let this = Arc::clone(self);
        F::flat_map(F::attempt(F::uncancelable(acquire)), move |acquired| match acquired {
            Err(e) => F::pure(Err(e)),
            Ok((value, finalizer)) => {
                let resource = Resource::<F>::new();
                let id = resource.id();
                F::flat_map(resource.acquired(finalizer), move |stored| match stored {
                    Err(e) => F::pure(Err(e)),
                    Ok(_) => {
                        if this.register(&resource) {
                            tracing::trace!(scope = %this.id, resource = %id, "acquired resource");
                            F::pure(Ok((value, id)))
                        } else {
                            tracing::debug!(scope = %this.id, resource = %id, "scope closed during acquisition");
                            F::map(resource.release(ExitCase::Completed), |released| {
                                Err(match released {
                                    Ok(()) => Error::AcquireAfterScopeClosed,
                                    Err(e) => Error::AcquireAfterScopeClosed.compose(e),
                                })
                            })
                        }
                    }
                })
            }
        })
    }

    fn register(&self, resource: &Arc<Resource<F>>) -> bool {
        match self.arena.nodes.lock().get_mut(&self.id) {
            Some(node) => {
                node.resources.push(Arc::clone(resource));
                true
            }
            None => false,
        }
    }

    /// Release one resource of this scope ahead of the scope's close.
    pub fn release_resource(&self, id: Token, exit: ExitCase) -> F::Of<Result<(), Error>> {
        let found = self.arena.nodes.lock().get_mut(&self.id).and_then(|node| {
            let index = node.resources.iter().position(|r| r.id() == id)?;
            Some(node.resources.remove(index))
        });
        match found {
            Some(resource) => resource.release(exit),
            None => F::pure(Ok(())),
        }
    }

    /// Close the scope and everything under it.
    ///
    /// Idempotent: a closed scope has nothing left to close.
    pub fn close(self: &Arc<Self>, exit: ExitCase) -> F::Of<Result<(), Error>> {
        let this = Arc::clone(self);
        F::suspend(move || {
            let (children, resources) = {
                let mut nodes = this.arena.nodes.lock();
                match nodes.remove(&this.id) {
                    None => (Vec::new(), Vec::new()),
                    Some(node) => {
                        let children: Vec<_> =
                            node.children.iter().rev().filter_map(|&id| this.handle(&nodes, id)).collect();
                        (children, node.resources)
                    }
                }
            };
            tracing::trace!(
                scope = %this.id,
                children = children.len(),
                resources = resources.len(),
                "closing scope"
            );

            let mut steps = Vec::with_capacity(children.len() + resources.len());
            steps.extend(children.iter().map(|child| child.close(exit.clone())));
            steps.extend(resources.iter().rev().map(|resource| resource.release(exit.clone())));

            F::map(collect_errors::<F>(steps), move |errors| {
                if let Some(ctx) = &this.interrupt {
                    ctx.cancel_parent();
                }
                if let Some(parent) = this.ancestors.last() {
                    if let Some(node) = this.arena.nodes.lock().get_mut(parent) {
                        node.children.retain(|&c| c != this.id);
                    }
                }
                match CompositeFailure::from_list(errors) {
                    None => Ok(()),
                    Some(e) => {
                        tracing::debug!(scope = %this.id, error = %e, "scope closed with failures");
                        Err(e)
                    }
                }
            })
        })
    }

    /// The nearest open ancestor, or the root if every ancestor is closed.
    /// A root returns itself.
    pub fn open_ancestor(self: &Arc<Self>) -> F::Of<Arc<Self>> {
        let this = Arc::clone(self);
        F::delay(move || this.nearest_open_ancestor())
    }

    pub(crate) fn nearest_open_ancestor(self: &Arc<Self>) -> Arc<Self> {
        if self.ancestors.is_empty() {
            return Arc::clone(self);
        }
        let nodes = self.arena.nodes.lock();
        self.ancestors
            .iter()
            .rev()
            .find_map(|&id| self.handle(&nodes, id))
            .unwrap_or_else(|| self.ancestor_at(&nodes, 0))
    }

    /// This scope or the ancestor with the given id.
    pub fn find_self_or_ancestor(self: &Arc<Self>, id: Token) -> Option<Arc<Self>> {
        if id == self.id {
            return Some(Arc::clone(self));
        }
        let depth = self.ancestors.iter().position(|&a| a == id)?;
        Some(self.ancestor_at(&self.arena.nodes.lock(), depth))
    }

    /// This scope or the open descendant with the given id.
    pub fn find_self_or_child(self: &Arc<Self>, id: Token) -> Option<Arc<Self>> {
        if id == self.id {
            return Some(Arc::clone(self));
        }
        let nodes = self.arena.nodes.lock();
        let node = nodes.get(&id)?;
        if node.ancestors.contains(&self.id) {
            self.handle(&nodes, id)
        } else {
            None
        }
    }

    /// Locate the scope a `Step` should run in: this scope or any open
    /// scope of the same tree.
    pub fn find_step_scope(self: &Arc<Self>, id: Token) -> Option<Arc<Self>> {
        if id == self.id {
            return Some(Arc::clone(self));
        }
        self.handle(&self.arena.nodes.lock(), id)
    }

    /// Pin every open resource of this scope and its ancestors.
    ///
    /// `None` if the scope is closed.
    pub fn lease(self: &Arc<Self>) -> F::Of<Option<Lease<F>>> {
        let this = Arc::clone(self);
        F::delay(move || {
            let nodes = this.arena.nodes.lock();
            if !nodes.contains_key(&this.id) {
                return None;
            }
            let leased: Vec<_> = iter::once(&this.id)
                .chain(this.ancestors.iter().rev())
                .filter_map(|id| nodes.get(id))
                .flat_map(|node| node.resources.iter())
                .filter(|r| r.try_lease())
                .cloned()
                .collect();
            Some(Lease::new(leased))
        })
    }

    /// Interrupt the scope: `Ok(())` stops it quietly, `Err(e)` stops it
    /// with `e`.
    ///
    /// Fails with `IllegalState` if the scope is not interruptible. A second
    /// interruption is ignored.
    pub fn interrupt(&self, cause: Result<(), Error>) -> F::Of<()> {
        match &self.interrupt {
            None => F::raise_error(Error::illegal_state("scope cannot be interrupted")),
            Some(ctx) => {
                let ctx = ctx.clone();
                let id = self.id;
                F::delay(move || {
                    if ctx.interrupt(cause) {
                        tracing::debug!(scope = %id, "scope interrupted");
                    }
                })
            }
        }
    }

    /// The pending interruption, if any.
    pub fn is_interrupted(&self) -> Option<Interrupt> {
        self.interrupt.as_ref().and_then(|ctx| ctx.current())
    }

    /// Evaluate `fa`, stopping early if the scope is interrupted.
    ///
    /// Failures of `fa` come back as [`Interrupt::Failed`].
    pub fn interruptible_eval<A: Send + 'static>(&self, fa: F::Of<A>) -> F::Of<Result<A, Interrupt>> {
        F::map(self.interruptible_eval_erased(F::map(fa, boxed)), |r| r.map(unbox::<A>))
    }

    pub(crate) fn interruptible_eval_erased(&self, fa: F::Of<Value>) -> F::Of<Result<Value, Interrupt>> {
        match &self.interrupt {
            None => F::map(F::attempt(fa), |r| r.map_err(Interrupt::Failed)),
            Some(ctx) => {
                let interrupted = (ctx.interruptible.await_interrupt)(ctx.cell.clone());
                F::map((ctx.interruptible.race)(interrupted, F::attempt(fa)), |winner| match winner {
                    Either::Left(interrupt) => Err(interrupt),
                    Either::Right(result) => result.map_err(Interrupt::Failed),
                })
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use ember_runtime::{timer, IoEffect, IO};
    use parking_lot::Mutex as Log;

    type Scope = CompileScope<IoEffect>;

    fn open(scope: &Arc<Scope>) -> Arc<Scope> {
        scope.open(None).unsafe_run_sync().unwrap().unwrap()
    }

    fn new_log() -> Arc<Log<Vec<String>>> {
        Arc::new(Log::new(Vec::new()))
    }

    fn track(scope: &Arc<Scope>, log: &Arc<Log<Vec<String>>>, name: &'static str) {
        let log = log.clone();
        scope
            .acquire_resource(IO::pure(name), move |n, _| IO::delay(move || log.lock().push(n.to_string())))
            .unsafe_run_sync()
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_open_registers_child() {
        let root = Scope::new_root(None);
        let child = open(&root);
        assert_eq!(root.child_ids(), vec![child.id()]);
        assert_eq!(child.parent().map(|p| p.id()), Some(root.id()));
    }

    #[test]
    fn test_close_order_children_then_resources_reversed() {
        let log = new_log();
        let root = Scope::new_root(None);
        track(&root, &log, "root-1");
        track(&root, &log, "root-2");
        let a = open(&root);
        track(&a, &log, "a-1");
        let b = open(&root);
        track(&b, &log, "b-1");
        track(&b, &log, "b-2");

        root.close(ExitCase::Completed).unsafe_run_sync().unwrap().unwrap();
        assert_eq!(*log.lock(), vec!["b-2", "b-1", "a-1", "root-2", "root-1"]);
        assert!(!a.is_open());
        assert!(root.child_ids().is_empty());
    }

    #[test]
    fn test_close_removes_from_parent() {
        let root = Scope::new_root(None);
        let child = open(&root);
        child.close(ExitCase::Completed).unsafe_run_sync().unwrap().unwrap();
        assert!(root.child_ids().is_empty());
        assert!(root.is_open());
    }

    #[test]
    fn test_close_is_idempotent() {
        let log = new_log();
        let root = Scope::new_root(None);
        track(&root, &log, "r");
        root.close(ExitCase::Completed).unsafe_run_sync().unwrap().unwrap();
        root.close(ExitCase::Completed).unsafe_run_sync().unwrap().unwrap();
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn test_close_composes_failures_and_continues() {
        let log = new_log();
        let root = Scope::new_root(None);
        track(&root, &log, "survivor");
        for msg in ["first", "second"] {
            root.acquire_resource(IO::pure(()), move |(), _| IO::raise_error(Error::msg(msg)))
                .unsafe_run_sync()
                .unwrap()
                .unwrap();
        }
        let err = root.close(ExitCase::Completed).unsafe_run_sync().unwrap().unwrap_err();
        assert_eq!(err.cause_count(), 2);
        assert_eq!(*log.lock(), vec!["survivor"]);
    }

    #[test]
    fn test_open_on_closed_scope_promotes_to_ancestor() {
        let root = Scope::new_root(None);
        let child = open(&root);
        child.close(ExitCase::Completed).unsafe_run_sync().unwrap().unwrap();
        let reopened = open(&child);
        assert_eq!(reopened.parent().map(|p| p.id()), Some(root.id()));
    }

    #[test]
    fn test_reopen_closed_root_fails() {
        let root = Scope::new_root(None);
        root.close(ExitCase::Completed).unsafe_run_sync().unwrap().unwrap();
        let err = root.open(None).unsafe_run_sync().unwrap().unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
    }

    #[test]
    fn test_acquire_after_close_runs_release_immediately() {
        let log = new_log();
        let root = Scope::new_root(None);
        root.close(ExitCase::Completed).unsafe_run_sync().unwrap().unwrap();
        let l = log.clone();
        let result = root
            .acquire_resource(IO::pure(1), move |_, _| IO::delay(move || l.lock().push("released".into())))
            .unsafe_run_sync()
            .unwrap();
        assert!(matches!(result, Err(Error::AcquireAfterScopeClosed)));
        assert_eq!(*log.lock(), vec!["released"]);
    }

    #[test]
    fn test_failed_acquire_registers_nothing() {
        let root = Scope::new_root(None);
        let result = root
            .acquire_resource(IO::<u8>::raise_error(Error::msg("no")), |_, _| IO::unit())
            .unsafe_run_sync()
            .unwrap();
        assert!(result.is_err());
        assert_eq!(root.resource_count(), 0);
    }

    #[test]
    fn test_release_resource_early() {
        let log = new_log();
        let root = Scope::new_root(None);
        let l = log.clone();
        let (_, id) = root
            .acquire_resource(IO::pure(()), move |(), _| IO::delay(move || l.lock().push("early".into())))
            .unsafe_run_sync()
            .unwrap()
            .unwrap();
        root.release_resource(id, ExitCase::Completed).unsafe_run_sync().unwrap().unwrap();
        assert_eq!(root.resource_count(), 0);
        root.close(ExitCase::Completed).unsafe_run_sync().unwrap().unwrap();
        assert_eq!(*log.lock(), vec!["early"]);
    }

    #[test]
    fn test_lease_outlives_close() {
        let log = new_log();
        let root = Scope::new_root(None);
        track(&root, &log, "parent-res");
        let child = open(&root);
        track(&child, &log, "child-res");

        let lease = child.lease().unsafe_run_sync().unwrap().unwrap();
        assert_eq!(lease.len(), 2);
        root.close(ExitCase::Completed).unsafe_run_sync().unwrap().unwrap();
        assert!(log.lock().is_empty());

        lease.cancel().unsafe_run_sync().unwrap().unwrap();
        assert_eq!(log.lock().len(), 2);
        assert!(child.lease().unsafe_run_sync().unwrap().is_none());
    }

    #[test]
    fn test_find_helpers() {
        let root = Scope::new_root(None);
        let a = open(&root);
        let b = open(&a);
        let c = open(&root);

        assert_eq!(b.find_self_or_ancestor(root.id()).map(|s| s.id()), Some(root.id()));
        assert!(b.find_self_or_ancestor(c.id()).is_none());
        assert_eq!(root.find_self_or_child(b.id()).map(|s| s.id()), Some(b.id()));
        assert_eq!(b.find_step_scope(c.id()).map(|s| s.id()), Some(c.id()));
        assert_eq!(c.find_step_scope(b.id()).map(|s| s.id()), Some(b.id()));
    }

    #[test]
    fn test_open_ancestor_skips_closed() {
        let root = Scope::new_root(None);
        let a = open(&root);
        let b = open(&a);
        a.close(ExitCase::Completed).unsafe_run_sync().unwrap().unwrap();
        let ancestor = b.open_ancestor().unsafe_run_sync().unwrap();
        assert_eq!(ancestor.id(), root.id());
        assert_eq!(root.open_ancestor().unsafe_run_sync().unwrap().id(), root.id());
    }

    #[test]
    fn test_interrupt_requires_interruptible_scope() {
        let root = Scope::new_root(None);
        let err = root.interrupt(Ok(())).unsafe_run_sync().unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
    }

    #[test]
    fn test_interruptible_eval_stops_pending_effect() {
        let root = Scope::new_root(Some(Interruptible::new()));
        let child = root.open(Some(Interruptible::new())).unsafe_run_sync().unwrap().unwrap();

        let stopper = root.interrupt(Ok(()));
        let program = timer::sleep(Duration::from_millis(20))
            .then(stopper)
            .start()
            .flat_map(move |_| child.interruptible_eval(IO::<u8>::never()));

        match program.unsafe_run_sync().unwrap() {
            Err(Interrupt::Scope(token)) => assert_eq!(token, root.id()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_interruptible_eval_passes_values_and_failures() {
        let root = Scope::new_root(Some(Interruptible::new()));
        assert_eq!(root.interruptible_eval(IO::pure(5)).unsafe_run_sync().unwrap().unwrap(), 5);
        let failed = root
            .interruptible_eval(IO::<u8>::raise_error(Error::msg("bad")))
            .unsafe_run_sync()
            .unwrap();
        assert!(matches!(failed, Err(Interrupt::Failed(_))));

        let plain = Scope::new_root(None);
        assert_eq!(plain.interruptible_eval(IO::pure('x')).unsafe_run_sync().unwrap().unwrap(), 'x');
    }

    #[test]
    fn test_arena_holds_only_open_scopes() {
        let root = Scope::new_root(None);
        let a = open(&root);
        let _b = open(&a);
        let _c = open(&root);
        assert_eq!(root.arena.nodes.lock().len(), 4);

        a.close(ExitCase::Completed).unsafe_run_sync().unwrap().unwrap();
        assert_eq!(root.arena.nodes.lock().len(), 2);
        assert_eq!(root.child_ids().len(), 1);
    }

    #[test]
    fn test_dropping_unclosed_tree_frees_it() {
        let held = Arc::new(());
        let root = Scope::new_root(None);
        let child = open(&root);
        let h = held.clone();
        child
            .acquire_resource(IO::pure(()), move |(), _| {
                let _h = &h;
                IO::unit()
            })
            .unsafe_run_sync()
            .unwrap()
            .unwrap();
        let arena = Arc::downgrade(&root.arena);
        assert_eq!(Arc::strong_count(&held), 2);

        drop(child);
        drop(root);
        assert!(arena.upgrade().is_none());
        assert_eq!(Arc::strong_count(&held), 1);
    }

    #[test]
    fn test_failing_child_and_own_resource_compose() {
        let root = Scope::new_root(None);
        let scope = open(&root);
        scope
            .acquire_resource(IO::pure(()), |(), _| IO::raise_error(Error::msg("own")))
            .unsafe_run_sync()
            .unwrap()
            .unwrap();
        let child = open(&scope);
        child
            .acquire_resource(IO::pure(()), |(), _| IO::raise_error(Error::msg("child")))
            .unsafe_run_sync()
            .unwrap()
            .unwrap();

        let err = scope.close(ExitCase::Completed).unsafe_run_sync().unwrap().unwrap_err();
        let causes: Vec<String> = match &err {
            Error::Composite(c) => c.iter().map(|e| e.to_string()).collect(),
            other => panic!("expected a composite, got {other}"),
        };
        assert_eq!(causes, vec!["child", "own"]);
        assert!(root.is_open());
    }
}
