//! The embedding API
//!
//! A [`State`] is a handle on one thread of a Lua environment. The root
//! state owns the environment; thread states and the views handed to host
//! functions share it. All values live in the environment's heap and are
//! reached from the host only through stack indices, pseudo-indices or
//! registry references.

mod bridge;
mod coroutine;
mod debug;
mod dump;
mod exec;
mod index;
mod loader;
mod meta;
mod protect;
mod registry;
mod stack;

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

use tracing::debug;
use uuid::Uuid;

use crate::config::{Config, ConfigError, GcConfig};
use crate::error::Result;
use crate::vm::arena::Arena;
use crate::vm::heap::{LuaHeap, ThreadObject, ThreadStatus};
use crate::vm::value::{ThreadHandle, Value};

pub use coroutine::ResumeStatus;
pub use debug::Debug;
pub use loader::{ChunkReader, ChunkStream};
pub use registry::{GcCommand, NOREF, REFNIL};

/// Pseudo-index of the registry table
pub const REGISTRY_INDEX: i32 = -10000;

/// Pseudo-index of the running function's environment
pub const ENVIRON_INDEX: i32 = -10001;

/// Pseudo-index of the thread's global table
pub const GLOBALS_INDEX: i32 = -10002;

/// Ask a call for every result
pub const MULTRET: i32 = -1;

/// Most upvalues a host closure can carry
pub const MAX_UPVALUES: usize = 255;

/// Pseudo-index of the `i`-th upvalue of the running host closure
pub fn upvalue_index(i: i32) -> i32 {
    GLOBALS_INDEX - i
}

/// A host function callable from Lua
///
/// On entry the function sees exactly its arguments at `1..=get_top()`.
/// It returns the number of results it left on top of the stack, or an
/// error built with [`State::error`].
pub type HostFunction = Rc<dyn Fn(&mut State) -> Result<usize>>;

/// Handler run when an error escapes to the top level
pub type PanicHandler = Rc<dyn Fn(&mut State)>;

/// Whether a handle tears the environment down when dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Root handle: closing it destroys the environment
    Owner,

    /// Thread or callback view of an environment owned elsewhere
    Shared,
}

/// State shared by every handle on one environment
pub(crate) struct Environment {
    /// Identity used in logs and cross-thread checks
    pub(crate) id: Uuid,

    pub(crate) heap: RefCell<LuaHeap>,

    /// Host callables, referenced from function objects by id
    pub(crate) hosts: RefCell<Arena<HostFunction>>,

    pub(crate) config: Config,

    pub(crate) panic: RefCell<Option<PanicHandler>>,

    /// Nesting of host-initiated calls and resumes
    pub(crate) host_depth: Cell<usize>,

    pub(crate) closed: Cell<bool>,
}

/// A handle on one thread of a Lua environment
pub struct State {
    pub(crate) env: Rc<Environment>,
    pub(crate) thread: ThreadHandle,
    ownership: Ownership,
}

impl State {
    /// Create a fresh environment with the default configuration
    pub fn new() -> Self {
        let env = Environment::new(Config::default());
        let thread = env.heap.borrow().main;
        State::attach(env, thread, Ownership::Owner)
    }

    /// Create a fresh environment with the given configuration
    pub fn with_config(config: Config) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let env = Environment::new(config);
        let thread = env.heap.borrow().main;
        Ok(State::attach(env, thread, Ownership::Owner))
    }

    /// Create a handle, pinning its thread against collection
    pub(crate) fn attach(env: Rc<Environment>, thread: ThreadHandle, ownership: Ownership) -> Self {
        if let Ok(mut heap) = env.heap.try_borrow_mut() {
            *heap.pinned.entry(thread).or_insert(0) += 1;
        }
        State { env, thread, ownership }
    }

    /// A shared handle on another thread of this environment
    pub(crate) fn view(&self, thread: ThreadHandle) -> State {
        State::attach(self.env.clone(), thread, Ownership::Shared)
    }

    /// Destroy the environment (owner) or release this handle (shared)
    pub fn close(self) {
        drop(self);
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Whether this handle refers to the environment's main thread
    pub fn is_main_thread(&self) -> bool {
        self.heap().main == self.thread
    }

    /// Whether two handles refer to the same thread
    pub fn same_thread(&self, other: &State) -> bool {
        Rc::ptr_eq(&self.env, &other.env) && self.thread == other.thread
    }

    /// Identity of the environment this handle belongs to
    pub fn environment_id(&self) -> Uuid {
        self.env.id
    }

    /// The configuration the environment was created with
    pub fn config(&self) -> &Config {
        &self.env.config
    }

    /// Install the handler run when an error escapes an unprotected call
    pub fn at_panic(&mut self, handler: Option<PanicHandler>) -> Option<PanicHandler> {
        std::mem::replace(&mut *self.env.panic.borrow_mut(), handler)
    }

    // ---- heap access ----

    fn check_open(&self) {
        if self.env.closed.get() {
            panic!("Lua state used after its environment was closed");
        }
    }

    pub(crate) fn heap(&self) -> Ref<'_, LuaHeap> {
        self.check_open();
        self.env.heap.borrow()
    }

    pub(crate) fn heap_mut(&self) -> RefMut<'_, LuaHeap> {
        self.check_open();
        self.env.heap.borrow_mut()
    }

    /// Run `f` on this handle's thread object
    pub(crate) fn with_thread<R>(&self, f: impl FnOnce(&mut ThreadObject) -> R) -> R {
        let mut heap = self.heap_mut();
        f(heap.thread_mut(self.thread))
    }

    // ---- raw stack helpers ----

    /// Push without a collection checkpoint
    pub(crate) fn push(&self, value: Value) {
        self.with_thread(|t| t.stack.push(value));
    }

    pub(crate) fn pop_value(&self) -> Value {
        self.with_thread(|t| t.stack.pop().unwrap_or(Value::Nil))
    }

    pub(crate) fn stack_len(&self) -> usize {
        self.heap().thread(self.thread).stack.len()
    }

    pub(crate) fn stack_get(&self, pos: usize) -> Value {
        self.heap().thread(self.thread).stack.get(pos).copied().unwrap_or(Value::Nil)
    }

    pub(crate) fn stack_set(&self, pos: usize, value: Value) {
        self.with_thread(|t| {
            if pos >= t.stack.len() {
                t.stack.resize(pos + 1, Value::Nil);
            }
            t.stack[pos] = value;
        });
    }

    pub(crate) fn truncate(&self, len: usize) {
        self.with_thread(|t| t.stack.truncate(len));
    }

    pub(crate) fn base(&self) -> usize {
        self.heap().thread(self.thread).base()
    }

    /// Status of this handle's thread
    pub fn status(&self) -> ThreadStatus {
        self.heap().thread(self.thread).status
    }

    // ---- collection checkpoints ----

    /// Collect if the allocation threshold was crossed; never fails
    pub(crate) fn gc_point(&mut self) {
        let due = {
            let heap = self.heap();
            heap.should_collect() || heap.over_limit()
        };
        if due {
            self.collect_garbage();
        }
    }

    /// Collect if needed, then fail when the memory limit is still exceeded
    pub(crate) fn gc_check(&mut self) -> Result<()> {
        self.gc_point();
        if self.heap().over_limit() {
            return Err(crate::error::LuaError::Memory);
        }
        Ok(())
    }

    /// Run a full cycle and release the host callables of dead closures
    pub(crate) fn collect_garbage(&mut self) {
        let (freed, stats) = {
            let mut heap = self.heap_mut();
            let freed = heap.collect();
            (freed, heap.stats())
        };
        let released: Vec<HostFunction> = {
            let mut hosts = self.env.hosts.borrow_mut();
            freed.into_iter().filter_map(|id| hosts.remove(id.0)).collect()
        };
        debug!(
            env = %self.env.id,
            allocated = stats.allocated,
            tables = stats.tables,
            released = released.len(),
            "gc cycle"
        );
        drop(released);
    }
}

impl Default for State {
    fn default() -> Self {
        State::new()
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("env", &self.env.id)
            .field("thread", &self.thread)
            .field("ownership", &self.ownership)
            .finish()
    }
}

impl Drop for State {
    fn drop(&mut self) {
        if self.env.closed.get() {
            return;
        }
        if let Ok(mut heap) = self.env.heap.try_borrow_mut() {
            if let Some(count) = heap.pinned.get_mut(&self.thread) {
                *count -= 1;
                if *count == 0 {
                    heap.pinned.remove(&self.thread);
                }
            }
        }
        if self.ownership == Ownership::Owner {
            self.env.teardown();
        }
    }
}

impl Environment {
    fn new(config: Config) -> Rc<Self> {
        let heap = LuaHeap::new(&config.gc, config.limits.memory_limit);
        let env = Rc::new(Environment {
            id: Uuid::new_v4(),
            heap: RefCell::new(heap),
            hosts: RefCell::new(Arena::new()),
            config,
            panic: RefCell::new(None),
            host_depth: Cell::new(0),
            closed: Cell::new(false),
        });
        debug!(env = %env.id, memory_limit = env.config.limits.memory_limit, "state created");
        env
    }

    /// Free every object and host callable; later use of any handle panics
    fn teardown(&self) {
        self.closed.set(true);
        let old_heap = match self.heap.try_borrow_mut() {
            Ok(mut heap) => Some(std::mem::replace(&mut *heap, LuaHeap::new(&GcConfig::default(), 0))),
            Err(_) => None,
        };
        let hosts = match self.hosts.try_borrow_mut() {
            Ok(mut hosts) => std::mem::take(&mut *hosts),
            Err(_) => Arena::new(),
        };
        let panic = self.panic.try_borrow_mut().ok().and_then(|mut p| p.take());
        debug!(env = %self.id, hosts = hosts.len(), "state closed");
        drop(old_heap);
        drop(hosts);
        drop(panic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_and_views() {
        let mut state = State::new();
        assert_eq!(state.ownership(), Ownership::Owner);
        assert!(state.is_main_thread());
        let thread = state.new_thread();
        assert_eq!(thread.ownership(), Ownership::Shared);
        assert!(!thread.is_main_thread());
        assert_eq!(thread.environment_id(), state.environment_id());
        assert_eq!(thread.status(), ThreadStatus::Fresh);
    }

    #[test]
    #[should_panic(expected = "after its environment was closed")]
    fn test_use_after_close_panics() {
        let mut state = State::new();
        let thread = state.new_thread();
        state.close();
        thread.get_top();
    }

    #[test]
    fn test_pinned_thread_survives_collection() {
        let mut state = State::new();
        let mut thread = state.new_thread();
        state.pop(1);
        thread.push_integer(7);
        state.collect_garbage();
        assert_eq!(thread.to_integer(-1), 7);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = Config::default();
        config.limits.call_depth = 0;
        assert!(State::with_config(config).is_err());
    }
}
