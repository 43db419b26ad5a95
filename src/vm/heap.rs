//! Lua heap management with generational arena architecture
//!
//! Every collectable object lives in a per-kind arena. Collection is a
//! stop-the-world mark and sweep that the state triggers only at points
//! where every live value is reachable from a root (stacks, registry,
//! pinned threads), so no Rust local ever holds the last reference.

use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use super::arena::Arena;
use super::proto::Proto;
use super::table::Table;
use super::value::{
    CellHandle, FunctionHandle, HostId, StringHandle, TableHandle, ThreadHandle,
    UserdataHandle, Value,
};
use crate::config::GcConfig;
use crate::error::{LuaError, Result};

/// Garbage collection mark
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcMark {
    /// Not reachable (or not yet reached)
    White,

    /// Reachable but not fully processed
    Gray,

    /// Reachable and fully processed
    Black,
}

/// String object in heap
#[derive(Debug)]
pub struct LuaString {
    pub bytes: Box<[u8]>,

    /// Pre-computed hash used by the interner
    pub hash: u64,

    pub mark: GcMark,
}

/// The two kinds of callable objects
#[derive(Debug)]
pub enum FunctionKind {
    /// Compiled Lua function with its captured cells
    Lua {
        proto: Rc<Proto>,
        upvalues: Vec<CellHandle>,
    },

    /// Host callable registered in the environment's host registry
    Host { id: HostId, upvalues: Vec<Value> },
}

/// Function object in heap
#[derive(Debug)]
pub struct FunctionObject {
    pub kind: FunctionKind,

    /// Environment table used for global access
    pub env: TableHandle,

    pub mark: GcMark,
}

/// A captured variable shared between closures
#[derive(Debug)]
pub struct Cell {
    pub value: Value,
    pub mark: GcMark,
}

/// Full userdata: an arbitrary host value with an optional metatable
#[derive(Debug)]
pub struct UserdataObject {
    pub data: Box<dyn Any>,

    /// Size reported by the length operator
    pub size: usize,

    pub metatable: Option<TableHandle>,

    pub mark: GcMark,
}

/// Lifecycle of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Created, body not started yet
    Fresh,

    /// Currently executing (or resuming another thread)
    Running,

    /// Suspended in a yield
    Suspended,

    /// Body returned
    Dead,

    /// Body raised an error
    Errored,
}

/// A Lua activation record
#[derive(Debug)]
pub struct LuaFrame {
    pub closure: FunctionHandle,
    pub proto: Rc<Proto>,

    /// Index of the next instruction
    pub pc: usize,

    /// Extra arguments of a vararg function
    pub varargs: Vec<Value>,

    /// Cells of captured locals, by slot
    pub cells: Vec<Option<CellHandle>>,
}

/// Frame kinds
#[derive(Debug)]
pub enum FrameKind {
    Lua(LuaFrame),
    Host { closure: FunctionHandle },
}

/// Call frame information
#[derive(Debug)]
pub struct Frame {
    /// Stack slot holding the called function
    pub func: usize,

    /// First slot of the frame (arguments / locals)
    pub base: usize,

    /// Results wanted by the caller (-1 for all)
    pub nresults: i32,

    pub kind: FrameKind,
}

impl Frame {
    pub fn closure(&self) -> FunctionHandle {
        match &self.kind {
            FrameKind::Lua(lua) => lua.closure,
            FrameKind::Host { closure } => *closure,
        }
    }

    pub fn lua(&self) -> Option<&LuaFrame> {
        match &self.kind {
            FrameKind::Lua(lua) => Some(lua),
            FrameKind::Host { .. } => None,
        }
    }

    pub fn lua_mut(&mut self) -> Option<&mut LuaFrame> {
        match &mut self.kind {
            FrameKind::Lua(lua) => Some(lua),
            FrameKind::Host { .. } => None,
        }
    }
}

/// Thread object in heap
#[derive(Debug)]
pub struct ThreadObject {
    /// Value stack
    pub stack: Vec<Value>,

    /// Call frames
    pub frames: Vec<Frame>,

    pub status: ThreadStatus,

    /// Global table seen by code loaded on this thread
    pub globals: TableHandle,

    /// Nesting of host-initiated calls; yielding requires zero
    pub nny: usize,

    /// Nesting of protected calls
    pub protect: usize,

    /// Set by a host function that returns through `yield_`
    pub yield_request: Option<usize>,

    pub mark: GcMark,
}

impl ThreadObject {
    /// First slot visible to the innermost frame
    pub fn base(&self) -> usize {
        self.frames.last().map_or(0, |f| f.base)
    }
}

/// Metamethod events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Index,
    NewIndex,
    Call,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
    Concat,
    Len,
    Eq,
    Lt,
    Le,
    ToString,
    Metatable,
}

const EVENT_NAMES: [&str; 17] = [
    "__index",
    "__newindex",
    "__call",
    "__add",
    "__sub",
    "__mul",
    "__div",
    "__mod",
    "__pow",
    "__unm",
    "__concat",
    "__len",
    "__eq",
    "__lt",
    "__le",
    "__tostring",
    "__metatable",
];

impl Event {
    pub fn name(self) -> &'static str {
        EVENT_NAMES[self as usize]
    }
}

/// Collector bookkeeping
#[derive(Debug)]
pub struct GcState {
    /// Estimated bytes in use
    pub allocated: usize,

    /// Allocation level that triggers the next cycle
    pub threshold: usize,

    /// Minimum threshold
    pub base_threshold: usize,

    /// Growth percentage between cycles
    pub pause: usize,

    /// Automatic collection enabled
    pub enabled: bool,

    /// Hard limit (0 = unlimited)
    pub limit: usize,

    /// Completed cycles
    pub cycles: u64,
}

/// Objects that still need their references traced
#[derive(Debug, Clone, Copy)]
enum GcObject {
    Table(TableHandle),
    Function(FunctionHandle),
    Cell(CellHandle),
    Userdata(UserdataHandle),
    Thread(ThreadHandle),
}

/// Memory statistics
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MemoryStats {
    pub allocated: usize,
    pub strings: usize,
    pub tables: usize,
    pub functions: usize,
    pub userdata: usize,
    pub threads: usize,
}

/// Core heap implementation
#[derive(Debug)]
pub struct LuaHeap {
    pub strings: Arena<LuaString>,
    pub tables: Arena<Table>,
    pub functions: Arena<FunctionObject>,
    pub cells: Arena<Cell>,
    pub userdata: Arena<UserdataObject>,
    pub threads: Arena<ThreadObject>,

    /// Hash buckets for string deduplication
    interner: HashMap<u64, Vec<StringHandle>>,

    /// The registry table
    pub registry: TableHandle,

    /// The main thread
    pub main: ThreadHandle,

    /// Metatables shared by all values of a basic type
    pub type_metatables: [Option<TableHandle>; 9],

    /// Interned event names, indexed by `Event`
    events: Vec<StringHandle>,

    /// Threads referenced by live host handles, with counts
    pub pinned: HashMap<ThreadHandle, usize>,

    /// Error value in flight, with the error it belongs to
    pub raised: Option<(Value, LuaError)>,

    gray: Vec<GcObject>,

    pub gc: GcState,
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// Estimated size of a function object, including its prototype
fn function_size(kind: &FunctionKind) -> usize {
    let extra = match kind {
        FunctionKind::Lua { proto, upvalues } => {
            proto.footprint() + upvalues.len() * std::mem::size_of::<CellHandle>()
        }
        FunctionKind::Host { upvalues, .. } => upvalues.len() * std::mem::size_of::<Value>(),
    };
    std::mem::size_of::<FunctionObject>() + extra
}

impl LuaHeap {
    /// Create a heap with a registry, a main thread and its global table
    pub fn new(gc: &GcConfig, memory_limit: usize) -> Self {
        let mut tables = Arena::new();
        let registry = TableHandle(tables.insert(Table::new()));
        let globals = TableHandle(tables.insert(Table::new()));
        let mut threads = Arena::new();
        let main = ThreadHandle(threads.insert(ThreadObject {
            stack: Vec::new(),
            frames: Vec::new(),
            status: ThreadStatus::Running,
            globals,
            nny: 0,
            protect: 0,
            yield_request: None,
            mark: GcMark::White,
        }));

        let mut heap = LuaHeap {
            strings: Arena::new(),
            tables,
            functions: Arena::new(),
            cells: Arena::new(),
            userdata: Arena::new(),
            threads,
            interner: HashMap::new(),
            registry,
            main,
            type_metatables: [None; 9],
            events: Vec::new(),
            pinned: HashMap::new(),
            raised: None,
            gray: Vec::new(),
            gc: GcState {
                allocated: 0,
                threshold: gc.threshold,
                base_threshold: gc.threshold,
                pause: gc.pause,
                enabled: gc.enabled,
                limit: memory_limit,
                cycles: 0,
            },
        };
        heap.events = EVENT_NAMES.iter().map(|n| heap.intern(n.as_bytes())).collect();
        heap.gc.allocated = heap.live_bytes();
        heap
    }

    /// Intern a byte string
    pub fn intern(&mut self, bytes: &[u8]) -> StringHandle {
        let hash = hash_bytes(bytes);
        if let Some(bucket) = self.interner.get(&hash) {
            for &handle in bucket {
                if self.strings[handle.0].bytes.as_ref() == bytes {
                    return handle;
                }
            }
        }

        let handle = StringHandle(self.strings.insert(LuaString {
            bytes: bytes.into(),
            hash,
            mark: GcMark::White,
        }));
        self.interner.entry(hash).or_default().push(handle);
        self.gc.allocated += std::mem::size_of::<LuaString>() + bytes.len();
        handle
    }

    /// Intern and wrap as a value
    pub fn string_value(&mut self, bytes: &[u8]) -> Value {
        Value::String(self.intern(bytes))
    }

    /// Get string bytes
    pub fn string_bytes(&self, handle: StringHandle) -> &[u8] {
        &self.strings[handle.0].bytes
    }

    /// Get a string as UTF-8 text, replacing invalid sequences
    pub fn string_lossy(&self, handle: StringHandle) -> String {
        String::from_utf8_lossy(self.string_bytes(handle)).into_owned()
    }

    /// Interned name of a metamethod event
    pub fn event_name(&self, event: Event) -> StringHandle {
        self.events[event as usize]
    }

    /// Allocate a new table
    pub fn new_table(&mut self, narr: usize, nrec: usize) -> TableHandle {
        let table = Table::with_capacity(narr, nrec);
        self.gc.allocated += table.footprint();
        TableHandle(self.tables.insert(table))
    }

    pub fn table(&self, handle: TableHandle) -> &Table {
        &self.tables[handle.0]
    }

    pub fn table_mut(&mut self, handle: TableHandle) -> &mut Table {
        &mut self.tables[handle.0]
    }

    /// Raw assignment into a table, keeping the memory estimate current
    pub fn table_set(&mut self, handle: TableHandle, key: Value, value: Value) -> Result<()> {
        let table = &mut self.tables[handle.0];
        let before = table.footprint();
        table.set(key, value)?;
        let after = table.footprint();
        self.gc.allocated = (self.gc.allocated + after).saturating_sub(before);
        Ok(())
    }

    /// Raw lookup with a string key
    pub fn table_get_str(&mut self, handle: TableHandle, key: &str) -> Value {
        let key = self.string_value(key.as_bytes());
        self.table(handle).get(&key)
    }

    /// Allocate a function object
    pub fn new_function(&mut self, kind: FunctionKind, env: TableHandle) -> FunctionHandle {
        self.gc.allocated += function_size(&kind);
        FunctionHandle(self.functions.insert(FunctionObject {
            kind,
            env,
            mark: GcMark::White,
        }))
    }

    pub fn function(&self, handle: FunctionHandle) -> &FunctionObject {
        &self.functions[handle.0]
    }

    pub fn function_mut(&mut self, handle: FunctionHandle) -> &mut FunctionObject {
        &mut self.functions[handle.0]
    }

    /// Allocate a captured-variable cell
    pub fn new_cell(&mut self, value: Value) -> CellHandle {
        self.gc.allocated += std::mem::size_of::<Cell>();
        CellHandle(self.cells.insert(Cell {
            value,
            mark: GcMark::White,
        }))
    }

    pub fn cell(&self, handle: CellHandle) -> Value {
        self.cells[handle.0].value
    }

    pub fn set_cell(&mut self, handle: CellHandle, value: Value) {
        self.cells[handle.0].value = value;
    }

    /// Allocate a full userdata
    pub fn new_userdata(&mut self, data: Box<dyn Any>, size: usize) -> UserdataHandle {
        self.gc.allocated += std::mem::size_of::<UserdataObject>() + size;
        UserdataHandle(self.userdata.insert(UserdataObject {
            data,
            size,
            metatable: None,
            mark: GcMark::White,
        }))
    }

    /// Allocate a thread sharing the given globals
    pub fn new_thread(&mut self, globals: TableHandle) -> ThreadHandle {
        self.gc.allocated += std::mem::size_of::<ThreadObject>();
        ThreadHandle(self.threads.insert(ThreadObject {
            stack: Vec::new(),
            frames: Vec::new(),
            status: ThreadStatus::Fresh,
            globals,
            nny: 0,
            protect: 0,
            yield_request: None,
            mark: GcMark::White,
        }))
    }

    pub fn thread(&self, handle: ThreadHandle) -> &ThreadObject {
        &self.threads[handle.0]
    }

    pub fn thread_mut(&mut self, handle: ThreadHandle) -> &mut ThreadObject {
        &mut self.threads[handle.0]
    }

    /// Metatable of any value
    pub fn metatable_of(&self, value: &Value) -> Option<TableHandle> {
        match value {
            Value::Table(t) => self.table(*t).metatable,
            Value::Userdata(u) => self.userdata[u.0].metatable,
            other => self.type_metatables[other.type_of().code() as usize],
        }
    }

    /// Replace the metatable of any value
    pub fn set_metatable_of(&mut self, value: &Value, mt: Option<TableHandle>) {
        match value {
            Value::Table(t) => self.table_mut(*t).metatable = mt,
            Value::Userdata(u) => self.userdata[u.0].metatable = mt,
            other => {
                let code = other.type_of().code();
                if code >= 0 {
                    self.type_metatables[code as usize] = mt;
                }
            }
        }
    }

    /// Raw lookup of a metamethod; nil when absent
    pub fn metamethod(&self, value: &Value, event: Event) -> Value {
        match self.metatable_of(value) {
            Some(mt) => self.table(mt).get(&Value::String(self.event_name(event))),
            None => Value::Nil,
        }
    }

    /// Whether the automatic collector wants to run
    pub fn should_collect(&self) -> bool {
        self.gc.enabled && self.gc.allocated >= self.gc.threshold
    }

    /// Whether the memory estimate exceeds the hard limit
    pub fn over_limit(&self) -> bool {
        self.gc.limit > 0 && self.gc.allocated > self.gc.limit
    }

    /// Store the value of an error that is being raised
    pub fn set_raised(&mut self, value: Value, error: &LuaError) {
        self.raised = Some((value, error.clone()));
    }

    /// Take the value raised together with `error`, if it is still in flight
    pub fn take_raised(&mut self, error: &LuaError) -> Option<Value> {
        match self.raised.take() {
            Some((value, raised)) if &raised == error => Some(value),
            _ => None,
        }
    }

    /// Run a full collection cycle, returning host ids whose closures died
    pub fn collect(&mut self) -> Vec<HostId> {
        self.mark_roots();
        while let Some(obj) = self.gray.pop() {
            self.trace(obj);
        }
        let freed = self.sweep();
        self.gc.allocated = self.live_bytes();
        self.gc.threshold = (self.gc.allocated / 100)
            .saturating_mul(self.gc.pause)
            .max(self.gc.base_threshold);
        self.gc.cycles += 1;
        freed
    }

    fn mark_roots(&mut self) {
        self.mark_table(self.registry);
        self.mark_thread(self.main);
        for mt in self.type_metatables.into_iter().flatten() {
            self.mark_table(mt);
        }
        for i in 0..self.events.len() {
            self.mark_string(self.events[i]);
        }
        let pinned: Vec<ThreadHandle> = self.pinned.keys().copied().collect();
        for thread in pinned {
            self.mark_thread(thread);
        }
        if let Some((value, _)) = self.raised {
            self.mark_value(value);
        }
    }

    fn mark_value(&mut self, value: Value) {
        match value {
            Value::String(h) => self.mark_string(h),
            Value::Table(h) => self.mark_table(h),
            Value::Function(h) => self.mark_function(h),
            Value::Userdata(h) => {
                if let Some(u) = self.userdata.get_mut(h.0) {
                    if u.mark == GcMark::White {
                        u.mark = GcMark::Gray;
                        self.gray.push(GcObject::Userdata(h));
                    }
                }
            }
            Value::Thread(h) => self.mark_thread(h),
            Value::Nil | Value::Boolean(_) | Value::Number(_) | Value::LightUserdata(_) => {}
        }
    }

    fn mark_string(&mut self, handle: StringHandle) {
        if let Some(s) = self.strings.get_mut(handle.0) {
            // Strings have no references
            s.mark = GcMark::Black;
        }
    }

    fn mark_table(&mut self, handle: TableHandle) {
        if let Some(t) = self.tables.get_mut(handle.0) {
            if t.mark == GcMark::White {
                t.mark = GcMark::Gray;
                self.gray.push(GcObject::Table(handle));
            }
        }
    }

    fn mark_function(&mut self, handle: FunctionHandle) {
        if let Some(f) = self.functions.get_mut(handle.0) {
            if f.mark == GcMark::White {
                f.mark = GcMark::Gray;
                self.gray.push(GcObject::Function(handle));
            }
        }
    }

    fn mark_cell(&mut self, handle: CellHandle) {
        if let Some(c) = self.cells.get_mut(handle.0) {
            if c.mark == GcMark::White {
                c.mark = GcMark::Gray;
                self.gray.push(GcObject::Cell(handle));
            }
        }
    }

    fn mark_thread(&mut self, handle: ThreadHandle) {
        if let Some(t) = self.threads.get_mut(handle.0) {
            if t.mark == GcMark::White {
                t.mark = GcMark::Gray;
                self.gray.push(GcObject::Thread(handle));
            }
        }
    }

    /// Scan a gray object and mark its references
    fn trace(&mut self, obj: GcObject) {
        match obj {
            GcObject::Table(h) => {
                let (refs, mt) = {
                    let t = &mut self.tables[h.0];
                    t.mark = GcMark::Black;
                    (t.references().collect::<Vec<_>>(), t.metatable)
                };
                for v in refs {
                    self.mark_value(v);
                }
                if let Some(mt) = mt {
                    self.mark_table(mt);
                }
            }
            GcObject::Function(h) => {
                let f = &mut self.functions[h.0];
                f.mark = GcMark::Black;
                let env = f.env;
                let (cells, values) = match &f.kind {
                    FunctionKind::Lua { upvalues, .. } => (upvalues.clone(), Vec::new()),
                    FunctionKind::Host { upvalues, .. } => (Vec::new(), upvalues.clone()),
                };
                self.mark_table(env);
                for c in cells {
                    self.mark_cell(c);
                }
                for v in values {
                    self.mark_value(v);
                }
            }
            GcObject::Cell(h) => {
                let c = &mut self.cells[h.0];
                c.mark = GcMark::Black;
                let v = c.value;
                self.mark_value(v);
            }
            GcObject::Userdata(h) => {
                let u = &mut self.userdata[h.0];
                u.mark = GcMark::Black;
                if let Some(mt) = u.metatable {
                    self.mark_table(mt);
                }
            }
            GcObject::Thread(h) => {
                let mut values = Vec::new();
                let mut closures = Vec::new();
                let mut cells = Vec::new();
                let globals = {
                    let t = &mut self.threads[h.0];
                    t.mark = GcMark::Black;
                    values.extend_from_slice(&t.stack);
                    for frame in &t.frames {
                        closures.push(frame.closure());
                        if let FrameKind::Lua(lua) = &frame.kind {
                            values.extend_from_slice(&lua.varargs);
                            cells.extend(lua.cells.iter().flatten().copied());
                        }
                    }
                    t.globals
                };
                self.mark_table(globals);
                for v in values {
                    self.mark_value(v);
                }
                for f in closures {
                    self.mark_function(f);
                }
                for c in cells {
                    self.mark_cell(c);
                }
            }
        }
    }

    fn sweep(&mut self) -> Vec<HostId> {
        fn survive(mark: &mut GcMark) -> bool {
            let alive = *mark != GcMark::White;
            *mark = GcMark::White;
            alive
        }

        let dead_strings = self.strings.drain_unless(|s| survive(&mut s.mark));
        for (handle, s) in dead_strings {
            let handle = StringHandle(handle);
            if let Some(bucket) = self.interner.get_mut(&s.hash) {
                bucket.retain(|h| *h != handle);
                if bucket.is_empty() {
                    self.interner.remove(&s.hash);
                }
            }
        }

        self.tables.drain_unless(|t| survive(&mut t.mark));
        self.cells.drain_unless(|c| survive(&mut c.mark));
        self.userdata.drain_unless(|u| survive(&mut u.mark));
        self.threads.drain_unless(|t| survive(&mut t.mark));

        self.functions
            .drain_unless(|f| survive(&mut f.mark))
            .into_iter()
            .filter_map(|(_, f)| match f.kind {
                FunctionKind::Host { id, .. } => Some(id),
                FunctionKind::Lua { .. } => None,
            })
            .collect()
    }

    /// Recompute the memory estimate from the live objects
    pub fn live_bytes(&self) -> usize {
        let strings: usize = self
            .strings
            .iter()
            .map(|(_, s)| std::mem::size_of::<LuaString>() + s.bytes.len())
            .sum();
        let tables: usize = self.tables.iter().map(|(_, t)| t.footprint()).sum();
        let functions: usize = self.functions.iter().map(|(_, f)| function_size(&f.kind)).sum();
        let cells = self.cells.len() * std::mem::size_of::<Cell>();
        let userdata: usize = self
            .userdata
            .iter()
            .map(|(_, u)| std::mem::size_of::<UserdataObject>() + u.size)
            .sum();
        let threads: usize = self
            .threads
            .iter()
            .map(|(_, t)| std::mem::size_of::<ThreadObject>() + t.stack.len() * std::mem::size_of::<Value>())
            .sum();
        strings + tables + functions + cells + userdata + threads
    }

    /// Object counts and the current estimate
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            allocated: self.gc.allocated,
            strings: self.strings.len(),
            tables: self.tables.len(),
            functions: self.functions.len(),
            userdata: self.userdata.len(),
            threads: self.threads.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> LuaHeap {
        LuaHeap::new(&GcConfig::default(), 0)
    }

    #[test]
    fn test_interning() {
        let mut heap = heap();
        let a = heap.intern(b"hello");
        let b = heap.intern(b"hello");
        let c = heap.intern(b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.string_bytes(c), b"world");
    }

    #[test]
    fn test_collect_unreachable() {
        let mut heap = heap();
        let before = heap.stats();
        let garbage = heap.new_table(0, 0);
        let kept = heap.new_table(0, 0);
        let key = heap.string_value(b"kept");
        heap.table_set(heap.registry, key, Value::Table(kept)).unwrap();
        heap.intern(b"temporary");

        heap.collect();

        assert!(!heap.tables.contains(garbage.0));
        assert!(heap.tables.contains(kept.0));
        assert_eq!(heap.stats().tables, before.tables + 1);
        // The dead string left the interner, so interning again makes a new object
        let again = heap.intern(b"temporary");
        assert!(heap.strings.contains(again.0));
    }

    #[test]
    fn test_stack_roots_survive() {
        let mut heap = heap();
        let s = heap.string_value(b"on the stack");
        let main = heap.main;
        heap.thread_mut(main).stack.push(s);
        heap.collect();
        if let Value::String(h) = s {
            assert_eq!(heap.string_bytes(h), b"on the stack");
        }
    }

    #[test]
    fn test_host_ids_reported() {
        let mut heap = heap();
        let env = heap.thread(heap.main).globals;
        let id = HostId(crate::vm::arena::Handle::new(3, 0));
        heap.new_function(FunctionKind::Host { id, upvalues: vec![] }, env);
        let freed = heap.collect();
        assert_eq!(freed, vec![id]);
    }

    #[test]
    fn test_cycles_collected() {
        let mut heap = heap();
        let a = heap.new_table(0, 0);
        let b = heap.new_table(0, 0);
        heap.table_set(a, Value::Number(1.0), Value::Table(b)).unwrap();
        heap.table_set(b, Value::Number(1.0), Value::Table(a)).unwrap();
        heap.collect();
        assert!(!heap.tables.contains(a.0));
        assert!(!heap.tables.contains(b.0));
    }
}
