//! Lua tables: an array part for dense integer keys and an
//! insertion-ordered hash part for everything else

use std::collections::HashMap;

use super::heap::GcMark;
use super::number::as_array_index;
use super::value::{TableHandle, Value};
use crate::error::{LuaError, Result};

/// Table object in heap
#[derive(Debug)]
pub struct Table {
    /// Values for keys `1..=array.len()`
    array: Vec<Value>,

    /// Hash part in insertion order; a nil value marks a removed entry
    entries: Vec<(Value, Value)>,

    /// Key to position in `entries`
    index: HashMap<Value, usize>,

    /// Number of removed entries still occupying `entries`
    dead: usize,

    /// Metatable (handle to another table)
    pub metatable: Option<TableHandle>,

    /// GC mark
    pub mark: GcMark,
}

impl Table {
    /// Create a new empty table
    pub fn new() -> Self {
        Table::with_capacity(0, 0)
    }

    /// Create a table with preallocated array and hash parts
    pub fn with_capacity(narr: usize, nrec: usize) -> Self {
        Table {
            array: Vec::with_capacity(narr),
            entries: Vec::with_capacity(nrec),
            index: HashMap::with_capacity(nrec),
            dead: 0,
            metatable: None,
            mark: GcMark::White,
        }
    }

    /// Raw lookup; absent keys yield nil
    pub fn get(&self, key: &Value) -> Value {
        if let Value::Number(n) = key {
            if let Some(i) = as_array_index(*n) {
                if i <= self.array.len() {
                    return self.array[i - 1];
                }
            }
        }
        match self.index.get(key) {
            Some(&pos) => self.entries[pos].1,
            None => Value::Nil,
        }
    }

    /// Raw lookup of an integer key
    pub fn get_int(&self, i: i64) -> Value {
        if i >= 1 && (i as usize) <= self.array.len() {
            return self.array[i as usize - 1];
        }
        self.get(&Value::Number(i as f64))
    }

    /// Raw assignment
    ///
    /// Fails for nil and NaN keys. Assigning nil removes the key.
    pub fn set(&mut self, key: Value, value: Value) -> Result<()> {
        match key {
            Value::Nil => return Err(LuaError::runtime("table index is nil")),
            Value::Number(n) if n.is_nan() => return Err(LuaError::runtime("table index is NaN")),
            _ => {}
        }

        if let Value::Number(n) = key {
            if let Some(i) = as_array_index(n) {
                if i <= self.array.len() {
                    self.array[i - 1] = value;
                    if i == self.array.len() && value.is_nil() {
                        self.trim_array();
                    }
                    return Ok(());
                }
                if i == self.array.len() + 1 && !value.is_nil() && !self.index.contains_key(&key) {
                    self.array.push(value);
                    self.migrate_from_hash();
                    return Ok(());
                }
            }
        }

        self.set_hash(key, value);
        Ok(())
    }

    fn set_hash(&mut self, key: Value, value: Value) {
        if let Some(&pos) = self.index.get(&key) {
            let slot = &mut self.entries[pos].1;
            if slot.is_nil() && !value.is_nil() {
                self.dead -= 1;
            } else if !slot.is_nil() && value.is_nil() {
                self.dead += 1;
            }
            *slot = value;
            return;
        }
        if value.is_nil() {
            return;
        }
        // Only a brand new key may reorder the hash part
        if self.dead > 8 && self.dead * 2 > self.entries.len() {
            self.compact();
        }
        self.index.insert(key, self.entries.len());
        self.entries.push((key, value));
    }

    /// Move keys that now continue the array out of the hash part
    fn migrate_from_hash(&mut self) {
        loop {
            let next = Value::Number((self.array.len() + 1) as f64);
            let pos = match self.index.get(&next) {
                Some(&pos) => pos,
                None => break,
            };
            let value = self.entries[pos].1;
            if value.is_nil() {
                break;
            }
            self.entries[pos].1 = Value::Nil;
            self.dead += 1;
            self.array.push(value);
        }
    }

    fn trim_array(&mut self) {
        while matches!(self.array.last(), Some(Value::Nil)) {
            self.array.pop();
        }
    }

    fn compact(&mut self) {
        self.entries.retain(|(_, v)| !v.is_nil());
        self.index.clear();
        for (pos, (k, _)) in self.entries.iter().enumerate() {
            self.index.insert(*k, pos);
        }
        self.dead = 0;
    }

    /// Length operator: a border of the table
    pub fn len(&self) -> usize {
        let mut n = self.array.len();
        if self.entries.len() == self.dead {
            return n;
        }
        while !self.get(&Value::Number((n + 1) as f64)).is_nil() {
            n += 1;
        }
        n
    }

    /// Check if table has no live entries
    pub fn is_empty(&self) -> bool {
        self.array.iter().all(|v| v.is_nil()) && self.entries.len() == self.dead
    }

    /// Traversal step: the entry following `key` (nil starts the traversal)
    pub fn next(&self, key: &Value) -> Result<Option<(Value, Value)>> {
        let mut array_start = 0;
        let mut hash_start = 0;
        match key {
            Value::Nil => {}
            Value::Number(n) if as_array_index(*n).map_or(false, |i| i <= self.array.len()) => {
                array_start = *n as usize;
            }
            _ => match self.index.get(key) {
                Some(&pos) => {
                    array_start = self.array.len();
                    hash_start = pos + 1;
                }
                None => return Err(LuaError::runtime("invalid key to 'next'")),
            },
        }

        for i in array_start..self.array.len() {
            if !self.array[i].is_nil() {
                return Ok(Some((Value::Number((i + 1) as f64), self.array[i])));
            }
        }
        for (k, v) in self.entries.iter().skip(hash_start) {
            if !v.is_nil() {
                return Ok(Some((*k, *v)));
            }
        }
        Ok(None)
    }

    /// Every live key and value, for marking
    pub fn references(&self) -> impl Iterator<Item = Value> + '_ {
        let array = self.array.iter().copied();
        let hash = self
            .entries
            .iter()
            .filter(|(_, v)| !v.is_nil())
            .flat_map(|(k, v)| [*k, *v]);
        array.chain(hash)
    }

    /// Approximate number of bytes this table occupies
    pub fn footprint(&self) -> usize {
        std::mem::size_of::<Table>()
            + self.array.len() * std::mem::size_of::<Value>()
            + self.entries.len() * (3 * std::mem::size_of::<Value>() + std::mem::size_of::<usize>())
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}
