//! Virtual machine internals: values, the collected heap and bytecode

pub mod arena;
pub mod heap;
pub mod number;
pub mod proto;
pub mod table;
pub mod value;
