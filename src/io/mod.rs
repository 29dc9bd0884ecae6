//! The `RandomAccessFile` abstraction: a single synchronous positional-I/O trait with a handful
//! of backends selected by a factory at open time, unified behind one tagged enum (`AnyFile`) so
//! a coordinator can hold heterogeneous backends behind a single field.

pub mod file;

pub use file::{AnyFile, FileOpenKind, RandomAccessFile};
