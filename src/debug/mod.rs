//! Debugging support: the boot symbol table.

pub mod symbols;
