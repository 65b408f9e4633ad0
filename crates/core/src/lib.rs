pub mod cfg;
pub mod interp;
pub mod ir;
pub mod samples;

pub use ir::{Function, Module};
