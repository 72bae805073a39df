//! Ciphertalk shared library: typed IDs, policy constants, the error taxonomy
//! and the row types exchanged with the persistence boundary.

pub mod constants;
pub mod error;
pub mod ids;
pub mod model;
