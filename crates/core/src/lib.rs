//! Domain types and pure rules shared by the storage and HTTP layers.

pub mod legal;
pub mod pricing;
pub mod sections;
pub mod types;
pub mod validation;
