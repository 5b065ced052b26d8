//! Declaration CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the declaration controller.

pub mod declaration;

pub use declaration::*;
