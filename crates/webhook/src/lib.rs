//! Admission webhook sharing physical GPUs between pods.
//!
//! Pods asking for `bitfusion.io` GPU resources are rewritten at admission
//! time so their workload runs through the GPU-sharing client, with the
//! client runtime injected by init containers and the GPU demand folded into
//! a single share quantity the scheduler can account for.

pub mod admission;
pub mod api;
pub mod config;
pub mod infrastructure;
