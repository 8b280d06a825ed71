//! Minimal cgroup v2 controller: memory and cpu limits, task membership,
//! and an OOM event monitor. Unified hierarchy only; no v1, no systemd
//! delegation.

pub mod controller;
pub mod oom;

pub use controller::{CgroupController, CgroupError};
pub use oom::{spawn_oom_monitor, stop_oom_monitor};
