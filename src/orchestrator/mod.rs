//! Reflection loop orchestration.
//!
//! Covers plan dispatch to worker sessions, evaluator parsing, synthesis
//! stall detection, quality-trend tracking, and the per-group driver loop.

pub mod controller;
pub mod dispatch;
pub mod evaluation;
pub mod groups;
pub mod stall;
pub mod trend;

pub use controller::{ReflectionController, ReflectionHandle, ReflectionRequest};
pub use groups::ReflectionGroups;
