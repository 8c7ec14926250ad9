//! Domain model module declarations.

pub mod event;
pub mod history;
pub mod reflection;
pub mod session;
