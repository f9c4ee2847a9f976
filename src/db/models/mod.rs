//! Database models split into domain-specific modules.

pub mod common;
pub mod deployment;
pub mod job;
pub mod notification;
pub mod pipeline;

pub use common::*;
pub use deployment::*;
pub use job::*;
pub use notification::*;
pub use pipeline::*;
