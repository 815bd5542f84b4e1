//! Work cells and the arena that records them

mod arena;
mod config;
mod core;

pub use arena::{CellArena, CellRecord};
pub use config::CellConfig;
pub use core::{CellContext, WorkCell};
