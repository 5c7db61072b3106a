//! Generic utility primitives with zero domain knowledge.
//!
//! - `cancel` - Interrupt flag shared between the signal handler and workers
//! - `shell` - Shell escaping and quoting

pub mod cancel;
pub mod shell;
