mod classify;
mod core;
mod debounce;
mod decorate;
mod drop;
mod hotkey;
mod id;
mod normalize;
mod ops;
mod plugin;
mod serde_value;
mod spellcheck;
#[cfg(test)]
mod test_log;

pub use crate::classify::*;
pub use crate::core::*;
pub use crate::debounce::*;
pub use crate::decorate::*;
pub use crate::drop::*;
pub use crate::hotkey::*;
pub use crate::id::*;
pub use crate::normalize::*;
pub use crate::ops::*;
pub use crate::plugin::*;
pub use crate::serde_value::*;
pub use crate::spellcheck::*;
