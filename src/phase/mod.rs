//! PhaseRunner (§4.4): uniform invocation of heterogeneous phase
//! executables, content-hash reuse decisions, retry, and failure
//! categorization.

mod categorize;
mod recipe;
mod reuse;
mod runner;

pub use categorize::categorize;
pub use recipe::{recipe_for, Launcher, PhaseRecipe};
pub use reuse::{can_reuse, hash_file};
pub use runner::{PhaseOutcome, PhaseRequest, PhaseRunner};
