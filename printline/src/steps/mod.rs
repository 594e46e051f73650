//! Declarative step descriptors and the registry that orders them.
//!
//! Steps are data: a [`StepDefinition`] names its host, inputs, outputs and
//! retry policy, and [`StepRegistry`] checks that every step only consumes
//! values that exist by the time it runs.

mod definition;
mod registry;
mod retry;
mod template;

pub use definition::{OutputSource, StepAction, StepDefinition};
pub use registry::{default_pipeline, StepRegistry, RUN_VARIABLES};
pub use retry::{Backoff, BackoffStrategy, JitterStrategy};
pub use template::{placeholders, render, TemplateVars};
