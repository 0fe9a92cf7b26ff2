//! Selector healing: fallback generation and runtime re-resolution.

pub mod resolver;
pub mod strategies;

pub use resolver::{
    BindingProbe, FALLBACK_CONFIDENCE, HealingPolicy, HealingResult, LocatorProbe,
    PRIMARY_CONFIDENCE, ProbeError, heal_with_retries, resolve,
};
pub use strategies::generate_fallbacks;
