//! Chromium driver for retrace: a pooled engine per browser kind and one
//! isolated browser context per recording session.

pub mod backend;
pub mod cdp;
mod inject;

pub use backend::{ChromiumBinding, ChromiumLauncher};
