pub mod api;
pub mod backend;
pub mod codegen;
pub mod config;
pub mod healing;
pub mod notify;
pub mod replay;
pub mod store;

pub use retrace_common::error;
pub use retrace_common::event;
pub use retrace_common::protocol;
