pub mod dimension;
pub mod loader;
pub mod metric;
pub mod registry;

pub use dimension::*;
pub use loader::*;
pub use metric::*;
pub use registry::*;
