//! Small self-contained helpers shared by several modules.

pub mod fatal;
