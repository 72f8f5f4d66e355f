// Module definitions for the various component categories

pub mod data_transformation;
pub mod flow_control;
pub mod uuid;

// Re-export common components
pub use data_transformation::*;
pub use flow_control::*;
pub use uuid::*;
