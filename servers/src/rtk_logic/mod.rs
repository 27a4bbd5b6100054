pub mod dashboard;
pub mod options;
pub mod relay;
