pub mod engine;
pub mod relay;
