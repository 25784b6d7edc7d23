pub mod artifacts;
pub mod chunk;
pub mod coordinator;
pub mod dictionary;
pub mod engine;
pub mod queue;
pub mod segment;
pub mod worker;
