pub mod applier;
pub mod branch;
pub mod config;
pub mod engine;
pub mod gate;
pub mod generate;
pub mod llm;
pub mod merge;
pub mod message;
pub mod orchestrator;
pub mod persona;
pub mod store;
pub mod timer;
pub mod tree;
pub mod turn;
pub mod update;
pub mod wire;
