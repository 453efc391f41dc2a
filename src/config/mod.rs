// src/config/mod.rs
pub mod composite;
pub mod engine;

pub use composite::{
    CompositeScoreConfig, InvalidScorePolicy, MissingPerspectivePolicy, ModelPerspective,
    SelectionStrategy,
};
pub use engine::EngineConfig;
