pub mod compile;
pub mod config;
pub mod delta;
pub mod dimension;
pub mod document;
pub mod engine;
pub mod error;
pub mod expr;
pub mod group;
pub mod operator;
pub mod pipeline;
pub mod plan;
pub mod query;
pub mod store;
pub mod value;

pub use compile::CacheStats;
pub use config::EngineConfig;
pub use delta::{Delta, RowKey, Sign};
pub use document::RowId;
pub use engine::Engine;
pub use error::{Error, Result};
pub use plan::{ComplexityClass, PlanId, PlanInfo};
