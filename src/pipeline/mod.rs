mod definition;
mod executor;
mod llm;
mod stage;

pub use definition::{GeneratorType, Pipeline, PipelineRegistry, PipelineStage, default_stages};
pub use executor::{
    PricingTable, Rate, SimulatedExecutor, StageContext, StageExecutor, StageOutput, TokenUsage,
    round_usd,
};
pub use llm::{LlmStageExecutor, build_prompt};
pub use stage::{ModelTier, StageKind, StageSpec};
