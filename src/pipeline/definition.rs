use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::executor::StageExecutor;
use super::stage::{ModelTier, StageKind, StageSpec};
use crate::error::PipelineConfigError;

/// Which pipeline a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GeneratorType {
    /// One stage producing final content directly.
    SingleAgent,
    /// Outline, draft, SEO pass and edit pass, each feeding the next.
    MultiAgent,
}

impl fmt::Display for GeneratorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeneratorType::SingleAgent => write!(f, "single-agent"),
            GeneratorType::MultiAgent => write!(f, "multi-agent"),
        }
    }
}

/// The built-in stage list for a generator type.
pub fn default_stages(generator_type: GeneratorType) -> Vec<StageSpec> {
    match generator_type {
        GeneratorType::SingleAgent => {
            vec![StageSpec::new(StageKind::Article, ModelTier::Sonnet).with_max_tokens(8192)]
        }
        GeneratorType::MultiAgent => vec![
            StageSpec::new(StageKind::Outline, ModelTier::Haiku).with_max_tokens(1024),
            StageSpec::new(StageKind::Draft, ModelTier::Sonnet)
                .requiring(&[StageKind::Outline])
                .with_max_tokens(8192),
            StageSpec::new(StageKind::SeoOptimize, ModelTier::Haiku)
                .requiring(&[StageKind::Draft])
                .with_max_tokens(8192),
            StageSpec::new(StageKind::Edit, ModelTier::Sonnet)
                .requiring(&[StageKind::SeoOptimize])
                .with_max_tokens(8192),
        ],
    }
}

/// A stage bound to the executor that runs it.
///
/// The executor is chosen when the pipeline is defined, so nothing at run
/// time dispatches on provider names.
#[derive(Clone)]
pub struct PipelineStage {
    pub spec: StageSpec,
    pub executor: Arc<dyn StageExecutor>,
}

/// An ordered, non-empty list of stages for one generator type.
#[derive(Clone)]
pub struct Pipeline {
    generator_type: GeneratorType,
    stages: Vec<PipelineStage>,
}

impl Pipeline {
    /// Validate and build a pipeline.
    ///
    /// Fails when there are no stages or when a stage requires the output of
    /// a stage that does not run before it.
    pub fn new(
        generator_type: GeneratorType,
        stages: Vec<PipelineStage>,
    ) -> Result<Self, PipelineConfigError> {
        if stages.is_empty() {
            return Err(PipelineConfigError::NoStages(generator_type));
        }
        for (i, stage) in stages.iter().enumerate() {
            for required in &stage.spec.requires {
                let available = stages[..i].iter().any(|s| s.spec.kind == *required);
                if !available {
                    return Err(PipelineConfigError::MissingInput {
                        stage: stage.spec.name().to_string(),
                        required: required.name().to_string(),
                    });
                }
            }
        }
        Ok(Self {
            generator_type,
            stages,
        })
    }

    /// Bind every spec to the same executor.
    pub fn from_specs(
        generator_type: GeneratorType,
        specs: Vec<StageSpec>,
        executor: Arc<dyn StageExecutor>,
    ) -> Result<Self, PipelineConfigError> {
        let stages = specs
            .into_iter()
            .map(|spec| PipelineStage {
                spec,
                executor: executor.clone(),
            })
            .collect();
        Self::new(generator_type, stages)
    }

    pub fn generator_type(&self) -> GeneratorType {
        self.generator_type
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    pub fn stage(&self, index: usize) -> Option<&PipelineStage> {
        self.stages.get(index)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("generator_type", &self.generator_type)
            .field(
                "stages",
                &self
                    .stages
                    .iter()
                    .map(|s| (s.spec.name(), s.executor.name()))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Pipelines keyed by generator type.
#[derive(Debug, Clone, Default)]
pub struct PipelineRegistry {
    pipelines: HashMap<GeneratorType, Arc<Pipeline>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the built-in pipelines for every generator type.
    pub fn with_defaults(executor: Arc<dyn StageExecutor>) -> Result<Self, PipelineConfigError> {
        let mut registry = Self::new();
        for generator_type in [GeneratorType::SingleAgent, GeneratorType::MultiAgent] {
            registry.register(Pipeline::from_specs(
                generator_type,
                default_stages(generator_type),
                executor.clone(),
            )?);
        }
        Ok(registry)
    }

    pub fn register(&mut self, pipeline: Pipeline) {
        self.pipelines
            .insert(pipeline.generator_type(), Arc::new(pipeline));
    }

    /// Look up the stages for a generator type.
    pub fn stages_for(
        &self,
        generator_type: GeneratorType,
    ) -> Result<Arc<Pipeline>, PipelineConfigError> {
        self.pipelines
            .get(&generator_type)
            .cloned()
            .ok_or(PipelineConfigError::NoStages(generator_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SimulatedExecutor;
    use std::time::Duration;

    fn executor() -> Arc<dyn StageExecutor> {
        Arc::new(SimulatedExecutor::new(Duration::ZERO))
    }

    #[test]
    fn single_agent_has_exactly_one_stage() {
        let registry = PipelineRegistry::with_defaults(executor()).unwrap();
        let pipeline = registry.stages_for(GeneratorType::SingleAgent).unwrap();
        assert_eq!(pipeline.len(), 1);
        assert_eq!(pipeline.stages()[0].spec.kind, StageKind::Article);
    }

    #[test]
    fn multi_agent_stages_chain_in_order() {
        let registry = PipelineRegistry::with_defaults(executor()).unwrap();
        let pipeline = registry.stages_for(GeneratorType::MultiAgent).unwrap();
        let kinds: Vec<StageKind> = pipeline.stages().iter().map(|s| s.spec.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StageKind::Outline,
                StageKind::Draft,
                StageKind::SeoOptimize,
                StageKind::Edit
            ]
        );
        for pair in pipeline.stages().windows(2) {
            assert_eq!(pair[1].spec.requires, vec![pair[0].spec.kind]);
        }
    }

    #[test]
    fn empty_pipeline_is_rejected() {
        let err = Pipeline::new(GeneratorType::MultiAgent, Vec::new()).unwrap_err();
        assert_eq!(err, PipelineConfigError::NoStages(GeneratorType::MultiAgent));
    }

    #[test]
    fn requirement_on_later_stage_is_rejected() {
        let specs = vec![
            StageSpec::new(StageKind::Draft, ModelTier::Sonnet).requiring(&[StageKind::Outline]),
            StageSpec::new(StageKind::Outline, ModelTier::Haiku),
        ];
        let err = Pipeline::from_specs(GeneratorType::MultiAgent, specs, executor()).unwrap_err();
        assert_eq!(
            err,
            PipelineConfigError::MissingInput {
                stage: "draft".into(),
                required: "outline".into()
            }
        );
    }

    #[test]
    fn unregistered_generator_type_is_config_error() {
        let mut registry = PipelineRegistry::new();
        registry.register(
            Pipeline::from_specs(
                GeneratorType::SingleAgent,
                default_stages(GeneratorType::SingleAgent),
                executor(),
            )
            .unwrap(),
        );
        let err = registry.stages_for(GeneratorType::MultiAgent).unwrap_err();
        assert_eq!(err, PipelineConfigError::NoStages(GeneratorType::MultiAgent));
    }

    #[test]
    fn generator_type_wire_format() {
        let json = serde_json::to_string(&GeneratorType::MultiAgent).unwrap();
        assert_eq!(json, r#""multi-agent""#);
        let parsed: GeneratorType = serde_json::from_str(r#""single-agent""#).unwrap();
        assert_eq!(parsed, GeneratorType::SingleAgent);
    }
}
