use std::fmt;

use serde::{Deserialize, Serialize};

/// What a stage does within a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Single-shot generation of the finished article.
    Article,
    Outline,
    Draft,
    SeoOptimize,
    Edit,
}

impl StageKind {
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Article => "article",
            StageKind::Outline => "outline",
            StageKind::Draft => "draft",
            StageKind::SeoOptimize => "seo_optimize",
            StageKind::Edit => "edit",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Cost and latency class of a stage, one per model tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    /// Fast and cheap, used for structural passes.
    Haiku,
    #[default]
    Sonnet,
    /// Most capable and most expensive.
    Opus,
}

impl ModelTier {
    /// Map the tier to the Anthropic API model identifier.
    pub fn api_model(&self) -> &'static str {
        match self {
            ModelTier::Haiku => "claude-haiku-4-5-20251001",
            ModelTier::Sonnet => "claude-sonnet-4-5-20250929",
            ModelTier::Opus => "claude-opus-4-6",
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelTier::Haiku => write!(f, "haiku"),
            ModelTier::Sonnet => write!(f, "sonnet"),
            ModelTier::Opus => write!(f, "opus"),
        }
    }
}

/// Static description of one stage. Never mutated at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub kind: StageKind,
    /// Prior stages whose output this stage consumes.
    pub requires: Vec<StageKind>,
    pub tier: ModelTier,
    pub max_tokens: u32,
}

impl StageSpec {
    pub fn new(kind: StageKind, tier: ModelTier) -> Self {
        Self {
            kind,
            requires: Vec::new(),
            tier,
            max_tokens: 4096,
        }
    }

    pub fn requiring(mut self, kinds: &[StageKind]) -> Self {
        self.requires = kinds.to_vec();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_tier_mapping() {
        assert_eq!(ModelTier::Haiku.api_model(), "claude-haiku-4-5-20251001");
        assert_eq!(ModelTier::Sonnet.api_model(), "claude-sonnet-4-5-20250929");
        assert_eq!(ModelTier::Opus.api_model(), "claude-opus-4-6");
    }

    #[test]
    fn stage_kind_serializes_snake_case() {
        let json = serde_json::to_string(&StageKind::SeoOptimize).unwrap();
        assert_eq!(json, r#""seo_optimize""#);
        assert_eq!(StageKind::SeoOptimize.to_string(), "seo_optimize");
    }

    #[test]
    fn builder_sets_requirements() {
        let spec = StageSpec::new(StageKind::Draft, ModelTier::Sonnet)
            .requiring(&[StageKind::Outline])
            .with_max_tokens(8000);
        assert_eq!(spec.requires, vec![StageKind::Outline]);
        assert_eq!(spec.max_tokens, 8000);
        assert_eq!(spec.name(), "draft");
    }
}
