//! Pipeline definitions and the prompt wrapper that asks a model to write them.
//!
//! The model is reached through [`PipelineModel`]; this module only builds the
//! prompt, pulls YAML out of the reply, and checks and normalises it.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, OnceLock},
};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{errors::Error, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<PipelineStep>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineStep {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub with: BTreeMap<String, serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl PipelineDefinition {
    /// Structural checks serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Pipeline("pipeline name is empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(Error::Pipeline("pipeline has no steps".to_string()));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for (idx, step) in self.steps.iter().enumerate() {
            let name = step.name.trim();
            if name.is_empty() {
                return Err(Error::Pipeline(format!("step #{} has no name", idx + 1)));
            }

            match (&step.run, &step.uses) {
                (Some(_), None) | (None, Some(_)) => {}
                (Some(_), Some(_)) => {
                    return Err(Error::Pipeline(format!(
                        "step `{name}` sets both `run` and `uses`"
                    )))
                }
                (None, None) => {
                    return Err(Error::Pipeline(format!(
                        "step `{name}` needs `run` or `uses`"
                    )))
                }
            }

            for dep in &step.depends_on {
                if !seen.contains(dep.trim()) {
                    return Err(Error::Pipeline(format!(
                        "step `{name}` depends on `{dep}`, which is not an earlier step"
                    )));
                }
            }

            if !seen.insert(name) {
                return Err(Error::Pipeline(format!("duplicate step name `{name}`")));
            }
        }
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Deserialize and check a pipeline document.
pub fn parse_pipeline(yaml: &str) -> Result<PipelineDefinition> {
    let def: PipelineDefinition = serde_yaml::from_str(yaml)?;
    def.validate()?;
    Ok(def)
}

const GENERATION_RULES: &str = r#"You write CI pipeline definitions in YAML.
Reply with exactly one ```yaml fenced block and nothing else.

Schema:
name: <string, required>
description: <string, optional>
steps:                      # at least one
  - name: <unique string>
    run: <shell command>     # exactly one of run / uses
    uses: <action reference>
    with: {<key>: <value>}   # optional, only with uses
    depends_on: [<earlier step names>]   # optional

Rules:
- Do not invent keys outside the schema.
- Never include secrets or tokens; reference them as ${{ secrets.NAME }}.
- Keep commands non-interactive."#;

/// Prompt asking the model for a pipeline matching `request`.
pub fn build_generation_prompt(request: &str) -> String {
    format!(
        "{GENERATION_RULES}\n\n<request>\n{}\n</request>",
        request.trim()
    )
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:ya?ml)?[ \t]*\r?\n(.*?)```").expect("valid regex")
    })
}

/// Pull the YAML document out of a model reply.
///
/// Prefers the first fenced block; falls back to the bare reply when it
/// already looks like a pipeline.
pub fn extract_yaml(response: &str) -> Option<String> {
    if let Some(body) = fence_re()
        .captures(response)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
    {
        return Some(body.to_string());
    }

    let trimmed = response.trim();
    let looks_like_pipeline = trimmed.starts_with("name:")
        || trimmed.starts_with("steps:")
        || trimmed.contains("\nsteps:");
    looks_like_pipeline.then(|| trimmed.to_string())
}

/// Text-completion backend used to draft pipelines.
#[async_trait]
pub trait PipelineModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct GeneratedPipeline {
    pub definition: PipelineDefinition,
    /// Normalised YAML, re-serialised from `definition`.
    pub yaml: String,
}

pub struct PipelineGenerator {
    model: Arc<dyn PipelineModel>,
}

impl PipelineGenerator {
    pub fn new(model: Arc<dyn PipelineModel>) -> Self {
        Self { model }
    }

    pub async fn generate(&self, request: &str) -> Result<GeneratedPipeline> {
        if request.trim().is_empty() {
            return Err(Error::Pipeline("pipeline request is empty".to_string()));
        }

        let prompt = build_generation_prompt(request);
        let response = self.model.complete(&prompt).await?;
        let raw = extract_yaml(&response)
            .ok_or_else(|| Error::Pipeline("model reply contained no YAML".to_string()))?;
        let definition = parse_pipeline(&raw)?;
        let yaml = definition.to_yaml()?;

        tracing::debug!(
            pipeline = %definition.name,
            steps = definition.steps.len(),
            "generated pipeline"
        );
        Ok(GeneratedPipeline { definition, yaml })
    }
}
