//! Answer generation with optional post-processing stages.
//!
//! A request produces a draft answer from the question, the retrieved
//! context, and recent conversation. Enabled stages then refine the draft in
//! a fixed order:
//!
//! | Stage | Effect |
//! |-------|--------|
//! | [`Stage::ChainOfThought`] | step-by-step reasoning, answer re-derived |
//! | [`Stage::TreeOfThought`] | several approaches compared, best kept |
//! | [`Stage::ConsistencyValidation`] | draft checked against the context |
//!
//! Each stage maps `(draft, context) -> draft`. A failing stage leaves the
//! draft as it was and records a [`StageWarning`]. The draft call itself
//! falls back once from [`ModelProfile::Enhanced`] to [`ModelProfile::Base`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ReasoningConfig;
use crate::error::{ModelCallError, Result, WeavrError};
use crate::params::GenerationParams;

/// Marker separating a stage's reasoning from its answer.
pub const ANSWER_MARKER: &str = "=== ANSWER ===";

/// Reply that keeps the draft during consistency validation.
pub const CONSISTENT: &str = "CONSISTENT";

const SYSTEM_PROMPT: &str = "You are a helpful assistant that answers questions using the \
provided knowledge base context. Use only facts from the context. If the context does not \
contain the answer, say that the knowledge base has no relevant information.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ChainOfThought,
    TreeOfThought,
    ConsistencyValidation,
}

impl Stage {
    /// Execution order.
    pub const ORDER: [Stage; 3] = [
        Stage::ChainOfThought,
        Stage::TreeOfThought,
        Stage::ConsistencyValidation,
    ];

    pub fn position(self) -> usize {
        match self {
            Stage::ChainOfThought => 0,
            Stage::TreeOfThought => 1,
            Stage::ConsistencyValidation => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::ChainOfThought => "chain_of_thought",
            Stage::TreeOfThought => "tree_of_thought",
            Stage::ConsistencyValidation => "consistency_validation",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request stage toggles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageMask([bool; 3]);

impl StageMask {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_stages(stages: &[Stage]) -> Self {
        let mut mask = Self::none();
        for stage in stages {
            mask.set(*stage, true);
        }
        mask
    }

    pub fn with(mut self, stage: Stage) -> Self {
        self.set(stage, true);
        self
    }

    pub fn set(&mut self, stage: Stage, enabled: bool) {
        self.0[stage.position()] = enabled;
    }

    pub fn is_enabled(&self, stage: Stage) -> bool {
        self.0[stage.position()]
    }

    pub fn any(&self) -> bool {
        self.0.iter().any(|b| *b)
    }

    /// Enabled stages in execution order.
    pub fn enabled(&self) -> Vec<Stage> {
        Stage::ORDER
            .into_iter()
            .filter(|s| self.is_enabled(*s))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelProfile {
    Base,
    Enhanced,
}

impl fmt::Display for ModelProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelProfile::Base => f.write_str("base"),
            ModelProfile::Enhanced => f.write_str("enhanced"),
        }
    }
}

/// One call to the text-completion service.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub profile: ModelProfile,
    pub system: String,
    pub prompt: String,
    pub params: GenerationParams,
}

/// An external text-completion service.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> std::result::Result<String, ModelCallError>;
}

/// A stage that failed and was skipped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageWarning {
    pub stage: Stage,
    pub reason: String,
}

impl fmt::Display for StageWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} skipped: {}", self.stage, self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub text: String,
    pub profile: ModelProfile,
    /// True when the enhanced profile failed and the base profile answered.
    pub degraded: bool,
    pub stages_applied: Vec<Stage>,
    pub warnings: Vec<StageWarning>,
}

/// Inputs for one answer.
#[derive(Debug, Clone)]
pub struct ReasoningRequest<'a> {
    pub question: &'a str,
    pub context: &'a str,
    /// Rendered conversation history, if any.
    pub history: Option<&'a str>,
    pub stages: StageMask,
    pub params: GenerationParams,
}

pub struct ReasoningPipeline {
    model: Arc<dyn LanguageModel>,
    stages: Vec<Stage>,
    tot_branches: usize,
    timeout: Duration,
}

impl ReasoningPipeline {
    pub fn new(model: Arc<dyn LanguageModel>, config: &ReasoningConfig, timeout: Duration) -> Self {
        Self {
            model,
            stages: config.stages.clone(),
            tot_branches: config.tot_branches,
            timeout,
        }
    }

    /// Stages this pipeline can run, in execution order.
    pub fn available_stages(&self) -> &[Stage] {
        &self.stages
    }

    pub async fn run(&self, request: ReasoningRequest<'_>, cancel: &CancellationToken) -> Result<Answer> {
        let params = request.params.validate()?;
        if cancel.is_cancelled() {
            return Err(WeavrError::Cancelled);
        }

        let active: Vec<Stage> = self
            .stages
            .iter()
            .copied()
            .filter(|s| request.stages.is_enabled(*s))
            .collect();
        let mut profile = if active.is_empty() {
            ModelProfile::Base
        } else {
            ModelProfile::Enhanced
        };
        let mut degraded = false;

        let draft_prompt = draft_prompt(&request);
        let mut draft = match self.call(profile, &draft_prompt, params, cancel).await {
            Ok(text) => text,
            Err(WeavrError::ModelCall(e)) if profile == ModelProfile::Enhanced => {
                warn!(error = %e, "enhanced model failed; falling back to base");
                profile = ModelProfile::Base;
                degraded = true;
                self.call(profile, &draft_prompt, params, cancel).await?
            }
            Err(e) => return Err(e),
        };

        let mut stages_applied = Vec::new();
        let mut warnings = Vec::new();
        for stage in active {
            let prompt = self.stage_prompt(stage, request.question, request.context, &draft);
            match self.call(profile, &prompt, params, cancel).await {
                Ok(reply) => match apply_stage_reply(stage, &draft, &reply) {
                    Some(next) => {
                        draft = next;
                        stages_applied.push(stage);
                    }
                    None => {
                        warn!(%stage, "stage reply had no usable answer; keeping draft");
                        warnings.push(StageWarning {
                            stage,
                            reason: "empty or unparseable reply".to_string(),
                        });
                    }
                },
                Err(WeavrError::Cancelled) => return Err(WeavrError::Cancelled),
                Err(e) => {
                    warn!(%stage, error = %e, "stage failed; keeping draft");
                    warnings.push(StageWarning {
                        stage,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(Answer {
            text: draft,
            profile,
            degraded,
            stages_applied,
            warnings,
        })
    }

    async fn call(
        &self,
        profile: ModelProfile,
        prompt: &str,
        params: GenerationParams,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let request = CompletionRequest {
            profile,
            system: SYSTEM_PROMPT.to_string(),
            prompt: prompt.to_string(),
            params,
        };
        debug!(%profile, prompt_len = prompt.len(), "model call");

        let reply = tokio::select! {
            _ = cancel.cancelled() => return Err(WeavrError::Cancelled),
            r = tokio::time::timeout(self.timeout, self.model.complete(&request)) => r,
        };
        let text = reply.map_err(|_| ModelCallError::Timeout(self.timeout))??;
        let text = text.trim();
        if text.is_empty() {
            return Err(ModelCallError::InvalidResponse("empty completion".to_string()).into());
        }
        Ok(text.to_string())
    }

    fn stage_prompt(&self, stage: Stage, question: &str, context: &str, draft: &str) -> String {
        match stage {
            Stage::ChainOfThought => format!(
                "Context:\n{context}\n\nQuestion: {question}\n\nDraft answer:\n{draft}\n\n\
                 Reason step by step about the question using only the context, numbering each \
                 step. Then write the improved final answer after a line containing exactly \
                 {ANSWER_MARKER}"
            ),
            Stage::TreeOfThought => format!(
                "Context:\n{context}\n\nQuestion: {question}\n\nDraft answer:\n{draft}\n\n\
                 Consider {} distinct approaches to answering the question. Evaluate each \
                 against the context and choose the strongest. Then write the final answer \
                 after a line containing exactly {ANSWER_MARKER}",
                self.tot_branches
            ),
            Stage::ConsistencyValidation => format!(
                "Context:\n{context}\n\nQuestion: {question}\n\nAnswer to check:\n{draft}\n\n\
                 Check every claim in the answer against the context. If the answer is fully \
                 supported, reply with the single word {CONSISTENT}. Otherwise write a corrected \
                 answer after a line containing exactly {ANSWER_MARKER}"
            ),
        }
    }
}

fn draft_prompt(request: &ReasoningRequest<'_>) -> String {
    let mut prompt = String::new();
    if let Some(history) = request.history {
        prompt.push_str(history);
        prompt.push_str("\n\n");
    }
    if !request.context.is_empty() {
        prompt.push_str("Context:\n");
        prompt.push_str(request.context);
        prompt.push_str("\n\n");
    }
    prompt.push_str("Question: ");
    prompt.push_str(request.question);
    prompt
}

/// New draft from a stage reply, or `None` when the reply is unusable.
fn apply_stage_reply(stage: Stage, draft: &str, reply: &str) -> Option<String> {
    if stage == Stage::ConsistencyValidation
        && reply.trim().trim_end_matches('.').eq_ignore_ascii_case(CONSISTENT)
    {
        return Some(draft.to_string());
    }
    extract_answer(reply)
}

/// Text after the answer marker, or the whole reply when there is none.
///
/// The marker is matched case-insensitively, ignoring spaces around `ANSWER`.
pub fn extract_answer(reply: &str) -> Option<String> {
    let mut after_marker: Option<Vec<&str>> = None;
    for line in reply.lines() {
        if let Some(lines) = after_marker.as_mut() {
            lines.push(line);
        } else if is_marker(line) {
            after_marker = Some(Vec::new());
        }
    }

    let answer = match after_marker {
        Some(lines) => lines.join("\n"),
        None => reply.to_string(),
    };
    let answer = answer.split("[/INST]").next().unwrap_or_default().trim();
    if answer.is_empty() {
        None
    } else {
        Some(answer.to_string())
    }
}

fn is_marker(line: &str) -> bool {
    let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
    compact.eq_ignore_ascii_case("===ANSWER===")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replies in order; records every request.
    struct ScriptedModel {
        replies: Mutex<VecDeque<std::result::Result<String, ModelCallError>>>,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<std::result::Result<&str, ModelCallError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|r| r.map(str::to_string))
                        .collect(),
                ),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn profiles(&self) -> Vec<ModelProfile> {
            self.seen.lock().unwrap().iter().map(|r| r.profile).collect()
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(
            &self,
            request: &CompletionRequest,
        ) -> std::result::Result<String, ModelCallError> {
            self.seen.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ModelCallError::Network("script exhausted".into())))
        }
    }

    /// Never answers.
    struct StalledModel;

    #[async_trait]
    impl LanguageModel for StalledModel {
        async fn complete(
            &self,
            _request: &CompletionRequest,
        ) -> std::result::Result<String, ModelCallError> {
            std::future::pending().await
        }
    }

    fn pipeline(model: Arc<dyn LanguageModel>) -> ReasoningPipeline {
        ReasoningPipeline::new(model, &ReasoningConfig::default(), Duration::from_secs(5))
    }

    fn request(stages: StageMask) -> ReasoningRequest<'static> {
        ReasoningRequest {
            question: "What was decided?",
            context: "## notes.md\nThe budget was approved.",
            history: None,
            stages,
            params: GenerationParams::default(),
        }
    }

    fn http_500() -> ModelCallError {
        ModelCallError::Http {
            status: 500,
            body: "boom".into(),
        }
    }

    #[test]
    fn test_stage_order_and_mask() {
        let mask = StageMask::none()
            .with(Stage::ConsistencyValidation)
            .with(Stage::ChainOfThought);
        assert_eq!(
            mask.enabled(),
            vec![Stage::ChainOfThought, Stage::ConsistencyValidation]
        );
        assert!(!StageMask::none().any());
        assert_eq!(Stage::TreeOfThought.to_string(), "tree_of_thought");
    }

    #[test]
    fn test_extract_answer() {
        let reply = "1. Budget mentioned\n2. Approved\n=== ANSWER ===\nThe budget was approved.";
        assert_eq!(extract_answer(reply).as_deref(), Some("The budget was approved."));
        assert_eq!(
            extract_answer("reasoning\n===  answer  ===\nYes.\n[/INST]").as_deref(),
            Some("Yes.")
        );
        assert_eq!(extract_answer("Plain reply").as_deref(), Some("Plain reply"));
        assert_eq!(extract_answer("steps\n=== ANSWER ===\n   "), None);
        assert_eq!(extract_answer("   "), None);
    }

    #[tokio::test]
    async fn test_no_stages_uses_base_profile() {
        let model = ScriptedModel::new(vec![Ok("The budget was approved.")]);
        let answer = pipeline(model.clone())
            .run(request(StageMask::none()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(answer.profile, ModelProfile::Base);
        assert!(!answer.degraded);
        assert!(answer.stages_applied.is_empty());
        assert_eq!(model.profiles(), vec![ModelProfile::Base]);

        let prompt = &model.seen.lock().unwrap()[0].prompt;
        assert!(prompt.contains("The budget was approved."));
        assert!(prompt.contains("Question: What was decided?"));
    }

    #[tokio::test]
    async fn test_stages_refine_draft_in_order() {
        let model = ScriptedModel::new(vec![
            Ok("draft"),
            Ok("1. think\n=== ANSWER ===\ncot answer"),
            Ok("approach A vs B\n=== ANSWER ===\ntot answer"),
            Ok("CONSISTENT"),
        ]);
        let mask = StageMask::from_stages(&Stage::ORDER);
        let answer = pipeline(model.clone())
            .run(request(mask), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(answer.text, "tot answer");
        assert_eq!(answer.profile, ModelProfile::Enhanced);
        assert_eq!(answer.stages_applied, Stage::ORDER.to_vec());
        assert!(answer.warnings.is_empty());

        let seen = model.seen.lock().unwrap();
        assert!(seen[2].prompt.contains("cot answer"));
        assert!(seen[2].prompt.contains("3 distinct approaches"));
        assert!(seen[3].prompt.contains("tot answer"));
    }

    #[tokio::test]
    async fn test_stage_failure_passes_draft_through() {
        let model = ScriptedModel::new(vec![
            Ok("draft answer"),
            Err(http_500()),
            Ok("=== ANSWER ===\n"),
        ]);
        let mask = StageMask::none()
            .with(Stage::ChainOfThought)
            .with(Stage::TreeOfThought);
        let answer = pipeline(model)
            .run(request(mask), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(answer.text, "draft answer");
        assert!(answer.stages_applied.is_empty());
        assert_eq!(answer.warnings.len(), 2);
        assert_eq!(answer.warnings[0].stage, Stage::ChainOfThought);
        assert_eq!(answer.warnings[1].stage, Stage::TreeOfThought);
    }

    #[tokio::test]
    async fn test_consistency_correction_replaces_draft() {
        let model = ScriptedModel::new(vec![
            Ok("The budget was rejected."),
            Ok("Claim contradicts context.\n=== ANSWER ===\nThe budget was approved."),
        ]);
        let mask = StageMask::none().with(Stage::ConsistencyValidation);
        let answer = pipeline(model)
            .run(request(mask), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(answer.text, "The budget was approved.");
        assert_eq!(answer.stages_applied, vec![Stage::ConsistencyValidation]);
    }

    #[tokio::test]
    async fn test_enhanced_failure_falls_back_to_base() {
        let model = ScriptedModel::new(vec![Err(http_500()), Ok("base draft"), Ok("CONSISTENT")]);
        let mask = StageMask::none().with(Stage::ConsistencyValidation);
        let answer = pipeline(model.clone())
            .run(request(mask), &CancellationToken::new())
            .await
            .unwrap();
        assert!(answer.degraded);
        assert_eq!(answer.profile, ModelProfile::Base);
        assert_eq!(answer.text, "base draft");
        assert_eq!(
            model.profiles(),
            vec![ModelProfile::Enhanced, ModelProfile::Base, ModelProfile::Base]
        );
    }

    #[tokio::test]
    async fn test_double_failure_is_hard_error() {
        let model = ScriptedModel::new(vec![Err(http_500()), Err(http_500())]);
        let mask = StageMask::none().with(Stage::ChainOfThought);
        let err = pipeline(model)
            .run(request(mask), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WeavrError::ModelCall(ModelCallError::Http { status: 500, .. })));
    }

    #[tokio::test]
    async fn test_base_failure_has_no_fallback() {
        let model = ScriptedModel::new(vec![Err(http_500()), Ok("never used")]);
        let err = pipeline(model.clone())
            .run(request(StageMask::none()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WeavrError::ModelCall(_)));
        assert_eq!(model.profiles().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_params_rejected_before_any_call() {
        let model = ScriptedModel::new(vec![Ok("unused")]);
        let mut req = request(StageMask::none());
        req.params = GenerationParams {
            temperature: 1.5,
            max_tokens: 0,
            top_p: None,
        };
        let err = pipeline(model.clone())
            .run(req, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            WeavrError::InvalidParameters(v) => assert_eq!(v.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
        assert!(model.profiles().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_is_model_call_error() {
        let p = ReasoningPipeline::new(
            Arc::new(StalledModel),
            &ReasoningConfig::default(),
            Duration::from_millis(20),
        );
        let err = p
            .run(request(StageMask::none()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WeavrError::ModelCall(ModelCallError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let p = pipeline(Arc::new(StalledModel));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = p.run(request(StageMask::none()), &cancel).await.unwrap_err();
        assert!(matches!(err, WeavrError::Cancelled));
    }
}
