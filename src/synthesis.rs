//! Answer synthesis: context assembly, generation, confidence, citations.
//!
//! The [`Synthesizer`] turns retrieved chunks into a grounded answer:
//! chunks are tagged with their source document and page, truncated
//! lowest-ranked-first to the context budget, and sent to the generation
//! provider with the content-safety policy. Transient provider errors are
//! retried with backoff; a safety refusal becomes a degraded answer, not
//! an error. With zero retrieved context the provider is never invoked —
//! the caller gets a fixed insufficient-context answer at confidence 0.
//!
//! Confidence scoring is pluggable via [`ConfidenceModel`];
//! [`WeightedConfidence`] is the default, combining mean similarity of
//! the chunks actually used with a structural signal that forces hedging
//! answers toward the low end.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::SynthesisConfig;
use crate::error::Result;
use crate::generation::{GenerationProvider, Reply, SafetyConfig};
use crate::models::{Answer, RetrievalResult, SourceCitation};
use crate::resilience::CircuitBreaker;

/// Fixed answer used when no context clears the similarity threshold.
pub const INSUFFICIENT_CONTEXT_ANSWER: &str =
    "I could not find relevant information in the uploaded documents to answer this question. \
     Please try rephrasing, or upload documents that cover this topic.";

/// Degraded answer used when the provider refuses under its safety policy.
const SAFETY_REFUSAL_ANSWER: &str =
    "I cannot provide a response to this query due to content-safety considerations. \
     Please try rephrasing your question.";

/// Phrases that mark an answer as admitting it lacks grounding. Matching
/// is lowercase substring; the list is deliberately conservative.
const HEDGING_PHRASES: &[&str] = &[
    "not enough information",
    "insufficient context",
    "insufficient information",
    "no relevant information",
    "do not have enough",
    "don't have enough",
    "cannot answer",
    "unable to find",
    "unable to answer",
];

/// Scores a synthesized answer in `[0, 1]`.
pub trait ConfidenceModel: Send + Sync {
    fn score(&self, answer: &str, used: &[RetrievalResult]) -> f32;
}

/// Default scorer: `similarity_weight · mean_similarity +
/// structure_weight · structural`, clamped to `[0, 1]`, with hedging
/// answers capped at `hedge_cap` regardless of retrieval quality.
pub struct WeightedConfidence {
    similarity_weight: f32,
    structure_weight: f32,
    hedge_cap: f32,
}

impl WeightedConfidence {
    pub fn new(config: &SynthesisConfig) -> Self {
        Self {
            similarity_weight: config.similarity_weight,
            structure_weight: config.structure_weight,
            hedge_cap: config.hedge_cap,
        }
    }
}

impl ConfidenceModel for WeightedConfidence {
    fn score(&self, answer: &str, used: &[RetrievalResult]) -> f32 {
        if used.is_empty() {
            return 0.0;
        }

        let mean_similarity =
            used.iter().map(|r| r.similarity).sum::<f32>() / used.len() as f32;
        let hedged = is_hedging(answer);
        let structural = if hedged || answer.trim().is_empty() {
            0.0
        } else {
            1.0
        };

        let mut score = self.similarity_weight * mean_similarity.clamp(0.0, 1.0)
            + self.structure_weight * structural;
        if hedged {
            score = score.min(self.hedge_cap);
        }
        score.clamp(0.0, 1.0)
    }
}

/// Whether the answer admits it lacks grounding.
pub fn is_hedging(answer: &str) -> bool {
    let lower = answer.to_lowercase();
    HEDGING_PHRASES.iter().any(|p| lower.contains(p))
}

pub struct Synthesizer {
    provider: Arc<dyn GenerationProvider>,
    breaker: Arc<CircuitBreaker>,
    config: SynthesisConfig,
    safety: SafetyConfig,
    scorer: Arc<dyn ConfidenceModel>,
    max_retries: u32,
}

impl Synthesizer {
    pub fn new(
        provider: Arc<dyn GenerationProvider>,
        breaker: Arc<CircuitBreaker>,
        config: SynthesisConfig,
        max_retries: u32,
    ) -> Self {
        let scorer = Arc::new(WeightedConfidence::new(&config));
        Self {
            provider,
            breaker,
            config,
            safety: SafetyConfig::default(),
            scorer,
            max_retries,
        }
    }

    /// Swap in a custom confidence scorer.
    pub fn with_scorer(mut self, scorer: Arc<dyn ConfidenceModel>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Synthesize an answer from retrieved context.
    ///
    /// `processing_time` on the returned [`Answer`] is left at zero; the
    /// pipeline stamps the end-to-end elapsed time.
    pub async fn synthesize(&self, query: &str, context: &[RetrievalResult]) -> Result<Answer> {
        if context.is_empty() {
            debug!("no context retrieved, skipping generation");
            return Ok(Answer {
                answer: INSUFFICIENT_CONTEXT_ANSWER.to_string(),
                sources: Vec::new(),
                confidence: 0.0,
                processing_time: 0.0,
            });
        }

        let used = self.fit_to_budget(context);
        let prompt = build_prompt(query, &build_context(used));

        let reply = self.generate_with_retry(&prompt).await?;
        let (answer_text, confidence) = match reply {
            Reply::Text(text) => {
                let confidence = self.scorer.score(&text, used).clamp(0.0, 1.0);
                (text, confidence)
            }
            Reply::Refusal => {
                warn!("generation provider refused under safety policy");
                (SAFETY_REFUSAL_ANSWER.to_string(), 0.0)
            }
        };

        Ok(Answer {
            answer: answer_text,
            sources: citations(used, self.config.max_sources),
            confidence,
            processing_time: 0.0,
        })
    }

    /// Chunks that fit the context budget, dropped lowest-ranked first.
    /// The top-ranked chunk is always kept.
    fn fit_to_budget<'a>(&self, context: &'a [RetrievalResult]) -> &'a [RetrievalResult] {
        let mut total = 0usize;
        let mut keep = 0usize;
        for result in context {
            let block = result.text.len() + result.document_name.len() + 64;
            if keep > 0 && total + block > self.config.max_context_chars {
                break;
            }
            total += block;
            keep += 1;
        }
        &context[..keep]
    }

    async fn generate_with_retry(&self, prompt: &str) -> Result<Reply> {
        let mut attempt: u32 = 0;

        loop {
            self.breaker.try_acquire()?;

            match self.provider.generate(prompt, &self.safety).await {
                Ok(reply) => {
                    self.breaker.record_success();
                    return Ok(reply);
                }
                Err(e) => {
                    self.breaker.record_failure();
                    if e.is_transient() && attempt < self.max_retries {
                        attempt += 1;
                        let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                        warn!(
                            attempt,
                            delay_secs = delay.as_secs(),
                            error = %e,
                            "transient generation failure, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Tag each chunk with its provenance and relevance.
fn build_context(results: &[RetrievalResult]) -> String {
    let mut parts = Vec::with_capacity(results.len());
    for result in results {
        let page = result
            .page_number
            .map(|p| format!(" (page {})", p))
            .unwrap_or_default();
        parts.push(format!(
            "[Source: {}{} — relevance {:.0}%]\n{}",
            result.document_name,
            page,
            result.similarity * 100.0,
            result.text.trim()
        ));
    }
    parts.join("\n\n")
}

fn build_prompt(query: &str, context: &str) -> String {
    format!(
        "You are a research assistant answering questions from a corpus of uploaded documents.\n\
         \n\
         CONTEXT DOCUMENTS:\n\
         {context}\n\
         \n\
         QUESTION:\n\
         {query}\n\
         \n\
         INSTRUCTIONS:\n\
         1. Base your answer ONLY on the context documents above. Do not add outside knowledge.\n\
         2. Organize the answer with short headers and bullet points where it helps.\n\
         3. Mention the source documents you relied on, without formal citation markup.\n\
         4. If the context does not contain the answer, say that you do not have enough information.\n\
         \n\
         ANSWER:"
    )
}

fn citations(used: &[RetrievalResult], max_sources: usize) -> Vec<SourceCitation> {
    used.iter()
        .take(max_sources)
        .map(|r| SourceCitation {
            document_name: r.document_name.clone(),
            page_number: r.page_number,
            similarity: r.similarity,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CannedGenerator {
        reply: Reply,
        calls: AtomicUsize,
    }

    impl CannedGenerator {
        fn text(text: &str) -> Self {
            Self {
                reply: Reply::Text(text.to_string()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl GenerationProvider for CannedGenerator {
        fn model_name(&self) -> &str {
            "canned"
        }
        async fn generate(&self, _prompt: &str, _safety: &SafetyConfig) -> Result<Reply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
    }

    fn result(name: &str, page: i64, similarity: f32, text: &str) -> RetrievalResult {
        RetrievalResult {
            chunk_id: format!("{name}-{page}"),
            document_id: name.to_string(),
            text: text.to_string(),
            similarity,
            document_name: name.to_string(),
            page_number: Some(page),
            chunk_index: page - 1,
        }
    }

    fn synthesizer(provider: Arc<dyn GenerationProvider>) -> Synthesizer {
        let breaker = Arc::new(CircuitBreaker::new(
            "generation",
            5,
            Duration::from_secs(600),
        ));
        Synthesizer::new(provider, breaker, SynthesisConfig::default(), 0)
    }

    #[tokio::test]
    async fn zero_context_skips_generation() {
        let provider = Arc::new(CannedGenerator::text("should not be called"));
        let synth = synthesizer(provider.clone());

        let answer = synth.synthesize("anything?", &[]).await.unwrap();
        assert_eq!(answer.answer, INSUFFICIENT_CONTEXT_ANSWER);
        assert!(answer.sources.is_empty());
        assert_eq!(answer.confidence, 0.0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn citations_are_limited_to_top_sources() {
        let provider = Arc::new(CannedGenerator::text("A grounded answer."));
        let synth = synthesizer(provider);

        let context: Vec<RetrievalResult> = (0..6)
            .map(|i| result("report.pdf", i + 1, 0.9 - i as f32 * 0.05, "Some content."))
            .collect();
        let answer = synth.synthesize("question?", &context).await.unwrap();

        assert_eq!(answer.sources.len(), SynthesisConfig::default().max_sources);
        assert_eq!(answer.sources[0].page_number, Some(1));
        assert!(answer.confidence > 0.0 && answer.confidence <= 1.0);
    }

    #[tokio::test]
    async fn refusal_becomes_degraded_answer() {
        let provider = Arc::new(CannedGenerator {
            reply: Reply::Refusal,
            calls: AtomicUsize::new(0),
        });
        let synth = synthesizer(provider);

        let context = vec![result("doc.pdf", 1, 0.9, "Content.")];
        let answer = synth.synthesize("question?", &context).await.unwrap();
        assert_eq!(answer.answer, SAFETY_REFUSAL_ANSWER);
        assert_eq!(answer.confidence, 0.0);
    }

    #[tokio::test]
    async fn hedging_answer_is_capped_low() {
        let provider = Arc::new(CannedGenerator::text(
            "I do not have enough information to answer this.",
        ));
        let synth = synthesizer(provider);

        let context = vec![result("doc.pdf", 1, 0.95, "Highly relevant content.")];
        let answer = synth.synthesize("question?", &context).await.unwrap();
        assert!(answer.confidence <= SynthesisConfig::default().hedge_cap);
    }

    #[tokio::test]
    async fn budget_drops_lowest_ranked_first() {
        let provider = Arc::new(CannedGenerator::text("Answer."));
        let breaker = Arc::new(CircuitBreaker::new(
            "generation",
            5,
            Duration::from_secs(600),
        ));
        let config = SynthesisConfig {
            max_context_chars: 300,
            ..SynthesisConfig::default()
        };
        let synth = Synthesizer::new(provider, breaker, config, 0);

        let context = vec![
            result("a.pdf", 1, 0.9, &"x".repeat(200)),
            result("b.pdf", 1, 0.8, &"y".repeat(200)),
            result("c.pdf", 1, 0.7, &"z".repeat(200)),
        ];
        let answer = synth.synthesize("question?", &context).await.unwrap();
        // Only the top chunk fits the budget; citations follow usage.
        assert_eq!(answer.sources.len(), 1);
        assert_eq!(answer.sources[0].document_name, "a.pdf");
    }

    #[test]
    fn confidence_is_always_in_unit_range() {
        let scorer = WeightedConfidence::new(&SynthesisConfig::default());
        let high = vec![result("d.pdf", 1, 1.0, "t")];
        let low = vec![result("d.pdf", 1, -1.0, "t")];

        for (answer, used) in [
            ("A detailed answer.", &high),
            ("A detailed answer.", &low),
            ("insufficient context here", &high),
            ("", &high),
        ] {
            let score = scorer.score(answer, used);
            assert!((0.0..=1.0).contains(&score), "score {score} out of range");
        }
        assert_eq!(scorer.score("anything", &[]), 0.0);
    }

    #[test]
    fn hedging_detection_is_case_insensitive() {
        assert!(is_hedging("I DO NOT HAVE ENOUGH information."));
        assert!(is_hedging("The context is insufficient context for this."));
        assert!(!is_hedging("Alberta reduced taxes by 10%."));
    }
}
