use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::cache::NarrationCache;
use super::text::prefix_chars;
use super::types::{EpisodeContext, GeneratedText, GeneratorConfig, Provenance};
use crate::cache::key_for;
use crate::lang::Language;
use crate::llm::{ChatModel, ChatRequest, LlmError};

// Bump to invalidate cached generations after prompt changes.
const INTRO_PROMPT_VERSION: &str = "v2";
const TRANSITION_PROMPT_VERSION: &str = "v2";

const CONTEXT_WORDS: usize = 150;
const PREVIEW_CHARS: usize = 400;

const POSSESSIVE_RULES: &str = "- NEVER use possessive first-person pronouns:
  * English: \"our\", \"my\", \"ours\"
  * Czech: \"náš\", \"naše\", \"našeho\", \"našem\", \"naší\"
  * German: \"unser\", \"unsere\", \"unserem\"
  * Spanish: \"nuestro\", \"nuestra\", \"nuestros\"
  * French: \"notre\", \"nos\"";

#[derive(Debug, Serialize, Deserialize)]
struct CachedText {
    text: String,
}

fn bullets(items: &[String]) -> String {
    items.iter().map(|i| format!("- {i}")).collect::<Vec<_>>().join("\n")
}

async fn ask(model: &dyn ChatModel, req: ChatRequest) -> Result<String, LlmError> {
    let resp = model.chat(&req).await?;
    let text = resp.text.trim().to_string();
    if text.is_empty() {
        return Err(LlmError::EmptyResponse);
    }
    Ok(text)
}

fn cached_or_none(cache: &NarrationCache, payload: &serde_json::Value) -> Option<GeneratedText> {
    let hit: CachedText = cache.load(payload)?;
    debug!("narration cache hit {}", key_for(payload));
    Some(GeneratedText {
        text: hit.text,
        provenance: Provenance::Gpt,
        prompt_hash: Some(key_for(payload)),
        meta: None,
    })
}

pub fn intro_fallback(lang: Language, episode_title: &str, series_title: &str) -> String {
    match lang {
        Language::Cs => format!("{episode_title} je součástí dokumentárního seriálu {series_title}."),
        Language::De => format!("{episode_title} ist Teil der Dokumentarserie {series_title}."),
        Language::Es => format!("{episode_title} es parte de la serie documental {series_title}."),
        Language::Fr => format!("{episode_title} fait partie de la série documentaire {series_title}."),
        Language::En => format!("{episode_title} is part of the documentary series {series_title}."),
    }
}

pub fn transition_fallback(lang: Language) -> &'static str {
    match lang {
        Language::Cs => "Tato situace přirozeně vedla k dalším událostem.",
        Language::De => "Diese Entwicklung führte natürlich zu weiteren Ereignissen.",
        Language::Es => "Esta situación condujo naturalmente a más acontecimientos.",
        Language::Fr => "Cette situation a naturellement mené à d'autres événements.",
        Language::En => "This situation naturally led to further developments.",
    }
}

fn fallback(text: String, err: &LlmError) -> GeneratedText {
    GeneratedText {
        text,
        provenance: Provenance::Fallback,
        prompt_hash: None,
        meta: Some(json!({ "error": err.to_string() })),
    }
}

pub struct IntroGenerator {
    model: Arc<dyn ChatModel>,
    cfg: GeneratorConfig,
    cache: NarrationCache,
}

impl IntroGenerator {
    pub fn new(model: Arc<dyn ChatModel>, cfg: GeneratorConfig, cache: NarrationCache) -> Self {
        Self { model, cfg, cache }
    }

    fn prompt(&self, ctx: &EpisodeContext) -> String {
        format!(
            "You are an experienced documentary narrator and editor. Create a compelling introduction for a historical documentary episode.

SERIES INFORMATION:
- Title: {series}
- Context:
{context}

EPISODE INFORMATION:
- Episode {idx} of {total}
- Title: {title}
- Description:
{desc}

TASK:
Write a 5-6 sentence introduction in {lang} that:
1. Situates this episode within the overall series
2. Highlights ONLY the main theme of this episode (no details)
3. Creates anticipation for what follows
4. Uses documentary-style, calm, professional narration
5. Is written for text-to-speech (TTS) - clear, flowing sentences

CRITICAL STYLE RULES (MUST FOLLOW):
- Use OBJECTIVE THIRD-PERSON voice throughout
{possessives}
- Refer to the series by name: \"the documentary series {series}\" NOT \"our series\"
- Each sentence MUST be 15-30 words maximum
- Avoid phrases like \"we will see\", \"we will explore\", \"let us examine\"

IMPORTANT:
- Write ONLY the introduction text, nothing else
- No metadata, no labels, no explanations",
            series = ctx.series_title,
            context = bullets(&ctx.series_context),
            idx = ctx.episode_index,
            total = ctx.total_episodes,
            title = ctx.episode_title,
            desc = bullets(&ctx.episode_description),
            lang = ctx.language.english_name(),
            possessives = POSSESSIVE_RULES,
        )
    }

    pub fn payload(ctx: &EpisodeContext) -> serde_json::Value {
        json!({
            "type": "intro",
            "version": INTRO_PROMPT_VERSION,
            "language": ctx.language.code(),
            "series_title": ctx.series_title,
            "episode_title": ctx.episode_title,
            "episode_index": ctx.episode_index,
            "total_episodes": ctx.total_episodes,
            "episode_desc_preview": prefix_chars(&bullets(&ctx.episode_description), 500),
        })
    }

    pub async fn generate(&self, ctx: &EpisodeContext) -> GeneratedText {
        let payload = Self::payload(ctx);
        if let Some(hit) = cached_or_none(&self.cache, &payload) {
            return hit;
        }
        let req = ChatRequest::new(&self.cfg.model)
            .system(
                "You are a professional documentary narrator and editor specializing in historical content. \
                 You always use objective third-person voice and never use possessive pronouns like 'our' or 'my'.",
            )
            .user(self.prompt(ctx))
            .temperature(self.cfg.temperature_intro)
            .max_tokens(self.cfg.max_tokens_intro);
        match ask(self.model.as_ref(), req).await {
            Ok(text) => {
                let key = self.cache.save(&payload, &CachedText { text: text.clone() });
                GeneratedText { text, provenance: Provenance::Gpt, prompt_hash: Some(key), meta: None }
            }
            Err(e) => {
                warn!("intro generation failed, using fallback: {}", e);
                fallback(intro_fallback(ctx.language, &ctx.episode_title, &ctx.series_title), &e)
            }
        }
    }
}

pub struct TransitionGenerator {
    model: Arc<dyn ChatModel>,
    cfg: GeneratorConfig,
    cache: NarrationCache,
}

fn tail_words(text: &str, n: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    words[words.len().saturating_sub(n)..].join(" ")
}

fn head_words(text: &str, n: usize) -> String {
    text.split_whitespace().take(n).collect::<Vec<_>>().join(" ")
}

impl TransitionGenerator {
    pub fn new(model: Arc<dyn ChatModel>, cfg: GeneratorConfig, cache: NarrationCache) -> Self {
        Self { model, cfg, cache }
    }

    pub async fn generate(&self, prev: &str, next: &str, lang: Language) -> GeneratedText {
        let prev_end = tail_words(prev, CONTEXT_WORDS);
        let next_start = head_words(next, CONTEXT_WORDS);
        let payload = json!({
            "type": "transition",
            "version": TRANSITION_PROMPT_VERSION,
            "language": lang.code(),
            "prev_preview": prefix_chars(&prev_end, PREVIEW_CHARS),
            "next_preview": prefix_chars(&next_start, PREVIEW_CHARS),
        });
        if let Some(hit) = cached_or_none(&self.cache, &payload) {
            return hit;
        }

        let prompt = format!(
            "You are an experienced documentary narrator creating smooth transitions between segments.

PREVIOUS SEGMENT (ending):
{prev_end}

NEXT SEGMENT (beginning):
{next_start}

TASK:
Write a 1-2 sentence transition in {lang} that:
1. Smoothly connects the previous topic to the next using at least one concrete anchor (time/entity/keyword) present in the context
2. Maintains chronological and thematic continuity
3. Uses neutral, documentary style
4. Does NOT summarize or remove content
5. Avoids meta phrases and does not add new facts
6. Is written for text-to-speech (TTS)

CRITICAL STYLE RULES (MUST FOLLOW):
- Use OBJECTIVE THIRD-PERSON voice throughout
{possessives}
- Each sentence MUST be 14-28 words maximum
- Avoid phrases like \"we will now turn to\", \"let us examine\"

IMPORTANT:
- Write ONLY the transition text, nothing else
- No metadata, no labels, no explanations",
            lang = lang.english_name(),
            possessives = POSSESSIVE_RULES,
        );
        let req = ChatRequest::new(&self.cfg.model)
            .system(
                "You are a professional documentary narrator specializing in creating smooth narrative transitions. \
                 You always use objective third-person voice.",
            )
            .user(prompt)
            .temperature(self.cfg.temperature_transition)
            .max_tokens(self.cfg.max_tokens_transition);
        match ask(self.model.as_ref(), req).await {
            Ok(text) => {
                let key = self.cache.save(&payload, &CachedText { text: text.clone() });
                GeneratedText { text, provenance: Provenance::Gpt, prompt_hash: Some(key), meta: None }
            }
            Err(e) => {
                warn!("transition generation failed, using fallback: {}", e);
                fallback(transition_fallback(lang).to_string(), &e)
            }
        }
    }
}
