use std::path::PathBuf;

use clap::{ArgGroup, Args, Parser, Subcommand};

use crate::builder::{DEFAULT_LENGTH, DEFAULT_SENTENCE_LENGTH, DEFAULT_STYLE};
use crate::lang::Language;
use crate::postprocess::presets::Preset;
use crate::tts::DEFAULT_MAX_CHARS;

#[derive(Parser, Debug)]
#[clap(name = "narration-pipeline", version, about = "Documentary narration pipeline")]
pub struct Cli {
    /// Path to narration.toml
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    /// -v for debug, -vv for trace. RUST_LOG takes precedence.
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate series outlines (osnova.json) per language
    Outline(OutlineArgs),
    /// Render per-segment prompts from an outline
    Prompts(PromptsArgs),
    /// Write narration segments from prompts
    Narrate(NarrateArgs),
    /// Merge narration segments into a final episode text
    Build(BuildArgs),
    /// Clean narration text for speech synthesis
    Postprocess(PostprocessArgs),
    /// Synthesize speech with ElevenLabs
    Tts(TtsArgs),
    /// Package an episode into a ZIP with a manifest
    Export(ExportArgs),
    /// Index the prompts and narration roots
    Index(IndexArgs),
}

#[derive(Args, Debug, Clone)]
pub struct OutlineArgs {
    /// Outline config JSON
    #[clap(long = "outline-config", id = "outline_config", default_value = "config/outline_config.json")]
    pub config: PathBuf,

    #[clap(long)]
    pub template: Option<PathBuf>,

    #[clap(long)]
    pub output: Option<PathBuf>,

    /// Override the configured languages, e.g. CS,EN
    #[clap(long, value_delimiter = ',')]
    pub languages: Vec<Language>,

    #[clap(long)]
    pub sequential: bool,

    #[clap(long)]
    pub no_cache: bool,

    #[clap(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct PromptsArgs {
    #[clap(long)]
    pub topic: String,

    #[clap(long)]
    pub language: Option<Language>,

    #[clap(long)]
    pub outline_root: Option<PathBuf>,

    #[clap(long)]
    pub prompts_root: Option<PathBuf>,

    #[clap(long)]
    pub templates_dir: Option<PathBuf>,

    /// Overwrite existing output
    #[clap(long, short)]
    pub yes: bool,
}

#[derive(Args, Debug, Clone)]
pub struct NarrateArgs {
    #[clap(long)]
    pub topic: Option<String>,

    #[clap(long, default_value = "CS")]
    pub language: Language,

    /// Episode dirs to process, e.g. ep01,ep02
    #[clap(long, value_delimiter = ',')]
    pub episodes: Vec<String>,

    /// Generate a single segment from this prompt file
    #[clap(long)]
    pub prompt_file: Option<PathBuf>,

    #[clap(long)]
    pub retry_failed: bool,

    #[clap(long)]
    pub prompts_root: Option<PathBuf>,

    #[clap(long)]
    pub output_root: Option<PathBuf>,

    #[clap(long)]
    pub no_cache: bool,
}

#[derive(Args, Debug, Clone)]
pub struct BuildArgs {
    #[clap(long, default_value = ".")]
    pub project_root: PathBuf,

    #[clap(long)]
    pub topic_id: String,

    #[clap(long)]
    pub episode_id: String,

    #[clap(long, default_value = "CS")]
    pub lang: Language,

    /// Defaults to GPT_MODEL, then gpt-5
    #[clap(long)]
    pub model: Option<String>,

    #[clap(long, default_value = DEFAULT_STYLE)]
    pub style: String,

    #[clap(long, default_value = DEFAULT_LENGTH)]
    pub length_words: String,

    #[clap(long, default_value = DEFAULT_SENTENCE_LENGTH)]
    pub sentence_len: String,

    #[clap(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
#[clap(group(ArgGroup::new("input").required(true).args(["input_file", "input_dir"])))]
pub struct PostprocessArgs {
    #[clap(long)]
    pub input_file: Option<PathBuf>,

    #[clap(long)]
    pub input_dir: Option<PathBuf>,

    #[clap(long)]
    pub output_dir: Option<PathBuf>,

    #[clap(long, value_enum, default_value_t = Preset::Default)]
    pub preset: Preset,

    /// JSON rules file
    #[clap(long)]
    pub rules: Option<PathBuf>,

    #[clap(long)]
    pub dry_run: bool,

    #[clap(long)]
    pub concurrency: Option<usize>,

    /// Merge an episode dir into one text
    #[clap(long, requires = "input_dir")]
    pub episode_mode: bool,

    #[clap(long)]
    pub use_gpt: bool,

    #[clap(long)]
    pub no_prefer_existing: bool,

    #[clap(long)]
    pub force_rebuild: bool,

    #[clap(long)]
    pub no_save_merged: bool,
}

#[derive(Args, Debug, Clone)]
pub struct TtsArgs {
    /// Merged or final episode text
    #[clap(long)]
    pub input: PathBuf,

    #[clap(long, default_value = "CS")]
    pub language: Language,

    #[clap(long, default_value = "001")]
    pub episode: String,

    #[clap(long)]
    pub voice_id: Option<String>,

    /// e.g. mp3_44100_128, pcm_44100
    #[clap(long)]
    pub format: Option<String>,

    /// 1-based parts to synthesize, e.g. 1,3
    #[clap(long)]
    pub parts: Option<String>,

    #[clap(long, default_value_t = DEFAULT_MAX_CHARS)]
    pub max_chars: usize,

    #[clap(long)]
    pub output_dir: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    #[clap(long)]
    pub topic: String,

    #[clap(long, default_value = "CS")]
    pub language: Language,

    #[clap(long)]
    pub episode: String,

    #[clap(long)]
    pub postprocess_root: Option<PathBuf>,

    #[clap(long)]
    pub final_root: Option<PathBuf>,

    #[clap(long)]
    pub tts_root: Option<PathBuf>,

    #[clap(long)]
    pub export_root: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct IndexArgs {
    #[clap(long)]
    pub prompts_root: Option<PathBuf>,

    #[clap(long)]
    pub narration_root: Option<PathBuf>,

    /// Limit the prompts scan to these languages
    #[clap(long, value_delimiter = ',')]
    pub languages: Vec<Language>,

    /// Write the index as JSON
    #[clap(long)]
    pub save: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_stage_flags() {
        let cli = Cli::parse_from(["narration-pipeline", "-vv", "narrate", "--topic", "Husité", "--episodes", "ep01,ep02"]);
        assert_eq!(cli.verbose, 2);
        let Command::Narrate(args) = cli.command else { panic!("expected narrate") };
        assert_eq!(args.language, Language::Cs);
        assert_eq!(args.episodes, vec!["ep01", "ep02"]);

        let cli = Cli::parse_from(["narration-pipeline", "postprocess", "--input-dir", "x", "--preset", "aggressive"]);
        let Command::Postprocess(args) = cli.command else { panic!("expected postprocess") };
        assert_eq!(args.preset, Preset::Aggressive);

        let cli = Cli::parse_from(["narration-pipeline", "tts", "--input", "a.txt", "--language", "en"]);
        let Command::Tts(args) = cli.command else { panic!("expected tts") };
        assert_eq!(args.language, Language::En);
        assert_eq!(args.max_chars, DEFAULT_MAX_CHARS);
    }

    #[test]
    fn postprocess_needs_exactly_one_input() {
        assert!(Cli::try_parse_from(["narration-pipeline", "postprocess"]).is_err());
        assert!(
            Cli::try_parse_from(["narration-pipeline", "postprocess", "--input-file", "a", "--input-dir", "b"]).is_err()
        );
        assert!(Cli::try_parse_from(["narration-pipeline", "postprocess", "--input-file", "a", "--episode-mode"]).is_err());
    }
}
