//! Packages one episode's post-processed text, final text and audio into a ZIP
//! with an embedded manifest.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::CompressionMethod;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::args::ExportArgs;
use crate::error::PipelineError;
use crate::events::{Event, emit};
use crate::lang::Language;
use crate::manifest::{MANIFEST_FILE, Manifest, ManifestEntry, ManifestSource};
use crate::paths::{PathResolver, Stage, episode_number, resolve_topic_dir};

#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub topic: String,
    pub lang: Language,
    pub episode: String,
    pub postprocess_root: PathBuf,
    pub final_root: PathBuf,
    pub tts_root: PathBuf,
    pub export_root: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportReport {
    pub zip_path: PathBuf,
    pub manifest: Manifest,
}

/// Episode dir under `<root>/<topic>/<lang>`: the name as given, then
/// `episode_<n>` spellings used by the final-text stage.
fn find_episode_dir(root: &Path, topic: &str, lang: Language, episode: &str) -> Option<PathBuf> {
    let lang_dir = resolve_topic_dir(root, topic).join(lang.code());
    let n = episode_number(episode);
    let mut candidates = vec![episode.to_string()];
    if n > 0 {
        candidates.extend([format!("episode_{n}"), format!("episode_{n:02}"), format!("episode_{n:03}")]);
    }
    candidates.into_iter().map(|c| lang_dir.join(c)).find(|p| p.is_dir())
}

fn source_dirs(req: &ExportRequest) -> Vec<(&'static str, PathBuf)> {
    [("postprocess", &req.postprocess_root), ("final", &req.final_root), ("tts", &req.tts_root)]
        .into_iter()
        .filter_map(|(prefix, root)| match find_episode_dir(root, &req.topic, req.lang, &req.episode) {
            Some(dir) => Some((prefix, dir)),
            None => {
                debug!("no {} output for {}/{}/{}", prefix, req.topic, req.lang, req.episode);
                None
            }
        })
        .collect()
}

pub fn export_episode(req: &ExportRequest) -> Result<ExportReport> {
    let sources = source_dirs(req);
    let mut files: Vec<(String, PathBuf)> = Vec::new();
    for (prefix, dir) in &sources {
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.with_context(|| format!("walking {}", dir.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
            let name = format!("{prefix}/{}", rel.to_string_lossy().replace('\\', "/"));
            files.push((name, entry.into_path()));
        }
    }
    if files.is_empty() {
        return Err(PipelineError::Validation(format!(
            "nothing to export for {}/{}/{}",
            req.topic, req.lang, req.episode
        ))
        .into());
    }

    let out_dir = req.export_root.join(&req.topic).join(req.lang.code());
    fs::create_dir_all(&out_dir).with_context(|| format!("creating {}", out_dir.display()))?;
    let zip_path = out_dir.join(format!("{}.zip", req.episode));
    let file = File::create(&zip_path).with_context(|| format!("creating {}", zip_path.display()))?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut entries = Vec::with_capacity(files.len());
    for (name, path) in &files {
        entries.push(ManifestEntry::from_file(path, name)?);
        zip.start_file(name.as_str(), options)?;
        let mut src = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        io::copy(&mut src, &mut zip)?;
    }
    let source = ManifestSource {
        topic: req.topic.clone(),
        lang: req.lang.code().to_string(),
        episode: req.episode.clone(),
    };
    let manifest = Manifest::new(source, entries);
    zip.start_file(MANIFEST_FILE, options)?;
    zip.write_all(manifest.to_json()?.as_bytes())?;
    zip.finish()?;

    info!("exported {} files from {} source(s) to {}", files.len(), sources.len(), zip_path.display());
    Ok(ExportReport { zip_path, manifest })
}

pub fn run(args: &ExportArgs) -> Result<()> {
    emit(Event::phase("start"));
    let req = ExportRequest {
        topic: args.topic.clone(),
        lang: args.language,
        episode: args.episode.clone(),
        postprocess_root: args.postprocess_root.clone().unwrap_or_else(|| PathResolver::root(Stage::Postprocess)),
        final_root: args.final_root.clone().unwrap_or_else(|| PathResolver::outputs_base().join("final")),
        tts_root: args.tts_root.clone().unwrap_or_else(|| PathResolver::root(Stage::Tts)),
        export_root: args.export_root.clone().unwrap_or_else(|| PathResolver::root(Stage::Export)),
    };
    emit(Event::phase("packaging"));
    let report = export_episode(&req)?;
    emit(Event::OutputPath { value: report.zip_path.display().to_string() });
    emit(Event::Done);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;
    use zip::ZipArchive;

    fn request(root: &Path) -> ExportRequest {
        ExportRequest {
            topic: "Husité".into(),
            lang: Language::Cs,
            episode: "ep01".into(),
            postprocess_root: root.join("postprocess"),
            final_root: root.join("final"),
            tts_root: root.join("tts"),
            export_root: root.join("export"),
        }
    }

    #[test]
    fn packages_available_sources_with_manifest() {
        let tmp = TempDir::new().unwrap();
        let req = request(tmp.path());
        let post = req.postprocess_root.join("Husité").join("CS").join("ep01");
        fs::create_dir_all(&post).unwrap();
        fs::write(post.join("episode_merged.txt"), "Text.").unwrap();
        let fin = req.final_root.join("Husité").join("CS").join("episode_01");
        fs::create_dir_all(&fin).unwrap();
        fs::write(fin.join("episode_01_final.txt"), "Final.").unwrap();

        let report = export_episode(&req).unwrap();
        assert_eq!(report.zip_path, req.export_root.join("Husité").join("CS").join("ep01.zip"));
        let paths: Vec<&str> = report.manifest.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["postprocess/episode_merged.txt", "final/episode_01_final.txt"]);

        let mut archive = ZipArchive::new(File::open(&report.zip_path).unwrap()).unwrap();
        assert_eq!(archive.len(), 3);
        let mut body = String::new();
        archive.by_name("postprocess/episode_merged.txt").unwrap().read_to_string(&mut body).unwrap();
        assert_eq!(body, "Text.");
        let mut raw = String::new();
        archive.by_name(MANIFEST_FILE).unwrap().read_to_string(&mut raw).unwrap();
        let manifest: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(manifest["source"]["lang"], "CS");
        assert_eq!(manifest["files"][1]["size"], 6);
    }

    #[test]
    fn nothing_found_is_a_validation_error() {
        let tmp = TempDir::new().unwrap();
        let err = export_episode(&request(tmp.path())).unwrap_err();
        assert!(matches!(err.downcast_ref::<PipelineError>(), Some(PipelineError::Validation(_))));
    }
}
