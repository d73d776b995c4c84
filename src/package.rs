//! Builds the model artifact: pretrained weights in diffusers layout, the
//! serving entry point under `code/`, gzip-compressed into one tarball.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use hf_hub::api::tokio::Api;
use hf_hub::{Repo, RepoType};
use tracing::{debug, info};

use crate::config::{PackageConfig, StorageConfig};
use crate::storage::{ObjectStore, S3Location};

const MODEL_INDEX: &str = "model_index.json";

/// Repository files the pipeline needs: the index, plus configs, vocabularies
/// and the requested weight variant of each component.
pub fn select_files<'a>(
    config: &PackageConfig,
    files: impl IntoIterator<Item = &'a str>,
) -> Vec<String> {
    let weights_suffix = format!(".{}.safetensors", config.weight_variant);
    files
        .into_iter()
        .filter(|file| {
            if *file == MODEL_INDEX {
                return true;
            }
            let Some((component, name)) = file.split_once('/') else {
                return false;
            };
            config.components.iter().any(|c| c == component)
                && (name.ends_with(".json") || name.ends_with(".txt") || name.ends_with(&weights_suffix))
        })
        .map(String::from)
        .collect()
}

/// Writes `source` as a gzip-compressed tarball with paths relative to `source`.
pub fn build_archive(source: &Path, archive: &Path) -> Result<()> {
    if let Some(parent) = archive.parent() {
        fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file = File::create(archive).with_context(|| format!("failed to create {}", archive.display()))?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    append_tree(&mut builder, source, Path::new(""))?;
    builder
        .into_inner()
        .and_then(GzEncoder::finish)
        .with_context(|| format!("failed to finish {}", archive.display()))?;
    Ok(())
}

fn append_tree<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    dir: &Path,
    relative: &Path,
) -> Result<()> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.display()))?
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("failed to list {}", dir.display()))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let name = relative.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            builder
                .append_dir(&name, &path)
                .with_context(|| format!("failed to archive {}", path.display()))?;
            append_tree(builder, &path, &name)?;
        } else {
            builder
                .append_path_with_name(&path, &name)
                .with_context(|| format!("failed to archive {}", path.display()))?;
        }
    }
    Ok(())
}

pub struct Packager<S> {
    store: S,
    api: Api,
    storage: StorageConfig,
    config: PackageConfig,
}

impl<S: ObjectStore> Packager<S> {
    pub fn new(store: S, api: Api, storage: StorageConfig, config: PackageConfig) -> Self {
        Self {
            store,
            api,
            storage,
            config,
        }
    }

    /// Download, stage, archive, upload. Only the download is skipped when
    /// already done; the upload always overwrites.
    pub async fn run(&self) -> Result<S3Location> {
        self.download_model().await?;
        self.stage_entry_point()?;

        let source = self.config.model_dir.clone();
        let archive = self.config.archive_path.clone();
        tokio::task::spawn_blocking(move || build_archive(&source, &archive))
            .await
            .context("archive task panicked")??;
        info!("Created archive {}", self.config.archive_path.display());

        let location = self.storage.model_location();
        self.store
            .upload_file(&self.config.archive_path, &location)
            .await
            .with_context(|| format!("failed to upload {}", self.config.archive_path.display()))?;
        info!("Model artifact uploaded to {location}");
        Ok(location)
    }

    /// Fetches the pipeline into `model_dir` unless it is already there.
    pub async fn download_model(&self) -> Result<()> {
        let model_dir = &self.config.model_dir;
        if model_dir.exists() {
            info!("Model already present at {}, skipping download", model_dir.display());
            return Ok(());
        }

        let staging = model_dir.with_extension("partial");
        if staging.exists() {
            fs::remove_dir_all(&staging)
                .with_context(|| format!("failed to clear {}", staging.display()))?;
        }

        let repo = match &self.config.revision {
            Some(revision) => self.api.repo(Repo::with_revision(
                self.config.model_id.clone(),
                RepoType::Model,
                revision.clone(),
            )),
            None => self.api.model(self.config.model_id.clone()),
        };
        let info = repo
            .info()
            .await
            .with_context(|| format!("failed to list {}", self.config.model_id))?;
        let files = select_files(&self.config, info.siblings.iter().map(|s| s.rfilename.as_str()));
        info!("Downloading {} files from {}", files.len(), self.config.model_id);

        for file in &files {
            let cached = repo
                .get(file)
                .await
                .with_context(|| format!("failed to download {file}"))?;
            copy_into(&cached, &staging.join(file))?;
        }

        for extra in &self.config.extra_files {
            let cached = self
                .api
                .model(extra.repo.clone())
                .get(&extra.file)
                .await
                .with_context(|| format!("failed to download {} from {}", extra.file, extra.repo))?;
            copy_into(&cached, &staging.join(&extra.destination))?;
        }

        fs::rename(&staging, model_dir)
            .with_context(|| format!("failed to move model into {}", model_dir.display()))?;
        info!("Model saved to {}", model_dir.display());
        Ok(())
    }

    /// Copies the serving binary to `<model_dir>/code/`.
    pub fn stage_entry_point(&self) -> Result<PathBuf> {
        let entry_point = &self.config.entry_point;
        let file_name = entry_point
            .file_name()
            .ok_or_else(|| anyhow!("entry point {} has no file name", entry_point.display()))?;
        let target = self.config.model_dir.join("code").join(file_name);
        copy_into(entry_point, &target)?;
        info!("Copied {} to {}", entry_point.display(), target.display());
        Ok(target)
    }
}

fn copy_into(source: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::copy(source, target)
        .with_context(|| format!("failed to copy {} to {}", source.display(), target.display()))?;
    debug!(path = %target.display(), "staged");
    Ok(())
}
