/// Fetch the sentence-transformer model files from HuggingFace.
///
/// Files already on disk are kept; only missing ones are downloaded.
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

const HF_BASE: &str = "https://huggingface.co/sentence-transformers/all-MiniLM-L6-v2/resolve/main";

/// Local filename and path under [`HF_BASE`].
const MODEL_FILES: &[(&str, &str)] = &[
    ("model.onnx", "onnx/model.onnx"),
    ("tokenizer.json", "tokenizer.json"),
    ("config.json", "config.json"),
];

#[must_use]
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("models/all-MiniLM-L6-v2")
}

/// Whether every required model file exists in `model_dir`.
#[must_use]
pub fn all_files_present(model_dir: &Path) -> bool {
    MODEL_FILES
        .iter()
        .all(|(name, _)| model_dir.join(name).exists())
}

/// Download whatever model files are missing from `model_dir`, creating the
/// directory first.
pub fn download_model_files(model_dir: &Path) -> Result<()> {
    fs::create_dir_all(model_dir)
        .with_context(|| format!("failed to create models directory: {}", model_dir.display()))?;

    if all_files_present(model_dir) {
        info!("Model files present in {}", model_dir.display());
        return Ok(());
    }

    info!("Downloading all-MiniLM-L6-v2 (~90MB, one time)");

    for &(filename, url_path) in MODEL_FILES {
        let dest = model_dir.join(filename);
        if dest.exists() {
            continue;
        }

        let url = format!("{HF_BASE}/{url_path}");
        info!("Downloading {filename}");
        download_file(&dest, &url).with_context(|| format!("failed to download {filename}"))?;
    }

    info!("Model download complete");
    Ok(())
}

/// Stream `url` into `dest`. A partial file is removed on failure so the
/// next run retries it.
fn download_file(dest: &Path, url: &str) -> Result<()> {
    let mut resp =
        reqwest::blocking::get(url).with_context(|| format!("HTTP request failed: {url}"))?;

    if !resp.status().is_success() {
        anyhow::bail!("bad status: {} for {url}", resp.status());
    }

    let pb = match resp.content_length() {
        Some(total) if total > 0 => {
            let pb = ProgressBar::new(total);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("  {bar:40.cyan/blue} {percent}% ({bytes}/{total_bytes}) {msg}")
                    .context("invalid progress template")?
                    .progress_chars("█▓░"),
            );
            pb
        }
        _ => ProgressBar::new_spinner(),
    };

    let partial = dest.with_extension("part");
    let result = (|| -> Result<()> {
        let mut file = fs::File::create(&partial)
            .with_context(|| format!("failed to create file: {}", partial.display()))?;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = resp.read(&mut buf).context("failed to read response body")?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).context("failed to write file")?;
            pb.inc(n as u64);
        }
        file.flush().context("failed to flush file")?;
        fs::rename(&partial, dest)
            .with_context(|| format!("failed to move into place: {}", dest.display()))?;
        Ok(())
    })();

    pb.finish_and_clear();
    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result
}
