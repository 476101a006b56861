//! `facegate setup` and `facegate verify-models`: fetch the face-api.js
//! weights and keep their checksums in `manifest.toml`.

use anyhow::{Context, Result};
use facegate_models::{Manifest, ModelFile, MODELS};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

fn resolve(model_dir: Option<PathBuf>) -> PathBuf {
    model_dir.unwrap_or_else(facegate_models::default_model_dir)
}

/// Download a single model file with progress output. Returns its SHA-256.
fn download_model(model: &ModelFile, dest: &Path) -> Result<String> {
    let tmp_path = dest.with_file_name(format!("{}.part", model.name));
    let url = model.url();

    println!("  downloading {} ({})...", model.name, model.size_display);

    let resp = ureq::get(&url)
        .call()
        .with_context(|| format!("failed to download {url}"))?;

    let content_length = resp
        .headers()
        .get("Content-Length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let mut reader = resp.into_body().into_reader();
    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;

    let mut buf = [0u8; 65536];
    let mut total: u64 = 0;
    let mut last_pct: u64 = 0;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
        total += n as u64;

        if let Some(len) = content_length.filter(|l| *l > 0) {
            let pct = (total * 100) / len;
            if pct / 10 > last_pct / 10 {
                print!("  {pct}%\r");
                io::stdout().flush().ok();
                last_pct = pct;
            }
        }
    }

    file.flush()?;
    drop(file);

    let digest = facegate_models::sha256_file_hex(&tmp_path)?;

    fs::rename(&tmp_path, dest).with_context(|| {
        format!(
            "failed to rename {} -> {}",
            tmp_path.display(),
            dest.display()
        )
    })?;

    println!("  {} sha256 {digest}", model.name);
    Ok(digest)
}

/// Run the setup command: download missing weights and record checksums.
pub fn run(model_dir: Option<PathBuf>) -> Result<()> {
    let dir = resolve(model_dir);

    println!("Model directory: {}", dir.display());

    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;

    let mut manifest = Manifest::load(&dir).unwrap_or_default();
    let mut downloaded = 0;
    let mut skipped = 0;

    for model in MODELS {
        let dest = dir.join(model.name);
        if let Some(entry) = manifest.entry(model.name) {
            match facegate_models::verify_file_sha256(model.name, &dest, &entry.sha256) {
                Ok(()) => {
                    println!("  {} already present (checksum ok)", model.name);
                    skipped += 1;
                    continue;
                }
                Err(e) => println!("  {e} - re-downloading"),
            }
        }

        let digest = download_model(model, &dest)?;
        manifest.record(model.name, digest);
        downloaded += 1;
    }

    manifest.save(&dir)?;

    println!();
    if downloaded > 0 {
        println!("Setup complete: {downloaded} model(s) downloaded, {skipped} already present.");
    } else {
        println!("All models already present. Nothing to download.");
    }

    Ok(())
}

/// Check the model directory against its manifest.
pub fn verify(model_dir: Option<PathBuf>) -> Result<()> {
    let dir = resolve(model_dir);
    facegate_models::verify_models_dir(&dir)
        .with_context(|| format!("model directory {} failed verification", dir.display()))?;
    println!("{}: {} model(s) ok", dir.display(), MODELS.len());
    Ok(())
}
