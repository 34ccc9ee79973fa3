//! Split large CSV files into smaller header-prefixed chunk files.
//!
//! Splitting is line based: each input line after the header is one record.
//! Quoted fields containing newlines are not supported.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info, warn};

/// Result of splitting one file
#[derive(Debug, Clone, Default)]
pub struct SplitSummary {
    pub output_dir: PathBuf,
    pub files: Vec<PathBuf>,
    pub data_lines: u64,
}

/// Default output directory for `dir/name.csv`: `dir/name_chunks`
pub fn default_output_dir(input: &Path) -> PathBuf {
    let stem = file_stem(input);
    input
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .join(format!("{}_chunks", stem))
}

/// Name of the chunk file at 1-based `index`: `name_part0001.csv`
pub fn chunk_file_name(input: &Path, index: usize) -> String {
    format!("{}_part{:04}.csv", file_stem(input), index)
}

fn file_stem(input: &Path) -> String {
    input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string())
}

/// Split a CSV file into chunk files of at most `max_records` data lines.
///
/// Lines are streamed, so the input never has to fit in memory. The output
/// directory is only created once there is a data line to write.
pub async fn split_csv_file(
    input: &Path,
    max_records: usize,
    output_dir: Option<&Path>,
) -> Result<SplitSummary> {
    if max_records == 0 {
        anyhow::bail!("Max records per chunk must be a positive integer");
    }

    if !tokio::fs::try_exists(input).await.unwrap_or(false) {
        anyhow::bail!("Input file not found: {}", input.display());
    }

    let output_dir = output_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_output_dir(input));
    let mut summary = SplitSummary {
        output_dir: output_dir.clone(),
        ..Default::default()
    };

    let file = File::open(input)
        .await
        .with_context(|| format!("Failed to open {}", input.display()))?;
    let mut lines = BufReader::new(file).lines();

    let Some(header) = lines.next_line().await? else {
        warn!("{} is empty, nothing to split", input.display());
        return Ok(summary);
    };
    let header = header.strip_prefix('\u{feff}').unwrap_or(&header).to_string();

    let mut writer: Option<BufWriter<File>> = None;
    let mut lines_in_chunk = 0usize;

    while let Some(line) = lines.next_line().await? {
        if writer.is_none() {
            if summary.files.is_empty() {
                tokio::fs::create_dir_all(&output_dir)
                    .await
                    .with_context(|| {
                        format!("Failed to create output directory {}", output_dir.display())
                    })?;
            }
            let path = output_dir.join(chunk_file_name(input, summary.files.len() + 1));
            let file = File::create(&path)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?;
            let mut w = BufWriter::new(file);
            w.write_all(header.as_bytes()).await?;
            w.write_all(b"\n").await?;
            debug!("writing {}", path.display());
            summary.files.push(path);
            writer = Some(w);
        }

        if let Some(w) = writer.as_mut() {
            w.write_all(line.as_bytes()).await?;
            w.write_all(b"\n").await?;
        }
        lines_in_chunk += 1;
        summary.data_lines += 1;

        if lines_in_chunk == max_records
            && let Some(mut w) = writer.take()
        {
            w.flush().await?;
            lines_in_chunk = 0;
        }
    }

    if let Some(mut w) = writer.take() {
        w.flush().await?;
    }

    if summary.files.is_empty() {
        warn!("{} has a header but no data lines", input.display());
    } else {
        info!(
            "Split {} data lines from {} into {} files in {}",
            summary.data_lines,
            input.display(),
            summary.files.len(),
            output_dir.display()
        );
    }

    Ok(summary)
}
