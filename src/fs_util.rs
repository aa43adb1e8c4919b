use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

/// FASTQ outputs written for `accession` directly inside `dir`, i.e. files
/// matching `{accession}*.fastq*`. A match must not continue the accession
/// with another digit, so `SRR1` does not claim `SRR10_1.fastq`.
pub fn run_outputs(dir: &Path, accession: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| is_run_output(name, accession))
                .unwrap_or(false)
        })
        .collect::<Vec<_>>();
    out.sort();
    out
}

fn is_run_output(name: &str, accession: &str) -> bool {
    let Some(rest) = name.strip_prefix(accession) else {
        return false;
    };
    let continues_accession = rest
        .chars()
        .next()
        .map(|ch| ch.is_ascii_digit())
        .unwrap_or(false);
    !continues_accession && rest.contains(".fastq")
}

/// Whether an archive-supplied name can be used as a single local path
/// component and as a tool argument: no separators, no `.`/`..`, and no
/// leading `-`.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.starts_with('-')
        && !name.contains(['/', '\\', '\0'])
}

/// Deletes a partial or rejected artifact. Missing files are not an error.
pub fn remove_artifact(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), "failed to remove artifact: {err}"),
    }
}
