//! Appending files to the artifact archive

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;

use tracing::{debug, warn};

use crate::error::BuildResult;

/// Last component of a container path, `/home/dev/out/` -> `out`
pub fn last_component(path: &str) -> String {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Add `files` to the tar archive at `archive` under `prefix/`
///
/// The archive is rewritten through a temporary file so an interrupted
/// append leaves the original intact. A missing archive is created; files
/// that don't exist are skipped with a warning.
pub fn append_to_archive(archive: &Path, files: &[&Path], prefix: &str) -> BuildResult<()> {
    let tmp = archive.with_extension("tar.tmp");
    let mut builder = tar::Builder::new(BufWriter::new(File::create(&tmp)?));
    builder.follow_symlinks(false);

    if archive.exists() {
        let mut existing = tar::Archive::new(BufReader::new(File::open(archive)?));
        for entry in existing.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();
            let mut header = entry.header().clone();
            builder.append_data(&mut header, &path, &mut entry)?;
        }
    }

    let prefix = prefix.trim_matches('/');
    for file in files {
        let Some(name) = file.file_name() else {
            continue;
        };
        if !file.is_file() {
            warn!("Not adding {} to the archive: no such file", file.display());
            continue;
        }
        let name_in_archive = if prefix.is_empty() {
            Path::new(name).to_path_buf()
        } else {
            Path::new(prefix).join(name)
        };
        debug!("Adding {} as {}", file.display(), name_in_archive.display());
        builder.append_path_with_name(file, &name_in_archive)?;
    }

    let writer = builder.into_inner()?;
    writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    fs::rename(&tmp, archive)?;
    Ok(())
}
