use std::collections::BTreeMap;
use std::fs;
use std::fs::{File, create_dir_all};
use std::io::Error;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;

pub fn delete_file_if_exists(file: &Path) -> Result<(), Error> {
    if !file.exists() {
        return Ok(());
    }

    fs::remove_file(file)
}

pub fn workspace_directory<X, S, P>(working_root_dir: X, execution_id: S, dir_name: P) -> Result<PathBuf, Error>
where
    X: AsRef<Path>,
    S: AsRef<Path>,
    P: AsRef<Path>,
{
    let dir = working_root_dir
        .as_ref()
        .join(".lambda-workspace")
        .join(execution_id)
        .join(dir_name);

    create_dir_all(&dir)?;

    Ok(dir)
}

/// Writes a reproducible tar.gz over the given relative-path -> content map.
/// Entries are emitted in map order (sorted), with zeroed mtimes and fixed
/// modes, so identical inputs produce byte-identical archives. Returns the
/// archive size in bytes.
pub fn create_context_archive(files: &BTreeMap<String, String>, dest: &Path) -> Result<u64, Error> {
    let tgz_file = File::create(dest)?;
    let enc = GzEncoder::new(tgz_file, Compression::default());
    let mut tar = tar::Builder::new(enc);

    for (relative_path, content) in files {
        let bytes = content.as_bytes();
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        tar.append_data(&mut header, relative_path, bytes)?;
    }

    let enc = tar.into_inner()?;
    enc.finish()?;

    Ok(fs::metadata(dest)?.len())
}
