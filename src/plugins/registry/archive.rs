//! Reading single files out of uploaded package archives
//!
//! NuGet packages and Composer dists are zip files; Helm charts are gzipped
//! tarballs. Only the manifest inside (`*.nuspec`, `composer.json`,
//! `Chart.yaml`) is ever needed.

use std::io::{Cursor, Read};

use flate2::read::GzDecoder;
use zip::ZipArchive;

use crate::error::ParseError;

/// Upper bound on an inflated manifest
const MAX_ENTRY_SIZE: u64 = 16 * 1024 * 1024;

fn open_zip(data: &[u8]) -> Result<ZipArchive<Cursor<&[u8]>>, ParseError> {
    ZipArchive::new(Cursor::new(data))
        .map_err(|e| ParseError::InvalidBody(format!("not a zip archive: {}", e)))
}

/// Names of the files in a zip archive
pub fn zip_entries(data: &[u8]) -> Result<Vec<String>, ParseError> {
    let archive = open_zip(data)?;
    Ok(archive.file_names().map(String::from).collect())
}

/// First entry whose name satisfies `matches`, shallowest path first
pub fn zip_find(
    data: &[u8],
    matches: impl Fn(&str) -> bool,
) -> Result<Option<(String, Vec<u8>)>, ParseError> {
    let mut archive = open_zip(data)?;
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| matches(n))
        .map(String::from)
        .collect();
    names.sort_by_key(|n| n.matches('/').count());
    let Some(name) = names.into_iter().next() else {
        return Ok(None);
    };

    let mut file = archive
        .by_name(&name)
        .map_err(|e| ParseError::InvalidBody(format!("corrupt zip entry '{}': {}", name, e)))?;
    if file.size() > MAX_ENTRY_SIZE {
        return Err(ParseError::InvalidBody(format!(
            "archive entry '{}' is too large",
            name
        )));
    }
    let mut out = Vec::with_capacity(file.size() as usize);
    file.by_ref()
        .take(MAX_ENTRY_SIZE)
        .read_to_end(&mut out)
        .map_err(|e| ParseError::InvalidBody(format!("failed to read '{}': {}", name, e)))?;
    Ok(Some((name, out)))
}

/// Read the first file of a `.tar.gz` whose path satisfies `matches`
pub fn targz_find(
    data: &[u8],
    matches: impl Fn(&str) -> bool,
) -> Result<Option<(String, Vec<u8>)>, ParseError> {
    let mut archive = tar::Archive::new(GzDecoder::new(data));
    let entries = archive
        .entries()
        .map_err(|e| ParseError::InvalidBody(format!("not a gzipped tarball: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| ParseError::InvalidBody(format!("corrupt tarball: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| ParseError::InvalidBody(e.to_string()))?
            .to_string_lossy()
            .into_owned();
        if matches(&path) {
            let mut out = Vec::new();
            (&mut entry)
                .take(MAX_ENTRY_SIZE)
                .read_to_end(&mut out)
                .map_err(|e| ParseError::InvalidBody(e.to_string()))?;
            return Ok(Some((path, out)));
        }
    }
    Ok(None)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Builders for small archives used by plugin tests

    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;

    /// A zip holding the given files, deflated
    pub fn zip(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buffer = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buffer));
            let options = zip::write::FileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);
            for (name, content) in files {
                zip.start_file(*name, options).unwrap();
                zip.write_all(content).unwrap();
            }
            zip.finish().unwrap();
        }
        buffer
    }

    /// A gzipped tarball holding the given files
    pub fn targz(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }
}
