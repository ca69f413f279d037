//! Container detection and streaming member lookup
//!
//! Everything here is blocking I/O and runs on a blocking worker.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use xz2::read::XzDecoder;

use crate::common::{Error, Result};

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const XZ_MAGIC: &[u8] = &[0xfd, b'7', b'z', b'X', b'Z', 0x00];
const AR_MAGIC: &[u8] = b"!<arch>\n";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const USTAR_OFFSET: usize = 257;

/// Container type of an asset, detected from its leading bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Debian package: `ar` wrapping `data.tar[.gz|.xz]`
    Deb,
    Gzip,
    Xz,
    Tar,
    Zip,
}

impl Format {
    /// Sniff the container type from the first bytes of a file
    pub fn detect(header: &[u8]) -> Option<Self> {
        if header.starts_with(AR_MAGIC) {
            Some(Self::Deb)
        } else if header.starts_with(GZIP_MAGIC) {
            Some(Self::Gzip)
        } else if header.starts_with(XZ_MAGIC) {
            Some(Self::Xz)
        } else if header.starts_with(ZIP_MAGIC) {
            Some(Self::Zip)
        } else if header.len() >= USTAR_OFFSET + 5
            && &header[USTAR_OFFSET..USTAR_OFFSET + 5] == b"ustar"
        {
            Some(Self::Tar)
        } else {
            None
        }
    }

    /// Open `path` and sniff it, leaving the file rewound
    pub fn detect_file(path: &Path) -> Result<(Self, File)> {
        let mut file = File::open(path)?;
        let mut header = Vec::with_capacity(512);
        (&mut file).take(512).read_to_end(&mut header)?;
        file.seek(SeekFrom::Start(0))?;

        let format = Self::detect(&header).ok_or_else(|| {
            Error::UnsupportedFormat(format!(
                "cannot determine container type of {}",
                path.display()
            ))
        })?;
        Ok((format, file))
    }
}

/// Archive paths compare without a leading `./` or `/`
pub fn normalize_member(name: &str) -> &str {
    let mut name = name;
    loop {
        if let Some(rest) = name.strip_prefix("./") {
            name = rest;
        } else if let Some(rest) = name.strip_prefix('/') {
            name = rest;
        } else {
            return name;
        }
    }
}

/// Copy `member` out of the archive at `path` into `out`
///
/// Returns `Ok(false)` if the container was readable but has no such member.
pub fn extract_member(path: &Path, member: &str, out: &mut impl Write) -> Result<bool> {
    let wanted = normalize_member(member);
    let (format, file) = Format::detect_file(path)?;
    tracing::debug!(archive = %path.display(), ?format, member = wanted, "Extracting member");

    let reader = BufReader::new(file);
    match format {
        Format::Deb => extract_from_deb(reader, wanted, out),
        Format::Gzip => extract_from_tar(MultiGzDecoder::new(reader), wanted, out),
        Format::Xz => extract_from_tar(XzDecoder::new_multi_decoder(reader), wanted, out),
        Format::Tar => extract_from_tar(reader, wanted, out),
        Format::Zip => extract_from_zip(path, wanted, out),
    }
}

/// Decompress a gzip or xz file into `out`
///
/// Concatenated members (pigz, `cat a.gz b.gz`) are decoded as one stream.
pub fn uncompress(path: &Path, out: &mut impl Write) -> Result<u64> {
    let (format, file) = Format::detect_file(path)?;
    let reader = BufReader::new(file);
    let copied = match format {
        Format::Gzip => io::copy(&mut MultiGzDecoder::new(reader), out),
        Format::Xz => io::copy(&mut XzDecoder::new_multi_decoder(reader), out),
        other => {
            return Err(Error::UnsupportedFormat(format!(
                "{} is {:?}, not a compressed stream",
                path.display(),
                other
            )))
        }
    };
    copied.map_err(|e| Error::UnsupportedFormat(format!("decompression failed: {}", e)))
}

fn extract_from_deb<R: Read>(reader: R, wanted: &str, out: &mut impl Write) -> Result<bool> {
    let mut archive = ar::Archive::new(reader);
    while let Some(entry) = archive.next_entry() {
        let entry = entry.map_err(|e| Error::UnsupportedFormat(format!("bad ar entry: {}", e)))?;
        let name = String::from_utf8_lossy(entry.header().identifier())
            .trim_end_matches('/')
            .to_string();

        // Only the payload; control.tar holds package metadata
        match name.as_str() {
            "data.tar" => return extract_from_tar(entry, wanted, out),
            "data.tar.gz" => return extract_from_tar(MultiGzDecoder::new(entry), wanted, out),
            "data.tar.xz" => return extract_from_tar(XzDecoder::new_multi_decoder(entry), wanted, out),
            other if other.starts_with("data.tar") => {
                return Err(Error::UnsupportedFormat(format!(
                    "unsupported package payload '{}'",
                    other
                )))
            }
            _ => continue,
        }
    }
    Err(Error::UnsupportedFormat(
        "package has no data.tar payload".to_string(),
    ))
}

fn extract_from_tar<R: Read>(reader: R, wanted: &str, out: &mut impl Write) -> Result<bool> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| Error::UnsupportedFormat(format!("bad tar stream: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| Error::UnsupportedFormat(format!("bad tar entry: {}", e)))?;
        let matches = {
            let path = entry.path()?;
            normalize_member(&path.to_string_lossy()) == wanted
        };
        if matches && entry.header().entry_type().is_file() {
            io::copy(&mut entry, out)?;
            return Ok(true);
        }
    }
    Ok(false)
}

fn extract_from_zip(path: &Path, wanted: &str, out: &mut impl Write) -> Result<bool> {
    let file = File::open(path)?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file))
        .map_err(|e| Error::UnsupportedFormat(format!("failed to open zip: {}", e)))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| Error::UnsupportedFormat(format!("failed to read zip entry: {}", e)))?;
        if entry.is_file() && normalize_member(entry.name()) == wanted {
            io::copy(&mut entry, out)?;
            return Ok(true);
        }
    }
    Ok(false)
}
