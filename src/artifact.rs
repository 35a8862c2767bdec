//! The maintenance tool image.
//!
//! A maintenance tool is a base executable with a metadata blob appended
//! and a fixed footer at the very end:
//!
//! ```text
//! [base executable bytes][metadata blob][footer]
//!
//! footer (little-endian):
//!   magic_cookie    u64
//!   metadata_offset u64
//!   metadata_length u64
//!   marker          u64   run mode of the tool
//!   crc32           u32   over the metadata blob
//! ```
//!
//! The blob is a sequence of tagged sections, `[tag u32][length u64]
//! [bytes]`. Known tags carry the journal, the package registry, embedded
//! resources and the tool settings; unknown tags are preserved verbatim on
//! rewrite so newer tools can carry data older ones do not understand.

use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::warn;

use crate::context::{AdminRights, RunMode};
use crate::errors::InstallError;
use crate::protocol;
use crate::utils;
use crate::utils::wire::{Reader, Writer};

/// Spells "INSTALLD" when read as bytes.
pub const MAGIC_COOKIE: u64 = u64::from_le_bytes(*b"INSTALLD");

const MARKER_INSTALLER: u64 = 0x7a11_0001;
const MARKER_UNINSTALLER: u64 = 0x7a11_0002;
const MARKER_UPDATER: u64 = 0x7a11_0003;
const MARKER_PACKAGE_MANAGER: u64 = 0x7a11_0004;

pub const TAG_JOURNAL: u32 = 1;
pub const TAG_PACKAGE_REGISTRY: u32 = 2;
pub const TAG_RESOURCES: u32 = 3;
pub const TAG_SETTINGS: u32 = 4;

/// 4 x u64 + u32.
const FOOTER_LEN: u64 = 36;

pub fn marker_of(mode: RunMode) -> u64 {
    match mode {
        RunMode::Installer => MARKER_INSTALLER,
        RunMode::Uninstaller => MARKER_UNINSTALLER,
        RunMode::Updater => MARKER_UPDATER,
        RunMode::PackageManager => MARKER_PACKAGE_MANAGER,
    }
}

pub fn mode_of(marker: u64) -> Option<RunMode> {
    match marker {
        MARKER_INSTALLER => Some(RunMode::Installer),
        MARKER_UNINSTALLER => Some(RunMode::Uninstaller),
        MARKER_UPDATER => Some(RunMode::Updater),
        MARKER_PACKAGE_MANAGER => Some(RunMode::PackageManager),
        _ => None,
    }
}

/// The parsed metadata of a maintenance tool image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub marker: u64,
    /// Tagged sections in file order, unknown tags included.
    pub sections: Vec<(u32, Vec<u8>)>,
}

impl Metadata {
    pub fn new(mode: RunMode) -> Self {
        Self {
            marker: marker_of(mode),
            sections: Vec::new(),
        }
    }

    pub fn mode(&self) -> Option<RunMode> {
        mode_of(self.marker)
    }

    pub fn section(&self, tag: u32) -> Option<&[u8]> {
        self.sections
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, bytes)| bytes.as_slice())
    }

    /// Insert or replace the section with `tag`, keeping file order for
    /// the rest.
    pub fn set_section(&mut self, tag: u32, bytes: Vec<u8>) {
        match self.sections.iter_mut().find(|(t, _)| *t == tag) {
            Some((_, existing)) => *existing = bytes,
            None => self.sections.push((tag, bytes)),
        }
    }

    pub fn journal(&self) -> Option<&[u8]> {
        self.section(TAG_JOURNAL)
    }

    pub fn package_registry(&self) -> Option<&[u8]> {
        self.section(TAG_PACKAGE_REGISTRY)
    }

    fn encode_blob(&self) -> Vec<u8> {
        let mut w = Writer::new();
        for (tag, bytes) in &self.sections {
            w.put_u32(*tag);
            w.put_u64(bytes.len() as u64);
            w.put_raw(bytes);
        }
        w.into_bytes()
    }

    fn decode_blob(marker: u64, blob: &[u8]) -> Result<Self> {
        let mut r = Reader::new(blob);
        let mut sections = Vec::new();
        while !r.is_empty() {
            let tag = r.get_u32()?;
            let length = r.get_u64()? as usize;
            sections.push((tag, r.get_raw(length)?.to_vec()));
        }
        Ok(Self { marker, sections })
    }
}

fn crc32(data: &[u8]) -> u32 {
    let mut crc = flate2::Crc::new();
    crc.update(data);
    crc.sum()
}

/// Write a maintenance tool image: `base` plus `metadata`, atomically
/// replacing `out`. Executable permissions carry over; a rename refused
/// for lack of rights goes through the helper.
pub fn write(
    base: &Path,
    out: &Path,
    metadata: &Metadata,
    admin: &mut AdminRights,
) -> Result<()> {
    let base_bytes = utils::read_bytes("base image", base)?;
    let blob = metadata.encode_blob();

    let mut w = Writer::new();
    w.put_raw(&base_bytes);
    w.put_raw(&blob);
    w.put_u64(MAGIC_COOKIE);
    w.put_u64(base_bytes.len() as u64);
    w.put_u64(blob.len() as u64);
    w.put_u64(metadata.marker);
    w.put_u32(crc32(&blob));

    let staged = utils::sibling_temp_path(out);
    utils::write_bytes("maintenance tool", &staged, &w.into_bytes())?;
    utils::make_executable(&staged)?;
    match std::fs::rename(&staged, out) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            warn!("no rights to replace {}, delegating to helper", out.display());
            rename_elevated(admin, &staged, out)
        }
        Err(e) => Err(e).with_context(|| InstallError::WritingFile {
            name: "maintenance tool",
            path: out.to_path_buf(),
        }),
    }
}

fn rename_elevated(admin: &mut AdminRights, staged: &Path, out: &Path) -> Result<()> {
    let gained = admin.gain()?;
    let result = {
        let channel = admin
            .channel()
            .ok_or_else(|| InstallError::Elevation("helper is not active".into()))?;
        let payload = protocol::encode_strings(&[
            staged.display().to_string(),
            out.display().to_string(),
        ]);
        channel.request(protocol::CMD_RENAME, &payload).map(|_| ())
    };
    if gained {
        admin.release();
    }
    result
}

/// Read the metadata of a maintenance tool image. `Ok(None)` means the
/// file is a bare base executable without an appended blob; anything that
/// *has* a cookie but fails validation is an error.
pub fn read(path: &Path) -> Result<Option<Metadata>> {
    let bytes = utils::read_bytes("maintenance tool", path)?;
    if (bytes.len() as u64) < FOOTER_LEN {
        return Ok(None);
    }
    let mut footer = Reader::new(&bytes[bytes.len() - FOOTER_LEN as usize..]);
    let cookie = footer.get_u64()?;
    if cookie != MAGIC_COOKIE {
        return Ok(None);
    }
    let metadata_offset = footer.get_u64()?;
    let metadata_length = footer.get_u64()?;
    let marker = footer.get_u64()?;
    let expected_crc = footer.get_u32()?;

    let bad = |detail: String| InstallError::BadArtifact {
        path: path.to_path_buf(),
        detail,
    };
    let end = metadata_offset
        .checked_add(metadata_length)
        .filter(|&end| end <= bytes.len() as u64 - FOOTER_LEN)
        .ok_or_else(|| bad("metadata range outside file".to_owned()))?;
    let blob = &bytes[metadata_offset as usize..end as usize];
    let actual_crc = crc32(blob);
    if actual_crc != expected_crc {
        return Err(bad(format!(
            "metadata checksum mismatch: expected {expected_crc:08x}, got {actual_crc:08x}"
        ))
        .into());
    }
    Ok(Some(Metadata::decode_blob(marker, blob)?))
}

#[cfg(test)]
mod tests {
    use super::{mode_of, read, write, Metadata, TAG_JOURNAL, TAG_PACKAGE_REGISTRY};
    use crate::context::{AdminRights, RunMode};

    fn base_file(dir: &std::path::Path) -> std::path::PathBuf {
        let base = dir.join("base-bin");
        std::fs::write(&base, b"\x7fELF fake base executable").unwrap();
        base
    }

    #[test]
    fn round_trip_reproduces_sections_byte_for_byte() {
        let dir = tempfile::tempdir().unwrap();
        let base = base_file(dir.path());
        let out = dir.path().join("maintenance");

        let mut metadata = Metadata::new(RunMode::Uninstaller);
        metadata.set_section(TAG_JOURNAL, b"journal-bytes".to_vec());
        metadata.set_section(TAG_PACKAGE_REGISTRY, b"registry-bytes".to_vec());
        write(&base, &out, &metadata, &mut AdminRights::denied()).unwrap();

        let parsed = read(&out).unwrap().expect("footer present");
        assert_eq!(parsed.mode(), Some(RunMode::Uninstaller));
        assert_eq!(parsed.journal(), Some(&b"journal-bytes"[..]));
        assert_eq!(parsed.package_registry(), Some(&b"registry-bytes"[..]));
        assert_eq!(parsed, metadata);

        // The base image is still at the front.
        let bytes = std::fs::read(&out).unwrap();
        assert!(bytes.starts_with(b"\x7fELF"));
    }

    #[test]
    fn unknown_sections_survive_a_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let base = base_file(dir.path());
        let out = dir.path().join("maintenance");

        let mut metadata = Metadata::new(RunMode::PackageManager);
        metadata.set_section(0x77, b"from-the-future".to_vec());
        metadata.set_section(TAG_JOURNAL, b"j1".to_vec());
        write(&base, &out, &metadata, &mut AdminRights::denied()).unwrap();

        let mut reread = read(&out).unwrap().unwrap();
        reread.set_section(TAG_JOURNAL, b"j2-longer".to_vec());
        let out2 = dir.path().join("maintenance2");
        write(&base, &out2, &reread, &mut AdminRights::denied()).unwrap();

        let last = read(&out2).unwrap().unwrap();
        assert_eq!(last.section(0x77), Some(&b"from-the-future"[..]));
        assert_eq!(last.journal(), Some(&b"j2-longer"[..]));
    }

    #[test]
    fn bare_base_image_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let base = base_file(dir.path());
        assert!(read(&base).unwrap().is_none());
    }

    #[test]
    fn corrupted_metadata_fails_the_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let base = base_file(dir.path());
        let out = dir.path().join("maintenance");
        let mut metadata = Metadata::new(RunMode::Installer);
        metadata.set_section(TAG_JOURNAL, b"journal".to_vec());
        write(&base, &out, &metadata, &mut AdminRights::denied()).unwrap();

        let mut bytes = std::fs::read(&out).unwrap();
        let offset = b"\x7fELF fake base executable".len() + 6;
        bytes[offset] ^= 0xff;
        std::fs::write(&out, bytes).unwrap();
        assert!(read(&out).is_err());
    }

    #[test]
    fn every_mode_has_a_distinct_marker() {
        let modes = [
            RunMode::Installer,
            RunMode::Uninstaller,
            RunMode::Updater,
            RunMode::PackageManager,
        ];
        for mode in modes {
            assert_eq!(mode_of(super::marker_of(mode)), Some(mode));
        }
    }

    #[cfg(unix)]
    #[test]
    fn written_tool_is_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let base = base_file(dir.path());
        let out = dir.path().join("maintenance");
        write(&base, &out, &Metadata::new(RunMode::Uninstaller), &mut AdminRights::denied())
            .unwrap();
        let mode = std::fs::metadata(&out).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0);
    }
}
