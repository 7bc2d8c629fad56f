//! Config-slot embedding.
//!
//! A live ISO carries a 256 KiB zero-filled slot at the tail of its
//! initramfs (see `live`). This module writes the discovery header that
//! lets an external tool find and fill that slot later without
//! rebuilding the ISO. The header lives in the final 24 bytes of the ISO
//! 9660 system area (the first 32 KiB); no other code may write there.
//!
//! Byte layout, bit-exact and stable:
//!
//! ```text
//! [8 bytes ASCII "coreiso+"][u64 LE slot offset][u64 LE slot length]
//! ```
//!
//! This module only establishes and verifies the slot; it never fills it.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::error::AssembleError;
use crate::process::Cmd;

/// Magic tag opening the discovery header.
pub const SLOT_MAGIC: &[u8; 8] = b"coreiso+";

/// Length of the zero-padded slot. A contract with the downstream
/// embedding tool; must not change independently on either side.
pub const SLOT_LENGTH: u64 = 256 * 1024;

/// Discovery header size: magic + offset + length.
pub const SLOT_HEADER_SIZE: u64 = 24;

/// ISO 9660 system area size; the header sits in its final bytes.
pub const SYSTEM_AREA_SIZE: u64 = 32768;

/// ISO 9660 logical block size.
pub const ISO_BLOCK_SIZE: u64 = 2048;

/// Absolute byte offset of the discovery header.
pub const SLOT_HEADER_OFFSET: u64 = SYSTEM_AREA_SIZE - SLOT_HEADER_SIZE;

/// Locate the slot inside a finished ISO and write the discovery header.
///
/// `initramfs_size` is the on-disk size of the initramfs inside the ISO
/// (padding included). Fails without writing anything if the payload
/// entry is not unique or the slot region is not all-zero.
pub fn embed_config_slot(iso: &Path, initramfs_size: u64) -> Result<()> {
    let listing = Cmd::new("isoinfo")
        .args(["-l", "-i"])
        .arg_path(iso)
        .error_msg("isoinfo failed. Install genisoimage.")
        .run()?;

    let block = locate_payload(&listing.stdout, "initramfs.img")?;
    let offset = slot_offset(block, initramfs_size)?;
    write_slot_header(iso, offset)?;

    println!(
        "  embedded config slot header: offset={offset} length={SLOT_LENGTH}"
    );
    Ok(())
}

/// Find the starting logical block of the single directory entry named
/// `name` in `isoinfo -l` output.
///
/// Entries look like:
///
/// ```text
/// ----------   0    0    0     9306112 Jul 15 2026 [   4096 00]  initramfs.img;1
/// ```
///
/// Anything other than exactly one match is [`AssembleError::AmbiguousPayload`]:
/// zero matches would leave the slot undiscoverable, several would make
/// the header ambiguous.
pub fn locate_payload(listing: &str, name: &str) -> Result<u64> {
    let mut blocks = Vec::new();

    for line in listing.lines() {
        let Some(open) = line.find('[') else {
            continue;
        };
        let Some(close) = line[open..].find(']').map(|i| open + i) else {
            continue;
        };

        let mut fields = line[open + 1..close].split_whitespace();
        let (Some(block), Some("00"), None) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };

        let entry = line[close + 1..].trim();
        let entry = entry.strip_suffix(";1").unwrap_or(entry);
        if entry != name {
            continue;
        }

        let block: u64 = block
            .parse()
            .with_context(|| format!("parsing block number in isoinfo line: {line}"))?;
        blocks.push(block);
    }

    if blocks.len() != 1 {
        return Err(AssembleError::AmbiguousPayload {
            name: name.to_string(),
            count: blocks.len(),
        }
        .into());
    }
    Ok(blocks[0])
}

/// Absolute byte offset of the start of the zero padding, given the
/// payload's starting block and its on-disk size (padding included).
///
/// An initramfs smaller than the slot cannot contain it at all, which
/// means the padding step never ran on it.
pub fn slot_offset(block: u64, initramfs_size: u64) -> Result<u64> {
    let inside = initramfs_size.checked_sub(SLOT_LENGTH).with_context(|| {
        format!("initramfs of {initramfs_size} bytes cannot contain the {SLOT_LENGTH}-byte config slot")
    })?;
    Ok(block * ISO_BLOCK_SIZE + inside)
}

/// Encode the 24-byte discovery header for a slot at `offset`.
pub fn encode_slot_header(offset: u64) -> [u8; SLOT_HEADER_SIZE as usize] {
    let mut header = [0u8; SLOT_HEADER_SIZE as usize];
    header[..8].copy_from_slice(SLOT_MAGIC);
    header[8..16].copy_from_slice(&offset.to_le_bytes());
    header[16..24].copy_from_slice(&SLOT_LENGTH.to_le_bytes());
    header
}

/// Decode a discovery header back to `(offset, length)`, or `None` if
/// the magic does not match.
pub fn decode_slot_header(header: &[u8; SLOT_HEADER_SIZE as usize]) -> Option<(u64, u64)> {
    if &header[..8] != SLOT_MAGIC {
        return None;
    }
    let offset = u64::from_le_bytes(header[8..16].try_into().ok()?);
    let length = u64::from_le_bytes(header[16..24].try_into().ok()?);
    Some((offset, length))
}

/// Verify the slot at `offset` is all-zero, then write the discovery
/// header at the end of the system area.
///
/// The header describes a region it does not live in; the slot itself is
/// untouched.
pub fn write_slot_header(iso: &Path, offset: u64) -> Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(iso)
        .with_context(|| format!("opening {}", iso.display()))?;

    file.seek(SeekFrom::Start(offset))
        .with_context(|| format!("seeking to slot at {offset}"))?;
    let mut slot = vec![0u8; SLOT_LENGTH as usize];
    file.read_exact(&mut slot)
        .with_context(|| format!("reading {SLOT_LENGTH} bytes at {offset}"))?;

    if let Some(at) = slot.iter().position(|b| *b != 0) {
        return Err(AssembleError::CorruptPadding {
            offset,
            at: at as u64,
        }
        .into());
    }

    file.seek(SeekFrom::Start(SLOT_HEADER_OFFSET))
        .context("seeking to system area header")?;
    file.write_all(&encode_slot_header(offset))
        .context("writing config slot header")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const LISTING: &str = "\
Directory listing of /
d---------   0    0    0            2048 Jul 15 2026 [     29 02]  .
d---------   0    0    0            2048 Jul 15 2026 [     29 02]  ..
d---------   0    0    0            2048 Jul 15 2026 [     30 02]  IMAGES

Directory listing of /IMAGES/
d---------   0    0    0            2048 Jul 15 2026 [     30 02]  .
----------   0    0    0         9568256 Jul 15 2026 [     31 00]  vmlinuz;1
----------   0    0    0        95420416 Jul 15 2026 [   4703 00]  initramfs.img;1
";

    #[test]
    fn locate_payload_finds_single_entry() {
        assert_eq!(locate_payload(LISTING, "initramfs.img").unwrap(), 4703);
    }

    #[test]
    fn locate_payload_tolerates_missing_version_suffix() {
        let listing = "----------   0  0  0  1024 Jul 15 2026 [ 99 00]  initramfs.img\n";
        assert_eq!(locate_payload(listing, "initramfs.img").unwrap(), 99);
    }

    #[test]
    fn locate_payload_zero_matches_is_ambiguous() {
        let err = locate_payload(LISTING, "nosuchfile.img").unwrap_err();
        match err.downcast_ref::<AssembleError>().unwrap() {
            AssembleError::AmbiguousPayload { count, .. } => assert_eq!(*count, 0),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn locate_payload_multiple_matches_is_ambiguous() {
        let doubled = format!("{LISTING}{LISTING}");
        let err = locate_payload(&doubled, "initramfs.img").unwrap_err();
        match err.downcast_ref::<AssembleError>().unwrap() {
            AssembleError::AmbiguousPayload { count, .. } => assert_eq!(*count, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn locate_payload_ignores_directory_entries() {
        // "02" flag marks directories; only "00" entries are candidates.
        let listing = "d---------  0 0 0 2048 Jul 15 2026 [ 30 02]  initramfs.img\n\
                       ----------  0 0 0 1024 Jul 15 2026 [ 40 00]  initramfs.img;1\n";
        assert_eq!(locate_payload(listing, "initramfs.img").unwrap(), 40);
    }

    #[test]
    fn slot_offset_block_aligned_size() {
        // initramfs of exactly 3 blocks ending in the slot
        let size = 3 * ISO_BLOCK_SIZE + SLOT_LENGTH;
        assert_eq!(slot_offset(10, size).unwrap(), 10 * 2048 + 3 * 2048);
    }

    #[test]
    fn slot_offset_unaligned_size() {
        let size = SLOT_LENGTH + 1000;
        assert_eq!(slot_offset(4703, size).unwrap(), 4703 * 2048 + 1000);
    }

    #[test]
    fn slot_offset_minimal_payload() {
        // payload that is nothing but padding
        assert_eq!(slot_offset(5, SLOT_LENGTH).unwrap(), 5 * 2048);
    }

    #[test]
    fn slot_offset_rejects_unpadded_payload() {
        // an initramfs smaller than the slot was never padded
        assert!(slot_offset(5, SLOT_LENGTH - 1).is_err());
        assert!(slot_offset(5, 0).is_err());
    }

    #[test]
    fn header_roundtrip() {
        let header = encode_slot_header(0x1234_5678_9abc);
        assert_eq!(&header[..8], b"coreiso+");
        assert_eq!(
            decode_slot_header(&header),
            Some((0x1234_5678_9abc, SLOT_LENGTH))
        );
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut header = encode_slot_header(42);
        header[0] = b'X';
        assert_eq!(decode_slot_header(&header), None);
    }

    #[test]
    fn header_offset_is_32744() {
        assert_eq!(SLOT_HEADER_OFFSET, 32744);
    }

    fn synthetic_iso(slot_block: u64) -> (TempDir, std::path::PathBuf, u64) {
        // A fake ISO: system area + payload whose tail is the zero slot.
        let tmp = TempDir::new().unwrap();
        let iso = tmp.path().join("test.iso");
        let slot_start = slot_block * ISO_BLOCK_SIZE;
        let mut bytes = vec![0xAAu8; slot_start as usize];
        // system area left nonzero on purpose except the header location
        bytes[SLOT_HEADER_OFFSET as usize..SYSTEM_AREA_SIZE as usize].fill(0);
        bytes.extend(std::iter::repeat(0u8).take(SLOT_LENGTH as usize));
        fs::write(&iso, &bytes).unwrap();
        (tmp, iso, slot_start)
    }

    #[test]
    fn write_slot_header_roundtrip() {
        let (_tmp, iso, offset) = synthetic_iso(20);
        write_slot_header(&iso, offset).unwrap();

        let bytes = fs::read(&iso).unwrap();
        let header: [u8; 24] = bytes
            [SLOT_HEADER_OFFSET as usize..SYSTEM_AREA_SIZE as usize]
            .try_into()
            .unwrap();
        let (got_offset, got_length) = decode_slot_header(&header).unwrap();
        assert_eq!(got_offset, offset);
        assert_eq!(got_length, SLOT_LENGTH);

        // the described region is still the untouched zero padding
        let region = &bytes[offset as usize..(offset + SLOT_LENGTH) as usize];
        assert!(region.iter().all(|b| *b == 0));
    }

    #[test]
    fn write_slot_header_rejects_corrupt_padding() {
        let (_tmp, iso, offset) = synthetic_iso(20);
        let mut bytes = fs::read(&iso).unwrap();
        bytes[(offset + 12345) as usize] = 0x7F;
        fs::write(&iso, &bytes).unwrap();

        let err = write_slot_header(&iso, offset).unwrap_err();
        match err.downcast_ref::<AssembleError>().unwrap() {
            AssembleError::CorruptPadding { at, .. } => assert_eq!(*at, 12345),
            other => panic!("unexpected error: {other}"),
        }

        // nothing was written: header location still zero
        let bytes = fs::read(&iso).unwrap();
        assert!(bytes[SLOT_HEADER_OFFSET as usize..SYSTEM_AREA_SIZE as usize]
            .iter()
            .all(|b| *b == 0));
    }
}
