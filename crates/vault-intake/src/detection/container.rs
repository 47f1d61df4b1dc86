//! Container inspection: look at directory entries and brand codes, never at payloads

use std::io::{Read, Seek, SeekFrom};

use super::signatures::{self, ContainerKind, Format};

/// Result of looking inside a generic container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerVerdict {
    /// A specific format was recognised from the container structure
    Identified(Format),
    /// The container is intact but nothing more specific was found
    Generic(Format),
    /// The signature promised a container that cannot be opened
    Unreadable(String),
}

/// Inspect a container whose signature matched `kind`
pub fn inspect<R: Read + Seek>(
    kind: ContainerKind,
    header: &[u8],
    reader: &mut R,
    max_entries: usize,
) -> ContainerVerdict {
    match kind {
        ContainerKind::Zip => inspect_zip(reader, max_entries),
        ContainerKind::Ole2 => inspect_ole2(header, reader),
        ContainerKind::Riff => inspect_riff(header),
        ContainerKind::IsoMedia => inspect_iso_media(header),
    }
}

fn inspect_zip<R: Read + Seek>(reader: &mut R, max_entries: usize) -> ContainerVerdict {
    let mut archive = match zip::ZipArchive::new(reader) {
        Ok(archive) => archive,
        Err(e) => return ContainerVerdict::Unreadable(format!("zip directory: {}", e)),
    };

    // ODF and EPUB declare themselves in a stored `mimetype` entry
    if let Some(format) = zip_declared_mimetype(&mut archive) {
        return ContainerVerdict::Identified(format);
    }

    let names: Vec<String> = archive
        .file_names()
        .take(max_entries)
        .map(|n| n.to_string())
        .collect();
    let has = |entry: &str| names.iter().any(|n| n == entry);

    let format = if has("word/document.xml") {
        signatures::DOCX
    } else if has("xl/workbook.xml") {
        signatures::XLSX
    } else if has("ppt/presentation.xml") {
        signatures::PPTX
    } else if has("META-INF/container.xml") {
        signatures::EPUB
    } else if has("AndroidManifest.xml") {
        signatures::APK
    } else if names.iter().any(|n| n.starts_with("Payload/")) {
        signatures::IPA
    } else if has("content.xml") {
        signatures::ODT
    } else {
        return ContainerVerdict::Generic(signatures::ZIP);
    };
    ContainerVerdict::Identified(format)
}

fn zip_declared_mimetype<R: Read + Seek>(archive: &mut zip::ZipArchive<R>) -> Option<Format> {
    let entry = archive.by_name("mimetype").ok()?;
    let mut declared = String::new();
    entry.take(128).read_to_string(&mut declared).ok()?;
    match declared.trim() {
        "application/epub+zip" => Some(signatures::EPUB),
        "application/vnd.oasis.opendocument.text" => Some(signatures::ODT),
        "application/vnd.oasis.opendocument.spreadsheet" => Some(signatures::ODS),
        "application/vnd.oasis.opendocument.presentation" => Some(signatures::ODP),
        _ => None,
    }
}

const OLE2_HEADER_LEN: usize = 512;
const OLE2_DIR_ENTRY_LEN: usize = 128;

fn inspect_ole2<R: Read + Seek>(header: &[u8], reader: &mut R) -> ContainerVerdict {
    if header.len() < OLE2_HEADER_LEN {
        return ContainerVerdict::Unreadable("compound file header truncated".to_string());
    }

    let names = ole2_directory_names(header, reader).unwrap_or_default();
    if let Some(format) = classify_ole2(&names) {
        return ContainerVerdict::Identified(format);
    }

    // Directory not where the header says; scan the header window for stream names
    match scan_utf16_stream_names(header) {
        Some(format) => ContainerVerdict::Identified(format),
        None => ContainerVerdict::Generic(signatures::OLE2),
    }
}

/// Names in the first directory sector of a compound file
fn ole2_directory_names<R: Read + Seek>(header: &[u8], reader: &mut R) -> Option<Vec<String>> {
    let sector_shift = u16::from_le_bytes([header[0x1E], header[0x1F]]);
    if !(7..=16).contains(&sector_shift) {
        return None;
    }
    let sector_size = 1usize << sector_shift;
    let dir_start = u32::from_le_bytes([header[0x30], header[0x31], header[0x32], header[0x33]]);

    let offset = (u64::from(dir_start) + 1) * sector_size as u64;
    reader.seek(SeekFrom::Start(offset)).ok()?;
    let mut sector = vec![0u8; sector_size];
    reader.read_exact(&mut sector).ok()?;

    let names = sector
        .chunks_exact(OLE2_DIR_ENTRY_LEN)
        .filter_map(|entry| {
            let name_len = u16::from_le_bytes([entry[0x40], entry[0x41]]) as usize;
            if name_len < 2 || name_len > 64 {
                return None;
            }
            let units: Vec<u16> = entry[..name_len - 2]
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            String::from_utf16(&units).ok()
        })
        .collect();
    Some(names)
}

fn classify_ole2(names: &[String]) -> Option<Format> {
    if names.iter().any(|n| n == "WordDocument") {
        Some(signatures::DOC)
    } else if names.iter().any(|n| n == "Workbook" || n == "Book") {
        Some(signatures::XLS)
    } else if names.iter().any(|n| n == "PowerPoint Document") {
        Some(signatures::PPT)
    } else if names
        .iter()
        .any(|n| n.starts_with("__substg1.0_") || n.starts_with("__properties_version1.0"))
    {
        Some(signatures::MSG)
    } else {
        None
    }
}

fn scan_utf16_stream_names(window: &[u8]) -> Option<Format> {
    const NEEDLES: &[(&str, Format)] = &[
        ("WordDocument", signatures::DOC),
        ("Workbook", signatures::XLS),
        ("PowerPoint Document", signatures::PPT),
        ("__substg1.0_", signatures::MSG),
    ];
    NEEDLES.iter().find_map(|(name, format)| {
        let needle: Vec<u8> = name.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        window
            .windows(needle.len())
            .any(|w| w == needle.as_slice())
            .then_some(*format)
    })
}

fn inspect_riff(header: &[u8]) -> ContainerVerdict {
    let Some(fourcc) = header.get(8..12) else {
        return ContainerVerdict::Unreadable("riff header truncated".to_string());
    };
    match fourcc {
        b"WAVE" => ContainerVerdict::Identified(signatures::WAV),
        b"AVI " => ContainerVerdict::Identified(signatures::AVI),
        b"WEBP" => ContainerVerdict::Identified(signatures::WEBP),
        _ => ContainerVerdict::Generic(signatures::RIFF),
    }
}

fn inspect_iso_media(header: &[u8]) -> ContainerVerdict {
    let Some(brand) = header.get(8..12) else {
        return ContainerVerdict::Unreadable("ftyp box truncated".to_string());
    };
    let format = match brand {
        b"M4V " | b"M4VH" | b"M4VP" => signatures::M4V,
        b"M4A " | b"M4B " | b"M4P " => signatures::M4A,
        b"qt  " => signatures::MOV,
        b"3gp4" | b"3gp5" | b"3gp6" | b"3ge6" | b"3gg6" => signatures::THREE_GP,
        b"3g2a" | b"3g2b" | b"3g2c" => signatures::THREE_G2,
        b"heic" | b"heix" | b"mif1" | b"msf1" => signatures::HEIC,
        // isom, iso2, mp41, mp42, avc1, dash and unknown brands
        _ => signatures::MP4,
    };
    ContainerVerdict::Identified(format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;

    fn zip_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            for (name, data) in entries {
                writer
                    .start_file(*name, SimpleFileOptions::default())
                    .unwrap();
                writer.write_all(data).unwrap();
            }
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    fn inspect_bytes(kind: ContainerKind, bytes: &[u8]) -> ContainerVerdict {
        let header = &bytes[..bytes.len().min(8192)];
        inspect(kind, header, &mut Cursor::new(bytes.to_vec()), 512)
    }

    #[test]
    fn test_docx_from_manifest_entry() {
        let bytes = zip_with(&[
            ("[Content_Types].xml", b"<Types/>"),
            ("word/document.xml", b"<w:document/>"),
        ]);
        assert_eq!(
            inspect_bytes(ContainerKind::Zip, &bytes),
            ContainerVerdict::Identified(signatures::DOCX)
        );
    }

    #[test]
    fn test_odf_mimetype_entry() {
        let bytes = zip_with(&[
            ("mimetype", b"application/vnd.oasis.opendocument.spreadsheet"),
            ("content.xml", b"<office/>"),
        ]);
        assert_eq!(
            inspect_bytes(ContainerKind::Zip, &bytes),
            ContainerVerdict::Identified(signatures::ODS)
        );
    }

    #[test]
    fn test_plain_zip_stays_archive() {
        let bytes = zip_with(&[("notes/readme.txt", b"hello")]);
        assert_eq!(
            inspect_bytes(ContainerKind::Zip, &bytes),
            ContainerVerdict::Generic(signatures::ZIP)
        );
    }

    #[test]
    fn test_truncated_zip_is_unreadable() {
        let bytes = zip_with(&[("word/document.xml", b"<w:document/>")]);
        let cut = &bytes[..bytes.len() / 2];
        assert!(matches!(
            inspect_bytes(ContainerKind::Zip, cut),
            ContainerVerdict::Unreadable(_)
        ));
    }

    fn ole2_with_stream(name: &str) -> Vec<u8> {
        // 512-byte header, directory in sector 0 (file offset 512)
        let mut bytes = vec![0u8; 1024];
        bytes[..8].copy_from_slice(b"\xD0\xCF\x11\xE0\xA1\xB1\x1A\xE1");
        bytes[0x1E..0x20].copy_from_slice(&9u16.to_le_bytes());
        bytes[0x30..0x34].copy_from_slice(&0u32.to_le_bytes());

        let entries = ["Root Entry", name];
        for (i, entry_name) in entries.iter().enumerate() {
            let base = 512 + i * OLE2_DIR_ENTRY_LEN;
            let units: Vec<u8> = entry_name
                .encode_utf16()
                .flat_map(|u| u.to_le_bytes())
                .collect();
            bytes[base..base + units.len()].copy_from_slice(&units);
            let len = (units.len() + 2) as u16;
            bytes[base + 0x40..base + 0x42].copy_from_slice(&len.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn test_ole2_stream_names() {
        assert_eq!(
            inspect_bytes(ContainerKind::Ole2, &ole2_with_stream("WordDocument")),
            ContainerVerdict::Identified(signatures::DOC)
        );
        assert_eq!(
            inspect_bytes(ContainerKind::Ole2, &ole2_with_stream("Workbook")),
            ContainerVerdict::Identified(signatures::XLS)
        );
        assert_eq!(
            inspect_bytes(ContainerKind::Ole2, &ole2_with_stream("__substg1.0_0037001F")),
            ContainerVerdict::Identified(signatures::MSG)
        );
        assert_eq!(
            inspect_bytes(ContainerKind::Ole2, &ole2_with_stream("Contents")),
            ContainerVerdict::Generic(signatures::OLE2)
        );
    }

    #[test]
    fn test_short_ole2_is_unreadable() {
        let bytes = b"\xD0\xCF\x11\xE0\xA1\xB1\x1A\xE1\0\0\0\0";
        assert!(matches!(
            inspect_bytes(ContainerKind::Ole2, bytes),
            ContainerVerdict::Unreadable(_)
        ));
    }

    #[test]
    fn test_riff_fourcc() {
        assert_eq!(
            inspect_bytes(ContainerKind::Riff, b"RIFF\x24\0\0\0WAVEfmt "),
            ContainerVerdict::Identified(signatures::WAV)
        );
        assert_eq!(
            inspect_bytes(ContainerKind::Riff, b"RIFF\x24\0\0\0WEBPVP8 "),
            ContainerVerdict::Identified(signatures::WEBP)
        );
        assert!(matches!(
            inspect_bytes(ContainerKind::Riff, b"RIFF\x24\0"),
            ContainerVerdict::Unreadable(_)
        ));
    }

    #[test]
    fn test_ftyp_brands() {
        assert_eq!(
            inspect_bytes(ContainerKind::IsoMedia, b"\0\0\0\x20ftypM4A \0\0\0\0"),
            ContainerVerdict::Identified(signatures::M4A)
        );
        assert_eq!(
            inspect_bytes(ContainerKind::IsoMedia, b"\0\0\0\x14ftypqt  \0\0\0\0"),
            ContainerVerdict::Identified(signatures::MOV)
        );
        assert_eq!(
            inspect_bytes(ContainerKind::IsoMedia, b"\0\0\0\x18ftypheic\0\0\0\0"),
            ContainerVerdict::Identified(signatures::HEIC)
        );
        assert_eq!(
            inspect_bytes(ContainerKind::IsoMedia, b"\0\0\0\x18ftypisom\0\0\0\0"),
            ContainerVerdict::Identified(signatures::MP4)
        );
    }
}
