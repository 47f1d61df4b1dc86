//! Byte-signature table

use crate::types::ProcessingCategory;

/// A concrete file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    pub subtype: &'static str,
    pub mime: &'static str,
    pub category: ProcessingCategory,
}

const fn format(subtype: &'static str, mime: &'static str, category: ProcessingCategory) -> Format {
    Format { subtype, mime, category }
}

use ProcessingCategory::{Archive, Audio, Communication, Documents, Images, Other, Video};

pub const PDF: Format = format("pdf", "application/pdf", Documents);
pub const RTF: Format = format("rtf", "application/rtf", Documents);
pub const MOBI: Format = format("mobi", "application/x-mobipocket-ebook", Documents);
pub const DOCX: Format = format(
    "docx",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    Documents,
);
pub const XLSX: Format = format(
    "xlsx",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    Documents,
);
pub const PPTX: Format = format(
    "pptx",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    Documents,
);
pub const ODT: Format = format("odt", "application/vnd.oasis.opendocument.text", Documents);
pub const ODS: Format = format("ods", "application/vnd.oasis.opendocument.spreadsheet", Documents);
pub const ODP: Format = format("odp", "application/vnd.oasis.opendocument.presentation", Documents);
pub const EPUB: Format = format("epub", "application/epub+zip", Documents);
pub const DOC: Format = format("doc", "application/msword", Documents);
pub const XLS: Format = format("xls", "application/vnd.ms-excel", Documents);
pub const PPT: Format = format("ppt", "application/vnd.ms-powerpoint", Documents);

pub const JPEG: Format = format("jpg", "image/jpeg", Images);
pub const PNG: Format = format("png", "image/png", Images);
pub const GIF: Format = format("gif", "image/gif", Images);
pub const BMP: Format = format("bmp", "image/bmp", Images);
pub const TIFF: Format = format("tiff", "image/tiff", Images);
pub const PSD: Format = format("psd", "image/vnd.adobe.photoshop", Images);
pub const WEBP: Format = format("webp", "image/webp", Images);
pub const HEIC: Format = format("heic", "image/heic", Images);

pub const MP3: Format = format("mp3", "audio/mpeg", Audio);
pub const FLAC: Format = format("flac", "audio/flac", Audio);
pub const OGG: Format = format("ogg", "audio/ogg", Audio);
pub const AIFF: Format = format("aiff", "audio/aiff", Audio);
pub const WAV: Format = format("wav", "audio/wav", Audio);
pub const M4A: Format = format("m4a", "audio/mp4", Audio);

pub const MKV: Format = format("mkv", "video/x-matroska", Video);
pub const FLV: Format = format("flv", "video/x-flv", Video);
pub const AVI: Format = format("avi", "video/x-msvideo", Video);
pub const MP4: Format = format("mp4", "video/mp4", Video);
pub const M4V: Format = format("m4v", "video/x-m4v", Video);
pub const MOV: Format = format("mov", "video/quicktime", Video);
pub const THREE_GP: Format = format("3gp", "video/3gpp", Video);
pub const THREE_G2: Format = format("3g2", "video/3gpp2", Video);

pub const ZIP: Format = format("zip", "application/zip", Archive);
pub const RAR: Format = format("rar", "application/vnd.rar", Archive);
pub const SEVEN_Z: Format = format("7z", "application/x-7z-compressed", Archive);
pub const GZIP: Format = format("gz", "application/gzip", Archive);
pub const BZIP2: Format = format("bz2", "application/x-bzip2", Archive);
pub const XZ: Format = format("xz", "application/x-xz", Archive);
pub const ZSTD: Format = format("zst", "application/zstd", Archive);

pub const EML: Format = format("eml", "message/rfc822", Communication);
pub const MSG: Format = format("msg", "application/vnd.ms-outlook", Communication);
pub const PST: Format = format("pst", "application/vnd.ms-outlook-pst", Communication);

pub const EXE: Format = format("exe", "application/vnd.microsoft.portable-executable", Other);
pub const ELF: Format = format("elf", "application/x-elf", Other);
pub const MACHO: Format = format("macho", "application/x-mach-binary", Other);
pub const SQLITE: Format = format("sqlite", "application/vnd.sqlite3", Other);
pub const APK: Format = format("apk", "application/vnd.android.package-archive", Other);
pub const IPA: Format = format("ipa", "application/x-ios-app", Other);
pub const OLE2: Format = format("ole2", "application/x-ole-storage", Other);
pub const RIFF: Format = format("riff", "application/x-riff", Other);
pub const UNKNOWN: Format = format("unknown", "application/octet-stream", Other);

/// Generic container families that need a look inside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Zip,
    Ole2,
    Riff,
    IsoMedia,
}

/// What a matching signature tells us
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureMatch {
    Format(Format),
    Container(ContainerKind),
}

struct Signature {
    offset: usize,
    magic: &'static [u8],
    matches: SignatureMatch,
    /// Extra structure a short magic must carry before it counts
    structure: Option<fn(&[u8]) -> bool>,
}

const fn sig(offset: usize, magic: &'static [u8], format: Format) -> Signature {
    Signature { offset, magic, matches: SignatureMatch::Format(format), structure: None }
}

const fn checked(
    offset: usize,
    magic: &'static [u8],
    format: Format,
    structure: fn(&[u8]) -> bool,
) -> Signature {
    Signature {
        offset,
        magic,
        matches: SignatureMatch::Format(format),
        structure: Some(structure),
    }
}

const fn container(offset: usize, magic: &'static [u8], kind: ContainerKind) -> Signature {
    Signature { offset, magic, matches: SignatureMatch::Container(kind), structure: None }
}

/// Checked in order; longer and more specific signatures come first
const SIGNATURES: &[Signature] = &[
    container(0, b"PK\x03\x04", ContainerKind::Zip),
    container(0, b"PK\x05\x06", ContainerKind::Zip),
    container(0, b"\xD0\xCF\x11\xE0\xA1\xB1\x1A\xE1", ContainerKind::Ole2),
    container(0, b"RIFF", ContainerKind::Riff),
    container(4, b"ftyp", ContainerKind::IsoMedia),
    sig(0, b"%PDF", PDF),
    sig(0, b"{\\rtf", RTF),
    sig(60, b"BOOKMOBI", MOBI),
    sig(0, b"\x89PNG\r\n\x1a\n", PNG),
    sig(0, b"\xFF\xD8\xFF", JPEG),
    sig(0, b"GIF87a", GIF),
    sig(0, b"GIF89a", GIF),
    sig(0, b"II*\x00", TIFF),
    sig(0, b"MM\x00*", TIFF),
    sig(0, b"8BPS", PSD),
    sig(0, b"ID3", MP3),
    sig(0, b"fLaC", FLAC),
    sig(0, b"OggS", OGG),
    sig(0, b"FORM", AIFF),
    sig(0, b"\x1A\x45\xDF\xA3", MKV),
    sig(0, b"FLV\x01", FLV),
    sig(0, b"Rar!\x1A\x07", RAR),
    sig(0, b"7z\xBC\xAF\x27\x1C", SEVEN_Z),
    sig(0, b"\x1F\x8B", GZIP),
    sig(0, b"BZh", BZIP2),
    sig(0, b"\xFD7zXZ\x00", XZ),
    sig(0, b"\x28\xB5\x2F\xFD", ZSTD),
    sig(0, b"SQLite format 3\x00", SQLITE),
    sig(0, b"!BDN", PST),
    sig(0, b"\x7FELF", ELF),
    sig(0, b"\xFE\xED\xFA\xCE", MACHO),
    sig(0, b"\xFE\xED\xFA\xCF", MACHO),
    sig(0, b"\xCE\xFA\xED\xFE", MACHO),
    sig(0, b"\xCF\xFA\xED\xFE", MACHO),
    checked(0, b"MZ", EXE, is_pe_header),
    // MPEG frame sync without an ID3 tag
    sig(0, b"\xFF\xFB", MP3),
    sig(0, b"\xFF\xF3", MP3),
    sig(0, b"\xFF\xF2", MP3),
    checked(0, b"BM", BMP, is_bmp_header),
];

/// Largest `e_lfanew` accepted when the PE header sits past the window
const MAX_PE_OFFSET: usize = 0x10000;

/// OS/2 core, Windows V1 to V5 headers
const DIB_HEADER_SIZES: &[u32] = &[12, 40, 52, 56, 64, 108, 124];

/// Header names that open an RFC 822 message
const MAIL_HEADERS: &[&[u8]] = &[
    b"Return-Path:",
    b"Received:",
    b"Delivered-To:",
    b"MIME-Version:",
    b"Message-ID:",
    b"From:",
    b"From ",
];

/// Match the header window against the signature table
pub fn match_signature(header: &[u8]) -> Option<SignatureMatch> {
    SIGNATURES
        .iter()
        .find(|s| {
            header
                .get(s.offset..s.offset + s.magic.len())
                .is_some_and(|window| window == s.magic)
                && s.structure.map_or(true, |check| check(header))
        })
        .map(|s| s.matches)
        .or_else(|| looks_like_mail(header).then_some(SignatureMatch::Format(EML)))
}

fn u32_le(bytes: &[u8], at: usize) -> Option<u32> {
    let raw: [u8; 4] = bytes.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(raw))
}

/// DOS stub whose `e_lfanew` points at a PE header. When the pointer lands
/// past the header window it only has to be plausible.
fn is_pe_header(header: &[u8]) -> bool {
    let Some(e_lfanew) = u32_le(header, 0x3C).map(|v| v as usize) else {
        return false;
    };
    if !(0x40..=MAX_PE_OFFSET).contains(&e_lfanew) {
        return false;
    }
    match header.get(e_lfanew..e_lfanew + 4) {
        Some(pe) => pe == b"PE\0\0",
        None => true,
    }
}

/// BITMAPFILEHEADER followed by one of the known DIB header sizes
fn is_bmp_header(header: &[u8]) -> bool {
    let (Some(file_size), Some(dib_size)) = (u32_le(header, 2), u32_le(header, 14)) else {
        return false;
    };
    file_size >= 26 && DIB_HEADER_SIZES.contains(&dib_size)
}

/// Bytes a complete file of this format ends with, searched for in the tail
pub fn required_trailer(format: Format) -> Option<&'static [u8]> {
    match format.subtype {
        "pdf" => Some(&b"%%EOF"[..]),
        "png" => Some(&b"IEND"[..]),
        "jpg" => Some(&b"\xFF\xD9"[..]),
        _ => None,
    }
}

fn looks_like_mail(header: &[u8]) -> bool {
    MAIL_HEADERS
        .iter()
        .any(|h| header.len() >= h.len() && header[..h.len()].eq_ignore_ascii_case(h))
}

/// Format for a filename extension or a declared type, when no signature matched
pub fn format_for_hint(hint: &str) -> Option<Format> {
    let hint = hint.trim().trim_start_matches('.').to_ascii_lowercase();
    let known = match hint.as_str() {
        "pdf" => PDF,
        "rtf" => RTF,
        "docx" => DOCX,
        "xlsx" => XLSX,
        "pptx" => PPTX,
        "doc" => DOC,
        "xls" => XLS,
        "ppt" => PPT,
        "odt" => ODT,
        "ods" => ODS,
        "odp" => ODP,
        "epub" => EPUB,
        "mobi" => MOBI,
        "eml" => EML,
        "msg" => MSG,
        "pst" => PST,
        "mbox" => format("mbox", "application/mbox", Communication),
        "csv" => format("csv", "text/csv", Documents),
        "txt" | "text" => format("txt", "text/plain", Documents),
        "md" | "markdown" => format("md", "text/markdown", Documents),
        "json" => format("json", "application/json", Documents),
        "html" | "htm" => format("html", "text/html", Documents),
        _ => return None,
    };
    Some(known)
}

/// MIME type and category from the MIME registry, for hints the table does not name
pub fn guess_mime(hint: &str) -> Option<(String, ProcessingCategory)> {
    let hint = hint.trim().trim_start_matches('.').to_ascii_lowercase();
    let mime = if hint.contains('/') {
        hint
    } else {
        mime_guess::from_ext(&hint).first()?.essence_str().to_string()
    };
    let category = category_for_mime(&mime);
    Some((mime, category))
}

/// Coarse category for a MIME type string
pub fn category_for_mime(mime: &str) -> ProcessingCategory {
    let mime = mime.to_ascii_lowercase();
    let (top, sub) = mime.split_once('/').unwrap_or((mime.as_str(), ""));
    match top {
        "image" => Images,
        "audio" => Audio,
        "video" => Video,
        "message" => Communication,
        "text" => Documents,
        "application" if sub.contains("zip") || sub.contains("compressed") || sub.contains("tar") => {
            Archive
        }
        "application"
            if sub.contains("pdf")
                || sub.contains("document")
                || sub.contains("msword")
                || sub.contains("excel")
                || sub.contains("powerpoint")
                || sub.contains("json")
                || sub.contains("xml") =>
        {
            Documents
        }
        _ => Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_signatures() {
        assert_eq!(match_signature(b"%PDF-1.7\n"), Some(SignatureMatch::Format(PDF)));
        assert_eq!(match_signature(b"\xFF\xD8\xFF\xE0JFIF"), Some(SignatureMatch::Format(JPEG)));
        assert_eq!(
            match_signature(b"\x89PNG\r\n\x1a\n\0\0"),
            Some(SignatureMatch::Format(PNG))
        );
        assert_eq!(match_signature(b"\x7FELF\x02\x01"), Some(SignatureMatch::Format(ELF)));
        assert_eq!(match_signature(b"\x1F\x8B\x08"), Some(SignatureMatch::Format(GZIP)));
    }

    #[test]
    fn test_two_byte_magics_need_structure() {
        let mut exe = vec![0u8; 0x48];
        exe[..2].copy_from_slice(b"MZ");
        exe[0x3C..0x40].copy_from_slice(&0x40u32.to_le_bytes());
        exe[0x40..0x44].copy_from_slice(b"PE\0\0");
        assert_eq!(match_signature(&exe), Some(SignatureMatch::Format(EXE)));

        // PE header beyond the window only needs a plausible offset
        exe[0x3C..0x40].copy_from_slice(&0x200u32.to_le_bytes());
        assert_eq!(match_signature(&exe), Some(SignatureMatch::Format(EXE)));

        exe[0x3C..0x40].copy_from_slice(&0x40u32.to_le_bytes());
        exe[0x40..0x44].copy_from_slice(b"NE\0\0");
        assert_eq!(match_signature(&exe), None);

        let mut bmp = vec![0u8; 54];
        bmp[..2].copy_from_slice(b"BM");
        bmp[2..6].copy_from_slice(&54u32.to_le_bytes());
        bmp[14..18].copy_from_slice(&40u32.to_le_bytes());
        assert_eq!(match_signature(&bmp), Some(SignatureMatch::Format(BMP)));

        let memo = b"MZ notes from the planning meeting, see attached agenda for details";
        assert_eq!(match_signature(memo), None);
        let log = b"BMW service record 2019, oil change and brake pads";
        assert_eq!(match_signature(log), None);
        assert_eq!(match_signature(b"MZ"), None);
    }

    #[test]
    fn test_trailers() {
        assert_eq!(required_trailer(PDF), Some(&b"%%EOF"[..]));
        assert_eq!(required_trailer(JPEG), Some(&b"\xFF\xD9"[..]));
        assert_eq!(required_trailer(GIF), None);
    }

    #[test]
    fn test_container_signatures() {
        assert_eq!(
            match_signature(b"PK\x03\x04\x14\x00"),
            Some(SignatureMatch::Container(ContainerKind::Zip))
        );
        assert_eq!(
            match_signature(b"\0\0\0\x18ftypmp42"),
            Some(SignatureMatch::Container(ContainerKind::IsoMedia))
        );
        assert_eq!(
            match_signature(b"RIFF\x24\0\0\0WAVE"),
            Some(SignatureMatch::Container(ContainerKind::Riff))
        );
    }

    #[test]
    fn test_mail_headers() {
        assert_eq!(
            match_signature(b"Received: from mx.example.org"),
            Some(SignatureMatch::Format(EML))
        );
        assert_eq!(match_signature(b"plain words"), None);
    }

    #[test]
    fn test_offset_signature_needs_enough_bytes() {
        let mut mobi = vec![0u8; 68];
        mobi[60..68].copy_from_slice(b"BOOKMOBI");
        assert_eq!(match_signature(&mobi), Some(SignatureMatch::Format(MOBI)));
        assert_eq!(match_signature(&mobi[..64]), None);
    }

    #[test]
    fn test_hint_lookup() {
        assert_eq!(format_for_hint(".PDF"), Some(PDF));
        assert_eq!(format_for_hint("eml").unwrap().category, Communication);
        assert_eq!(format_for_hint("csv").unwrap().subtype, "csv");
        assert_eq!(format_for_hint("definitely-not-a-type"), None);
    }

    #[test]
    fn test_mime_registry_fallback() {
        assert_eq!(guess_mime("image/png"), Some(("image/png".to_string(), Images)));
        assert_eq!(guess_mime("mp3").unwrap().1, Audio);
        assert_eq!(guess_mime("tar").unwrap().1, Archive);
        assert_eq!(guess_mime("definitely-not-a-type"), None);
    }
}
