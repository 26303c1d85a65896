/// File kind as seen by fetch policy. Computed once from name/mime/magic
/// bytes and carried as data from then on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Other,
}

const IMAGE_EXTS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "bmp", "ico", "svg", "heic", "heif", "avif",
];
const VIDEO_EXTS: &[&str] = &["mp4", "m4v", "mov", "webm", "ogv", "mkv", "avi", "3gp", "3g2"];
const AUDIO_EXTS: &[&str] = &["mp3", "m4a", "aac", "wav", "ogg", "opus", "flac"];

/// Lowercased leaf of a file name, with any query/fragment stripped.
fn normalize_name(name: &str) -> String {
    let no_query = name
        .split(['?', '#'])
        .next()
        .unwrap_or("")
        .trim();
    let leaf = no_query.rsplit(['/', '\\']).next().unwrap_or("");
    leaf.trim().to_ascii_lowercase()
}

fn extension(name: &str) -> Option<String> {
    let n = normalize_name(name);
    let (_, ext) = n.rsplit_once('.')?;
    if ext.is_empty() {
        None
    } else {
        Some(ext.to_string())
    }
}

/// Map a file name to a MIME type by extension.
/// Unknown extensions map to `application/octet-stream`.
pub fn guess_mime_by_name(name: &str) -> &'static str {
    match extension(name).as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        Some("ico") => "image/x-icon",
        Some("heic") => "image/heic",
        Some("heif") => "image/heif",
        Some("avif") => "image/avif",
        Some("svg") => "image/svg+xml",
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("ogv") => "video/ogg",
        Some("mkv") => "video/x-matroska",
        Some("avi") => "video/x-msvideo",
        Some("3gp") => "video/3gpp",
        Some("3g2") => "video/3gpp2",
        Some("mp3") => "audio/mpeg",
        Some("m4a") => "audio/mp4",
        Some("aac") => "audio/aac",
        Some("wav") => "audio/wav",
        Some("ogg") => "audio/ogg",
        Some("opus") => "audio/opus",
        Some("flac") => "audio/flac",
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

/// Sniff a MIME type from the first bytes of a payload. Only the first
/// 64 bytes are ever inspected.
pub fn sniff_mime(header: &[u8]) -> Option<&'static str> {
    let h = &header[..header.len().min(64)];

    if h.len() >= 3 && h[0] == 0xFF && h[1] == 0xD8 && h[2] == 0xFF {
        return Some("image/jpeg");
    }
    if h.len() >= 8 && h[..8] == [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A] {
        return Some("image/png");
    }
    if h.len() >= 6 && (&h[..6] == b"GIF87a" || &h[..6] == b"GIF89a") {
        return Some("image/gif");
    }
    if h.len() >= 12 && &h[..4] == b"RIFF" && &h[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    if h.len() >= 2 && &h[..2] == b"BM" {
        return Some("image/bmp");
    }
    if h.len() >= 4 && h[..4] == [0x00, 0x00, 0x01, 0x00] {
        return Some("image/x-icon");
    }
    if h.len() >= 5 && &h[..5] == b"%PDF-" {
        return Some("application/pdf");
    }
    // ISO BMFF family: size + "ftyp" + brand at offset 8.
    if h.len() >= 12 && &h[4..8] == b"ftyp" {
        let brand = &h[8..12];
        return Some(match brand {
            b"heic" | b"heix" | b"hevc" | b"hevx" => "image/heic",
            b"mif1" | b"msf1" => "image/heif",
            b"avif" | b"avis" => "image/avif",
            b"qt  " => "video/quicktime",
            _ => "video/mp4",
        });
    }
    None
}

/// Pick the best MIME for a cached payload: stored hint, then extension
/// guess, then magic sniffing. A generic `application/octet-stream` hint is
/// never final when a better guess exists.
pub fn reconcile_mime(hint: Option<&str>, name: Option<&str>, header: &[u8]) -> String {
    let generic = "application/octet-stream";
    if let Some(h) = hint {
        let h = h.trim();
        if !h.is_empty() && h != generic {
            return h.to_string();
        }
    }
    if let Some(n) = name {
        let guessed = guess_mime_by_name(n);
        if guessed != generic {
            return guessed.to_string();
        }
    }
    if let Some(sniffed) = sniff_mime(header) {
        return sniffed.to_string();
    }
    generic.to_string()
}

fn name_has_ext(name: &str, exts: &[&str]) -> bool {
    extension(name).is_some_and(|e| exts.contains(&e.as_str()))
}

// Name prefixes that mark camera/recorder output when the extension and
// mime are missing or generic.
const VIDEO_NAME_HINTS: &[&str] = &["video", "vid_", "movie", "clip", "screencast", "screen_rec"];
const AUDIO_NAME_HINTS: &[&str] = &["audio", "voice", "sound", "music", "song", "track", "memo"];

fn name_hinted(name: &str, hints: &[&str]) -> bool {
    let n = normalize_name(name);
    hints.iter().any(|h| n.starts_with(h))
}

/// Classify a file into a `MediaKind` from its name, declared MIME, and
/// (optionally) leading payload bytes.
pub fn classify_media(name: &str, mime: Option<&str>, header: Option<&[u8]>) -> MediaKind {
    let mt = mime.unwrap_or("").trim().to_ascii_lowercase();
    if mt.starts_with("image/") {
        return MediaKind::Image;
    }
    if mt.starts_with("video/") {
        return MediaKind::Video;
    }
    if mt.starts_with("audio/") {
        return MediaKind::Audio;
    }
    if let Some(h) = header {
        if let Some(sniffed) = sniff_mime(h) {
            if sniffed.starts_with("image/") {
                return MediaKind::Image;
            }
            if sniffed.starts_with("video/") {
                return MediaKind::Video;
            }
        }
    }
    if name_has_ext(name, IMAGE_EXTS) {
        return MediaKind::Image;
    }
    if name_has_ext(name, VIDEO_EXTS) || name_hinted(name, VIDEO_NAME_HINTS) {
        return MediaKind::Video;
    }
    if name_has_ext(name, AUDIO_EXTS) || name_hinted(name, AUDIO_NAME_HINTS) {
        return MediaKind::Audio;
    }
    MediaKind::Other
}
