//! Content-type helpers: normalization and URL-extension inference.

/// Strip parameters and whitespace from a `Content-Type` header value.
pub fn normalize_content_type(raw: &str) -> String {
    raw.split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// MIME type for a known media file extension.
pub fn mime_for_extension(ext: &str) -> Option<&'static str> {
    let mime = match ext.to_ascii_lowercase().as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        "flv" => "video/x-flv",
        "ts" => "video/mp2t",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "flac" => "audio/flac",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        _ => return None,
    };
    Some(mime)
}

/// Infer a MIME type from a URL.
///
/// Prefers the extension of the parsed path. When the URL does not parse or
/// its path carries no extension, falls back to scanning the raw string so
/// extensions hidden by unusual URLs are still recognized.
pub fn mime_for_url(url: &str) -> Option<&'static str> {
    if let Ok(parsed) = url::Url::parse(url) {
        let path = parsed.path();
        if let Some(ext) = extension_of(path)
            && let Some(mime) = mime_for_extension(ext)
        {
            return Some(mime);
        }
    }

    // Fallback: strip query/fragment by hand and look again.
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    extension_of(trimmed).and_then(mime_for_extension)
}

fn extension_of(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next().unwrap_or(path);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 5 {
        return None;
    }
    Some(ext)
}

/// Whether the media is an MP4 family container, judged by content type
/// first and URL extension second.
pub fn is_mp4(content_type: &str, url: &str) -> bool {
    let normalized = normalize_content_type(content_type);
    if normalized == "video/mp4" || normalized == "audio/mp4" {
        return true;
    }
    if !normalized.is_empty() && normalized != "application/octet-stream" {
        return false;
    }
    matches!(mime_for_url(url), Some("video/mp4" | "audio/mp4"))
}
