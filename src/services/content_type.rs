//! Extension-based content types and the server-side script policy.

/// Content type forced onto script sources this system cannot execute.
pub const PLAIN_TEXT: &str = "text/plain; charset=utf-8";
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Extensions of server-side scripts. They are stored like any other file
/// but never served with their stored content type.
const SERVER_SCRIPT_EXTENSIONS: &[&str] = &[
    "php", "php3", "php4", "php5", "php7", "php8", "phtml", "phar", "phps", "asp", "aspx",
    "jsp", "cgi", "pl",
];

fn extension(name: &str) -> Option<String> {
    let file = name.rsplit('/').next().unwrap_or(name);
    let (stem, ext) = file.rsplit_once('.')?;
    if stem.is_empty() && !file[1..].contains('.') {
        // dotfiles such as `.htaccess` have no extension
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub fn is_server_script(name: &str) -> bool {
    extension(name).is_some_and(|ext| SERVER_SCRIPT_EXTENSIONS.contains(&ext.as_str()))
}

/// Best-effort content type for a file name.
pub fn guess(name: &str) -> &'static str {
    let Some(ext) = extension(name) else {
        return OCTET_STREAM;
    };
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" | "map" => "application/json",
        "txt" | "md" | "log" | "csv" => "text/plain; charset=utf-8",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "wasm" => "application/wasm",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        _ if SERVER_SCRIPT_EXTENSIONS.contains(&ext.as_str()) => PLAIN_TEXT,
        _ => OCTET_STREAM,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_scripts_case_insensitively() {
        assert!(is_server_script("site.php"));
        assert!(is_server_script("dir/INDEX.PHP"));
        assert!(is_server_script("legacy.phtml"));
        assert!(!is_server_script("index.html"));
        assert!(!is_server_script("php"));
        assert!(!is_server_script("archive.php.zip"));
    }

    #[test]
    fn guesses_common_types() {
        assert_eq!(guess("index.html"), "text/html; charset=utf-8");
        assert_eq!(guess("a/b/app.CSS"), "text/css; charset=utf-8");
        assert_eq!(guess("logo.svg"), "image/svg+xml");
        assert_eq!(guess(".htaccess"), OCTET_STREAM);
        assert_eq!(guess("README"), OCTET_STREAM);
        assert_eq!(guess("site.php"), PLAIN_TEXT);
    }
}
