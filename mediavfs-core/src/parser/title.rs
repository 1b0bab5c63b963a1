use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

static COLLAPSE_WHITESPACE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex should compile"));

/// Release-group style tags: `[abc123]`, `{tag}`.
static BRACKET_TAG_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[[^\]]*\]|\{[^}]*\}").expect("bracket regex should compile"));

/// Leading track number: `01 - `, `1. `, `07_`.
static TRACK_PREFIX_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<no>\d{1,3})\s*(?:[-._]\s*|\s+)(?P<rest>.+)$")
        .expect("track prefix regex should compile")
});

/// Human readable title derived from a file name.
///
/// Directories keep their name verbatim; files lose their extension,
/// bracketed tags and separator punctuation. All-lowercase and
/// all-uppercase names are title-cased.
pub fn title_from_path(path: &Path, is_dir: bool) -> String {
    let raw = if is_dir {
        path.file_name()
    } else {
        path.file_stem()
    }
    .map(|name| name.to_string_lossy().into_owned())
    .unwrap_or_else(|| path.to_string_lossy().into_owned());

    if is_dir {
        return raw;
    }

    let stripped = BRACKET_TAG_REGEX.replace_all(&raw, " ");
    let spaced = stripped.replace(['.', '_'], " ");
    let title = COLLAPSE_WHITESPACE_REGEX
        .replace_all(spaced.trim(), " ")
        .to_string();
    if title.is_empty() {
        raw
    } else {
        normalize_case(&title)
    }
}

/// Mixed case is kept as written.
fn normalize_case(title: &str) -> String {
    let (mut lower, mut upper) = (false, false);
    for c in title.chars() {
        lower |= c.is_lowercase();
        upper |= c.is_uppercase();
    }
    if lower == upper {
        return title.to_string();
    }
    title
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split `01 - Song` into `(1, "Song")`.
pub fn split_track_prefix(title: &str) -> Option<(u32, String)> {
    let caps = TRACK_PREFIX_REGEX.captures(title.trim())?;
    let number = caps.name("no")?.as_str().parse().ok()?;
    let rest = caps.name("rest")?.as_str().trim();
    if rest.is_empty() {
        return None;
    }
    Some((number, rest.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_titles_drop_extension_and_tags() {
        assert_eq!(
            title_from_path(Path::new("/m/The.Big_Film [1080p].mkv"), false),
            "The Big Film"
        );
        assert_eq!(title_from_path(Path::new("/m/song.mp3"), false), "Song");
        assert_eq!(title_from_path(Path::new("/m/MY_SONG.mp3"), false), "My Song");
        assert_eq!(title_from_path(Path::new("/m/my_song.mp3"), false), "My Song");
        assert_eq!(
            title_from_path(Path::new("/m/02 - iPhone blues.mp3"), false),
            "02 - iPhone blues"
        );
        assert_eq!(title_from_path(Path::new("/m/2001.mkv"), false), "2001");
        assert_eq!(title_from_path(Path::new("/m/[x].mp3"), false), "[x]");
    }

    #[test]
    fn directory_titles_are_verbatim() {
        assert_eq!(
            title_from_path(Path::new("/m/Some.Album (2001)"), true),
            "Some.Album (2001)"
        );
    }

    #[test]
    fn track_prefixes_split() {
        assert_eq!(
            split_track_prefix("01 - Opening"),
            Some((1, "Opening".to_string()))
        );
        assert_eq!(split_track_prefix("7. Coda"), Some((7, "Coda".to_string())));
        assert_eq!(split_track_prefix("Opening"), None);
        assert_eq!(split_track_prefix("2001"), None);
    }
}
