use crate::feed::RawItem;
use crate::store::VideoRecord;
use regex::Regex;
use std::sync::OnceLock;

/// Unknown-date sentinel. Extraction never fails; it degrades to this.
pub const UNKNOWN_DATE_TOKEN: &str = "0000";

fn digit_run_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").expect("digit run regex"))
}

/// Caption text up to (excluding) the first hashtag marker `" #"`. Captions
/// without a marker are returned whole. Whitespace is trimmed either way.
pub fn extract_title(caption: &str) -> String {
    match caption.find(" #") {
        Some(idx) => caption[..idx].trim().to_string(),
        None => caption.trim().to_string(),
    }
}

/// First maximal run of exactly four consecutive digits in the caption.
/// Longer or shorter runs never match; with several four-digit runs the
/// first occurrence wins regardless of what it means.
pub fn extract_date_token(caption: &str) -> String {
    for run in digit_run_regex().find_iter(caption) {
        if run.as_str().len() == 4 {
            return run.as_str().to_string();
        }
    }
    UNKNOWN_DATE_TOKEN.to_string()
}

/// The one identity policy of the system: an upstream id is used verbatim
/// when present; otherwise the key is `{title}_{date_token}` derived from
/// the caption. Degenerate keys (empty caption gives `"_0000"`) are valid;
/// collisions between them are an accepted weakness of the heuristic, not
/// something to correct here.
pub fn derive_identity(upstream_id: &str, caption: &str) -> String {
    let trimmed = upstream_id.trim();
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }
    format!("{}_{}", extract_title(caption), extract_date_token(caption))
}

/// Build a Pending skeleton record from a raw feed item.
pub fn skeleton_from_item(item: &RawItem) -> VideoRecord {
    let caption = if item.title.trim().is_empty() {
        item.description.as_str()
    } else {
        item.title.as_str()
    };

    let identity_key = derive_identity(&item.id, caption);
    let title = extract_title(caption);
    let date_token = extract_date_token(caption);

    let source_url = Some(item.url.trim().to_string()).filter(|v| !v.is_empty());
    let cover_url = Some(item.cover.trim().to_string()).filter(|v| !v.is_empty());

    VideoRecord::skeleton(identity_key, title, date_token, source_url, cover_url)
}
