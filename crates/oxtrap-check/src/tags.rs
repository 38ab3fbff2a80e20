//! Stream tag encoding.
//!
//! Tags ride inside the metric name as `name|ST[b"<cat>":b"<val>",...]`, with
//! both sides base64 encoded. Input tags are lowercased, trimmed, deduplicated
//! and sorted so the same tag set always produces the same encoded name.

use std::collections::BTreeSet;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use oxtrap_common::types::Tag;

/// Most stream tags the broker accepts on one metric.
pub const MAX_TAGS: usize = 256;

const STREAM_TAG_MARKER: &str = "|ST[";
const ENCODED_PREFIX: &str = "b\"";

fn is_pre_encoded(component: &str) -> bool {
    component.len() >= 3 && component.starts_with(ENCODED_PREFIX) && component.ends_with('"')
}

fn normalize_component(component: &str) -> String {
    let trimmed = component.trim();
    // base64 is case sensitive
    if is_pre_encoded(trimmed) {
        trimmed.to_string()
    } else {
        trimmed.to_lowercase()
    }
}

/// Lowercases and trims both sides. Returns `None` when nothing is left.
pub fn normalize(tag: &Tag) -> Option<Tag> {
    let category = normalize_component(&tag.category);
    let value = normalize_component(&tag.value);
    if category.is_empty() && value.is_empty() {
        return None;
    }
    Some(Tag { category, value })
}

/// Normalized, deduplicated tags in a stable sorted order.
pub fn unique_tags(tags: &[Tag]) -> Vec<Tag> {
    tags.iter()
        .filter_map(normalize)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Renders tags in the plain `category:value` form used by check bundle tags.
pub fn encode_metric_tags(tags: &[Tag]) -> Vec<String> {
    unique_tags(tags).iter().map(ToString::to_string).collect()
}

fn encode_component(component: &str) -> String {
    let stripped: String = component.chars().filter(|c| !c.is_whitespace()).collect();
    if is_pre_encoded(&stripped) {
        return stripped;
    }
    format!("{ENCODED_PREFIX}{}\"", STANDARD.encode(stripped.as_bytes()))
}

/// Encodes tags into the comma separated body of an `|ST[...]` block.
///
/// Tags past [`MAX_TAGS`] are dropped with a warning. Stream tags need both a
/// category and a value, so one-sided tags are skipped.
pub fn encode_stream_tags(tags: &[Tag]) -> String {
    let unique = unique_tags(tags);
    if unique.len() > MAX_TAGS {
        tracing::warn!(
            num = unique.len(),
            max = MAX_TAGS,
            "ignoring tags over max"
        );
    }

    let mut encoded = Vec::with_capacity(unique.len().min(MAX_TAGS));
    for tag in unique.iter().take(MAX_TAGS) {
        if tag.category.is_empty() || tag.value.is_empty() {
            tracing::debug!(tag = %tag, "stream tags need a category and a value, skipping");
            continue;
        }
        encoded.push(format!(
            "{}:{}",
            encode_component(&tag.category),
            encode_component(&tag.value)
        ));
    }
    encoded.join(",")
}

/// Appends encoded stream tags to `name`.
///
/// A name that already carries an `|ST[` block is returned untouched; its
/// tags are assumed to be managed by the caller.
pub fn metric_name_with_stream_tags(name: &str, tags: &[Tag]) -> String {
    if tags.is_empty() || name.contains(STREAM_TAG_MARKER) {
        return name.to_string();
    }
    let encoded = encode_stream_tags(tags);
    if encoded.is_empty() {
        return name.to_string();
    }
    format!("{name}{STREAM_TAG_MARKER}{encoded}]")
}
