//! Search a serialized UI tree for a labelled view and locate its tap
//! target. The dump is the XML produced by `uiautomator dump`; matching is
//! a case-insensitive substring search, and the tap target is the center
//! of the first `bounds="[x1,y1][x2,y2]"` attribute after the match.

use regex::Regex;
use std::sync::OnceLock;

fn bounds_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"bounds="\[(-?\d+),(-?\d+)\]\[(-?\d+),(-?\d+)\]""#).expect("bounds pattern")
    })
}

/// Center of the bounding box of the first view whose serialized form
/// contains `label`, or `None` when no such view is on screen.
pub fn find_label_center(layout: &str, label: &str) -> Option<(i64, i64)> {
    if label.is_empty() {
        return None;
    }

    let haystack = layout.to_lowercase();
    let needle = label.to_lowercase();
    let at = haystack.find(&needle)?;

    let captures = bounds_pattern().captures(&layout[at..])?;
    let x1: i64 = captures[1].parse().ok()?;
    let y1: i64 = captures[2].parse().ok()?;
    let x2: i64 = captures[3].parse().ok()?;
    let y2: i64 = captures[4].parse().ok()?;

    Some(((x1 + x2) / 2, (y1 + y2) / 2))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = concat!(
        r#"<node text="Full backup" bounds="[0,96][1080,240]" />"#,
        r#"<node text="Back up my data" class="android.widget.Button" "#,
        r#"bounds="[540,1700][1080,1800]" />"#,
        r#"<node text="Do not back up" bounds="[0,1700][540,1800]" />"#,
    );

    #[test]
    fn finds_the_center_of_the_labelled_button() {
        let center = find_label_center(DUMP, "back up my data").expect("label present");
        assert_eq!(center, (810, 1750));
    }

    #[test]
    fn match_is_case_insensitive() {
        assert!(find_label_center(DUMP, "BACK UP MY DATA").is_some());
    }

    #[test]
    fn absent_label_yields_none() {
        assert!(find_label_center(DUMP, "restore my data").is_none());
        assert!(find_label_center(DUMP, "").is_none());
    }

    #[test]
    fn label_without_following_bounds_yields_none() {
        assert!(find_label_center(r#"<node text="back up my data" />"#, "back up my data").is_none());
    }
}
