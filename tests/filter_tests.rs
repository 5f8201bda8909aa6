//! Filter engine behavior over built-in temp patterns and user patterns.

use std::path::Path;

use driftsync::config::FilterConfig;
use driftsync::filter::EventFilter;

fn filter(enabled: bool, patterns: &[&str]) -> EventFilter {
    EventFilter::new(&FilterConfig {
        enabled,
        patterns: patterns.iter().map(|s| s.to_string()).collect(),
    })
}

#[test]
fn test_swap_file_never_leaves_the_filter() {
    // editor swap churn is dropped regardless of user filtering
    let filter = filter(true, &[r".*\.swp$"]);
    assert!(filter.should_ignore(Path::new("/w/foo.swp")));
}

#[test]
fn test_builtin_temp_patterns_cover_common_churn() {
    let filter = filter(false, &[]);
    for name in [
        "a.swp",
        "a.swo",
        "a~",
        "a.tmp",
        "a.temp",
        "a.bak",
        ".DS_Store",
        "Thumbs.db",
        "desktop.ini",
        "a.crdownload",
        "a.part",
        "a.filepart",
    ] {
        let path = format!("/w/sub/{}", name);
        assert!(
            filter.should_ignore(Path::new(&path)),
            "{} must be filtered",
            name
        );
    }
}

#[test]
fn test_regular_files_pass_through() {
    let filter = filter(false, &[]);
    for name in ["a.txt", "partial.rs", "tmpfile", "backup"] {
        let path = format!("/w/{}", name);
        assert!(!filter.should_ignore(Path::new(&path)), "{} must pass", name);
    }
}

#[test]
fn test_user_pattern_matches_full_path() {
    // pattern anchored on a directory component only matches via full path
    let filter = filter(true, &["^/w/cache/"]);
    assert!(filter.should_ignore(Path::new("/w/cache/entry.bin")));
    assert!(!filter.should_ignore(Path::new("/w/data/entry.bin")));
}

#[test]
fn test_first_match_wins_across_sources() {
    // a path hit by both a temp pattern and a user pattern is simply ignored
    let filter = filter(true, &[r".*\.bak$"]);
    assert!(filter.should_ignore(Path::new("/w/old.bak")));
}

#[test]
fn test_stats_report_compiled_counts() {
    let filter = filter(true, &[r".*\.log$", "^build/"]);
    let stats = filter.stats();
    assert!(stats.enabled);
    assert_eq!(stats.user_patterns, 2);
    assert_eq!(stats.temp_patterns, 12);
}
