use crate::prelude::*;
use crate::error::TerrasyncError;

/// Outcome of running an archive entry's intended path through the
/// safety filter, and (for `Stop`) a signal to abort extraction cleanly
/// rather than error out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOutcome {
    Accepted,
    Skipped,
    Modified(String),
    Stop,
}

/// A caller-installable hook for narrowing which archive entries get
/// written, and where. This only ever runs on a path that has already
/// passed [`default_filter_path`] -- see [`apply_filter`] -- so an
/// override here cannot itself disable the baseline safety checks.
pub trait PathFilter {
    fn filter_path(&self, path: &str) -> FilterOutcome {
        FilterOutcome::Accepted
    }
}

/// The baseline checks applied to every archive entry before any disk
/// mutation, regardless of which `PathFilter` is installed: reject
/// empty, absolute, or `..`-containing paths.
pub fn default_filter_path(path: &str) -> FilterOutcome {
    if path.is_empty() || path.starts_with('/') || path.contains("..") {
        warn!(
            "{}",
            TerrasyncError::UnsafeArchivePath {
                path: path.to_string()
            }
        );
        return FilterOutcome::Skipped;
    }
    FilterOutcome::Accepted
}

/// Runs `path` through the non-overridable baseline checks first, then
/// -- only if it survives those -- through the caller's `filter`, so a
/// custom filter can only narrow what the baseline already accepted,
/// never widen it back open.
pub fn apply_filter(path: &str, filter: &dyn PathFilter) -> FilterOutcome {
    match default_filter_path(path) {
        FilterOutcome::Accepted => filter.filter_path(path),
        other => other,
    }
}

/// A filter that applies only the baseline checks.
pub struct DefaultPathFilter;

impl PathFilter for DefaultPathFilter {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_absolute_and_traversal() {
        assert_eq!(default_filter_path(""), FilterOutcome::Skipped);
        assert_eq!(default_filter_path("/etc/passwd"), FilterOutcome::Skipped);
        assert_eq!(default_filter_path("../escape"), FilterOutcome::Skipped);
        assert_eq!(default_filter_path("a/b.txt"), FilterOutcome::Accepted);
    }

    struct AcceptEverything;
    impl PathFilter for AcceptEverything {
        fn filter_path(&self, _path: &str) -> FilterOutcome {
            FilterOutcome::Accepted
        }
    }

    #[test]
    fn custom_filter_cannot_override_baseline_safety() {
        let filter = AcceptEverything;
        assert_eq!(
            apply_filter("../escape", &filter),
            FilterOutcome::Skipped
        );
        assert_eq!(
            apply_filter("/etc/passwd", &filter),
            FilterOutcome::Skipped
        );
        assert_eq!(apply_filter("a/b.txt", &filter), FilterOutcome::Accepted);
    }
}
