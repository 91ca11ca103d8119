//! URL construction shared by the REST clients.

use reqwest::Url;

use crate::error::{Error, Result};

/// Parses the base URL of a REST service.
pub(crate) fn parse_base_url(base_url: &str) -> Result<Url> {
    let url = Url::parse(base_url)
        .map_err(|e| Error::Config(format!("invalid base URL {:?}: {}", base_url, e)))?;
    if url.cannot_be_a_base() {
        return Err(Error::Config(format!("{:?} cannot be a base URL", base_url)));
    }
    Ok(url)
}

/// Appends `segments` to `base`, each percent-encoded as exactly one path
/// segment.
///
/// Ids come from callers, so an empty, `.` or `..` segment is rejected
/// instead of being resolved against the base path.
pub(crate) fn endpoint(base: &Url, segments: &[&str]) -> Result<Url> {
    if let Some(bad) = segments.iter().find(|s| matches!(**s, "" | "." | "..")) {
        return Err(Error::InvalidId(bad.to_string()));
    }
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| Error::Config(format!("{} cannot be a base URL", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        parse_base_url("https://api.example.dev/v1/").unwrap()
    }

    #[test]
    fn segments_are_appended_under_the_base_path() {
        let url = endpoint(&base(), &["projects", "p1", "versions", "3"]).unwrap();
        assert_eq!(url.as_str(), "https://api.example.dev/v1/projects/p1/versions/3");
    }

    #[test]
    fn slashes_in_ids_stay_inside_one_segment() {
        let url = endpoint(&base(), &["sandboxes", "x/../../admin"]).unwrap();
        assert_eq!(url.as_str(), "https://api.example.dev/v1/sandboxes/x%2F..%2F..%2Fadmin");
        assert_eq!(url.path_segments().unwrap().count(), 3);
    }

    #[test]
    fn dot_segments_are_rejected() {
        for id in ["..", ".", ""] {
            let err = endpoint(&base(), &["projects", id]).unwrap_err();
            assert!(matches!(err, Error::InvalidId(_)));
        }
    }

    #[test]
    fn base_url_must_be_hierarchical() {
        assert!(matches!(parse_base_url("mailto:ops@example.dev"), Err(Error::Config(_))));
        assert!(matches!(parse_base_url("not a url"), Err(Error::Config(_))));
    }
}
