use anyhow::{anyhow, bail, Context, Result};
use reqwest::Url;

/// key: upstream-url -> base url plus percent-encoded path segments
///
/// Every segment lands as exactly one path segment: `/`, `?` and `#` are
/// encoded, and dot segments are refused since they would climb the base path.
pub(crate) fn endpoint_url(base_url: &str, segments: &[&str]) -> Result<Url> {
    for segment in segments {
        if is_dot_or_empty(segment) {
            bail!("refusing upstream path segment {segment:?}");
        }
    }
    let mut url =
        Url::parse(base_url).with_context(|| format!("invalid upstream base url {base_url}"))?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("upstream base url {base_url} cannot carry a path"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn is_dot_or_empty(segment: &str) -> bool {
    matches!(
        segment.to_ascii_lowercase().as_str(),
        "" | "." | ".." | "%2e" | "%2e%2e" | ".%2e" | "%2e."
    )
}
