use crate::config::Config;
use crate::lifecycle::JobDetails;

/// Join a base URL with path segments, normalizing duplicate slashes.
pub fn join_url(base: &str, paths: &[&str]) -> String {
    let mut joined = String::new();
    for p in paths {
        let p = p.trim_matches('/');
        if p.is_empty() {
            continue;
        }
        if !joined.is_empty() {
            joined.push('/');
        }
        joined.push_str(p);
    }
    format!("{}/{}", base.trim_end_matches('/'), joined)
}

/// Target URL of a Job backend for a call arriving at `url_path`.
pub fn target_url(cfg: &Config, job: &JobDetails, url_path: &str) -> String {
    format!(
        "{}://{}/{}",
        cfg.forward_to_protocol,
        job.internal_name,
        url_path.trim_start_matches('/')
    )
}

/// Strip scheme and host from a redirect URL so the client retries the
/// location relative to the proxy instead of the backend's internal name.
pub fn strip_host(location: &str) -> String {
    match reqwest::Url::parse(location) {
        Ok(url) => {
            let mut relative = url.path().to_string();
            if let Some(query) = url.query() {
                relative.push('?');
                relative.push_str(query);
            }
            if let Some(fragment) = url.fragment() {
                relative.push('#');
                relative.push_str(fragment);
            }
            relative
        }
        // Already relative (or unparseable): pass through untouched.
        Err(_) => location.to_string(),
    }
}
