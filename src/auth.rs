use axum::http::HeaderMap;

/// Header carrying the caller's credential, as a header or a cookie.
pub const AUTH_HEADER: &str = "X-Racetrack-Auth";

/// Read the caller's auth token from the request. The token may arrive as a
/// header or as a cookie of the same name; cookie values are URL-escaped by
/// Lifecycle to survive quoting.
pub fn get_auth_token(headers: &HeaderMap) -> String {
    if let Some(value) = headers.get(AUTH_HEADER).and_then(|v| v.to_str().ok()) {
        if !value.is_empty() {
            return value.to_string();
        }
    }
    if let Some(value) = read_cookie(headers, AUTH_HEADER) {
        return value;
    }
    String::new()
}

fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for cookie_header in headers.get_all(axum::http::header::COOKIE) {
        let Ok(cookies) = cookie_header.to_str() else {
            continue;
        };
        for pair in cookies.split(';') {
            let Some((key, value)) = pair.trim().split_once('=') else {
                continue;
            };
            if key == name {
                return match urlencoding::decode(value) {
                    Ok(decoded) => Some(decoded.into_owned()),
                    Err(err) => {
                        tracing::error!(error = %err, "un-escaping cookie value");
                        None
                    }
                };
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn token_from_header_wins_over_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTH_HEADER, HeaderValue::from_static("header-token"));
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("X-Racetrack-Auth=cookie-token"),
        );
        assert_eq!(get_auth_token(&headers), "header-token");
    }

    #[test]
    fn cookie_token_is_unescaped() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("other=1; X-Racetrack-Auth=ey%3DJh%2Bbc"),
        );
        assert_eq!(get_auth_token(&headers), "ey=Jh+bc");
    }

    #[test]
    fn missing_credential_yields_empty_token() {
        assert_eq!(get_auth_token(&HeaderMap::new()), "");
    }
}
