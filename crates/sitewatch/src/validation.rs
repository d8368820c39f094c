//! Input validation for endpoint and project fields.

use url::Url;

use crate::error::{Result, StoreError};

/// Validate an HTTP/HTTPS URL that will be probed
pub fn validate_endpoint_url(target: &str) -> Result<()> {
    if target.trim().is_empty() {
        return Err(StoreError::BadRequest("URL cannot be empty".into()));
    }

    match Url::parse(target) {
        Ok(url) => {
            let scheme = url.scheme();
            if scheme != "http" && scheme != "https" {
                return Err(StoreError::BadRequest(format!(
                    "Invalid scheme '{scheme}'. Must be http or https"
                )));
            }

            if url.host_str().is_none() {
                return Err(StoreError::BadRequest("URL must have a valid host".into()));
            }

            Ok(())
        }
        Err(e) => {
            if !target.contains("://") {
                Err(StoreError::BadRequest("URL must include scheme (http:// or https://)".into()))
            } else {
                Err(StoreError::BadRequest(format!("Invalid URL: {e}")))
            }
        }
    }
}

/// Validate a display name (endpoint or project)
pub fn validate_name(field: &str, name: &str) -> Result<()> {
    const MAX_NAME_LEN: usize = 200;

    if name.trim().is_empty() {
        return Err(StoreError::BadRequest(format!("{field} cannot be empty")));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(StoreError::BadRequest(format!(
            "{field} is too long (max {MAX_NAME_LEN} characters)"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_http_and_https() {
        assert!(validate_endpoint_url("http://example.com").is_ok());
        assert!(validate_endpoint_url("https://example.com/health?deep=1").is_ok());
        assert!(validate_endpoint_url("http://127.0.0.1:8080/").is_ok());
    }

    #[test]
    fn test_rejects_other_schemes() {
        let err = validate_endpoint_url("ftp://example.com").unwrap_err();
        assert!(matches!(err, StoreError::BadRequest(msg) if msg.contains("ftp")));
    }

    #[test]
    fn test_rejects_missing_scheme_and_blank() {
        assert!(matches!(
            validate_endpoint_url("example.com"),
            Err(StoreError::BadRequest(msg)) if msg.contains("scheme")
        ));
        assert!(validate_endpoint_url("   ").is_err());
    }

    #[test]
    fn test_name_rules() {
        assert!(validate_name("name", "api").is_ok());
        assert!(validate_name("name", " ").is_err());
        assert!(validate_name("name", &"x".repeat(201)).is_err());
    }
}
