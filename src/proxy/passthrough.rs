use crate::config::types::PassthroughConfig;
use crate::error::ProxyError;

/// Rewrites requests under one configured URL prefix to a fixed external
/// API, keeping them on the rotation path. `/prefix/v2/x?q=1` becomes
/// `<target>/v2/x?q=1` with the target's host as `Host`.
pub struct PassthroughRewriter {
    prefix: String,
    target: String,
    target_host: String,
}

impl PassthroughRewriter {
    pub fn new(cfg: &PassthroughConfig) -> Result<Self, ProxyError> {
        let prefix = cfg.prefix.trim_matches('/').to_string();
        if prefix.is_empty() {
            return Err(ProxyError::Config("passthrough prefix is empty".to_string()));
        }
        let target = cfg.target.trim_end_matches('/').to_string();
        let uri: http::Uri = target
            .parse()
            .map_err(|e| ProxyError::Config(format!("passthrough target: {}", e)))?;
        let target_host = uri
            .authority()
            .map(|a| a.to_string())
            .ok_or_else(|| ProxyError::Config("passthrough target has no host".to_string()))?;
        Ok(Self {
            prefix,
            target,
            target_host,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        match path.strip_prefix('/').and_then(|p| p.strip_prefix(&self.prefix)) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    pub fn target_host(&self) -> &str {
        &self.target_host
    }

    /// Rewrite a matched path-and-query into the absolute target URL.
    pub fn rewrite(&self, path: &str, query: Option<&str>) -> String {
        let rest = path
            .strip_prefix('/')
            .and_then(|p| p.strip_prefix(&self.prefix))
            .unwrap_or("");
        let rest = if rest.is_empty() { "/" } else { rest };
        match query {
            Some(q) if !q.is_empty() => format!("{}{}?{}", self.target, rest, q),
            _ => format!("{}{}", self.target, rest),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewriter() -> PassthroughRewriter {
        PassthroughRewriter::new(&PassthroughConfig {
            prefix: "api-prefix".to_string(),
            target: "https://example.upstream".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_matches_prefix_and_subpaths_only() {
        let r = rewriter();
        assert!(r.matches("/api-prefix"));
        assert!(r.matches("/api-prefix/"));
        assert!(r.matches("/api-prefix/v2/status"));
        assert!(!r.matches("/api-prefixes"));
        assert!(!r.matches("/other"));
        assert!(!r.matches("/"));
    }

    #[test]
    fn test_rewrite_keeps_subpath_and_query() {
        let r = rewriter();
        assert_eq!(
            r.rewrite("/api-prefix/v2/status", Some("x=1")),
            "https://example.upstream/v2/status?x=1"
        );
        assert_eq!(r.target_host(), "example.upstream");
    }

    #[test]
    fn test_rewrite_bare_prefix_hits_target_root() {
        let r = rewriter();
        assert_eq!(r.rewrite("/api-prefix", None), "https://example.upstream/");
        assert_eq!(
            r.rewrite("/api-prefix", Some("q=2")),
            "https://example.upstream/?q=2"
        );
    }

    #[test]
    fn test_sloppy_config_is_normalized() {
        let r = PassthroughRewriter::new(&PassthroughConfig {
            prefix: "/api/".to_string(),
            target: "https://example.upstream/".to_string(),
        })
        .unwrap();
        assert!(r.matches("/api/v1"));
        assert_eq!(r.rewrite("/api/v1", None), "https://example.upstream/v1");
    }

    #[test]
    fn test_target_with_port() {
        let r = PassthroughRewriter::new(&PassthroughConfig {
            prefix: "api".to_string(),
            target: "http://internal:8443".to_string(),
        })
        .unwrap();
        assert_eq!(r.target_host(), "internal:8443");
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(PassthroughRewriter::new(&PassthroughConfig {
            prefix: "//".to_string(),
            target: "https://example.upstream".to_string(),
        })
        .is_err());
    }
}
