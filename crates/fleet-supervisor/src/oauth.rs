//! Seam for the OAuth agent collaborator.
//!
//! The supervisor only needs a preflight predicate and a way to kick off a
//! flow; protocol mechanics (browser round-trip, token exchange, event
//! publication) live behind this trait.

use anyhow::Result;
use async_trait::async_trait;

use fleet_config::UpstreamConfig;

#[async_trait]
pub trait OAuthAgent: Send + Sync {
    /// Whether connects for this upstream must hold a usable token.
    fn should_use_oauth(&self, config: &UpstreamConfig) -> bool;

    /// Perform the authorization flow and store the resulting token.
    ///
    /// Implementations publish an [`OAuthCompletionEvent`] when they can, so
    /// sibling processes pick the token up promptly; the supervisor's token
    /// scan covers the case where they cannot.
    ///
    /// [`OAuthCompletionEvent`]: fleet_store::OAuthCompletionEvent
    async fn start_flow(&self, config: &UpstreamConfig) -> Result<()>;
}

/// Agent for deployments without an interactive browser.
///
/// Upstreams that need OAuth fail with an `oauth_required`-classified error
/// until a token shows up in the store (written by an external CLI); the
/// token scan then retries the connection.
#[derive(Debug, Default)]
pub struct NoopOAuthAgent;

#[async_trait]
impl OAuthAgent for NoopOAuthAgent {
    fn should_use_oauth(&self, config: &UpstreamConfig) -> bool {
        config.oauth.is_some()
    }

    async fn start_flow(&self, config: &UpstreamConfig) -> Result<()> {
        anyhow::bail!(
            "authorization required for '{}': no interactive OAuth agent is available; \
             complete the flow externally and store the token",
            config.name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_config::{OAuthConfig, UpstreamTransport};
    use std::collections::HashMap;

    fn remote(name: &str, oauth: Option<OAuthConfig>) -> UpstreamConfig {
        let mut cfg = UpstreamConfig::new(
            name,
            UpstreamTransport::StreamableHttp {
                url: "https://example.com/mcp".to_string(),
                headers: HashMap::new(),
                allow_insecure: false,
            },
        );
        cfg.oauth = oauth;
        cfg
    }

    #[tokio::test]
    async fn noop_agent_requires_oauth_only_when_configured() {
        let agent = NoopOAuthAgent;
        assert!(!agent.should_use_oauth(&remote("a", None)));
        assert!(agent.should_use_oauth(&remote("b", Some(OAuthConfig::default()))));
    }

    #[tokio::test]
    async fn noop_agent_flow_reports_authorization_required() {
        let agent = NoopOAuthAgent;
        let err = agent
            .start_flow(&remote("g", Some(OAuthConfig::default())))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("authorization required"), "{message}");
        assert!(message.contains("'g'"), "{message}");
    }
}
