//! Authentication helpers
//!
//! Implements timing-safe comparisons, local-direct detection, and gateway
//! token/password authorization for hub handshakes.

use std::env;
use std::net::{IpAddr, SocketAddr};

use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMode {
    /// No credentials required; only permitted for loopback clients.
    None,
    Token,
    Password,
}

#[derive(Clone, Debug)]
pub struct ResolvedGatewayAuth {
    pub mode: AuthMode,
    pub token: Option<String>,
    pub password: Option<String>,
}

impl Default for ResolvedGatewayAuth {
    fn default() -> Self {
        Self {
            mode: AuthMode::Token,
            token: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayAuthMethod {
    Local,
    Token,
    Password,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayAuthFailure {
    TokenMissingConfig,
    TokenMissing,
    TokenMismatch,
    PasswordMissingConfig,
    PasswordMissing,
    PasswordMismatch,
    Unauthorized,
}

impl GatewayAuthFailure {
    pub fn message(self) -> &'static str {
        match self {
            GatewayAuthFailure::TokenMissingConfig => {
                "unauthorized: gateway token not configured (set gateway.auth.token)"
            }
            GatewayAuthFailure::TokenMissing => "unauthorized: token missing",
            GatewayAuthFailure::TokenMismatch => "unauthorized: token mismatch",
            GatewayAuthFailure::PasswordMissingConfig => {
                "unauthorized: gateway password not configured (set gateway.auth.password)"
            }
            GatewayAuthFailure::PasswordMissing => "unauthorized: password missing",
            GatewayAuthFailure::PasswordMismatch => "unauthorized: password mismatch",
            GatewayAuthFailure::Unauthorized => "unauthorized",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayAuthResult {
    pub ok: bool,
    pub method: Option<GatewayAuthMethod>,
    pub reason: Option<GatewayAuthFailure>,
}

impl GatewayAuthResult {
    fn accepted(method: GatewayAuthMethod) -> Self {
        Self {
            ok: true,
            method: Some(method),
            reason: None,
        }
    }

    fn rejected(reason: GatewayAuthFailure) -> Self {
        Self {
            ok: false,
            method: None,
            reason: Some(reason),
        }
    }
}

/// Timing-safe string equality.
pub fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut out = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        out |= x ^ y;
    }
    out == 0
}

/// Resolve gateway auth from the config `gateway.auth` section plus env
/// overrides (`CLAWDBOT_GATEWAY_TOKEN`, `CLAWDBOT_GATEWAY_PASSWORD`).
///
/// When no mode is set, password wins if configured, otherwise token.
pub fn resolve_gateway_auth(cfg: &Value) -> Result<ResolvedGatewayAuth, String> {
    let auth_obj = cfg
        .get("gateway")
        .and_then(|g| g.get("auth"))
        .and_then(|v| v.as_object());

    let mode = auth_obj
        .and_then(|o| o.get("mode"))
        .and_then(|v| v.as_str())
        .unwrap_or_default();

    let token = env::var("CLAWDBOT_GATEWAY_TOKEN").ok().or_else(|| {
        auth_obj
            .and_then(|o| o.get("token"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    });
    let password = env::var("CLAWDBOT_GATEWAY_PASSWORD").ok().or_else(|| {
        auth_obj
            .and_then(|o| o.get("password"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    });

    let resolved_mode = match mode {
        "none" | "local" => AuthMode::None,
        "password" => AuthMode::Password,
        "token" => AuthMode::Token,
        "" => {
            if password.is_some() {
                AuthMode::Password
            } else {
                AuthMode::Token
            }
        }
        other => {
            return Err(format!(
                "unknown gateway auth mode '{other}'; expected one of: none, local, token, password"
            ));
        }
    };

    Ok(ResolvedGatewayAuth {
        mode: resolved_mode,
        token,
        password,
    })
}

/// Authorize a hub connect attempt.
pub fn authorize_gateway_connect(
    auth: &ResolvedGatewayAuth,
    token: Option<&str>,
    password: Option<&str>,
    is_local: bool,
) -> GatewayAuthResult {
    match auth.mode {
        AuthMode::None => {
            if is_local {
                GatewayAuthResult::accepted(GatewayAuthMethod::Local)
            } else {
                GatewayAuthResult::rejected(GatewayAuthFailure::Unauthorized)
            }
        }
        AuthMode::Token => {
            let Some(expected) = auth.token.as_deref() else {
                return GatewayAuthResult::rejected(GatewayAuthFailure::TokenMissingConfig);
            };
            let Some(provided) = token else {
                return GatewayAuthResult::rejected(GatewayAuthFailure::TokenMissing);
            };
            if timing_safe_eq(expected, provided) {
                GatewayAuthResult::accepted(GatewayAuthMethod::Token)
            } else {
                GatewayAuthResult::rejected(GatewayAuthFailure::TokenMismatch)
            }
        }
        AuthMode::Password => {
            let Some(expected) = auth.password.as_deref() else {
                return GatewayAuthResult::rejected(GatewayAuthFailure::PasswordMissingConfig);
            };
            let Some(provided) = password else {
                return GatewayAuthResult::rejected(GatewayAuthFailure::PasswordMissing);
            };
            if timing_safe_eq(expected, provided) {
                GatewayAuthResult::accepted(GatewayAuthMethod::Password)
            } else {
                GatewayAuthResult::rejected(GatewayAuthFailure::PasswordMismatch)
            }
        }
    }
}

/// Check if an IP address is loopback (including IPv4-mapped IPv6 loopback).
pub fn is_loopback_addr(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.octets()[0] == 127,
        IpAddr::V6(v6) => {
            v6.is_loopback() || {
                let octets = v6.octets();
                octets[0..10] == [0; 10]
                    && octets[10] == 0xff
                    && octets[11] == 0xff
                    && octets[12] == 127
            }
        }
    }
}

/// Determine if the peer connects directly from the local machine.
pub fn is_local_direct(remote_addr: SocketAddr) -> bool {
    is_loopback_addr(remote_addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_timing_safe_eq() {
        assert!(timing_safe_eq("abc", "abc"));
        assert!(!timing_safe_eq("abc", "abd"));
        assert!(!timing_safe_eq("abc", "ab"));
        assert!(!timing_safe_eq("ab", "abc"));
        assert!(timing_safe_eq("", ""));
    }

    #[test]
    fn test_token_auth_accepts_matching_token() {
        let auth = ResolvedGatewayAuth {
            mode: AuthMode::Token,
            token: Some("secret".to_string()),
            password: None,
        };
        let result = authorize_gateway_connect(&auth, Some("secret"), None, false);
        assert!(result.ok);
        assert_eq!(result.method, Some(GatewayAuthMethod::Token));
    }

    #[test]
    fn test_token_auth_rejects_mismatch() {
        let auth = ResolvedGatewayAuth {
            mode: AuthMode::Token,
            token: Some("secret".to_string()),
            password: None,
        };
        let result = authorize_gateway_connect(&auth, Some("wrong"), None, false);
        assert!(!result.ok);
        assert_eq!(result.reason, Some(GatewayAuthFailure::TokenMismatch));
    }

    #[test]
    fn test_token_auth_requires_configured_token() {
        let auth = ResolvedGatewayAuth::default();
        let result = authorize_gateway_connect(&auth, Some("anything"), None, false);
        assert!(!result.ok);
        assert_eq!(result.reason, Some(GatewayAuthFailure::TokenMissingConfig));
    }

    #[test]
    fn test_password_auth() {
        let auth = ResolvedGatewayAuth {
            mode: AuthMode::Password,
            token: None,
            password: Some("hunter2".to_string()),
        };
        assert!(authorize_gateway_connect(&auth, None, Some("hunter2"), false).ok);
        let result = authorize_gateway_connect(&auth, None, None, false);
        assert_eq!(result.reason, Some(GatewayAuthFailure::PasswordMissing));
    }

    #[test]
    fn test_none_mode_only_for_local() {
        let auth = ResolvedGatewayAuth {
            mode: AuthMode::None,
            token: None,
            password: None,
        };
        assert!(authorize_gateway_connect(&auth, None, None, true).ok);
        assert!(!authorize_gateway_connect(&auth, None, None, false).ok);
    }

    #[test]
    fn test_resolve_mode_defaults_to_password_when_configured() {
        let cfg = json!({ "gateway": { "auth": { "password": "pw" } } });
        let resolved = resolve_gateway_auth(&cfg).unwrap();
        assert_eq!(resolved.mode, AuthMode::Password);
    }

    #[test]
    fn test_resolve_rejects_unknown_mode() {
        let cfg = json!({ "gateway": { "auth": { "mode": "carrier-pigeon" } } });
        assert!(resolve_gateway_auth(&cfg).is_err());
    }

    #[test]
    fn test_is_loopback_addr() {
        assert!(is_loopback_addr("127.0.0.1".parse().unwrap()));
        assert!(is_loopback_addr("127.8.4.2".parse().unwrap()));
        assert!(is_loopback_addr("::1".parse().unwrap()));
        assert!(is_loopback_addr("::ffff:127.0.0.1".parse().unwrap()));
        assert!(!is_loopback_addr("192.168.1.1".parse().unwrap()));
        assert!(!is_loopback_addr("8.8.8.8".parse().unwrap()));
    }
}
