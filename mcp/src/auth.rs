//! Security gate: verifies bearer credentials, binds principals to
//! connections, intersects permissions, and polices per-agent tool
//! allow-lists.
//!
//! Credentials are short-lived HS256 tokens. The first frame on a connection
//! must be an EVENT carrying one; afterwards the token is re-verified lazily
//! whenever a message requests a capability the connection has not used yet.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use wire::{AgentDescriptor, Body, ErrorCode, Message};

const DEFAULT_MISUSE_THRESHOLD: u32 = 3;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("first frame must be an event bearing a security token")]
    AuthRequired,
    #[error("token rejected: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("permission '{0}' denied")]
    PermissionDenied(String),
    #[error("tool '{tool}' not in allow-list of agent '{agent_id}'")]
    ToolDenied { agent_id: String, tool: String },
}

impl AuthError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AuthError::AuthRequired | AuthError::InvalidToken(_) => ErrorCode::AuthRequired,
            AuthError::PermissionDenied(_) | AuthError::ToolDenied { .. } => {
                ErrorCode::PermissionDenied
            }
        }
    }
}

/// Token claims: subject, granted permissions, and the standard expiries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub exp: i64,
    pub iat: i64,
}

/// Verified identity bound to a connection.
#[derive(Debug, Clone)]
pub struct Principal {
    pub subject: String,
    pub permissions: HashSet<String>,
}

impl Principal {
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }
}

/// Verifies credentials and enforces the tool allow-list.
pub struct SecurityGate {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    misuse_threshold: u32,
    misuse: DashMap<String, u32>,
}

impl SecurityGate {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 5;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            misuse_threshold: DEFAULT_MISUSE_THRESHOLD,
            misuse: DashMap::new(),
        }
    }

    pub fn with_misuse_threshold(mut self, threshold: u32) -> Self {
        self.misuse_threshold = threshold;
        self
    }

    /// Mints a credential. Agents and the ingress adapter use this; the gate
    /// itself only ever verifies.
    pub fn issue(
        &self,
        subject: &str,
        permissions: &[String],
        ttl: Duration,
    ) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: subject.to_string(),
            permissions: permissions.to_vec(),
            iat: now,
            exp: now + ttl.as_secs() as i64,
        };
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &self.encoding,
        )?)
    }

    /// Verifies a token and produces the principal it names.
    pub fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)?;
        Ok(Principal {
            subject: data.claims.sub,
            permissions: data.claims.permissions.into_iter().collect(),
        })
    }

    /// Gate for the first frame on a connection: must be an EVENT with a
    /// valid token, or the connection is closed with `AUTH_REQUIRED`.
    pub fn authenticate_first_frame(&self, msg: &Message) -> Result<Principal, AuthError> {
        if !matches!(msg.body, Body::Event(_)) {
            return Err(AuthError::AuthRequired);
        }
        let token = msg.security_token.as_deref().ok_or(AuthError::AuthRequired)?;
        self.verify(token)
    }

    /// Lazy per-message re-verification: a capability already authorized on
    /// this connection passes without touching the token; a new one forces a
    /// fresh verification (catching expiry) before being remembered.
    pub fn authorize_capability(
        &self,
        msg: &Message,
        authorized: &mut HashSet<String>,
        capability: &str,
    ) -> Result<(), AuthError> {
        if authorized.contains(capability) {
            return Ok(());
        }
        let token = msg.security_token.as_deref().ok_or(AuthError::AuthRequired)?;
        let principal = self.verify(token)?;
        if !principal.permissions.is_empty() && !principal.has_permission(capability) {
            return Err(AuthError::PermissionDenied(capability.to_string()));
        }
        authorized.insert(capability.to_string());
        Ok(())
    }

    /// Effective permissions of a message: the intersection of what the
    /// message asks for and what the principal holds. A message listing
    /// nothing inherits the principal's full set.
    pub fn effective_permissions(&self, principal: &Principal, msg: &Message) -> HashSet<String> {
        if msg.permissions.is_empty() {
            return principal.permissions.clone();
        }
        msg.permissions
            .iter()
            .filter(|p| principal.permissions.contains(*p))
            .cloned()
            .collect()
    }

    /// Enforces the sub-agent tool allow-list. A violation counts toward the
    /// misuse threshold the registry acts on.
    pub fn authorize_tool(
        &self,
        descriptor: &AgentDescriptor,
        tool: &str,
    ) -> Result<(), AuthError> {
        if descriptor.allowed_tools.contains(tool) {
            return Ok(());
        }
        self.record_misuse(&descriptor.agent_id);
        Err(AuthError::ToolDenied {
            agent_id: descriptor.agent_id.clone(),
            tool: tool.to_string(),
        })
    }

    /// Bumps the misuse counter; returns the new count.
    pub fn record_misuse(&self, agent_id: &str) -> u32 {
        let mut entry = self.misuse.entry(agent_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// True once an agent has crossed the misuse threshold; the registry
    /// moves it to UNHEALTHY.
    pub fn misuse_exceeded(&self, agent_id: &str) -> bool {
        self.misuse
            .get(agent_id)
            .map(|c| *c >= self.misuse_threshold)
            .unwrap_or(false)
    }
}
