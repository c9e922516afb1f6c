//! Capability tokens and the immutable per-session policy.
//!
//! A [`CapabilityPolicy`] is fixed when a session is created.  It is consulted
//! exactly once, while the worker builds the plugin's import namespace: a
//! token that is absent simply means the matching host module is never
//! defined, so there is nothing to re-check per call.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};

/// A permission drawn from the closed token set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CapabilityToken {
    /// Exposes the `buffer` host module (base64/hex codecs).
    #[serde(rename = "buffer:access")]
    BufferAccess,
    /// Exposes the `crypto` host module (hashing, HMAC, randomness).
    #[serde(rename = "crypto:access")]
    CryptoAccess,
    #[serde(rename = "file:read")]
    FileRead,
    #[serde(rename = "file:write")]
    FileWrite,
    #[serde(rename = "network:http")]
    NetworkHttp,
}

impl CapabilityToken {
    /// Every token, in wire order.
    pub const ALL: [CapabilityToken; 5] = [
        Self::BufferAccess,
        Self::CryptoAccess,
        Self::FileRead,
        Self::FileWrite,
        Self::NetworkHttp,
    ];

    /// The wire representation of this token.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BufferAccess => "buffer:access",
            Self::CryptoAccess => "crypto:access",
            Self::FileRead => "file:read",
            Self::FileWrite => "file:write",
            Self::NetworkHttp => "network:http",
        }
    }

    /// The host import namespace this token unlocks, if any.
    pub fn import_module(&self) -> Option<&'static str> {
        match self {
            Self::BufferAccess => Some("buffer"),
            Self::CryptoAccess => Some("crypto"),
            Self::FileRead | Self::FileWrite | Self::NetworkHttp => None,
        }
    }

    /// Reverse lookup: which token gates the given import namespace.
    pub fn for_import_module(module: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|token| token.import_module() == Some(module))
    }
}

impl fmt::Display for CapabilityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityToken {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|token| token.as_str() == s)
            .ok_or_else(|| SandboxError::UnknownCapability(s.to_owned()))
    }
}

/// The immutable set of capabilities granted to one session.
///
/// There is deliberately no way to add a token after construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityPolicy {
    tokens: BTreeSet<CapabilityToken>,
}

impl CapabilityPolicy {
    /// A policy granting nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse a policy from wire strings, failing on the first unknown token.
    pub fn parse<I, S>(tokens: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tokens = tokens
            .into_iter()
            .map(|raw| raw.as_ref().trim().parse())
            .collect::<Result<BTreeSet<_>>>()?;
        Ok(Self { tokens })
    }

    pub fn allows(&self, token: CapabilityToken) -> bool {
        self.tokens.contains(&token)
    }

    pub fn tokens(&self) -> impl Iterator<Item = CapabilityToken> + '_ {
        self.tokens.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Wire strings of the granted tokens, sorted.
    pub fn to_strings(&self) -> Vec<String> {
        self.tokens.iter().map(|t| t.as_str().to_owned()).collect()
    }
}

impl FromIterator<CapabilityToken> for CapabilityPolicy {
    fn from_iter<T: IntoIterator<Item = CapabilityToken>>(iter: T) -> Self {
        Self {
            tokens: iter.into_iter().collect(),
        }
    }
}
