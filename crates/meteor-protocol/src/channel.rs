//! Channel identifiers.
//!
//! A [`ChannelId`] is a validated, pre-split channel path. Meta channels
//! (`/meta/...`) carry protocol operations, service channels
//! (`/service/...`) are private request/response channels, and paths ending
//! in `/*` or `/**` are subscription patterns.

use std::fmt;

use crate::codec::ProtocolError;

/// Maximum channel path length in bytes.
pub const MAX_CHANNEL_PATH_LENGTH: usize = 1024;

/// Prefix of meta channels.
pub const META_PREFIX: &str = "/meta/";

/// Prefix of service channels.
pub const SERVICE_PREFIX: &str = "/service/";

/// Well-known meta channel paths.
pub mod meta {
    pub const HANDSHAKE: &str = "/meta/handshake";
    pub const CONNECT: &str = "/meta/connect";
    pub const DISCONNECT: &str = "/meta/disconnect";
    pub const SUBSCRIBE: &str = "/meta/subscribe";
    pub const UNSUBSCRIBE: &str = "/meta/unsubscribe";
}

/// Kind of channel, derived from its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Meta,
    Service,
    /// Pattern matching exactly one trailing segment (`/a/*`).
    Wild,
    /// Pattern matching one or more trailing segments (`/a/**`).
    DeepWild,
    Application,
}

/// A parsed channel path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId {
    path: String,
    segments: Vec<String>,
    kind: ChannelKind,
}

/// Validate a channel path.
///
/// # Errors
///
/// Returns the reason the path is not a valid channel.
pub fn validate_channel_path(path: &str) -> Result<(), &'static str> {
    if path.is_empty() {
        return Err("channel path cannot be empty");
    }
    if path.len() > MAX_CHANNEL_PATH_LENGTH {
        return Err("channel path too long");
    }
    if !path.starts_with('/') {
        return Err("channel path must start with '/'");
    }
    if path.chars().any(char::is_control) {
        return Err("channel path contains control characters");
    }

    let segments: Vec<&str> = path[1..].split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err("channel path contains an empty segment");
    }
    let last = segments.len() - 1;
    if segments[..last].iter().any(|s| *s == "*" || *s == "**") {
        return Err("wildcards are only allowed in the last segment");
    }

    Ok(())
}

impl ChannelId {
    /// Parse and validate a channel path.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidChannel`] if the path is malformed.
    pub fn parse(path: &str) -> Result<Self, ProtocolError> {
        validate_channel_path(path).map_err(|reason| ProtocolError::InvalidChannel {
            path: path.to_string(),
            reason,
        })?;

        let segments: Vec<String> = path[1..].split('/').map(str::to_string).collect();
        let kind = if path.starts_with(META_PREFIX) {
            ChannelKind::Meta
        } else if path.starts_with(SERVICE_PREFIX) {
            ChannelKind::Service
        } else {
            match segments.last().map(String::as_str) {
                Some("*") => ChannelKind::Wild,
                Some("**") => ChannelKind::DeepWild,
                _ => ChannelKind::Application,
            }
        };

        Ok(Self {
            path: path.to_string(),
            segments,
            kind,
        })
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    #[must_use]
    pub fn is_meta(&self) -> bool {
        self.kind == ChannelKind::Meta
    }

    #[must_use]
    pub fn is_service(&self) -> bool {
        self.kind == ChannelKind::Service
    }

    /// Check if this channel is a `*` or `**` pattern.
    #[must_use]
    pub fn is_wild(&self) -> bool {
        matches!(self.kind, ChannelKind::Wild | ChannelKind::DeepWild)
    }

    /// Check if `channel` is matched by this channel used as a pattern.
    ///
    /// Non-wild channels only match themselves.
    #[must_use]
    pub fn matches(&self, channel: &ChannelId) -> bool {
        let prefix = self.segments.len() - 1;
        match self.kind {
            ChannelKind::Wild => {
                channel.segments.len() == self.segments.len()
                    && channel.segments[..prefix] == self.segments[..prefix]
            }
            ChannelKind::DeepWild => {
                channel.segments.len() > prefix
                    && channel.segments[..prefix] == self.segments[..prefix]
            }
            _ => self.path == channel.path,
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

impl std::str::FromStr for ChannelId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
