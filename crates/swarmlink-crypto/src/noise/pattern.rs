//! Handshake patterns and their token lists.
//!
//! Each pattern is an ordered list of per-message token strings, exactly as
//! the Noise framework writes them. Messages alternate between initiator
//! (even index) and responder (odd index).

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// A single handshake token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// Send/receive the ephemeral public key
    E,
    /// Send/receive the encrypted static public key
    S,
    /// DH(ephemeral, remote ephemeral)
    EE,
    /// DH(initiator ephemeral, responder static)
    ES,
    /// DH(initiator static, responder ephemeral)
    SE,
    /// DH(static, remote static)
    SS,
}

impl Token {
    /// Parse a comma-separated token list such as `"e,ee,s,es"`.
    pub fn parse_list(list: &str) -> Result<Vec<Self>, ProtocolError> {
        list.split(',').map(|token| token.trim().parse::<Self>()).collect()
    }
}

impl FromStr for Token {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "e" => Ok(Self::E),
            "s" => Ok(Self::S),
            "ee" => Ok(Self::EE),
            "es" => Ok(Self::ES),
            "se" => Ok(Self::SE),
            "ss" => Ok(Self::SS),
            other => Err(ProtocolError::UnknownToken(other.to_string())),
        }
    }
}

/// Supported interactive handshake patterns.
///
/// The first letter says how the initiator's static key reaches the
/// responder (`N` none, `K` known in advance, `X` transmitted, `I`
/// transmitted immediately); the second says the same for the responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandshakePattern {
    /// No static keys
    NN,
    /// Responder static known to initiator
    NK,
    /// Responder static transmitted
    NX,
    /// Both statics known in advance
    KK,
    /// Both statics transmitted, mutual authentication
    XX,
    /// Initiator static sent immediately, responder static known
    IK,
    /// Initiator static sent immediately, responder static transmitted
    IX,
}

impl HandshakePattern {
    /// Every supported pattern.
    pub const ALL: [Self; 7] =
        [Self::NN, Self::NK, Self::NX, Self::KK, Self::XX, Self::IK, Self::IX];

    /// Pattern name as used in the protocol name.
    pub fn name(self) -> &'static str {
        match self {
            Self::NN => "NN",
            Self::NK => "NK",
            Self::NX => "NX",
            Self::KK => "KK",
            Self::XX => "XX",
            Self::IK => "IK",
            Self::IX => "IX",
        }
    }

    /// Per-message token strings.
    pub fn message_tokens(self) -> &'static [&'static str] {
        match self {
            Self::NN => &["e", "e,ee"],
            Self::NK => &["e,es", "e,ee"],
            Self::NX => &["e", "e,ee,s,es"],
            Self::KK => &["e,es,ss", "e,ee,se"],
            Self::XX => &["e", "e,ee,s,es", "s,se"],
            Self::IK => &["e,es,s,ss", "e,ee,se"],
            Self::IX => &["e,s", "e,ee,se,s,es"],
        }
    }

    /// Number of handshake messages.
    pub fn message_count(self) -> usize {
        self.message_tokens().len()
    }

    /// Whether the initiator's static key is known to the responder before
    /// the handshake (`-> s` pre-message).
    pub fn initiator_static_premessage(self) -> bool {
        matches!(self, Self::KK)
    }

    /// Whether the responder's static key is known to the initiator before
    /// the handshake (`<- s` pre-message).
    pub fn responder_static_premessage(self) -> bool {
        matches!(self, Self::NK | Self::KK | Self::IK)
    }

    /// Whether the initiator needs a static key pair at all.
    pub fn initiator_has_static(self) -> bool {
        !matches!(self, Self::NN | Self::NK | Self::NX)
    }

    /// Whether the responder needs a static key pair at all.
    pub fn responder_has_static(self) -> bool {
        !matches!(self, Self::NN)
    }

    /// Full Noise protocol name, e.g. `Noise_XX_25519_ChaChaPoly_SHA256`.
    pub fn protocol_name(self) -> String {
        format!("Noise_{}_25519_ChaChaPoly_SHA256", self.name())
    }

    /// Parsed token list for message `index`.
    pub(crate) fn tokens(self, index: usize) -> Result<Vec<Token>, ProtocolError> {
        let list = self.message_tokens().get(index).ok_or(ProtocolError::InvalidState {
            state: super::HandshakeStatus::Complete,
            operation: "advance past the last message",
        })?;
        Token::parse_list(list)
    }
}

impl fmt::Display for HandshakePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HandshakePattern {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|pattern| pattern.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| ProtocolError::UnknownPattern(s.to_string()))
    }
}
