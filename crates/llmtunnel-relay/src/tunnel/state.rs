//! Tunnel lifecycle state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a tunnel.
///
/// ```text
/// created -> connecting -> connected <-> disconnected
///                 |            |              |
///                 +----> error <--------------+ (via connecting)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Created,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal tunnel transition {from} -> {to}")]
pub struct TransitionError {
    pub from: TunnelStatus,
    pub to: TunnelStatus,
}

impl TunnelStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }

    /// `disconnected` and `error` release the user's active-tunnel slot.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }

    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created | Self::Disconnected | Self::Error, Self::Connecting)
                | (Self::Connecting, Self::Connected | Self::Disconnected | Self::Error)
                | (Self::Connected, Self::Disconnected | Self::Error)
        )
    }

    pub const fn transition(self, next: Self) -> Result<Self, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunnelStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "connecting" => Ok(Self::Connecting),
            "connected" => Ok(Self::Connected),
            "disconnected" => Ok(Self::Disconnected),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown tunnel status: {other}")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::TunnelStatus::{Connected, Connecting, Created, Disconnected, Error};
    use super::*;

    const ALL: [TunnelStatus; 5] = [Created, Connecting, Connected, Disconnected, Error];

    #[test]
    fn legal_transitions() {
        let legal = [
            (Created, Connecting),
            (Connecting, Connected),
            (Connecting, Disconnected),
            (Connecting, Error),
            (Connected, Disconnected),
            (Connected, Error),
            (Disconnected, Connecting),
            (Error, Connecting),
        ];
        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn connected_is_only_reachable_through_connecting() {
        for from in ALL {
            if from != Connecting {
                assert!(from.transition(Connected).is_err(), "{from} -> connected");
            }
        }
    }

    #[test]
    fn transition_error_names_both_states() {
        let err = Created.transition(Connected).unwrap_err();
        assert_eq!(err.to_string(), "illegal tunnel transition created -> connected");
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<TunnelStatus>().unwrap(), status);
        }
        assert!("paused".parse::<TunnelStatus>().is_err());
    }
}
