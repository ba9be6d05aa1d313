/* STATIC Proxy (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

use thiserror::Error;

use crate::tls::alert::AlertDescription;

pub type FrontResult<T> = Result<T, FrontError>;

pub type TlsResult<T> = Result<T, TlsError>;

/// Errors surfaced by workers, the connection manager and the HTTP engines.
///
/// None of these cross `Dispatcher::request`: task-level failures are absorbed into
/// retries or a synthetic failure response before they reach a caller.
#[derive(Debug, Error)]
pub enum FrontError {
    #[error("TLS failure: {0}")]
    Tls(#[from] TlsError),

    #[error("HTTP/2 protocol error: {0}")]
    Http2(String),

    #[error("HTTP/1.1 protocol error: {0}")]
    Http1(String),

    #[error("flow control violation: {0}")]
    FlowControl(String),

    #[error("timed out: {0}")]
    Timeout(&'static str),

    #[error("no candidate IP available")]
    NoCandidate,

    #[error("worker closed: {0}")]
    WorkerClosed(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Terminal outcome of a TLS operation.
///
/// **Local vs peer alerts:**
/// `LocalAlert` means this side detected the problem and (best-effort) told the peer;
/// `PeerAlert` means the peer aborted. Both leave the session non-resumable. A graceful
/// close (close_notify or a warning alert) is `Closed`.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("fatal alert {description:?}: {reason}")]
    LocalAlert {
        description: AlertDescription,
        reason: String,
    },

    #[error("peer sent fatal alert {0:?}")]
    PeerAlert(AlertDescription),

    #[error("connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TlsError {
    pub fn alert(description: AlertDescription, reason: impl Into<String>) -> Self {
        TlsError::LocalAlert {
            description,
            reason: reason.into(),
        }
    }

    pub fn decode(reason: impl Into<String>) -> Self {
        Self::alert(AlertDescription::DecodeError, reason)
    }

    pub fn unexpected(reason: impl Into<String>) -> Self {
        Self::alert(AlertDescription::UnexpectedMessage, reason)
    }

    pub fn illegal(reason: impl Into<String>) -> Self {
        Self::alert(AlertDescription::IllegalParameter, reason)
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::alert(AlertDescription::InternalError, reason)
    }

    /// Alert to put on the wire for a locally detected failure.
    pub fn local_alert(&self) -> Option<AlertDescription> {
        match self {
            TlsError::LocalAlert { description, .. } => Some(*description),
            _ => None,
        }
    }

    /// Alert description regardless of which side raised it.
    pub fn description(&self) -> Option<AlertDescription> {
        match self {
            TlsError::LocalAlert { description, .. } => Some(*description),
            TlsError::PeerAlert(description) => Some(*description),
            _ => None,
        }
    }

    /// Security failures (bad MAC, signature, key size, parameters) as opposed to
    /// framing/protocol errors.
    pub fn is_security(&self) -> bool {
        matches!(
            self.description(),
            Some(
                AlertDescription::BadRecordMac
                    | AlertDescription::DecryptError
                    | AlertDescription::HandshakeFailure
                    | AlertDescription::InsufficientSecurity
                    | AlertDescription::IllegalParameter
                    | AlertDescription::BadCertificate
                    | AlertDescription::UnknownCa
                    | AlertDescription::UnknownPskIdentity
            )
        )
    }
}
