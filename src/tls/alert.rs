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

/// Alert level byte (RFC 5246 §7.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Warning,
    Fatal,
    Unknown(u8),
}

impl AlertLevel {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => AlertLevel::Warning,
            2 => AlertLevel::Fatal,
            other => AlertLevel::Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            AlertLevel::Warning => 1,
            AlertLevel::Fatal => 2,
            AlertLevel::Unknown(v) => v,
        }
    }
}

macro_rules! alert_descriptions {
    ($($name:ident = $value:literal),* $(,)?) => {
        /// Alert description codes from the SSL 3.0 through TLS 1.3 registries.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum AlertDescription {
            $($name,)*
            Unknown(u8),
        }

        impl AlertDescription {
            pub fn from_u8(value: u8) -> Self {
                match value {
                    $($value => AlertDescription::$name,)*
                    other => AlertDescription::Unknown(other),
                }
            }

            pub fn to_u8(self) -> u8 {
                match self {
                    $(AlertDescription::$name => $value,)*
                    AlertDescription::Unknown(v) => v,
                }
            }
        }
    };
}

alert_descriptions! {
    CloseNotify = 0,
    UnexpectedMessage = 10,
    BadRecordMac = 20,
    RecordOverflow = 22,
    DecompressionFailure = 30,
    HandshakeFailure = 40,
    NoCertificate = 41,
    BadCertificate = 42,
    UnsupportedCertificate = 43,
    CertificateRevoked = 44,
    CertificateExpired = 45,
    CertificateUnknown = 46,
    IllegalParameter = 47,
    UnknownCa = 48,
    AccessDenied = 49,
    DecodeError = 50,
    DecryptError = 51,
    ProtocolVersion = 70,
    InsufficientSecurity = 71,
    InternalError = 80,
    InappropriateFallback = 86,
    UserCanceled = 90,
    NoRenegotiation = 100,
    MissingExtension = 109,
    UnsupportedExtension = 110,
    UnrecognizedName = 112,
    UnknownPskIdentity = 115,
    CertificateRequired = 116,
    NoApplicationProtocol = 120,
}

/// Decoded two-byte alert record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alert {
    pub level: AlertLevel,
    pub description: AlertDescription,
}

impl Alert {
    pub fn fatal(description: AlertDescription) -> Self {
        Self {
            level: AlertLevel::Fatal,
            description,
        }
    }

    pub fn warning(description: AlertDescription) -> Self {
        Self {
            level: AlertLevel::Warning,
            description,
        }
    }

    pub fn encode(&self) -> [u8; 2] {
        [self.level.to_u8(), self.description.to_u8()]
    }

    /// Graceful closes: close_notify at any level, or any warning-level alert.
    pub fn is_graceful(&self) -> bool {
        self.description == AlertDescription::CloseNotify || self.level == AlertLevel::Warning
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptions_map_both_ways() {
        assert_eq!(AlertDescription::from_u8(51), AlertDescription::DecryptError);
        assert_eq!(AlertDescription::DecryptError.to_u8(), 51);
        assert_eq!(AlertDescription::from_u8(200), AlertDescription::Unknown(200));
    }

    #[test]
    fn warnings_and_close_notify_are_graceful() {
        assert!(Alert::warning(AlertDescription::NoRenegotiation).is_graceful());
        assert!(Alert::fatal(AlertDescription::CloseNotify).is_graceful());
        assert!(!Alert::fatal(AlertDescription::HandshakeFailure).is_graceful());
    }
}
