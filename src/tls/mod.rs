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

//! TLS engine: record layer, handshake state machines for both roles, and the
//! established channel.
//!
//! **Layers (leaf first):**
//! - `codec`, `defrag`, `record`, `cipher`: framing, reassembly and record protection.
//! - `prf`, `schedule`, `groups`, `srp`, `kx`: key derivation and key exchange.
//! - `messages`, `extensions`, `alert`: wire structures.
//! - `client`, `server`, `handshake`: negotiation.
//! - `channel`: application data and post-handshake traffic.

pub mod alert;
pub mod channel;
pub mod cipher;
pub mod client;
pub mod codec;
pub mod config;
pub mod credentials;
pub mod defrag;
pub mod extensions;
pub mod fingerprint;
pub mod groups;
pub mod handshake;
pub mod kx;
pub mod messages;
pub mod prf;
pub mod record;
pub mod schedule;
pub mod server;
pub mod session;
pub mod srp;
pub mod suites;

pub use alert::{Alert, AlertDescription, AlertLevel};
pub use channel::SecureChannel;
pub use client::connect;
pub use config::{ClientAuth, ClientConfig, ExternalPsk, ServerConfig, VersionRange};
pub use credentials::{
    CertificateVerifier, CertifiedKey, EcdsaP256Key, Ed25519Key, KeyKind, KeyType, PeerKey, RingPeerKey, RsaKey,
    SignatureScheme, SigningKey,
};
pub use fingerprint::{calculate_ja3, validate_profile};
pub use groups::NamedGroup;
pub use handshake::Role;
pub use server::accept;
pub use session::{ClientSessionStore, Session, SessionCache, TicketSealer};
pub use suites::{lookup_cipher, lookup_suite, CipherSuite, ProtocolVersion};
