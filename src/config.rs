use crate::byte_stream::ByteStreamSettings;
use crate::error::{PrudpError, Result};
use crate::packet::WireVersion;
use std::time::Duration;

/// A NEX library version triple. Some wire details (PID width, structure
///  headers) depend on which library generation the deployment targets.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct LibraryVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl LibraryVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> LibraryVersion {
        LibraryVersion {
            major,
            minor,
            patch,
        }
    }

    pub fn greater_or_equal(&self, other: LibraryVersion) -> bool {
        (self.major, self.minor, self.patch) >= (other.major, other.minor, other.patch)
    }
}

/// Per-protocol library versions. Individual services occasionally lag the
///  default, so each one can be overridden after seeding.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct LibraryVersions {
    pub default: LibraryVersion,
    pub datastore: LibraryVersion,
    pub match_making: LibraryVersion,
    pub ranking: LibraryVersion,
    pub ranking2: LibraryVersion,
    pub messaging: LibraryVersion,
    pub utility: LibraryVersion,
    pub nat_traversal: LibraryVersion,
}

impl LibraryVersions {
    /// Seeds every protocol with the same version
    pub fn all(version: LibraryVersion) -> LibraryVersions {
        LibraryVersions {
            default: version,
            datastore: version,
            match_making: version,
            ranking: version,
            ranking2: version,
            messaging: version,
            utility: version,
            nat_traversal: version,
        }
    }
}

pub struct PrudpConfig {
    /// The sandbox access key; feeds the v0 checksum and both signature schemes
    pub access_key: String,

    /// Wire version for server-initiated traffic (pings to peers that have
    ///  not completed a handshake). Peers are otherwise answered in the
    ///  version they speak.
    pub version: WireVersion,

    /// Whether CONNECT payloads carry a Kerberos ticket that must validate
    pub is_secure_server: bool,
    pub kerberos_password: Vec<u8>,
    /// Selects the ticket wrapping format (1 = per-ticket key)
    pub kerberos_ticket_version: u32,
    /// Session key length carried in tickets
    pub kerberos_key_size: usize,

    /// Maximum payload bytes per DATA packet; larger sends are fragmented
    pub fragment_size: usize,

    /// Silence interval after which a peer is pinged, and - after a second
    ///  interval - torn down
    pub ping_timeout: Duration,

    /// Fixed re-send interval for unacknowledged reliable packets
    pub resend_interval: Duration,
    /// Re-sends before a peer is declared unreachable
    pub max_resend_attempts: u32,

    pub library_versions: LibraryVersions,
    pub stream_settings: ByteStreamSettings,
}

impl Default for PrudpConfig {
    fn default() -> PrudpConfig {
        PrudpConfig {
            access_key: String::new(),
            version: WireVersion::V0,
            is_secure_server: false,
            kerberos_password: Vec::new(),
            kerberos_ticket_version: 0,
            kerberos_key_size: 32,
            fragment_size: 1300,
            ping_timeout: Duration::from_secs(15),
            resend_interval: Duration::from_secs(1),
            max_resend_attempts: 5,
            library_versions: LibraryVersions::default(),
            stream_settings: ByteStreamSettings::default(),
        }
    }
}

impl PrudpConfig {
    /// Wire framing rules for a peer that negotiated the given QRV minor
    ///  version. Structure headers appear with minor version 3, or for every
    ///  peer once the deployment targets library generation 3.5.0; PIDs
    ///  widen to 8 bytes with 4.0.0. The string length width stays a
    ///  deployment-wide setting.
    pub fn stream_settings_for(&self, minor_version: u32) -> ByteStreamSettings {
        let use_structure_header = minor_version >= 3
            || self
                .library_versions
                .default
                .greater_or_equal(LibraryVersion::new(3, 5, 0));
        let pid_size = if self
            .library_versions
            .default
            .greater_or_equal(LibraryVersion::new(4, 0, 0))
        {
            8
        } else {
            self.stream_settings.pid_size
        };

        ByteStreamSettings {
            use_structure_header,
            pid_size,
            ..self.stream_settings
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.fragment_size == 0 {
            return Err(PrudpError::Protocol("fragment size must be positive".to_string()));
        }
        if self.is_secure_server && self.kerberos_password.is_empty() {
            return Err(PrudpError::Protocol(
                "secure servers need a kerberos password".to_string(),
            ));
        }
        if self.kerberos_key_size == 0 {
            return Err(PrudpError::Protocol(
                "kerberos key size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
