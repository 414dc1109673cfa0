//! Cluster configuration: the ordered set of servers, their addresses and
//! voting roles, and the versioned byte encoding persisted inside
//! configuration log entries.

use serde::Serialize;
use std::fmt;
use std::str::from_utf8;
use thiserror::Error;

const CONFIGURATION_VERSION: u8 = 1;

/// Unique identifier of a configured server. Zero is rejected when a server
/// is added, so a valid configuration never contains it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ServerId(u64);

impl ServerId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for ServerId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single configured server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Server {
    id: ServerId,
    address: String,
    voting: bool,
}

impl Server {
    pub fn new(id: impl Into<ServerId>, address: impl Into<String>, voting: bool) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            voting,
        }
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn voting(&self) -> bool {
        self.voting
    }
}

/// Ordered list of servers with unique ids.
///
/// A configuration entry in the log encodes a full snapshot of this state as
/// of that entry's index, so rolling back a truncated change only requires
/// decoding the closest surviving configuration entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Configuration {
    servers: Vec<Server>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn index_of(&self, id: ServerId) -> Option<usize> {
        self.servers.iter().position(|server| server.id == id)
    }

    pub fn get(&self, id: ServerId) -> Option<&Server> {
        self.servers.iter().find(|server| server.id == id)
    }

    pub fn contains(&self, id: ServerId) -> bool {
        self.get(id).is_some()
    }

    pub fn is_voter(&self, id: ServerId) -> bool {
        self.get(id).map(Server::voting).unwrap_or(false)
    }

    pub fn voters(&self) -> impl Iterator<Item = &Server> {
        self.servers.iter().filter(|server| server.voting)
    }

    pub fn n_voting(&self) -> usize {
        self.voters().count()
    }

    /// Strict majority of the voting members.
    pub fn quorum(&self) -> usize {
        self.n_voting() / 2 + 1
    }

    pub fn add(
        &mut self,
        id: impl Into<ServerId>,
        address: impl Into<String>,
        voting: bool,
    ) -> Result<(), ConfigError> {
        let id = id.into();
        if id.get() == 0 {
            return Err(ConfigError::ZeroId);
        }
        if self.contains(id) {
            return Err(ConfigError::DuplicateId { id });
        }
        self.servers.push(Server::new(id, address, voting));
        Ok(())
    }

    pub fn remove(&mut self, id: ServerId) -> Result<(), ConfigError> {
        let position = self
            .index_of(id)
            .ok_or(ConfigError::UnknownId { id })?;
        let removed = self.servers.remove(position);
        if removed.voting && self.n_voting() == 0 {
            self.servers.insert(position, removed);
            return Err(ConfigError::NoVoters);
        }
        Ok(())
    }

    pub fn promote(&mut self, id: ServerId) -> Result<(), ConfigError> {
        let position = self
            .index_of(id)
            .ok_or(ConfigError::UnknownId { id })?;
        self.servers[position].voting = true;
        Ok(())
    }

    /// Versioned little-endian encoding: version byte, u64 server count, then
    /// per server { u64 id, u16-length-prefixed UTF-8 address, u8 voting }.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(9 + self.servers.len() * 24);
        buf.push(CONFIGURATION_VERSION);
        buf.extend_from_slice(&(self.servers.len() as u64).to_le_bytes());
        for server in &self.servers {
            let address = server.address.as_bytes();
            debug_assert!(address.len() <= u16::MAX as usize);
            buf.extend_from_slice(&server.id.get().to_le_bytes());
            buf.extend_from_slice(&(address.len() as u16).to_le_bytes());
            buf.extend_from_slice(address);
            buf.push(server.voting as u8);
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ConfigError> {
        if bytes.len() < 9 {
            return Err(ConfigError::Truncated);
        }
        if bytes[0] != CONFIGURATION_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                observed: bytes[0],
                expected: CONFIGURATION_VERSION,
            });
        }
        let count = u64::from_le_bytes(bytes[1..9].try_into().unwrap()) as usize;
        let mut cursor = 9;
        let mut configuration = Configuration::new();
        for _ in 0..count {
            if bytes.len() < cursor + 10 {
                return Err(ConfigError::Truncated);
            }
            let id = u64::from_le_bytes(bytes[cursor..cursor + 8].try_into().unwrap());
            cursor += 8;
            let address_len =
                u16::from_le_bytes(bytes[cursor..cursor + 2].try_into().unwrap()) as usize;
            cursor += 2;
            if bytes.len() < cursor + address_len + 1 {
                return Err(ConfigError::Truncated);
            }
            let address = from_utf8(&bytes[cursor..cursor + address_len])
                .map_err(|_| ConfigError::InvalidUtf8)?;
            cursor += address_len;
            let voting = bytes[cursor] != 0;
            cursor += 1;
            configuration.add(id, address, voting)?;
        }
        Ok(configuration)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("server id must be non-zero")]
    ZeroId,

    #[error("server {id} is already configured")]
    DuplicateId { id: ServerId },

    #[error("server {id} is not in the configuration")]
    UnknownId { id: ServerId },

    #[error("edit would leave the configuration without voters")]
    NoVoters,

    #[error("configuration frame too short")]
    Truncated,

    #[error("unsupported configuration version {observed} (expected {expected})")]
    UnsupportedVersion { observed: u8, expected: u8 },

    #[error("server address is not valid UTF-8")]
    InvalidUtf8,
}
