//! Logical message types exchanged between servers and their versioned
//! little-endian wire frames.
//!
//! An AppendEntries frame carries its entries as one contiguous batch: a u64
//! entry count, a 16-byte header per entry { u64 term, u8 kind, 3 reserved
//! bytes, u32 payload_len }, then the payload blobs back to back. Decoding
//! copies the payload region into a single shared buffer and hands every
//! entry a view into it.

use crate::config::{ConfigError, Configuration, ServerId};
use crate::raft_log::{Entry, EntryBuf, EntryKind};
use std::sync::Arc;
use thiserror::Error;

const FRAME_VERSION: u8 = 1;

const TAG_REQUEST_VOTE: u8 = 1;
const TAG_REQUEST_VOTE_RESULT: u8 = 2;
const TAG_APPEND_ENTRIES: u8 = 3;
const TAG_APPEND_ENTRIES_RESULT: u8 = 4;
const TAG_INSTALL_SNAPSHOT: u8 = 5;


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVote {
    pub term: u64,
    pub candidate_id: ServerId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestVoteResult {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntries {
    pub term: u64,
    pub leader_id: ServerId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<Entry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendEntriesResult {
    pub term: u64,
    pub success: bool,
    pub last_log_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSnapshot {
    pub term: u64,
    pub leader_id: ServerId,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub configuration: Configuration,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    RequestVote(RequestVote),
    RequestVoteResult(RequestVoteResult),
    AppendEntries(AppendEntries),
    AppendEntriesResult(AppendEntriesResult),
    InstallSnapshot(InstallSnapshot),
}

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.push(FRAME_VERSION);
        match self {
            Message::RequestVote(request) => {
                buf.push(TAG_REQUEST_VOTE);
                buf.extend_from_slice(&request.term.to_le_bytes());
                buf.extend_from_slice(&request.candidate_id.get().to_le_bytes());
                buf.extend_from_slice(&request.last_log_index.to_le_bytes());
                buf.extend_from_slice(&request.last_log_term.to_le_bytes());
            }
            Message::RequestVoteResult(result) => {
                buf.push(TAG_REQUEST_VOTE_RESULT);
                buf.extend_from_slice(&result.term.to_le_bytes());
                buf.push(result.vote_granted as u8);
            }
            Message::AppendEntries(request) => {
                buf.push(TAG_APPEND_ENTRIES);
                buf.extend_from_slice(&request.term.to_le_bytes());
                buf.extend_from_slice(&request.leader_id.get().to_le_bytes());
                buf.extend_from_slice(&request.prev_log_index.to_le_bytes());
                buf.extend_from_slice(&request.prev_log_term.to_le_bytes());
                buf.extend_from_slice(&request.leader_commit.to_le_bytes());
                encode_entries(&mut buf, &request.entries);
            }
            Message::AppendEntriesResult(result) => {
                buf.push(TAG_APPEND_ENTRIES_RESULT);
                buf.extend_from_slice(&result.term.to_le_bytes());
                buf.push(result.success as u8);
                buf.extend_from_slice(&result.last_log_index.to_le_bytes());
            }
            Message::InstallSnapshot(request) => {
                buf.push(TAG_INSTALL_SNAPSHOT);
                buf.extend_from_slice(&request.term.to_le_bytes());
                buf.extend_from_slice(&request.leader_id.get().to_le_bytes());
                buf.extend_from_slice(&request.last_included_index.to_le_bytes());
                buf.extend_from_slice(&request.last_included_term.to_le_bytes());
                let configuration = request.configuration.encode();
                buf.extend_from_slice(&(configuration.len() as u32).to_le_bytes());
                buf.extend_from_slice(&configuration);
                buf.extend_from_slice(&(request.data.len() as u32).to_le_bytes());
                buf.extend_from_slice(&request.data);
            }
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < 2 {
            return Err(FrameError::Truncated);
        }
        if bytes[0] != FRAME_VERSION {
            return Err(FrameError::UnsupportedVersion {
                observed: bytes[0],
                expected: FRAME_VERSION,
            });
        }
        let mut cursor = Cursor::new(bytes, 2);
        let message = match bytes[1] {
            TAG_REQUEST_VOTE => Message::RequestVote(RequestVote {
                term: cursor.u64()?,
                candidate_id: ServerId::new(cursor.u64()?),
                last_log_index: cursor.u64()?,
                last_log_term: cursor.u64()?,
            }),
            TAG_REQUEST_VOTE_RESULT => Message::RequestVoteResult(RequestVoteResult {
                term: cursor.u64()?,
                vote_granted: cursor.u8()? != 0,
            }),
            TAG_APPEND_ENTRIES => {
                let term = cursor.u64()?;
                let leader_id = ServerId::new(cursor.u64()?);
                let prev_log_index = cursor.u64()?;
                let prev_log_term = cursor.u64()?;
                let leader_commit = cursor.u64()?;
                let entries = decode_entries(&mut cursor, prev_log_index + 1)?;
                Message::AppendEntries(AppendEntries {
                    term,
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                })
            }
            TAG_APPEND_ENTRIES_RESULT => Message::AppendEntriesResult(AppendEntriesResult {
                term: cursor.u64()?,
                success: cursor.u8()? != 0,
                last_log_index: cursor.u64()?,
            }),
            TAG_INSTALL_SNAPSHOT => {
                let term = cursor.u64()?;
                let leader_id = ServerId::new(cursor.u64()?);
                let last_included_index = cursor.u64()?;
                let last_included_term = cursor.u64()?;
                let configuration_len = cursor.u32()? as usize;
                let configuration = Configuration::decode(cursor.bytes(configuration_len)?)?;
                let data_len = cursor.u32()? as usize;
                let data = cursor.bytes(data_len)?.to_vec();
                Message::InstallSnapshot(InstallSnapshot {
                    term,
                    leader_id,
                    last_included_index,
                    last_included_term,
                    configuration,
                    data,
                })
            }
            tag => return Err(FrameError::UnknownMessageTag(tag)),
        };
        Ok(message)
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8], position: usize) -> Self {
        Self { bytes, position }
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        let byte = *self
            .bytes
            .get(self.position)
            .ok_or(FrameError::Truncated)?;
        self.position += 1;
        Ok(byte)
    }

    fn u32(&mut self) -> Result<u32, FrameError> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, FrameError> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], FrameError> {
        if self.bytes.len() < self.position + len {
            return Err(FrameError::Truncated);
        }
        let slice = &self.bytes[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }
}

fn kind_byte(kind: EntryKind) -> u8 {
    match kind {
        EntryKind::Command => 0,
        EntryKind::Configuration => 1,
    }
}

fn encode_entries(buf: &mut Vec<u8>, entries: &[Entry]) {
    buf.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    for entry in entries {
        buf.extend_from_slice(&entry.term.to_le_bytes());
        buf.push(kind_byte(entry.kind));
        buf.extend_from_slice(&[0u8; 3]);
        buf.extend_from_slice(&(entry.payload.len() as u32).to_le_bytes());
    }
    for entry in entries {
        buf.extend_from_slice(entry.payload.as_slice());
    }
}

fn decode_entries(cursor: &mut Cursor<'_>, first_index: u64) -> Result<Vec<Entry>, FrameError> {
    let count = cursor.u64()? as usize;
    let mut headers = Vec::with_capacity(count);
    let mut total_payload = 0usize;
    for _ in 0..count {
        let term = cursor.u64()?;
        let kind = match cursor.u8()? {
            0 => EntryKind::Command,
            1 => EntryKind::Configuration,
            byte => return Err(FrameError::UnknownEntryKind(byte)),
        };
        cursor.bytes(3)?;
        let payload_len = cursor.u32()? as usize;
        headers.push((term, kind, payload_len));
        total_payload += payload_len;
    }

    // One allocation backs every payload in the batch.
    let batch: Arc<[u8]> = cursor.bytes(total_payload)?.to_vec().into();
    let mut entries = Vec::with_capacity(count);
    let mut offset = 0;
    for (position, (term, kind, payload_len)) in headers.into_iter().enumerate() {
        entries.push(Entry::new(
            first_index + position as u64,
            term,
            kind,
            EntryBuf::slice(&batch, offset, payload_len),
        ));
        offset += payload_len;
    }
    Ok(entries)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame too short")]
    Truncated,

    #[error("unsupported frame version {observed} (expected {expected})")]
    UnsupportedVersion { observed: u8, expected: u8 },

    #[error("unknown message tag {0}")]
    UnknownMessageTag(u8),

    #[error("unknown entry kind {0}")]
    UnknownEntryKind(u8),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
