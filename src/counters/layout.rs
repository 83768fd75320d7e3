//! Binary layout of the transport's counters file.
//!
//! The file is owned by the monitored messaging transport and mapped
//! read-only here. It starts with a fixed header, followed by a metadata
//! region of fixed-size slot descriptors and a values region holding one
//! cache-line-padded live value per slot. All integers are little-endian.
//! The layout is a versioned external contract; [`FILE_VERSION`] is the
//! single version this reader supports.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use thiserror::Error;

/// Name of the counters file within a transport's runtime directory.
pub const COUNTERS_FILE: &str = "counters.dat";

/// Magic number at offset 0 ("CNTR" in little-endian byte order).
pub const FILE_MAGIC: u32 = 0x5254_4E43;

/// The single supported file format version.
pub const FILE_VERSION: i32 = 1;

/// Header: magic u32, version i32, slot count i32, 4 reserved bytes.
pub const HEADER_LENGTH: usize = 16;

/// Size of one metadata slot descriptor.
pub const METADATA_SLOT_LENGTH: usize = 512;

/// Size of one value slot (8-byte value plus padding to a cache line).
pub const VALUE_SLOT_LENGTH: usize = 64;

/// Offsets within a metadata slot.
pub const SLOT_STATE_OFFSET: usize = 0;
pub const SLOT_TYPE_ID_OFFSET: usize = 4;
pub const SLOT_KEY_OFFSET: usize = 8;
pub const SLOT_KEY_LENGTH: usize = 56;
pub const SLOT_LABEL_LEN_OFFSET: usize = 64;
pub const SLOT_LABEL_OFFSET: usize = 68;
pub const SLOT_LABEL_MAX_LENGTH: usize = METADATA_SLOT_LENGTH - SLOT_LABEL_OFFSET;

/// Metadata slot states.
pub const SLOT_UNUSED: i32 = 0;
pub const SLOT_ALLOCATED: i32 = 1;

/// Total file length implied by the header's slot count.
pub const fn expected_file_length(slot_count: usize) -> usize {
    HEADER_LENGTH + slot_count * (METADATA_SLOT_LENGTH + VALUE_SLOT_LENGTH)
}

// Counter type ids assigned by the monitored transport.
pub const SYSTEM_COUNTER_TYPE_ID: i32 = 0;
pub const PUBLISHER_LIMIT_TYPE_ID: i32 = 1;
pub const SENDER_POSITION_TYPE_ID: i32 = 2;
pub const RECEIVER_HWM_TYPE_ID: i32 = 3;
pub const SUBSCRIBER_POSITION_TYPE_ID: i32 = 4;
pub const RECEIVER_POSITION_TYPE_ID: i32 = 5;
pub const SENDER_LIMIT_TYPE_ID: i32 = 9;
pub const PUBLISHER_POSITION_TYPE_ID: i32 = 12;
pub const SENDER_BPE_TYPE_ID: i32 = 13;

/// The system counters tracked by this monitor, identified by counter id
/// within type [`SYSTEM_COUNTER_TYPE_ID`]. The transport allocates more
/// system counters than these; the rest are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemCounterKind {
    BytesSent,
    BytesReceived,
    NaksSent,
    NaksReceived,
    Errors,
    ClientTimeouts,
}

impl SystemCounterKind {
    /// Map a system counter id onto a monitored kind.
    pub fn from_counter_id(counter_id: i32) -> Option<Self> {
        match counter_id {
            0 => Some(Self::BytesSent),
            1 => Some(Self::BytesReceived),
            2 => Some(Self::NaksSent),
            3 => Some(Self::NaksReceived),
            4 => Some(Self::Errors),
            5 => Some(Self::ClientTimeouts),
            _ => None,
        }
    }
}

/// The closed set of counter kinds this monitor consumes, dispatched from
/// a slot's type id (and, for system counters, its counter id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
    SenderLimit,
    SenderPosition,
    PublisherPosition,
    PublisherLimit,
    SenderBackPressure,
    ReceiverHighWaterMark,
    ReceiverPosition,
    SubscriberPosition,
    System(SystemCounterKind),
}

impl CounterKind {
    /// Classify a slot. Returns `None` for types this monitor does not
    /// track, including system counters outside the monitored set.
    pub fn from_slot(type_id: i32, counter_id: i32) -> Option<Self> {
        match type_id {
            SENDER_LIMIT_TYPE_ID => Some(Self::SenderLimit),
            SENDER_POSITION_TYPE_ID => Some(Self::SenderPosition),
            PUBLISHER_POSITION_TYPE_ID => Some(Self::PublisherPosition),
            PUBLISHER_LIMIT_TYPE_ID => Some(Self::PublisherLimit),
            SENDER_BPE_TYPE_ID => Some(Self::SenderBackPressure),
            RECEIVER_HWM_TYPE_ID => Some(Self::ReceiverHighWaterMark),
            RECEIVER_POSITION_TYPE_ID => Some(Self::ReceiverPosition),
            SUBSCRIBER_POSITION_TYPE_ID => Some(Self::SubscriberPosition),
            SYSTEM_COUNTER_TYPE_ID => {
                SystemCounterKind::from_counter_id(counter_id).map(Self::System)
            }
            _ => None,
        }
    }

    /// Whether this kind's label carries registration/session/stream/
    /// channel identity tokens.
    pub fn is_session_keyed(self) -> bool {
        !matches!(self, Self::System(_))
    }

    /// Index of the registration-id token within the slot label. The
    /// publisher-position label carries a two-token name, shifting its
    /// identity fields right by one.
    pub fn first_identity_token(self) -> usize {
        match self {
            Self::PublisherPosition => 2,
            _ => 1,
        }
    }
}

/// Errors raised while mapping and validating a counters file.
#[derive(Error, Debug)]
pub enum CountersFileError {
    #[error("counters file does not exist: {path}")]
    Missing { path: PathBuf },

    #[error("mapping {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("file too short: {actual} bytes, need at least {required}")]
    Truncated { actual: usize, required: usize },

    #[error("bad magic number: 0x{actual:08X}")]
    BadMagic { actual: u32 },

    #[error("unsupported counters file version: {actual}")]
    UnsupportedVersion { actual: i32 },
}

/// One allocated slot, borrowed from the mapped file for the duration of
/// a scan callback.
#[derive(Debug, Clone, Copy)]
pub struct CounterSlot<'a> {
    pub counter_id: i32,
    pub type_id: i32,
    pub key: &'a [u8],
    pub label: &'a str,
}

/// Read-only view over a transport's counters file.
pub struct CountersFile {
    map: Mmap,
    slot_count: usize,
}

impl CountersFile {
    /// Map the counters file found in `dir` and validate its header.
    ///
    /// A missing file, bad magic, or version mismatch is fatal: the
    /// reader cannot run against an absent or incompatible file.
    pub fn map_read_only(dir: &Path) -> Result<Self, CountersFileError> {
        let path = dir.join(COUNTERS_FILE);
        if !path.exists() {
            return Err(CountersFileError::Missing { path });
        }

        let file = File::open(&path).map_err(|source| CountersFileError::Io {
            path: path.clone(),
            source,
        })?;
        // Safety: the transport only appends and updates values in place;
        // the mapping is read-only and the file is never truncated while
        // a monitor is attached.
        let map = unsafe {
            Mmap::map(&file).map_err(|source| CountersFileError::Io { path, source })?
        };

        if map.len() < HEADER_LENGTH {
            return Err(CountersFileError::Truncated {
                actual: map.len(),
                required: HEADER_LENGTH,
            });
        }

        let magic = read_u32(&map, 0);
        if magic != FILE_MAGIC {
            return Err(CountersFileError::BadMagic { actual: magic });
        }

        let version = read_i32(&map, 4);
        if version != FILE_VERSION {
            return Err(CountersFileError::UnsupportedVersion { actual: version });
        }

        let slot_count = read_i32(&map, 8).max(0) as usize;
        let required = expected_file_length(slot_count);
        if map.len() < required {
            return Err(CountersFileError::Truncated {
                actual: map.len(),
                required,
            });
        }

        Ok(Self { map, slot_count })
    }

    /// Number of slots described by the file header.
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Invoke `f` for every allocated slot, in slot order.
    pub fn each_allocated<F: FnMut(CounterSlot<'_>)>(&self, mut f: F) {
        for index in 0..self.slot_count {
            let base = HEADER_LENGTH + index * METADATA_SLOT_LENGTH;
            if read_i32(&self.map, base + SLOT_STATE_OFFSET) != SLOT_ALLOCATED {
                continue;
            }

            let label_len = read_i32(&self.map, base + SLOT_LABEL_LEN_OFFSET)
                .clamp(0, SLOT_LABEL_MAX_LENGTH as i32) as usize;
            let label_start = base + SLOT_LABEL_OFFSET;
            let label =
                std::str::from_utf8(&self.map[label_start..label_start + label_len])
                    .unwrap_or_default();

            f(CounterSlot {
                counter_id: index as i32,
                type_id: read_i32(&self.map, base + SLOT_TYPE_ID_OFFSET),
                key: &self.map[base + SLOT_KEY_OFFSET..base + SLOT_KEY_OFFSET + SLOT_KEY_LENGTH],
                label,
            });
        }
    }

    /// Current live value of the given counter.
    pub fn counter_value(&self, counter_id: i32) -> i64 {
        let offset = HEADER_LENGTH
            + self.slot_count * METADATA_SLOT_LENGTH
            + counter_id as usize * VALUE_SLOT_LENGTH;
        read_i64(&self.map, offset)
    }
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn read_i32(data: &[u8], offset: usize) -> i32 {
    read_u32(data, offset) as i32
}

fn read_i64(data: &[u8], offset: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    i64::from_le_bytes(bytes)
}
