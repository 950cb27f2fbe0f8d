//! Process-wide Elan allocation state.
//!
//! Tracks which program numbers and hardware context ranges are held by live
//! steps, plus the round-robin cursors used to hand out new ones. The encoded
//! form is a length-prefixed blob: `u32 length | u32 magic | u8 version |
//! postcard payload`.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::error::LibStateError;
use crate::config::ContextRange;

/// Tag identifying an encoded library state.
pub const LIBSTATE_MAGIC: u32 = 0xf00f_f00f;

/// Encoding version. Bumped with incompatible payload changes.
pub const LIBSTATE_VERSION: u8 = 1;

const PRG_START: u32 = 0;
const PRG_END: u32 = 0x7fff_ffff;

/// Resources reserved for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub prognum: u32,
    pub low_context: u32,
    pub high_context: u32,
}

impl Allocation {
    fn overlaps(&self, low: u32, high: u32) -> bool {
        self.low_context <= high && low <= self.high_context
    }
}

#[derive(Serialize, Deserialize)]
struct StateRecord {
    next_prognum: u32,
    next_context: u32,
    outstanding: Vec<Allocation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryState {
    contexts: ContextRange,
    next_prognum: u32,
    next_context: u32,
    outstanding: BTreeMap<u32, Allocation>,
}

impl LibraryState {
    /// Clean state. The program cursor is randomised, so that a controller
    /// restarted without recovery data is unlikely to reuse numbers still
    /// live on nodes; the context cursor starts at the bottom of the range.
    #[must_use]
    pub fn fresh(contexts: ContextRange) -> Self {
        Self {
            contexts,
            next_prognum: rand::rng().random_range(PRG_START..=PRG_END),
            next_context: contexts.low,
            outstanding: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn contexts(&self) -> ContextRange {
        self.contexts
    }

    /// Live allocations ordered by program number.
    pub fn outstanding(&self) -> impl Iterator<Item = &Allocation> {
        self.outstanding.values()
    }

    #[must_use]
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    /// Reserve a program number and `width` consecutive hardware contexts
    /// that overlap no live allocation.
    ///
    /// # Errors
    ///
    /// `ContextsExhausted` if no free range of `width` contexts exists.
    pub fn allocate(&mut self, width: u32) -> Result<Allocation, LibStateError> {
        let ContextRange { low, high } = self.contexts;
        let exhausted = LibStateError::ContextsExhausted { width };
        if width == 0 || high < low || width > high - low + 1 {
            return Err(exhausted);
        }

        let span = high - low + 1;
        let mut start = self.next_context.clamp(low, high);
        for _ in 0..span {
            if start > high - (width - 1) {
                start = low;
            }
            let end = start + (width - 1);
            if !self.outstanding.values().any(|a| a.overlaps(start, end)) {
                self.next_context = if end >= high { low } else { end + 1 };
                let allocation = Allocation {
                    prognum: self.next_free_prognum(),
                    low_context: start,
                    high_context: end,
                };
                self.outstanding.insert(allocation.prognum, allocation);
                tracing::debug!(
                    prognum = allocation.prognum,
                    low_context = start,
                    high_context = end,
                    "reserved hardware contexts"
                );
                return Ok(allocation);
            }
            start += 1;
        }
        Err(exhausted)
    }

    fn next_free_prognum(&mut self) -> u32 {
        loop {
            let candidate = self.next_prognum;
            self.next_prognum = if candidate >= PRG_END {
                PRG_START
            } else {
                candidate + 1
            };
            if !self.outstanding.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Return the resources held by `allocation`. Returns `false` if the
    /// program number is not held or now belongs to a different reservation.
    pub fn release(&mut self, allocation: &Allocation) -> bool {
        let prognum = allocation.prognum;
        if self.outstanding.get(&prognum) != Some(allocation) {
            return false;
        }
        self.outstanding.remove(&prognum);
        tracing::debug!(prognum, "released hardware contexts");
        true
    }

    /// Length-prefixed binary form.
    ///
    /// # Errors
    ///
    /// `Encode` if postcard cannot serialize the state.
    pub fn encode(&self) -> Result<Vec<u8>, LibStateError> {
        let record = StateRecord {
            next_prognum: self.next_prognum,
            next_context: self.next_context,
            outstanding: self.outstanding.values().copied().collect(),
        };
        let payload = postcard::to_allocvec(&record).map_err(LibStateError::Encode)?;
        let len = u32::try_from(payload.len() + 5).map_err(|_| LibStateError::TooLarge)?;

        let mut buf = BytesMut::with_capacity(payload.len() + 9);
        buf.put_u32(len);
        buf.put_u32(LIBSTATE_MAGIC);
        buf.put_u8(LIBSTATE_VERSION);
        buf.put_slice(&payload);
        Ok(buf.to_vec())
    }

    /// Parse the output of [`LibraryState::encode`]. The whole input must be
    /// consumed.
    ///
    /// # Errors
    ///
    /// `Truncated`, `BadMagic`, `UnsupportedVersion`, `Decode` or
    /// `Inconsistent` for anything that is not an intact state blob.
    pub fn decode(mut bytes: &[u8], contexts: ContextRange) -> Result<Self, LibStateError> {
        if bytes.remaining() < 9 {
            return Err(LibStateError::Truncated {
                needed: 9,
                available: bytes.remaining(),
            });
        }
        let len = bytes.get_u32() as usize;
        if len != bytes.remaining() {
            return Err(LibStateError::Truncated {
                needed: len,
                available: bytes.remaining(),
            });
        }
        let magic = bytes.get_u32();
        if magic != LIBSTATE_MAGIC {
            return Err(LibStateError::BadMagic(magic));
        }
        let version = bytes.get_u8();
        if version != LIBSTATE_VERSION {
            return Err(LibStateError::UnsupportedVersion(version));
        }

        let (record, rest): (StateRecord, &[u8]) =
            postcard::take_from_bytes(bytes).map_err(LibStateError::Decode)?;
        if !rest.is_empty() {
            return Err(LibStateError::Inconsistent(format!(
                "{} trailing bytes",
                rest.len()
            )));
        }

        let mut outstanding = BTreeMap::new();
        for allocation in record.outstanding {
            if allocation.high_context < allocation.low_context {
                return Err(LibStateError::Inconsistent(format!(
                    "program {} has an inverted context range",
                    allocation.prognum
                )));
            }
            if allocation.low_context < contexts.low || allocation.high_context > contexts.high {
                return Err(LibStateError::Inconsistent(format!(
                    "program {} holds contexts {:#x}-{:#x} outside {:#x}-{:#x}",
                    allocation.prognum,
                    allocation.low_context,
                    allocation.high_context,
                    contexts.low,
                    contexts.high
                )));
            }
            if outstanding
                .values()
                .any(|a: &Allocation| a.overlaps(allocation.low_context, allocation.high_context))
            {
                return Err(LibStateError::Inconsistent(format!(
                    "program {} overlaps another allocation",
                    allocation.prognum
                )));
            }
            if outstanding.insert(allocation.prognum, allocation).is_some() {
                return Err(LibStateError::Inconsistent(format!(
                    "program {} recorded twice",
                    allocation.prognum
                )));
            }
        }

        Ok(Self {
            contexts,
            next_prognum: record.next_prognum.min(PRG_END),
            next_context: record.next_context.clamp(contexts.low, contexts.high.max(contexts.low)),
            outstanding,
        })
    }
}
