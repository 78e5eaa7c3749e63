//! Hash slot arithmetic.
//!
//! The keyspace is split into [`SLOT_COUNT`] slots using the CRC16 (XMODEM)
//! hash of a key or of its `{tag}`. This module also carries the small
//! helpers every planner needs: slot ranges, a slot-to-owner map, and the
//! even integer split used to hand out slots.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::ParseError;

/// Total number of hash slots in the cluster.
pub const SLOT_COUNT: u16 = 16384;

#[rustfmt::skip]
static CRC16_TABLE: [u16; 256] = [
    0x0000, 0x1021, 0x2042, 0x3063, 0x4084, 0x50a5, 0x60c6, 0x70e7,
    0x8108, 0x9129, 0xa14a, 0xb16b, 0xc18c, 0xd1ad, 0xe1ce, 0xf1ef,
    0x1231, 0x0210, 0x3273, 0x2252, 0x52b5, 0x4294, 0x72f7, 0x62d6,
    0x9339, 0x8318, 0xb37b, 0xa35a, 0xd3bd, 0xc39c, 0xf3ff, 0xe3de,
    0x2462, 0x3443, 0x0420, 0x1401, 0x64e6, 0x74c7, 0x44a4, 0x5485,
    0xa56a, 0xb54b, 0x8528, 0x9509, 0xe5ee, 0xf5cf, 0xc5ac, 0xd58d,
    0x3653, 0x2672, 0x1611, 0x0630, 0x76d7, 0x66f6, 0x5695, 0x46b4,
    0xb75b, 0xa77a, 0x9719, 0x8738, 0xf7df, 0xe7fe, 0xd79d, 0xc7bc,
    0x48c4, 0x58e5, 0x6886, 0x78a7, 0x0840, 0x1861, 0x2802, 0x3823,
    0xc9cc, 0xd9ed, 0xe98e, 0xf9af, 0x8948, 0x9969, 0xa90a, 0xb92b,
    0x5af5, 0x4ad4, 0x7ab7, 0x6a96, 0x1a71, 0x0a50, 0x3a33, 0x2a12,
    0xdbfd, 0xcbdc, 0xfbbf, 0xeb9e, 0x9b79, 0x8b58, 0xbb3b, 0xab1a,
    0x6ca6, 0x7c87, 0x4ce4, 0x5cc5, 0x2c22, 0x3c03, 0x0c60, 0x1c41,
    0xedae, 0xfd8f, 0xcdec, 0xddcd, 0xad2a, 0xbd0b, 0x8d68, 0x9d49,
    0x7e97, 0x6eb6, 0x5ed5, 0x4ef4, 0x3e13, 0x2e32, 0x1e51, 0x0e70,
    0xff9f, 0xefbe, 0xdfdd, 0xcffc, 0xbf1b, 0xaf3a, 0x9f59, 0x8f78,
    0x9188, 0x81a9, 0xb1ca, 0xa1eb, 0xd10c, 0xc12d, 0xf14e, 0xe16f,
    0x1080, 0x00a1, 0x30c2, 0x20e3, 0x5004, 0x4025, 0x7046, 0x6067,
    0x83b9, 0x9398, 0xa3fb, 0xb3da, 0xc33d, 0xd31c, 0xe37f, 0xf35e,
    0x02b1, 0x1290, 0x22f3, 0x32d2, 0x4235, 0x5214, 0x6277, 0x7256,
    0xb5ea, 0xa5cb, 0x95a8, 0x8589, 0xf56e, 0xe54f, 0xd52c, 0xc50d,
    0x34e2, 0x24c3, 0x14a0, 0x0481, 0x7466, 0x6447, 0x5424, 0x4405,
    0xa7db, 0xb7fa, 0x8799, 0x97b8, 0xe75f, 0xf77e, 0xc71d, 0xd73c,
    0x26d3, 0x36f2, 0x0691, 0x16b0, 0x6657, 0x7676, 0x4615, 0x5634,
    0xd94c, 0xc96d, 0xf90e, 0xe92f, 0x99c8, 0x89e9, 0xb98a, 0xa9ab,
    0x5844, 0x4865, 0x7806, 0x6827, 0x18c0, 0x08e1, 0x3882, 0x28a3,
    0xcb7d, 0xdb5c, 0xeb3f, 0xfb1e, 0x8bf9, 0x9bd8, 0xabbb, 0xbb9a,
    0x4a75, 0x5a54, 0x6a37, 0x7a16, 0x0af1, 0x1ad0, 0x2ab3, 0x3a92,
    0xfd2e, 0xed0f, 0xdd6c, 0xcd4d, 0xbdaa, 0xad8b, 0x9de8, 0x8dc9,
    0x7c26, 0x6c07, 0x5c64, 0x4c45, 0x3ca2, 0x2c83, 0x1ce0, 0x0cc1,
    0xef1f, 0xff3e, 0xcf5d, 0xdf7c, 0xaf9b, 0xbfba, 0x8fd9, 0x9ff8,
    0x6e17, 0x7e36, 0x4e55, 0x5e74, 0x2e93, 0x3eb2, 0x0ed1, 0x1ef0,
];

fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| {
        (crc << 8) ^ CRC16_TABLE[((crc >> 8) ^ byte as u16) as usize]
    })
}

/// Returns the part of `key` that is hashed: the content of the first
/// non-empty `{...}` tag, or the whole key.
fn hash_tag(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|&b| b == b'{') else {
        return key;
    };
    let rest = &key[open + 1..];
    match rest.iter().position(|&b| b == b'}') {
        Some(0) | None => key,
        Some(close) => &rest[..close],
    }
}

/// Computes the hash slot for a key. Always `< SLOT_COUNT`.
pub fn key_slot(key: &[u8]) -> u16 {
    crc16(hash_tag(key)) % SLOT_COUNT
}

/// A contiguous, inclusive range of slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    /// Creates a validated range. Fails if `start > end` or the end is
    /// outside the slot space.
    pub fn new(start: u16, end: u16) -> Result<Self, ParseError> {
        if start > end || end >= SLOT_COUNT {
            return Err(ParseError::Slot(format!("{start}-{end}")));
        }
        Ok(Self { start, end })
    }

    /// Creates a range containing a single slot.
    pub fn single(slot: u16) -> Self {
        Self {
            start: slot,
            end: slot,
        }
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn contains(&self, slot: u16) -> bool {
        (self.start..=self.end).contains(&slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl fmt::Display for SlotRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl FromStr for SlotRange {
    type Err = ParseError;

    /// Parses `N` or `N-M`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ParseError::Slot(s.to_owned());
        let (start, end) = match s.split_once('-') {
            Some((a, b)) => (a, b),
            None => (s, s),
        };
        let start: u16 = start.parse().map_err(|_| bad())?;
        let end: u16 = end.parse().map_err(|_| bad())?;
        SlotRange::new(start, end).map_err(|_| bad())
    }
}

/// Collapses a sorted slot sequence into ranges.
pub fn compress<I>(slots: I) -> Vec<SlotRange>
where
    I: IntoIterator<Item = u16>,
{
    let mut ranges: Vec<SlotRange> = Vec::new();
    for slot in slots {
        match ranges.last_mut() {
            Some(last) if last.end.checked_add(1) == Some(slot) => last.end = slot,
            _ => ranges.push(SlotRange::single(slot)),
        }
    }
    ranges
}

/// Formats slots as a compact comma-separated range list, e.g. `0-99,200`.
pub fn format_slots<'a, I>(slots: I) -> String
where
    I: IntoIterator<Item = &'a u16>,
{
    compress(slots.into_iter().copied())
        .iter()
        .map(SlotRange::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Splits `n` into `m` near-equal integer parts.
///
/// The first `n % m` parts get one extra unit, so parts differ by at most one
/// and sum to `n`. Returns an empty vector when `m` is zero.
pub fn divide(n: usize, m: usize) -> Vec<usize> {
    if m == 0 {
        return Vec::new();
    }
    let (base, extra) = (n / m, n % m);
    (0..m).map(|i| base + usize::from(i < extra)).collect()
}

/// Maps each slot to the primaries claiming it.
///
/// Built from a topology snapshot to answer "is every slot owned exactly
/// once" without trusting any single node's view.
#[derive(Debug, Clone)]
pub struct SlotMap {
    owners: Vec<Vec<String>>,
}

impl Default for SlotMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotMap {
    pub fn new() -> Self {
        Self {
            owners: vec![Vec::new(); SLOT_COUNT as usize],
        }
    }

    /// Records that `owner` claims every slot in `slots`.
    pub fn claim<'a, I>(&mut self, owner: &str, slots: I)
    where
        I: IntoIterator<Item = &'a u16>,
    {
        for &slot in slots {
            if let Some(claims) = self.owners.get_mut(slot as usize) {
                claims.push(owner.to_owned());
            }
        }
    }

    /// Returns the owner of `slot` if exactly one primary claims it.
    pub fn owner(&self, slot: u16) -> Option<&str> {
        match self.owners.get(slot as usize).map(Vec::as_slice) {
            Some([only]) => Some(only.as_str()),
            _ => None,
        }
    }

    /// Slots no primary claims.
    pub fn unassigned(&self) -> BTreeSet<u16> {
        self.slots_where(|claims| claims.is_empty())
    }

    /// Slots claimed by more than one primary.
    pub fn conflicts(&self) -> BTreeSet<u16> {
        self.slots_where(|claims| claims.len() > 1)
    }

    /// True when every slot has exactly one owner.
    pub fn is_partition(&self) -> bool {
        self.owners.iter().all(|claims| claims.len() == 1)
    }

    fn slots_where(&self, pred: impl Fn(&Vec<String>) -> bool) -> BTreeSet<u16> {
        self.owners
            .iter()
            .enumerate()
            .filter(|(_, claims)| pred(claims))
            .map(|(slot, _)| slot as u16)
            .collect()
    }
}
