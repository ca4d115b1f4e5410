//! Key-to-slot resolution and the slot ownership table.
//!
//! Every node must agree on the hash and the slot count, otherwise two
//! nodes can disagree about who owns a key and routing diverges. Keys are
//! hashed with CRC16 (XMODEM) modulo [`SLOT_COUNT`]; a `{tag}` inside the
//! key restricts hashing to the tag so related keys can share a slot.

use std::str::FromStr;

use crate::NodeId;

/// Total number of hash slots in the cluster.
pub const SLOT_COUNT: u16 = 16384;

/// CRC16 lookup table (CCITT polynomial, XMODEM variant).
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
        let idx = ((crc >> 8) ^ u16::from(byte)) as usize;
        (crc << 8) ^ CRC16_TABLE[idx]
    })
}

/// Returns the part of `key` that is hashed.
///
/// The tag is the content between the first `{` and the first `}` after
/// it. A missing or empty tag means the whole key is hashed.
fn hash_tag(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|&b| b == b'{') else {
        return key;
    };
    let rest = &key[open + 1..];
    match rest.iter().position(|&b| b == b'}') {
        Some(close) if close > 0 => &rest[..close],
        _ => key,
    }
}

/// Computes the slot of a key. Pure, never cached; always in `[0, SLOT_COUNT)`.
pub fn key_slot(key: &[u8]) -> u16 {
    crc16(hash_tag(key)) % SLOT_COUNT
}

/// An inclusive range of slots, `start <= end < SLOT_COUNT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    /// Creates a range, validating the bounds.
    pub fn try_new(start: u16, end: u16) -> Result<Self, String> {
        if start > end {
            return Err(format!("slot range requires start <= end, got {start}-{end}"));
        }
        if end >= SLOT_COUNT {
            return Err(format!("slot {end} out of range (max {})", SLOT_COUNT - 1));
        }
        Ok(Self { start, end })
    }

    /// The range covering every slot.
    pub fn full() -> Self {
        Self {
            start: 0,
            end: SLOT_COUNT - 1,
        }
    }

    /// Number of slots in the range (always >= 1).
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u16 {
        self.end - self.start + 1
    }

    pub fn contains(&self, slot: u16) -> bool {
        (self.start..=self.end).contains(&slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl FromStr for SlotRange {
    type Err = String;

    /// Parses `"100"` or `"0-8191"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<u16>()
                .map_err(|_| format!("invalid slot '{}' in '{s}'", part.trim()))
        };
        match s.split_once('-') {
            Some((start, end)) => Self::try_new(parse(start)?, parse(end)?),
            None => {
                let slot = parse(s)?;
                Self::try_new(slot, slot)
            }
        }
    }
}

impl std::fmt::Display for SlotRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Maps each slot to the node that owns it.
///
/// `None` means the slot is not served; routing a key there is a
/// configuration error, never silently redirected.
#[derive(Debug, Clone)]
pub struct SlotMap {
    slots: Box<[Option<NodeId>]>,
}

impl Default for SlotMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotMap {
    /// Creates a map with no assignments.
    pub fn new() -> Self {
        Self {
            slots: vec![None; SLOT_COUNT as usize].into_boxed_slice(),
        }
    }

    /// Creates a map where `node` owns every slot.
    pub fn single_node(node: NodeId) -> Self {
        let mut map = Self::new();
        map.assign_range(SlotRange::full(), node);
        map
    }

    pub fn owner(&self, slot: u16) -> Option<NodeId> {
        self.slots.get(slot as usize).copied().flatten()
    }

    pub fn assign(&mut self, slot: u16, node: NodeId) {
        if let Some(entry) = self.slots.get_mut(slot as usize) {
            *entry = Some(node);
        }
    }

    pub fn assign_range(&mut self, range: SlotRange, node: NodeId) {
        for slot in range.iter() {
            self.assign(slot, node);
        }
    }

    pub fn unassign(&mut self, slot: u16) {
        if let Some(entry) = self.slots.get_mut(slot as usize) {
            *entry = None;
        }
    }

    /// Returns true if every slot has an owner.
    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    pub fn unassigned_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_none()).count()
    }

    /// Slots owned by `node`, merged into ranges.
    pub fn slots_for_node(&self, node: NodeId) -> Vec<SlotRange> {
        let mut ranges = Vec::new();
        let mut open: Option<u16> = None;

        for (idx, owner) in self.slots.iter().enumerate() {
            let slot = idx as u16;
            match (*owner == Some(node), open) {
                (true, None) => open = Some(slot),
                (false, Some(start)) => {
                    ranges.push(SlotRange {
                        start,
                        end: slot - 1,
                    });
                    open = None;
                }
                _ => {}
            }
        }
        if let Some(start) = open {
            ranges.push(SlotRange {
                start,
                end: SLOT_COUNT - 1,
            });
        }
        ranges
    }
}
