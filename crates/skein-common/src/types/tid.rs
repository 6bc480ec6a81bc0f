use crate::types::string::StrError;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, de::Error};
use smol_str::{SmolStr, SmolStrBuilder};
use std::fmt;
use std::sync::LazyLock;
use std::{ops::Deref, str::FromStr};

const S32_CHAR: &[u8] = b"234567abcdefghijklmnopqrstuvwxyz";

/// Largest clock identifier (ten bits)
pub const MAX_CLOCK_ID: u16 = 0x3FF;

fn s32_encode(mut i: u64) -> SmolStr {
    let mut chars = [0u8; 13];
    for slot in chars.iter_mut().rev() {
        *slot = S32_CHAR[(i & 0x1F) as usize];
        i >>= 5;
    }

    let mut builder = SmolStrBuilder::new();
    for c in chars {
        builder.push(c as char);
    }
    builder.finish()
}

fn s32_decode(s: &str) -> u64 {
    s.bytes().fold(0u64, |acc, c| {
        let digit = S32_CHAR.iter().position(|&x| x == c).unwrap_or(0) as u64;
        (acc << 5) | digit
    })
}

static TID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[234567abcdefghij][234567abcdefghijklmnopqrstuvwxyz]{12}$").unwrap()
});

/// A [Timestamp Identifier].
///
/// Thirteen characters of sortable base32 over a 64-bit integer laid out as
/// one zero bit, 53 bits of microseconds since the epoch and a 10-bit clock
/// id. String order and numeric order agree, so revisions compare with `<`.
///
/// [Timestamp Identifier]: https://atproto.com/specs/tid
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Hash)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Tid(SmolStr);

impl Tid {
    /// Parses a `TID` from the given string.
    pub fn new(tid: impl AsRef<str>) -> Result<Self, StrError> {
        let tid = tid.as_ref();
        if tid.len() > 13 {
            Err(StrError::too_long("tid", tid, 13, tid.len()))
        } else if tid.len() < 13 {
            Err(StrError::too_short("tid", tid, 13, tid.len()))
        } else if !TID_REGEX.is_match(tid) {
            Err(StrError::regex(
                "tid",
                tid,
                SmolStr::new_static("didn't match schema"),
            ))
        } else {
            Ok(Self(SmolStr::new_inline(tid)))
        }
    }

    /// Build a TID from a microsecond timestamp and a clock id.
    ///
    /// The timestamp is truncated to 53 bits and the clock id to 10.
    pub fn from_parts(timestamp_micros: u64, clock_id: u16) -> Self {
        // 0TTTTTTTTTTTTTTT TTTTTTTTTTTTTTTT TTTTTTTTTTTTTTTT TTTTTTCCCCCCCCCC
        let tid = (timestamp_micros << 10) & 0x7FFF_FFFF_FFFF_FC00
            | (clock_id & MAX_CLOCK_ID) as u64;
        Self(s32_encode(tid))
    }

    /// Build a TID for the given time
    pub fn from_datetime(clock_id: u16, time: chrono::DateTime<chrono::Utc>) -> Self {
        Self::from_parts(time.timestamp_micros().max(0) as u64, clock_id)
    }

    /// The smallest valid TID, `2222222222222`
    pub fn zero() -> Self {
        Self::from_parts(0, 0)
    }

    /// The 64-bit integer this TID encodes
    pub fn to_u64(&self) -> u64 {
        s32_decode(&self.0)
    }

    /// Microseconds since the Unix epoch
    pub fn timestamp_micros(&self) -> u64 {
        self.to_u64() >> 10
    }

    /// The clock id component
    pub fn clock_id(&self) -> u16 {
        (self.to_u64() & MAX_CLOCK_ID as u64) as u16
    }

    /// Returns the TID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Tid {
    type Err = StrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Tid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: std::borrow::Cow<'de, str> = Deserialize::deserialize(deserializer)?;
        Self::new(value).map_err(D::Error::custom)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Tid> for SmolStr {
    fn from(value: Tid) -> Self {
        value.0
    }
}

impl AsRef<str> for Tid {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for Tid {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

/// Source of wall-clock time for TID generation
pub trait Clock: Send + Sync {
    /// Current time in microseconds since the Unix epoch
    fn now_micros(&self) -> u64;
}

/// The system clock, via `chrono`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        chrono::Utc::now().timestamp_micros().max(0) as u64
    }
}

impl<F: Fn() -> u64 + Send + Sync> Clock for F {
    fn now_micros(&self) -> u64 {
        self()
    }
}

/// Issues strictly increasing TIDs.
///
/// Each generator carries its own clock id and the last timestamp it handed
/// out. When the clock has not advanced (or has gone backwards), the next
/// TID uses `last + 1` microseconds instead.
#[derive(Debug, Clone)]
pub struct TidGenerator<C = SystemClock> {
    clock: C,
    clock_id: u16,
    last: u64,
}

impl TidGenerator<SystemClock> {
    /// Generator on the system clock with a random clock id
    pub fn new() -> Self {
        Self::with_clock(SystemClock, random_clock_id())
    }
}

impl Default for TidGenerator<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

/// A random ten-bit clock id
pub fn random_clock_id() -> u16 {
    rand::random::<u16>() & MAX_CLOCK_ID
}

impl<C: Clock> TidGenerator<C> {
    /// Generator on a given clock with a fixed clock id
    pub fn with_clock(clock: C, clock_id: u16) -> Self {
        Self {
            clock,
            clock_id: clock_id & MAX_CLOCK_ID,
            last: 0,
        }
    }

    /// Clock id stamped into every TID from this generator
    pub fn clock_id(&self) -> u16 {
        self.clock_id
    }

    /// Next TID, strictly greater than every TID this generator issued before
    pub fn next_tid(&mut self) -> Tid {
        let now = self.clock.now_micros();
        let ts = now.max(self.last.saturating_add(1));
        self.last = ts;
        Tid::from_parts(ts, self.clock_id)
    }

    /// Next TID, also strictly greater than `prev` when given.
    ///
    /// Used for commit revisions, which must move forward even if the
    /// previous revision came from another clock.
    pub fn next_after(&mut self, prev: Option<&Tid>) -> Tid {
        if let Some(prev) = prev {
            self.last = self.last.max(prev.timestamp_micros());
        }
        self.next_tid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn valid_tids() {
        assert!(Tid::new("3jzfcijpj2z2a").is_ok());
        assert!(Tid::new("7777777777777").is_ok());
        assert!(Tid::new("3zzzzzzzzzzzz").is_ok());
        assert!(Tid::new("2222222222222").is_ok());
    }

    #[test]
    fn invalid_tids() {
        assert!(Tid::new("3jzfcijpj2z2").is_err());
        assert!(Tid::new("3jzfcijpj2z2aa").is_err());
        // first char must keep the top bit clear
        assert!(Tid::new("zzzzzzzzzzzzz").is_err());
        assert!(Tid::new("3jzfcijpj2z21").is_err());
        assert!(Tid::new("3JZFCIJPJ2Z2A").is_err());
    }

    #[test]
    fn parts_roundtrip() {
        let tid = Tid::from_parts(1_700_000_000_123_456, 42);
        assert_eq!(tid.as_str().len(), 13);
        assert!(Tid::new(tid.as_str()).is_ok());
        assert_eq!(tid.timestamp_micros(), 1_700_000_000_123_456);
        assert_eq!(tid.clock_id(), 42);
        assert_eq!(Tid::zero().as_str(), "2222222222222");
    }

    #[test]
    fn string_order_matches_time_order() {
        let a = Tid::from_parts(1_000_000, 1023);
        let b = Tid::from_parts(1_000_001, 0);
        assert!(a < b);
        assert!(a.as_str() < b.as_str());
    }

    #[test]
    fn generator_is_monotonic_with_stalled_clock() {
        let mut tids = TidGenerator::with_clock(|| 5_000_000u64, 7);
        let first = tids.next_tid();
        let second = tids.next_tid();
        let third = tids.next_tid();
        assert!(first < second && second < third);
        assert_eq!(first.timestamp_micros(), 5_000_000);
        assert_eq!(third.timestamp_micros(), 5_000_002);
        assert_eq!(third.clock_id(), 7);
    }

    #[test]
    fn generator_survives_clock_going_backwards() {
        let now = Arc::new(AtomicU64::new(10_000));
        let clock = {
            let now = now.clone();
            move || now.load(Ordering::SeqCst)
        };
        let mut tids = TidGenerator::with_clock(clock, 0);
        let a = tids.next_tid();
        now.store(5_000, Ordering::SeqCst);
        let b = tids.next_tid();
        assert!(b > a);
        now.store(20_000, Ordering::SeqCst);
        assert_eq!(tids.next_tid().timestamp_micros(), 20_000);
    }

    #[test]
    fn next_after_beats_foreign_rev() {
        let mut tids = TidGenerator::with_clock(|| 100u64, 0);
        let foreign = Tid::from_parts(900, 1000);
        let rev = tids.next_after(Some(&foreign));
        assert!(rev > foreign);
        assert_eq!(rev.timestamp_micros(), 901);
    }

    #[test]
    fn system_clock_generator() {
        let mut tids = TidGenerator::new();
        assert!(tids.clock_id() <= MAX_CLOCK_ID);
        let a = tids.next_tid();
        let b = tids.next_tid();
        assert!(a < b);
    }
}
