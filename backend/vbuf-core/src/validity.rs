//! Detection of guest writes to memory covered by a cached buffer

use vbuf_common::GuestMemory;

/// Low bit of each 16-bit half is ignored when comparing words, as it only carries coverage.
const COMPARE_MASK: u32 = 0xFFFE_FFFE;

/// Words stamped at the start of buffers whose contents are never written back to guest memory.
pub const FINGERPRINT: [u32; 4] = [0xFFFF_FFFE, 0x3333_5554, 0xCCCC_AAAA, 0x0000_FFFE];

const FINGERPRINT_LEN: u32 = (FINGERPRINT.len() * 4) as u32;

/// How a buffer decides whether guest memory still matches what the cache holds.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ValidityStrategy {
    /// Nothing recorded; the buffer is assumed valid
    #[default]
    Unknown,
    /// The buffer was cleared to this guest fill color and not drawn to since
    FillColor(u32),
    /// [`FINGERPRINT`] was written at the start of the buffer's guest range
    Fingerprint,
    /// Copy of the buffer's guest bytes
    Snapshot(Box<[u8]>),
}

/// Guest byte range covered by a buffer, clipped to the end of guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestRange {
    pub start: u32,
    pub len: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ValidityOracle {
    strategy: ValidityStrategy,
    checked: Option<(u32, bool)>,
}

impl ValidityOracle {
    #[must_use]
    pub fn strategy(&self) -> &ValidityStrategy {
        &self.strategy
    }

    #[must_use]
    pub fn is_cleared(&self) -> bool {
        matches!(self.strategy, ValidityStrategy::FillColor(_))
    }

    #[must_use]
    pub fn has_snapshot(&self) -> bool {
        matches!(self.strategy, ValidityStrategy::Snapshot(_))
    }

    pub(crate) fn mark_cleared(&mut self, fill_color: u32) {
        self.strategy = ValidityStrategy::FillColor(fill_color);
        self.checked = None;
    }

    /// The buffer was drawn to, so a recorded fill color no longer describes it.
    pub(crate) fn mark_drawn(&mut self) {
        if self.is_cleared() {
            self.strategy = ValidityStrategy::Unknown;
            self.checked = None;
        }
    }

    pub(crate) fn discard(&mut self) {
        self.strategy = ValidityStrategy::Unknown;
        self.checked = None;
    }

    /// Record the current guest contents of `range`. A recorded fill color takes priority and is
    /// kept. With `fingerprint` set, the range is stamped with [`FINGERPRINT`] instead of copied;
    /// ranges too short to hold it fall back to a copy.
    pub(crate) fn capture(
        &mut self,
        range: GuestRange,
        fingerprint: bool,
        memory: &mut GuestMemory,
    ) {
        self.checked = None;
        if self.is_cleared() {
            return;
        }

        if fingerprint && range.len >= FINGERPRINT_LEN {
            let base = range.start & !3;
            let stamped = FINGERPRINT
                .iter()
                .zip((base..).step_by(4))
                .try_for_each(|(&word, address)| memory.write_u32(address, word));
            match stamped {
                Ok(()) => {
                    self.strategy = ValidityStrategy::Fingerprint;
                    return;
                }
                Err(err) => log::debug!("Unable to fingerprint {:06X}: {err}", range.start),
            }
        }

        self.strategy = match memory.slice(range.start, range.len as usize) {
            Ok(bytes) => ValidityStrategy::Snapshot(bytes.into()),
            Err(err) => {
                log::debug!("Unable to snapshot {:06X}: {err}", range.start);
                ValidityStrategy::Unknown
            }
        };
    }

    /// Whether the guest range `[start, end]` still holds what was recorded. The result is
    /// computed at most once per `frame`.
    pub fn check(&mut self, start: u32, end: u32, memory: &GuestMemory, frame: u32) -> bool {
        match self.checked {
            Some((checked_frame, valid)) if checked_frame == frame => return valid,
            _ => {}
        }

        let valid = self.evaluate(start, end, memory);
        self.checked = Some((frame, valid));
        valid
    }

    fn evaluate(&self, start: u32, end: u32, memory: &GuestMemory) -> bool {
        match &self.strategy {
            ValidityStrategy::Unknown => true,
            ValidityStrategy::FillColor(fill_color) => {
                let first_word = start >> 2;
                let end_word = (end >> 2).min(memory.limit() >> 2);
                let expected = fill_color & COMPARE_MASK;
                let words = (first_word..=end_word).map(|word| memory.read_u32(word << 2));
                within_tolerance(words.map(|word| word.map(|word| word & COMPARE_MASK == expected)))
            }
            ValidityStrategy::Fingerprint => {
                let base = start & !3;
                FINGERPRINT.iter().zip((base..).step_by(4)).all(|(&expected, address)| {
                    memory
                        .read_u32(address)
                        .is_ok_and(|word| word & COMPARE_MASK == expected & COMPARE_MASK)
                })
            }
            ValidityStrategy::Snapshot(snapshot) => {
                let words = snapshot.chunks_exact(4).zip((start..).step_by(4)).map(
                    |(chunk, address)| {
                        let expected = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                        memory
                            .slice(address, 4)
                            .map(|bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
                            .map(|word| word & COMPARE_MASK == expected & COMPARE_MASK)
                    },
                );
                within_tolerance(words)
            }
        }
    }
}

/// True if fewer than 1% of the compared words differ. Words that could not be read count as
/// differing.
fn within_tolerance<E>(matches: impl Iterator<Item = Result<bool, E>>) -> bool {
    let (total, mismatched) = matches.fold((0_u64, 0_u64), |(total, mismatched), matched| {
        (total + 1, mismatched + u64::from(!matches!(matched, Ok(true))))
    });
    mismatched * 100 < total
}
