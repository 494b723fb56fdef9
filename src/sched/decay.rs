/*!
 * Decay Tables
 *
 * Exponential usage decay without multiplication or division. Entry `n`
 * approximates `(5/8)^n` as a pair of shifts:
 *
 * ```text
 * decayed = (v >> shift1) + (v >> shift2)     shift2 > 0
 * decayed = (v >> shift1) - (v >> -shift2)    shift2 < 0
 * ```
 *
 * After `DECAY_TICKS` elapsed ticks the usage is considered fully decayed.
 * The load-shift table maps run-queue load per processor onto the number of
 * bits subtracted from `fixed_shift` when deriving `pri_shift`.
 */

use serde::Serialize;

/// Number of ticks after which usage decays to zero
pub const DECAY_TICKS: u32 = 32;

/// `pri_shift` value that disables usage accumulation and priority decay
pub const NO_DECAY_SHIFT: u32 = 127;

const LOAD_SHIFT_ENTRIES: usize = 256;

/// One decay step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShiftPair {
    pub shift1: i8,
    pub shift2: i8,
}

impl ShiftPair {
    const fn new(shift1: i8, shift2: i8) -> Self {
        Self { shift1, shift2 }
    }

    /// Apply the step to a usage accumulator
    #[inline(always)]
    pub fn apply(self, value: u64) -> u64 {
        let head = shr(value, self.shift1 as u32);
        if self.shift2 > 0 {
            head.saturating_add(shr(value, self.shift2 as u32))
        } else {
            head.saturating_sub(shr(value, self.shift2.unsigned_abs() as u32))
        }
    }
}

#[inline(always)]
fn shr(value: u64, shift: u32) -> u64 {
    value.checked_shr(shift).unwrap_or(0)
}

/// Immutable decay and load-shift tables, shared by every scheduler
#[derive(Debug)]
pub struct DecayTable {
    shifts: [ShiftPair; DECAY_TICKS as usize],
    load_shifts: [u32; LOAD_SHIFT_ENTRIES],
}

static DECAY_TABLE: DecayTable = DecayTable {
    shifts: [
        ShiftPair::new(1, 1),
        ShiftPair::new(1, 3),
        ShiftPair::new(1, -3),
        ShiftPair::new(2, -7),
        ShiftPair::new(3, 5),
        ShiftPair::new(3, -5),
        ShiftPair::new(4, -8),
        ShiftPair::new(5, 7),
        ShiftPair::new(5, -7),
        ShiftPair::new(6, -10),
        ShiftPair::new(7, 10),
        ShiftPair::new(7, -9),
        ShiftPair::new(8, -11),
        ShiftPair::new(9, 12),
        ShiftPair::new(9, -11),
        ShiftPair::new(10, -13),
        ShiftPair::new(11, 14),
        ShiftPair::new(11, -13),
        ShiftPair::new(12, -15),
        ShiftPair::new(13, 17),
        ShiftPair::new(13, -15),
        ShiftPair::new(14, -17),
        ShiftPair::new(15, 19),
        ShiftPair::new(16, 18),
        ShiftPair::new(16, -19),
        ShiftPair::new(17, 22),
        ShiftPair::new(18, 20),
        ShiftPair::new(18, -20),
        ShiftPair::new(19, 26),
        ShiftPair::new(20, 22),
        ShiftPair::new(20, -22),
        ShiftPair::new(21, -27),
    ],
    load_shifts: load_shift_table(),
};

/// floor(log2(load)); entry 0 is unused since load <= 1 disables decay
const fn load_shift_table() -> [u32; LOAD_SHIFT_ENTRIES] {
    let mut table = [0u32; LOAD_SHIFT_ENTRIES];
    let mut i = 2;
    while i < LOAD_SHIFT_ENTRIES {
        table[i] = usize::BITS - 1 - i.leading_zeros();
        i += 1;
    }
    table
}

impl DecayTable {
    /// The process-wide table
    pub fn standard() -> &'static DecayTable {
        &DECAY_TABLE
    }

    /// Shift pair for `ticks` elapsed ticks, `None` once fully decayed
    #[inline(always)]
    pub fn pair(&self, ticks: u32) -> Option<ShiftPair> {
        self.shifts.get(ticks as usize).copied()
    }

    /// Decay `value` over `ticks` elapsed ticks
    #[inline]
    pub fn decay(&self, value: u64, ticks: u32) -> u64 {
        match self.pair(ticks) {
            Some(pair) => pair.apply(value),
            None => 0,
        }
    }

    /// `pri_shift` for a per-processor load
    pub fn pri_shift(&self, fixed_shift: u32, load: usize) -> u32 {
        if load <= 1 {
            return NO_DECAY_SHIFT;
        }
        let index = load.min(LOAD_SHIFT_ENTRIES - 1);
        fixed_shift.saturating_sub(self.load_shifts[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_interval_is_identity_for_even_values() {
        let table = DecayTable::standard();
        assert_eq!(table.decay(800, 0), 800);
    }

    #[test]
    fn test_one_tick_approximates_five_eighths() {
        let table = DecayTable::standard();
        // (1000 >> 1) + (1000 >> 3) = 625
        assert_eq!(table.decay(1000, 1), 625);
        // (1000 >> 1) - (1000 >> 3) = 375
        assert_eq!(table.decay(1000, 2), 375);
    }

    #[test]
    fn test_table_tracks_exponential() {
        let table = DecayTable::standard();
        let value = 1u64 << 40;
        for ticks in 1..DECAY_TICKS {
            let exact = value as f64 * 0.625f64.powi(ticks as i32);
            let approx = table.decay(value, ticks) as f64;
            assert!(
                (approx - exact).abs() / exact < 0.15,
                "tick {ticks}: approx {approx} exact {exact}"
            );
        }
    }

    #[test]
    fn test_monotone_in_ticks() {
        let table = DecayTable::standard();
        let value = 123_456_789u64;
        let mut last = value;
        for ticks in 1..=DECAY_TICKS {
            let decayed = table.decay(value, ticks);
            assert!(decayed <= last);
            last = decayed;
        }
        assert_eq!(table.decay(value, DECAY_TICKS), 0);
        assert_eq!(table.pair(DECAY_TICKS), None);
    }

    #[test]
    fn test_pri_shift_from_load() {
        let table = DecayTable::standard();
        assert_eq!(table.pri_shift(24, 0), NO_DECAY_SHIFT);
        assert_eq!(table.pri_shift(24, 1), NO_DECAY_SHIFT);
        assert_eq!(table.pri_shift(24, 2), 23);
        assert_eq!(table.pri_shift(24, 3), 23);
        assert_eq!(table.pri_shift(24, 4), 22);
        assert_eq!(table.pri_shift(24, 100_000), 17);
        assert_eq!(table.pri_shift(3, 1_000), 0);
    }
}
