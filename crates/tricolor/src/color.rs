//! The color protocol.
//!
//! Every collectable object carries a packed mark byte:
//!
//! ```text
//! bit 0 - white, generation 0
//! bit 1 - white, generation 1
//! bit 2 - black
//! bit 3 - fixed: never reclaimed by a sweep
//! bit 4 - super-fixed: survives even runtime close (main thread only)
//! ```
//!
//! Gray has no bit of its own: an object is gray when it is neither white nor
//! black. Which of the two whites counts as "current" alternates once per
//! cycle, so objects left over with the other white after marking are known
//! to be dead without a separate clearing pass.
//!
//! Kind-specific flags (finalized userdata, weak tables) live in the kind's own
//! fields, never in this byte. The byte itself is only touched through the
//! operations below.

use std::fmt;

const WHITE0_BIT: u8 = 1 << 0;
const WHITE1_BIT: u8 = 1 << 1;
const BLACK_BIT: u8 = 1 << 2;
const FIXED_BIT: u8 = 1 << 3;
const SUPER_FIXED_BIT: u8 = 1 << 4;
const WHITE_BITS: u8 = WHITE0_BIT | WHITE1_BIT;

/// One of the two generational whites.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct White(u8);

impl White {
    /// White of generation 0; the initial current white.
    pub const ZERO: Self = Self(WHITE0_BIT);
    /// White of generation 1.
    pub const ONE: Self = Self(WHITE1_BIT);

    /// The white that is not `self`.
    #[inline]
    #[must_use]
    pub const fn other(self) -> Self {
        Self(self.0 ^ WHITE_BITS)
    }
}

impl fmt::Debug for White {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == WHITE0_BIT {
            f.write_str("White0")
        } else {
            f.write_str("White1")
        }
    }
}

/// Observable tri-color state of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    /// Not reached yet in this cycle, or not yet swept back.
    White,
    /// Reached, children not (or no longer) traversed.
    Gray,
    /// Reached and fully traversed.
    Black,
}

/// The packed mark byte of a collectable object.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Marked(u8);

impl Marked {
    /// Mark byte of a freshly allocated object.
    #[inline]
    #[must_use]
    pub const fn new(current: White) -> Self {
        Self(current.0)
    }

    /// Either white.
    #[inline]
    #[must_use]
    pub const fn is_white(self) -> bool {
        self.0 & WHITE_BITS != 0
    }

    /// Reached and traversed.
    #[inline]
    #[must_use]
    pub const fn is_black(self) -> bool {
        self.0 & BLACK_BIT != 0
    }

    /// Neither white nor black.
    #[inline]
    #[must_use]
    pub const fn is_gray(self) -> bool {
        !self.is_white() && !self.is_black()
    }

    /// Whether the object carries the white that is not `current`.
    ///
    /// After the atomic phase has flipped the current white, this is exactly
    /// the set of objects that were not reached by the finished mark.
    #[inline]
    #[must_use]
    pub const fn is_dead(self, current: White) -> bool {
        self.0 & current.other().0 & WHITE_BITS != 0
    }

    /// Never collected while the runtime is open.
    #[inline]
    #[must_use]
    pub const fn is_fixed(self) -> bool {
        self.0 & FIXED_BIT != 0
    }

    /// Never collected, not even by `close`.
    #[inline]
    #[must_use]
    pub const fn is_super_fixed(self) -> bool {
        self.0 & SUPER_FIXED_BIT != 0
    }

    /// The tri-color view of these bits.
    #[must_use]
    pub const fn color(self) -> Color {
        if self.is_white() {
            Color::White
        } else if self.is_black() {
            Color::Black
        } else {
            Color::Gray
        }
    }

    #[inline]
    pub(crate) fn white_to_gray(&mut self) {
        self.0 &= !WHITE_BITS;
    }

    #[inline]
    pub(crate) fn gray_to_black(&mut self) {
        self.0 |= BLACK_BIT;
    }

    #[inline]
    pub(crate) fn black_to_gray(&mut self) {
        self.0 &= !BLACK_BIT;
    }

    /// Recolors to the current white, dropping black/gray.
    #[inline]
    pub(crate) fn make_white(&mut self, current: White) {
        self.0 = (self.0 & !(BLACK_BIT | WHITE_BITS)) | current.0;
    }

    /// Swaps white generations; used to resurrect a dead object found again.
    #[inline]
    pub(crate) fn change_white(&mut self) {
        self.0 ^= WHITE_BITS;
    }

    #[inline]
    pub(crate) fn set_fixed(&mut self) {
        self.0 |= FIXED_BIT;
    }

    #[inline]
    pub(crate) fn set_super_fixed(&mut self) {
        self.0 |= FIXED_BIT | SUPER_FIXED_BIT;
    }
}

impl fmt::Debug for Marked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Marked")
            .field("color", &self.color())
            .field("white0", &(self.0 & WHITE0_BIT != 0))
            .field("white1", &(self.0 & WHITE1_BIT != 0))
            .field("fixed", &self.is_fixed())
            .finish()
    }
}
