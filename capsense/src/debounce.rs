use crate::ChannelMask;

/// Confidence counter debounce over `N` channels.
///
/// Each channel counts consecutive cycles that agree on pressed or released.
/// An agreeing run longer than `threshold` cycles sets or clears the channel's
/// bit in the debounced mask and starts the count over.
#[derive(Clone, Debug)]
pub struct Debouncer<const N: usize> {
    pressed_confidence: [u32; N],
    released_confidence: [u32; N],
    mask: ChannelMask,
    threshold: u32,
}

impl<const N: usize> Debouncer<N> {
    pub const fn new(threshold: u32) -> Self {
        Self {
            pressed_confidence: [0; N],
            released_confidence: [0; N],
            mask: ChannelMask::EMPTY,
            threshold,
        }
    }

    /// Current debounced pressed set
    pub fn mask(&self) -> ChannelMask {
        self.mask
    }

    /// Feed the raw pressed set of one completed sampling cycle.
    ///
    /// Returns the new debounced mask if it differs from the previous one.
    pub fn update(&mut self, raw: ChannelMask) -> Option<ChannelMask> {
        let previous = self.mask;

        for i in 0..N {
            if raw.contains(i) {
                self.pressed_confidence[i] += 1;
                self.released_confidence[i] = 0;
                if self.pressed_confidence[i] > self.threshold {
                    self.mask = self.mask.with(i);
                    self.pressed_confidence[i] = 0;
                }
            } else {
                self.released_confidence[i] += 1;
                self.pressed_confidence[i] = 0;
                if self.released_confidence[i] > self.threshold {
                    self.mask = self.mask.without(i);
                    self.released_confidence[i] = 0;
                }
            }
        }

        if self.mask != previous {
            Some(self.mask)
        } else {
            None
        }
    }
}
