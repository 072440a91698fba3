use crate::frame::Reason;

/// The maximum size of a flow controlled window, per RFC 7540 section 6.9.1.
pub const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;

/// A send or receive window.
///
/// The window is signed: a SETTINGS_INITIAL_WINDOW_SIZE shrink can push an
/// in-use window below zero, in which case the holder owes the peer the
/// difference before sending again.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FlowControl {
    window_size: i32,
}

impl FlowControl {
    pub fn new(size: u32) -> FlowControl {
        debug_assert!(size <= MAX_WINDOW_SIZE);
        FlowControl {
            window_size: size as i32,
        }
    }

    /// The current window. Negative values mean the peer shrank the initial
    /// window below what is already in flight.
    pub fn window_size(&self) -> i32 {
        self.window_size
    }

    /// The portion of the window available for sending.
    pub fn available(&self) -> u32 {
        if self.window_size < 0 {
            0
        } else {
            self.window_size as u32
        }
    }

    /// Grow the window from a WINDOW_UPDATE increment.
    ///
    /// Overflowing past `MAX_WINDOW_SIZE` is a FLOW_CONTROL_ERROR; the
    /// caller decides the scope.
    pub fn increase(&mut self, increment: u32) -> Result<(), Reason> {
        let (next, overflowed) = self.window_size.overflowing_add(increment as i32);
        if overflowed || next > MAX_WINDOW_SIZE as i32 {
            return Err(Reason::FLOW_CONTROL_ERROR);
        }
        self.window_size = next;
        Ok(())
    }

    /// Apply the signed delta of a SETTINGS_INITIAL_WINDOW_SIZE change.
    pub fn apply_delta(&mut self, delta: i64) -> Result<(), Reason> {
        let next = self.window_size as i64 + delta;
        if next > MAX_WINDOW_SIZE as i64 {
            return Err(Reason::FLOW_CONTROL_ERROR);
        }
        // The low end cannot underflow i32: both operands are within the
        // 32-bit window range.
        self.window_size = next as i32;
        Ok(())
    }

    /// Consume window capacity; data is being sent (or was received).
    ///
    /// May push the window negative: the weighted backlog release rounds
    /// zero shares up to one byte, so claims can slightly exceed what a
    /// WINDOW_UPDATE brought in.
    pub fn consume(&mut self, sz: u32) {
        self.window_size -= sz as i32;
    }

    /// Consume capacity that may exceed the window, reporting the violation.
    pub fn try_consume(&mut self, sz: u32) -> Result<(), Reason> {
        if (sz as i64) > self.window_size as i64 {
            return Err(Reason::FLOW_CONTROL_ERROR);
        }
        self.window_size -= sz as i32;
        Ok(())
    }
}
