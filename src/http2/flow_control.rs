/* STATIC Proxy (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

//! HTTP/2 flow-control accounting (RFC 7540 §5.2, §6.9).
//!
//! **Receive side:** [`FlowControlWindow`] batches consumed bytes and only announces
//! WINDOW_UPDATE increments in whole multiples of its threshold, so a peer streaming
//! small DATA frames does not get one WINDOW_UPDATE per frame.
//!
//! **Send side:** [`SendWindow`] is plain arithmetic on the credit the peer granted.

use crate::{
    http2::frame::MAX_WINDOW,
    utils::{FrontError, FrontResult},
};

#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    initial: u32,
    threshold: u32,
    /// Credit the peer still has before it must stop sending.
    available: i64,
    /// Consumed bytes not yet given back through an increment.
    unannounced: u32,
}

impl FlowControlWindow {
    /// `fraction` of the initial window must be consumed before an increment goes out.
    pub fn new(initial: u32, fraction: f64) -> Self {
        let threshold = (f64::from(initial) * fraction.clamp(0.0, 1.0)) as u32;
        Self {
            initial,
            threshold: threshold.max(1),
            available: i64::from(initial),
            unannounced: 0,
        }
    }

    pub fn initial(&self) -> u32 {
        self.initial
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn available(&self) -> i64 {
        self.available
    }

    pub fn unannounced(&self) -> u32 {
        self.unannounced
    }

    /// Whether `n` more bytes would exceed what the peer was allowed to send.
    pub fn would_overrun(&self, n: usize) -> bool {
        n as i64 > self.available
    }

    /// Accounts `n` consumed bytes; returns the increment to announce, or 0.
    ///
    /// Increments are whole multiples of the threshold; the remainder waits for a
    /// later call or for [`FlowControlWindow::on_blocked`].
    pub fn on_bytes_received(&mut self, n: usize) -> u32 {
        let n = u32::try_from(n).unwrap_or(u32::MAX);
        self.available -= i64::from(n);
        self.unannounced = self.unannounced.saturating_add(n);
        if self.unannounced < self.threshold {
            return 0;
        }
        let increment = self.unannounced - self.unannounced % self.threshold;
        self.announce(increment)
    }

    /// Peer reports it is blocked on this window: give back everything consumed.
    pub fn on_blocked(&mut self) -> u32 {
        let increment = self.unannounced;
        self.announce(increment)
    }

    fn announce(&mut self, increment: u32) -> u32 {
        self.unannounced -= increment;
        self.available += i64::from(increment);
        increment
    }
}

/// Credit for sending DATA, as granted by the peer.
#[derive(Debug, Clone, Copy)]
pub struct SendWindow {
    credit: i64,
}

impl SendWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            credit: i64::from(initial),
        }
    }

    /// Usable credit; a window driven negative by a SETTINGS change reads as zero.
    pub fn available(&self) -> usize {
        self.credit.max(0) as usize
    }

    /// Largest DATA payload allowed right now.
    pub fn sendable(&self, remaining: usize, max_frame_size: usize) -> usize {
        self.available().min(remaining).min(max_frame_size)
    }

    pub fn consume(&mut self, n: usize) -> FrontResult<()> {
        if n > self.available() {
            return Err(FrontError::FlowControl(format!(
                "sending {n} bytes with {} bytes of credit",
                self.available()
            )));
        }
        self.credit -= n as i64;
        Ok(())
    }

    /// Applies a WINDOW_UPDATE increment.
    pub fn increase(&mut self, increment: u32) -> FrontResult<()> {
        let credit = self.credit + i64::from(increment);
        if credit > i64::from(MAX_WINDOW) {
            return Err(FrontError::FlowControl(format!("window grew to {credit}")));
        }
        self.credit = credit;
        Ok(())
    }

    /// Applies a change of SETTINGS_INITIAL_WINDOW_SIZE (may go negative).
    pub fn adjust(&mut self, old_initial: u32, new_initial: u32) -> FrontResult<()> {
        let credit = self.credit + i64::from(new_initial) - i64::from(old_initial);
        if credit > i64::from(MAX_WINDOW) {
            return Err(FrontError::FlowControl(format!("window grew to {credit}")));
        }
        self.credit = credit;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_are_whole_thresholds() {
        let mut window = FlowControlWindow::new(100, 0.5);
        let mut announced = 0;
        for n in [20, 20, 20, 7, 33, 1] {
            announced += window.on_bytes_received(n);
        }
        // 101 bytes consumed, threshold 50.
        assert_eq!(announced, 100);
        assert_eq!(window.unannounced(), 1);
        assert_eq!(window.on_blocked(), 1);
        assert_eq!(window.on_blocked(), 0);
        assert_eq!(window.available(), 100);
    }

    #[test]
    fn below_threshold_stays_quiet() {
        let mut window = FlowControlWindow::new(65_535, 0.5);
        assert_eq!(window.on_bytes_received(16_384), 0);
        assert_eq!(window.on_bytes_received(16_384), 32_767);
        assert_eq!(window.unannounced(), 1);
    }

    #[test]
    fn overrun_is_detected_before_accounting() {
        let window = FlowControlWindow::new(10, 0.5);
        assert!(!window.would_overrun(10));
        assert!(window.would_overrun(11));
    }

    #[test]
    fn send_window_never_goes_negative_through_sending() {
        let mut window = SendWindow::new(10);
        assert_eq!(window.sendable(100, 16_384), 10);
        window.consume(10).unwrap();
        assert_eq!(window.sendable(100, 16_384), 0);
        assert!(window.consume(1).is_err());
        window.increase(5).unwrap();
        assert_eq!(window.sendable(3, 16_384), 3);
        assert!(window.increase(MAX_WINDOW).is_err());
    }

    #[test]
    fn settings_change_can_shrink_below_zero() {
        let mut window = SendWindow::new(100);
        window.consume(80).unwrap();
        window.adjust(100, 10).unwrap();
        assert_eq!(window.available(), 0);
        window.increase(100).unwrap();
        assert_eq!(window.available(), 30);
    }
}
