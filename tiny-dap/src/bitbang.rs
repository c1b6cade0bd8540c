// Copyright 2021-2022 Kenta Ida
//
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::cmsis_dap::DapError;
use bitflags::bitflags;
use embedded_hal::digital::v2::{InputPin, IoPin, OutputPin, PinState};

// Bit 0: SWCLK/TCK
// Bit 1: SWDIO/TMS
// Bit 2: TDI
// Bit 3: TDO
// Bit 5: nTRST
// Bit 7: nRESET
// https://arm-software.github.io/CMSIS_5/DAP/html/group__DAP__SWJ__Pins.html
bitflags! {
    pub struct SwjPins: u8 {
        const TCK_SWDCLK = 1;
        const TMS_SWDIO = 1 << 1;
        const TDI = 1 << 2;
        const TDO = 1 << 3;
        const N_TRST = 1 << 5;
        const N_RESET = 1 << 7;
    }
}

const JTAG_SEQUENCE_TMS: u8 = 0x40;
const JTAG_SEQUENCE_CLOCK: u8 = 0x3f;

/// One physical line of the debug connector.
///
/// Level changes must take effect before the next call returns.
pub trait SwdLine {
    fn set_low(&mut self);
    fn set_high(&mut self);
    fn enable_output(&mut self);
    fn release(&mut self);
    fn is_high(&mut self) -> bool;
}

pub trait DelayFunc {
    fn cycle_delay(&self, cycles: u32);
}

/// DelayFunc for back-ends whose GPIO access is already slow enough.
pub struct NoDelay;

impl DelayFunc for NoDelay {
    fn cycle_delay(&self, _cycles: u32) {}
}

/// Running count of `1` bits seen on the wire since the last reset.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Parity(u8);

impl Parity {
    pub fn reset(&mut self) {
        self.0 = 0;
    }
    pub fn count_one(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }
    pub fn is_odd(&self) -> bool {
        self.0 & 1 != 0
    }
    /// The parity bit that makes the counted field even.
    pub fn bit(&self) -> u8 {
        self.0 & 1
    }
}

/// Bit-level access to the SWD link.
pub trait LineDriver {
    /// Drives SWCLK and SWDIO as outputs with SWCLK low and releases nRESET.
    fn connect(&mut self);
    /// Releases all lines to inputs.
    fn disconnect(&mut self);
    /// Shifts `count` (1..=8) bits of `data` out, LSB first. Leaves SWCLK low.
    fn shift_out(&mut self, parity: &mut Parity, data: u8, count: u8);
    /// Samples `count` bits with SWDIO released. Each sampled bit enters at
    /// bit 7 and moves down, so the last eight samples are returned with the
    /// first of them in the lowest position. Leaves SWCLK low.
    fn shift_in(&mut self, parity: &mut Parity, count: u8) -> u8;
    /// Instantaneous SWCLK, SWDIO and nRESET levels.
    fn pin_levels(&mut self) -> SwjPins;
    fn drive_reset(&mut self, high: bool);
}

/// Raw sequence commands built on top of a `LineDriver`.
pub trait SwjIo {
    /// DAP_SWJ_Sequence body. Returns the number of request bytes consumed.
    fn swj_sequence(&mut self, request: &[u8]) -> Result<usize, DapError>;
    /// DAP_JTAG_Sequence body, TMS only. Returns the number of request bytes consumed.
    fn jtag_sequence(&mut self, request: &[u8]) -> Result<usize, DapError>;
    /// Reports the line levels and then applies the nRESET part of the request.
    fn swj_pins(&mut self, pin_output: SwjPins, pin_select: SwjPins) -> SwjPins;
}

impl<Io: LineDriver> SwjIo for Io {
    fn swj_sequence(&mut self, request: &[u8]) -> Result<usize, DapError> {
        let (&count, data) = request.split_first().ok_or(DapError::NotEnoughData)?;
        let mut count = if count == 0 { 256 } else { count as usize };
        let count_bytes = (count + 7) >> 3;
        if data.len() < count_bytes {
            return Err(DapError::NotEnoughData);
        }
        trace!("swj_sequence({})", count);

        let mut parity = Parity::default();
        for &value in &data[..count_bytes] {
            let bits = core::cmp::min(count, 8);
            self.shift_out(&mut parity, value, bits as u8);
            count -= bits;
        }
        Ok(1 + count_bytes)
    }

    fn jtag_sequence(&mut self, request: &[u8]) -> Result<usize, DapError> {
        let (&sequence_count, body) = request.split_first().ok_or(DapError::NotEnoughData)?;
        let clock_count = |sequence_info: u8| match sequence_info & JTAG_SEQUENCE_CLOCK {
            0 => 64,
            n => n as usize,
        };

        // Walk the whole payload first so a short request never moves the lines.
        let mut consumed = 0;
        for _ in 0..sequence_count {
            let sequence_info = *body.get(consumed).ok_or(DapError::NotEnoughData)?;
            consumed += 1 + ((clock_count(sequence_info) + 7) >> 3);
            if consumed > body.len() {
                return Err(DapError::NotEnoughData);
            }
        }

        let mut parity = Parity::default();
        let mut position = 0;
        for _ in 0..sequence_count {
            let sequence_info = body[position];
            let mut count = clock_count(sequence_info);
            position += 1 + ((count + 7) >> 3);
            // TDI content and TDO capture are ignored; only TMS reaches SWDIO.
            let tms = if sequence_info & JTAG_SEQUENCE_TMS != 0 {
                0xff
            } else {
                0x00
            };
            while count > 0 {
                let bits = core::cmp::min(count, 8);
                self.shift_out(&mut parity, tms, bits as u8);
                count -= bits;
            }
        }
        Ok(1 + consumed)
    }

    fn swj_pins(&mut self, pin_output: SwjPins, pin_select: SwjPins) -> SwjPins {
        let levels = self.pin_levels();
        // Only nRESET is ever driven; forcing SWCLK/SWDIO could fight the target.
        if pin_select.contains(SwjPins::N_RESET) {
            self.drive_reset(pin_output.contains(SwjPins::N_RESET));
        }
        if pin_select.intersects(!SwjPins::N_RESET) {
            debug!("swj_pins: ignoring select {=u8:#x}", pin_select.bits());
        }
        levels
    }
}

///////////////////
/////// SWD ///////
///////////////////

#[derive(Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SwdIoConfig {
    /// Cycles handed to `DelayFunc` between clock edges.
    pub clock_wait_cycles: u32,
}

impl Default for SwdIoConfig {
    fn default() -> Self {
        Self {
            clock_wait_cycles: 1,
        }
    }
}

pub struct SwdIoSet<SwClk, SwdIo, NReset, DelayFn>
where
    SwClk: SwdLine,
    SwdIo: SwdLine,
    NReset: SwdLine,
    DelayFn: DelayFunc,
{
    swclk: SwClk,
    swdio: SwdIo,
    nreset: NReset,
    cycle_delay: DelayFn,
    config: SwdIoConfig,
}

impl<SwClk, SwdIo, NReset, DelayFn> SwdIoSet<SwClk, SwdIo, NReset, DelayFn>
where
    SwClk: SwdLine,
    SwdIo: SwdLine,
    NReset: SwdLine,
    DelayFn: DelayFunc,
{
    /// Takes the three lines and leaves them all released.
    pub fn new(
        swclk: SwClk,
        swdio: SwdIo,
        nreset: NReset,
        cycle_delay: DelayFn,
        config: SwdIoConfig,
    ) -> Self {
        let mut io = Self {
            swclk,
            swdio,
            nreset,
            cycle_delay,
            config,
        };
        io.disconnect();
        io
    }

    pub fn release(self) -> (SwClk, SwdIo, NReset) {
        (self.swclk, self.swdio, self.nreset)
    }

    fn clock_wait(&self) {
        self.cycle_delay.cycle_delay(self.config.clock_wait_cycles);
    }
}

impl<SwClk, SwdIo, NReset, DelayFn> LineDriver for SwdIoSet<SwClk, SwdIo, NReset, DelayFn>
where
    SwClk: SwdLine,
    SwdIo: SwdLine,
    NReset: SwdLine,
    DelayFn: DelayFunc,
{
    fn connect(&mut self) {
        self.swclk.set_low();
        self.swclk.enable_output();
        self.swdio.enable_output();
        self.nreset.release();
    }

    fn disconnect(&mut self) {
        self.swdio.release();
        self.swclk.release();
        self.nreset.release();
    }

    fn shift_out(&mut self, parity: &mut Parity, data: u8, count: u8) {
        let mut value = data;
        self.swdio.enable_output();
        for _ in 0..count.min(8) {
            self.swclk.set_low();
            if value & 1 != 0 {
                self.swdio.set_high();
                parity.count_one();
            } else {
                self.swdio.set_low();
            }
            value >>= 1;
            self.clock_wait();
            self.swclk.set_high();
            self.clock_wait();
        }
        self.swclk.set_low();
    }

    fn shift_in(&mut self, parity: &mut Parity, count: u8) -> u8 {
        self.swdio.release();
        let mut value = 0u8;
        for _ in 0..count {
            value >>= 1;
            self.swclk.set_low();
            self.clock_wait();
            if self.swdio.is_high() {
                value |= 0x80;
                parity.count_one();
            }
            self.swclk.set_high();
            self.clock_wait();
        }
        self.swclk.set_low();
        value
    }

    fn pin_levels(&mut self) -> SwjPins {
        let mut pins = SwjPins::empty();
        pins.set(SwjPins::TCK_SWDCLK, self.swclk.is_high());
        pins.set(SwjPins::TMS_SWDIO, self.swdio.is_high());
        pins.set(SwjPins::N_RESET, self.nreset.is_high());
        pins
    }

    fn drive_reset(&mut self, high: bool) {
        self.nreset.enable_output();
        if high {
            self.nreset.set_high();
        } else {
            self.nreset.set_low();
        }
    }
}

/// `SwdLine` over an embedded-hal pin that changes type with its direction.
pub struct IoPinLine<I, O>
where
    I: InputPin + IoPin<I, O>,
    O: OutputPin + IoPin<I, O>,
{
    pin_in: Option<I>,
    pin_out: Option<O>,
    level: bool,
}

impl<I, O> IoPinLine<I, O>
where
    I: InputPin + IoPin<I, O>,
    O: OutputPin + IoPin<I, O>,
{
    pub fn new(pin: I) -> Self {
        Self {
            pin_in: Some(pin),
            pin_out: None,
            level: false,
        }
    }
}

impl<I, O> SwdLine for IoPinLine<I, O>
where
    I: InputPin + IoPin<I, O>,
    O: OutputPin + IoPin<I, O>,
{
    fn set_low(&mut self) {
        self.level = false;
        if let Some(p) = self.pin_out.as_mut() {
            p.set_low().ok();
        }
    }
    fn set_high(&mut self) {
        self.level = true;
        if let Some(p) = self.pin_out.as_mut() {
            p.set_high().ok();
        }
    }
    fn enable_output(&mut self) {
        if let Some(pin_in) = self.pin_in.take() {
            let state = if self.level {
                PinState::High
            } else {
                PinState::Low
            };
            self.pin_out = Some(
                pin_in
                    .into_output_pin(state)
                    .unwrap_or_else(|_| panic!("Failed to turn pin to output.")),
            );
        }
    }
    fn release(&mut self) {
        if let Some(pin_out) = self.pin_out.take() {
            self.pin_in = Some(
                pin_out
                    .into_input_pin()
                    .unwrap_or_else(|_| panic!("Failed to turn pin to input.")),
            );
        }
    }
    fn is_high(&mut self) -> bool {
        match self.pin_in.as_ref() {
            Some(p) => p.is_high().unwrap_or(false),
            // Output pins report the level they drive.
            None => self.level,
        }
    }
}
