// Copyright 2021 Kenta Ida
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

//! Bit-level SWD target used by the unit tests.
//!
//! It decodes every packet header the host clocks out, answers with a
//! scripted ACK and models posted AP reads: an AP read returns the value
//! latched by the previous AP read, and RDBUFF returns the latched value.

use crate::bitbang::{LineDriver, Parity, SwjPins};
use crate::cmsis_dap::DAP_TRANSFER_OK;
use std::collections::VecDeque;
use std::vec::Vec;

enum State {
    Idle,
    Request { bits: u8, count: u8 },
    WriteData { request: u8, value: u64, count: u8 },
}

pub struct SimTarget {
    pub dp: [u32; 4],
    pub ap: [u32; 4],
    /// Every well-formed packet header seen, in order.
    pub wire_log: Vec<u8>,
    pub ap_writes: Vec<(u8, u32)>,
    pub bad_requests: usize,
    pub write_parity_errors: usize,
    /// Bits sampled by the host, including turnaround and flush cycles.
    pub sampled_cycles: usize,
    pub corrupt_next_read_parity: bool,
    pub connected: bool,
    pub reset_level: Option<bool>,
    /// Every bit the host drove.
    pub driven: Vec<bool>,
    acks: VecDeque<u8>,
    to_host: VecDeque<bool>,
    posted: u32,
    state: State,
}

impl SimTarget {
    pub fn new() -> Self {
        Self {
            dp: [0; 4],
            ap: [0; 4],
            wire_log: Vec::new(),
            ap_writes: Vec::new(),
            bad_requests: 0,
            write_parity_errors: 0,
            sampled_cycles: 0,
            corrupt_next_read_parity: false,
            connected: false,
            reset_level: None,
            driven: Vec::new(),
            acks: VecDeque::new(),
            to_host: VecDeque::new(),
            posted: 0,
            state: State::Idle,
        }
    }

    /// ACKs for the next packet headers. Unscripted headers get OK.
    pub fn script_acks(&mut self, acks: &[u8]) {
        self.acks.extend(acks.iter().copied());
    }

    fn push_bits(&mut self, value: u64, count: u8) {
        for index in 0..count {
            self.to_host.push_back((value >> index) & 1 != 0);
        }
    }

    fn clock_in(&mut self, bit: bool) {
        self.driven.push(bit);
        self.state = match core::mem::replace(&mut self.state, State::Idle) {
            State::Idle if bit => State::Request { bits: 1, count: 1 },
            State::Idle => State::Idle,
            State::Request { mut bits, count } => {
                if bit {
                    bits |= 1 << count;
                }
                if count + 1 == 8 {
                    self.handle_request(bits)
                } else {
                    State::Request {
                        bits,
                        count: count + 1,
                    }
                }
            }
            State::WriteData {
                request,
                mut value,
                count,
            } => {
                if bit {
                    value |= 1 << count;
                }
                if count + 1 == 33 {
                    self.complete_write(request, value);
                    State::Idle
                } else {
                    State::WriteData {
                        request,
                        value,
                        count: count + 1,
                    }
                }
            }
        };
    }

    fn handle_request(&mut self, request: u8) -> State {
        let nibble = (request >> 1) & 0x0f;
        let parity = (request >> 5) & 1;
        let well_formed = request & 0xc1 == 0x81 && (nibble.count_ones() as u8 & 1) == parity;
        if !well_formed {
            // A real target stays silent on a malformed header.
            self.bad_requests += 1;
            return State::Idle;
        }
        self.wire_log.push(request);

        let ack = self.acks.pop_front().unwrap_or(DAP_TRANSFER_OK);
        // turnaround, then the ACK
        self.push_bits(0, 1);
        self.push_bits(ack as u64, 3);
        if ack != DAP_TRANSFER_OK {
            return State::Idle;
        }

        let is_ap = nibble & 0x01 != 0;
        let is_read = nibble & 0x02 != 0;
        let address = (nibble >> 2) as usize;
        if is_read {
            let value = if is_ap {
                core::mem::replace(&mut self.posted, self.ap[address])
            } else if address == 3 {
                self.posted
            } else {
                self.dp[address]
            };
            let mut parity = value.count_ones() as u64 & 1;
            if self.corrupt_next_read_parity {
                self.corrupt_next_read_parity = false;
                parity ^= 1;
            }
            self.push_bits(value as u64 | (parity << 32), 33);
            self.push_bits(0, 1);
            State::Idle
        } else {
            self.push_bits(0, 1);
            State::WriteData {
                request: nibble,
                value: 0,
                count: 0,
            }
        }
    }

    fn complete_write(&mut self, nibble: u8, value: u64) {
        let data = value as u32;
        if (data.count_ones() as u64 & 1) != (value >> 32) & 1 {
            self.write_parity_errors += 1;
            return;
        }
        let address = (nibble >> 2) as usize;
        if nibble & 0x01 != 0 {
            self.ap[address] = data;
            self.ap_writes.push((address as u8, data));
        } else {
            self.dp[address] = data;
        }
    }
}

impl LineDriver for SimTarget {
    fn connect(&mut self) {
        self.connected = true;
        self.reset_level = Some(true);
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn shift_out(&mut self, parity: &mut Parity, data: u8, count: u8) {
        for index in 0..count.min(8) {
            let bit = (data >> index) & 1 != 0;
            if bit {
                parity.count_one();
            }
            self.clock_in(bit);
        }
    }

    fn shift_in(&mut self, parity: &mut Parity, count: u8) -> u8 {
        let mut value = 0u8;
        for _ in 0..count {
            value >>= 1;
            self.sampled_cycles += 1;
            if self.to_host.pop_front().unwrap_or(false) {
                value |= 0x80;
                parity.count_one();
            }
        }
        value
    }

    fn pin_levels(&mut self) -> SwjPins {
        let mut pins = SwjPins::TMS_SWDIO;
        pins.set(SwjPins::N_RESET, self.reset_level.unwrap_or(true));
        pins
    }

    fn drive_reset(&mut self, high: bool) {
        self.reset_level = Some(high);
    }
}
