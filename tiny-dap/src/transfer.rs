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

//! DAP_Transfer, DAP_TransferBlock and DAP_WriteABORT.
//!
//! The three commands share one state machine. Every phase of an SWD
//! transaction is a `Phase`, and the transition out of it depends only on
//! the ACK just read and on the pipeline and fault flags, so the retry cap,
//! the fault abort and the RDBUFF morph can each be exercised on their own.

#![allow(non_upper_case_globals)]

use crate::bitbang::{LineDriver, Parity};
use crate::cmsis_dap::{
    DapError, DAP_OK, DAP_TRANSFER_ERROR, DAP_TRANSFER_FAULT, DAP_TRANSFER_MISMATCH,
    DAP_TRANSFER_OK, DAP_TRANSFER_WAIT,
};
use crate::cursor::{BufferCursor, CursorRead, CursorWrite};
use bitflags::bitflags;

bitflags! {
    /// The host's "Transfer Request" byte.
    pub struct TransferRequest: u8 {
        const APnDP = 0b0000_0001;
        const RnW = 0b0000_0010;
        const A2 = 0b0000_0100;
        const A3 = 0b0000_1000;
        const TRANSFER_MATCH_VALUE = 0b0001_0000;
        const TRANSFER_MATCH_MASK = 0b0010_0000;
        const WIRE_BITS = Self::APnDP.bits | Self::RnW.bits | Self::A2.bits | Self::A3.bits;
        const STAGING_BITS = Self::RnW.bits | Self::TRANSFER_MATCH_VALUE.bits | Self::TRANSFER_MATCH_MASK.bits;
    }
}

bitflags! {
    struct TransferFlags: u8 {
        const TRANSFER_BLOCK = 0x01;
        const PIPELINED_AP_READ = 0x02;
        const OMIT_REQUEST_DECODE = 0x04;
        const BUS_FAULT = 0x08;
        const WRITE_ABORT = 0x10;
    }
}

/// The 8-bit packet header clocked onto SWDIO:
/// start, APnDP, RnW, A2, A3, parity, stop, park.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WireRequest(u8);

impl WireRequest {
    const START: u8 = 0x01;
    const PARITY: u8 = 0x20;
    const PARK: u8 = 0x80;

    /// Write DP ABORT.
    pub const WRITE_ABORT: Self = Self(0x81);
    /// Read AP register 3 (0x0C).
    pub const READ_AP_3: Self = Self(0x9f);
    /// Read DP RDBUFF.
    pub const READ_RDBUFF: Self = Self(0xbd);

    pub fn new(request: TransferRequest) -> Self {
        let nibble = (request & TransferRequest::WIRE_BITS).bits();
        let parity = if nibble.count_ones() & 1 != 0 {
            Self::PARITY
        } else {
            0
        };
        Self(Self::START | Self::PARK | parity | (nibble << 1))
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferMode {
    Transfer,
    TransferBlock,
    WriteAbort,
}

impl TransferMode {
    /// Count and status bytes that precede the read data.
    fn header_len(self) -> usize {
        match self {
            TransferMode::Transfer => 2,
            TransferMode::TransferBlock => 3,
            TransferMode::WriteAbort => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferOutcome {
    /// Transactions that finished with an OK ACK.
    pub completed: u16,
    /// ACK of the last transaction, plus any parity or mismatch bit raised
    /// along the way.
    pub ack: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    DecodeRequest,
    SendRequest,
    AwaitAck,
    WaitRetry,
    DataPhase,
    Finalize,
    Done,
}

pub const MAX_WAIT_RETRIES: u8 = 8;
const IDLE_CYCLES: u8 = 8;
const BUS_FLUSH_CYCLES: u8 = 100;

/// State of one DAP_Transfer / DAP_TransferBlock / DAP_WriteABORT command.
///
/// Created per command and dropped with it; nothing survives to the next packet.
pub struct TransferEngine<'a, Io: LineDriver> {
    io: &'a mut Io,
    flags: TransferFlags,
    parity: Parity,
    retry_count: u8,
    remaining: u16,
    completed: u16,
    request: TransferRequest,
    wire_request: WireRequest,
    ack: u8,
    error_bits: u8,
    read_data: Option<[u8; 4]>,
    match_value: [u8; 4],
    match_mask: [u8; 4],
}

impl<'a, Io: LineDriver> TransferEngine<'a, Io> {
    pub fn new(io: &'a mut Io, mode: TransferMode) -> Self {
        let flags = match mode {
            TransferMode::Transfer => TransferFlags::empty(),
            TransferMode::TransferBlock => TransferFlags::TRANSFER_BLOCK,
            TransferMode::WriteAbort => {
                TransferFlags::WRITE_ABORT | TransferFlags::OMIT_REQUEST_DECODE
            }
        };
        Self {
            io,
            flags,
            parity: Parity::default(),
            retry_count: 0,
            remaining: 0,
            completed: 0,
            request: TransferRequest::empty(),
            wire_request: WireRequest::WRITE_ABORT,
            ack: 0,
            error_bits: 0,
            read_data: None,
            match_value: [0; 4],
            match_mask: [0xff; 4],
        }
    }

    /// Runs every transaction in `request` (positioned at the transfer count,
    /// or at the data word for DAP_WriteABORT) and appends read data to `response`.
    pub fn run(
        &mut self,
        request: &mut BufferCursor<&[u8]>,
        response: &mut BufferCursor<&mut [u8]>,
    ) -> TransferOutcome {
        let count = if self.flags.contains(TransferFlags::WRITE_ABORT) {
            Ok(1)
        } else if self.flags.contains(TransferFlags::TRANSFER_BLOCK) {
            request.read_u16()
        } else {
            request.read_u8().map(u16::from)
        };
        let mut phase = match count {
            Ok(0) => Phase::Done,
            Ok(count) => {
                self.remaining = count;
                Phase::DecodeRequest
            }
            Err(_) => self.truncated(),
        };

        while phase != Phase::Done {
            phase = match phase {
                Phase::DecodeRequest => self.decode_request(request, response),
                Phase::SendRequest => self.send_request(),
                Phase::AwaitAck => self.await_ack(),
                Phase::WaitRetry => self.wait_retry(),
                Phase::DataPhase => self.data_phase(request),
                Phase::Finalize => self.finalize(response),
                Phase::Done => Phase::Done,
            };
        }

        TransferOutcome {
            completed: self.completed,
            ack: self.ack | self.error_bits,
        }
    }

    fn truncated(&mut self) -> Phase {
        warn!("transfer: request or response exhausted");
        self.ack = DAP_TRANSFER_ERROR;
        Phase::Done
    }

    fn decode_request(
        &mut self,
        request: &mut BufferCursor<&[u8]>,
        response: &BufferCursor<&mut [u8]>,
    ) -> Phase {
        self.retry_count = 0;
        self.read_data = None;

        if !self.flags.contains(TransferFlags::OMIT_REQUEST_DECODE) {
            let mut transfer_request = match request.read_u8() {
                Ok(byte) => TransferRequest::from_bits_truncate(byte),
                Err(_) => return self.truncated(),
            };
            if self.flags.contains(TransferFlags::TRANSFER_BLOCK) {
                transfer_request &= TransferRequest::WIRE_BITS;
            }
            self.request = transfer_request;

            // Match value / match mask words only stage data for later reads.
            let staging = transfer_request & TransferRequest::STAGING_BITS;
            let is_match_value =
                staging == TransferRequest::RnW | TransferRequest::TRANSFER_MATCH_VALUE;
            let is_match_mask = staging == TransferRequest::TRANSFER_MATCH_MASK;
            if is_match_value || is_match_mask {
                let mut value = [0u8; 4];
                if request.read(&mut value).is_err() {
                    return self.truncated();
                }
                if is_match_value {
                    self.match_value = value;
                } else {
                    self.match_mask = value;
                }
                self.ack = DAP_TRANSFER_OK;
                return Phase::Finalize;
            }

            // AP reads are posted: the value arrives with the next request.
            if transfer_request.contains(TransferRequest::APnDP | TransferRequest::RnW) {
                self.flags.insert(TransferFlags::PIPELINED_AP_READ);
            }
            self.wire_request = WireRequest::new(transfer_request);

            if self.flags.contains(TransferFlags::TRANSFER_BLOCK) {
                self.flags.insert(TransferFlags::OMIT_REQUEST_DECODE);
            }
        }

        let room = if self.request.contains(TransferRequest::RnW) {
            response.remaining()
        } else {
            request.remaining()
        };
        if room < 4 {
            return self.truncated();
        }
        Phase::SendRequest
    }

    fn send_request(&mut self) -> Phase {
        trace!("swd request {=u8:#x}", self.wire_request.bits());
        self.io
            .shift_out(&mut self.parity, self.wire_request.bits(), 8);
        Phase::AwaitAck
    }

    fn await_ack(&mut self) -> Phase {
        // one turnaround cycle, then three ACK bits
        let value = self.io.shift_in(&mut self.parity, 4);
        self.ack = (value >> 5) & 0b111;
        match self.ack {
            DAP_TRANSFER_OK => Phase::DataPhase,
            DAP_TRANSFER_WAIT => Phase::WaitRetry,
            ack => {
                warn!("swd ack {=u8:#x}, treating as FAULT", ack);
                self.flags.insert(TransferFlags::BUS_FAULT);
                self.ack = DAP_TRANSFER_FAULT;
                Phase::Finalize
            }
        }
    }

    fn wait_retry(&mut self) -> Phase {
        self.retry_count += 1;
        self.io.shift_in(&mut self.parity, 1);
        if self.retry_count < MAX_WAIT_RETRIES {
            Phase::SendRequest
        } else {
            warn!("swd WAIT retries exhausted");
            Phase::Finalize
        }
    }

    fn data_phase(&mut self, request: &mut BufferCursor<&[u8]>) -> Phase {
        if self.request.contains(TransferRequest::RnW) {
            self.parity.reset();
            let mut data = [0u8; 4];
            for byte in data.iter_mut() {
                *byte = self.io.shift_in(&mut self.parity, 8);
            }
            self.io.shift_in(&mut self.parity, 1);
            if self.parity.is_odd() {
                debug!("swd read parity error");
                self.error_bits |= DAP_TRANSFER_ERROR;
            }
            self.io.shift_in(&mut self.parity, 1);

            if self
                .request
                .contains(TransferRequest::TRANSFER_MATCH_VALUE)
            {
                let mismatch = data
                    .iter()
                    .zip(self.match_mask.iter())
                    .zip(self.match_value.iter())
                    .any(|((data, mask), value)| *value != data & mask);
                if mismatch {
                    self.error_bits |= DAP_TRANSFER_MISMATCH;
                }
            }
            self.read_data = Some(data);
        } else {
            self.io.shift_in(&mut self.parity, 1);
            let mut data = [0u8; 4];
            // Availability was checked before the request went out.
            request.read(&mut data).ok();
            self.parity.reset();
            for byte in data {
                self.io.shift_out(&mut self.parity, byte, 8);
            }
            let parity_bit = self.parity.bit();
            self.io.shift_out(&mut self.parity, parity_bit, 1);
        }

        self.io.shift_out(&mut self.parity, 0x00, IDLE_CYCLES);

        let pipelined = self.flags.contains(TransferFlags::PIPELINED_AP_READ);
        let block = self.flags.contains(TransferFlags::TRANSFER_BLOCK);
        if self.wire_request == WireRequest::READ_AP_3
            && ((!block && pipelined)
                || (block && self.remaining == 1 && pipelined)
                || (block && self.remaining == 2 && !pipelined))
        {
            self.wire_request = WireRequest::READ_RDBUFF;
        }

        if pipelined {
            // Issue again to collect the value the AP just queued.
            self.flags.remove(TransferFlags::PIPELINED_AP_READ);
            Phase::SendRequest
        } else {
            Phase::Finalize
        }
    }

    fn finalize(&mut self, response: &mut BufferCursor<&mut [u8]>) -> Phase {
        let wire_ok = self.ack == DAP_TRANSFER_OK;
        if wire_ok {
            self.completed += 1;
            if let Some(data) = self.read_data.take() {
                // Space was checked before the request went out.
                response.write(&data).ok();
            }
        }
        self.remaining -= 1;

        if self.flags.contains(TransferFlags::WRITE_ABORT) {
            return Phase::Done;
        }
        if self.flags.contains(TransferFlags::BUS_FAULT) {
            self.io.shift_in(&mut self.parity, BUS_FLUSH_CYCLES);
            return Phase::Done;
        }
        if !wire_ok || self.remaining == 0 {
            return Phase::Done;
        }
        Phase::DecodeRequest
    }
}

/// Executes one transfer command. `request` starts right after the DAP index
/// byte and `response` right after the echoed command byte. Returns the
/// number of response bytes written.
pub fn execute<Io: LineDriver>(
    io: &mut Io,
    mode: TransferMode,
    request: &[u8],
    response: &mut [u8],
) -> Result<usize, DapError> {
    let header_len = mode.header_len();
    if response.len() < header_len {
        return Err(DapError::InsufficientBuffer);
    }
    let (header, body) = response.split_at_mut(header_len);
    let mut request = BufferCursor::new(request);
    let mut data = BufferCursor::new(body);

    let outcome = TransferEngine::new(io, mode).run(&mut request, &mut data);
    match mode {
        TransferMode::Transfer => {
            header[0] = outcome.completed as u8;
            header[1] = outcome.ack;
        }
        TransferMode::TransferBlock => {
            header[..2].copy_from_slice(&outcome.completed.to_le_bytes());
            header[2] = outcome.ack;
        }
        TransferMode::WriteAbort => {
            header[0] = DAP_OK;
        }
    }
    Ok(header_len + data.get_position())
}
