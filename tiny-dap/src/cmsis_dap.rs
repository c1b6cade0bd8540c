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

use crate::bitbang::{LineDriver, SwjIo, SwjPins};
use crate::cursor::{BufferCursor, CursorError, CursorWrite};
use crate::transfer::{self, TransferMode};
use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive, TryFromPrimitiveError};
use usb_device::UsbError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DapCommandId {
    Info = 0x00,
    HostStatus = 0x01,
    Connect = 0x02,
    Disconnect = 0x03,
    TransferConfigure = 0x04,
    Transfer = 0x05,
    TransferBlock = 0x06,
    WriteAbort = 0x08,
    SWJPins = 0x10,
    SWJClock = 0x11,
    SWJSequence = 0x12,
    SWDConfigure = 0x13,
    JTAGSequence = 0x14,
    JTAGConfigure = 0x15,
    JTAGIdcode = 0x16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DapInfoId {
    Vendor = 0x01,
    Product = 0x02,
    SerialNumber = 0x03,
    CmsisDapVer = 0x04,
    Capabilities = 0xf0,
    PacketCount = 0xfe,
    PacketSize = 0xff,
}

bitflags! {
    pub struct DapCapabilities: u8 {
        const SWD = 0b0000_0001;
        const JTAG = 0b0000_0010;
        const SWO_UART = 0b0000_0100;
        const SWO_MANCHESTER = 0b0000_1000;
        const ATOMIC_COMMANDS = 0b0001_0000;
        const TEST_DOMAIN_TIMER = 0b0010_0000;
        const SWO_STREAMING_TRACE = 0b0100_0000;
        const UART_COMMUNICATION_PORT = 0b1000_0000;
    }
}

/// Only SWD is implemented at the bit level.
pub const CAPABILITIES: DapCapabilities = DapCapabilities::SWD;

pub const DAP_OK: u8 = 0x00;
pub const DAP_ERROR: u8 = 0xff;

pub const DAP_TRANSFER_OK: u8 = 0x01;
pub const DAP_TRANSFER_WAIT: u8 = 0x02;
pub const DAP_TRANSFER_FAULT: u8 = 0x04;
pub const DAP_TRANSFER_ERROR: u8 = 0x08;
pub const DAP_TRANSFER_MISMATCH: u8 = 0x10;

pub const DAP_PORT_AUTODETECT: u8 = 0x00;
pub const DAP_PORT_SWD: u8 = 0x01;
pub const DAP_PORT_DISABLED: u8 = 0x00;

/// Command ids a board may claim through `VendorCommand`.
pub const DAP_VENDOR_COMMANDS: core::ops::RangeInclusive<u8> = 0x80..=0x9f;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DapError {
    InvalidCommand,
    InvalidDapInfoId,
    NotEnoughData,
    InsufficientBuffer,
    InternalError,
}

impl From<TryFromPrimitiveError<DapCommandId>> for DapError {
    fn from(_: TryFromPrimitiveError<DapCommandId>) -> Self {
        Self::InvalidCommand
    }
}
impl From<TryFromPrimitiveError<DapInfoId>> for DapError {
    fn from(_: TryFromPrimitiveError<DapInfoId>) -> Self {
        Self::InvalidDapInfoId
    }
}
impl From<CursorError> for DapError {
    fn from(error: CursorError) -> Self {
        match error {
            CursorError::InsufficientBuffer => Self::InsufficientBuffer,
            CursorError::NotEnoughData => Self::NotEnoughData,
        }
    }
}
impl From<UsbError> for DapError {
    fn from(_: UsbError) -> Self {
        Self::InternalError
    }
}

pub(crate) struct PacketSize<const PACKET_SIZE: usize>;

impl<const PACKET_SIZE: usize> PacketSize<PACKET_SIZE> {
    /// A response needs the command byte and a status byte, and the HID
    /// report count is a single byte.
    pub(crate) const CHECK: () = assert!(
        PACKET_SIZE >= 2 && PACKET_SIZE <= 255,
        "PACKET_SIZE must be within 2..=255"
    );
}

/// Values reported through DAP_Info.
#[derive(Debug, Clone, Copy)]
pub struct DapConfig {
    pub packet_count: u8,
    pub vendor: Option<&'static str>,
    pub product: Option<&'static str>,
    pub serial_number: Option<&'static str>,
    pub firmware_version: Option<&'static str>,
}

impl Default for DapConfig {
    fn default() -> Self {
        Self {
            packet_count: 1,
            vendor: None,
            product: None,
            serial_number: None,
            firmware_version: None,
        }
    }
}

/// Hook for the vendor command range 0x80..=0x9F.
pub trait VendorCommand {
    /// `request` starts after the command byte, `response` after the echoed
    /// command byte. Returns the number of response bytes written.
    fn vendor_command(
        &mut self,
        command: u8,
        request: &[u8],
        response: &mut [u8],
    ) -> Result<usize, DapError> {
        let _ = (command, request, response);
        Err(DapError::InvalidCommand)
    }
}

/// Answers every vendor command with DAP_ERROR.
pub struct NoVendorCommands;

impl VendorCommand for NoVendorCommands {}

fn write_status(response: &mut [u8], status: u8) -> Result<usize, DapError> {
    let mut writer = BufferCursor::new(response);
    writer.write_u8(status)?;
    Ok(writer.get_position())
}

fn write_info_string(
    writer: &mut BufferCursor<&mut [u8]>,
    value: Option<&str>,
) -> Result<(), CursorError> {
    if let Some(value) = value {
        writer.write(value.as_bytes())?;
        writer.write_u8(0)?;
    }
    Ok(())
}

/// The command dispatcher.
///
/// Holds the line driver and the DAP_Info answers; nothing else survives
/// from one packet to the next.
pub struct CmsisDap<Io, Vendor, const PACKET_SIZE: usize> {
    io: Io,
    vendor: Vendor,
    config: DapConfig,
}

impl<Io, const PACKET_SIZE: usize> CmsisDap<Io, NoVendorCommands, PACKET_SIZE>
where
    Io: LineDriver,
{
    pub fn new(io: Io, config: DapConfig) -> Self {
        Self::with_vendor_commands(io, NoVendorCommands, config)
    }
}

impl<Io, Vendor, const PACKET_SIZE: usize> CmsisDap<Io, Vendor, PACKET_SIZE>
where
    Io: LineDriver,
    Vendor: VendorCommand,
{
    pub fn with_vendor_commands(io: Io, vendor: Vendor, config: DapConfig) -> Self {
        let () = PacketSize::<PACKET_SIZE>::CHECK;
        Self { io, vendor, config }
    }

    pub fn io(&self) -> &Io {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut Io {
        &mut self.io
    }

    pub fn release(self) -> (Io, Vendor) {
        (self.io, self.vendor)
    }

    /// Processes the command in `packet` and writes the response over it.
    /// Byte 0 keeps the command id. Returns the number of meaningful
    /// response bytes; the rest of the packet is left as it was.
    pub fn process_packet(&mut self, packet: &mut [u8; PACKET_SIZE]) -> usize {
        let request = *packet;
        let command = request[0];
        match self.dispatch(command, &request[1..], &mut packet[1..]) {
            Ok(length) => 1 + length,
            Err(error) => {
                warn!("command {=u8:#x} failed: {}", command, error);
                packet[1] = DAP_ERROR;
                2
            }
        }
    }

    fn dispatch(
        &mut self,
        command: u8,
        request: &[u8],
        response: &mut [u8],
    ) -> Result<usize, DapError> {
        if DAP_VENDOR_COMMANDS.contains(&command) {
            return self.vendor.vendor_command(command, request, response);
        }
        match DapCommandId::try_from_primitive(command)? {
            DapCommandId::Info => self.dap_info(request, response),
            DapCommandId::Connect => self.dap_connect(request, response),
            DapCommandId::Disconnect => self.dap_disconnect(response),
            DapCommandId::Transfer => self.transfer(TransferMode::Transfer, request, response),
            DapCommandId::TransferBlock => {
                self.transfer(TransferMode::TransferBlock, request, response)
            }
            DapCommandId::WriteAbort => self.transfer(TransferMode::WriteAbort, request, response),
            DapCommandId::SWJPins => self.swj_pins(request, response),
            DapCommandId::SWJSequence => {
                self.io.swj_sequence(request)?;
                write_status(response, DAP_OK)
            }
            DapCommandId::JTAGSequence => self.jtag_sequence(request, response),
            // Timing, turnaround and LED settings are fixed; accept them so hosts can attach.
            DapCommandId::HostStatus
            | DapCommandId::TransferConfigure
            | DapCommandId::SWJClock
            | DapCommandId::SWDConfigure => {
                debug!("command {=u8:#x} acknowledged without effect", command);
                write_status(response, DAP_OK)
            }
            DapCommandId::JTAGConfigure | DapCommandId::JTAGIdcode => {
                Err(DapError::InvalidCommand)
            }
        }
    }

    fn dap_info(&self, request: &[u8], response: &mut [u8]) -> Result<usize, DapError> {
        let &id = request.first().ok_or(DapError::NotEnoughData)?;
        let (length, body) = response
            .split_first_mut()
            .ok_or(DapError::InsufficientBuffer)?;
        let mut writer = BufferCursor::new(body);
        match self.write_info(id, &mut writer) {
            Ok(()) => {}
            Err(DapError::InvalidDapInfoId) => {
                debug!("unknown info id {=u8:#x}", id);
            }
            Err(error) => return Err(error),
        }
        *length = writer.get_position() as u8;
        Ok(1 + writer.get_position())
    }

    fn write_info(&self, id: u8, writer: &mut BufferCursor<&mut [u8]>) -> Result<(), DapError> {
        match DapInfoId::try_from_primitive(id)? {
            DapInfoId::Vendor => write_info_string(writer, self.config.vendor)?,
            DapInfoId::Product => write_info_string(writer, self.config.product)?,
            DapInfoId::SerialNumber => write_info_string(writer, self.config.serial_number)?,
            DapInfoId::CmsisDapVer => write_info_string(writer, self.config.firmware_version)?,
            DapInfoId::Capabilities => writer.write_u8(CAPABILITIES.bits())?,
            DapInfoId::PacketCount => writer.write_u8(self.config.packet_count)?,
            DapInfoId::PacketSize => writer.write(&(PACKET_SIZE as u16).to_le_bytes())?,
        }
        Ok(())
    }

    fn dap_connect(&mut self, request: &[u8], response: &mut [u8]) -> Result<usize, DapError> {
        let &port = request.first().ok_or(DapError::NotEnoughData)?;
        let status = match port {
            DAP_PORT_AUTODETECT | DAP_PORT_SWD => {
                debug!("connect swd");
                self.io.connect();
                DAP_PORT_SWD
            }
            _ => {
                debug!("connect: port {=u8} not supported", port);
                DAP_PORT_DISABLED
            }
        };
        write_status(response, status)
    }

    fn dap_disconnect(&mut self, response: &mut [u8]) -> Result<usize, DapError> {
        debug!("disconnect");
        self.io.disconnect();
        write_status(response, DAP_OK)
    }

    fn transfer(
        &mut self,
        mode: TransferMode,
        request: &[u8],
        response: &mut [u8],
    ) -> Result<usize, DapError> {
        // The DAP index is meaningless for SWD.
        let request = request.get(1..).ok_or(DapError::NotEnoughData)?;
        transfer::execute(&mut self.io, mode, request, response)
    }

    fn swj_pins(&mut self, request: &[u8], response: &mut [u8]) -> Result<usize, DapError> {
        // The trailing pin wait time is ignored; only nRESET is ever driven.
        let (pin_output, pin_select) = match request {
            [output, select, ..] => (
                SwjPins::from_bits_truncate(*output),
                SwjPins::from_bits_truncate(*select),
            ),
            _ => return Err(DapError::NotEnoughData),
        };
        let levels = self.io.swj_pins(pin_output, pin_select);
        write_status(response, levels.bits())
    }

    #[cfg(feature = "jtag-sequence")]
    fn jtag_sequence(&mut self, request: &[u8], response: &mut [u8]) -> Result<usize, DapError> {
        self.io.jtag_sequence(request)?;
        write_status(response, DAP_OK)
    }

    #[cfg(not(feature = "jtag-sequence"))]
    fn jtag_sequence(&mut self, _request: &[u8], _response: &mut [u8]) -> Result<usize, DapError> {
        Err(DapError::InvalidCommand)
    }
}
