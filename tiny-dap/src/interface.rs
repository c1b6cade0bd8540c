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

use crate::bitbang::LineDriver;
use crate::cmsis_dap::{CmsisDap, DapError, PacketSize, VendorCommand};
use usb_device::class_prelude::*;
use usb_device::control::{Recipient, Request, RequestType};
use usb_device::device::DEFAULT_ALTERNATE_SETTING;
use usb_device::Result;

const USB_IF_CLASS_HID: u8 = 0x03;
const USB_IF_SUBCLASS_NONE: u8 = 0x00;
const USB_IF_PROTOCOL_NONE: u8 = 0x00;

const HID_DESC_TYPE_HID: u8 = 0x21;
const HID_DESC_TYPE_REPORT: u8 = 0x22;
const HID_REQ_SET_IDLE: u8 = 0x0a;
const HID_REQ_SET_REPORT: u8 = 0x09;

const HID_POLL_INTERVAL_MS: u8 = 1;
const REPORT_DESCRIPTOR_LEN: usize = 33;

/// Vendor-defined HID report descriptor with one `packet_size`-byte input
/// report, one output report of the same size and a one-byte feature report.
pub const fn report_descriptor(packet_size: u8) -> [u8; REPORT_DESCRIPTOR_LEN] {
    [
        0x06, 0x00, 0xff, // Usage Page (Vendor Defined 0xFF00)
        0x09, 0x01, // Usage (0x01)
        0xa1, 0x01, // Collection (Application)
        0x15, 0x00, //   Logical Minimum (0)
        0x26, 0xff, 0x00, //   Logical Maximum (255)
        0x75, 0x08, //   Report Size (8)
        0x95, packet_size, //   Report Count
        0x09, 0x01, //   Usage (0x01)
        0x81, 0x02, //   Input (Data,Var,Abs)
        0x95, packet_size, //   Report Count
        0x09, 0x01, //   Usage (0x01)
        0x91, 0x02, //   Output (Data,Var,Abs)
        0x95, 0x01, //   Report Count (1)
        0x09, 0x01, //   Usage (0x01)
        0xb1, 0x02, //   Feature (Data,Var,Abs)
        0xc0, // End Collection
    ]
}

/// One vendor HID interface with an interrupt endpoint pair.
pub struct HidDapInterface<'a, B: UsbBus, const PACKET_SIZE: usize> {
    interface: InterfaceNumber,
    name_string: StringIndex,
    out_ep: EndpointOut<'a, B>,
    in_ep: EndpointIn<'a, B>,
    report_descriptor: [u8; REPORT_DESCRIPTOR_LEN],
}

impl<B: UsbBus, const PACKET_SIZE: usize> HidDapInterface<'_, B, PACKET_SIZE> {
    pub fn new(alloc: &UsbBusAllocator<B>) -> HidDapInterface<'_, B, PACKET_SIZE> {
        let () = PacketSize::<PACKET_SIZE>::CHECK;
        HidDapInterface {
            interface: alloc.interface(),
            name_string: alloc.string(),
            out_ep: alloc.interrupt(PACKET_SIZE as u16, HID_POLL_INTERVAL_MS),
            in_ep: alloc.interrupt(PACKET_SIZE as u16, HID_POLL_INTERVAL_MS),
            report_descriptor: report_descriptor(PACKET_SIZE as u8),
        }
    }

    pub fn write_packet(&mut self, data: &[u8]) -> Result<usize> {
        self.in_ep.write(data)
    }
    pub fn read_packet(&mut self, data: &mut [u8]) -> Result<usize> {
        self.out_ep.read(data)
    }

    pub(crate) fn in_ep_address(&self) -> EndpointAddress {
        self.in_ep.address()
    }
    pub(crate) fn out_ep_address(&self) -> EndpointAddress {
        self.out_ep.address()
    }

    fn hid_descriptor(&self) -> [u8; 7] {
        let length = (REPORT_DESCRIPTOR_LEN as u16).to_le_bytes();
        [
            0x11, 0x01, // bcdHID 1.11
            0x00, // bCountryCode
            0x01, // bNumDescriptors
            HID_DESC_TYPE_REPORT,
            length[0],
            length[1],
        ]
    }

    fn is_for_interface(&self, request: &Request) -> bool {
        request.recipient == Recipient::Interface
            && request.index == u8::from(self.interface) as u16
    }
}

impl<B: UsbBus, const PACKET_SIZE: usize> UsbClass<B> for HidDapInterface<'_, B, PACKET_SIZE> {
    fn get_configuration_descriptors(&self, writer: &mut DescriptorWriter) -> Result<()> {
        writer.interface_alt(
            self.interface,
            DEFAULT_ALTERNATE_SETTING,
            USB_IF_CLASS_HID,
            USB_IF_SUBCLASS_NONE,
            USB_IF_PROTOCOL_NONE,
            Some(self.name_string),
        )?;
        writer.write(HID_DESC_TYPE_HID, &self.hid_descriptor())?;
        writer.endpoint(&self.in_ep)?;
        writer.endpoint(&self.out_ep)?;

        Ok(())
    }

    fn get_string(&self, index: StringIndex, lang_id: u16) -> Option<&str> {
        let _ = lang_id;
        if index == self.name_string {
            // Hosts find the probe by this substring in the interface name.
            Some("CMSIS-DAP")
        } else {
            None
        }
    }

    fn control_in(&mut self, xfer: ControlIn<B>) {
        let request = xfer.request();
        if request.request_type != RequestType::Standard
            || request.request != Request::GET_DESCRIPTOR
            || !self.is_for_interface(request)
        {
            return;
        }
        let descriptor_type = (request.value >> 8) as u8;
        let result = match descriptor_type {
            HID_DESC_TYPE_REPORT => xfer.accept_with(&self.report_descriptor),
            HID_DESC_TYPE_HID => {
                let descriptor = self.hid_descriptor();
                let mut buffer = [0u8; 9];
                buffer[0] = buffer.len() as u8;
                buffer[1] = HID_DESC_TYPE_HID;
                buffer[2..].copy_from_slice(&descriptor);
                xfer.accept_with(&buffer)
            }
            _ => return,
        };
        if result.is_err() {
            warn!("hid: descriptor request rejected");
        }
    }

    fn control_out(&mut self, xfer: ControlOut<B>) {
        let request = xfer.request();
        if request.request_type != RequestType::Class || !self.is_for_interface(request) {
            return;
        }
        // Reports travel over the interrupt endpoints; control-pipe reports are acknowledged only.
        let class_request = request.request;
        match class_request {
            HID_REQ_SET_IDLE | HID_REQ_SET_REPORT => {
                xfer.accept().ok();
            }
            _ => {}
        }
    }
}

/// A `CmsisDap` attached to a `HidDapInterface`.
///
/// A received report is only read from the endpoint once the previous
/// response has been handed to the IN endpoint, so one command is in
/// flight at a time.
pub struct DapClass<'a, B, Io, Vendor, const PACKET_SIZE: usize>
where
    B: UsbBus,
{
    inner: HidDapInterface<'a, B, PACKET_SIZE>,
    dap: CmsisDap<Io, Vendor, PACKET_SIZE>,
    packet: [u8; PACKET_SIZE],
    request_pending: bool,
    response_pending: bool,
}

impl<'a, B, Io, Vendor, const PACKET_SIZE: usize> DapClass<'a, B, Io, Vendor, PACKET_SIZE>
where
    B: UsbBus,
    Io: LineDriver,
    Vendor: VendorCommand,
{
    pub fn new(
        alloc: &'a UsbBusAllocator<B>,
        dap: CmsisDap<Io, Vendor, PACKET_SIZE>,
    ) -> DapClass<'a, B, Io, Vendor, PACKET_SIZE> {
        DapClass {
            inner: HidDapInterface::new(alloc),
            dap,
            packet: [0; PACKET_SIZE],
            request_pending: false,
            response_pending: false,
        }
    }

    pub fn dap(&self) -> &CmsisDap<Io, Vendor, PACKET_SIZE> {
        &self.dap
    }

    /// Runs at most one command. Call from the main loop after polling the device.
    pub fn process(&mut self) -> core::result::Result<(), DapError> {
        self.receive_request()?;
        if self.request_pending && !self.response_pending {
            let length = self.dap.process_packet(&mut self.packet);
            trace!("command {=u8:#x} answered with {=usize} bytes", self.packet[0], length);
            self.request_pending = false;
            self.response_pending = true;
        }
        self.send_response()
    }

    fn receive_request(&mut self) -> core::result::Result<(), DapError> {
        if self.request_pending || self.response_pending {
            return Ok(());
        }
        match self.inner.read_packet(&mut self.packet) {
            Ok(0) => Ok(()),
            Ok(size) => {
                // Short reports are padded as if the host sent a full one.
                self.packet[size..].fill(0);
                self.request_pending = true;
                Ok(())
            }
            Err(UsbError::WouldBlock) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    fn send_response(&mut self) -> core::result::Result<(), DapError> {
        if !self.response_pending {
            return Ok(());
        }
        match self.inner.write_packet(&self.packet) {
            Ok(_) => {
                self.response_pending = false;
                Ok(())
            }
            Err(UsbError::WouldBlock) => Ok(()),
            Err(error) => {
                warn!("hid: response dropped");
                self.response_pending = false;
                Err(error.into())
            }
        }
    }
}

impl<B, Io, Vendor, const PACKET_SIZE: usize> UsbClass<B> for DapClass<'_, B, Io, Vendor, PACKET_SIZE>
where
    B: UsbBus,
    Io: LineDriver,
    Vendor: VendorCommand,
{
    fn get_configuration_descriptors(&self, writer: &mut DescriptorWriter) -> Result<()> {
        self.inner.get_configuration_descriptors(writer)
    }
    fn get_string(&self, index: StringIndex, lang_id: u16) -> Option<&str> {
        self.inner.get_string(index, lang_id)
    }
    fn reset(&mut self) {
        self.request_pending = false;
        self.response_pending = false;
        self.inner.reset()
    }
    fn control_in(&mut self, xfer: ControlIn<B>) {
        self.inner.control_in(xfer)
    }
    fn control_out(&mut self, xfer: ControlOut<B>) {
        self.inner.control_out(xfer)
    }

    fn endpoint_in_complete(&mut self, addr: EndpointAddress) {
        if addr == self.inner.in_ep_address() {
            let _ = self.send_response();
        }
    }

    fn endpoint_out(&mut self, addr: EndpointAddress) {
        if addr == self.inner.out_ep_address() {
            let _ = self.receive_request();
        }
    }
}
