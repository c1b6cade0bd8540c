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

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CursorError {
    InsufficientBuffer,
    NotEnoughData,
}

pub trait CursorRead {
    /// Fills `buffer` completely or fails without consuming anything.
    fn read<'a>(&mut self, buffer: &'a mut [u8]) -> Result<&'a [u8], CursorError>;

    fn read_u8(&mut self) -> Result<u8, CursorError> {
        let mut value = [0u8; 1];
        self.read(&mut value)?;
        Ok(value[0])
    }
    fn read_u16(&mut self) -> Result<u16, CursorError> {
        let mut value = [0u8; 2];
        self.read(&mut value)?;
        Ok(u16::from_le_bytes(value))
    }
    fn read_u32(&mut self) -> Result<u32, CursorError> {
        let mut value = [0u8; 4];
        self.read(&mut value)?;
        Ok(u32::from_le_bytes(value))
    }
}

pub trait CursorWrite {
    fn write(&mut self, data: &[u8]) -> Result<(), CursorError>;

    fn write_u8(&mut self, value: u8) -> Result<(), CursorError> {
        self.write(&[value])
    }
}

pub struct BufferCursor<Buffer> {
    buffer: Buffer,
    position: usize,
}

impl<Buffer> BufferCursor<Buffer> {
    pub fn new(buffer: Buffer) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }
    pub fn new_with_position(buffer: Buffer, position: usize) -> Self {
        Self { buffer, position }
    }
    #[allow(dead_code)]
    pub fn release(self) -> Buffer {
        self.buffer
    }
    pub fn get_position(&self) -> usize {
        self.position
    }
}

impl<Buffer: AsRef<[u8]>> BufferCursor<Buffer> {
    pub fn remaining(&self) -> usize {
        self.buffer.as_ref().len().saturating_sub(self.position)
    }
}

impl<Buffer: AsRef<[u8]>> CursorRead for BufferCursor<Buffer> {
    fn read<'a>(&mut self, buffer: &'a mut [u8]) -> Result<&'a [u8], CursorError> {
        let data = self.buffer.as_ref();
        let bytes_to_read = buffer.len();
        if data.len().saturating_sub(self.position) < bytes_to_read {
            return Err(CursorError::NotEnoughData);
        }
        buffer.copy_from_slice(&data[self.position..self.position + bytes_to_read]);
        self.position += bytes_to_read;
        Ok(buffer)
    }
}

impl<Buffer: AsMut<[u8]>> CursorWrite for BufferCursor<Buffer> {
    fn write(&mut self, data: &[u8]) -> Result<(), CursorError> {
        let bytes_to_write = data.len();
        let buffer: &mut [u8] = self.buffer.as_mut();
        let remaining = buffer.len().saturating_sub(self.position);
        if remaining < bytes_to_write {
            Err(CursorError::InsufficientBuffer)
        } else {
            buffer[self.position..self.position + bytes_to_write].copy_from_slice(data);
            self.position += bytes_to_write;
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn read_little_endian_fields() {
        let data = [0x05u8, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12];
        let mut cursor = BufferCursor::new(&data[..]);
        assert_eq!(cursor.read_u8(), Ok(0x05));
        assert_eq!(cursor.read_u16(), Ok(0x1234));
        assert_eq!(cursor.read_u32(), Ok(0x1234_5678));
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn short_read_does_not_consume() {
        let data = [1u8, 2, 3];
        let mut cursor = BufferCursor::new_with_position(&data[..], 1);
        assert_eq!(cursor.read_u32(), Err(CursorError::NotEnoughData));
        assert_eq!(cursor.get_position(), 1);
        assert_eq!(cursor.read_u16(), Ok(0x0302));
    }

    #[test]
    fn write_stops_at_end_of_buffer() {
        let mut data = [0u8; 5];
        let mut cursor = BufferCursor::new(&mut data[..]);
        assert_eq!(cursor.write(&[1, 2, 3, 4]), Ok(()));
        assert_eq!(
            cursor.write(&[5, 6, 7, 8]),
            Err(CursorError::InsufficientBuffer)
        );
        assert_eq!(cursor.write_u8(9), Ok(()));
        assert_eq!(cursor.get_position(), 5);
        assert_eq!(data, [1, 2, 3, 4, 9]);
    }
}
