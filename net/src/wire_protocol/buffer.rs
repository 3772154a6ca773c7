use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

pub struct ByteBufferParser<'a> {
    buffer: &'a [u8],
    pos: usize,
}

impl<'a> ByteBufferParser<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        ByteBufferParser { buffer, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.pos
    }

    pub fn skip_bytes(&mut self, count: usize) -> io::Result<()> {
        self.eof_check(count)?;
        self.pos += count;
        Ok(())
    }

    pub fn read(&mut self, size: usize) -> io::Result<&'a [u8]> {
        self.eof_check(size)?;
        let range = self.pos..self.pos + size;
        self.pos += size;
        Ok(&self.buffer[range])
    }

    pub fn read_u32_le(&mut self) -> io::Result<u32> {
        Ok(u32::from_le_bytes(self.read(4)?.try_into().unwrap()))
    }

    pub fn read_i32_le(&mut self) -> io::Result<i32> {
        Ok(i32::from_le_bytes(self.read(4)?.try_into().unwrap()))
    }

    pub fn read_u16_le(&mut self) -> io::Result<u16> {
        Ok(u16::from_le_bytes(self.read(2)?.try_into().unwrap()))
    }

    pub fn read_u64_le(&mut self) -> io::Result<u64> {
        Ok(u64::from_le_bytes(self.read(8)?.try_into().unwrap()))
    }

    pub fn read_i64_le(&mut self) -> io::Result<i64> {
        Ok(i64::from_le_bytes(self.read(8)?.try_into().unwrap()))
    }

    fn read_u16_be(&mut self) -> io::Result<u16> {
        Ok(u16::from_be_bytes(self.read(2)?.try_into().unwrap()))
    }

    /// 1+  length  varint  (https://en.bitcoin.it/wiki/Protocol_documentation#Variable_length_integer)
    pub fn read_var_int(&mut self) -> io::Result<u64> {
        let discriminant = self.read(1)?[0];
        match discriminant {
            0xff => self.read_u64_le(),
            0xfe => Ok(self.read_u32_le()? as u64),
            0xfd => Ok(self.read_u16_le()? as u64),
            n => Ok(n as u64),
        }
    }

    /// var_str: varint length followed by the raw bytes. Non-UTF8 input is
    /// replaced rather than rejected; user agents in the wild are not clean.
    pub fn read_var_string(&mut self) -> io::Result<String> {
        let len = self.read_var_int()? as usize;
        let bytes = self.read(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// net_addr without the time field, as used inside version messages.
    pub fn parse_net_addr(&mut self) -> io::Result<(u64, SocketAddr)> {
        let services = self.read_u64_le()?;
        let octets: [u8; 16] = self.read(16)?.try_into().unwrap();
        let port = self.read_u16_be()?;
        Ok((services, SocketAddr::new(unmap_ip(octets), port)))
    }

    fn eof_check(&self, want_bytes: usize) -> io::Result<()> {
        if self.remaining() < want_bytes {
            Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "can not read {} bytes from buffer of size {}",
                    want_bytes,
                    self.buffer.len()
                ),
            ))
        } else {
            Ok(())
        }
    }
}

/// Addresses travel as 16 octets; IPv4 goes over the wire in its
/// IPv4-mapped IPv6 form and comes back out as native IPv4.
pub fn unmap_ip(octets: [u8; 16]) -> IpAddr {
    let v6 = Ipv6Addr::from(octets);
    match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    }
}

pub struct ByteBufferComposer {
    buffer: Vec<u8>,
}

impl ByteBufferComposer {
    pub fn new() -> Self {
        ByteBufferComposer { buffer: vec![] }
    }

    pub fn result(self) -> Vec<u8> {
        self.buffer
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn append_var_int(&mut self, value: u64) {
        match value {
            0..=0xfc => self.append(&[value as u8]),
            0xfd..=0xffff => {
                self.append(&[0xfd]);
                self.append(&(value as u16).to_le_bytes());
            }
            0x10000..=0xffff_ffff => {
                self.append(&[0xfe]);
                self.append(&(value as u32).to_le_bytes());
            }
            _ => {
                self.append(&[0xff]);
                self.append(&value.to_le_bytes());
            }
        }
    }

    pub fn append_var_string(&mut self, value: &str) {
        self.append_var_int(value.len() as u64);
        self.append(value.as_bytes());
    }

    /// net_addr struct without the time field.
    pub fn append_net_addr(&mut self, services: u64, addr: &SocketAddr) {
        self.append(&services.to_le_bytes());
        let ipv6_octets = match &addr.ip() {
            IpAddr::V4(ip) => ip.to_ipv6_mapped().octets(),
            IpAddr::V6(ip) => ip.octets(),
        };
        self.append(&ipv6_octets);
        self.append(&addr.port().to_be_bytes());
    }
}

impl Default for ByteBufferComposer {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive-side accumulator. TCP hands us arbitrary chunks; complete frames
/// are consumed from the front and the unconsumed tail stays put until more
/// bytes arrive.
#[derive(Default)]
pub struct IOBuffer {
    buffer: Vec<u8>,
}

impl IOBuffer {
    pub fn content(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Removes `size` bytes from the beginning of the buffer.
    pub fn shift_left(&mut self, size: usize) {
        assert!(size <= self.buffer.len());
        self.buffer.drain(..size);
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
