use sha2::digest::FixedOutput;
use sha2::{Digest, Sha256};
use strum::{EnumIter, IntoEnumIterator};

use crate::error::{PeerError, PeerResult};
use crate::wire_protocol::buffer::{ByteBufferComposer, ByteBufferParser, IOBuffer};
use crate::wire_protocol::messages::{
    AddrMessage, PingMessage, PongMessage, ProtocolMessage, VersionMessage,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumIter)]
pub enum Command {
    Version,
    Verack,
    Getaddr,
    Addr,
    Ping,
    Pong,
}

impl Command {
    // ASCII string identifying the packet content, NULL padded (non-NULL padding results in packet rejected)
    fn as_bytes(&self) -> &[u8; 12] {
        match self {
            Command::Version => b"version\0\0\0\0\0",
            Command::Verack => b"verack\0\0\0\0\0\0",
            Command::Getaddr => b"getaddr\0\0\0\0\0",
            Command::Addr => b"addr\0\0\0\0\0\0\0\0",
            Command::Ping => b"ping\0\0\0\0\0\0\0\0",
            Command::Pong => b"pong\0\0\0\0\0\0\0\0",
        }
    }

    /// Commands we do not speak (inv, sendheaders, ...) are skipped by the
    /// framing layer rather than treated as errors.
    fn from_wire(value: &[u8]) -> Option<Command> {
        Command::iter().find(|command| command.as_bytes() == value)
    }
}

/// Almost all integers are encoded in little endian. Only IP or port number are encoded big endian.
pub struct RawMessage {
    pub command: Command,
    pub payload: Vec<u8>,
}

pub const HEADER_LEN: usize = 4 + 12 + 4 + 4;

impl RawMessage {
    pub fn new(command: Command, payload: Vec<u8>) -> Self {
        RawMessage { command, payload }
    }

    /// Message structure (see https://en.bitcoin.it/wiki/Protocol_documentation#Message_structure)
    ///
    /// size | field    | type     | description
    /// ---  | -----    | ----     | ------------
    /// 4    | magic    | [u8; 4]  | Magic value indicating message origin network
    /// 12   | command  | [u8; 12] | ASCII string identifying the packet content, NULL padded
    /// 4    | length   | u32      | Length of payload in number of bytes
    /// 4    | checksum | u32      | First 4 bytes of sha256(sha256(payload))
    /// ?    | payload  | Vec<u8>  | The actual data
    pub fn to_bytes(&self, magic: [u8; 4]) -> Vec<u8> {
        let mut c = ByteBufferComposer::new();
        c.append(&magic);
        c.append(self.command.as_bytes());
        c.append(&(self.payload.len() as u32).to_le_bytes());
        let checksum = sha256(&sha256(self.payload.as_slice()));
        c.append(&checksum[..4]);
        c.append(&self.payload);
        c.result()
    }

    /// Consumes at most one frame from the front of `buffer`.
    ///
    /// A frame whose magic belongs to another network is fatal for the
    /// connection; there is no attempt to scan forward to a resync point.
    /// Received checksums are carried but not verified: live networks
    /// contain peers that emit garbage there, and the decision whether to
    /// talk to a peer is made on the handshake content.
    pub fn try_consume_message(
        buffer: &mut IOBuffer,
        expected_magic: [u8; 4],
    ) -> PeerResult<MessageParseOutcome> {
        let mut parser = ByteBufferParser::new(buffer.content());

        if parser.remaining() < HEADER_LEN {
            return Ok(MessageParseOutcome::NoMessage);
        }

        let magic: [u8; 4] = parser.read(4)?.try_into().unwrap();
        if magic != expected_magic {
            return Err(PeerError::WrongNetwork {
                got: magic,
                expected: expected_magic,
            });
        }

        let command_string = parser.read(12)?;
        let payload_len = parser.read_u32_le()? as usize;
        let _checksum: [u8; 4] = parser.read(4)?.try_into().unwrap();

        if parser.remaining() < payload_len {
            return Ok(MessageParseOutcome::NoMessage);
        }

        let payload = parser.read(payload_len)?.to_vec();

        let command = match Command::from_wire(command_string) {
            Some(command) => command,
            None => {
                log::trace!(
                    "skipping unhandled command '{}'",
                    String::from_utf8_lossy(command_string).trim_end_matches('\0')
                );
                buffer.shift_left(parser.pos());
                return Ok(MessageParseOutcome::SkippedMessage);
            }
        };

        buffer.shift_left(parser.pos());

        Ok(MessageParseOutcome::Message(RawMessage { command, payload }))
    }

    pub fn to_protocol_message(self) -> PeerResult<ProtocolMessage> {
        match self.command {
            Command::Version => Ok(ProtocolMessage::Version(VersionMessage::from_raw_message(
                &self,
            )?)),
            Command::Verack => Ok(ProtocolMessage::Verack),
            Command::Getaddr => Ok(ProtocolMessage::Getaddr),
            Command::Addr => Ok(ProtocolMessage::Addr(AddrMessage::from_raw_message(&self)?)),
            Command::Ping => Ok(ProtocolMessage::Ping(PingMessage::from_raw_message(&self))),
            Command::Pong => Ok(ProtocolMessage::Pong(PongMessage::from_raw_message(&self))),
        }
    }
}

pub enum MessageParseOutcome {
    Message(RawMessage),
    SkippedMessage,
    NoMessage,
}

fn sha256(input: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::default();
    hasher.update(input);
    hasher.finalize_fixed().into()
}

#[cfg(test)]
mod test {
    use hex_literal::hex;
    use rstest::*;

    use super::*;

    const MAGIC: [u8; 4] = [0xf9, 0xbe, 0xb4, 0xd9];

    #[rstest]
    #[case(b"hello world", & hex ! ("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9")[..])]
    #[case(b"What a wonderful day!", & hex ! ("99645b38ff103516a86ade43cffa0116d31f6136a83f99d4fa5b6c19e29c20cf"))]
    fn test_message_sha256(#[case] input: &[u8], #[case] expected_result: &[u8]) {
        assert_eq!(&sha256(input), expected_result);
    }

    #[rstest]
    #[case(Command::Verack)]
    #[case(Command::Getaddr)]
    fn empty_payload_round_trip(#[case] command: Command) {
        let bytes = RawMessage::new(command, vec![]).to_bytes(MAGIC);
        assert_eq!(bytes.len(), HEADER_LEN);

        let mut buffer = IOBuffer::default();
        buffer.append(&bytes);
        match RawMessage::try_consume_message(&mut buffer, MAGIC).unwrap() {
            MessageParseOutcome::Message(raw) => {
                assert_eq!(raw.command, command);
                assert!(raw.payload.is_empty());
            }
            _ => panic!("expected a complete message"),
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn payload_round_trip() {
        let payload = vec![1, 2, 3, 4, 5];
        let bytes = RawMessage::new(Command::Ping, payload.clone()).to_bytes(MAGIC);

        let mut buffer = IOBuffer::default();
        buffer.append(&bytes);
        match RawMessage::try_consume_message(&mut buffer, MAGIC).unwrap() {
            MessageParseOutcome::Message(raw) => {
                assert_eq!(raw.command, Command::Ping);
                assert_eq!(raw.payload, payload);
            }
            _ => panic!("expected a complete message"),
        }
    }

    #[test]
    fn incomplete_header_yields_no_message() {
        let mut buffer = IOBuffer::default();
        buffer.append(&MAGIC);
        buffer.append(b"version\0");
        match RawMessage::try_consume_message(&mut buffer, MAGIC).unwrap() {
            MessageParseOutcome::NoMessage => {}
            _ => panic!("truncated header must not produce a message"),
        }
        assert_eq!(buffer.len(), 12);
    }

    #[test]
    fn incomplete_payload_yields_no_message() {
        let bytes = RawMessage::new(Command::Ping, vec![0; 8]).to_bytes(MAGIC);
        let mut buffer = IOBuffer::default();
        buffer.append(&bytes[..bytes.len() - 3]);
        match RawMessage::try_consume_message(&mut buffer, MAGIC).unwrap() {
            MessageParseOutcome::NoMessage => {}
            _ => panic!("truncated payload must not produce a message"),
        }

        // the remaining bytes complete the frame
        buffer.append(&bytes[bytes.len() - 3..]);
        match RawMessage::try_consume_message(&mut buffer, MAGIC).unwrap() {
            MessageParseOutcome::Message(raw) => assert_eq!(raw.payload, vec![0; 8]),
            _ => panic!("expected a complete message after the tail arrived"),
        }
    }

    #[test]
    fn foreign_magic_is_fatal() {
        let bytes = RawMessage::new(Command::Verack, vec![]).to_bytes([0x0b, 0x11, 0x09, 0x07]);
        let mut buffer = IOBuffer::default();
        buffer.append(&bytes);
        match RawMessage::try_consume_message(&mut buffer, MAGIC) {
            Err(PeerError::WrongNetwork { got, expected }) => {
                assert_eq!(got, [0x0b, 0x11, 0x09, 0x07]);
                assert_eq!(expected, MAGIC);
            }
            _ => panic!("expected a wrong-network error"),
        }
    }

    #[test]
    fn unknown_command_is_skipped_and_consumed() {
        let mut unknown = Vec::new();
        unknown.extend_from_slice(&MAGIC);
        unknown.extend_from_slice(b"sendheaders\0");
        unknown.extend_from_slice(&0_u32.to_le_bytes());
        unknown.extend_from_slice(&[0x5d, 0xf6, 0xe0, 0xe2]);

        let mut buffer = IOBuffer::default();
        buffer.append(&unknown);
        buffer.append(&RawMessage::new(Command::Verack, vec![]).to_bytes(MAGIC));

        match RawMessage::try_consume_message(&mut buffer, MAGIC).unwrap() {
            MessageParseOutcome::SkippedMessage => {}
            _ => panic!("expected the unknown command to be skipped"),
        }
        match RawMessage::try_consume_message(&mut buffer, MAGIC).unwrap() {
            MessageParseOutcome::Message(raw) => assert_eq!(raw.command, Command::Verack),
            _ => panic!("expected the verack behind the skipped frame"),
        }
    }

    #[test]
    fn received_checksum_is_not_enforced() {
        let mut bytes = RawMessage::new(Command::Ping, vec![9; 8]).to_bytes(MAGIC);
        bytes[20..24].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

        let mut buffer = IOBuffer::default();
        buffer.append(&bytes);
        match RawMessage::try_consume_message(&mut buffer, MAGIC).unwrap() {
            MessageParseOutcome::Message(raw) => assert_eq!(raw.command, Command::Ping),
            _ => panic!("a bad checksum must not reject the frame"),
        }
    }
}
