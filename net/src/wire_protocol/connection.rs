use std::net::SocketAddr;

use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self, Duration, Instant};

use crate::conversation::ConversationTopicHandler;
use crate::error::PeerResult;
use crate::wire_protocol::buffer::IOBuffer;
use crate::wire_protocol::messages::ProtocolMessage;
use crate::wire_protocol::raw_message::{MessageParseOutcome, RawMessage};

/// TCP hands over at most this much per read.
const READ_CHUNK_SIZE: usize = 64 * 1024;

enum DrainState {
    /// The current topic is over: either it finished, or a framing error
    /// poisoned the stream and the conversation ends with whatever was
    /// gathered so far.
    TopicDone,
    NeedMore,
}

/// One outbound connection to a peer. The receive buffer lives on the
/// connection, not on a single read loop: a frame may straddle chunk
/// boundaries, and bytes that arrive early (a verack trailing the version,
/// an eager addr) are carried over into the next conversation.
pub struct NodeConnection {
    magic: [u8; 4],
    peer: SocketAddr,
    socket: TcpStream,
    buffer: IOBuffer,
}

impl NodeConnection {
    pub async fn connect(magic: [u8; 4], addr: SocketAddr, timeout: Duration) -> io::Result<Self> {
        let socket = time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "tcp connect timed out"))??;
        Ok(NodeConnection {
            magic,
            peer: addr,
            socket,
            buffer: IOBuffer::default(),
        })
    }

    pub async fn send(&mut self, message: ProtocolMessage) -> PeerResult<()> {
        log::debug!("sending {:?} to {}", message, self.peer);
        self.socket.write_all(&message.to_bytes(self.magic)).await?;
        Ok(())
    }

    /// Drives a conversation topic until it finishes, the peer hangs up, or
    /// `overall` elapses. Reads happen in chunks with their own short
    /// timeout so the overall deadline is re-checked even against a silent
    /// peer. Whatever the handler has learned by then is its outcome.
    pub async fn proceed_conversation<H: ConversationTopicHandler>(
        &mut self,
        handler: H,
        overall: Duration,
        chunk_timeout: Duration,
    ) -> PeerResult<H::Outcome> {
        let mut handler = handler;
        let deadline = Instant::now() + overall;

        let initial_action = handler.initial_action();
        if let Some(message) = initial_action.message {
            self.send(message).await?;
        }
        if initial_action.topic_finished {
            return handler.outcome();
        }

        // frames left over from an earlier topic on this connection
        if let DrainState::TopicDone = self.drain_buffered(&mut handler).await? {
            return handler.outcome();
        }

        let mut chunk = vec![0_u8; READ_CHUNK_SIZE];
        while Instant::now() < deadline {
            match time::timeout(chunk_timeout, self.socket.read(&mut chunk)).await {
                // per-chunk timeout; the outer deadline decides when to give up
                Err(_) => continue,
                Ok(Ok(0)) => {
                    log::debug!("{} hung up, {} bytes left unparsed", self.peer, self.buffer.len());
                    break;
                }
                Ok(Ok(n)) => {
                    self.buffer.append(&chunk[..n]);
                    log::trace!(
                        "received {n} bytes from {}, buffer now holds {}",
                        self.peer,
                        self.buffer.len()
                    );
                    if let DrainState::TopicDone = self.drain_buffered(&mut handler).await? {
                        return handler.outcome();
                    }
                }
                Ok(Err(err)) => return Err(err.into()),
            }
        }

        handler.outcome()
    }

    /// Decodes every complete frame currently buffered and feeds it to the
    /// handler, sending any replies it produces.
    async fn drain_buffered<H: ConversationTopicHandler>(
        &mut self,
        handler: &mut H,
    ) -> PeerResult<DrainState> {
        loop {
            match RawMessage::try_consume_message(&mut self.buffer, self.magic) {
                Ok(MessageParseOutcome::Message(raw_message)) => {
                    let received_message = match raw_message.to_protocol_message() {
                        Ok(message) => message,
                        Err(err) => {
                            log::debug!("undecodable message from {}: {}", self.peer, err);
                            self.buffer.clear();
                            return Ok(DrainState::TopicDone);
                        }
                    };

                    log::debug!("received {:?} from {}", received_message, self.peer);
                    let handler_response = handler.on_message(received_message)?;
                    if let Some(response_message) = handler_response.message {
                        self.send(response_message).await?;
                    }
                    if handler_response.topic_finished {
                        return Ok(DrainState::TopicDone);
                    }
                }
                Ok(MessageParseOutcome::SkippedMessage) => {}
                Ok(MessageParseOutcome::NoMessage) => {
                    // consistent state but no complete message available
                    return Ok(DrainState::NeedMore);
                }
                Err(err) => {
                    log::debug!("dropping stream from {}: {}", self.peer, err);
                    self.buffer.clear();
                    return Ok(DrainState::TopicDone);
                }
            }
        }
    }
}
