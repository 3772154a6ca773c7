use crate::error::PeerResult;
use crate::wire_protocol::messages::ProtocolMessage;

/// What a conversation topic wants to happen next: optionally send a
/// message, and whether the topic is done with this connection.
pub struct ConversationAction {
    pub message: Option<ProtocolMessage>,
    pub topic_finished: bool,
}

impl ConversationAction {
    pub fn nop() -> Self {
        ConversationAction {
            message: None,
            topic_finished: false,
        }
    }

    pub fn respond(message: ProtocolMessage) -> Self {
        ConversationAction {
            message: Some(message),
            topic_finished: false,
        }
    }

    pub fn finish() -> Self {
        ConversationAction {
            message: None,
            topic_finished: true,
        }
    }

    pub fn finish_with(message: ProtocolMessage) -> Self {
        ConversationAction {
            message: Some(message),
            topic_finished: true,
        }
    }
}

/// One request/response exchange driven over a peer connection, e.g. the
/// version handshake or an address request. The connection loop feeds every
/// decoded message to the handler and sends whatever it replies with; when
/// the topic finishes (or the peer goes quiet past the deadline) the handler
/// is consumed for its outcome.
///
/// Outcomes describe what was actually learned, so a topic that never saw
/// the message it was waiting for still yields a usable (empty) result.
pub trait ConversationTopicHandler {
    type Outcome;

    fn initial_action(&mut self) -> ConversationAction;
    fn on_message(&mut self, message: ProtocolMessage) -> PeerResult<ConversationAction>;
    /// The result of this conversation, once it is over.
    fn outcome(self) -> PeerResult<Self::Outcome>;
}
