//! Protocol messages, transport, and the request retry pipeline.

mod messages;
mod retry;
mod transport;

pub use messages::{
    ConfigurationMessageBody, ConfigurationReplyBody, Endpoint, Message,
    MessageBody, NodeDeactivationInfo, ReplicaMessageBody, ReplicaReplyBody,
};
pub use retry::{MessageRetryPipeline, PendingRequest, SupersedeKey};
pub use transport::{DropFilter, InMemoryNetwork, MessageTransport};
