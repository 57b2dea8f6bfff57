//! Typed protocol messages exchanged between the failover managers and the
//! reconfiguration agents.

use std::fmt;

use crate::failover::{
    FailoverManagerId, FailoverUnitDescription, FailoverUnitId, NodeId,
    NodeInstance, ReplicaDescription, ServiceDescription,
};
use crate::store::LoadMetrics;

use serde::{Deserialize, Serialize};

use uuid::Uuid;

/// Addressable party on the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    Manager(FailoverManagerId),
    Node(NodeId),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Endpoint::Manager(id) => write!(f, "{}", id),
            Endpoint::Node(id) => write!(f, "ra-{}", id),
        }
    }
}

/// Activation command carried by node (de)activation messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDeactivationInfo {
    pub is_activated: bool,
    pub sequence_number: i64,
}

/// Request about one replica of a failover unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaMessageBody {
    pub fu: FailoverUnitDescription,
    pub replica: ReplicaDescription,
    pub service: ServiceDescription,
}

/// Reply about one replica; `error` is set if the operation failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaReplyBody {
    pub fu: FailoverUnitDescription,
    pub replica: ReplicaDescription,
    pub error: Option<String>,
}

/// Request carrying a whole replica set configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationMessageBody {
    pub fu: FailoverUnitDescription,
    pub replicas: Vec<ReplicaDescription>,
    pub service: ServiceDescription,
}

/// Reply carrying a whole replica set configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationReplyBody {
    pub fu: FailoverUnitDescription,
    pub replicas: Vec<ReplicaDescription>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Agent -> manager on node start.
    NodeUp { node: NodeInstance },
    NodeUpAck { info: NodeDeactivationInfo },

    /// Manager -> agent node activation commands and their replies.
    ActivateNode(NodeDeactivationInfo),
    ActivateNodeReply(NodeDeactivationInfo),
    DeactivateNode(NodeDeactivationInfo),
    DeactivateNodeReply(NodeDeactivationInfo),

    /// Manager -> agent replica placement.
    AddPrimary(ReplicaMessageBody),
    AddPrimaryReply(ReplicaReplyBody),
    AddReplica(ReplicaMessageBody),
    AddReplicaReply(ReplicaReplyBody),
    DeleteReplica(ReplicaMessageBody),
    DeleteReplicaReply(ReplicaReplyBody),

    /// Manager -> new primary.
    DoReconfiguration(ConfigurationMessageBody),
    DoReconfigurationReply(ConfigurationReplyBody),

    /// Primary -> other agents during reconfiguration.
    GetLSN(ConfigurationMessageBody),
    GetLSNReply(ReplicaReplyBody),
    Deactivate(ConfigurationMessageBody),
    DeactivateReply(ReplicaReplyBody),
    Activate(ConfigurationMessageBody),
    ActivateReply(ReplicaReplyBody),

    /// Agent -> manager load report.
    ReportLoad {
        failover_unit_id: FailoverUnitId,
        metrics: LoadMetrics,
    },
}

impl MessageBody {
    /// Action name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            MessageBody::NodeUp { .. } => "NodeUp",
            MessageBody::NodeUpAck { .. } => "NodeUpAck",
            MessageBody::ActivateNode(_) => "ActivateNode",
            MessageBody::ActivateNodeReply(_) => "ActivateNodeReply",
            MessageBody::DeactivateNode(_) => "DeactivateNode",
            MessageBody::DeactivateNodeReply(_) => "DeactivateNodeReply",
            MessageBody::AddPrimary(_) => "AddPrimary",
            MessageBody::AddPrimaryReply(_) => "AddPrimaryReply",
            MessageBody::AddReplica(_) => "AddReplica",
            MessageBody::AddReplicaReply(_) => "AddReplicaReply",
            MessageBody::DeleteReplica(_) => "DeleteReplica",
            MessageBody::DeleteReplicaReply(_) => "DeleteReplicaReply",
            MessageBody::DoReconfiguration(_) => "DoReconfiguration",
            MessageBody::DoReconfigurationReply(_) => "DoReconfigurationReply",
            MessageBody::GetLSN(_) => "GetLSN",
            MessageBody::GetLSNReply(_) => "GetLSNReply",
            MessageBody::Deactivate(_) => "Deactivate",
            MessageBody::DeactivateReply(_) => "DeactivateReply",
            MessageBody::Activate(_) => "Activate",
            MessageBody::ActivateReply(_) => "ActivateReply",
            MessageBody::ReportLoad { .. } => "ReportLoad",
        }
    }

    /// Failover unit the message is about, if any.
    pub fn failover_unit_id(&self) -> Option<FailoverUnitId> {
        match self {
            MessageBody::AddPrimary(b)
            | MessageBody::AddReplica(b)
            | MessageBody::DeleteReplica(b) => Some(b.fu.failover_unit_id),
            MessageBody::AddPrimaryReply(b)
            | MessageBody::AddReplicaReply(b)
            | MessageBody::DeleteReplicaReply(b)
            | MessageBody::GetLSNReply(b)
            | MessageBody::DeactivateReply(b)
            | MessageBody::ActivateReply(b) => Some(b.fu.failover_unit_id),
            MessageBody::DoReconfiguration(b)
            | MessageBody::GetLSN(b)
            | MessageBody::Deactivate(b)
            | MessageBody::Activate(b) => Some(b.fu.failover_unit_id),
            MessageBody::DoReconfigurationReply(b) => Some(b.fu.failover_unit_id),
            MessageBody::ReportLoad {
                failover_unit_id, ..
            } => Some(*failover_unit_id),
            _ => None,
        }
    }
}

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Correlates all messages of one logical operation in logs.
    pub activity_id: Uuid,

    /// Set by the retry pipeline on requests and echoed on replies; zero
    /// when no reply is being tracked.
    pub request_id: u64,

    pub from: Endpoint,

    pub body: MessageBody,
}

impl Message {
    pub fn new(from: Endpoint, body: MessageBody) -> Self {
        Message {
            activity_id: Uuid::new_v4(),
            request_id: 0,
            from,
            body,
        }
    }

    /// A reply to `self`, keeping its activity and request ID.
    pub fn reply(&self, from: Endpoint, body: MessageBody) -> Self {
        Message {
            activity_id: self.activity_id,
            request_id: self.request_id,
            from,
            body,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} from {}", self.body.name(), self.from)?;
        if let Some(id) = self.body.failover_unit_id() {
            write!(f, " fu {}", id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod messages_tests {
    use super::*;

    #[test]
    fn reply_keeps_correlation() {
        let mut req = Message::new(
            Endpoint::Manager(FailoverManagerId::Fm),
            MessageBody::DeactivateNode(NodeDeactivationInfo {
                is_activated: false,
                sequence_number: 3,
            }),
        );
        req.request_id = 42;
        let rep = req.reply(
            Endpoint::Node(2),
            MessageBody::DeactivateNodeReply(NodeDeactivationInfo {
                is_activated: false,
                sequence_number: 3,
            }),
        );
        assert_eq!(rep.activity_id, req.activity_id);
        assert_eq!(rep.request_id, 42);
        assert_eq!(format!("{}", rep), "DeactivateNodeReply from ra-2");
    }
}
