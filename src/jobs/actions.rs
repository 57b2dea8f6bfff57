//! Side effects computed by a state machine transition and executed after
//! the transition has been committed.

use crate::agent::HostRequest;
use crate::background::{ChangeSetMembershipAction, EntitySetName};
use crate::health::HealthState;
use crate::messaging::{Endpoint, Message};

#[derive(Debug, Clone)]
pub enum StateMachineAction {
    SendMessage {
        to: Endpoint,
        message: Message,
    },

    ChangeSetMembership(ChangeSetMembershipAction),

    ReportHealth {
        entity: String,
        state: HealthState,
        description: String,
    },

    /// Run a cycle of the set's background work right away.
    RequestWork(EntitySetName),

    /// Open or close a replica through the replica host.
    Host(HostRequest),
}

/// Ordered list of actions of one transition. Dropped without executing if
/// the commit fails.
#[derive(Debug, Default)]
pub struct ActionQueue {
    actions: Vec<StateMachineAction>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: StateMachineAction) {
        self.actions.push(action);
    }

    pub fn send_message(&mut self, to: Endpoint, message: Message) {
        self.push(StateMachineAction::SendMessage { to, message });
    }

    pub fn report_health(
        &mut self,
        entity: impl Into<String>,
        state: HealthState,
        description: impl Into<String>,
    ) {
        self.push(StateMachineAction::ReportHealth {
            entity: entity.into(),
            state,
            description: description.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> &[StateMachineAction] {
        &self.actions
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, StateMachineAction> {
        self.actions.drain(..)
    }

    /// Executes every action in order, consuming the queue.
    pub fn execute(self, executor: &dyn ActionExecutor) {
        for action in self.actions {
            executor.execute(action);
        }
    }
}

/// Carries out actions. Must not block: long operations are spawned.
pub trait ActionExecutor: Send + Sync {
    fn execute(&self, action: StateMachineAction);
}

#[cfg(test)]
mod actions_tests {
    use super::*;
    use crate::failover::FailoverManagerId;
    use crate::messaging::{MessageBody, NodeDeactivationInfo};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl ActionExecutor for Recorder {
        fn execute(&self, action: StateMachineAction) {
            let tag = match action {
                StateMachineAction::SendMessage { message, .. } => message.body.name().to_string(),
                StateMachineAction::ReportHealth { entity, .. } => entity,
                other => format!("{:?}", other),
            };
            self.0.lock().push(tag);
        }
    }

    #[test]
    fn executes_in_order() {
        let mut queue = ActionQueue::new();
        queue.report_health("fu-1", HealthState::Warning, "slow");
        queue.send_message(
            Endpoint::Manager(FailoverManagerId::Fm),
            Message::new(
                Endpoint::Node(1),
                MessageBody::ActivateNodeReply(NodeDeactivationInfo {
                    is_activated: true,
                    sequence_number: 1,
                }),
            ),
        );
        assert_eq!(queue.len(), 2);
        let recorder = Recorder::default();
        queue.execute(&recorder);
        assert_eq!(*recorder.0.lock(), vec!["fu-1", "ActivateNodeReply"]);
    }
}
