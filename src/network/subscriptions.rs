//! Subscription Registry
//!
//! Remembers the wallet identity and every sweep/consolidation topic the
//! client asked for, so a fresh connection can restore server-side state.
//! The registry only produces commands; the connection decides whether they
//! go out now or wait for the next replay.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::network::envelope::ClientCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicKind {
    Sweep,
    Consolidation,
}

/// A subscription key scoping which events the backend delivers
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Topic {
    pub kind: TopicKind,
    pub id: String,
}

impl Topic {
    pub fn sweep(id: impl Into<String>) -> Self {
        Self {
            kind: TopicKind::Sweep,
            id: id.into(),
        }
    }

    pub fn consolidation(id: impl Into<String>) -> Self {
        Self {
            kind: TopicKind::Consolidation,
            id: id.into(),
        }
    }

    pub fn subscribe_command(&self) -> ClientCommand {
        match self.kind {
            TopicKind::Sweep => ClientCommand::SubscribeSweep {
                sweep_id: self.id.clone(),
            },
            TopicKind::Consolidation => ClientCommand::SubscribeConsolidation {
                consolidation_id: self.id.clone(),
            },
        }
    }

    pub fn unsubscribe_command(&self) -> ClientCommand {
        match self.kind {
            TopicKind::Sweep => ClientCommand::UnsubscribeSweep {
                sweep_id: self.id.clone(),
            },
            TopicKind::Consolidation => ClientCommand::UnsubscribeConsolidation {
                consolidation_id: self.id.clone(),
            },
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TopicKind::Sweep => write!(f, "sweep:{}", self.id),
            TopicKind::Consolidation => write!(f, "consolidation:{}", self.id),
        }
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    identity: Option<String>,
    topics: BTreeSet<Topic>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn set_identity(&mut self, wallet: impl Into<String>) {
        self.identity = Some(wallet.into());
    }

    pub fn clear_identity(&mut self) {
        self.identity = None;
    }

    pub fn wallet_command(&self) -> Option<ClientCommand> {
        self.identity.as_ref().map(|wallet| ClientCommand::SubscribeWallet {
            wallet: wallet.clone(),
        })
    }

    /// Track a topic. Returns the command to send; callers may resend safely
    /// even when the topic was already tracked.
    pub fn subscribe(&mut self, topic: Topic) -> ClientCommand {
        let command = topic.subscribe_command();
        self.topics.insert(topic);
        command
    }

    /// Stop tracking a topic
    pub fn unsubscribe(&mut self, topic: &Topic) -> ClientCommand {
        self.topics.remove(topic);
        topic.unsubscribe_command()
    }

    pub fn contains(&self, topic: &Topic) -> bool {
        self.topics.contains(topic)
    }

    pub fn topics(&self) -> impl Iterator<Item = &Topic> {
        self.topics.iter()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Commands restoring every subscription on a new connection, wallet first
    pub fn replay(&self) -> Vec<ClientCommand> {
        self.wallet_command()
            .into_iter()
            .chain(self.topics.iter().map(Topic::subscribe_command))
            .collect()
    }

    /// Teardown: forget identity and topics
    pub fn clear(&mut self) {
        self.identity = None;
        self.topics.clear();
    }
}
