use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(SessionKey);
id_newtype!(TargetId);

impl SessionKey {
    /// Conversation scoped by sender, so concurrent speakers in a group
    /// never get their bursts merged into one batch.
    pub fn scoped(conversation_id: &str, sender_id: &str) -> Self {
        Self::new(format!("{conversation_id}:{sender_id}"))
    }
}

/// Binary payload carried alongside a fragment. Resolved to text upstream of
/// the coalescer by the tool-invocation collaborator.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Actor/context snapshot attached to each fragment; a batch keeps the most
/// recently enqueued one (last-write-wins).
#[derive(Debug, Clone)]
pub struct FragmentMetadata {
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_label: String,
    pub is_group: bool,
    pub received_at: DateTime<Utc>,
}

/// One inbound chat event as handed to the gateway.
#[derive(Debug, Clone)]
pub struct InboundFragment {
    pub message_id: String,
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub metadata: FragmentMetadata,
}

/// Owned by the coalescer for one session at a time: created on the first
/// fragment after a quiet period, mutated by every follow-up fragment, moved
/// out atomically at flush.
#[derive(Debug, Clone)]
pub struct BufferedBatch {
    pub fragments: Vec<String>,
    pub attachments: Vec<Attachment>,
    pub metadata: FragmentMetadata,
}

impl BufferedBatch {
    pub fn new(metadata: FragmentMetadata) -> Self {
        Self {
            fragments: Vec::new(),
            attachments: Vec::new(),
            metadata,
        }
    }

    /// Insertion order is significant: fragments are joined with newlines.
    pub fn joined_text(&self) -> String {
        self.fragments.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_session_key_includes_sender() {
        let key = SessionKey::scoped("conv-9", "user-3");
        assert_eq!(key.as_str(), "conv-9:user-3");
    }

    #[test]
    fn batch_joins_fragments_in_arrival_order() {
        let mut batch = BufferedBatch::new(FragmentMetadata {
            conversation_id: "c".to_string(),
            sender_id: "s".to_string(),
            sender_label: "S".to_string(),
            is_group: false,
            received_at: Utc::now(),
        });
        batch.fragments.push("a".to_string());
        batch.fragments.push("b".to_string());
        batch.fragments.push("c".to_string());
        assert_eq!(batch.joined_text(), "a\nb\nc");
    }
}
