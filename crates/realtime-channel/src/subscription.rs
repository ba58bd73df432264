use crate::error::ChannelError;

pub const CHANNEL_PREFIX: &str = "private-message-group.";

/// One logical conversation: a message group and its private channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSubscription {
    group_id: String,
    channel_name: String,
}

impl ChannelSubscription {
    pub fn new(group_id: impl Into<String>) -> Result<Self, ChannelError> {
        let group_id = group_id.into();
        if group_id.trim().is_empty() {
            return Err(ChannelError::EmptyGroupId);
        }
        let channel_name = format!("{CHANNEL_PREFIX}{group_id}");
        Ok(Self {
            group_id,
            channel_name,
        })
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    /// Frames without a channel are treated as ours; the server only omits it
    /// for connection-level events.
    pub fn owns(&self, channel: Option<&str>) -> bool {
        channel.map_or(true, |name| name == self.channel_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_private_channel_name() {
        let sub = ChannelSubscription::new("group-42").expect("valid group");
        assert_eq!(sub.channel_name(), "private-message-group.group-42");
        assert_eq!(sub.group_id(), "group-42");
    }

    #[test]
    fn rejects_blank_group() {
        assert!(matches!(
            ChannelSubscription::new("   "),
            Err(ChannelError::EmptyGroupId)
        ));
    }

    #[test]
    fn owns_matching_or_unspecified_channel() {
        let sub = ChannelSubscription::new("7").unwrap();
        assert!(sub.owns(None));
        assert!(sub.owns(Some("private-message-group.7")));
        assert!(!sub.owns(Some("private-message-group.8")));
    }
}
