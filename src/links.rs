//! Absolute URIs for hub resources, rooted at the public app URL.

use crate::types::{ChannelName, GroupName, SequenceId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Links {
    base: String,
}

impl Links {
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into().trim_end_matches('/').to_string();
        Links { base }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn channels(&self) -> String {
        format!("{}/channel", self.base)
    }

    pub fn channel(&self, name: &ChannelName) -> String {
        format!("{}/channel/{}", self.base, name)
    }

    pub fn item(&self, channel: &ChannelName, id: SequenceId) -> String {
        format!("{}/channel/{}/{}", self.base, channel, id)
    }

    pub fn latest(&self, channel: &ChannelName) -> String {
        format!("{}/channel/{}/latest", self.base, channel)
    }

    pub fn channel_tag(&self, channel: &ChannelName, tag: &str) -> String {
        format!("{}/channel/{}/tag/{}", self.base, channel, tag)
    }

    pub fn tag(&self, tag: &str) -> String {
        format!("{}/tag/{}", self.base, tag)
    }

    /// Group URI under the path family (`webhook` or `group`) it was addressed by.
    pub fn group(&self, family: &str, name: &GroupName) -> String {
        format!("{}/{}/{}", self.base, family, name)
    }
}
