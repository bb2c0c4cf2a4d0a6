//! Topic construction for one device connection

use crate::config::{CommandsSection, PublishSection};

/// Topics a device publishes to and subscribes from
#[derive(Debug, Clone, PartialEq)]
pub struct Topics {
    pub data: String,
    pub raw_prefix: String,
    pub decodable_suffix: String,
    pub opaque_suffix: String,
    pub command: String,
    pub command_response: String,
}

impl Topics {
    pub fn from_config(publish: &PublishSection, commands: &CommandsSection) -> Self {
        Self {
            data: publish.data_topic.clone(),
            raw_prefix: publish.raw_topic_prefix.clone(),
            decodable_suffix: publish.decodable_suffix.clone(),
            opaque_suffix: publish.opaque_suffix.clone(),
            command: commands.topic.clone(),
            command_response: commands.response_topic.clone(),
        }
    }

    /// Raw data topic: prefix followed by a caller-supplied suffix
    pub fn raw_data(&self, suffix: &str) -> String {
        format!("{}{}", self.raw_prefix, suffix)
    }

    pub fn decodable_raw_data(&self) -> String {
        self.raw_data(&self.decodable_suffix)
    }

    pub fn opaque_raw_data(&self) -> String {
        self.raw_data(&self.opaque_suffix)
    }

    /// Shared FIFO consumed in application mode
    pub fn fifo(name: &str) -> String {
        format!("fifo/{name}")
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self::from_config(&PublishSection::default(), &CommandsSection::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_topics() {
        let topics = Topics::default();
        assert_eq!(topics.data, "dev/data");
        assert_eq!(topics.command, "dev/cmd");
        assert_eq!(topics.command_response, "dev/cmd/res");
    }

    #[test]
    fn test_raw_topics_use_suffix() {
        let topics = Topics::default();
        assert_eq!(topics.decodable_raw_data(), "dev/v1/data/binary/test");
        assert_eq!(topics.opaque_raw_data(), "dev/v1/data/binary/none");
        assert_eq!(topics.raw_data("float"), "dev/v1/data/binary/float");
    }

    #[test]
    fn test_fifo_topic() {
        assert_eq!(Topics::fifo("DeviceToDevice"), "fifo/DeviceToDevice");
    }
}
