pub const FEED_TEMPERATURE: &str = "temperature";
pub const FEED_FAN: &str = "fan";

pub fn feed_topic(username: &str, feed: &str) -> String {
    format!("{username}/feeds/{feed}")
}

/// The one topic published to and the one topic subscribed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedTopics {
    pub temperature: String,
    pub fan: String,
}

impl FeedTopics {
    pub fn for_user(username: &str) -> Self {
        Self {
            temperature: feed_topic(username, FEED_TEMPERATURE),
            fan: feed_topic(username, FEED_FAN),
        }
    }
}
