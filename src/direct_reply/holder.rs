use std::fmt;
use std::time::Instant;

/// An opaque handle to a broker channel, minted by a [`ChannelSource`].
///
/// It is stable for as long as the channel stays open.
///
/// [`ChannelSource`]: super::ChannelSource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

/// The broker-assigned identifier of one consumer registration on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerTag(String);

impl ConsumerTag {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ConsumerTag {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ConsumerTag {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for ConsumerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One borrow generation of a reply channel.
///
/// Every successful [`borrow`](super::ConsumerRegistry::borrow) mints a new `Holder`, even
/// when it hands out a channel that was borrowed before. A `Holder` is never mutated after it
/// has been issued: once its channel is borrowed again, the old value is stale and releasing
/// it has no effect.
///
/// Two holders are equal only if every field matches - the channel identity alone is not
/// enough to release a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Holder {
    channel: ChannelId,
    consumer_tag: ConsumerTag,
    generation: u64,
    created_at: Instant,
    last_activity: Instant,
}

impl Holder {
    pub(super) fn new(channel: ChannelId, consumer_tag: ConsumerTag, generation: u64) -> Self {
        let now = Instant::now();
        Self {
            channel,
            consumer_tag,
            generation,
            created_at: now,
            last_activity: now,
        }
    }

    /// The channel this borrow is bound to.
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// The reply consumer armed on the channel for this borrow.
    pub fn consumer_tag(&self) -> &ConsumerTag {
        &self.consumer_tag
    }

    /// Monotonic borrow counter, unique per registry.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }
}
