use std::time::Duration;

#[derive(Clone, Debug)]
#[allow(missing_copy_implementations)]
/// Settings for a [`CommunicationSession`](crate::CommunicationSession) and its transport
pub struct BridgeSettings {
    /// Maximum packet size in bytes. Larger frames are refused by the transport
    ///
    /// ## Default
    /// The default is set to 10MiB
    pub max_packet_length: usize,
    /// Capacity of the outbound channel, in messages (default: 500)
    ///
    /// Once the channel is full the emission drain blocks until the
    /// transport catches up. Nothing is dropped.
    pub channel_capacity: usize,
    /// Warn when channel depth exceeds this percentage (default: 80)
    pub channel_warning_threshold: u8,
    /// How long [`close`](crate::CommunicationSession::close) waits for pending
    /// output before aborting in-flight writes (default: 5s)
    pub close_timeout: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            max_packet_length: 10 * 1024 * 1024,
            channel_capacity: 500,
            channel_warning_threshold: 80,
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl BridgeSettings {
    /// Same settings with a different outbound channel capacity.
    pub fn with_channel_capacity(mut self, channel_capacity: usize) -> Self {
        self.channel_capacity = channel_capacity.max(1);
        self
    }

    /// Same settings with a different close timeout.
    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }
}
