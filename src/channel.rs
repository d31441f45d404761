use std::{sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};
use tracing::debug;

use crate::{
    error::{PadError, Result},
    protocol::{hex_list, Command},
    transport::Transport,
};

/// Single serialization point for every outbound frame
///
/// The belt firmware drops or garbles replies when frames arrive closer
/// together than roughly 0.69 s. `send` waits out the remainder of the
/// spacing, then writes and records the new send instant. The lock on the
/// last-send instant is held across the write, so callers from the polling
/// task and from user commands are serialized.
pub struct CommandChannel {
    transport: Arc<dyn Transport>,
    min_spacing: Duration,
    last_sent: Mutex<Option<Instant>>,
}

impl CommandChannel {
    /// Create a channel over `transport` enforcing `min_spacing`
    pub fn new(transport: Arc<dyn Transport>, min_spacing: Duration) -> Self {
        Self {
            transport,
            min_spacing,
            last_sent: Mutex::new(None),
        }
    }

    /// Configured minimum spacing
    #[must_use]
    pub const fn min_spacing(&self) -> Duration {
        self.min_spacing
    }

    /// Send a raw frame, delaying the caller if needed
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the write fails.
    pub async fn send(&self, frame: &[u8]) -> Result<()> {
        let mut last_sent = self.last_sent.lock().await;

        if let Some(previous) = *last_sent {
            let elapsed = previous.elapsed();
            if elapsed < self.min_spacing {
                let wait = self.min_spacing - elapsed;
                debug!("Delaying command by {}ms", wait.as_millis());
                tokio::time::sleep(wait).await;
            }
        }

        *last_sent = Some(Instant::now());
        debug!("Sending command: {}", hex_list(frame));
        self.transport.write(frame).await
    }

    /// Encode and send a command
    ///
    /// # Errors
    ///
    /// Returns [`PadError::InvalidParameters`] if the command cannot be encoded,
    /// or a [`PadError::Transport`] naming the command if the write fails.
    pub async fn send_command(&self, command: Command) -> Result<()> {
        let frame = command.encode()?;
        self.send(&frame).await.map_err(|e| match e {
            PadError::Transport { reason, .. } => PadError::transport(command.name(), reason),
            PadError::Ble(err) => PadError::transport(command.name(), err),
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    const SPACING: Duration = Duration::from_millis(690);

    #[tokio::test(start_paused = true)]
    async fn test_first_send_is_immediate() {
        let transport = MockTransport::new();
        let channel = CommandChannel::new(Arc::new(transport.clone()), SPACING);

        let start = Instant::now();
        channel.send_command(Command::QueryStats).await.unwrap();
        assert_eq!(transport.written_at()[0].0, start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_are_spaced() {
        let transport = MockTransport::new();
        let channel = CommandChannel::new(Arc::new(transport.clone()), SPACING);

        for _ in 0..3 {
            channel.send_command(Command::QueryStats).await.unwrap();
        }

        let writes = transport.written_at();
        assert_eq!(writes.len(), 3);
        for pair in writes.windows(2) {
            assert!(pair[1].0 - pair[0].0 >= SPACING);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_send_waits_for_spacing() {
        let transport = MockTransport::new();
        let channel = CommandChannel::new(Arc::new(transport.clone()), SPACING);
        tokio_test::assert_ok!(channel.send_command(Command::QueryStats).await);

        let mut send = tokio_test::task::spawn(channel.send_command(Command::Start));
        tokio_test::assert_pending!(send.poll());
        assert_eq!(transport.written().len(), 1);

        tokio::time::advance(SPACING).await;
        tokio_test::assert_ready_ok!(send.poll());
        assert_eq!(transport.written().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_delay_after_idle_period() {
        let transport = MockTransport::new();
        let channel = CommandChannel::new(Arc::new(transport.clone()), SPACING);

        channel.send_command(Command::QueryStats).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        let before = Instant::now();
        channel.send_command(Command::QueryStats).await.unwrap();

        assert_eq!(transport.written_at()[1].0, before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_senders_are_serialized() {
        let transport = MockTransport::new();
        let channel = Arc::new(CommandChannel::new(Arc::new(transport.clone()), SPACING));

        let a = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.send_command(Command::QueryStats).await })
        };
        let b = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.send_command(Command::SetSpeed(20)).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let writes = transport.written_at();
        assert_eq!(writes.len(), 2);
        assert!(writes[1].0 - writes[0].0 >= SPACING);
    }

    #[tokio::test]
    async fn test_write_failure_names_command() {
        let transport = MockTransport::new();
        transport.set_fail_writes(true);
        let channel = CommandChannel::new(Arc::new(transport), SPACING);

        let err = channel.send_command(Command::SetSpeed(30)).await.unwrap_err();
        assert!(err.to_string().contains("set_speed"));
    }
}
