use futures::stream::StreamExt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex as StdMutex, PoisonError,
};
use tokio::{
    sync::{watch, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    ble::BleScanner,
    channel::CommandChannel,
    dispatcher::{NotificationDispatcher, SubscriptionId},
    error::{PadError, Result},
    protocol::{Command, LastRecordFrame, StatusFrame},
    transport::{NotificationStream, Transport},
    types::{
        ConnectionParams, ControllerConfig, DeviceInfo, DeviceMode, HistoryMode, Preference,
        SessionState,
    },
};

struct Polling {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Session with a single WalkingPad belt
///
/// `PadController` owns the link to one belt for its whole lifetime. It drives
/// the session through `Disconnected → Connecting → Connected → Subscribed →
/// Active` while connecting and exposes the belt commands once the session is
/// `Active`. Every outbound frame goes through one rate-limited
/// [`CommandChannel`], whether it comes from a user call or from the stats
/// polling task.
///
/// Two background tasks may run next to the caller:
///
/// - **Notification task**: reads the transport's notification stream and
///   hands every buffer to the [`NotificationDispatcher`], which decodes it,
///   updates the last known status/record and calls the subscribers.
/// - **Polling task**: started by [`start_polling`](Self::start_polling),
///   asks for a status frame every poll interval until
///   [`stop_polling`](Self::stop_polling) is called.
///
/// # Examples
///
/// ```no_run
/// use padlers::PadController;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pad = PadController::connect_first().await?;
///
///     pad.subscribe_status(|status| println!("{status}"));
///     pad.start_polling().await?;
///
///     // Manual mode, 3.0 km/h
///     pad.start_belt(true).await?;
///     pad.set_speed(30).await?;
///
///     pad.stop_belt(true).await?;
///     pad.disconnect().await?;
///     Ok(())
/// }
/// ```
pub struct PadController {
    transport: Arc<dyn Transport>,
    channel: Arc<CommandChannel>,
    dispatcher: Arc<NotificationDispatcher>,
    state: Arc<RwLock<SessionState>>,
    config: ControllerConfig,
    device_info: Option<DeviceInfo>,
    notification_task: StdMutex<Option<JoinHandle<()>>>,
    polling: StdMutex<Option<Polling>>,
    link_closed: AtomicBool,
}

impl PadController {
    /// Scan with default parameters and connect to the closest belt
    ///
    /// # Errors
    ///
    /// Returns [`PadError::DeviceNotFound`] if no belt is advertising, or any
    /// connection error from [`connect_first_with_params`](Self::connect_first_with_params).
    pub async fn connect_first() -> Result<Self> {
        Self::connect_first_with_params(ConnectionParams::default(), ControllerConfig::default())
            .await
    }

    /// Scan with custom parameters and connect to the best candidate
    ///
    /// Candidates are filtered by name (or by explicit address) and the one
    /// with the strongest signal wins. Connection failures are not retried.
    ///
    /// # Errors
    ///
    /// Returns [`PadError::DeviceNotFound`] if no candidate was found,
    /// [`PadError::Timeout`] or [`PadError::ConnectionFailed`] if the link
    /// could not be established, and [`PadError::Protocol`] if the belt does
    /// not expose the expected characteristics.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use padlers::{ConnectionParams, ControllerConfig, PadController};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let params = ConnectionParams {
    ///         scan_timeout_ms: 5_000,
    ///         address_filter: Some("5C:".to_string()),
    ///         ..Default::default()
    ///     };
    ///     let config = ControllerConfig {
    ///         poll_interval_ms: 1_000,
    ///         log_messages_info: false,
    ///         ..Default::default()
    ///     };
    ///
    ///     let pad = PadController::connect_first_with_params(params, config).await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn connect_first_with_params(
        params: ConnectionParams,
        config: ControllerConfig,
    ) -> Result<Self> {
        let scanner = BleScanner::new().await?;
        let transport = scanner.connect_first(&params).await?;
        let device_info = transport.device_info().clone();

        let mut controller = Self::connect_with_transport(Arc::new(transport), config).await?;
        controller.device_info = Some(device_info);
        Ok(controller)
    }

    /// Run a session over an already established transport
    ///
    /// Enabling notifications is best-effort: a failure is logged as a
    /// warning and the session still becomes `Active`, with commands working
    /// but no inbound frames.
    ///
    /// # Errors
    ///
    /// Returns [`PadError::ConnectionFailed`] if the transport reports that
    /// its link is down.
    pub async fn connect_with_transport(
        transport: Arc<dyn Transport>,
        config: ControllerConfig,
    ) -> Result<Self> {
        let controller = Self {
            channel: Arc::new(CommandChannel::new(
                transport.clone(),
                config.command_spacing(),
            )),
            dispatcher: Arc::new(NotificationDispatcher::new(&config)),
            transport,
            state: Arc::new(RwLock::new(SessionState::Disconnected)),
            config,
            device_info: None,
            notification_task: StdMutex::new(None),
            polling: StdMutex::new(None),
            link_closed: AtomicBool::new(false),
        };

        controller.set_state(SessionState::Connecting).await;
        if !controller.transport.is_connected().await {
            controller.set_state(SessionState::Disconnected).await;
            controller.link_closed.store(true, Ordering::SeqCst);
            return Err(PadError::ConnectionFailed(
                "transport link is not up".to_string(),
            ));
        }
        controller.set_state(SessionState::Connected).await;

        match controller.transport.notifications().await {
            Ok(stream) => {
                controller.spawn_notification_task(stream);
                controller.set_state(SessionState::Subscribed).await;
            }
            Err(e) => warn!("Notify failed: {}", e),
        }

        controller.set_state(SessionState::Active).await;
        Ok(controller)
    }

    fn spawn_notification_task(&self, mut stream: NotificationStream) {
        let dispatcher = self.dispatcher.clone();
        let task = tokio::spawn(async move {
            while let Some(data) = stream.next().await {
                dispatcher.on_receive(&data);
            }
            debug!("Notification stream closed");
        });
        *self
            .notification_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    async fn set_state(&self, state: SessionState) {
        let mut current = self.state.write().await;
        if *current != state {
            debug!("Session state {} -> {}", *current, state);
            *current = state;
        }
    }

    async fn ensure_active(&self, operation: &str) -> Result<()> {
        let state = *self.state.read().await;
        if state == SessionState::Active {
            Ok(())
        } else {
            Err(PadError::InvalidState {
                operation: operation.to_string(),
                state: state.to_string(),
            })
        }
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.ensure_active(command.name()).await?;
        match self.channel.send_command(command).await {
            Err(e) if e.is_connection_error() && !self.transport.is_connected().await => {
                warn!("Link lost during {}", command.name());
                self.set_state(SessionState::Disconnected).await;
                Err(e)
            }
            other => other,
        }
    }

    /// Current session state
    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Scanned device information, `None` for sessions over a custom transport
    #[must_use]
    pub const fn device_info(&self) -> Option<&DeviceInfo> {
        self.device_info.as_ref()
    }

    /// Controller configuration
    #[must_use]
    pub const fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Dispatcher fed by the notification task
    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.dispatcher
    }

    /// Most recent status frame
    #[must_use]
    pub fn last_status(&self) -> Option<StatusFrame> {
        self.dispatcher.last_status()
    }

    /// Most recent last-record frame
    #[must_use]
    pub fn last_record(&self) -> Option<LastRecordFrame> {
        self.dispatcher.last_record()
    }

    /// Call `callback` for every status frame
    ///
    /// Callbacks run on the notification task and must not block.
    pub fn subscribe_status<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&StatusFrame) + Send + Sync + 'static,
    {
        self.dispatcher.subscribe_status(callback)
    }

    /// Call `callback` for every last-record frame
    pub fn subscribe_record<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&LastRecordFrame) + Send + Sync + 'static,
    {
        self.dispatcher.subscribe_record(callback)
    }

    /// Drop a subscription
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.dispatcher.unsubscribe(id)
    }

    /// Switch between standby, manual and automatic mode
    ///
    /// # Errors
    ///
    /// Returns [`PadError::InvalidState`] outside an active session,
    /// [`PadError::InvalidParameters`] for [`DeviceMode::Unknown`], or a
    /// transport error naming `switch_mode`.
    pub async fn switch_mode(&self, mode: DeviceMode) -> Result<()> {
        info!("Switching to {} mode", mode);
        self.send(Command::SwitchMode(mode)).await
    }

    /// Set the belt speed in units of 0.1 km/h
    ///
    /// # Errors
    ///
    /// Returns [`PadError::InvalidState`] outside an active session or a
    /// transport error naming `set_speed`.
    pub async fn set_speed(&self, speed: u8) -> Result<()> {
        info!("Setting speed to {:.1} km/h", f64::from(speed) / 10.0);
        self.send(Command::SetSpeed(speed)).await
    }

    /// Start the belt
    ///
    /// # Errors
    ///
    /// Returns [`PadError::InvalidState`] outside an active session or a
    /// transport error naming `start`.
    pub async fn start(&self) -> Result<()> {
        self.send(Command::Start).await
    }

    /// Stop the belt, same as a zero speed
    ///
    /// # Errors
    ///
    /// Returns [`PadError::InvalidState`] outside an active session or a
    /// transport error naming `stop`.
    pub async fn stop(&self) -> Result<()> {
        self.send(Command::Stop).await
    }

    /// Ask for a status frame
    ///
    /// # Errors
    ///
    /// Returns [`PadError::InvalidState`] outside an active session or a
    /// transport error naming `query_stats`.
    pub async fn query_stats(&self) -> Result<()> {
        self.send(Command::QueryStats).await
    }

    /// Ask for the summary of a finished bout
    ///
    /// # Errors
    ///
    /// Returns [`PadError::InvalidState`] outside an active session or a
    /// transport error naming `query_history`.
    pub async fn query_history(&self, mode: HistoryMode) -> Result<()> {
        self.send(Command::QueryHistory(mode)).await
    }

    /// Ask for the preference block; the belt beeps and sends a status frame
    ///
    /// # Errors
    ///
    /// Returns [`PadError::InvalidState`] outside an active session or a
    /// transport error naming `query_preference`.
    pub async fn query_preference(&self) -> Result<()> {
        self.send(Command::QueryPreference).await
    }

    /// Write one device preference
    ///
    /// # Errors
    ///
    /// Returns [`PadError::InvalidParameters`] for values the belt does not
    /// accept, [`PadError::InvalidState`] outside an active session, or a
    /// transport error naming `set_preference`.
    pub async fn set_preference(&self, preference: Preference) -> Result<()> {
        info!("Setting preference {:?}", preference);
        self.send(Command::SetPreference(preference)).await
    }

    /// Ask for one of the eight stored profile slots
    ///
    /// # Errors
    ///
    /// Returns [`PadError::InvalidParameters`] for a slot above 7,
    /// [`PadError::InvalidState`] outside an active session, or a transport
    /// error naming `ask_profile_slot`.
    pub async fn ask_profile_slot(&self, slot: usize) -> Result<()> {
        self.send(Command::AskProfileSlot(slot)).await
    }

    /// Switch to manual or automatic mode, let the belt settle, then start it
    ///
    /// # Errors
    ///
    /// Returns the first failing command's error.
    pub async fn start_belt(&self, manual: bool) -> Result<()> {
        let mode = if manual {
            DeviceMode::Manual
        } else {
            DeviceMode::Automatic
        };
        self.switch_mode(mode).await?;
        tokio::time::sleep(self.config.settle_delay()).await;
        self.start().await
    }

    /// Stop the belt, optionally parking it in standby afterwards
    ///
    /// # Errors
    ///
    /// Returns the first failing command's error.
    pub async fn stop_belt(&self, to_standby: bool) -> Result<()> {
        self.stop().await?;
        if to_standby {
            tokio::time::sleep(self.config.settle_delay()).await;
            self.switch_mode(DeviceMode::Standby).await?;
        }
        Ok(())
    }

    /// Start asking for stats every poll interval
    ///
    /// Does nothing if polling already runs. Polling errors are logged and
    /// the loop keeps going until stopped or the session leaves `Active`.
    ///
    /// # Errors
    ///
    /// Returns [`PadError::InvalidState`] outside an active session.
    pub async fn start_polling(&self) -> Result<()> {
        self.ensure_active("start_polling").await?;

        let mut polling = self.polling.lock().unwrap_or_else(PoisonError::into_inner);
        if polling.as_ref().is_some_and(|p| !p.task.is_finished()) {
            debug!("Stats polling already running");
            return Ok(());
        }

        let (stop, stopped) = watch::channel(false);
        let task = tokio::spawn(poll_stats(
            self.channel.clone(),
            self.state.clone(),
            self.config.poll_interval(),
            stopped,
        ));
        *polling = Some(Polling { stop, task });
        drop(polling);

        info!("Starting stats fetching");
        Ok(())
    }

    /// Stop the polling task and wait for it to finish
    pub async fn stop_polling(&self) {
        let polling = self
            .polling
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(polling) = polling {
            let _ = polling.stop.send(true);
            if let Err(e) = polling.task.await {
                warn!("Stats polling task ended abnormally: {}", e);
            }
            info!("Stats fetching stopped");
        }
    }

    /// Whether the polling task is running
    #[must_use]
    pub fn is_polling(&self) -> bool {
        self.polling
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|p| !p.task.is_finished())
    }

    /// End the session and close the link
    ///
    /// Stops polling and the notification task, also after the session has
    /// already dropped to `Disconnected` because the link was lost. The
    /// transport is closed once; later calls only release tasks.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if closing the link fails; the session
    /// is `Disconnected` either way.
    pub async fn disconnect(&self) -> Result<()> {
        self.stop_polling().await;
        if let Some(task) = self
            .notification_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }

        self.set_state(SessionState::Disconnected).await;
        if self.link_closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Disconnecting from device");
        self.transport.disconnect().await
    }
}

async fn poll_stats(
    channel: Arc<CommandChannel>,
    state: Arc<RwLock<SessionState>>,
    interval: std::time::Duration,
    mut stopped: watch::Receiver<bool>,
) {
    loop {
        if *stopped.borrow() || *state.read().await != SessionState::Active {
            break;
        }

        if let Err(e) = channel.send_command(Command::QueryStats).await {
            info!("Error in ask stats: {}", e);
        }

        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            changed = stopped.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Stats polling loop finished");
}

impl Drop for PadController {
    fn drop(&mut self) {
        if let Some(polling) = self
            .polling
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = polling.stop.send(true);
            polling.task.abort();
        }
        if let Some(task) = self
            .notification_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }

        if !self.link_closed.swap(true, Ordering::SeqCst) {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let transport = self.transport.clone();
                runtime.spawn(async move {
                    let _ = transport.disconnect().await;
                });
            }
        }
    }
}
