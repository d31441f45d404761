use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};
use tracing::{debug, error, info};

use crate::{
    protocol::{decode, hex_list, LastRecordFrame, Notification, StatusFrame},
    types::ControllerConfig,
};

/// Handle returned by a subscription, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type StatusCallback = Arc<dyn Fn(&StatusFrame) + Send + Sync>;
type RecordCallback = Arc<dyn Fn(&LastRecordFrame) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    status: Vec<(SubscriptionId, StatusCallback)>,
    record: Vec<(SubscriptionId, RecordCallback)>,
}

/// Classifies inbound buffers and fans typed frames out to subscribers
///
/// Subscribers run synchronously on the task that delivered the buffer, in
/// registration order. A panicking subscriber is logged and skipped; the
/// remaining subscribers still run.
pub struct NotificationDispatcher {
    subscribers: RwLock<Subscribers>,
    next_id: AtomicU64,
    last_status: RwLock<Option<StatusFrame>>,
    last_record: RwLock<Option<LastRecordFrame>>,
    log_messages_info: bool,
    ignore_bad_packets: bool,
}

impl NotificationDispatcher {
    /// Create a dispatcher with the logging policy of `config`
    #[must_use]
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            subscribers: RwLock::new(Subscribers::default()),
            next_id: AtomicU64::new(1),
            last_status: RwLock::new(None),
            last_record: RwLock::new(None),
            log_messages_info: config.log_messages_info,
            ignore_bad_packets: config.ignore_bad_packets,
        }
    }

    /// Register a callback for current status frames
    pub fn subscribe_status<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&StatusFrame) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .status
            .push((id, Arc::new(callback)));
        id
    }

    /// Register a callback for last-record frames
    pub fn subscribe_record<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&LastRecordFrame) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .record
            .push((id, Arc::new(callback)));
        id
    }

    /// Remove a subscription, returning whether it existed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.status.len() + subscribers.record.len();
        subscribers.status.retain(|(sid, _)| *sid != id);
        subscribers.record.retain(|(sid, _)| *sid != id);
        before != subscribers.status.len() + subscribers.record.len()
    }

    /// Most recent status frame
    pub fn last_status(&self) -> Option<StatusFrame> {
        self.last_status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Most recent last-record frame
    pub fn last_record(&self) -> Option<LastRecordFrame> {
        self.last_record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Handle one inbound buffer
    ///
    /// Returns the decoded notification, or `None` if the buffer was dropped.
    pub fn on_receive(&self, data: &[u8]) -> Option<Notification> {
        let msg_hex = hex_list(data);
        self.log_message(&format!("Msg: {msg_hex}"));

        let notification = match decode(data) {
            Ok(notification) => notification,
            Err(e) => {
                if self.ignore_bad_packets {
                    debug!("Dropping message [{}]: {}", msg_hex, e);
                } else {
                    error!("Dropping message [{}]: {}", msg_hex, e);
                }
                return None;
            }
        };

        match &notification {
            Notification::Status(status) => {
                *self
                    .last_status
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(status.clone());

                let callbacks: Vec<_> = self
                    .subscribers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .status
                    .iter()
                    .map(|(id, cb)| (*id, cb.clone()))
                    .collect();
                for (id, callback) in callbacks {
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(status))) {
                        error!("Status subscriber {:?} panicked: {}", id, panic_message(&*panic));
                    }
                }
                self.log_message(&format!("Status: {status}"));
            }
            Notification::Record(record) => {
                *self
                    .last_record
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(record.clone());

                let callbacks: Vec<_> = self
                    .subscribers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record
                    .iter()
                    .map(|(id, cb)| (*id, cb.clone()))
                    .collect();
                for (id, callback) in callbacks {
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(record))) {
                        error!("Record subscriber {:?} panicked: {}", id, panic_message(&*panic));
                    }
                }
                self.log_message(&format!("Record: {record}"));
            }
        }

        Some(notification)
    }

    fn allocate_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn log_message(&self, text: &str) {
        if self.log_messages_info {
            info!("{}", text);
        } else {
            debug!("{}", text);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::{sync::Mutex, time::SystemTime};

    fn status_bytes(speed: u8, time: u32) -> Bytes {
        StatusFrame {
            dist: 10,
            time,
            steps: 20,
            speed,
            app_speed: 0,
            belt_state: 1,
            manual_mode: 1,
            controller_button: 0,
            raw: Bytes::new(),
            received_at: SystemTime::now(),
        }
        .to_bytes()
    }

    fn quiet_dispatcher() -> NotificationDispatcher {
        NotificationDispatcher::new(&ControllerConfig {
            log_messages_info: false,
            ignore_bad_packets: true,
            ..Default::default()
        })
    }

    #[test]
    fn test_subscribers_run_in_registration_order() {
        let dispatcher = quiet_dispatcher();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let calls = calls.clone();
            dispatcher.subscribe_status(move |_| calls.lock().unwrap().push(name));
        }

        dispatcher.on_receive(&status_bytes(20, 5));
        assert_eq!(*calls.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_panicking_subscriber_does_not_stop_others() {
        let dispatcher = quiet_dispatcher();
        let seen = Arc::new(Mutex::new(0u32));

        dispatcher.subscribe_status(|_| panic!("subscriber failure"));
        {
            let seen = seen.clone();
            dispatcher.subscribe_status(move |status| *seen.lock().unwrap() = status.time);
        }

        let result = dispatcher.on_receive(&status_bytes(20, 42));
        assert!(result.is_some());
        assert_eq!(*seen.lock().unwrap(), 42);
    }

    #[test]
    fn test_decode_failure_invokes_nobody() {
        let dispatcher = quiet_dispatcher();
        let calls = Arc::new(Mutex::new(0));
        {
            let calls = calls.clone();
            dispatcher.subscribe_status(move |_| *calls.lock().unwrap() += 1);
        }
        {
            let calls = calls.clone();
            dispatcher.subscribe_record(move |_| *calls.lock().unwrap() += 1);
        }

        assert!(dispatcher.on_receive(&[0xF8, 0xA9, 0x00]).is_none());
        assert!(dispatcher.on_receive(&status_bytes(10, 1)[..10]).is_none());
        assert_eq!(*calls.lock().unwrap(), 0);
        assert!(dispatcher.last_status().is_none());
    }

    #[test]
    fn test_last_known_state_is_tracked_per_type() {
        let dispatcher = quiet_dispatcher();
        let record_calls = Arc::new(Mutex::new(0));
        {
            let record_calls = record_calls.clone();
            dispatcher.subscribe_record(move |_| *record_calls.lock().unwrap() += 1);
        }

        dispatcher.on_receive(&status_bytes(20, 5));
        dispatcher.on_receive(&status_bytes(25, 6));
        assert_eq!(dispatcher.last_status().unwrap().speed, 25);
        assert!(dispatcher.last_record().is_none());
        assert_eq!(*record_calls.lock().unwrap(), 0);

        let record = LastRecordFrame {
            dist: 1,
            time: 2,
            steps: 3,
            raw: Bytes::new(),
            received_at: SystemTime::now(),
        };
        dispatcher.on_receive(&record.to_bytes());
        assert_eq!(dispatcher.last_record().unwrap().steps, 3);
        assert_eq!(*record_calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let dispatcher = quiet_dispatcher();
        let calls = Arc::new(Mutex::new(0));
        let id = {
            let calls = calls.clone();
            dispatcher.subscribe_status(move |_| *calls.lock().unwrap() += 1)
        };

        dispatcher.on_receive(&status_bytes(20, 5));
        assert!(dispatcher.unsubscribe(id));
        assert!(!dispatcher.unsubscribe(id));
        dispatcher.on_receive(&status_bytes(20, 6));

        assert_eq!(*calls.lock().unwrap(), 1);
    }
}
