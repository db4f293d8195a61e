use std::convert::TryFrom;
use std::time::Duration;

#[derive(Clone, Default)]
pub struct WorkerOptions {
    /// How often each claimed partition checks for a second consumer on its queue.
    pub consumer_check_interval: Option<Duration>,
    pub table_publish_interval: Option<Duration>,
    /// Periodically broadcast this node's ownership to every peer. On by default.
    pub table_sync_enabled: Option<bool>,
    /// Wait between broker connection attempts at startup.
    pub reconnect_delay: Option<Duration>,
    /// How often shutdown rechecks for unacknowledged work.
    pub drain_poll_interval: Option<Duration>,
    pub event_queue_size: Option<usize>,
}

pub(super) struct WorkerOptionsValidated {
    pub consumer_check_interval: Duration,
    // None when table sync is off.
    pub table_publish_interval: Option<Duration>,
    pub reconnect_delay: Duration,
    pub drain_poll_interval: Duration,
    pub event_queue_size: usize,
}

impl WorkerOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.consumer_check_interval == Duration::from_secs(0) {
            return Err("Consumer check interval must be greater than zero");
        }
        if self.table_publish_interval == Some(Duration::from_secs(0)) {
            return Err("Table publish interval must be greater than zero");
        }
        if self.reconnect_delay == Duration::from_secs(0) {
            return Err("Reconnect delay must be greater than zero");
        }
        if self.drain_poll_interval == Duration::from_secs(0) {
            return Err("Drain poll interval must be greater than zero");
        }
        if self.event_queue_size == 0 {
            return Err("Event queue size must be greater than zero");
        }

        Ok(())
    }
}

impl TryFrom<WorkerOptions> for WorkerOptionsValidated {
    type Error = &'static str;

    fn try_from(options: WorkerOptions) -> Result<Self, Self::Error> {
        let table_publish_interval = options.table_publish_interval.unwrap_or(Duration::from_secs(10));
        let values = WorkerOptionsValidated {
            consumer_check_interval: options.consumer_check_interval.unwrap_or(Duration::from_secs(30)),
            table_publish_interval: if options.table_sync_enabled.unwrap_or(true) {
                Some(table_publish_interval)
            } else {
                None
            },
            reconnect_delay: options.reconnect_delay.unwrap_or(Duration::from_secs(5)),
            drain_poll_interval: options.drain_poll_interval.unwrap_or(Duration::from_secs(1)),
            event_queue_size: options.event_queue_size.unwrap_or(64),
        };

        values.validate()?;
        Ok(values)
    }
}
