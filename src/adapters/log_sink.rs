//! Log-based telemetry sink.
//!
//! Subscribes to a set of bus topics and writes one line per event to the
//! ESP-IDF logger (UART / USB-CDC in production).  A network uploader
//! would subscribe to the same topics and render them differently.

use std::sync::Arc;

use log::info;

use crate::app::events::{Event, Payload, topics};
use crate::error::BusError;
use crate::events::{EventBus, SubscriptionId};

/// Topics worth a console line on a running device.
pub const DEFAULT_TOPICS: [&str; 14] = [
    topics::SENSOR_TEMPERATURE,
    topics::SENSOR_HUMIDITY,
    topics::SENSOR_PRESSURE,
    topics::SENSOR_ERROR,
    topics::ACTUATOR_ACTIVATED,
    topics::ACTUATOR_DEACTIVATED,
    topics::ACTUATOR_ERROR,
    topics::NOZZLE_AIR_OPEN,
    topics::NOZZLE_AIR_CLOSE,
    topics::SYSTEM_ERROR,
    topics::SYSTEM_SAFETY,
    topics::SYSTEM_EMERGENCY,
    topics::SYSTEM_METRICS,
    topics::COMMAND_STATUS,
];

pub struct LogSink {
    bus: Arc<EventBus>,
    subscriptions: Vec<SubscriptionId>,
}

impl LogSink {
    pub fn attach(bus: Arc<EventBus>, topic_list: &[&str]) -> Result<Self, BusError> {
        let mut subscriptions = Vec::with_capacity(topic_list.len());
        for topic in topic_list {
            match bus.subscribe(topic, |ev: &Event| info!("{}", render(ev))) {
                Ok(id) => subscriptions.push(id),
                Err(e) => {
                    for id in subscriptions {
                        let _ = bus.unsubscribe(id);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self { bus, subscriptions })
    }

    pub fn topic_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn detach(&mut self) {
        for id in self.subscriptions.drain(..) {
            let _ = self.bus.unsubscribe(id);
        }
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        self.detach();
    }
}

/// One console line for `ev`.
pub fn render(ev: &Event) -> String {
    let body = match ev.payload() {
        Payload::Empty => String::new(),
        Payload::Reading {
            sensor,
            value,
            unit,
            ..
        } => format!("{sensor}={value:.2}{unit}"),
        Payload::ActuatorState {
            name,
            active,
            duration_ms,
            level,
        } => {
            let mut s = format!("{name} {}", if *active { "ON" } else { "OFF" });
            if let Some(l) = level {
                s.push_str(&format!(" level={l:.0}%"));
            }
            if let Some(d) = duration_ms {
                s.push_str(&format!(" after {d}ms"));
            }
            s
        }
        Payload::ActuatorCommand { name, state } => format!("{name} -> {state:?}"),
        Payload::Spray { nozzle } => format!("nozzle={}", nozzle.as_deref().unwrap_or("all")),
        Payload::Nozzle { name, phase } => format!("{name} phase={phase}"),
        Payload::Command(c) => format!("[{}] {}.{} from {}", c.id, c.kind, c.action, c.source),
        Payload::Status(s) => format!(
            "[{}] {} {}",
            s.command_id,
            s.status,
            s.message.as_deref().unwrap_or("")
        ),
        Payload::Metrics(m) => format!(
            "up={}s heap={}/{} rssi={} published={} dropped={}",
            m.uptime_secs,
            m.free_heap,
            m.min_free_heap,
            m.wifi_rssi.map_or_else(|| "-".to_owned(), |r| r.to_string()),
            m.events_published,
            m.events_dropped
        ),
        Payload::Alarm {
            source,
            message,
            value,
            limit,
        } => match (value, limit) {
            (Some(v), Some(l)) => format!("{source}: {message} ({v:.1} vs {l:.1})"),
            _ => format!("{source}: {message}"),
        },
        Payload::Error { component, message } => format!("{component}: {message}"),
        Payload::Emergency { reason } => format!("EMERGENCY {reason}"),
        Payload::Config { section } => format!("section={section}"),
    };
    format!("{:<22} | {:<16} | {body}", ev.topic(), ev.source())
        .trim_end()
        .to_owned()
}
