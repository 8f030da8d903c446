//! Event-bus bridge.
//!
//! Worker subscriptions are proxied onto the daemon event bus: each
//! registered name gets one listener whose events are serialized to JSON
//! and forwarded over the channel. Worker-published events travel the
//! other way under a well-known content field.

use std::sync::Arc;

use petrel_proto::{
    codec::decode_payload, msgflags, Command, EventbusPublishEvent, EventbusRegisterListener,
};
use tracing::{error, warn};

use crate::endpoint::ExternalEndpoint;
use crate::error::EndpointError;
use crate::traits::{BusEvent, EventListener, EVENT_JSON_FIELD};

impl ExternalEndpoint {
    pub(crate) async fn handle_eventbus_register(&self, content: &[u8]) {
        let reg: EventbusRegisterListener = match decode_payload(content) {
            Ok(r) => r,
            Err(_) => {
                self.inner().bus.publish(
                    "External interface got an unparseable EVENTBUSREGISTER",
                    msgflags::ERROR,
                );
                self.trigger_error(
                    &EndpointError::UnparseablePayload("EVENTBUSREGISTER".to_owned()).to_string(),
                )
                .await;
                return;
            }
        };

        let mut st = self.inner().state.lock().await;

        for name in &reg.event {
            // A repeated registration replaces the prior listener.
            if let Some(prior) = st.eventbus_listeners.remove(name) {
                self.inner().eventbus.remove_listener(prior);
            }

            let endpoint = self.clone();
            let listener: EventListener = Arc::new(move |event: &BusEvent| {
                let endpoint = endpoint.clone();
                let event = event.clone();
                tokio::spawn(async move {
                    endpoint.proxy_event(&event).await;
                });
            });

            let listener_id = self.inner().eventbus.register_listener(name, listener);
            st.eventbus_listeners.insert(name.clone(), listener_id);
        }
    }

    pub(crate) async fn handle_eventbus_publish(&self, content: &[u8]) {
        let publish: EventbusPublishEvent = match decode_payload(content) {
            Ok(p) => p,
            Err(_) => {
                self.inner().bus.publish(
                    "External interface got unparseable EVENTBUSPUBLISH",
                    msgflags::ERROR,
                );
                self.trigger_error(
                    &EndpointError::UnparseablePayload("EVENTBUSPUBLISH".to_owned()).to_string(),
                )
                .await;
                return;
            }
        };

        let mut event = self.inner().eventbus.event(&publish.event_type);
        event.content.insert(
            EVENT_JSON_FIELD.to_owned(),
            serde_json::Value::String(publish.event_content_json),
        );
        self.inner().eventbus.publish(event);
    }

    /// Serializes a subscribed event and forwards it to the worker.
    pub async fn proxy_event(&self, event: &BusEvent) {
        let event_json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, event_type = %event.event_type, "Could not serialize event");
                return;
            }
        };

        match Command::event(event_json) {
            Ok(c) => {
                self.send_command(c).await;
            }
            Err(e) => {
                error!(error = %e, "Failed to build EVENT");
            }
        }
    }
}
