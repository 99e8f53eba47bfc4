//! Local message buffer flushed in batches.

use super::dispatch::DispatchOptions;
use super::Producer;
use crate::error::ProducerError;
use crate::instrumentation::events;
use crate::transport::{DeliveryHandle, DeliveryReport, Message};
use serde_json::json;

impl Producer {
    /// Adds a message to the local buffer without sending it.
    pub fn buffer(&self, message: Message) -> Result<(), ProducerError> {
        self.prepare(std::slice::from_ref(&message))?;
        let buffered = {
            let mut buffer = self.lock_buffer();
            buffer.push(message);
            buffer.len()
        };
        self.instrument(events::MESSAGE_BUFFERED, json!({ "buffer_size": buffered }));
        Ok(())
    }

    /// Adds several messages to the local buffer. All or nothing.
    pub fn buffer_many(&self, messages: Vec<Message>) -> Result<(), ProducerError> {
        self.prepare(&messages)?;
        let added = messages.len();
        let buffered = {
            let mut buffer = self.lock_buffer();
            buffer.extend(messages);
            buffer.len()
        };
        self.instrument(
            events::MESSAGES_BUFFERED,
            json!({ "messages": added, "buffer_size": buffered }),
        );
        Ok(())
    }

    /// Sends the buffer and waits for every delivery report.
    pub fn flush_sync(&self) -> Result<Vec<DeliveryReport>, ProducerError> {
        let messages = self.take_buffer();
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let reports = self.dispatch_many_sync(&messages, &DispatchOptions::default())?;
        self.instrument(events::BUFFER_FLUSHED_SYNC, json!({ "messages": messages.len() }));
        Ok(reports)
    }

    /// Sends the buffer without waiting for delivery.
    pub fn flush_async(&self) -> Result<Vec<DeliveryHandle>, ProducerError> {
        let messages = self.take_buffer();
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let handles = self.dispatch_many_async(&messages, &DispatchOptions::default())?;
        self.instrument(events::BUFFER_FLUSHED_ASYNC, json!({ "messages": messages.len() }));
        Ok(handles)
    }

    /// Drops the local buffer and everything the transport has not delivered yet.
    ///
    /// Purged in-flight messages resolve with a purge error.
    pub fn purge(&self) -> Result<(), ProducerError> {
        let dropped = self.take_buffer().len();
        if let Some(client) = self.current_client() {
            client.purge()?;
        }
        self.instrument(events::BUFFER_PURGED, json!({ "messages": dropped }));
        Ok(())
    }

    fn take_buffer(&self) -> Vec<Message> {
        std::mem::take(&mut *self.lock_buffer())
    }
}
